//! Offline fallback: when the server has been unreachable for too long, water
//! for a fixed duration and then stand by for a long fixed period.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::actuator::{AckOutcome, Actuator};
use crate::clock::Clock;
use crate::engine::{FaultState, Stage};
use crate::gpio::Gpio;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FallbackSettings {
    pub(crate) watering: Duration,
    pub(crate) standby: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OfflineReport {
    pub(crate) open: AckOutcome,
    pub(crate) close: AckOutcome,
}

/// Open, wait, close, stand by. Acknowledgment timeouts raise the fault flag
/// but nothing is sent anywhere.
pub(crate) async fn run_offline_cycle<G: Gpio, C: Clock>(
    actuator: &mut Actuator<G, C>,
    clock: &C,
    settings: &FallbackSettings,
    faults: &mut FaultState,
) -> Result<OfflineReport> {
    info!(
        watering_ms = settings.watering.as_millis() as u64,
        standby_ms = settings.standby.as_millis() as u64,
        "offline fallback cycle"
    );

    let open = actuator.actuate(Stage::Open.expected_level()).await?;
    if !open.is_confirmed() {
        faults.raise(Stage::Open);
    }
    clock.sleep(settings.watering).await;

    let close = actuator.actuate(Stage::Close.expected_level()).await?;
    if !close.is_confirmed() {
        faults.raise(Stage::Close);
        warn!("valve may still be open; standing by regardless");
    }

    clock.sleep(settings.standby).await;
    Ok(OfflineReport { open, close })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{AckSettings, Pins, CLOSED_LEVEL, OPEN_LEVEL};
    use crate::gpio::Level;
    use crate::testing::{Entry, Journal, MockGpio, RecordingClock};

    const VALVE: u8 = 5;

    fn settings() -> FallbackSettings {
        FallbackSettings {
            watering: Duration::from_secs(300),
            standby: Duration::from_secs(86_400),
        }
    }

    fn actuator(gpio: MockGpio, clock: RecordingClock) -> Actuator<MockGpio, RecordingClock> {
        Actuator::new(
            gpio,
            clock,
            Pins {
                valve: VALVE,
                sensor: 14,
                active_low: false,
            },
            AckSettings {
                max_wait: Duration::from_millis(1_000),
                poll_interval: Duration::from_millis(10),
                settle: None,
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn waters_then_stands_by() {
        let journal = Journal::default();
        let clock = RecordingClock::new(journal.clone());
        let (gpio, log) = MockGpio::with_journal(CLOSED_LEVEL, journal.clone());
        log.script(&[OPEN_LEVEL]);
        let mut a = actuator(gpio, clock.clone());
        let mut faults = FaultState::default();

        let start = tokio::time::Instant::now();
        let report = run_offline_cycle(&mut a, &clock, &settings(), &mut faults)
            .await
            .unwrap();

        assert_eq!(
            report,
            OfflineReport {
                open: AckOutcome::Confirmed,
                close: AckOutcome::Confirmed,
            }
        );
        assert_eq!(
            log.writes(VALVE),
            vec![Level::Low, Level::High, Level::Low, Level::High, Level::Low]
        );
        assert_eq!(start.elapsed(), Duration::from_secs(300 + 86_400));
        assert!(!faults.is_active());
        assert_eq!(
            journal.count(|e| matches!(e, Entry::Fetch(_) | Entry::Post(_) | Entry::NoAck(_))),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_flags_fault_without_notifying() {
        let journal = Journal::default();
        let clock = RecordingClock::new(journal.clone());
        // Sensor never leaves the closed position.
        let (gpio, _log) = MockGpio::with_journal(CLOSED_LEVEL, journal.clone());
        let mut a = actuator(gpio, clock.clone());
        let mut faults = FaultState::default();

        let report = run_offline_cycle(&mut a, &clock, &settings(), &mut faults)
            .await
            .unwrap();

        assert_eq!(report.open, AckOutcome::TimedOut);
        assert_eq!(report.close, AckOutcome::Confirmed);
        assert_eq!(faults.last(), Some(Stage::Open));
        assert_eq!(journal.count(|e| matches!(e, Entry::NoAck(_))), 0);
        assert!(!a.is_energized());
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_aborts_with_valve_off() {
        let journal = Journal::default();
        let clock = RecordingClock::new(journal.clone());
        let (gpio, _log) = MockGpio::with_journal(CLOSED_LEVEL, journal.clone());
        gpio.fail_reads();
        let mut a = actuator(gpio, clock.clone());

        let result =
            run_offline_cycle(&mut a, &clock, &settings(), &mut FaultState::default()).await;

        assert!(result.is_err());
        assert!(!a.is_energized());
    }
}
