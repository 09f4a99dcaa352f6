//! Watering cycle engine: fetch a schedule, decide, actuate, report.
//!
//! ## Cycle
//!
//! ```text
//! AwaitingSchedule ──[fetch + parse]──▶ Deciding
//!        ▲                                 │
//!        │           ┌─────────────────────┼──────────────────────┐
//!        │           ▼                     ▼                      ▼
//!        │    SleepAndRecheck        DeferredWait ──────▶  ImmediateWater
//!        │           │                                  (open, post, wait,
//!        │           │                                   close, post)
//!        │           │                                         │
//!        └───────────┴────────────── Reporting ◀───────────────┘
//! ```
//!
//! Watering is "imminent" when `time_until_watering < sleep_interval +
//! reporting_margin`; otherwise the engine sleeps and polls again. The margin
//! keeps a poll that lands just before the window from sleeping past it.

use anyhow::Result;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::actuator::{AckOutcome, Actuator, CLOSED_LEVEL, OPEN_LEVEL};
use crate::clock::Clock;
use crate::fallback::{self, FallbackSettings, OfflineReport};
use crate::gpio::{Gpio, Level};
use crate::network::Network;
use crate::schedule::{self, ParseError, Schedule};
use crate::supervisor::Connectivity;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Water now.
    Immediate,
    /// Water after waiting out the remaining time.
    Deferred { wait: Duration },
    /// Not imminent: sleep, then fetch a fresh schedule.
    SleepAndRecheck { interval: Duration },
}

pub(crate) fn decide(s: &Schedule, reporting_margin: Duration) -> Decision {
    let horizon = s.sleep_interval.saturating_add(reporting_margin);
    if s.time_until_watering >= horizon {
        Decision::SleepAndRecheck {
            interval: s.sleep_interval,
        }
    } else if s.time_until_watering.is_zero() {
        Decision::Immediate
    } else {
        Decision::Deferred {
            wait: s.time_until_watering,
        }
    }
}

// ---------------------------------------------------------------------------
// States, faults, reports, errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleState {
    AwaitingSchedule,
    Deciding,
    ImmediateWater,
    DeferredWait,
    SleepAndRecheck,
    Reporting,
}

/// Which actuation failed to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Open,
    Close,
    Home,
}

impl Stage {
    /// Sensor level that confirms this stage.
    pub(crate) fn expected_level(self) -> Level {
        match self {
            Self::Open => OPEN_LEVEL,
            Self::Close | Self::Home => CLOSED_LEVEL,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Home => write!(f, "home"),
        }
    }
}

/// Device-level fault flag. Latched until the device restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FaultState {
    count: u32,
    last: Option<Stage>,
}

impl FaultState {
    pub(crate) fn raise(&mut self, stage: Stage) {
        self.count += 1;
        self.last = Some(stage);
        error!(
            %stage,
            expected = %stage.expected_level(),
            faults = self.count,
            "valve fault: no sensor acknowledgment"
        );
    }

    pub(crate) fn is_active(&self) -> bool {
        self.count > 0
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn last(&self) -> Option<Stage> {
        self.last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WateringReport {
    pub(crate) pre_wait: Duration,
    pub(crate) open: AckOutcome,
    pub(crate) close: AckOutcome,
    pub(crate) start_reported: bool,
    pub(crate) stop_reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleReport {
    Slept { interval: Duration },
    Watered(WateringReport),
}

/// Why a cycle ended without acting on a schedule. No valve movement
/// happens on any of these except `Hardware`, which can interrupt one.
#[derive(Debug)]
pub(crate) enum CycleError {
    Connectivity(anyhow::Error),
    Transport(anyhow::Error),
    Parse(ParseError),
    Hardware(anyhow::Error),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connectivity(e) => write!(f, "link unavailable: {e:#}"),
            Self::Transport(e) => write!(f, "schedule fetch failed: {e:#}"),
            Self::Parse(e) => write!(f, "{e}"),
            Self::Hardware(e) => write!(f, "hardware error: {e:#}"),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Connectivity(e) | Self::Transport(e) | Self::Hardware(e) => Some(&**e),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineSettings {
    pub(crate) schedule_url: String,
    pub(crate) status_url: String,
    pub(crate) no_ack_url: String,
    pub(crate) reporting_margin: Duration,
    pub(crate) parse_retry_delay: Duration,
    /// Drop the link during long waits.
    pub(crate) power_save: bool,
    /// Extra standby after a cycle that raised a fault.
    pub(crate) fault_standby: Option<Duration>,
}

pub(crate) struct WateringEngine<N, K, G, C> {
    network: N,
    link: K,
    actuator: Actuator<G, C>,
    clock: C,
    settings: EngineSettings,
    fallback: FallbackSettings,
    state: CycleState,
    faults: FaultState,
}

impl<N, K, G, C> WateringEngine<N, K, G, C>
where
    N: Network,
    K: Connectivity,
    G: Gpio,
    C: Clock,
{
    pub(crate) fn new(
        network: N,
        link: K,
        actuator: Actuator<G, C>,
        clock: C,
        settings: EngineSettings,
        fallback: FallbackSettings,
    ) -> Self {
        Self {
            network,
            link,
            actuator,
            clock,
            settings,
            fallback,
            state: CycleState::AwaitingSchedule,
            faults: FaultState::default(),
        }
    }

    pub(crate) fn state(&self) -> CycleState {
        self.state
    }

    pub(crate) fn faults(&self) -> &FaultState {
        &self.faults
    }

    /// One fetch → parse → decide → act → report pass. Never moves the valve
    /// when the schedule could not be obtained.
    pub(crate) async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.enter(CycleState::AwaitingSchedule);

        self.link
            .ensure_connected()
            .await
            .map_err(CycleError::Connectivity)?;
        let raw = self
            .network
            .fetch(&self.settings.schedule_url)
            .await
            .map_err(CycleError::Transport)?;

        let schedule = match schedule::parse(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    retry_in_ms = self.settings.parse_retry_delay.as_millis() as u64,
                    "schedule rejected: {e}"
                );
                self.clock.sleep(self.settings.parse_retry_delay).await;
                return Err(CycleError::Parse(e));
            }
        };

        self.enter(CycleState::Deciding);
        let decision = decide(&schedule, self.settings.reporting_margin);
        info!(
            time_until_watering_ms = schedule.time_until_watering.as_millis() as u64,
            watering_ms = schedule.watering_duration.as_millis() as u64,
            sleep_ms = schedule.sleep_interval.as_millis() as u64,
            ?decision,
            "schedule received"
        );

        let report = match decision {
            Decision::SleepAndRecheck { interval } => {
                self.enter(CycleState::SleepAndRecheck);
                self.idle(interval).await;
                CycleReport::Slept { interval }
            }
            Decision::Deferred { wait } => {
                self.enter(CycleState::DeferredWait);
                self.idle(wait).await;
                CycleReport::Watered(self.water(wait, schedule.watering_duration).await?)
            }
            Decision::Immediate => {
                CycleReport::Watered(self.water(Duration::ZERO, schedule.watering_duration).await?)
            }
        };

        self.enter(CycleState::AwaitingSchedule);
        Ok(report)
    }

    /// Fixed-duration watering plus long standby, without any network use.
    pub(crate) async fn run_offline_fallback_cycle(&mut self) -> Result<OfflineReport> {
        self.link.disconnect();
        fallback::run_offline_cycle(
            &mut self.actuator,
            &self.clock,
            &self.fallback,
            &mut self.faults,
        )
        .await
    }

    /// Drive the valve to its closed end stop before the first cycle.
    pub(crate) async fn home(&mut self) -> Result<()> {
        if let Some(AckOutcome::TimedOut) = self.actuator.home().await? {
            self.no_ack(Stage::Home).await;
        }
        Ok(())
    }

    async fn water(
        &mut self,
        pre_wait: Duration,
        duration: Duration,
    ) -> Result<WateringReport, CycleError> {
        self.enter(CycleState::ImmediateWater);
        let open = self.pulse(Stage::Open).await?;
        self.enter(CycleState::Reporting);
        let start_reported = self.report_status(true).await;

        self.enter(CycleState::ImmediateWater);
        info!(duration_ms = duration.as_millis() as u64, "watering");
        self.idle(duration).await;

        let close = self.pulse(Stage::Close).await?;
        self.enter(CycleState::Reporting);
        let stop_reported = self.report_status(false).await;

        let faulted = !open.is_confirmed() || !close.is_confirmed();
        if let (true, Some(standby)) = (faulted, self.settings.fault_standby) {
            warn!(standby_ms = standby.as_millis() as u64, "fault standby");
            self.idle(standby).await;
        }

        Ok(WateringReport {
            pre_wait,
            open,
            close,
            start_reported,
            stop_reported,
        })
    }

    /// One actuation; a timeout raises the fault flag and notifies the server.
    async fn pulse(&mut self, stage: Stage) -> Result<AckOutcome, CycleError> {
        let outcome = self
            .actuator
            .actuate(stage.expected_level())
            .await
            .map_err(CycleError::Hardware)?;
        if outcome == AckOutcome::TimedOut {
            self.no_ack(stage).await;
        }
        Ok(outcome)
    }

    async fn no_ack(&mut self, stage: Stage) {
        self.faults.raise(stage);
        if let Err(e) = self.link.ensure_connected().await {
            warn!(%stage, "no-ack notification skipped: {e:#}");
            return;
        }
        if let Err(e) = self.network.notify_no_ack(&self.settings.no_ack_url).await {
            warn!(%stage, "no-ack notification failed: {e:#}");
        }
    }

    /// Post watering status once. Failures are logged; the next cycle is the
    /// retry.
    async fn report_status(&mut self, is_watering: bool) -> bool {
        if let Err(e) = self.link.ensure_connected().await {
            warn!(is_watering, "status not sent: {e:#}");
            return false;
        }
        match self
            .network
            .post_status(&self.settings.status_url, is_watering)
            .await
        {
            Ok(()) => {
                info!(is_watering, "watering status sent");
                true
            }
            Err(e) => {
                warn!(is_watering, "status post failed: {e:#}");
                false
            }
        }
    }

    async fn idle(&mut self, duration: Duration) {
        if self.settings.power_save && self.link.is_connected() {
            self.link.disconnect();
        }
        debug!(ms = duration.as_millis() as u64, "sleeping");
        self.clock.sleep(duration).await;
    }

    fn enter(&mut self, next: CycleState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "cycle state");
            self.state = next;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
