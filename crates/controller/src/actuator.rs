//! Valve actuation with bounded wait for the position sensor.
//!
//! Every pulse energises the valve, polls the sensor until it reports the
//! expected level or the wait bound expires, and always de-energises the
//! valve before returning.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::gpio::{Gpio, Level};

/// Sensor level reported when the valve is open (pull-up switch closed to GND).
pub(crate) const OPEN_LEVEL: Level = Level::Low;
/// Sensor level reported when the valve is closed.
pub(crate) const CLOSED_LEVEL: Level = Level::High;

/// Result of one bounded wait for the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Confirmed,
    TimedOut,
}

impl AckOutcome {
    pub(crate) fn is_confirmed(self) -> bool {
        self == Self::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pins {
    pub(crate) valve: u8,
    pub(crate) sensor: u8,
    /// Many relay boards switch on a LOW input.
    pub(crate) active_low: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckSettings {
    /// Hard upper bound on how long the valve stays energised per pulse.
    pub(crate) max_wait: Duration,
    pub(crate) poll_interval: Duration,
    /// When set, the sensor must hold the expected level this long before
    /// it counts as confirmed.
    pub(crate) settle: Option<Duration>,
}

pub(crate) struct Actuator<G, C> {
    gpio: G,
    clock: C,
    pins: Pins,
    settings: AckSettings,
    energized: bool,
}

impl<G: Gpio, C: Clock> Actuator<G, C> {
    /// Configure both pins and drive the valve OFF. An actuator only exists
    /// for hardware that accepted this setup.
    pub(crate) fn new(mut gpio: G, clock: C, pins: Pins, settings: AckSettings) -> Result<Self> {
        // Fail-safe: the output comes up already at the OFF level.
        gpio.configure_output(pins.valve, output_level(false, pins.active_low))
            .with_context(|| format!("failed to configure valve pin {}", pins.valve))?;
        gpio.configure_input_pullup(pins.sensor)
            .with_context(|| format!("failed to configure sensor pin {}", pins.sensor))?;

        let actuator = Self {
            gpio,
            clock,
            pins,
            settings,
            energized: false,
        };
        info!(
            valve_pin = pins.valve,
            sensor_pin = pins.sensor,
            active_low = pins.active_low,
            max_wait_ms = settings.max_wait.as_millis() as u64,
            "actuator ready"
        );
        Ok(actuator)
    }

    #[cfg(test)]
    pub(crate) fn is_energized(&self) -> bool {
        self.energized
    }

    pub(crate) fn read_sensor(&mut self) -> Result<Level> {
        self.gpio.read_input(self.pins.sensor)
    }

    /// Energise the valve and wait for the sensor to read `wait_level`.
    ///
    /// Returns within `max_wait + poll_interval`. The valve is OFF when this
    /// returns, on every path including a sensor read error.
    pub(crate) async fn actuate(&mut self, wait_level: Level) -> Result<AckOutcome> {
        self.drive(true)?;
        let waited = self.wait_for(wait_level).await;
        let off = self.drive(false);

        let outcome = waited?;
        off?;
        match outcome {
            AckOutcome::Confirmed => debug!(%wait_level, "actuation confirmed"),
            AckOutcome::TimedOut => warn!(
                %wait_level,
                max_wait_ms = self.settings.max_wait.as_millis() as u64,
                "no acknowledgment from valve sensor"
            ),
        }
        Ok(outcome)
    }

    /// Bring the valve to the closed end stop so cycles start from a known
    /// position. Returns `None` when it was already closed.
    pub(crate) async fn home(&mut self) -> Result<Option<AckOutcome>> {
        if self.read_sensor()? == CLOSED_LEVEL {
            info!("valve already closed");
            return Ok(None);
        }
        info!("valve reports open at startup, closing");
        self.actuate(CLOSED_LEVEL).await.map(Some)
    }

    async fn wait_for(&mut self, wait_level: Level) -> Result<AckOutcome> {
        let start = self.clock.now();
        let max_wait_ms = self.settings.max_wait.as_millis() as u64;
        let mut held_since = None;

        loop {
            let level = self.gpio.read_input(self.pins.sensor)?;
            let now = self.clock.now();

            if level == wait_level {
                match self.settings.settle {
                    None => return Ok(AckOutcome::Confirmed),
                    Some(settle) => {
                        let since = *held_since.get_or_insert(now);
                        if now.saturating_duration_since(since) >= settle {
                            return Ok(AckOutcome::Confirmed);
                        }
                    }
                }
            } else {
                held_since = None;
            }

            if self.clock.elapsed_ms(start) >= max_wait_ms {
                return Ok(AckOutcome::TimedOut);
            }
            self.clock.sleep(self.settings.poll_interval).await;
        }
    }

    fn drive(&mut self, on: bool) -> Result<()> {
        let level = output_level(on, self.pins.active_low);
        self.gpio.set_output(self.pins.valve, level)?;
        self.energized = on;
        Ok(())
    }
}

/// Pin level that puts the relay in the requested state.
pub(crate) fn output_level(on: bool, active_low: bool) -> Level {
    let level = Level::from_bool(on);
    if active_low {
        level.inverted()
    } else {
        level
    }
}

// ===========================================================================
// Tests
// ===========================================================================
