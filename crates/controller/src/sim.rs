//! Simulated motorised valve with a position switch, for running the
//! controller on a dev machine.
//!
//! Models the physical behaviour the actuation protocol relies on:
//! - Energising the valve output moves it to the opposite position
//! - Travel takes a random time between a configured min and max
//! - The position switch uses a pull-up: closed reads HIGH, open reads LOW
//! - Optional stuck valve (never arrives) and contact bounce near the end of
//!   travel, so timeouts and debouncing can be exercised by hand

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::env;
use std::time::Duration;
use tokio::time::Instant;

use crate::actuator::output_level;
use crate::gpio::{Gpio, Level};

/// Window before arrival during which the switch may chatter.
const BOUNCE_WINDOW: Duration = Duration::from_millis(40);

/// Tunables, read from `SIM_*` environment variables.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimParams {
    pub(crate) travel_min: Duration,
    pub(crate) travel_max: Duration,
    /// Probability that a single movement never completes.
    pub(crate) stuck_prob: f32,
    /// Probability that a read inside the bounce window returns the wrong level.
    pub(crate) bounce_prob: f32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            travel_min: Duration::from_millis(800),
            travel_max: Duration::from_millis(2500),
            stuck_prob: 0.0,
            bounce_prob: 0.0,
        }
    }
}

impl SimParams {
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        let ms = |key: &str, fallback: Duration| {
            env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        let prob = |key: &str, fallback: f32| {
            env::var(key)
                .ok()
                .and_then(|s| s.parse::<f32>().ok())
                .map(|p| p.clamp(0.0, 1.0))
                .unwrap_or(fallback)
        };

        let travel_min = ms("SIM_TRAVEL_MIN_MS", defaults.travel_min);
        let travel_max = ms("SIM_TRAVEL_MAX_MS", defaults.travel_max).max(travel_min);
        Self {
            travel_min,
            travel_max,
            stuck_prob: prob("SIM_STUCK_PROB", defaults.stuck_prob),
            bounce_prob: prob("SIM_BOUNCE_PROB", defaults.bounce_prob),
        }
    }
}

/// A movement in progress.
struct Travel {
    arrives_at: Option<Instant>, // None = stuck
}

pub(crate) struct SimGpio {
    params: SimParams,
    /// Relay polarity: the output level that energises the valve is LOW.
    active_low: bool,
    outputs: HashSet<u8>,
    inputs: HashSet<u8>,
    open: bool,
    energized: bool,
    travel: Option<Travel>,
}

impl SimGpio {
    /// Start with the valve closed and de-energised.
    pub(crate) fn new(params: SimParams, active_low: bool) -> Self {
        tracing::info!(
            travel_min_ms = params.travel_min.as_millis() as u64,
            travel_max_ms = params.travel_max.as_millis() as u64,
            stuck_prob = params.stuck_prob,
            active_low,
            "[sim-gpio] simulated valve initialised (no hardware)"
        );
        Self {
            params,
            active_low,
            outputs: HashSet::new(),
            inputs: HashSet::new(),
            open: false,
            energized: false,
            travel: None,
        }
    }

    fn travel_time(&self) -> Duration {
        let min = self.params.travel_min.as_millis() as u64;
        let max = self.params.travel_max.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max))
    }

    /// Complete a movement whose travel time has passed.
    fn advance(&mut self, now: Instant) {
        let arrived = matches!(
            self.travel,
            Some(Travel { arrives_at: Some(at) }) if now >= at
        );
        if arrived {
            self.open = !self.open;
            self.travel = None;
            tracing::debug!(open = self.open, "[sim-gpio] valve reached end stop");
        }
    }

    fn position_level(&self) -> Level {
        // Pull-up switch: closed = HIGH, open = LOW.
        Level::from_bool(!self.open)
    }
}

impl Gpio for SimGpio {
    fn configure_output(&mut self, pin: u8, initial: Level) -> Result<()> {
        self.outputs.insert(pin);
        tracing::info!(pin, %initial, "[sim-gpio] registered valve output");
        self.set_output(pin, initial)
    }

    fn configure_input_pullup(&mut self, pin: u8) -> Result<()> {
        self.inputs.insert(pin);
        tracing::info!(pin, "[sim-gpio] registered position sensor");
        Ok(())
    }

    fn set_output(&mut self, pin: u8, level: Level) -> Result<()> {
        if !self.outputs.contains(&pin) {
            bail!("[sim-gpio] gpio {pin} is not configured as an output");
        }
        let on = level == output_level(true, self.active_low);
        let now = Instant::now();
        self.advance(now);

        if on && !self.energized {
            let arrives_at = if fastrand::f32() < self.params.stuck_prob {
                tracing::warn!("[sim-gpio] valve stuck for this movement");
                None
            } else {
                Some(now + self.travel_time())
            };
            self.travel = Some(Travel { arrives_at });
        } else if !on {
            // Power cut mid-travel: the valve stays where it was.
            self.travel = None;
        }
        self.energized = on;
        tracing::debug!(pin, %level, "[sim-gpio] valve output set");
        Ok(())
    }

    fn read_input(&mut self, pin: u8) -> Result<Level> {
        if !self.inputs.contains(&pin) {
            bail!("[sim-gpio] gpio {pin} is not configured as an input");
        }
        let now = Instant::now();
        self.advance(now);

        let level = self.position_level();
        let bouncing = matches!(
            self.travel,
            Some(Travel { arrives_at: Some(at) })
                if at.saturating_duration_since(now) <= BOUNCE_WINDOW
        );
        if bouncing && fastrand::f32() < self.params.bounce_prob {
            return Ok(level.inverted());
        }
        Ok(level)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
