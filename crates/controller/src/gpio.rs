//! Binary GPIO access for the valve output and its position sensor. The
//! `gpio` feature gates the real rppal driver; the `sim` feature provides a
//! simulated valve (see `sim.rs`).

use anyhow::Result;
use std::fmt;

#[cfg(feature = "gpio")]
use anyhow::{bail, Context};
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio as RpGpio, InputPin, OutputPin};
#[cfg(feature = "gpio")]
use std::collections::HashMap;

/// Logic level of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Low,
    High,
}

impl Level {
    pub(crate) fn from_bool(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }

    pub(crate) fn inverted(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Pin-level hardware capability. Implementations must refuse to drive or
/// read a pin that was never configured.
pub(crate) trait Gpio {
    /// Claim `pin` as an output already driven to `initial`, so it never
    /// passes through the other level.
    fn configure_output(&mut self, pin: u8, initial: Level) -> Result<()>;
    fn configure_input_pullup(&mut self, pin: u8) -> Result<()>;
    fn set_output(&mut self, pin: u8, level: Level) -> Result<()>;
    fn read_input(&mut self, pin: u8) -> Result<Level>;
}

// ---------------------------------------------------------------------------
// Real GPIO (rppal, Raspberry Pi only)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub(crate) struct RppalGpio {
    gpio: RpGpio,
    outputs: HashMap<u8, OutputPin>,
    inputs: HashMap<u8, InputPin>,
}

#[cfg(feature = "gpio")]
impl RppalGpio {
    pub(crate) fn new() -> Result<Self> {
        let gpio = RpGpio::new().context("failed to open GPIO peripheral")?;
        Ok(Self {
            gpio,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
        })
    }
}

#[cfg(feature = "gpio")]
impl Gpio for RppalGpio {
    fn configure_output(&mut self, pin: u8, initial: Level) -> Result<()> {
        let pin_handle = self
            .gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?;
        let out = match initial {
            Level::High => pin_handle.into_output_high(),
            Level::Low => pin_handle.into_output_low(),
        };
        self.outputs.insert(pin, out);
        tracing::debug!(pin, %initial, "gpio output configured");
        Ok(())
    }

    fn configure_input_pullup(&mut self, pin: u8) -> Result<()> {
        let input = self
            .gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?
            .into_input_pullup();
        self.inputs.insert(pin, input);
        tracing::debug!(pin, "gpio input (pull-up) configured");
        Ok(())
    }

    fn set_output(&mut self, pin: u8, level: Level) -> Result<()> {
        let Some(out) = self.outputs.get_mut(&pin) else {
            bail!("gpio {pin} is not configured as an output");
        };
        match level {
            Level::High => out.set_high(),
            Level::Low => out.set_low(),
        }
        Ok(())
    }

    fn read_input(&mut self, pin: u8) -> Result<Level> {
        let Some(input) = self.inputs.get(&pin) else {
            bail!("gpio {pin} is not configured as an input");
        };
        Ok(Level::from_bool(input.is_high()))
    }
}
