//! TOML config file loading and validation, plus the optional remote
//! constants document merged over it at startup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::actuator::{AckSettings, Pins};
use crate::engine::EngineSettings;
use crate::fallback::FallbackSettings;
use crate::network::Network;
use crate::supervisor::LinkSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) device: DeviceConfig,
    pub(crate) server: ServerConfig,
    #[serde(default)]
    pub(crate) timing: TimingConfig,
    #[serde(default)]
    pub(crate) link: LinkConfig,
    #[serde(default)]
    pub(crate) fallback: FallbackConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct DeviceConfig {
    pub(crate) valve_pin: u8,
    pub(crate) sensor_pin: u8,
    pub(crate) relay_active_low: bool,
    pub(crate) home_on_start: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            valve_pin: 5,
            sensor_pin: 14,
            relay_active_low: false,
            home_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ServerConfig {
    pub(crate) schedule_url: String,
    pub(crate) status_url: String,
    pub(crate) no_ack_url: String,
    #[serde(default)]
    pub(crate) constants_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub(crate) request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FaultPolicy {
    /// Raise the fault flag and carry on.
    #[default]
    Flag,
    /// Raise the flag and stand by for `fault_standby_ms`.
    Standby,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct TimingConfig {
    pub(crate) reporting_margin_ms: u64,
    pub(crate) max_on_duration_ms: u64,
    pub(crate) poll_interval_ms: u64,
    /// 0 disables debouncing.
    pub(crate) debounce_ms: u64,
    pub(crate) parse_retry_delay_ms: u64,
    pub(crate) loop_delay_ms: u64,
    pub(crate) power_save: bool,
    pub(crate) fault_policy: FaultPolicy,
    pub(crate) fault_standby_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reporting_margin_ms: 20_000,
            max_on_duration_ms: 10_000,
            poll_interval_ms: 10,
            debounce_ms: 0,
            parse_retry_delay_ms: 5_000,
            loop_delay_ms: 5_000,
            power_save: true,
            fault_policy: FaultPolicy::Flag,
            fault_standby_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct LinkConfig {
    pub(crate) reconnect_interval_ms: u64,
    pub(crate) reconnect_backoff_max_ms: u64,
    pub(crate) reconnect_timeout_ms: u64,
    pub(crate) standby_ms: u64,
    pub(crate) offline_after_failures: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5_000,
            reconnect_backoff_max_ms: 30_000,
            reconnect_timeout_ms: 60_000,
            standby_ms: 7_200_000,
            offline_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct FallbackConfig {
    pub(crate) watering_ms: u64,
    pub(crate) standby_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            watering_ms: 300_000,
            standby_ms: 86_400_000,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub(crate) fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_server(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_link(&mut errors);

        if self.fallback.watering_ms == 0 {
            errors.push("fallback.watering_ms must be positive".to_string());
        }
        if self.fallback.standby_ms == 0 {
            errors.push("fallback.standby_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        for (name, pin) in [("valve_pin", d.valve_pin), ("sensor_pin", d.sensor_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "device.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if d.valve_pin == d.sensor_pin {
            errors.push(format!(
                "device.valve_pin and device.sensor_pin are both {}",
                d.valve_pin
            ));
        }
    }

    fn validate_server(&self, errors: &mut Vec<String>) {
        let s = &self.server;
        let urls = [
            ("schedule_url", Some(&s.schedule_url)),
            ("status_url", Some(&s.status_url)),
            ("no_ack_url", Some(&s.no_ack_url)),
            ("constants_url", s.constants_url.as_ref()),
        ];
        for (name, url) in urls {
            let Some(url) = url else { continue };
            match reqwest::Url::parse(url) {
                Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => {}
                Ok(u) => errors.push(format!(
                    "server.{name} '{url}' must be an http(s) url with a host (scheme {})",
                    u.scheme()
                )),
                Err(e) => errors.push(format!("server.{name} '{url}' is not a valid url: {e}")),
            }
        }
        if s.request_timeout_ms == 0 {
            errors.push("server.request_timeout_ms must be positive".to_string());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (name, value) in [
            ("max_on_duration_ms", t.max_on_duration_ms),
            ("poll_interval_ms", t.poll_interval_ms),
            ("parse_retry_delay_ms", t.parse_retry_delay_ms),
            ("loop_delay_ms", t.loop_delay_ms),
            ("fault_standby_ms", t.fault_standby_ms),
        ] {
            if value == 0 {
                errors.push(format!("timing.{name} must be positive"));
            }
        }

        // Only meaningful once both are positive.
        if t.max_on_duration_ms > 0 && t.poll_interval_ms >= t.max_on_duration_ms {
            errors.push(format!(
                "timing.poll_interval_ms ({}) must be less than max_on_duration_ms ({})",
                t.poll_interval_ms, t.max_on_duration_ms
            ));
        }
        if t.max_on_duration_ms > 0 && t.debounce_ms >= t.max_on_duration_ms {
            errors.push(format!(
                "timing.debounce_ms ({}) must be less than max_on_duration_ms ({})",
                t.debounce_ms, t.max_on_duration_ms
            ));
        }
    }

    fn validate_link(&self, errors: &mut Vec<String>) {
        let l = &self.link;
        for (name, value) in [
            ("reconnect_interval_ms", l.reconnect_interval_ms),
            ("reconnect_backoff_max_ms", l.reconnect_backoff_max_ms),
            ("reconnect_timeout_ms", l.reconnect_timeout_ms),
            ("standby_ms", l.standby_ms),
        ] {
            if value == 0 {
                errors.push(format!("link.{name} must be positive"));
            }
        }
        if l.reconnect_backoff_max_ms < l.reconnect_interval_ms {
            errors.push(format!(
                "link.reconnect_backoff_max_ms ({}) is below reconnect_interval_ms ({})",
                l.reconnect_backoff_max_ms, l.reconnect_interval_ms
            ));
        }
        if l.offline_after_failures == 0 {
            errors.push("link.offline_after_failures must be at least 1".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Views handed to the components
// ---------------------------------------------------------------------------

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl Config {
    pub(crate) fn pins(&self) -> Pins {
        Pins {
            valve: self.device.valve_pin,
            sensor: self.device.sensor_pin,
            active_low: self.device.relay_active_low,
        }
    }

    pub(crate) fn ack_settings(&self) -> AckSettings {
        let t = &self.timing;
        AckSettings {
            max_wait: ms(t.max_on_duration_ms),
            poll_interval: ms(t.poll_interval_ms),
            settle: (t.debounce_ms > 0).then(|| ms(t.debounce_ms)),
        }
    }

    pub(crate) fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            reconnect_interval: ms(self.link.reconnect_interval_ms),
            backoff_max: ms(self.link.reconnect_backoff_max_ms),
            reconnect_timeout: ms(self.link.reconnect_timeout_ms),
        }
    }

    pub(crate) fn engine_settings(&self) -> EngineSettings {
        let t = &self.timing;
        EngineSettings {
            schedule_url: self.server.schedule_url.clone(),
            status_url: self.server.status_url.clone(),
            no_ack_url: self.server.no_ack_url.clone(),
            reporting_margin: ms(t.reporting_margin_ms),
            parse_retry_delay: ms(t.parse_retry_delay_ms),
            power_save: t.power_save,
            fault_standby: match t.fault_policy {
                FaultPolicy::Flag => None,
                FaultPolicy::Standby => Some(ms(t.fault_standby_ms)),
            },
        }
    }

    pub(crate) fn fallback_settings(&self) -> FallbackSettings {
        FallbackSettings {
            watering: ms(self.fallback.watering_ms),
            standby: ms(self.fallback.standby_ms),
        }
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        ms(self.server.request_timeout_ms)
    }

    pub(crate) fn loop_delay(&self) -> Duration {
        ms(self.timing.loop_delay_ms)
    }

    pub(crate) fn link_standby(&self) -> Duration {
        ms(self.link.standby_ms)
    }
}

// ---------------------------------------------------------------------------
// Remote constants
// ---------------------------------------------------------------------------

/// Optional overrides published by the server. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct RemoteConstants {
    pub(crate) reporting_margin_ms: Option<u64>,
    pub(crate) max_on_duration_ms: Option<u64>,
    pub(crate) debounce_ms: Option<u64>,
    pub(crate) fallback_watering_ms: Option<u64>,
    pub(crate) fallback_standby_ms: Option<u64>,
}

impl Config {
    /// Merge `remote` over this config and re-validate the result. On error
    /// the caller still holds its original config.
    pub(crate) fn with_remote(&self, remote: &RemoteConstants) -> Result<Self> {
        let mut merged = self.clone();
        let t = &mut merged.timing;
        let f = &mut merged.fallback;
        let overrides = [
            (&mut t.reporting_margin_ms, remote.reporting_margin_ms),
            (&mut t.max_on_duration_ms, remote.max_on_duration_ms),
            (&mut t.debounce_ms, remote.debounce_ms),
            (&mut f.watering_ms, remote.fallback_watering_ms),
            (&mut f.standby_ms, remote.fallback_standby_ms),
        ];
        let mut applied = 0;
        for (slot, value) in overrides {
            if let Some(v) = value {
                *slot = v;
                applied += 1;
            }
        }
        merged
            .validate()
            .context("remote constants produce an invalid config")?;
        tracing::info!(applied, "remote constants merged");
        Ok(merged)
    }
}

/// GET the constants document and decode it.
pub(crate) async fn fetch_remote_constants(
    network: &impl Network,
    url: &str,
) -> Result<RemoteConstants> {
    let body = network.fetch(url).await?;
    serde_json::from_str(body.trim())
        .with_context(|| format!("failed to decode remote constants from {url}"))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub(crate) fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
