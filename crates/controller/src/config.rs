//! TOML configuration: schema, defaults, validation.
//!
//! Validation collects every problem before failing so a bad config file is
//! fixed in one edit, not one error at a time.  Pin numbers are checked
//! against the usable BCM range and against each other; a pin can serve
//! exactly one role across the whole file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::safety::MAX_PUMP_TIMEOUT;

/// BCM pins safe for general use on the 40-pin header.  0 and 1 belong to
/// the ID EEPROM and 28+ do not exist.
pub const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// 7-bit I2C device addresses, minus the reserved blocks at both ends.
const I2C_ADDR_MIN: i64 = 0x08;
const I2C_ADDR_MAX: i64 = 0x77;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Control loop tick interval.
    pub tick_ms: i64,
    /// Sensor poller sweep interval.
    pub poll_sec: i64,
    /// Attempts per sensor read before giving up on the sweep.
    pub max_retries: i64,
    /// Backoff between attempts is `retry_base_ms * attempt`.
    pub retry_base_ms: i64,
    /// Cache entries younger than this are served without a bus read.
    pub cache_fresh_sec: i64,
    /// Readings older than this never trigger an automatic flood.
    pub stale_after_sec: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            poll_sec: 5,
            max_retries: 3,
            retry_base_ms: 250,
            cache_fresh_sec: 5,
            stale_after_sec: 120,
        }
    }
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms as u64)
    }
    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_sec as u64)
    }
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms as u64)
    }
    pub fn cache_fresh(&self) -> Duration {
        Duration::from_secs(self.cache_fresh_sec as u64)
    }
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_sec as u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Control-loop heartbeats older than this deny every pump start.
    pub watchdog_sec: i64,
    /// BCM pin of the physical e-stop button (active-low, pull-up).
    pub emergency_bcm: i64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            watchdog_sec: 30,
            emergency_bcm: 25,
        }
    }
}

impl SafetyConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_sec as u64)
    }
}

fn default_pump_active_low() -> bool {
    true
}
fn default_raw_dry() -> i64 {
    500
}
fn default_raw_wet() -> i64 {
    200
}
fn default_pump_timeout_sec() -> i64 {
    600
}
fn default_flood_retry_cap() -> i64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub name: String,
    pub pump_bcm: i64,
    pub overflow_bcm: i64,
    /// I2C address of the zone's Chirp probe.
    pub moisture_addr: i64,
    /// Most relay boards switch on LOW; set false for direct MOSFET drivers.
    #[serde(default = "default_pump_active_low")]
    pub pump_active_low: bool,
    /// Calibration endpoint: raw counts in dry air.
    #[serde(default = "default_raw_dry")]
    pub raw_dry: i64,
    /// Calibration endpoint: raw counts fully submerged.
    #[serde(default = "default_raw_wet")]
    pub raw_wet: i64,
    /// Flood when moisture drops below this percentage.
    pub moisture_low_pct: f64,
    pub flood_sec: i64,
    pub drain_sec: i64,
    /// Hard pump deadline; must exceed flood_sec and stay within the global
    /// ceiling.
    #[serde(default = "default_pump_timeout_sec")]
    pub pump_timeout_sec: i64,
    /// Consecutive failed pump starts before the zone faults.
    #[serde(default = "default_flood_retry_cap")]
    pub flood_retry_cap: i64,
}

impl ZoneConfig {
    pub fn flood(&self) -> Duration {
        Duration::from_secs(self.flood_sec as u64)
    }
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_sec as u64)
    }
    pub fn pump_timeout(&self) -> Duration {
        Duration::from_secs(self.pump_timeout_sec as u64)
    }
    /// Cache id of the zone's moisture channel.
    pub fn sensor_id(&self) -> String {
        format!("moisture_{:02x}", self.moisture_addr)
    }
    /// Cache id of the zone's probe temperature channel.
    pub fn temp_sensor_id(&self) -> String {
        format!("temp_{:02x}", self.moisture_addr)
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&text).context("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let c = &self.controller;
        if c.tick_ms <= 0 {
            errors.push(format!("controller.tick_ms must be positive, got {}", c.tick_ms));
        }
        if c.poll_sec <= 0 {
            errors.push(format!("controller.poll_sec must be positive, got {}", c.poll_sec));
        }
        if c.max_retries < 1 {
            errors.push(format!(
                "controller.max_retries must be at least 1, got {}",
                c.max_retries
            ));
        }
        if c.retry_base_ms <= 0 {
            errors.push(format!(
                "controller.retry_base_ms must be positive, got {}",
                c.retry_base_ms
            ));
        }
        if c.cache_fresh_sec <= 0 {
            errors.push(format!(
                "controller.cache_fresh_sec must be positive, got {}",
                c.cache_fresh_sec
            ));
        }
        if c.stale_after_sec <= 0 {
            errors.push(format!(
                "controller.stale_after_sec must be positive, got {}",
                c.stale_after_sec
            ));
        }

        let s = &self.safety;
        if s.watchdog_sec <= 0 {
            errors.push(format!(
                "safety.watchdog_sec must be positive, got {}",
                s.watchdog_sec
            ));
        }
        if !VALID_GPIO_PINS.contains(&s.emergency_bcm) {
            errors.push(format!(
                "safety.emergency_bcm {} outside usable range {}-{}",
                s.emergency_bcm,
                VALID_GPIO_PINS.start(),
                VALID_GPIO_PINS.end()
            ));
        }

        if self.zones.is_empty() {
            errors.push("at least one zone must be configured".to_string());
        }

        // One pin, one role, across the whole file.
        let mut used_pins: HashSet<i64> = HashSet::new();
        used_pins.insert(s.emergency_bcm);
        let mut check_pin = |label: String, pin: i64, errors: &mut Vec<String>| {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{label} {pin} outside usable range {}-{}",
                    VALID_GPIO_PINS.start(),
                    VALID_GPIO_PINS.end()
                ));
            } else if !used_pins.insert(pin) {
                errors.push(format!("gpio {pin} assigned more than once ({label})"));
            }
        };

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            let who = if z.zone_id.is_empty() {
                format!("zone #{i}")
            } else {
                format!("zone {}", z.zone_id)
            };

            if z.zone_id.is_empty() {
                errors.push(format!("{who}: zone_id must not be empty"));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("duplicate zone_id {}", z.zone_id));
            }
            if z.name.is_empty() {
                errors.push(format!("{who}: name must not be empty"));
            }

            check_pin(format!("{who}: pump_bcm"), z.pump_bcm, &mut errors);
            check_pin(format!("{who}: overflow_bcm"), z.overflow_bcm, &mut errors);

            if !(I2C_ADDR_MIN..=I2C_ADDR_MAX).contains(&z.moisture_addr) {
                errors.push(format!(
                    "{who}: moisture_addr 0x{:02x} outside 0x{I2C_ADDR_MIN:02x}-0x{I2C_ADDR_MAX:02x}",
                    z.moisture_addr
                ));
            }

            if !(0..=1023).contains(&z.raw_dry) {
                errors.push(format!("{who}: raw_dry {} outside 0-1023", z.raw_dry));
            }
            if !(0..=1023).contains(&z.raw_wet) {
                errors.push(format!("{who}: raw_wet {} outside 0-1023", z.raw_wet));
            }
            if z.raw_dry == z.raw_wet {
                errors.push(format!("{who}: raw_dry and raw_wet must differ"));
            }

            if !(0.0..=100.0).contains(&z.moisture_low_pct) {
                errors.push(format!(
                    "{who}: moisture_low_pct {} outside 0-100",
                    z.moisture_low_pct
                ));
            }

            if z.flood_sec <= 0 {
                errors.push(format!("{who}: flood_sec must be positive, got {}", z.flood_sec));
            }
            if z.drain_sec <= 0 {
                errors.push(format!("{who}: drain_sec must be positive, got {}", z.drain_sec));
            }

            let max_timeout = MAX_PUMP_TIMEOUT.as_secs() as i64;
            if z.pump_timeout_sec <= 0 || z.pump_timeout_sec > max_timeout {
                errors.push(format!(
                    "{who}: pump_timeout_sec must be within 1-{max_timeout}, got {}",
                    z.pump_timeout_sec
                ));
            } else if z.pump_timeout_sec <= z.flood_sec {
                // Equal is not enough: the deadline would race the orderly
                // stop at the end of every flood window.
                errors.push(format!(
                    "{who}: pump_timeout_sec ({}) must exceed flood_sec ({})",
                    z.pump_timeout_sec, z.flood_sec
                ));
            }

            if z.flood_retry_cap < 1 {
                errors.push(format!(
                    "{who}: flood_retry_cap must be at least 1, got {}",
                    z.flood_retry_cap
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("invalid config:\n  - {}", errors.join("\n  - "));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
