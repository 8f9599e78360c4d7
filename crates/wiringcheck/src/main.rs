//! Bench wiring verification.
//!
//! Run this on a freshly wired bench BEFORE starting the controller.  It
//! claims every pin named in the config, holds all pump outputs in their OFF
//! state, reads every switch input once, and prints a per-pin PASS/FAIL
//! report.  Exit code 0 means every check passed.
//!
//! Pumps are never pulsed on real hardware; only the mock backend (builds
//! without the `gpio` feature) exercises the on/off path.  On a Pi the
//! strongest claim this tool makes is "the pin is claimable and holds OFF",
//! which is exactly what a safe boot needs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Usable BCM pins on the 40-pin header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Config (tolerant subset of the controller's schema)
// ---------------------------------------------------------------------------

// Only the fields this tool needs; everything else in the file is ignored so
// the same config.toml serves both binaries.

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    safety: SafetyConfig,
    #[serde(default)]
    zones: Vec<ZoneConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SafetyConfig {
    emergency_bcm: i64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { emergency_bcm: 25 }
    }
}

fn default_active_low() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ZoneConfig {
    zone_id: String,
    pump_bcm: i64,
    overflow_bcm: i64,
    #[serde(default = "default_active_low")]
    pump_active_low: bool,
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).context("parsing config file")
}

// ---------------------------------------------------------------------------
// Pin access
// ---------------------------------------------------------------------------

trait Pins {
    /// Claim an output at the given electrical level.
    fn claim_output(&mut self, bcm: u8, level: bool) -> Result<()>;
    fn write_level(&mut self, bcm: u8, level: bool) -> Result<()>;
    fn claim_input_pullup(&mut self, bcm: u8) -> Result<()>;
    fn read_level(&mut self, bcm: u8) -> Result<bool>;
    /// Mock backends may exercise the on/off path; real hardware must not.
    fn can_pulse(&self) -> bool;
}

#[cfg(feature = "gpio")]
mod real {
    use super::*;
    use anyhow::anyhow;
    use rppal::gpio::{Gpio, InputPin, OutputPin};

    pub struct RealPins {
        chip: Gpio,
        outs: HashMap<u8, OutputPin>,
        ins: HashMap<u8, InputPin>,
    }

    impl RealPins {
        pub fn new() -> Result<Self> {
            Ok(Self {
                chip: Gpio::new().context("opening gpio chip")?,
                outs: HashMap::new(),
                ins: HashMap::new(),
            })
        }
    }

    impl Pins for RealPins {
        fn claim_output(&mut self, bcm: u8, level: bool) -> Result<()> {
            let pin = self.chip.get(bcm).with_context(|| format!("gpio {bcm}"))?;
            let out = if level {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            self.outs.insert(bcm, out);
            Ok(())
        }

        fn write_level(&mut self, bcm: u8, level: bool) -> Result<()> {
            let pin = self
                .outs
                .get_mut(&bcm)
                .ok_or_else(|| anyhow!("gpio {bcm} not claimed as output"))?;
            if level {
                pin.set_high();
            } else {
                pin.set_low();
            }
            Ok(())
        }

        fn claim_input_pullup(&mut self, bcm: u8) -> Result<()> {
            let pin = self.chip.get(bcm).with_context(|| format!("gpio {bcm}"))?;
            self.ins.insert(bcm, pin.into_input_pullup());
            Ok(())
        }

        fn read_level(&mut self, bcm: u8) -> Result<bool> {
            if let Some(pin) = self.ins.get(&bcm) {
                return Ok(pin.is_high());
            }
            if let Some(pin) = self.outs.get(&bcm) {
                return Ok(pin.is_set_high());
            }
            Err(anyhow!("gpio {bcm} not claimed"))
        }

        fn can_pulse(&self) -> bool {
            false
        }
    }
}

#[cfg(not(feature = "gpio"))]
mod mock {
    use super::*;

    /// In-memory pin table; inputs sit at their pull-up level.
    pub struct MockPins {
        levels: HashMap<u8, bool>,
    }

    impl MockPins {
        pub fn new() -> Self {
            Self {
                levels: HashMap::new(),
            }
        }
    }

    impl Pins for MockPins {
        fn claim_output(&mut self, bcm: u8, level: bool) -> Result<()> {
            self.levels.insert(bcm, level);
            Ok(())
        }

        fn write_level(&mut self, bcm: u8, level: bool) -> Result<()> {
            anyhow::ensure!(self.levels.contains_key(&bcm), "gpio {bcm} not claimed");
            self.levels.insert(bcm, level);
            Ok(())
        }

        fn claim_input_pullup(&mut self, bcm: u8) -> Result<()> {
            self.levels.insert(bcm, true);
            Ok(())
        }

        fn read_level(&mut self, bcm: u8) -> Result<bool> {
            self.levels
                .get(&bcm)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("gpio {bcm} not claimed"))
        }

        fn can_pulse(&self) -> bool {
            true
        }
    }
}

fn default_pins() -> Result<Box<dyn Pins>> {
    #[cfg(feature = "gpio")]
    {
        Ok(Box::new(real::RealPins::new()?))
    }
    #[cfg(not(feature = "gpio"))]
    {
        info!("no gpio feature; running against mock pins");
        Ok(Box::new(mock::MockPins::new()))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

enum Outcome {
    Pass(String),
    Fail(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass(detail) => write!(f, "PASS  {detail}"),
            Outcome::Fail(detail) => write!(f, "FAIL  {detail}"),
        }
    }
}

#[derive(Default)]
struct Report {
    checks: Vec<(String, Outcome)>,
}

impl Report {
    fn pass(&mut self, label: impl Into<String>, detail: impl Into<String>) {
        self.checks.push((label.into(), Outcome::Pass(detail.into())));
    }

    fn fail(&mut self, label: impl Into<String>, detail: impl Into<String>) {
        self.checks.push((label.into(), Outcome::Fail(detail.into())));
    }

    fn all_passed(&self) -> bool {
        self.checks
            .iter()
            .all(|(_, o)| matches!(o, Outcome::Pass(_)))
    }

    fn print(&self) {
        println!("wiring check: {} checks", self.checks.len());
        for (label, outcome) in &self.checks {
            println!("  [{label}] {outcome}");
        }
        if self.all_passed() {
            println!("all checks passed");
        } else {
            let failed = self
                .checks
                .iter()
                .filter(|(_, o)| matches!(o, Outcome::Fail(_)))
                .count();
            println!("{failed} check(s) FAILED -- do not start the controller");
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn pin_ok(bcm: i64) -> bool {
    VALID_GPIO_PINS.contains(&bcm)
}

fn run_checks(config: &Config, pins: &mut dyn Pins) -> Report {
    let mut report = Report::default();
    let mut used: HashSet<i64> = HashSet::new();

    // ── Pump outputs ───────────────────────────────────────────────────────

    for z in &config.zones {
        let label = format!("pump {}", z.zone_id);
        if !pin_ok(z.pump_bcm) {
            report.fail(&label, format!("gpio {} outside usable range 2-27", z.pump_bcm));
            continue;
        }
        if !used.insert(z.pump_bcm) {
            report.fail(&label, format!("gpio {} already assigned", z.pump_bcm));
            continue;
        }
        let bcm = z.pump_bcm as u8;
        // active-low relay: LOW = ON, HIGH = OFF
        let off_level = z.pump_active_low;

        if let Err(e) = pins.claim_output(bcm, off_level) {
            report.fail(&label, format!("claim failed: {e:#}"));
            continue;
        }
        match pins.read_level(bcm) {
            Ok(level) if level == off_level => {}
            Ok(level) => {
                report.fail(
                    &label,
                    format!("gpio {bcm} reads {level} after claiming OFF ({off_level})"),
                );
                continue;
            }
            Err(e) => {
                report.fail(&label, format!("readback failed: {e:#}"));
                continue;
            }
        }

        if pins.can_pulse() {
            // Mock only: exercise the full on/off path.
            let on = pins.write_level(bcm, !off_level).and_then(|_| {
                let lvl = pins.read_level(bcm)?;
                anyhow::ensure!(lvl == !off_level, "gpio {bcm} did not reach ON level");
                pins.write_level(bcm, off_level)
            });
            if let Err(e) = on {
                report.fail(&label, format!("pulse failed: {e:#}"));
                continue;
            }
            report.pass(&label, format!("gpio {bcm} claimed, pulsed, held OFF"));
        } else {
            report.pass(&label, format!("gpio {bcm} claimed, held OFF"));
        }
    }

    // ── Float switch inputs ────────────────────────────────────────────────

    for z in &config.zones {
        let label = format!("float {}", z.zone_id);
        if !pin_ok(z.overflow_bcm) {
            report.fail(
                &label,
                format!("gpio {} outside usable range 2-27", z.overflow_bcm),
            );
            continue;
        }
        if !used.insert(z.overflow_bcm) {
            report.fail(&label, format!("gpio {} already assigned", z.overflow_bcm));
            continue;
        }
        let bcm = z.overflow_bcm as u8;
        if let Err(e) = pins.claim_input_pullup(bcm) {
            report.fail(&label, format!("claim failed: {e:#}"));
            continue;
        }
        match pins.read_level(bcm) {
            // Active-low switch: HIGH at rest, LOW when the water lifts it.
            Ok(true) => report.pass(&label, format!("gpio {bcm} HIGH (dry / clear)")),
            Ok(false) => report.pass(
                &label,
                format!("gpio {bcm} LOW (triggered -- empty the tray before starting)"),
            ),
            Err(e) => report.fail(&label, format!("read failed: {e:#}")),
        }
    }

    // ── Emergency stop button ──────────────────────────────────────────────

    let label = "e-stop".to_string();
    let ebcm = config.safety.emergency_bcm;
    if !pin_ok(ebcm) {
        report.fail(&label, format!("gpio {ebcm} outside usable range 2-27"));
    } else if !used.insert(ebcm) {
        report.fail(&label, format!("gpio {ebcm} already assigned"));
    } else {
        let bcm = ebcm as u8;
        match pins
            .claim_input_pullup(bcm)
            .and_then(|_| pins.read_level(bcm))
        {
            // Normally-open button to ground: HIGH at rest.
            Ok(true) => report.pass(&label, format!("gpio {bcm} HIGH (released)")),
            Ok(false) => report.fail(
                &label,
                format!("gpio {bcm} LOW at rest -- button pressed or miswired"),
            ),
            Err(e) => report.fail(&label, format!("claim/read failed: {e:#}")),
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn try_main() -> Result<bool> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(Path::new(&path)).with_context(|| format!("loading {path}"))?;
    anyhow::ensure!(!config.zones.is_empty(), "config has no zones");
    info!(zones = config.zones.len(), "config loaded");

    let mut pins = default_pins()?;
    let report = run_checks(&config, pins.as_mut());
    report.print();
    Ok(report.all_passed())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match try_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("wiring check error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [safety]
            emergency_bcm = 25

            [[zones]]
            zone_id = "z1"
            pump_bcm = 18
            overflow_bcm = 21

            [[zones]]
            zone_id = "z2"
            pump_bcm = 19
            overflow_bcm = 22
            pump_active_low = false
            "#,
        )
        .unwrap()
    }

    #[test]
    fn parses_the_controller_config_tolerantly() {
        // Fields the checker does not care about must not break parsing.
        let cfg: Config = toml::from_str(
            r#"
            [controller]
            tick_ms = 1000

            [safety]
            watchdog_sec = 30

            [[zones]]
            zone_id = "z1"
            name = "Front bench"
            pump_bcm = 18
            overflow_bcm = 21
            moisture_addr = 0x20
            moisture_low_pct = 40.0
            flood_sec = 300
            drain_sec = 600
            "#,
        )
        .unwrap();
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.safety.emergency_bcm, 25, "default fills in");
        assert!(cfg.zones[0].pump_active_low, "default fills in");
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn clean_config_passes_every_check() {
        let cfg = test_config();
        let mut pins = mock::MockPins::new();
        let report = run_checks(&cfg, &mut pins);
        assert!(report.all_passed(), "unexpected failures in {:?}", names(&report));
        // 2 pumps + 2 floats + 1 e-stop.
        assert_eq!(report.checks.len(), 5);
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn out_of_range_pin_fails_its_check_only() {
        let mut cfg = test_config();
        cfg.zones[0].pump_bcm = 40;
        let mut pins = mock::MockPins::new();
        let report = run_checks(&cfg, &mut pins);
        assert!(!report.all_passed());
        let failed = failures(&report);
        assert_eq!(failed, vec!["pump z1"]);
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn duplicate_pin_fails_the_second_claim() {
        let mut cfg = test_config();
        cfg.zones[1].pump_bcm = cfg.zones[0].pump_bcm;
        let mut pins = mock::MockPins::new();
        let report = run_checks(&cfg, &mut pins);
        let failed = failures(&report);
        assert_eq!(failed, vec!["pump z2"]);
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn estop_sharing_a_pump_pin_fails() {
        let mut cfg = test_config();
        cfg.safety.emergency_bcm = 18;
        let mut pins = mock::MockPins::new();
        let report = run_checks(&cfg, &mut pins);
        let failed = failures(&report);
        assert_eq!(failed, vec!["e-stop"]);
    }

    #[test]
    fn report_formatting_marks_failures() {
        let mut report = Report::default();
        report.pass("pump z1", "ok");
        report.fail("float z1", "broken");
        assert!(!report.all_passed());
        assert_eq!(format!("{}", report.checks[0].1), "PASS  ok");
        assert_eq!(format!("{}", report.checks[1].1), "FAIL  broken");
    }

    fn names(report: &Report) -> Vec<String> {
        report
            .checks
            .iter()
            .map(|(label, outcome)| format!("{label}: {outcome}"))
            .collect()
    }

    fn failures(report: &Report) -> Vec<&str> {
        report
            .checks
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Fail(_)))
            .map(|(label, _)| label.as_str())
            .collect()
    }
}
