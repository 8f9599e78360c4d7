//! Moisture/temperature sensing: source trait, retry wrapper, cache, poller.
//!
//! ```text
//!             ┌──────────────┐   raw counts    ┌──────────────┐
//!  I2C bus ──▶│ SensorSource │────────────────▶│ SensorReader │──▶ cache
//!             │ (chirp/sim)  │   (with retry)  │  (validate,  │
//!             └──────────────┘                 │   convert)   │
//!                                              └──────┬───────┘
//!                                                     │ last_good()
//!                                                     ▼
//!                                               cycle controller
//! ```
//!
//! The poller task owns all hardware access and backoff sleeps; the cycle
//! controller only ever consumes the cache via `last_good`, so a slow or
//! wedged bus can never stall a control tick.  Overflow float switches are
//! deliberately NOT part of this layer: they are plain GPIO inputs read
//! directly by the cycle controller every tick and never cached.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::SensorError;
use crate::state::SharedState;

#[cfg(feature = "sim")]
use crate::sim::{MoistureSim, Scenario};

// ---------------------------------------------------------------------------
// Validation bounds
// ---------------------------------------------------------------------------

/// Largest value the 10-bit capacitance counter can legitimately produce.
/// Anything above this is bus corruption, not moisture.
const RAW_MAX: u16 = 1023;

/// Chirp probe operating range in °C.
const TEMP_MIN_C: f64 = -40.0;
const TEMP_MAX_C: f64 = 85.0;

// ---------------------------------------------------------------------------
// Source trait and specs
// ---------------------------------------------------------------------------

/// One measurement backend: real I2C bus, simulator, or nothing.
///
/// Implementations are synchronous; the async retry/backoff wrapper lives in
/// [`SensorReader`], which only ever calls these from the poller task.
pub trait SensorSource: Send {
    /// Read the raw 10-bit capacitance word from the probe at `addr`.
    fn read_capacitance(&mut self, addr: u16) -> Result<u16, SensorError>;

    /// Read the probe temperature in °C from the probe at `addr`.
    fn read_temperature(&mut self, addr: u16) -> Result<f64, SensorError>;

    /// Hint that the zone fed by the probe at `addr` is currently flooding.
    /// Real buses ignore this; the simulator uses it to close the loop.
    fn set_flooding(&mut self, _addr: u16, _active: bool) {}
}

/// What kind of measurement a [`SensorSpec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Moisture,
    Temperature,
}

/// Static description of one logical sensor channel.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Stable identifier, e.g. `moisture_20` / `temp_20`.
    pub id: String,
    pub kind: SensorKind,
    /// I2C address of the probe carrying this channel.
    pub addr: u16,
    /// Raw count in completely dry medium (calibration endpoint).
    pub raw_dry: u16,
    /// Raw count fully submerged (calibration endpoint).
    pub raw_wet: u16,
}

/// One validated, converted measurement.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub id: String,
    pub value: f64,
    pub unit: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Chirp I2C backend (real hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use chirp::ChirpBus;

#[cfg(feature = "gpio")]
mod chirp {
    use super::*;
    use rppal::i2c::I2c;
    use std::thread;

    // ── Chirp command registers ────────────────────────────────────────────
    //
    // The Chirp soil sensor speaks a minimal protocol: write a one-byte
    // command, give the firmware time to run the measurement, then read a
    // big-endian 16-bit result.
    //
    //   0x00  GET_CAPACITANCE   raw counts, 10-bit
    //   0x05  GET_TEMPERATURE   tenths of °C, signed

    const CMD_GET_CAPACITANCE: u8 = 0x00;
    const CMD_GET_TEMPERATURE: u8 = 0x05;

    /// Time for the firmware to complete a measurement before the result
    /// register is valid.
    const MEASURE_WAIT: Duration = Duration::from_millis(100);

    /// Real I2C bus talking to Chirp probes.
    pub struct ChirpBus {
        i2c: I2c,
    }

    impl ChirpBus {
        pub fn new() -> Result<Self, SensorError> {
            let i2c = I2c::new().map_err(|e| SensorError::Probe {
                id: "i2c".into(),
                detail: format!("bus open failed: {e}"),
            })?;
            Ok(Self { i2c })
        }

        fn read_word(&mut self, addr: u16, command: u8) -> Result<u16, SensorError> {
            self.i2c
                .set_slave_address(addr)
                .map_err(|e| probe_err(addr, e))?;
            self.i2c
                .write(&[command])
                .map_err(|e| probe_err(addr, e))?;
            thread::sleep(MEASURE_WAIT);
            let mut buf = [0u8; 2];
            self.i2c.read(&mut buf).map_err(|e| probe_err(addr, e))?;
            Ok(u16::from_be_bytes(buf))
        }
    }

    impl SensorSource for ChirpBus {
        fn read_capacitance(&mut self, addr: u16) -> Result<u16, SensorError> {
            self.read_word(addr, CMD_GET_CAPACITANCE)
        }

        fn read_temperature(&mut self, addr: u16) -> Result<f64, SensorError> {
            let word = self.read_word(addr, CMD_GET_TEMPERATURE)?;
            Ok(word as i16 as f64 / 10.0)
        }
    }
}

fn probe_err(addr: u16, e: impl fmt::Display) -> SensorError {
    SensorError::Probe {
        id: format!("0x{addr:02x}"),
        detail: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Simulator backend
// ---------------------------------------------------------------------------

/// Simulated bus mapping I2C addresses onto [`MoistureSim`] channels.
#[cfg(feature = "sim")]
pub struct SimSource {
    sim: MoistureSim,
    addrs: Vec<u16>,
    /// Probability of a whole read failing at the "bus" level, to exercise
    /// the retry path during development.
    fail_prob: f32,
}

#[cfg(feature = "sim")]
impl SimSource {
    pub fn new(scenario: Scenario, addrs: Vec<u16>, raw_dry: f64, raw_wet: f64) -> Self {
        let fail_prob = if scenario == Scenario::Flaky { 0.05 } else { 0.0 };
        let sim = MoistureSim::new(scenario, addrs.len(), raw_dry, raw_wet, 600.0);
        Self {
            sim,
            addrs,
            fail_prob,
        }
    }

    fn channel(&self, addr: u16) -> Result<usize, SensorError> {
        self.addrs
            .iter()
            .position(|&a| a == addr)
            .ok_or_else(|| probe_err(addr, "no simulated probe at this address"))
    }
}

#[cfg(feature = "sim")]
impl SensorSource for SimSource {
    fn read_capacitance(&mut self, addr: u16) -> Result<u16, SensorError> {
        let ch = self.channel(addr)?;
        if fastrand::f32() < self.fail_prob {
            return Err(probe_err(addr, "simulated bus error"));
        }
        Ok(self.sim.sample(ch))
    }

    fn read_temperature(&mut self, addr: u16) -> Result<f64, SensorError> {
        let ch = self.channel(addr)?;
        if fastrand::f32() < self.fail_prob {
            return Err(probe_err(addr, "simulated bus error"));
        }
        Ok(self.sim.sample_temperature(ch))
    }

    fn set_flooding(&mut self, addr: u16, active: bool) {
        if let Ok(ch) = self.channel(addr) {
            self.sim.set_flooding(ch, active);
        }
    }
}

/// Test-only source that never answers; tests seed the cache instead.
#[cfg(test)]
pub struct NullSource;

#[cfg(test)]
impl SensorSource for NullSource {
    fn read_capacitance(&mut self, addr: u16) -> Result<u16, SensorError> {
        Err(probe_err(addr, "null source"))
    }

    fn read_temperature(&mut self, addr: u16) -> Result<f64, SensorError> {
        Err(probe_err(addr, "null source"))
    }
}

/// Fallback for builds with neither `gpio` nor `sim`: every read fails.
#[cfg(not(any(feature = "gpio", feature = "sim")))]
pub struct NoopSource;

#[cfg(not(any(feature = "gpio", feature = "sim")))]
impl SensorSource for NoopSource {
    fn read_capacitance(&mut self, addr: u16) -> Result<u16, SensorError> {
        Err(probe_err(addr, "no sensor backend compiled in"))
    }

    fn read_temperature(&mut self, addr: u16) -> Result<f64, SensorError> {
        Err(probe_err(addr, "no sensor backend compiled in"))
    }
}

// ---------------------------------------------------------------------------
// Reader: retry, validation, conversion, cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    reading: Reading,
    at: Instant,
}

/// Retry/validation wrapper over a [`SensorSource`] plus a last-known-good
/// cache.
///
/// Both mutexes are plain `std::sync` locks and are never held across an
/// await point: the source lock is released before each backoff sleep.
pub struct SensorReader {
    source: Mutex<Box<dyn SensorSource>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Cache entries younger than this are returned without touching the bus.
    fresh_for: Duration,
    max_retries: u32,
    /// Backoff between attempts is `base_delay * attempt` (linear).
    base_delay: Duration,
}

impl SensorReader {
    pub fn new(
        source: Box<dyn SensorSource>,
        fresh_for: Duration,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            cache: Mutex::new(HashMap::new()),
            fresh_for,
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// Read one channel, retrying with linear backoff on failure.
    ///
    /// Returns the cached value if it is still fresh.  On total failure
    /// returns `None` and leaves the previous cache entry in place, so
    /// `last_good` keeps serving the stale-but-valid value.
    pub async fn read_with_retry(&self, spec: &SensorSpec) -> Option<Reading> {
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = cache.get(&spec.id) {
                if entry.at.elapsed() < self.fresh_for {
                    return Some(entry.reading.clone());
                }
            }
        }

        for attempt in 1..=self.max_retries {
            let result = {
                let mut source = self.source.lock().unwrap_or_else(|p| p.into_inner());
                match spec.kind {
                    SensorKind::Moisture => source
                        .read_capacitance(spec.addr)
                        .and_then(|raw| convert_moisture(spec, raw)),
                    SensorKind::Temperature => source
                        .read_temperature(spec.addr)
                        .and_then(|t| validate_temperature(spec, t)),
                }
            };

            match result {
                Ok((value, unit)) => {
                    let reading = Reading {
                        id: spec.id.clone(),
                        value,
                        unit,
                        ts: OffsetDateTime::now_utc(),
                    };
                    let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                    cache.insert(
                        spec.id.clone(),
                        CacheEntry {
                            reading: reading.clone(),
                            at: Instant::now(),
                        },
                    );
                    return Some(reading);
                }
                Err(e) => {
                    warn!(
                        sensor = %spec.id,
                        attempt,
                        max = self.max_retries,
                        "sensor read failed: {e}"
                    );
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.base_delay * attempt).await;
                    }
                }
            }
        }

        warn!(sensor = %spec.id, "all read attempts failed, keeping last known value");
        None
    }

    /// Most recent good reading for `id` and its age, regardless of
    /// freshness.  `None` means the channel has never produced a valid value.
    pub fn last_good(&self, id: &str) -> Option<(Reading, Duration)> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(id)
            .map(|entry| (entry.reading.clone(), entry.at.elapsed()))
    }

    /// Test hook: plant a cache entry as if it had been read `age` ago.
    #[cfg(test)]
    pub fn seed(&self, reading: Reading, age: Duration) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(
            reading.id.clone(),
            CacheEntry {
                reading,
                at: Instant::now() - age,
            },
        );
    }
}

/// Validate a raw capacitance word and convert it to percent moisture using
/// the zone's calibration endpoints.  Values beyond the endpoints clamp to
/// 0/100 rather than erroring: a slightly out-of-calibration probe is still
/// useful, a corrupt word is not.
fn convert_moisture(spec: &SensorSpec, raw: u16) -> Result<(f64, &'static str), SensorError> {
    if raw > RAW_MAX {
        return Err(SensorError::OutOfRange {
            id: spec.id.clone(),
            value: raw as f64,
            lo: 0.0,
            hi: RAW_MAX as f64,
        });
    }
    let dry = spec.raw_dry as f64;
    let wet = spec.raw_wet as f64;
    let pct = (dry - raw as f64) / (dry - wet) * 100.0;
    Ok((pct.clamp(0.0, 100.0), "%"))
}

fn validate_temperature(spec: &SensorSpec, t: f64) -> Result<(f64, &'static str), SensorError> {
    if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&t) {
        return Err(SensorError::OutOfRange {
            id: spec.id.clone(),
            value: t,
            lo: TEMP_MIN_C,
            hi: TEMP_MAX_C,
        });
    }
    Ok((t, "°C"))
}

// ---------------------------------------------------------------------------
// Poller task
// ---------------------------------------------------------------------------

/// Background sweep over all configured channels.
///
/// `zone_addrs` maps zone id → probe address so the sweep can tell the
/// source which probes sit in a currently-flooding zone (closed-loop sim).
pub async fn run_poller(
    reader: Arc<SensorReader>,
    specs: Vec<SensorSpec>,
    zone_addrs: Vec<(String, u16)>,
    every: Duration,
    shared: SharedState,
) {
    info!(
        channels = specs.len(),
        every_secs = every.as_secs(),
        "sensor poller started"
    );
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;

        // Mirror pump state into the source before sampling.
        let flooding: Vec<(u16, bool)> = {
            let st = shared.read().await;
            zone_addrs
                .iter()
                .filter_map(|(zone, addr)| {
                    st.zones.get(zone).map(|z| (*addr, z.pump_on))
                })
                .collect()
        };
        {
            let mut source = reader.source.lock().unwrap_or_else(|p| p.into_inner());
            for (addr, active) in flooding {
                source.set_flooding(addr, active);
            }
        }

        let mut readings = Vec::with_capacity(specs.len());
        for spec in &specs {
            if let Some(reading) = reader.read_with_retry(spec).await {
                readings.push(reading);
            }
        }

        let mut st = shared.write().await;
        st.record_readings(readings);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
