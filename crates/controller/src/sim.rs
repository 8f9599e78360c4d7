//! Stateful moisture sensor simulator for local development.
//!
//! Models realistic capacitive probe behaviour on the Chirp 10-bit scale
//! (raw counts 0-1023, wetter = lower):
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading electronic noise
//! - Occasional spikes (sensor flakiness)
//! - Diurnal (day/night) cycle
//! - Per-channel calibration offsets
//! - Closed-loop flooding response (readings get wetter while the zone's
//!   pump is on)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry.  Moderate noise.  ~3% spike
    /// rate.  Will eventually cross a 40% threshold and trigger flooding.
    Drying,
    /// Hovers near the centre.  Low noise, rare spikes.  Good for watching
    /// the status surface without triggering cycles.
    Stable,
    /// High noise sigma, ~10% spike rate, larger spike magnitude.  Tests the
    /// retry/validation path.
    Flaky,
    /// Starts near the wet end.  Very slow drying.  Tests that the cycle
    /// controller correctly does nothing when moisture is adequate.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// Internal state for a single simulated probe.
struct ChannelState {
    /// Current "true" soil moisture in raw counts.  Evolves each tick.
    base: f64,
    /// Permanent per-probe calibration offset (raw counts).  Two probes in
    /// the same bench will not read identically.
    offset: f64,
    /// Per-probe noise sigma (raw counts).
    noise_sigma: f64,
    /// Whether this channel's zone is currently flooding.
    flooding: bool,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing realistic Chirp capacitance readings.
pub struct MoistureSim {
    channels: Vec<ChannelState>,

    // Calibration endpoints (raw counts; match the zone config)
    raw_dry: f64,
    raw_wet: f64,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    // Spike parameters
    spike_prob: f32,
    spike_sigma: f64,

    // Diurnal cycle
    diurnal_amplitude: f64,
    diurnal_period_s: f64,

    // Flooding response
    wet_rate: f64,
}

impl MoistureSim {
    /// Create a new simulator for `channel_count` probes.
    ///
    /// `raw_dry` / `raw_wet` should match the calibration endpoints in the
    /// zone config (typically 500 / 200 for a Chirp probe).
    ///
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(
        scenario: Scenario,
        channel_count: usize,
        raw_dry: f64,
        raw_wet: f64,
        diurnal_period_s: f64,
    ) -> Self {
        let range = raw_dry - raw_wet; // typically 300
        let center = (raw_dry + raw_wet) / 2.0; // ~350

        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                // start_frac: 0.0 = at raw_wet (wettest), 1.0 = at raw_dry (driest)
                Scenario::Drying => (0.3, 3.0, 0.02, 2.0, 0.03_f32, 40.0, 0.5),
                Scenario::Stable => (0.05, 1.2, 0.05, 1.0, 0.005, 20.0, 0.5),
                Scenario::Flaky => (0.2, 5.0, 0.02, 4.0, 0.10, 60.0, 0.5),
                Scenario::Wet => (0.06, 1.5, 0.02, 1.5, 0.02, 30.0, 0.2),
            };

        // Starting base in raw counts.  raw_wet + frac * range.
        let start_base = raw_wet + start_frac * range;

        // Per-channel: randomise initial base slightly and assign a permanent
        // calibration offset so probes diverge naturally.
        let channels = (0..channel_count)
            .map(|_| {
                let jitter = gaussian(0.0, range * 0.03); // +-~3% of range
                let offset = gaussian(0.0, range * 0.02); // permanent shift
                let channel_noise = noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3);
                ChannelState {
                    base: (start_base + jitter).clamp(raw_wet, raw_dry),
                    offset,
                    noise_sigma: channel_noise,
                    flooding: false,
                }
            })
            .collect();

        Self {
            channels,
            raw_dry,
            raw_wet,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center,
            spike_prob,
            spike_sigma,
            diurnal_amplitude: range * 0.06,
            diurnal_period_s,
            wet_rate: -6.0,
        }
    }

    /// Inform the simulator whether the zone feeding channel `index` is
    /// currently flooding.
    pub fn set_flooding(&mut self, index: usize, active: bool) {
        if let Some(ch) = self.channels.get_mut(index) {
            ch.flooding = active;
        }
    }

    /// Produce the next raw capacitance reading for the probe at `index`.
    ///
    /// Call this once per probe per sampling tick.  The internal base value
    /// evolves with each call, so the order and frequency of calls matters.
    pub fn sample(&mut self, index: usize) -> u16 {
        let ch = &mut self.channels[index];

        // -- Evolve the base value ----------------------------------------

        // Mean reversion: pull toward centre
        let pull = self.mean_reversion * (self.center - ch.base);

        // Random walk step
        let walk = gaussian(0.0, self.walk_sigma);

        // Drying drift (positive = toward raw_dry = drier)
        let drift = self.drift_per_sample;

        // Flooding effect (negative = toward raw_wet = wetter)
        let wet = if ch.flooding { self.wet_rate } else { 0.0 };

        ch.base = (ch.base + drift + pull + walk + wet)
            .clamp(self.raw_wet - 10.0, self.raw_dry + 10.0);

        // -- Build the instantaneous reading ------------------------------

        // Diurnal offset: sinusoidal, peaks at "afternoon" (period/2).
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = self.diurnal_amplitude * phase.sin();

        // Electronic noise
        let noise = gaussian(0.0, ch.noise_sigma);

        // Occasional spike (sensor flakiness)
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = ch.base + ch.offset + diurnal + noise + spike;

        // Clamp to the physically possible 10-bit range and round.
        reading.round().clamp(0.0, 1023.0) as u16
    }

    /// Simulated probe temperature in °C: room ambient plus a small diurnal
    /// swing and per-reading noise.
    pub fn sample_temperature(&mut self, index: usize) -> f64 {
        let ch = &self.channels[index];
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = 2.5 * phase.sin();
        gaussian(22.0 + ch.offset * 0.01, 0.3) + diurnal
    }

    /// Number of probe channels in this simulator.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
