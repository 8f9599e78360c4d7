//! Error types for the control core.
//!
//! `Denial` is deliberately not lumped in with the hardware and sensor
//! errors: a refused pump request is a safety decision, logged and surfaced
//! with its reason, while the error types describe faults the caller must
//! react to.

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

/// GPIO-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HardwareError {
    /// The pin was never configured in this bank, or the operation does not
    /// apply to its direction (e.g. writing an input pin).
    #[error("gpio {bcm} is not configured for this operation")]
    UnknownPin { bcm: u8 },

    /// The underlying driver failed to read or write the pin.
    #[error("gpio {bcm} i/o failure: {detail}")]
    Io { bcm: u8, detail: String },

    /// The GPIO driver itself could not be brought up.
    #[error("gpio driver init failed: {0}")]
    Init(String),
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Failures while producing a single sensor reading. Each one costs a retry
/// attempt; none of them crash the control loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    /// The raw or converted value fell outside the plausible range for the
    /// sensor kind.
    #[error("sensor {id}: value {value} outside [{lo}, {hi}]")]
    OutOfRange {
        id: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    /// The bus transaction itself failed.
    #[error("sensor {id}: probe failed: {detail}")]
    Probe { id: String, detail: String },
}

// ---------------------------------------------------------------------------
// Safety denials
// ---------------------------------------------------------------------------

/// Why a pump request was refused. Always logged at warn with the reason;
/// never retried automatically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Denial {
    /// The sticky emergency latch is set; only an operator clear releases it.
    #[error("emergency stop latched")]
    EmergencyLatched,

    /// A float switch reported (or failed to report) high water in this zone.
    #[error("overflow lockout on zone {zone}")]
    OverflowLockout { zone: String },

    /// The control loop has not heartbeated within the watchdog window, so
    /// nothing new is allowed to start.
    #[error("watchdog stale ({age_sec}s since last heartbeat)")]
    WatchdogStale { age_sec: u64 },
}

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

/// Outcome of an operator request (HTTP control surface or button).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Denied(#[from] Denial),

    /// The zone is not in a phase where the request makes sense.
    #[error("zone {zone} is {phase}; request rejected")]
    Busy { zone: String, phase: &'static str },

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

// ===========================================================================
// Tests
// ===========================================================================
