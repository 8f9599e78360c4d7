//! GPIO pin bank with logical on/off semantics. The `gpio` feature gates the
//! real rppal driver; without it, a mock backend records levels in memory and
//! lets tests inject input states and write failures.
//!
//! Callers only ever speak logical ON/OFF. Each pin carries a fixed polarity
//! from config, and the electrical mapping happens in one place here; nothing
//! above this module is allowed to reason about HIGH/LOW.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::error::HardwareError;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

// ---------------------------------------------------------------------------
// Pin description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Electrical level that expresses a logical state on this pin.
    fn level_for(self, on: bool) -> bool {
        match self {
            // active-low relay: LOW = ON, HIGH = OFF
            Polarity::ActiveLow => !on,
            Polarity::ActiveHigh => on,
        }
    }

    /// Logical state expressed by an electrical level on this pin.
    fn logical_from(self, level: bool) -> bool {
        match self {
            Polarity::ActiveLow => !level,
            Polarity::ActiveHigh => level,
        }
    }
}

/// One configured pin. Polarity is fixed here, at configuration time, and is
/// never re-derived at runtime.
#[derive(Debug, Clone, Copy)]
pub struct PinSpec {
    pub bcm: u8,
    pub direction: Direction,
    pub polarity: Polarity,
    /// Inputs only: enable the internal pull-up (float switches and buttons
    /// wired to ground want this).
    pub pull_up: bool,
}

impl PinSpec {
    pub fn output(bcm: u8, polarity: Polarity) -> Self {
        Self {
            bcm,
            direction: Direction::Output,
            polarity,
            pull_up: false,
        }
    }

    pub fn input_pullup(bcm: u8, polarity: Polarity) -> Self {
        Self {
            bcm,
            direction: Direction::Input,
            polarity,
            pull_up: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend capability interface
// ---------------------------------------------------------------------------

/// Raw electrical pin access. Exactly one backend is active per process;
/// everything above it is backend-agnostic.
pub trait GpioBackend: Send {
    fn claim_output(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError>;
    fn claim_input(&mut self, bcm: u8, pull_up: bool) -> Result<(), HardwareError>;
    fn write_level(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError>;
    fn read_level(&mut self, bcm: u8) -> Result<bool, HardwareError>;
    fn release_all(&mut self);
}

// ---------------------------------------------------------------------------
// Real backend (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
enum ClaimedPin {
    Out(OutputPin),
    In(InputPin),
}

#[cfg(feature = "gpio")]
pub struct RpiBackend {
    chip: Gpio,
    pins: HashMap<u8, ClaimedPin>,
}

#[cfg(feature = "gpio")]
impl RpiBackend {
    pub fn new() -> Result<Self, HardwareError> {
        let chip = Gpio::new().map_err(|e| HardwareError::Init(e.to_string()))?;
        Ok(Self {
            chip,
            pins: HashMap::new(),
        })
    }
}

#[cfg(feature = "gpio")]
impl GpioBackend for RpiBackend {
    fn claim_output(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError> {
        let pin = self.chip.get(bcm).map_err(|e| HardwareError::Io {
            bcm,
            detail: e.to_string(),
        })?;
        let out = if level {
            pin.into_output_high()
        } else {
            pin.into_output_low()
        };
        self.pins.insert(bcm, ClaimedPin::Out(out));
        Ok(())
    }

    fn claim_input(&mut self, bcm: u8, pull_up: bool) -> Result<(), HardwareError> {
        let pin = self.chip.get(bcm).map_err(|e| HardwareError::Io {
            bcm,
            detail: e.to_string(),
        })?;
        let inp = if pull_up {
            pin.into_input_pullup()
        } else {
            pin.into_input_pulldown()
        };
        self.pins.insert(bcm, ClaimedPin::In(inp));
        Ok(())
    }

    fn write_level(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError> {
        match self.pins.get_mut(&bcm) {
            Some(ClaimedPin::Out(pin)) => {
                if level {
                    pin.set_high();
                } else {
                    pin.set_low();
                }
                Ok(())
            }
            _ => Err(HardwareError::UnknownPin { bcm }),
        }
    }

    fn read_level(&mut self, bcm: u8) -> Result<bool, HardwareError> {
        match self.pins.get(&bcm) {
            Some(ClaimedPin::In(pin)) => Ok(pin.is_high()),
            Some(ClaimedPin::Out(pin)) => Ok(pin.is_set_high()),
            None => Err(HardwareError::UnknownPin { bcm }),
        }
    }

    fn release_all(&mut self) {
        // rppal resets pins to their default state on drop.
        self.pins.clear();
    }
}

// ---------------------------------------------------------------------------
// Mock backend (development and tests, no hardware)
// ---------------------------------------------------------------------------

/// Observable mock pin state. Tests reach in through a [`MockHandle`] to set
/// input levels and schedule write failures.
#[derive(Debug, Default)]
pub struct MockPins {
    /// Current electrical level per claimed pin.
    pub levels: HashMap<u8, bool>,
    /// Journal of every write, in order.
    pub writes: Vec<(u8, bool)>,
    /// Writes to these pins fail with an i/o error.
    pub fail_writes: Vec<u8>,
    /// Reads from these pins fail with an i/o error.
    pub fail_reads: Vec<u8>,
    pub released: bool,
}

impl MockPins {
    /// Set the electrical level of an input pin, as if the wire changed.
    pub fn drive_input(&mut self, bcm: u8, level: bool) {
        self.levels.insert(bcm, level);
    }
}

pub type MockHandle = Arc<Mutex<MockPins>>;

pub struct MockBackend {
    pins: MockHandle,
}

impl MockBackend {
    pub fn new() -> (Self, MockHandle) {
        let pins: MockHandle = Arc::default();
        (
            Self {
                pins: Arc::clone(&pins),
            },
            pins,
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockPins> {
        self.pins.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl GpioBackend for MockBackend {
    fn claim_output(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError> {
        let mut st = self.lock();
        st.levels.insert(bcm, level);
        Ok(())
    }

    fn claim_input(&mut self, bcm: u8, pull_up: bool) -> Result<(), HardwareError> {
        let mut st = self.lock();
        // An undriven input sits at its pull resistor's level.
        st.levels.insert(bcm, pull_up);
        Ok(())
    }

    fn write_level(&mut self, bcm: u8, level: bool) -> Result<(), HardwareError> {
        let mut st = self.lock();
        if st.fail_writes.contains(&bcm) {
            return Err(HardwareError::Io {
                bcm,
                detail: "injected write failure".into(),
            });
        }
        if !st.levels.contains_key(&bcm) {
            return Err(HardwareError::UnknownPin { bcm });
        }
        st.levels.insert(bcm, level);
        st.writes.push((bcm, level));
        Ok(())
    }

    fn read_level(&mut self, bcm: u8) -> Result<bool, HardwareError> {
        let st = self.lock();
        if st.fail_reads.contains(&bcm) {
            return Err(HardwareError::Io {
                bcm,
                detail: "injected read failure".into(),
            });
        }
        st.levels
            .get(&bcm)
            .copied()
            .ok_or(HardwareError::UnknownPin { bcm })
    }

    fn release_all(&mut self) {
        let mut st = self.lock();
        st.released = true;
        st.levels.clear();
    }
}

/// Build the backend this binary was compiled for.
#[cfg(feature = "gpio")]
pub fn default_backend() -> Result<Box<dyn GpioBackend>, HardwareError> {
    Ok(Box::new(RpiBackend::new()?))
}

#[cfg(not(feature = "gpio"))]
pub fn default_backend() -> Result<Box<dyn GpioBackend>, HardwareError> {
    let (backend, _pins) = MockBackend::new();
    info!("no gpio feature; using mock backend");
    Ok(Box::new(backend))
}

// ---------------------------------------------------------------------------
// Pin bank
// ---------------------------------------------------------------------------

/// The process-wide pin table. Shared behind `Arc` between the control loop,
/// the expiry scheduler, and the emergency path; every access is serialized
/// on one mutex.
pub struct GpioBank {
    inner: Mutex<BankInner>,
}

struct BankInner {
    backend: Box<dyn GpioBackend>,
    pins: HashMap<u8, PinSpec>,
    released: bool,
}

impl GpioBank {
    /// Claim every configured pin. Outputs come up in their logical OFF
    /// state before anything else can touch them.
    pub fn new(
        mut backend: Box<dyn GpioBackend>,
        specs: &[PinSpec],
    ) -> Result<Self, HardwareError> {
        let mut pins = HashMap::new();
        for spec in specs {
            match spec.direction {
                Direction::Output => {
                    backend.claim_output(spec.bcm, spec.polarity.level_for(false))?
                }
                Direction::Input => backend.claim_input(spec.bcm, spec.pull_up)?,
            }
            pins.insert(spec.bcm, *spec);
        }
        info!(pins = pins.len(), "gpio bank initialised, outputs off");
        Ok(Self {
            inner: Mutex::new(BankInner {
                backend,
                pins,
                released: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BankInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drive an output pin to a logical state.
    pub fn set_pin(&self, bcm: u8, on: bool) -> Result<(), HardwareError> {
        let mut st = self.lock();
        if st.released {
            return Err(HardwareError::Io {
                bcm,
                detail: "gpio bank released".into(),
            });
        }
        let spec = match st.pins.get(&bcm) {
            Some(s) if s.direction == Direction::Output => *s,
            _ => return Err(HardwareError::UnknownPin { bcm }),
        };
        st.backend.write_level(bcm, spec.polarity.level_for(on))
    }

    /// Read the logical state of a pin.
    pub fn read_pin(&self, bcm: u8) -> Result<bool, HardwareError> {
        let mut st = self.lock();
        if st.released {
            return Err(HardwareError::Io {
                bcm,
                detail: "gpio bank released".into(),
            });
        }
        let spec = match st.pins.get(&bcm) {
            Some(s) => *s,
            None => return Err(HardwareError::UnknownPin { bcm }),
        };
        let level = st.backend.read_level(bcm)?;
        Ok(spec.polarity.logical_from(level))
    }

    /// BCM numbers of every configured output.
    pub fn outputs(&self) -> Vec<u8> {
        let st = self.lock();
        let mut out: Vec<u8> = st
            .pins
            .values()
            .filter(|s| s.direction == Direction::Output)
            .map(|s| s.bcm)
            .collect();
        out.sort_unstable();
        out
    }

    /// Force every output to logical OFF and release the pins. Idempotent and
    /// safe to call from error paths; per-pin write failures are logged and
    /// do not stop the sweep.
    pub fn cleanup(&self) {
        let mut st = self.lock();
        if st.released {
            return;
        }
        let outputs: Vec<PinSpec> = st
            .pins
            .values()
            .filter(|s| s.direction == Direction::Output)
            .copied()
            .collect();
        for spec in outputs {
            if let Err(e) = st
                .backend
                .write_level(spec.bcm, spec.polarity.level_for(false))
            {
                warn!(bcm = spec.bcm, "cleanup: failed to drive output off: {e}");
            }
        }
        st.backend.release_all();
        st.released = true;
        info!("gpio bank cleaned up");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
