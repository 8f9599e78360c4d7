//! Watering cycle controller: one state machine per zone.
//!
//! ```text
//!            moisture < threshold
//!   ┌──────┐  (and gate allows)   ┌───────┐  window done    ┌───────┐
//!   │ Idle │─────────────────────▶│ Flood │────or overflow─▶│ Drain │
//!   └──────┘                      └───────┘                 └───────┘
//!      ▲                              │                         │
//!      │  operator reset          deadline expired /            │ drain
//!      │                          pump stop failed              │ window
//!   ┌───────┐◀────────────────────────┘                         │ done
//!   │ Fault │                                                   ▼
//!   └───────┘◀─── emergency stop ──────────────────────────── Idle
//! ```
//!
//! The controller ticks once a second: heartbeat, e-stop button, then one
//! step per zone.  Overflow switches are read fresh every tick and mirrored
//! into the safety manager before any phase logic runs, so a float that
//! trips mid-flood cuts the pump within the same tick.
//!
//! Fault is terminal until an operator reset.  Drain is purely time based;
//! moisture readings are ignored until the zone is idle again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::emergency;
use crate::error::ControlError;
use crate::gpio::GpioBank;
use crate::safety::SafetyManager;
use crate::sensor::SensorReader;
use crate::state::{Severity, SharedState};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZonePhase {
    Idle,
    Flood { since: Instant },
    Drain { since: Instant },
    Fault,
}

fn phase_name(phase: &ZonePhase) -> &'static str {
    match phase {
        ZonePhase::Idle => "idle",
        ZonePhase::Flood { .. } => "flood",
        ZonePhase::Drain { .. } => "drain",
        ZonePhase::Fault => "fault",
    }
}

/// Mutable per-zone cycle state.
pub struct ZoneCycle {
    pub phase: ZonePhase,
    /// Consecutive failed pump starts.  Reset on success and on operator
    /// reset; distinct from the safety denial counter.
    pub flood_retries: u32,
}

impl ZoneCycle {
    pub fn new() -> Self {
        Self {
            phase: ZonePhase::Idle,
            flood_retries: 0,
        }
    }
}

impl Default for ZoneCycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Static per-zone parameters, resolved from config at boot.
#[derive(Debug, Clone)]
pub struct ZoneRuntime {
    pub zone_id: String,
    pub name: String,
    pub pump_bcm: u8,
    pub overflow_bcm: u8,
    /// Cache id of this zone's moisture channel.
    pub sensor_id: String,
    /// Start flooding when moisture drops below this percentage.
    pub moisture_low_pct: f64,
    pub flood: Duration,
    pub drain: Duration,
    /// Hard pump deadline handed to the safety manager on every start.
    pub pump_timeout: Duration,
    pub flood_retry_cap: u32,
    /// Readings older than this never trigger an automatic start.
    pub stale_after: Duration,
}

pub type CycleMap = Arc<tokio::sync::Mutex<HashMap<String, ZoneCycle>>>;

pub fn new_cycle_map() -> CycleMap {
    Arc::new(tokio::sync::Mutex::new(HashMap::new()))
}

/// Everything a tick (or a manual request) needs.  Lock order is always
/// cycles before shared; neither is ever held across a gpio wait.
#[derive(Clone)]
pub struct CycleCtx {
    pub gpio: Arc<GpioBank>,
    pub safety: Arc<SafetyManager>,
    pub reader: Arc<SensorReader>,
    pub cycles: CycleMap,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

pub async fn run(ctx: CycleCtx, zones: Vec<ZoneRuntime>, tick: Duration, estop_bcm: u8) {
    info!(
        zones = zones.len(),
        tick_ms = tick.as_millis() as u64,
        "cycle controller started"
    );
    let mut ticker = tokio::time::interval(tick);
    loop {
        ticker.tick().await;
        tick_once(&ctx, &zones, estop_bcm).await;
    }
}

/// One full control tick.  Split out from [`run`] so tests can drive time
/// explicitly.
pub async fn tick_once(ctx: &CycleCtx, zones: &[ZoneRuntime], estop_bcm: u8) {
    ctx.safety.heartbeat();

    // Hardware e-stop button: pressed and unreadable are treated the same.
    let pressed = match ctx.gpio.read_pin(estop_bcm) {
        Ok(p) => p,
        Err(e) => {
            error!(bcm = estop_bcm, "e-stop read failed, treating as pressed: {e}");
            true
        }
    };
    if pressed && !ctx.safety.emergency_latched() {
        emergency::shutdown_all("hardware e-stop button", ctx, zones).await;
        return;
    }

    for zone in zones {
        step_zone(ctx, zone).await;
    }
}

async fn step_zone(ctx: &CycleCtx, zone: &ZoneRuntime) {
    // Mirror the live overflow switch first; a read failure counts as
    // overflow so a broken float can never unlock a pump.
    let overflow = match ctx.gpio.read_pin(zone.overflow_bcm) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                zone = %zone.zone_id,
                bcm = zone.overflow_bcm,
                "overflow read failed, treating as active: {e}"
            );
            true
        }
    };
    if ctx.safety.set_overflow(&zone.zone_id, overflow) {
        let mut st = ctx.shared.write().await;
        st.record_overflow(&zone.zone_id, overflow);
    }

    let mut cycles = ctx.cycles.lock().await;
    let cycle = cycles
        .entry(zone.zone_id.clone())
        .or_insert_with(ZoneCycle::new);
    match cycle.phase {
        ZonePhase::Idle => handle_idle(ctx, zone, cycle).await,
        ZonePhase::Flood { since } => handle_flood(ctx, zone, cycle, since, overflow).await,
        ZonePhase::Drain { since } => handle_drain(ctx, zone, cycle, since).await,
        ZonePhase::Fault => {}
    }
}

// ---------------------------------------------------------------------------
// Phase handlers
// ---------------------------------------------------------------------------

async fn handle_idle(ctx: &CycleCtx, zone: &ZoneRuntime, cycle: &mut ZoneCycle) {
    let Some((reading, age)) = ctx.reader.last_good(&zone.sensor_id) else {
        // Nothing measured yet; wait for the poller.
        return;
    };
    if age > zone.stale_after {
        warn!(
            zone = %zone.zone_id,
            sensor = %zone.sensor_id,
            age_secs = age.as_secs(),
            "moisture reading stale, holding off automatic start"
        );
        return;
    }
    if reading.value >= zone.moisture_low_pct {
        return;
    }

    info!(
        zone = %zone.zone_id,
        moisture = reading.value,
        threshold = zone.moisture_low_pct,
        "moisture low, starting flood"
    );
    match start_flood(ctx, zone, cycle, "moisture low").await {
        Ok(()) => {}
        Err(ControlError::Denied(denial)) => {
            warn!(zone = %zone.zone_id, "automatic start denied: {denial}");
            let mut st = ctx.shared.write().await;
            st.record_denial(
                &zone.zone_id,
                format!("flood start denied for zone {}: {denial}", zone.zone_id),
            );
        }
        // Hardware failures were already logged and recorded by start_flood.
        Err(_) => {}
    }
}

async fn handle_flood(
    ctx: &CycleCtx,
    zone: &ZoneRuntime,
    cycle: &mut ZoneCycle,
    since: Instant,
    overflow: bool,
) {
    // The expiry scheduler got here first: the pin is already off and the
    // zone needs an operator.
    if ctx.safety.take_forced(&zone.zone_id) {
        cycle.phase = ZonePhase::Fault;
        let mut st = ctx.shared.write().await;
        st.record_pump(&zone.zone_id, false);
        st.record_cycle_phase(
            &zone.zone_id,
            "fault",
            Severity::Critical,
            format!(
                "zone {} pump deadline expired mid-flood, zone faulted",
                zone.zone_id
            ),
        );
        return;
    }

    // Overflow preempts the flood window.
    if overflow {
        warn!(zone = %zone.zone_id, "overflow during flood, stopping early");
        let _ = stop_flood(ctx, zone, cycle, "overflow").await;
        return;
    }

    if since.elapsed() >= zone.flood {
        let _ = stop_flood(ctx, zone, cycle, "flood window complete").await;
    }
}

async fn handle_drain(ctx: &CycleCtx, zone: &ZoneRuntime, cycle: &mut ZoneCycle, since: Instant) {
    if since.elapsed() < zone.drain {
        return;
    }
    cycle.phase = ZonePhase::Idle;
    let mut st = ctx.shared.write().await;
    st.record_cycle_complete(&zone.zone_id);
    st.record_cycle_phase(
        &zone.zone_id,
        "idle",
        Severity::Info,
        format!("zone {} cycle complete", zone.zone_id),
    );
}

// ---------------------------------------------------------------------------
// Start / stop primitives
// ---------------------------------------------------------------------------

/// Gate, energise, arm the deadline.  Shared by automatic and manual starts.
async fn start_flood(
    ctx: &CycleCtx,
    zone: &ZoneRuntime,
    cycle: &mut ZoneCycle,
    trigger: &str,
) -> Result<(), ControlError> {
    ctx.safety.check_pump_safety(&zone.zone_id)?;

    if let Err(e) = ctx.gpio.set_pin(zone.pump_bcm, true) {
        cycle.flood_retries += 1;
        // Best effort: make sure the pin is not left driving the pump.
        let _ = ctx.gpio.set_pin(zone.pump_bcm, false);
        error!(
            zone = %zone.zone_id,
            attempt = cycle.flood_retries,
            cap = zone.flood_retry_cap,
            "pump start failed: {e}"
        );
        let mut st = ctx.shared.write().await;
        st.record_safety(
            Severity::Warning,
            format!("pump start failed on zone {}: {e}", zone.zone_id),
        );
        if cycle.flood_retries >= zone.flood_retry_cap {
            cycle.phase = ZonePhase::Fault;
            st.record_cycle_phase(
                &zone.zone_id,
                "fault",
                Severity::Critical,
                format!(
                    "zone {} faulted after {} failed pump starts",
                    zone.zone_id, cycle.flood_retries
                ),
            );
        }
        return Err(e.into());
    }

    ctx.safety
        .register_pump_start(&zone.zone_id, zone.pump_bcm, zone.pump_timeout);
    cycle.phase = ZonePhase::Flood {
        since: Instant::now(),
    };
    cycle.flood_retries = 0;

    let mut st = ctx.shared.write().await;
    st.record_pump(&zone.zone_id, true);
    st.record_cycle_phase(
        &zone.zone_id,
        "flood",
        Severity::Info,
        format!("zone {} flooding ({trigger})", zone.zone_id),
    );
    Ok(())
}

/// Pin off first, then disarm the deadline.  If the off-write fails the
/// deadline stays armed so the expiry scheduler remains the backstop, and
/// the zone faults.
async fn stop_flood(
    ctx: &CycleCtx,
    zone: &ZoneRuntime,
    cycle: &mut ZoneCycle,
    why: &str,
) -> Result<(), ControlError> {
    match ctx.gpio.set_pin(zone.pump_bcm, false) {
        Ok(()) => {
            ctx.safety.register_pump_stop(&zone.zone_id);
            cycle.phase = ZonePhase::Drain {
                since: Instant::now(),
            };
            let mut st = ctx.shared.write().await;
            st.record_pump(&zone.zone_id, false);
            st.record_cycle_phase(
                &zone.zone_id,
                "drain",
                Severity::Info,
                format!("zone {} draining ({why})", zone.zone_id),
            );
            Ok(())
        }
        Err(e) => {
            error!(
                zone = %zone.zone_id,
                bcm = zone.pump_bcm,
                "PUMP STOP FAILED, deadline left armed as backstop: {e}"
            );
            cycle.phase = ZonePhase::Fault;
            let mut st = ctx.shared.write().await;
            st.record_cycle_phase(
                &zone.zone_id,
                "fault",
                Severity::Critical,
                format!("zone {} faulted: pump stop failed: {e}", zone.zone_id),
            );
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Manual operations (web API)
// ---------------------------------------------------------------------------

/// Operator-requested flood.  Only a zone sitting in Idle accepts it; the
/// full safety gate still applies.
pub async fn manual_start(ctx: &CycleCtx, zone: &ZoneRuntime) -> Result<(), ControlError> {
    let mut cycles = ctx.cycles.lock().await;
    let cycle = cycles
        .entry(zone.zone_id.clone())
        .or_insert_with(ZoneCycle::new);
    if !matches!(cycle.phase, ZonePhase::Idle) {
        return Err(ControlError::Busy {
            zone: zone.zone_id.clone(),
            phase: phase_name(&cycle.phase),
        });
    }
    let res = start_flood(ctx, zone, cycle, "manual start").await;
    if let Err(ControlError::Denied(denial)) = &res {
        let mut st = ctx.shared.write().await;
        st.record_denial(
            &zone.zone_id,
            format!("manual start denied for zone {}: {denial}", zone.zone_id),
        );
    }
    res
}

/// Operator-requested stop.  Ends the flood early and moves to Drain; a zone
/// not currently flooding rejects it.
pub async fn manual_stop(ctx: &CycleCtx, zone: &ZoneRuntime) -> Result<(), ControlError> {
    let mut cycles = ctx.cycles.lock().await;
    let cycle = cycles
        .entry(zone.zone_id.clone())
        .or_insert_with(ZoneCycle::new);
    if !matches!(cycle.phase, ZonePhase::Flood { .. }) {
        return Err(ControlError::Busy {
            zone: zone.zone_id.clone(),
            phase: phase_name(&cycle.phase),
        });
    }
    stop_flood(ctx, zone, cycle, "manual stop").await
}

/// Operator acknowledgement of a faulted zone.  Clears the retry counter and
/// returns the zone to Idle; cycle and denial counters are history and stay.
pub async fn reset_zone(ctx: &CycleCtx, zone_id: &str) -> Result<(), ControlError> {
    let mut cycles = ctx.cycles.lock().await;
    let cycle = cycles
        .entry(zone_id.to_string())
        .or_insert_with(ZoneCycle::new);
    if !matches!(cycle.phase, ZonePhase::Fault) {
        return Err(ControlError::Busy {
            zone: zone_id.to_string(),
            phase: phase_name(&cycle.phase),
        });
    }
    cycle.phase = ZonePhase::Idle;
    cycle.flood_retries = 0;
    // Scrub any forced-off flag left over from the fault.
    let _ = ctx.safety.take_forced(zone_id);

    info!(zone = %zone_id, "zone reset by operator");
    let mut st = ctx.shared.write().await;
    st.record_cycle_phase(
        zone_id,
        "idle",
        Severity::Info,
        format!("zone {zone_id} reset by operator"),
    );
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Denial;
    use crate::gpio::{GpioBank, MockBackend, MockHandle, PinSpec, Polarity};
    use crate::sensor::{NullSource, Reading};
    use time::OffsetDateTime;

    const PUMP: u8 = 18;
    const FLOAT: u8 = 21;
    const ESTOP: u8 = 25;

    struct Harness {
        ctx: CycleCtx,
        handle: MockHandle,
        zone: ZoneRuntime,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_timeout(Duration::from_secs(600)).await
        }

        async fn with_timeout(pump_timeout: Duration) -> Self {
            let (backend, handle) = MockBackend::new();
            let gpio = Arc::new(
                GpioBank::new(
                    Box::new(backend),
                    &[
                        PinSpec::output(PUMP, Polarity::ActiveHigh),
                        PinSpec::input_pullup(FLOAT, Polarity::ActiveLow),
                        PinSpec::input_pullup(ESTOP, Polarity::ActiveLow),
                    ],
                )
                .unwrap(),
            );
            let safety = Arc::new(SafetyManager::new(Duration::from_secs(30)));
            let reader = Arc::new(SensorReader::new(
                Box::new(NullSource),
                Duration::from_secs(5),
                3,
                Duration::from_millis(250),
            ));
            let shared = crate::state::new_shared();
            shared.write().await.init_zone("z1", "Test zone", PUMP);

            let ctx = CycleCtx {
                gpio,
                safety,
                reader,
                cycles: new_cycle_map(),
                shared,
            };
            let zone = ZoneRuntime {
                zone_id: "z1".into(),
                name: "Test zone".into(),
                pump_bcm: PUMP,
                overflow_bcm: FLOAT,
                sensor_id: "moisture_20".into(),
                moisture_low_pct: 40.0,
                flood: Duration::from_secs(300),
                drain: Duration::from_secs(600),
                pump_timeout,
                flood_retry_cap: 3,
                stale_after: Duration::from_secs(120),
            };
            Harness { ctx, handle, zone }
        }

        fn seed_moisture(&self, pct: f64, age: Duration) {
            self.ctx.reader.seed(
                Reading {
                    id: "moisture_20".into(),
                    value: pct,
                    unit: "%",
                    ts: OffsetDateTime::now_utc(),
                },
                age,
            );
        }

        async fn tick(&self) {
            tick_once(&self.ctx, std::slice::from_ref(&self.zone), ESTOP).await;
        }

        async fn phase(&self) -> &'static str {
            let cycles = self.ctx.cycles.lock().await;
            cycles
                .get("z1")
                .map(|c| phase_name(&c.phase))
                .unwrap_or("idle")
        }

        fn pump_level(&self) -> bool {
            self.handle.lock().unwrap().levels[&PUMP]
        }

        /// Drive the overflow float: `true` = tank overflowing (active-low
        /// switch pulls the line LOW).
        fn set_float(&self, active: bool) {
            self.handle.lock().unwrap().drive_input(FLOAT, !active);
        }

        fn press_estop(&self) {
            self.handle.lock().unwrap().drive_input(ESTOP, false);
        }

        async fn denials(&self) -> u64 {
            self.ctx.shared.read().await.zones["z1"].denials
        }
    }

    // ── Automatic starts ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn dry_soil_starts_flood() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;

        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());
        let st = h.ctx.shared.read().await;
        assert!(st.zones["z1"].pump_on);
        assert_eq!(st.zones["z1"].phase, "flood");
    }

    #[tokio::test(start_paused = true)]
    async fn wet_soil_stays_idle() {
        let h = Harness::new().await;
        h.seed_moisture(55.0, Duration::ZERO);
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        assert!(!h.pump_level());
    }

    #[tokio::test(start_paused = true)]
    async fn no_reading_means_no_start() {
        let h = Harness::new().await;
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        assert!(!h.pump_level());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reading_means_no_start() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::from_secs(130));
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        assert!(!h.pump_level());
    }

    // ── Full cycle ─────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn full_flood_drain_cycle() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);

        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());

        // Mid-flood ticks keep the pump on.
        tokio::time::advance(Duration::from_secs(150)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());

        // Flood window elapses.
        tokio::time::advance(Duration::from_secs(150)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "drain");
        assert!(!h.pump_level());

        // Drain is time based; a wet reading mid-drain changes nothing.
        h.seed_moisture(80.0, Duration::ZERO);
        tokio::time::advance(Duration::from_secs(300)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "drain");

        tokio::time::advance(Duration::from_secs(300)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "idle");

        let st = h.ctx.shared.read().await;
        assert_eq!(st.zones["z1"].cycles, 1);
        assert_eq!(st.zones["z1"].phase, "idle");

        // Soil is wet now, so the next tick stays idle.
        drop(st);
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
    }

    // ── Overflow ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn overflow_cuts_flood_within_one_tick() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;
        assert_eq!(h.phase().await, "flood");

        // Float trips 10 seconds into a 300 second window.
        tokio::time::advance(Duration::from_secs(10)).await;
        h.set_float(true);
        h.tick().await;

        assert_eq!(h.phase().await, "drain");
        assert!(!h.pump_level());
        let st = h.ctx.shared.read().await;
        assert!(st.zones["z1"].overflow);
        assert!(st
            .to_status()
            .events
            .iter()
            .any(|e| e.detail.contains("overflow detected")));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_lockout_blocks_the_next_start() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        h.set_float(true);
        h.tick().await;
        assert_eq!(h.phase().await, "drain");

        // Drain out; float still tripped, soil still dry: start is denied.
        tokio::time::advance(Duration::from_secs(600)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        assert!(!h.pump_level());
        assert_eq!(h.denials().await, 1);

        // Float clears; flood may start again.
        h.set_float(false);
        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_while_idle_denies_start() {
        let h = Harness::new().await;
        h.set_float(true);
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;

        assert_eq!(h.phase().await, "idle");
        assert!(!h.pump_level());
        assert_eq!(h.denials().await, 1);

        // A denial is not a start failure.
        let cycles = h.ctx.cycles.lock().await;
        assert_eq!(cycles["z1"].flood_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_float_counts_as_overflow() {
        let h = Harness::new().await;
        h.handle.lock().unwrap().fail_reads.push(FLOAT);
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;

        assert_eq!(h.phase().await, "idle");
        assert_eq!(h.denials().await, 1);
    }

    // ── Emergency stop ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn estop_button_faults_everything() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;
        assert_eq!(h.phase().await, "flood");

        h.press_estop();
        h.tick().await;

        assert_eq!(h.phase().await, "fault");
        assert!(!h.pump_level());
        let st = h.ctx.shared.read().await;
        assert!(st.emergency);
        drop(st);

        // Already latched: a second tick with the button held does not
        // shut down twice.
        h.tick().await;
        let st = h.ctx.shared.read().await;
        let shutdowns = st
            .to_status()
            .events
            .iter()
            .filter(|e| e.detail.contains("emergency stop"))
            .count();
        assert_eq!(shutdowns, 1);
        drop(st);

        // Manual start is denied while latched.
        let err = manual_start(&h.ctx, &h.zone).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Busy { .. } | ControlError::Denied(Denial::EmergencyLatched)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_estop_counts_as_pressed() {
        let h = Harness::new().await;
        h.handle.lock().unwrap().fail_reads.push(ESTOP);
        h.tick().await;
        assert!(h.ctx.safety.emergency_latched());
        assert_eq!(h.phase().await, "fault");
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_after_estop_needs_clear_and_reset() {
        let h = Harness::new().await;
        h.seed_moisture(30.0, Duration::ZERO);
        h.press_estop();
        h.tick().await;
        assert_eq!(h.phase().await, "fault");

        // Button released, latch cleared; the zone still needs its own reset.
        h.handle.lock().unwrap().drive_input(ESTOP, true);
        emergency::clear(&h.ctx).await;
        h.tick().await;
        assert_eq!(h.phase().await, "fault");

        reset_zone(&h.ctx, "z1").await.unwrap();
        assert_eq!(h.phase().await, "idle");
        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());
    }

    // ── Pump deadline ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_faults_the_zone() {
        let h = Harness::with_timeout(Duration::from_secs(10)).await;
        tokio::spawn(crate::safety::run_expiry_scheduler(
            h.ctx.safety.clone(),
            h.ctx.gpio.clone(),
            h.ctx.shared.clone(),
        ));

        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());

        // 10s deadline inside a 300s flood window: the scheduler fires first.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!h.pump_level(), "scheduler must have forced the pin off");

        h.tick().await;
        assert_eq!(h.phase().await, "fault");
        let st = h.ctx.shared.read().await;
        assert_eq!(st.zones["z1"].phase, "fault");
        assert!(st
            .to_status()
            .events
            .iter()
            .any(|e| e.severity == Severity::Critical && e.detail.contains("deadline expired")));
        drop(st);

        // Operator reset brings it back; the next start arms a fresh timer.
        reset_zone(&h.ctx, "z1").await.unwrap();
        h.tick().await;
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());
    }

    // ── Start failures ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn repeated_start_failures_fault_the_zone() {
        let h = Harness::new().await;
        h.handle.lock().unwrap().fail_writes.push(PUMP);
        h.seed_moisture(30.0, Duration::ZERO);

        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
        h.tick().await;
        assert_eq!(h.phase().await, "fault");

        assert!(!h.pump_level());
        let st = h.ctx.shared.read().await;
        let status = st.to_status();
        let warnings = status
            .events
            .iter()
            .filter(|e| e.detail.contains("pump start failed"))
            .count();
        assert_eq!(warnings, 3);
        assert!(status
            .events
            .iter()
            .any(|e| e.severity == Severity::Critical && e.detail.contains("failed pump starts")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_faults_and_leaves_deadline_armed() {
        let h = Harness::with_timeout(Duration::from_secs(400)).await;
        tokio::spawn(crate::safety::run_expiry_scheduler(
            h.ctx.safety.clone(),
            h.ctx.gpio.clone(),
            h.ctx.shared.clone(),
        ));
        h.seed_moisture(30.0, Duration::ZERO);
        h.tick().await;
        assert_eq!(h.phase().await, "flood");

        // Stop at the end of the window fails: the zone faults, and the
        // 400s deadline stays armed as the backstop.
        h.handle.lock().unwrap().fail_writes.push(PUMP);
        tokio::time::advance(Duration::from_secs(300)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "fault");
        assert!(h.pump_level(), "pin is stuck on");

        // Deadline fires at t=400; the injected failure is still in place,
        // but the scheduler must record the attempt.
        tokio::time::sleep(Duration::from_secs(150)).await;
        let st = h.ctx.shared.read().await;
        assert!(st
            .to_status()
            .events
            .iter()
            .any(|e| e.detail.contains("deadline expired")));
    }

    // ── Manual operations ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn manual_start_and_stop() {
        let h = Harness::new().await;
        h.seed_moisture(80.0, Duration::ZERO); // wet: no auto start

        manual_start(&h.ctx, &h.zone).await.unwrap();
        assert_eq!(h.phase().await, "flood");
        assert!(h.pump_level());

        let err = manual_start(&h.ctx, &h.zone).await.unwrap_err();
        assert!(matches!(err, ControlError::Busy { phase: "flood", .. }));

        manual_stop(&h.ctx, &h.zone).await.unwrap();
        assert_eq!(h.phase().await, "drain");
        assert!(!h.pump_level());

        let err = manual_stop(&h.ctx, &h.zone).await.unwrap_err();
        assert!(matches!(err, ControlError::Busy { phase: "drain", .. }));

        tokio::time::advance(Duration::from_secs(600)).await;
        h.tick().await;
        assert_eq!(h.phase().await, "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_start_respects_the_gate() {
        let h = Harness::new().await;
        h.ctx.safety.trigger_emergency_stop("test");

        let err = manual_start(&h.ctx, &h.zone).await.unwrap_err();
        assert_eq!(err, ControlError::Denied(Denial::EmergencyLatched));
        assert!(!h.pump_level());
        assert_eq!(h.denials().await, 1);

        let cycles = h.ctx.cycles.lock().await;
        assert_eq!(cycles["z1"].flood_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_requires_a_faulted_zone() {
        let h = Harness::new().await;
        let err = reset_zone(&h.ctx, "z1").await.unwrap_err();
        assert!(matches!(err, ControlError::Busy { phase: "idle", .. }));
    }

    // ── Watchdog refresh ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ticking_keeps_the_watchdog_fresh() {
        let h = Harness::new().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        h.tick().await;
        assert!(h.ctx.safety.check_pump_safety("z1").is_ok());
    }
}
