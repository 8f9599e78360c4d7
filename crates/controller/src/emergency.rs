//! Emergency shutdown: latch the system, force every pump off, fault every
//! zone, and report exactly what happened.
//!
//! Triggered by the hardware e-stop button (via the control loop) or by
//! `POST /api/estop`.  The sequence is deliberate:
//!
//! 1. latch, so nothing can start while we work
//! 2. force each configured pump pin off, each independently
//! 3. fault every zone
//!
//! Per-pin failures are collected, never allowed to abort the sweep.  The
//! latch only ever clears on an explicit operator request, and clearing it
//! does not un-fault zones; each one needs its own reset.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::cycle::{CycleCtx, ZoneCycle, ZonePhase, ZoneRuntime};
use crate::state::Severity;

/// Result of trying to force one pump off.
#[derive(Debug, Clone, Serialize)]
pub struct PumpShutdown {
    pub zone_id: String,
    pub bcm: u8,
    pub ok: bool,
}

/// What an emergency shutdown did, returned to the API caller.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencySnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub reason: String,
    pub pumps: Vec<PumpShutdown>,
    pub zones_faulted: Vec<String>,
    pub failures: Vec<String>,
}

/// Latch, force all pumps off, fault all zones.  Safe to call repeatedly;
/// the end state is the same.
pub async fn shutdown_all(
    reason: &str,
    ctx: &CycleCtx,
    zones: &[ZoneRuntime],
) -> EmergencySnapshot {
    error!(reason, "EMERGENCY SHUTDOWN");

    let tracked = ctx.safety.trigger_emergency_stop(reason);
    if !tracked.is_empty() {
        warn!(running = tracked.len(), "pumps were running at shutdown");
    }

    let mut pumps = Vec::with_capacity(zones.len());
    let mut failures = Vec::new();
    for zone in zones {
        let ok = match ctx.gpio.set_pin(zone.pump_bcm, false) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    zone = %zone.zone_id,
                    bcm = zone.pump_bcm,
                    "failed to force pump off: {e}"
                );
                failures.push(format!("zone {}: {e}", zone.zone_id));
                false
            }
        };
        pumps.push(PumpShutdown {
            zone_id: zone.zone_id.clone(),
            bcm: zone.pump_bcm,
            ok,
        });
    }

    let mut zones_faulted = Vec::with_capacity(zones.len());
    {
        let mut cycles = ctx.cycles.lock().await;
        for zone in zones {
            let cycle = cycles
                .entry(zone.zone_id.clone())
                .or_insert_with(ZoneCycle::new);
            cycle.phase = ZonePhase::Fault;
            zones_faulted.push(zone.zone_id.clone());
        }
    }

    let mut st = ctx.shared.write().await;
    for zone in zones {
        st.record_pump(&zone.zone_id, false);
        st.record_cycle_phase(
            &zone.zone_id,
            "fault",
            Severity::Warning,
            format!("zone {} faulted by emergency shutdown", zone.zone_id),
        );
    }
    st.emergency = true;
    st.record_safety(Severity::Critical, format!("emergency stop: {reason}"));

    EmergencySnapshot {
        ts: OffsetDateTime::now_utc(),
        reason: reason.to_string(),
        pumps,
        zones_faulted,
        failures,
    }
}

/// Operator acknowledgement.  Unlatches the gate; faulted zones stay faulted
/// until each is reset individually.
pub async fn clear(ctx: &CycleCtx) {
    ctx.safety.clear_emergency_stop();
    let mut st = ctx.shared.write().await;
    st.emergency = false;
    st.record_safety(
        Severity::Info,
        "emergency stop cleared; faulted zones await reset".to_string(),
    );
    info!("emergency latch cleared");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::new_cycle_map;
    use crate::gpio::{GpioBank, MockBackend, MockHandle, PinSpec, Polarity};
    use crate::safety::SafetyManager;
    use crate::sensor::{NullSource, SensorReader};
    use std::sync::Arc;
    use std::time::Duration;

    fn zone(id: &str, pump: u8, float: u8) -> ZoneRuntime {
        ZoneRuntime {
            zone_id: id.to_string(),
            name: format!("Zone {id}"),
            pump_bcm: pump,
            overflow_bcm: float,
            sensor_id: format!("moisture_{id}"),
            moisture_low_pct: 40.0,
            flood: Duration::from_secs(300),
            drain: Duration::from_secs(600),
            pump_timeout: Duration::from_secs(600),
            flood_retry_cap: 3,
            stale_after: Duration::from_secs(120),
        }
    }

    async fn harness() -> (CycleCtx, MockHandle, Vec<ZoneRuntime>) {
        let (backend, handle) = MockBackend::new();
        let gpio = Arc::new(
            GpioBank::new(
                Box::new(backend),
                &[
                    PinSpec::output(18, Polarity::ActiveHigh),
                    PinSpec::output(19, Polarity::ActiveHigh),
                    PinSpec::input_pullup(21, Polarity::ActiveLow),
                    PinSpec::input_pullup(22, Polarity::ActiveLow),
                ],
            )
            .unwrap(),
        );
        let shared = crate::state::new_shared();
        {
            let mut st = shared.write().await;
            st.init_zone("z1", "Zone z1", 18);
            st.init_zone("z2", "Zone z2", 19);
        }
        let ctx = CycleCtx {
            gpio,
            safety: Arc::new(SafetyManager::new(Duration::from_secs(30))),
            reader: Arc::new(SensorReader::new(
                Box::new(NullSource),
                Duration::from_secs(5),
                3,
                Duration::from_millis(250),
            )),
            cycles: new_cycle_map(),
            shared,
        };
        let zones = vec![zone("z1", 18, 21), zone("z2", 19, 22)];
        (ctx, handle, zones)
    }

    #[tokio::test]
    async fn shutdown_forces_all_pumps_and_faults_all_zones() {
        let (ctx, handle, zones) = harness().await;
        ctx.gpio.set_pin(18, true).unwrap();
        ctx.gpio.set_pin(19, true).unwrap();
        ctx.safety
            .register_pump_start("z1", 18, Duration::from_secs(600));

        let snapshot = shutdown_all("test", &ctx, &zones).await;

        assert!(ctx.safety.emergency_latched());
        assert_eq!(snapshot.pumps.len(), 2);
        assert!(snapshot.pumps.iter().all(|p| p.ok));
        assert!(snapshot.failures.is_empty());
        assert_eq!(snapshot.zones_faulted, vec!["z1", "z2"]);

        let pins = handle.lock().unwrap();
        assert_eq!(pins.levels[&18], false);
        assert_eq!(pins.levels[&19], false);
        drop(pins);

        let cycles = ctx.cycles.lock().await;
        assert!(matches!(cycles["z1"].phase, ZonePhase::Fault));
        assert!(matches!(cycles["z2"].phase, ZonePhase::Fault));
        drop(cycles);

        let st = ctx.shared.read().await;
        assert!(st.emergency);
        assert!(!st.zones["z1"].pump_on);
        assert_eq!(st.zones["z1"].phase, "fault");
        // Newest event is the critical shutdown record.
        let status = st.to_status();
        assert_eq!(status.events[0].severity, Severity::Critical);
        assert!(status.events[0].detail.contains("emergency stop: test"));
    }

    #[tokio::test]
    async fn one_bad_pin_does_not_stop_the_sweep() {
        let (ctx, handle, zones) = harness().await;
        handle.lock().unwrap().fail_writes.push(18);
        ctx.gpio.set_pin(19, true).unwrap();

        let snapshot = shutdown_all("test", &ctx, &zones).await;

        // z1's pin failed, z2's still got forced off.
        assert_eq!(snapshot.failures.len(), 1);
        assert!(snapshot.failures[0].contains("z1"));
        let by_zone: Vec<bool> = snapshot.pumps.iter().map(|p| p.ok).collect();
        assert_eq!(by_zone, vec![false, true]);
        assert_eq!(handle.lock().unwrap().levels[&19], false);

        // Both zones fault regardless.
        let cycles = ctx.cycles.lock().await;
        assert!(matches!(cycles["z1"].phase, ZonePhase::Fault));
        assert!(matches!(cycles["z2"].phase, ZonePhase::Fault));
    }

    #[tokio::test]
    async fn shutdown_twice_lands_in_the_same_state() {
        let (ctx, _handle, zones) = harness().await;
        shutdown_all("first", &ctx, &zones).await;
        let snapshot = shutdown_all("second", &ctx, &zones).await;

        assert!(ctx.safety.emergency_latched());
        assert_eq!(snapshot.zones_faulted.len(), 2);
        let st = ctx.shared.read().await;
        assert!(st.emergency);
    }

    #[tokio::test]
    async fn clear_unlatches_but_zones_stay_faulted() {
        let (ctx, _handle, zones) = harness().await;
        shutdown_all("test", &ctx, &zones).await;

        clear(&ctx).await;

        assert!(!ctx.safety.emergency_latched());
        let st = ctx.shared.read().await;
        assert!(!st.emergency);
        drop(st);

        let cycles = ctx.cycles.lock().await;
        assert!(matches!(cycles["z1"].phase, ZonePhase::Fault));
        assert!(matches!(cycles["z2"].phase, ZonePhase::Fault));
    }
}
