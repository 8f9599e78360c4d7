//! Safety arbitration: every pump start passes through here.
//!
//! ```text
//!   start request ──▶ emergency latch ──▶ overflow lockout ──▶ watchdog ──▶ OK
//!                        (sticky)           (per zone)          (stale?)
//! ```
//!
//! Three independent gates, checked in that order; the first one that trips
//! wins.  A refusal is a [`Denial`], which is a decision, not a fault.
//!
//! Separately, every running pump carries a hard deadline.  Deadlines live in
//! a min-heap serviced by [`run_expiry_scheduler`], a dedicated task that
//! forces the pin off when a deadline passes, independently of the control
//! loop.  Replacing a timer bumps a per-zone generation counter so stale heap
//! entries are ignored rather than hunted down.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::Denial;
use crate::gpio::GpioBank;
use crate::state::{HostHealth, Severity, SharedState};

/// Hard ceiling on any single pump run.  Requests above this are clamped,
/// never honoured.
pub const MAX_PUMP_TIMEOUT: Duration = Duration::from_secs(600);

/// Host alarm thresholds, checked by the resource monitor.
const MEM_WARN_PCT: f32 = 90.0;
const CPU_WARN_PCT: f32 = 95.0;

// ---------------------------------------------------------------------------
// Timer bookkeeping
// ---------------------------------------------------------------------------

struct PumpTimer {
    bcm: u8,
    started: Instant,
    deadline: Instant,
    gen: u64,
}

/// Heap entry; ordered by deadline first so `Reverse` gives a min-heap.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    deadline: Instant,
    gen: u64,
    zone: String,
}

struct SafetyInner {
    /// Currently armed timers, one per zone.
    pumps: HashMap<String, PumpTimer>,
    heap: BinaryHeap<Reverse<Expiry>>,
    next_gen: u64,
    /// Zones whose overflow switch is currently active.
    overflow: HashSet<String>,
    /// Zones whose pump the scheduler forced off, awaiting pickup by the
    /// cycle controller via `take_forced`.
    forced: HashSet<String>,
}

// ---------------------------------------------------------------------------
// Safety manager
// ---------------------------------------------------------------------------

pub struct SafetyManager {
    estop: AtomicBool,
    /// Millis since `epoch` of the last control-loop heartbeat.
    heartbeat_ms: AtomicU64,
    epoch: Instant,
    watchdog: Duration,
    inner: Mutex<SafetyInner>,
    /// Pokes the expiry scheduler whenever the deadline set changes.
    expiry_wake: Notify,
}

impl SafetyManager {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            estop: AtomicBool::new(false),
            heartbeat_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            watchdog,
            inner: Mutex::new(SafetyInner {
                pumps: HashMap::new(),
                heap: BinaryHeap::new(),
                next_gen: 0,
                overflow: HashSet::new(),
                forced: HashSet::new(),
            }),
            expiry_wake: Notify::new(),
        }
    }

    // ── Heartbeat / watchdog ───────────────────────────────────────────────

    /// Called by the control loop once per tick.
    pub fn heartbeat(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.heartbeat_ms.store(ms, Ordering::SeqCst);
    }

    pub fn heartbeat_age(&self) -> Duration {
        let last = Duration::from_millis(self.heartbeat_ms.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }

    // ── Emergency latch ────────────────────────────────────────────────────

    pub fn emergency_latched(&self) -> bool {
        self.estop.load(Ordering::SeqCst)
    }

    /// Latch the emergency stop and disarm every pump timer.
    ///
    /// Returns the pumps that were tracked as running so the caller can force
    /// their pins off.  Latching an already-latched manager is harmless.
    pub fn trigger_emergency_stop(&self, reason: &str) -> Vec<(String, u8)> {
        let was_latched = self.estop.swap(true, Ordering::SeqCst);

        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let tracked: Vec<(String, u8)> = guard
            .pumps
            .iter()
            .map(|(zone, timer)| (zone.clone(), timer.bcm))
            .collect();
        guard.pumps.clear();
        guard.heap.clear();
        guard.forced.clear();
        drop(guard);

        self.expiry_wake.notify_one();
        if !was_latched {
            warn!(reason, "EMERGENCY STOP latched");
        }
        tracked
    }

    /// Operator acknowledgement; the latch never clears on its own.
    pub fn clear_emergency_stop(&self) {
        self.estop.store(false, Ordering::SeqCst);
        info!("emergency stop cleared by operator");
    }

    // ── Overflow lockout ───────────────────────────────────────────────────

    /// Mirror the live overflow switch for a zone.  Returns true when the
    /// lockout state actually changed.
    pub fn set_overflow(&self, zone: &str, active: bool) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let changed = if active {
            guard.overflow.insert(zone.to_string())
        } else {
            guard.overflow.remove(zone)
        };
        drop(guard);
        if changed {
            if active {
                warn!(zone, "overflow lockout set");
            } else {
                info!(zone, "overflow lockout cleared");
            }
        }
        changed
    }

    // ── The gate ───────────────────────────────────────────────────────────

    /// May a pump start in `zone` right now?
    pub fn check_pump_safety(&self, zone: &str) -> Result<(), Denial> {
        if self.emergency_latched() {
            return Err(Denial::EmergencyLatched);
        }
        {
            let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if guard.overflow.contains(zone) {
                return Err(Denial::OverflowLockout {
                    zone: zone.to_string(),
                });
            }
        }
        let age = self.heartbeat_age();
        if age > self.watchdog {
            return Err(Denial::WatchdogStale {
                age_sec: age.as_secs(),
            });
        }
        Ok(())
    }

    // ── Timer registration ─────────────────────────────────────────────────

    /// Arm (or re-arm) the hard deadline for a zone's pump.  A second start
    /// for the same zone replaces the old timer rather than stacking a second
    /// one.  Returns the effective (possibly clamped) timeout.
    pub fn register_pump_start(&self, zone: &str, bcm: u8, timeout: Duration) -> Duration {
        let timeout = timeout.min(MAX_PUMP_TIMEOUT);
        let now = Instant::now();
        let deadline = now + timeout;

        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.next_gen += 1;
        let gen = guard.next_gen;
        guard.pumps.insert(
            zone.to_string(),
            PumpTimer {
                bcm,
                started: now,
                deadline,
                gen,
            },
        );
        guard.forced.remove(zone);
        guard.heap.push(Reverse(Expiry {
            deadline,
            gen,
            zone: zone.to_string(),
        }));
        drop(guard);

        self.expiry_wake.notify_one();
        info!(
            zone,
            bcm,
            timeout_secs = timeout.as_secs(),
            "pump deadline armed"
        );
        timeout
    }

    /// Disarm the deadline after an orderly stop.  Returns how long the pump
    /// ran, or `None` if no timer was armed.
    pub fn register_pump_stop(&self, zone: &str) -> Option<Duration> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let timer = guard.pumps.remove(zone)?;
        drop(guard);

        self.expiry_wake.notify_one();
        let runtime = timer.started.elapsed();
        info!(zone, runtime_secs = runtime.as_secs(), "pump deadline disarmed");
        Some(runtime)
    }

    /// Did the scheduler force this zone's pump off?  Consumes the flag.
    pub fn take_forced(&self, zone: &str) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.forced.remove(zone)
    }

    /// Time left until the forced stop of a zone's running pump.  `None`
    /// when no timer is armed.
    pub fn remaining(&self, zone: &str) -> Option<Duration> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let timer = guard.pumps.get(zone)?;
        Some(timer.deadline.saturating_duration_since(Instant::now()))
    }

    // ── Scheduler plumbing ─────────────────────────────────────────────────

    /// Earliest live deadline, skimming heap entries orphaned by timer
    /// replacement along the way.
    fn next_deadline(&self) -> Option<Instant> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let inner = &mut *guard;
        loop {
            let (deadline, live) = match inner.heap.peek() {
                Some(Reverse(exp)) => (
                    exp.deadline,
                    inner.pumps.get(&exp.zone).map(|t| t.gen) == Some(exp.gen),
                ),
                None => return None,
            };
            if live {
                return Some(deadline);
            }
            inner.heap.pop();
        }
    }

    /// Pop every deadline at or before `now`, marking the zones as forced.
    /// Stale entries (replaced or disarmed timers) are discarded silently.
    fn collect_due(&self, now: Instant) -> Vec<(String, u8)> {
        let mut due = Vec::new();
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let inner = &mut *guard;
        loop {
            match inner.heap.peek() {
                Some(Reverse(exp)) if exp.deadline <= now => {}
                _ => break,
            }
            let Some(Reverse(exp)) = inner.heap.pop() else {
                break;
            };
            let live = inner.pumps.get(&exp.zone).map(|t| t.gen) == Some(exp.gen);
            if !live {
                continue;
            }
            if let Some(timer) = inner.pumps.remove(&exp.zone) {
                inner.forced.insert(exp.zone.clone());
                due.push((exp.zone, timer.bcm));
            }
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Expiry scheduler task
// ---------------------------------------------------------------------------

/// Sleep until the earliest pump deadline and force the pin off when it
/// passes.  Runs forever; re-arms whenever the deadline set changes.
///
/// This is the backstop that does NOT trust the control loop: even if every
/// other task is wedged, an expired pump gets turned off here.
pub async fn run_expiry_scheduler(
    safety: Arc<SafetyManager>,
    gpio: Arc<GpioBank>,
    shared: SharedState,
) {
    info!("pump expiry scheduler started");
    loop {
        match safety.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = safety.expiry_wake.notified() => continue,
                }
            }
            None => {
                safety.expiry_wake.notified().await;
                continue;
            }
        }

        for (zone, bcm) in safety.collect_due(Instant::now()) {
            warn!(zone = %zone, bcm, "pump deadline expired, forcing off");
            if let Err(e) = gpio.set_pin(bcm, false) {
                error!(zone = %zone, bcm, "failed to force pump off: {e}");
            }
            let mut st = shared.write().await;
            st.record_safety(
                Severity::Critical,
                format!("pump deadline expired on zone {zone}, forced off"),
            );
            st.record_pump(&zone, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Host resource monitor
// ---------------------------------------------------------------------------

/// Periodically sample host memory and CPU into the shared state, warning
/// when either crosses its alarm threshold.
pub async fn run_resource_monitor(shared: SharedState, every: Duration) {
    let mut sys = sysinfo::System::new();
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        sys.refresh_all();

        let total = sys.total_memory();
        let mem_pct = if total > 0 {
            sys.used_memory() as f32 / total as f32 * 100.0
        } else {
            0.0
        };
        let cpu_pct = sys.global_cpu_usage();

        let mut st = shared.write().await;
        st.host = HostHealth { mem_used_pct: mem_pct, cpu_pct };
        if mem_pct > MEM_WARN_PCT {
            warn!(mem_pct, "host memory usage high");
            st.record_safety(
                Severity::Warning,
                format!("host memory usage at {mem_pct:.0}%"),
            );
        }
        if cpu_pct > CPU_WARN_PCT {
            warn!(cpu_pct, "host cpu usage high");
            st.record_safety(Severity::Warning, format!("host cpu usage at {cpu_pct:.0}%"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{MockBackend, PinSpec, Polarity};

    fn manager() -> SafetyManager {
        SafetyManager::new(Duration::from_secs(30))
    }

    // ── Gate behaviour ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_manager_allows_pump_starts() {
        let safety = manager();
        safety.heartbeat();
        assert!(safety.check_pump_safety("z1").is_ok());
    }

    #[tokio::test]
    async fn emergency_latch_denies_until_cleared() {
        let safety = manager();
        safety.heartbeat();

        safety.trigger_emergency_stop("test");
        assert_eq!(
            safety.check_pump_safety("z1"),
            Err(Denial::EmergencyLatched)
        );
        // Still latched on a later check, no matter how much time passes.
        assert!(safety.emergency_latched());
        assert_eq!(
            safety.check_pump_safety("z2"),
            Err(Denial::EmergencyLatched)
        );

        safety.clear_emergency_stop();
        assert!(safety.check_pump_safety("z1").is_ok());
    }

    #[tokio::test]
    async fn overflow_lockout_is_per_zone() {
        let safety = manager();
        safety.heartbeat();

        assert!(safety.set_overflow("z1", true));
        assert!(!safety.set_overflow("z1", true), "no change, same state");

        assert_eq!(
            safety.check_pump_safety("z1"),
            Err(Denial::OverflowLockout { zone: "z1".into() })
        );
        assert!(safety.check_pump_safety("z2").is_ok());

        assert!(safety.set_overflow("z1", false));
        assert!(safety.check_pump_safety("z1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_heartbeat_denies() {
        let safety = manager();
        safety.heartbeat();
        assert!(safety.check_pump_safety("z1").is_ok());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            safety.check_pump_safety("z1"),
            Err(Denial::WatchdogStale { age_sec: 31 })
        );

        // A fresh heartbeat restores service.
        safety.heartbeat();
        assert!(safety.check_pump_safety("z1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_takes_precedence_over_other_gates() {
        let safety = manager();
        safety.set_overflow("z1", true);
        tokio::time::advance(Duration::from_secs(60)).await;
        safety.trigger_emergency_stop("test");

        // All three gates would deny; the latch reports first.
        assert_eq!(
            safety.check_pump_safety("z1"),
            Err(Denial::EmergencyLatched)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_age_tracks_time() {
        let safety = manager();
        safety.heartbeat();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(safety.heartbeat_age().as_secs(), 10);
        safety.heartbeat();
        assert_eq!(safety.heartbeat_age().as_secs(), 0);
    }

    // ── Timer bookkeeping ──────────────────────────────────────────────────

    #[tokio::test]
    async fn restart_replaces_timer_instead_of_stacking() {
        let safety = manager();
        let now = Instant::now();

        safety.register_pump_start("z1", 18, Duration::from_secs(100));
        safety.register_pump_start("z1", 18, Duration::from_secs(5));

        // Only the newest deadline is live; the first heap entry is stale.
        let due = safety.collect_due(now + Duration::from_secs(10));
        assert_eq!(due, vec![("z1".to_string(), 18)]);
        assert!(safety.take_forced("z1"));
        assert!(!safety.take_forced("z1"), "forced flag is consumed once");

        // Nothing left to fire, even long past the original deadline.
        assert!(safety.collect_due(now + Duration::from_secs(1000)).is_empty());
    }

    #[tokio::test]
    async fn orderly_stop_disarms_the_deadline() {
        let safety = manager();
        let now = Instant::now();

        safety.register_pump_start("z1", 18, Duration::from_secs(5));
        let runtime = safety.register_pump_stop("z1");
        assert!(runtime.is_some());

        assert!(safety.collect_due(now + Duration::from_secs(1000)).is_empty());
        assert!(!safety.take_forced("z1"));
        // Double stop is harmless.
        assert!(safety.register_pump_stop("z1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_counts_down() {
        let safety = manager();
        assert!(safety.remaining("z1").is_none());

        safety.register_pump_start("z1", 18, Duration::from_secs(100));
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(safety.remaining("z1").unwrap().as_secs(), 60);

        safety.register_pump_stop("z1");
        assert!(safety.remaining("z1").is_none());
    }

    #[tokio::test]
    async fn timeout_requests_are_clamped() {
        let safety = manager();
        let granted = safety.register_pump_start("z1", 18, Duration::from_secs(10_000));
        assert_eq!(granted, MAX_PUMP_TIMEOUT);

        let deadline = safety.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + MAX_PUMP_TIMEOUT);
    }

    #[tokio::test]
    async fn independent_zones_expire_independently() {
        let safety = manager();
        let now = Instant::now();

        safety.register_pump_start("z1", 18, Duration::from_secs(5));
        safety.register_pump_start("z2", 19, Duration::from_secs(50));

        let due = safety.collect_due(now + Duration::from_secs(10));
        assert_eq!(due, vec![("z1".to_string(), 18)]);

        let due = safety.collect_due(now + Duration::from_secs(60));
        assert_eq!(due, vec![("z2".to_string(), 19)]);
    }

    #[tokio::test]
    async fn emergency_stop_drains_all_timers() {
        let safety = manager();
        safety.register_pump_start("z1", 18, Duration::from_secs(5));
        safety.register_pump_start("z2", 19, Duration::from_secs(5));

        let mut tracked = safety.trigger_emergency_stop("test");
        tracked.sort();
        assert_eq!(
            tracked,
            vec![("z1".to_string(), 18), ("z2".to_string(), 19)]
        );
        assert!(safety.next_deadline().is_none());
        assert!(safety
            .collect_due(Instant::now() + Duration::from_secs(1000))
            .is_empty());
    }

    // ── Scheduler task ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn scheduler_forces_pin_off_at_deadline() {
        let (backend, handle) = MockBackend::new();
        let gpio = Arc::new(
            GpioBank::new(
                Box::new(backend),
                &[PinSpec::output(18, Polarity::ActiveHigh)],
            )
            .unwrap(),
        );
        let safety = Arc::new(SafetyManager::new(Duration::from_secs(9999)));
        let shared = crate::state::new_shared();
        shared.write().await.init_zone("z1", "Front bench", 18);

        tokio::spawn(run_expiry_scheduler(
            safety.clone(),
            gpio.clone(),
            shared.clone(),
        ));

        // Start the pump and give it a 2s deadline that nobody honours.
        gpio.set_pin(18, true).unwrap();
        safety.register_pump_start("z1", 18, Duration::from_secs(2));
        shared.write().await.record_pump("z1", true);

        tokio::time::sleep(Duration::from_secs(3)).await;

        // The scheduler, not the (absent) control loop, turned the pin off.
        assert_eq!(handle.lock().unwrap().levels[&18], false);
        assert!(safety.take_forced("z1"));

        let st = shared.read().await;
        assert!(!st.zones["z1"].pump_on);
        let status = st.to_status();
        assert!(status
            .events
            .iter()
            .any(|e| e.severity == Severity::Critical && e.detail.contains("deadline expired")));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_ignores_disarmed_deadline() {
        let (backend, handle) = MockBackend::new();
        let gpio = Arc::new(
            GpioBank::new(
                Box::new(backend),
                &[PinSpec::output(18, Polarity::ActiveHigh)],
            )
            .unwrap(),
        );
        let safety = Arc::new(SafetyManager::new(Duration::from_secs(9999)));
        let shared = crate::state::new_shared();

        tokio::spawn(run_expiry_scheduler(
            safety.clone(),
            gpio.clone(),
            shared.clone(),
        ));

        gpio.set_pin(18, true).unwrap();
        safety.register_pump_start("z1", 18, Duration::from_secs(5));

        // Orderly stop before the deadline.
        tokio::time::sleep(Duration::from_secs(1)).await;
        gpio.set_pin(18, false).unwrap();
        safety.register_pump_stop("z1");

        tokio::time::sleep(Duration::from_secs(10)).await;

        // Exactly one off-write: the orderly stop.  The scheduler stayed quiet.
        let writes = handle.lock().unwrap().writes.clone();
        let offs = writes.iter().filter(|(bcm, level)| *bcm == 18 && !level).count();
        assert_eq!(offs, 1, "only the orderly stop wrote off");
        assert!(!safety.take_forced("z1"));
    }
}
