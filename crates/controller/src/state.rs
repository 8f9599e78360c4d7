//! Shared in-memory state: live zone status, latest readings, event ring.
//!
//! Every task holds an `Arc` to the same [`SystemState`] behind a tokio
//! `RwLock`.  Writers use the `record_*` methods so each mutation also leaves
//! an event in the ring; the web layer serialises a snapshot via
//! [`SystemState::to_status`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::sensor::Reading;

/// Maximum events kept in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn new_shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Live status of one zone as shown on the API.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub name: String,
    /// `idle`, `flood`, `drain` or `fault`.
    pub phase: String,
    pub pump_on: bool,
    pub pump_bcm: u8,
    /// Seconds until the safety manager forces the pump off.  Filled in at
    /// snapshot time by the web layer; present only while a timer is armed.
    pub pump_deadline_secs: Option<u64>,
    pub overflow: bool,
    /// Completed flood/drain cycles since boot.
    pub cycles: u64,
    /// Pump starts refused by the safety gate since boot.
    pub denials: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_transition: Option<OffsetDateTime>,
}

/// Host resource usage sampled by the resource monitor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostHealth {
    pub mem_used_pct: f32,
    pub cpu_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Cycle,
    Safety,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub severity: Severity,
    pub detail: String,
}

/// Snapshot served by `GET /api/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub emergency: bool,
    pub zones: HashMap<String, ZoneStatus>,
    pub readings: HashMap<String, Reading>,
    pub host: HostHealth,
    /// Newest first.
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// System state
// ---------------------------------------------------------------------------

pub struct SystemState {
    started_at: Instant,
    pub emergency: bool,
    pub zones: HashMap<String, ZoneStatus>,
    pub readings: HashMap<String, Reading>,
    pub host: HostHealth,
    events: VecDeque<SystemEvent>,
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            emergency: false,
            zones: HashMap::new(),
            readings: HashMap::new(),
            host: HostHealth::default(),
            events: VecDeque::new(),
        }
    }

    /// Register a configured zone so it shows up on the API from boot.
    pub fn init_zone(&mut self, zone_id: &str, name: &str, pump_bcm: u8) {
        self.zones.insert(
            zone_id.to_string(),
            ZoneStatus {
                name: name.to_string(),
                phase: "idle".to_string(),
                pump_on: false,
                pump_bcm,
                pump_deadline_secs: None,
                overflow: false,
                cycles: 0,
                denials: 0,
                last_transition: None,
            },
        );
    }

    fn push_event(&mut self, kind: EventKind, severity: Severity, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            severity,
            detail,
        });
    }

    /// One poller sweep finished: replace the affected readings.
    pub fn record_readings(&mut self, readings: Vec<Reading>) {
        if readings.is_empty() {
            return;
        }
        let n = readings.len();
        for reading in readings {
            self.readings.insert(reading.id.clone(), reading);
        }
        self.push_event(
            EventKind::Reading,
            Severity::Info,
            format!("updated {n} sensor reading(s)"),
        );
    }

    pub fn record_pump(&mut self, zone_id: &str, on: bool) {
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.pump_on = on;
        }
        self.push_event(
            EventKind::Pump,
            Severity::Info,
            format!("pump {} for zone {zone_id}", if on { "on" } else { "off" }),
        );
    }

    /// Phase transition for a zone; also stamps `last_transition`.
    pub fn record_cycle_phase(
        &mut self,
        zone_id: &str,
        phase: &str,
        severity: Severity,
        detail: String,
    ) {
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.phase = phase.to_string();
            zone.last_transition = Some(OffsetDateTime::now_utc());
        }
        self.push_event(EventKind::Cycle, severity, detail);
    }

    /// A zone finished a full flood/drain cycle.
    pub fn record_cycle_complete(&mut self, zone_id: &str) {
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.cycles += 1;
        }
    }

    /// Safety gate refused a pump start for this zone.
    pub fn record_denial(&mut self, zone_id: &str, detail: String) {
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.denials += 1;
        }
        self.push_event(EventKind::Safety, Severity::Warning, detail);
    }

    pub fn record_overflow(&mut self, zone_id: &str, active: bool) {
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.overflow = active;
        }
        let (severity, verb) = if active {
            (Severity::Warning, "detected")
        } else {
            (Severity::Info, "cleared")
        };
        self.push_event(
            EventKind::Safety,
            severity,
            format!("overflow {verb} on zone {zone_id}"),
        );
    }

    pub fn record_safety(&mut self, severity: Severity, detail: String) {
        self.push_event(EventKind::Safety, severity, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, Severity::Info, detail);
    }

    /// Build the API snapshot.  Events come out newest first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            emergency: self.emergency,
            zones: self.zones.clone(),
            readings: self.readings.clone(),
            host: self.host.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
