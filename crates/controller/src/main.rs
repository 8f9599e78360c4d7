//! Flood-drain watering controller for Raspberry Pi benches.
//!
//! Boot order: config, gpio bank (all outputs off), sensors, safety manager,
//! then the long-running tasks:
//!
//! - sensor poller (owns the bus, fills the reading cache)
//! - pump expiry scheduler (the hard-deadline backstop)
//! - host resource monitor
//! - web api
//! - cycle control loop (heartbeat, e-stop button, per-zone state machines)
//!
//! Ctrl-C is an orderly stop, not an emergency: pumps off, pins released,
//! no latch left behind.

mod config;
mod cycle;
mod emergency;
mod error;
mod gpio;
mod safety;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod web;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::cycle::{CycleCtx, ZoneRuntime};
use crate::gpio::{GpioBank, PinSpec, Polarity};
use crate::safety::SafetyManager;
use crate::sensor::{SensorKind, SensorReader, SensorSpec};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ─────────────────────────────────────────────────────────────

    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(Path::new(&path)).with_context(|| format!("loading {path}"))?;
    info!(
        zones = config.zones.len(),
        tick_ms = config.controller.tick_ms,
        "config loaded"
    );

    // ── GPIO bank ──────────────────────────────────────────────────────────

    let mut pin_specs: Vec<PinSpec> = Vec::new();
    for z in &config.zones {
        let polarity = if z.pump_active_low {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        };
        pin_specs.push(PinSpec::output(z.pump_bcm as u8, polarity));
        // Float switches pull the line to ground when the water rises.
        pin_specs.push(PinSpec::input_pullup(z.overflow_bcm as u8, Polarity::ActiveLow));
    }
    let estop_bcm = config.safety.emergency_bcm as u8;
    pin_specs.push(PinSpec::input_pullup(estop_bcm, Polarity::ActiveLow));

    let backend = gpio::default_backend().context("initialising gpio backend")?;
    let gpio = Arc::new(GpioBank::new(backend, &pin_specs).context("claiming gpio pins")?);

    // ── Sensors ────────────────────────────────────────────────────────────

    let mut sensor_specs: Vec<SensorSpec> = Vec::new();
    let mut zone_addrs: Vec<(String, u16)> = Vec::new();
    for z in &config.zones {
        sensor_specs.push(SensorSpec {
            id: z.sensor_id(),
            kind: SensorKind::Moisture,
            addr: z.moisture_addr as u16,
            raw_dry: z.raw_dry as u16,
            raw_wet: z.raw_wet as u16,
        });
        sensor_specs.push(SensorSpec {
            id: z.temp_sensor_id(),
            kind: SensorKind::Temperature,
            addr: z.moisture_addr as u16,
            raw_dry: z.raw_dry as u16,
            raw_wet: z.raw_wet as u16,
        });
        zone_addrs.push((z.zone_id.clone(), z.moisture_addr as u16));
    }

    #[cfg(feature = "gpio")]
    let source: Box<dyn sensor::SensorSource> =
        Box::new(sensor::ChirpBus::new().context("opening i2c bus")?);

    #[cfg(all(feature = "sim", not(feature = "gpio")))]
    let source: Box<dyn sensor::SensorSource> = {
        let scenario = sim::Scenario::from_str_lossy(
            &std::env::var("SIM_SCENARIO").unwrap_or_default(),
        );
        info!(%scenario, "using simulated sensor bus");
        let addrs: Vec<u16> = zone_addrs.iter().map(|(_, a)| *a).collect();
        let (dry, wet) = config
            .zones
            .first()
            .map(|z| (z.raw_dry as f64, z.raw_wet as f64))
            .unwrap_or((500.0, 200.0));
        Box::new(sensor::SimSource::new(scenario, addrs, dry, wet))
    };

    #[cfg(not(any(feature = "gpio", feature = "sim")))]
    let source: Box<dyn sensor::SensorSource> = Box::new(sensor::NoopSource);

    let reader = Arc::new(SensorReader::new(
        source,
        config.controller.cache_fresh(),
        config.controller.max_retries as u32,
        config.controller.retry_base(),
    ));

    // ── Shared state ───────────────────────────────────────────────────────

    let shared = state::new_shared();
    {
        let mut st = shared.write().await;
        for z in &config.zones {
            st.init_zone(&z.zone_id, &z.name, z.pump_bcm as u8);
        }
        st.record_system("controller started".to_string());
    }

    let zones: Vec<ZoneRuntime> = config
        .zones
        .iter()
        .map(|z| ZoneRuntime {
            zone_id: z.zone_id.clone(),
            name: z.name.clone(),
            pump_bcm: z.pump_bcm as u8,
            overflow_bcm: z.overflow_bcm as u8,
            sensor_id: z.sensor_id(),
            moisture_low_pct: z.moisture_low_pct,
            flood: z.flood(),
            drain: z.drain(),
            pump_timeout: z.pump_timeout(),
            flood_retry_cap: z.flood_retry_cap as u32,
            stale_after: config.controller.stale_after(),
        })
        .collect();

    let safety = Arc::new(SafetyManager::new(config.safety.watchdog()));
    let ctx = CycleCtx {
        gpio: gpio.clone(),
        safety: safety.clone(),
        reader: reader.clone(),
        cycles: cycle::new_cycle_map(),
        shared: shared.clone(),
    };

    // ── Background tasks ───────────────────────────────────────────────────

    tokio::spawn(sensor::run_poller(
        reader.clone(),
        sensor_specs,
        zone_addrs,
        config.controller.poll(),
        shared.clone(),
    ));
    tokio::spawn(safety::run_expiry_scheduler(
        safety.clone(),
        gpio.clone(),
        shared.clone(),
    ));
    tokio::spawn(safety::run_resource_monitor(
        shared.clone(),
        Duration::from_secs(30),
    ));
    tokio::spawn(web::serve(web::ApiCtx {
        ctx: ctx.clone(),
        zones: Arc::new(zones.clone()),
    }));
    tokio::spawn(cycle::run(
        ctx,
        zones.clone(),
        config.controller.tick(),
        estop_bcm,
    ));

    // ── Shutdown ───────────────────────────────────────────────────────────

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    for zone in &zones {
        if let Err(e) = gpio.set_pin(zone.pump_bcm, false) {
            error!(zone = %zone.zone_id, "failed to stop pump during shutdown: {e}");
        }
        safety.register_pump_stop(&zone.zone_id);
    }
    gpio.cleanup();
    {
        let mut st = shared.write().await;
        st.record_system("controller stopped".to_string());
    }
    info!("controller stopped");
    Ok(())
}
