//! JSON control API.
//!
//! Routes:
//! - `GET  /api/status`             full system snapshot
//! - `POST /api/pumps/{zone}/start` manual flood (gate still applies)
//! - `POST /api/pumps/{zone}/stop`  end a flood early
//! - `POST /api/zones/{zone}/reset` acknowledge a faulted zone
//! - `POST /api/estop`              emergency shutdown, returns the snapshot
//! - `POST /api/estop/clear`        unlatch after an emergency stop
//!
//! Refusals (safety denials, wrong phase) are 409; unknown zones 404;
//! hardware failures 500.  Every response body is JSON.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::cycle::{self, CycleCtx, ZoneRuntime};
use crate::emergency::{self, EmergencySnapshot};
use crate::error::ControlError;
use crate::state::StatusResponse;

#[derive(Clone)]
pub struct ApiCtx {
    pub ctx: CycleCtx,
    pub zones: Arc<Vec<ZoneRuntime>>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(api: ApiCtx) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/pumps/{zone}/start", post(pump_start))
        .route("/api/pumps/{zone}/stop", post(pump_stop))
        .route("/api/zones/{zone}/reset", post(zone_reset))
        .route("/api/estop", post(estop))
        .route("/api/estop/clear", post(estop_clear))
        .with_state(api)
}

/// Bind and serve until the process exits.  Port comes from `WEB_PORT`,
/// default 8080.
pub async fn serve(api: ApiCtx) {
    let port: u16 = std::env::var("WEB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "web api listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind web port");
    axum::serve(listener, router(api))
        .await
        .expect("web server exited");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn status(State(api): State<ApiCtx>) -> Json<StatusResponse> {
    let mut status = {
        let st = api.ctx.shared.read().await;
        st.to_status()
    };
    // Remaining pump deadlines are live safety state, not history; compute
    // them at snapshot time.
    for (zone_id, zone) in status.zones.iter_mut() {
        zone.pump_deadline_secs = api.ctx.safety.remaining(zone_id).map(|d| d.as_secs());
    }
    Json(status)
}

async fn pump_start(State(api): State<ApiCtx>, Path(zone_id): Path<String>) -> ApiResult {
    let zone = find_zone(&api, &zone_id)?;
    cycle::manual_start(&api.ctx, zone)
        .await
        .map_err(control_error)?;
    Ok(Json(json!({ "zone": zone_id, "phase": "flood" })))
}

async fn pump_stop(State(api): State<ApiCtx>, Path(zone_id): Path<String>) -> ApiResult {
    let zone = find_zone(&api, &zone_id)?;
    cycle::manual_stop(&api.ctx, zone)
        .await
        .map_err(control_error)?;
    Ok(Json(json!({ "zone": zone_id, "phase": "drain" })))
}

async fn zone_reset(State(api): State<ApiCtx>, Path(zone_id): Path<String>) -> ApiResult {
    // Resolve against config so typos 404 instead of minting ghost zones.
    find_zone(&api, &zone_id)?;
    cycle::reset_zone(&api.ctx, &zone_id)
        .await
        .map_err(control_error)?;
    Ok(Json(json!({ "zone": zone_id, "phase": "idle" })))
}

async fn estop(State(api): State<ApiCtx>) -> Json<EmergencySnapshot> {
    warn!("emergency stop requested via api");
    let snapshot = emergency::shutdown_all("api request", &api.ctx, &api.zones).await;
    Json(snapshot)
}

async fn estop_clear(State(api): State<ApiCtx>) -> Json<Value> {
    emergency::clear(&api.ctx).await;
    Json(json!({ "emergency": false }))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn find_zone<'a>(api: &'a ApiCtx, zone_id: &str) -> Result<&'a ZoneRuntime, ApiError> {
    api.zones.iter().find(|z| z.zone_id == zone_id).ok_or((
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown zone {zone_id}") })),
    ))
}

fn control_error(e: ControlError) -> ApiError {
    let code = match &e {
        ControlError::Denied(_) | ControlError::Busy { .. } => StatusCode::CONFLICT,
        ControlError::Hardware(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(json!({ "error": e.to_string() })))
}

// ===========================================================================
// Tests
// ===========================================================================
