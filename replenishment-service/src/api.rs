use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Cursor, InventoryMeta, Location, RebuildPhase, RebuildProgress, SalesMeta};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{keys, Cache};
use crate::coordinator::{RebuildCoordinator, RebuildOutcome};
use crate::error::ReadError;
use crate::reader::{DashboardRead, DashboardReader, ReadOptions};

#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    pub coordinator: Arc<RebuildCoordinator>,
    pub reader: DashboardReader,
    pub has_credentials: bool,
}

#[derive(Debug, Deserialize)]
pub struct RebuildQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub wos: Option<f64>,
    pub days: Option<u32>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub credentials_configured: bool,
    pub store: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RebuildResponse {
    Triggered { status: &'static str },
    Finished(RebuildOutcome),
}

#[derive(Debug, Serialize)]
pub struct CursorStatus {
    pub location: String,
    pub value: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub age_hours: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub lock_held: bool,
    /// `Idle` when no rebuild has recorded progress.
    pub phase: RebuildPhase,
    pub progress: Option<RebuildProgress>,
    pub locations: usize,
    pub cursors: Vec<CursorStatus>,
    /// Remaining seconds per key; `None` when the key is missing.
    pub ttls: BTreeMap<&'static str, Option<u64>>,
    pub inventory: Option<InventoryMeta>,
    pub sales: Option<SalesMeta>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/api/rebuild", post(trigger_rebuild))
        .route("/api/dashboard", get(dashboard))
        .route("/api/status", get(status))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        credentials_configured: state.has_credentials,
        store: state.cache.backend_name(),
    })
}

/// Starts a rebuild. Reports `skipped` when one is already running.
pub async fn trigger_rebuild(
    State(state): State<AppState>,
    Query(query): Query<RebuildQuery>,
) -> Result<Json<RebuildResponse>, ApiError> {
    if query.wait {
        let outcome = state.coordinator.run().await.map_err(|e| {
            tracing::error!("Rebuild could not start: {:#}", e);
            api_error(StatusCode::SERVICE_UNAVAILABLE, format!("rebuild could not start: {}", e))
        })?;
        return Ok(Json(RebuildResponse::Finished(outcome)));
    }

    let running = state.cache.exists(keys::REBUILD_LOCK).await.map_err(|e| {
        tracing::error!("Failed to read rebuild lock: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    if running {
        return Ok(Json(RebuildResponse::Triggered { status: "skipped" }));
    }

    state.reader.schedule_rebuild();
    tracing::info!("Rebuild triggered over HTTP");
    Ok(Json(RebuildResponse::Triggered { status: "started" }))
}

pub async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<DashboardRead>, ApiError> {
    if let Some(wos) = query.wos {
        if !wos.is_finite() || wos <= 0.0 {
            return Err(api_error(StatusCode::BAD_REQUEST, "wos must be a positive number"));
        }
    }
    if query.days == Some(0) {
        return Err(api_error(StatusCode::BAD_REQUEST, "days must be at least 1"));
    }

    let options = ReadOptions {
        target_weeks_of_supply: query.wos,
        window_days: query.days,
        refresh: query.refresh,
    };
    match state.reader.read(options).await {
        Ok(read) => Ok(Json(read)),
        Err(ReadError::Unavailable(reason)) => {
            tracing::warn!("Dashboard unavailable: {}", reason);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, reason))
        }
    }
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let cache = &state.cache;
    let internal = |e: crate::error::CacheError| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string());

    let lock_held = cache.exists(keys::REBUILD_LOCK).await.map_err(internal)?;
    let progress = cache.get_json_or_miss::<RebuildProgress>(keys::REBUILD_PROGRESS).await;
    let locations = cache
        .get_json_or_miss::<Vec<Location>>(keys::LOCATIONS)
        .await
        .unwrap_or_default();

    let now = Utc::now();
    let mut cursors = Vec::with_capacity(locations.len());
    for location in &locations {
        let cursor = cache
            .get_json_or_miss::<Cursor>(&keys::cursor(&location.display_name))
            .await;
        cursors.push(CursorStatus {
            location: location.display_name.clone(),
            value: cursor.as_ref().map(|c| c.value.clone()),
            synced_at: cursor.as_ref().map(|c| c.synced_at),
            age_hours: cursor
                .as_ref()
                .map(|c| shared::round_to(c.age(now).num_minutes() as f64 / 60.0, 1)),
        });
    }

    let mut ttls = BTreeMap::new();
    for key in [
        keys::LOCATIONS,
        keys::INVENTORY,
        keys::SALES,
        keys::SALES_TOTALS,
        keys::DASHBOARD,
        keys::REBUILD_LOCK,
    ] {
        let ttl = cache.ttl(key).await.map_err(internal)?;
        ttls.insert(key, ttl.map(|t| t.as_secs()));
    }

    Ok(Json(StatusResponse {
        lock_held,
        phase: progress.as_ref().map_or(RebuildPhase::Idle, |p| p.phase),
        progress,
        locations: locations.len(),
        cursors,
        ttls,
        inventory: cache.get_json_or_miss(keys::INVENTORY_META).await,
        sales: cache.get_json_or_miss(keys::SALES_META).await,
    }))
}
