// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP export boundary.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /devices/:id/samples?from=&to=` | reconstructed samples (JSON array) |
//! | `GET /devices` | per-device summaries (JSON) |
//! | `GET /metrics` | Prometheus text format |
//! | `GET /health` | `OK` |
//! | `GET /status` | version and uptime (JSON) |

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use telepress::{Decompressor, DeviceId, Store, TimeSpan};
use tracing::error;

use crate::metrics::encode_metrics;
use crate::summary::summarize;

/// Shared handler state.
pub struct AppState<S> {
    store: Arc<S>,
    start_time: Instant,
}

impl<S> AppState<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            start_time: Instant::now(),
        }
    }
}

/// Build the router over a store.
pub fn router<S: Store + 'static>(store: Arc<S>) -> Router {
    let state = Arc::new(AppState::new(store));
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler::<S>))
        .route("/devices", get(devices_handler::<S>))
        .route("/devices/:id/samples", get(samples_handler::<S>))
        .with_state(state)
}

/// Optional time range of a samples request.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl RangeQuery {
    /// `None` when neither bound is given.
    pub fn span(&self) -> Result<Option<TimeSpan>, String> {
        match (self.from, self.to) {
            (None, None) => Ok(None),
            (Some(start), None) => Ok(Some(TimeSpan::since(start))),
            (from, Some(end)) => {
                let start = from.unwrap_or(0);
                if start > end {
                    return Err(format!("from ({}) is after to ({})", start, end));
                }
                Ok(Some(TimeSpan::new(start, end)))
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

/// Prometheus text format.
pub async fn metrics_handler() -> Response {
    match encode_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            metrics,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Health check handler.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    devices: usize,
}

async fn status_handler<S: Store + 'static>(State(state): State<Arc<AppState<S>>>) -> Response {
    match state.store.devices() {
        Ok(devices) => Json(StatusResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            devices: devices.len(),
        })
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Per-device summaries.
pub async fn devices_handler<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    match summarize(state.store.as_ref()) {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Reconstructed samples of one device.
pub async fn samples_handler<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let device = DeviceId::new(id);
    let range = match query.span() {
        Ok(range) => range,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, reason),
    };

    match state.store.devices() {
        Ok(devices) if !devices.contains(&device) => {
            return error_response(StatusCode::NOT_FOUND, format!("unknown device {}", device))
        }
        Ok(_) => {}
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }

    match Decompressor::new(state.store.as_ref()).collect(&device, range) {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => {
            error!(%device, "reconstruction failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
