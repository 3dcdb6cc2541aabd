pub mod drivers;
pub mod offers;
pub mod orders;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::sweep::{run_sweep, SweepReport};
use crate::error::DispatchError;
use crate::models::order::OrderStatus;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(drivers::router())
        .merge(orders::router())
        .merge(offers::router())
        .route("/sweep", post(sweep))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    drivers: usize,
    orders: usize,
    offers: usize,
    queued: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        drivers: state.drivers.len(),
        orders: state.orders.len(),
        offers: state.offers.len(),
        queued: state.orders.count_in(OrderStatus::ActiveQueue),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

#[derive(Serialize)]
struct SweepResponse {
    ran: bool,
    #[serde(flatten)]
    report: SweepReport,
}

/// Runs an engine operation on the blocking pool. Engine calls take per-order
/// mutexes and scan the driver registry, so they stay off the async workers.
pub(crate) async fn run_blocking<T, F>(state: Arc<AppState>, op: F) -> Result<T, DispatchError>
where
    F: FnOnce(&AppState) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&state))
        .await
        .map_err(|err| DispatchError::Internal(format!("engine task failed: {err}")))
}

/// Manual trigger for the periodic sweep. Coalesces with a sweep already running.
async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepResponse>, DispatchError> {
    let report = run_blocking(state, run_sweep).await?;

    Ok(Json(SweepResponse {
        ran: report.is_some(),
        report: report.unwrap_or_default(),
    }))
}
