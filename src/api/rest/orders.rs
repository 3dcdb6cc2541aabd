use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::candidates::ScoredCandidate;
use crate::engine::offers::{self, MatchOutcome};
use crate::engine::trips::{self, NewOrder};
use crate::api::rest::run_blocking;
use crate::error::DispatchError;
use crate::models::order::Order;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/assign", post(assign_order))
        .route("/orders/:id/candidates", get(list_candidates))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/start", post(start_trip))
        .route("/orders/:id/complete", post(complete_trip))
}

#[derive(Serialize)]
pub struct CreateOrderResponse {
    pub order: Order,
    pub assignment: MatchOutcome,
}

#[derive(Deserialize)]
pub struct CandidatesQuery {
    pub limit: Option<usize>,
}

/// Accepted either way: a parked order is still a created order.
async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), DispatchError> {
    let (order, assignment) =
        run_blocking(state, move |state| trips::submit_order(state, payload)).await??;
    Ok((StatusCode::CREATED, Json(CreateOrderResponse { order, assignment })))
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    let mut orders = state.orders.list();
    orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Json(orders)
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    state.orders.require(&id).map(Json)
}

/// Manual re-match. Failure keeps the match outcome shape with the error status.
async fn assign_order(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let result = match run_blocking(state, move |state| offers::assign(state, id)).await {
        Ok(result) => result,
        Err(err) => return err.into_response(),
    };

    match result {
        Ok(result) => Json(MatchOutcome::from(Ok(result))).into_response(),
        Err(err) => {
            let status = err.status_code();
            (status, Json(MatchOutcome::from(Err(err)))).into_response()
        }
    }
}

/// Read-only ranking preview. Nothing is claimed.
async fn list_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<Vec<ScoredCandidate>>, DispatchError> {
    let order = state.orders.require(&id)?;
    let limit = query.limit.unwrap_or(state.config.candidate_limit);
    if limit == 0 {
        return Err(DispatchError::BadRequest("limit must be > 0".to_string()));
    }

    let ranked = run_blocking(state, move |state| {
        state
            .selector
            .candidates(&state.drivers, &order, limit, state.clock.now())
    })
    .await?;

    Ok(Json(ranked))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    run_blocking(state, move |state| offers::cancel_order(state, id))
        .await?
        .map(Json)
}

async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    run_blocking(state, move |state| trips::start_trip(state, id))
        .await?
        .map(Json)
}

async fn complete_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    run_blocking(state, move |state| trips::complete_trip(state, id))
        .await?
        .map(Json)
}
