use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::offers::{self, Resolution};
use crate::api::rest::run_blocking;
use crate::error::DispatchError;
use crate::models::offer::{Offer, OfferStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/offers", get(list_offers))
        .route("/offers/:id", get(get_offer))
        .route("/offers/:id/accept", post(accept_offer))
        .route("/offers/:id/decline", post(decline_offer))
}

#[derive(Deserialize)]
pub struct OfferFilter {
    pub driver_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub status: Option<OfferStatus>,
}

async fn list_offers(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<OfferFilter>,
) -> Json<Vec<Offer>> {
    let offers = state
        .offers
        .list()
        .into_iter()
        .filter(|offer| filter.driver_id.is_none_or(|id| offer.driver_id == id))
        .filter(|offer| filter.order_id.is_none_or(|id| offer.order_id == id))
        .filter(|offer| filter.status.is_none_or(|status| offer.status == status))
        .collect();

    Json(offers)
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Offer>, DispatchError> {
    state.offers.require(&id).map(Json)
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Resolution>, DispatchError> {
    run_blocking(state, move |state| offers::accept(state, id))
        .await?
        .map(Json)
}

async fn decline_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Resolution>, DispatchError> {
    run_blocking(state, move |state| offers::decline(state, id))
        .await?
        .map(Json)
}
