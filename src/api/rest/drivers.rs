use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::presence::{self, NewDriver};
use crate::api::rest::run_blocking;
use crate::error::DispatchError;
use crate::models::driver::{Driver, GeoPoint};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id", delete(remove_driver).get(get_driver))
        .route("/drivers/:id/location", patch(update_location))
        .route("/drivers/:id/online", post(go_online))
        .route("/drivers/:id/offline", post(go_offline))
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewDriver>,
) -> Result<Json<Driver>, DispatchError> {
    presence::register_driver(&state, payload).map(Json)
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    let mut drivers = state.drivers.list();
    drivers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Json(drivers)
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, DispatchError> {
    state
        .drivers
        .get(&id)
        .map(Json)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {id} not found")))
}

async fn remove_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, DispatchError> {
    presence::remove_driver(&state, id).map(Json)
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, DispatchError> {
    presence::update_location(&state, id, payload.location).map(Json)
}

async fn go_online(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, DispatchError> {
    presence::go_online(&state, id).map(Json)
}

async fn go_offline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, DispatchError> {
    run_blocking(state, move |state| presence::go_offline(state, id))
        .await?
        .map(Json)
}
