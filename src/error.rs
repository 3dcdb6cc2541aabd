use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::driver::DriverStatus;
use crate::models::offer::OfferStatus;
use crate::models::order::OrderStatus;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("order {order_id} is {status:?} and cannot be matched")]
    InvalidOrderStatus { order_id: Uuid, status: OrderStatus },

    #[error("no available drivers for order {order_id}")]
    NoAvailableDrivers { order_id: Uuid, suggestion: String },

    #[error("driver {driver_id} was claimed by a concurrent match")]
    ClaimConflict { driver_id: Uuid },

    #[error("offer {offer_id} is already {status:?}")]
    OfferAlreadyResolved { offer_id: Uuid, status: OfferStatus },

    #[error("driver {driver_id} is {status:?}: {reason}")]
    InvalidDriverStatus {
        driver_id: Uuid,
        status: DriverStatus,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidOrderStatus { .. } => "InvalidOrderStatus",
            DispatchError::NoAvailableDrivers { .. } => "NoAvailableDrivers",
            DispatchError::ClaimConflict { .. } => "ClaimConflict",
            DispatchError::OfferAlreadyResolved { .. } => "OfferAlreadyResolved",
            DispatchError::InvalidDriverStatus { .. } => "InvalidDriverStatus",
            DispatchError::NotFound(_) => "NotFound",
            DispatchError::BadRequest(_) => "BadRequest",
            DispatchError::Config(_) => "Config",
            DispatchError::Internal(_) => "Internal",
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            DispatchError::NoAvailableDrivers { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::InvalidOrderStatus { .. }
            | DispatchError::ClaimConflict { .. }
            | DispatchError::OfferAlreadyResolved { .. }
            | DispatchError::InvalidDriverStatus { .. } => StatusCode::CONFLICT,
            DispatchError::NoAvailableDrivers { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Config(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = json!(suggestion);
        }

        body
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}
