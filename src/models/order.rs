use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Matching,
    ActiveQueue,
    Offered,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            OrderStatus::Matching | OrderStatus::ActiveQueue | OrderStatus::Offered
        )
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, next) {
            (Matching, Offered) | (Matching, ActiveQueue) => true,
            (ActiveQueue, Matching) => true,
            (Offered, Matching) | (Offered, Assigned) => true,
            (Assigned, InProgress) | (InProgress, Completed) => true,
            (from, Cancelled) => from.is_cancellable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub passenger_id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub region: String,
    pub required_capacity: u8,
    pub status: OrderStatus,
    pub assigned_driver: Option<Uuid>,
    /// Driver who completed the trip; `assigned_driver` is cleared at completion.
    pub served_by: Option<Uuid>,
    pub active_offer: Option<Uuid>,
    pub excluded_drivers: HashMap<Uuid, DateTime<Utc>>,
    pub match_attempts: u32,
    pub review_flag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A driver stays excluded for `ttl` after declining or letting an offer lapse.
    pub fn is_excluded(&self, driver_id: &Uuid, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.excluded_drivers
            .get(driver_id)
            .is_some_and(|since| *since + ttl > now)
    }
}
