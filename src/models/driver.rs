use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const RECENT_LOAD_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Offline,
    OnlineIdle,
    OnlineOffered,
    OnlineBusy,
}

impl DriverStatus {
    pub fn can_transition_to(self, next: DriverStatus) -> bool {
        use DriverStatus::*;

        matches!(
            (self, next),
            (Offline, OnlineIdle)
                | (OnlineIdle, Offline)
                | (OnlineIdle, OnlineOffered)
                | (OnlineOffered, OnlineIdle)
                | (OnlineOffered, OnlineBusy)
                | (OnlineOffered, Offline)
                | (OnlineBusy, OnlineIdle)
                | (OnlineBusy, Offline)
        )
    }
}

/// Rolling window of the most recent offer outcomes (`true` = accepted).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptanceHistory {
    outcomes: VecDeque<bool>,
}

impl AcceptanceHistory {
    /// History imported from an external record: `accepted` out of `offered`.
    /// Only the last `window` outcomes are kept, at the imported rate with the
    /// accepts spread evenly across them.
    pub fn seeded(accepted: u32, offered: u32, window: usize) -> Self {
        let mut history = Self::default();
        if offered == 0 {
            return history;
        }

        let offered = u128::from(offered);
        let accepted = u128::from(accepted).min(offered);
        let kept = offered.min(window.max(1) as u128);
        let kept_accepts = (2 * accepted * kept + offered) / (2 * offered);

        for index in 0..kept {
            let due = (index + 1) * kept_accepts / kept > index * kept_accepts / kept;
            history.outcomes.push_back(due);
        }
        history
    }

    pub fn record(&mut self, accepted: bool, window: usize) {
        self.outcomes.push_back(accepted);
        while self.outcomes.len() > window.max(1) {
            self.outcomes.pop_front();
        }
    }

    pub fn offers_seen(&self) -> u32 {
        self.outcomes.len() as u32
    }

    /// Fraction accepted, `None` when no offer has been observed yet.
    pub fn rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }

        let accepted = self.outcomes.iter().filter(|accepted| **accepted).count();
        Some(accepted as f64 / self.outcomes.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    pub location: GeoPoint,
    pub location_updated_at: DateTime<Utc>,
    pub capacity: u8,
    pub rating: f64,
    pub status: DriverStatus,
    pub active_offer: Option<Uuid>,
    pub current_order: Option<Uuid>,
    pub acceptance: AcceptanceHistory,
    pub trips: VecDeque<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    /// Orders taken within `window` before `now`.
    pub fn recent_load(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        let since = now - window;
        self.trips.iter().filter(|at| **at > since && **at <= now).count() as u32
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> DriverSnapshot {
        DriverSnapshot {
            id: self.id,
            region: self.region.clone(),
            location: self.location,
            location_updated_at: self.location_updated_at,
            capacity: self.capacity,
            rating: self.rating,
            status: self.status,
            acceptance_rate: self.acceptance.rate().unwrap_or(0.0),
            offers_seen: self.acceptance.offers_seen(),
            recent_load: self.recent_load(now, Duration::minutes(RECENT_LOAD_WINDOW_MINUTES)),
        }
    }
}

/// Read-only view of a driver as returned by the directory, fresh as of the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSnapshot {
    pub id: Uuid,
    pub region: String,
    pub location: GeoPoint,
    pub location_updated_at: DateTime<Utc>,
    pub capacity: u8,
    pub rating: f64,
    pub status: DriverStatus,
    pub acceptance_rate: f64,
    pub offers_seen: u32,
    pub recent_load: u32,
}
