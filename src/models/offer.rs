use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
    Superseded,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        self != OfferStatus::Pending
    }

    pub fn as_label(self) -> &'static str {
        match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Declined => "declined",
            OfferStatus::Expired => "expired",
            OfferStatus::Superseded => "superseded",
        }
    }
}

/// Per-term inputs behind a cost score, kept on every offer for inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub eta_seconds: f64,
    pub eta_norm: f64,
    pub distance_km: f64,
    pub distance_norm: f64,
    pub acceptance_rate: f64,
    pub rating_norm: f64,
    pub recent_load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub cost: f64,
    pub breakdown: ScoreBreakdown,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Pending && self.expires_at <= now
    }
}
