use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::offer::{OfferStatus, ScoreBreakdown};

/// What a driver's device needs to render an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferNotice {
    pub offer_id: Uuid,
    pub order_id: Uuid,
    pub status: OfferStatus,
    pub eta_seconds: f64,
    pub expires_at: DateTime<Utc>,
    pub breakdown: Option<ScoreBreakdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PassengerEvent {
    DriverOffered { driver_id: Uuid, eta_seconds: f64 },
    DriverAssigned { driver_id: Uuid },
    Queued { reason: String },
    TripStarted,
    TripCompleted,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "audience", rename_all = "snake_case")]
pub enum DispatchEvent {
    Driver { driver_id: Uuid, notice: OfferNotice },
    Passenger { order_id: Uuid, event: PassengerEvent },
}

impl DispatchEvent {
    pub fn concerns_driver(&self, id: &Uuid) -> bool {
        matches!(self, DispatchEvent::Driver { driver_id, .. } if driver_id == id)
    }

    pub fn concerns_order(&self, id: &Uuid) -> bool {
        match self {
            DispatchEvent::Driver { notice, .. } => notice.order_id == *id,
            DispatchEvent::Passenger { order_id, .. } => order_id == id,
        }
    }
}

/// Outbound channel to drivers and passengers. Fire-and-forget: the offer TTL
/// covers lost notifications, so delivery is never awaited.
pub trait Notifier: Send + Sync {
    fn notify_driver(&self, driver_id: Uuid, notice: OfferNotice);
    fn notify_passenger(&self, order_id: Uuid, event: PassengerEvent);
}

/// Publishes every notification on a broadcast channel consumed by websocket clients.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DispatchEvent>,
}

impl BroadcastNotifier {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: DispatchEvent) {
        // No subscribers is not an error for fire-and-forget delivery.
        if self.tx.send(event).is_err() {
            trace!("dispatch event dropped: no subscribers");
        }
    }
}

impl Notifier for BroadcastNotifier {
    fn notify_driver(&self, driver_id: Uuid, notice: OfferNotice) {
        self.publish(DispatchEvent::Driver { driver_id, notice });
    }

    fn notify_passenger(&self, order_id: Uuid, event: PassengerEvent) {
        self.publish(DispatchEvent::Passenger { order_id, event });
    }
}
