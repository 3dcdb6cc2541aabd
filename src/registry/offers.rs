use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::offer::{Offer, OfferStatus};

/// Offer history. An offer leaves `Pending` exactly once and is frozen afterwards.
#[derive(Default)]
pub struct OfferRegistry {
    offers: DashMap<Uuid, Offer>,
}

impl OfferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, offer: Offer) {
        self.offers.insert(offer.id, offer);
    }

    pub fn get(&self, offer_id: &Uuid) -> Option<Offer> {
        self.offers.get(offer_id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, offer_id: &Uuid) -> Result<Offer, DispatchError> {
        self.get(offer_id)
            .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id} not found")))
    }

    pub fn list(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        offers.sort_by_key(|offer| (offer.created_at, offer.id));
        offers
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// `Pending -> to`; any other current status means someone else resolved it first.
    pub fn resolve(
        &self,
        offer_id: &Uuid,
        to: OfferStatus,
        now: DateTime<Utc>,
    ) -> Result<Offer, DispatchError> {
        let mut offer = self
            .offers
            .get_mut(offer_id)
            .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id} not found")))?;

        if offer.status.is_terminal() {
            return Err(DispatchError::OfferAlreadyResolved {
                offer_id: *offer_id,
                status: offer.status,
            });
        }

        offer.status = to;
        offer.resolved_at = Some(now);

        Ok(offer.clone())
    }

    /// Pending offers whose expiry is at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .offers
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| (entry.value().expires_at, entry.value().id))
            .collect();

        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn pending_for_driver(&self, driver_id: &Uuid) -> usize {
        self.offers
            .iter()
            .filter(|entry| {
                let offer = entry.value();
                offer.status == OfferStatus::Pending && offer.driver_id == *driver_id
            })
            .count()
    }

    pub fn pending_for_order(&self, order_id: &Uuid) -> usize {
        self.offers
            .iter()
            .filter(|entry| {
                let offer = entry.value();
                offer.status == OfferStatus::Pending && offer.order_id == *order_id
            })
            .count()
    }
}
