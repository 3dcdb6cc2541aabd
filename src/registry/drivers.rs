use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::engine::candidates::{DriverDirectory, DriverQuery};
use crate::error::DispatchError;
use crate::geo::haversine_km;
use crate::models::driver::{Driver, DriverSnapshot, DriverStatus, GeoPoint};

const TRIP_HISTORY_RETENTION_MINUTES: i64 = 60;

/// Authoritative driver state. Status and offer reference only change through
/// guarded transitions, each applied under the entry's shard lock.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<Uuid, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    pub fn get(&self, driver_id: &Uuid) -> Option<Driver> {
        self.drivers.get(driver_id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Drivers are only removable once offline with nothing in flight.
    pub fn remove(&self, driver_id: &Uuid) -> Result<Driver, DispatchError> {
        let removed = self.drivers.remove_if(driver_id, |_, driver| {
            driver.status == DriverStatus::Offline && driver.current_order.is_none()
        });

        match removed {
            Some((_, driver)) => Ok(driver),
            None => match self.get(driver_id) {
                Some(driver) => Err(DispatchError::InvalidDriverStatus {
                    driver_id: *driver_id,
                    status: driver.status,
                    reason: "driver must be offline with no current trip to be removed"
                        .to_string(),
                }),
                None => Err(not_found(driver_id)),
            },
        }
    }

    /// Compare-and-set: succeeds only if the driver is `from` right now.
    pub fn transition<F>(
        &self,
        driver_id: &Uuid,
        from: DriverStatus,
        to: DriverStatus,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Driver, DispatchError>
    where
        F: FnOnce(&mut Driver),
    {
        self.guarded(driver_id, from, to, None, now, apply)
    }

    fn guarded<F>(
        &self,
        driver_id: &Uuid,
        from: DriverStatus,
        to: DriverStatus,
        holding: Option<&Uuid>,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Driver, DispatchError>
    where
        F: FnOnce(&mut Driver),
    {
        let mut driver = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| not_found(driver_id))?;

        if driver.status != from || !from.can_transition_to(to) {
            return Err(DispatchError::InvalidDriverStatus {
                driver_id: *driver_id,
                status: driver.status,
                reason: format!("expected {from:?} for transition to {to:?}"),
            });
        }

        if let Some(offer_id) = holding {
            if driver.active_offer.as_ref() != Some(offer_id) {
                return Err(DispatchError::InvalidDriverStatus {
                    driver_id: *driver_id,
                    status: driver.status,
                    reason: format!("driver does not hold offer {offer_id}"),
                });
            }
        }

        driver.status = to;
        apply(&mut driver);
        driver.updated_at = now;

        Ok(driver.clone())
    }

    /// Reserves an idle driver for `offer_id`. Losing the race is a `ClaimConflict`.
    pub fn claim(
        &self,
        driver_id: &Uuid,
        offer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        self.transition(
            driver_id,
            DriverStatus::OnlineIdle,
            DriverStatus::OnlineOffered,
            now,
            |driver| driver.active_offer = Some(offer_id),
        )
        .map_err(|err| match err {
            DispatchError::InvalidDriverStatus { .. } => DispatchError::ClaimConflict {
                driver_id: *driver_id,
            },
            other => other,
        })
    }

    /// Releases the hold for `offer_id`. `responded` is recorded in the
    /// acceptance history when the release reflects the driver's answer.
    pub fn release_offer(
        &self,
        driver_id: &Uuid,
        offer_id: &Uuid,
        to: DriverStatus,
        responded: Option<bool>,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        self.guarded(
            driver_id,
            DriverStatus::OnlineOffered,
            to,
            Some(offer_id),
            now,
            |driver| {
                driver.active_offer = None;
                if let Some(accepted) = responded {
                    driver.acceptance.record(accepted, window);
                }
            },
        )
    }

    pub fn engage(
        &self,
        driver_id: &Uuid,
        offer_id: &Uuid,
        order_id: Uuid,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        self.guarded(
            driver_id,
            DriverStatus::OnlineOffered,
            DriverStatus::OnlineBusy,
            Some(offer_id),
            now,
            |driver| {
                driver.active_offer = None;
                driver.current_order = Some(order_id);
                driver.acceptance.record(true, window);

                let cutoff = now - Duration::minutes(TRIP_HISTORY_RETENTION_MINUTES);
                driver.trips.retain(|at| *at > cutoff);
                driver.trips.push_back(now);
            },
        )
    }

    /// Ends the trip for `order_id`. A driver who went offline mid-trip stays offline.
    pub fn finish_trip(
        &self,
        driver_id: &Uuid,
        order_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        let mut driver = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| not_found(driver_id))?;

        if driver.current_order != Some(*order_id) {
            return Err(DispatchError::InvalidDriverStatus {
                driver_id: *driver_id,
                status: driver.status,
                reason: format!("driver is not serving order {order_id}"),
            });
        }

        driver.current_order = None;
        if driver.status == DriverStatus::OnlineBusy {
            driver.status = DriverStatus::OnlineIdle;
        }
        driver.updated_at = now;

        Ok(driver.clone())
    }

    pub fn update_location(
        &self,
        driver_id: &Uuid,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        let mut driver = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| not_found(driver_id))?;

        driver.location = location;
        driver.location_updated_at = now;
        driver.updated_at = now;

        Ok(driver.clone())
    }
}

impl DriverDirectory for DriverRegistry {
    fn eligible_drivers(&self, query: &DriverQuery) -> Vec<DriverSnapshot> {
        self.drivers
            .iter()
            .filter_map(|entry| {
                let driver = entry.value();
                let nearby = driver.region == query.region
                    || haversine_km(&driver.location, &query.origin) <= query.radius_km;

                if driver.status == DriverStatus::OnlineIdle
                    && driver.capacity >= query.min_capacity
                    && nearby
                {
                    Some(driver.snapshot(query.now))
                } else {
                    None
                }
            })
            .collect()
    }
}

fn not_found(driver_id: &Uuid) -> DispatchError {
    DispatchError::NotFound(format!("driver {driver_id} not found"))
}
