use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::offers::withdraw_for_offline;
use crate::error::DispatchError;
use crate::geo;
use crate::models::driver::{AcceptanceHistory, Driver, DriverStatus, GeoPoint};
use crate::state::AppState;

/// Bound on retries when the driver's status keeps moving under a go-offline request.
const OFFLINE_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct NewDriver {
    pub name: String,
    pub region: String,
    pub location: GeoPoint,
    pub capacity: u8,
    pub rating: f64,
    #[serde(default)]
    pub prior_offers: u32,
    #[serde(default)]
    pub prior_accepts: u32,
    #[serde(default)]
    pub online: bool,
}

pub fn register_driver(state: &AppState, new: NewDriver) -> Result<Driver, DispatchError> {
    if new.name.trim().is_empty() {
        return Err(DispatchError::BadRequest("name cannot be empty".to_string()));
    }
    if new.region.trim().is_empty() {
        return Err(DispatchError::BadRequest("region cannot be empty".to_string()));
    }
    if new.capacity == 0 {
        return Err(DispatchError::BadRequest("capacity must be > 0".to_string()));
    }
    if !geo::is_valid(&new.location) {
        return Err(DispatchError::BadRequest("location is out of range".to_string()));
    }

    let now = state.clock.now();
    let driver = Driver {
        id: Uuid::new_v4(),
        name: new.name,
        region: new.region,
        location: new.location,
        location_updated_at: now,
        capacity: new.capacity,
        rating: if new.rating.is_finite() {
            new.rating.clamp(0.0, 5.0)
        } else {
            0.0
        },
        status: if new.online {
            DriverStatus::OnlineIdle
        } else {
            DriverStatus::Offline
        },
        active_offer: None,
        current_order: None,
        acceptance: AcceptanceHistory::seeded(
            new.prior_accepts,
            new.prior_offers,
            state.config.acceptance_window,
        ),
        trips: VecDeque::new(),
        updated_at: now,
    };

    state.drivers.insert(driver.clone());
    info!(driver_id = %driver.id, region = %driver.region, "driver registered");

    Ok(driver)
}

pub fn go_online(state: &AppState, driver_id: Uuid) -> Result<Driver, DispatchError> {
    let current = state
        .drivers
        .get(&driver_id)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id} not found")))?;
    if let Some(order_id) = current.current_order {
        return Err(DispatchError::InvalidDriverStatus {
            driver_id,
            status: current.status,
            reason: format!("trip for order {order_id} must be completed first"),
        });
    }

    let driver = state.drivers.transition(
        &driver_id,
        DriverStatus::Offline,
        DriverStatus::OnlineIdle,
        state.clock.now(),
        |_| {},
    )?;

    info!(driver_id = %driver_id, "driver online");
    Ok(driver)
}

/// Takes a driver offline from any state without dropping in-flight work: a
/// pending offer is force-declined and re-matched, a running trip is flagged
/// for review.
pub fn go_offline(state: &AppState, driver_id: Uuid) -> Result<Driver, DispatchError> {
    for _ in 0..OFFLINE_ATTEMPTS {
        let driver = state
            .drivers
            .get(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id} not found")))?;
        let now = state.clock.now();

        match driver.status {
            DriverStatus::Offline => return Ok(driver),
            DriverStatus::OnlineIdle => {
                match state.drivers.transition(
                    &driver_id,
                    DriverStatus::OnlineIdle,
                    DriverStatus::Offline,
                    now,
                    |_| {},
                ) {
                    Ok(driver) => {
                        info!(driver_id = %driver_id, "driver offline");
                        return Ok(driver);
                    }
                    Err(DispatchError::InvalidDriverStatus { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            DriverStatus::OnlineOffered => {
                let Some(offer_id) = driver.active_offer else {
                    continue;
                };

                match withdraw_for_offline(state, offer_id) {
                    Ok(_) => {
                        info!(
                            driver_id = %driver_id,
                            offer_id = %offer_id,
                            "driver offline; pending offer declined"
                        );
                        return state.drivers.get(&driver_id).ok_or_else(|| {
                            DispatchError::NotFound(format!("driver {driver_id} not found"))
                        });
                    }
                    Err(
                        DispatchError::OfferAlreadyResolved { .. }
                        | DispatchError::InvalidOrderStatus { .. }
                        | DispatchError::InvalidDriverStatus { .. },
                    ) => continue,
                    // Claimed, but the offer is not registered yet.
                    Err(DispatchError::NotFound(_)) => {
                        std::thread::yield_now();
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            DriverStatus::OnlineBusy => {
                match state.drivers.transition(
                    &driver_id,
                    DriverStatus::OnlineBusy,
                    DriverStatus::Offline,
                    now,
                    |_| {},
                ) {
                    Ok(driver) => {
                        if let Some(order_id) = driver.current_order {
                            flag_trip(state, driver_id, order_id)?;
                        }
                        return Ok(driver);
                    }
                    Err(DispatchError::InvalidDriverStatus { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    Err(DispatchError::ClaimConflict { driver_id })
}

/// A trip that finished concurrently needs no review.
fn flag_trip(state: &AppState, driver_id: Uuid, order_id: Uuid) -> Result<(), DispatchError> {
    let flagged = state.order_locks.with_lock(&order_id, || {
        state.orders.flag_for_review(
            &order_id,
            "driver went offline during the trip",
            state.clock.now(),
        )
    });

    match flagged {
        Ok(_) => {
            warn!(
                driver_id = %driver_id,
                order_id = %order_id,
                "driver offline mid-trip; order flagged for review"
            );
            Ok(())
        }
        Err(DispatchError::InvalidOrderStatus { status, .. }) => {
            debug!(order_id = %order_id, status = ?status, "trip already closed; no review flag");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Heartbeat from the driver's device.
pub fn update_location(
    state: &AppState,
    driver_id: Uuid,
    location: GeoPoint,
) -> Result<Driver, DispatchError> {
    if !geo::is_valid(&location) {
        return Err(DispatchError::BadRequest("location is out of range".to_string()));
    }

    state
        .drivers
        .update_location(&driver_id, location, state.clock.now())
}

pub fn remove_driver(state: &AppState, driver_id: Uuid) -> Result<Driver, DispatchError> {
    let removed = state.drivers.remove(&driver_id)?;
    info!(driver_id = %driver_id, "driver removed");
    Ok(removed)
}
