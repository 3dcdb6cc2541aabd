use std::collections::HashMap;

use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::offers::{assign, MatchOutcome};
use crate::error::DispatchError;
use crate::geo;
use crate::models::driver::GeoPoint;
use crate::models::order::{Order, OrderStatus};
use crate::notify::PassengerEvent;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub passenger_id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub region: String,
    #[serde(default = "default_capacity")]
    pub required_capacity: u8,
}

fn default_capacity() -> u8 {
    1
}

/// Records a new order in `MATCHING` without running a matching pass.
pub fn create_order(state: &AppState, new: NewOrder) -> Result<Order, DispatchError> {
    if !geo::is_valid(&new.pickup) || !geo::is_valid(&new.dropoff) {
        return Err(DispatchError::BadRequest(
            "pickup and dropoff must be valid coordinates".to_string(),
        ));
    }
    if new.region.trim().is_empty() {
        return Err(DispatchError::BadRequest("region cannot be empty".to_string()));
    }
    if new.required_capacity == 0 {
        return Err(DispatchError::BadRequest(
            "required_capacity must be > 0".to_string(),
        ));
    }

    let now = state.clock.now();
    let order = Order {
        id: Uuid::new_v4(),
        passenger_id: new.passenger_id,
        pickup: new.pickup,
        dropoff: new.dropoff,
        region: new.region,
        required_capacity: new.required_capacity,
        status: OrderStatus::Matching,
        assigned_driver: None,
        served_by: None,
        active_offer: None,
        excluded_drivers: HashMap::new(),
        match_attempts: 0,
        review_flag: None,
        created_at: now,
        queued_at: now,
        updated_at: now,
    };

    state.orders.insert(order.clone());
    info!(order_id = %order.id, region = %order.region, "order created");

    Ok(order)
}

/// Creates the order and runs the first matching pass right away.
pub fn submit_order(
    state: &AppState,
    new: NewOrder,
) -> Result<(Order, MatchOutcome), DispatchError> {
    let order = create_order(state, new)?;
    let outcome = MatchOutcome::from(assign(state, order.id));
    let order = state.orders.require(&order.id)?;

    Ok((order, outcome))
}

pub fn start_trip(state: &AppState, order_id: Uuid) -> Result<Order, DispatchError> {
    let order = state.order_locks.with_lock(&order_id, || {
        state.orders.transition(
            &order_id,
            OrderStatus::Assigned,
            OrderStatus::InProgress,
            state.clock.now(),
            |_| {},
        )
    })?;

    state
        .notifier
        .notify_passenger(order_id, PassengerEvent::TripStarted);
    info!(order_id = %order_id, "trip started");

    Ok(order)
}

/// Completes the trip and frees the driver for new offers.
pub fn complete_trip(state: &AppState, order_id: Uuid) -> Result<Order, DispatchError> {
    let order = state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        let order = state.orders.transition(
            &order_id,
            OrderStatus::InProgress,
            OrderStatus::Completed,
            now,
            |order| order.served_by = order.assigned_driver.take(),
        )?;

        if let Some(driver_id) = order.served_by {
            if let Err(err) = state.drivers.finish_trip(&driver_id, &order_id, now) {
                error!(
                    order_id = %order_id,
                    driver_id = %driver_id,
                    error = %err,
                    "driver record out of step with completed trip"
                );
            }
        }

        Ok::<_, DispatchError>(order)
    })?;

    state.order_locks.forget(&order_id);
    state
        .notifier
        .notify_passenger(order_id, PassengerEvent::TripCompleted);
    info!(order_id = %order_id, driver_id = ?order.served_by, "trip completed");

    Ok(order)
}
