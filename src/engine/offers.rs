use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::candidates::ScoredCandidate;
use crate::error::DispatchError;
use crate::models::driver::DriverStatus;
use crate::models::offer::{Offer, OfferStatus, ScoreBreakdown};
use crate::models::order::{Order, OrderStatus};
use crate::notify::{OfferNotice, PassengerEvent};
use crate::state::AppState;

/// A successfully issued offer.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub offer_id: Uuid,
    pub eta_seconds: f64,
    pub cost: f64,
    pub expires_at: DateTime<Utc>,
    pub breakdown: ScoreBreakdown,
}

/// Wire shape of a matching pass: the issued offer, or the error kind with a
/// message and optional suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub success: bool,
    #[serde(flatten)]
    pub offer: Option<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<Result<MatchResult, DispatchError>> for MatchOutcome {
    fn from(result: Result<MatchResult, DispatchError>) -> Self {
        match result {
            Ok(offer) => Self {
                success: true,
                offer: Some(offer),
                error: None,
                message: None,
                suggestion: None,
            },
            Err(err) => Self {
                success: false,
                offer: None,
                error: Some(err.kind().to_string()),
                suggestion: err.suggestion().map(str::to_string),
                message: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub offer: Offer,
    /// Present when the order went back to matching after this resolution.
    pub rematch: Option<MatchOutcome>,
}

/// Runs one matching pass for `order_id` and, on success, leaves exactly one
/// pending offer for it. Never waits for the driver's answer.
pub fn assign(state: &AppState, order_id: Uuid) -> Result<MatchResult, DispatchError> {
    state
        .order_locks
        .with_lock(&order_id, || matching_pass(state, &order_id))
}

pub fn accept(state: &AppState, offer_id: Uuid) -> Result<Resolution, DispatchError> {
    let order_id = state.offers.require(&offer_id)?.order_id;

    state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        let current = state.offers.require(&offer_id)?;
        if current.is_due(now) {
            return lapse(state, &current, now);
        }

        let offer = state.offers.resolve(&offer_id, OfferStatus::Accepted, now)?;
        state
            .metrics
            .offers_resolved_total
            .with_label_values(&[OfferStatus::Accepted.as_label()])
            .inc();

        state
            .drivers
            .engage(
                &offer.driver_id,
                &offer.id,
                offer.order_id,
                state.config.acceptance_window,
                now,
            )
            .map_err(|err| inconsistent(&offer, "driver", err))?;

        state
            .orders
            .transition(
                &offer.order_id,
                OrderStatus::Offered,
                OrderStatus::Assigned,
                now,
                |order| {
                    order.active_offer = None;
                    order.assigned_driver = Some(offer.driver_id);
                },
            )
            .map_err(|err| inconsistent(&offer, "order", err))?;

        state.notifier.notify_passenger(
            offer.order_id,
            PassengerEvent::DriverAssigned {
                driver_id: offer.driver_id,
            },
        );

        info!(
            order_id = %offer.order_id,
            driver_id = %offer.driver_id,
            offer_id = %offer.id,
            "offer accepted"
        );

        Ok(Resolution {
            offer,
            rematch: None,
        })
    })
}

/// Driver said no. The driver is immediately idle again and the order is
/// re-matched with that driver excluded.
pub fn decline(state: &AppState, offer_id: Uuid) -> Result<Resolution, DispatchError> {
    let order_id = state.offers.require(&offer_id)?.order_id;

    state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        let current = state.offers.require(&offer_id)?;
        if current.is_due(now) {
            return lapse(state, &current, now);
        }

        release_and_rematch(
            state,
            &offer_id,
            OfferStatus::Declined,
            DriverStatus::OnlineIdle,
            now,
        )
    })
}

/// Timeout path, driven by the sweep. Counts as a non-response for the driver.
pub fn expire(state: &AppState, offer_id: Uuid) -> Result<Resolution, DispatchError> {
    let order_id = state.offers.require(&offer_id)?.order_id;

    state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        release_and_rematch(
            state,
            &offer_id,
            OfferStatus::Expired,
            DriverStatus::OnlineIdle,
            now,
        )
    })
}

/// Force-declines the offer held by a driver who is going offline.
pub(crate) fn withdraw_for_offline(
    state: &AppState,
    offer_id: Uuid,
) -> Result<Resolution, DispatchError> {
    let order_id = state.offers.require(&offer_id)?.order_id;

    state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        release_and_rematch(
            state,
            &offer_id,
            OfferStatus::Declined,
            DriverStatus::Offline,
            now,
        )
    })
}

/// Cancels an order that has not been assigned yet. A pending offer is
/// superseded and its driver released without an acceptance penalty.
pub fn cancel_order(state: &AppState, order_id: Uuid) -> Result<Order, DispatchError> {
    let cancelled = state.order_locks.with_lock(&order_id, || {
        let now = state.clock.now();
        let order = state.orders.require(&order_id)?;

        if !order.status.is_cancellable() {
            return Err(DispatchError::InvalidOrderStatus {
                order_id,
                status: order.status,
            });
        }

        if let (OrderStatus::Offered, Some(offer_id)) = (order.status, order.active_offer) {
            let offer = state.offers.resolve(&offer_id, OfferStatus::Superseded, now)?;
            release_driver(state, &offer, DriverStatus::OnlineIdle, None, now);
        }

        let cancelled = state.orders.transition(
            &order_id,
            order.status,
            OrderStatus::Cancelled,
            now,
            |order| order.active_offer = None,
        )?;

        state
            .notifier
            .notify_passenger(order_id, PassengerEvent::Cancelled);
        info!(order_id = %order_id, "order cancelled");

        Ok(cancelled)
    })?;

    state.order_locks.forget(&order_id);
    Ok(cancelled)
}

/// Body of a matching pass. Caller holds the order's lock.
pub(crate) fn matching_pass(
    state: &AppState,
    order_id: &Uuid,
) -> Result<MatchResult, DispatchError> {
    let start = Instant::now();
    let result = try_match(state, order_id);

    let outcome = match &result {
        Ok(_) => "offered",
        Err(DispatchError::NoAvailableDrivers { .. }) => "no_drivers",
        Err(_) => "rejected",
    };
    state
        .metrics
        .assign_latency_seconds
        .with_label_values(&[outcome])
        .observe(start.elapsed().as_secs_f64());
    state
        .metrics
        .assign_total
        .with_label_values(&[outcome])
        .inc();

    result
}

fn try_match(state: &AppState, order_id: &Uuid) -> Result<MatchResult, DispatchError> {
    let now = state.clock.now();
    let order = state.orders.require(order_id)?;

    match order.status {
        OrderStatus::Matching => {}
        OrderStatus::ActiveQueue => {
            state.orders.transition(
                order_id,
                OrderStatus::ActiveQueue,
                OrderStatus::Matching,
                now,
                |_| {},
            )?;
        }
        status => {
            return Err(DispatchError::InvalidOrderStatus {
                order_id: *order_id,
                status,
            });
        }
    }

    let exclusion_ttl = state.config.exclusion_ttl;
    let order = state
        .orders
        .modify(order_id, OrderStatus::Matching, now, |order| {
            order.match_attempts = order.match_attempts.saturating_add(1);
            order
                .excluded_drivers
                .retain(|_, since| *since + exclusion_ttl > now);
        })?;

    let ranked =
        state
            .selector
            .candidates(&state.drivers, &order, state.config.candidate_limit, now);

    if ranked.is_empty() {
        let suggestion = if order.excluded_drivers.is_empty() {
            format!(
                "no eligible driver in region {} or within {:.1} km of pickup; consider widening the cross-region radius",
                order.region,
                state.selector.cross_region_radius_km()
            )
        } else {
            format!(
                "{} recently declining driver(s) are excluded; the order will be retried after backoff or with a wider cross-region radius",
                order.excluded_drivers.len()
            )
        };
        return Err(park(state, &order, suggestion, now));
    }

    offer_first_available(state, &order, &ranked, now)
}

/// Walks the ranked list and offers the order to the first driver still
/// claimable. Drivers taken by a concurrent match since ranking are skipped.
fn offer_first_available(
    state: &AppState,
    order: &Order,
    ranked: &[ScoredCandidate],
    now: DateTime<Utc>,
) -> Result<MatchResult, DispatchError> {
    for candidate in ranked {
        let offer_id = Uuid::new_v4();

        match state.drivers.claim(&candidate.driver.id, offer_id, now) {
            Ok(_) => return issue_offer(state, order, candidate, offer_id, now),
            Err(DispatchError::ClaimConflict { driver_id }) => {
                state.metrics.claim_conflicts_total.inc();
                debug!(
                    order_id = %order.id,
                    driver_id = %driver_id,
                    "driver claimed by concurrent match; trying next candidate"
                );
            }
            Err(err) => {
                debug!(
                    order_id = %order.id,
                    driver_id = %candidate.driver.id,
                    error = %err,
                    "candidate unavailable at claim time"
                );
            }
        }
    }

    let suggestion = format!(
        "all {} ranked drivers were claimed by concurrent matches; the order will be retried",
        ranked.len()
    );
    Err(park(state, order, suggestion, now))
}

fn issue_offer(
    state: &AppState,
    order: &Order,
    candidate: &ScoredCandidate,
    offer_id: Uuid,
    now: DateTime<Utc>,
) -> Result<MatchResult, DispatchError> {
    let driver_id = candidate.driver.id;
    let offer = Offer {
        id: offer_id,
        order_id: order.id,
        driver_id,
        cost: candidate.cost,
        breakdown: candidate.breakdown,
        status: OfferStatus::Pending,
        created_at: now,
        expires_at: now + state.config.offer_ttl,
        resolved_at: None,
    };
    state.offers.insert(offer.clone());

    if let Err(err) = state.orders.transition(
        &order.id,
        OrderStatus::Matching,
        OrderStatus::Offered,
        now,
        |order| order.active_offer = Some(offer_id),
    ) {
        if let Ok(offer) = state.offers.resolve(&offer_id, OfferStatus::Superseded, now) {
            release_driver(state, &offer, DriverStatus::OnlineIdle, None, now);
        }
        return Err(err);
    }

    state.notifier.notify_driver(
        driver_id,
        OfferNotice {
            offer_id,
            order_id: order.id,
            status: OfferStatus::Pending,
            eta_seconds: candidate.breakdown.eta_seconds,
            expires_at: offer.expires_at,
            breakdown: Some(candidate.breakdown),
        },
    );
    state.notifier.notify_passenger(
        order.id,
        PassengerEvent::DriverOffered {
            driver_id,
            eta_seconds: candidate.breakdown.eta_seconds,
        },
    );

    info!(
        order_id = %order.id,
        driver_id = %driver_id,
        offer_id = %offer_id,
        cost = candidate.cost,
        eta_seconds = candidate.breakdown.eta_seconds,
        "offer issued"
    );

    Ok(MatchResult {
        order_id: order.id,
        driver_id,
        offer_id,
        eta_seconds: candidate.breakdown.eta_seconds,
        cost: candidate.cost,
        expires_at: offer.expires_at,
        breakdown: candidate.breakdown,
    })
}

/// Moves the order to ACTIVE_QUEUE and builds the error returned to the caller.
fn park(state: &AppState, order: &Order, suggestion: String, now: DateTime<Utc>) -> DispatchError {
    if let Err(err) = state.orders.transition(
        &order.id,
        OrderStatus::Matching,
        OrderStatus::ActiveQueue,
        now,
        |order| order.queued_at = now,
    ) {
        return err;
    }

    state.notifier.notify_passenger(
        order.id,
        PassengerEvent::Queued {
            reason: suggestion.clone(),
        },
    );
    warn!(
        order_id = %order.id,
        attempts = order.match_attempts,
        "no driver available; order parked in active queue"
    );

    DispatchError::NoAvailableDrivers {
        order_id: order.id,
        suggestion,
    }
}

/// A response that arrives after expiry loses to the timeout.
fn lapse(state: &AppState, offer: &Offer, now: DateTime<Utc>) -> Result<Resolution, DispatchError> {
    release_and_rematch(
        state,
        &offer.id,
        OfferStatus::Expired,
        DriverStatus::OnlineIdle,
        now,
    )?;

    Err(DispatchError::OfferAlreadyResolved {
        offer_id: offer.id,
        status: OfferStatus::Expired,
    })
}

fn release_and_rematch(
    state: &AppState,
    offer_id: &Uuid,
    terminal: OfferStatus,
    driver_to: DriverStatus,
    now: DateTime<Utc>,
) -> Result<Resolution, DispatchError> {
    let offer = state.offers.resolve(offer_id, terminal, now)?;
    release_driver(state, &offer, driver_to, Some(false), now);

    let order = state.orders.transition(
        &offer.order_id,
        OrderStatus::Offered,
        OrderStatus::Matching,
        now,
        |order| {
            order.active_offer = None;
            order.excluded_drivers.insert(offer.driver_id, now);
        },
    )?;

    info!(
        order_id = %order.id,
        driver_id = %offer.driver_id,
        offer_id = %offer.id,
        status = ?terminal,
        "offer released; re-matching order"
    );

    let rematch = MatchOutcome::from(matching_pass(state, &order.id));
    Ok(Resolution {
        offer,
        rematch: Some(rematch),
    })
}

/// Frees the driver held by a just-resolved offer and tells their device.
fn release_driver(
    state: &AppState,
    offer: &Offer,
    driver_to: DriverStatus,
    responded: Option<bool>,
    now: DateTime<Utc>,
) {
    state
        .metrics
        .offers_resolved_total
        .with_label_values(&[offer.status.as_label()])
        .inc();

    if let Err(err) = state.drivers.release_offer(
        &offer.driver_id,
        &offer.id,
        driver_to,
        responded,
        state.config.acceptance_window,
        now,
    ) {
        error!(
            offer_id = %offer.id,
            driver_id = %offer.driver_id,
            error = %err,
            "driver was not holding the resolved offer"
        );
    }

    state.notifier.notify_driver(
        offer.driver_id,
        OfferNotice {
            offer_id: offer.id,
            order_id: offer.order_id,
            status: offer.status,
            eta_seconds: offer.breakdown.eta_seconds,
            expires_at: offer.expires_at,
            breakdown: None,
        },
    );
}

fn inconsistent(offer: &Offer, entity: &str, err: DispatchError) -> DispatchError {
    error!(
        offer_id = %offer.id,
        order_id = %offer.order_id,
        driver_id = %offer.driver_id,
        error = %err,
        "{entity} out of step with accepted offer"
    );
    DispatchError::Internal(format!(
        "{entity} state diverged while accepting offer {}: {err}",
        offer.id
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::offer_first_available;
    use crate::clock::{Clock, ManualClock};
    use crate::config::DispatchConfig;
    use crate::engine::presence::{register_driver, NewDriver};
    use crate::engine::trips::{create_order, NewOrder};
    use crate::models::driver::{DriverStatus, GeoPoint};
    use crate::models::order::OrderStatus;
    use crate::state::AppState;

    fn driver(state: &AppState, lon: f64) -> Uuid {
        register_driver(
            state,
            NewDriver {
                name: "d".to_string(),
                region: "central".to_string(),
                location: GeoPoint { lat: 0.0, lon },
                capacity: 4,
                rating: 4.5,
                prior_offers: 0,
                prior_accepts: 0,
                online: true,
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn claim_conflict_falls_through_to_next_ranked_driver() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let state = AppState::with_clock(DispatchConfig::default(), 8, clock.clone());
        let near = driver(&state, 0.001);
        let far = driver(&state, 0.01);
        let order = create_order(
            &state,
            NewOrder {
                passenger_id: Uuid::new_v4(),
                pickup: GeoPoint { lat: 0.0, lon: 0.0 },
                dropoff: GeoPoint { lat: 0.05, lon: 0.05 },
                region: "central".to_string(),
                required_capacity: 1,
            },
        )
        .unwrap();

        let now = clock.now();
        let ranked = state.selector.candidates(&state.drivers, &order, 10, now);
        assert_eq!(ranked[0].driver.id, near);

        // Taken by another order after the ranking snapshot.
        state.drivers.claim(&near, Uuid::new_v4(), now).unwrap();

        let result = offer_first_available(&state, &order, &ranked, now).unwrap();

        assert_eq!(result.driver_id, far);
        assert_eq!(state.metrics.claim_conflicts_total.get(), 1);
        assert_eq!(state.orders.get(&order.id).unwrap().status, OrderStatus::Offered);
        assert_eq!(
            state.drivers.get(&far).unwrap().status,
            DriverStatus::OnlineOffered
        );
    }

    #[test]
    fn every_claim_lost_parks_the_order() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let state = AppState::with_clock(DispatchConfig::default(), 8, clock.clone());
        let only = driver(&state, 0.001);
        let order = create_order(
            &state,
            NewOrder {
                passenger_id: Uuid::new_v4(),
                pickup: GeoPoint { lat: 0.0, lon: 0.0 },
                dropoff: GeoPoint { lat: 0.05, lon: 0.05 },
                region: "central".to_string(),
                required_capacity: 1,
            },
        )
        .unwrap();

        let now = clock.now();
        let ranked = state.selector.candidates(&state.drivers, &order, 10, now);
        state.drivers.claim(&only, Uuid::new_v4(), now).unwrap();

        let err = offer_first_available(&state, &order, &ranked, now).unwrap_err();

        assert_eq!(err.kind(), "NoAvailableDrivers");
        assert_eq!(state.metrics.claim_conflicts_total.get(), 1);
        assert_eq!(
            state.orders.get(&order.id).unwrap().status,
            OrderStatus::ActiveQueue
        );
    }
}
