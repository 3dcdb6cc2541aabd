use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use chrono::{Duration, Utc};
use ride_dispatch::clock::{Clock, ManualClock};
use ride_dispatch::config::DispatchConfig;
use ride_dispatch::engine::offers::{accept, assign, cancel_order, decline, expire};
use ride_dispatch::engine::presence::{go_offline, register_driver, NewDriver};
use ride_dispatch::engine::sweep::run_sweep;
use ride_dispatch::engine::trips::{complete_trip, create_order, start_trip, NewOrder};
use ride_dispatch::error::DispatchError;
use ride_dispatch::models::driver::{DriverStatus, GeoPoint};
use ride_dispatch::models::offer::OfferStatus;
use ride_dispatch::models::order::OrderStatus;
use ride_dispatch::notify::{Notifier, OfferNotice, PassengerEvent};
use ride_dispatch::state::AppState;
use uuid::Uuid;

fn setup(config: DispatchConfig) -> (AppState, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    (AppState::with_clock(config, 64, clock.clone()), clock)
}

fn driver_at(state: &AppState, lat: f64, lon: f64) -> Uuid {
    register_driver(
        state,
        NewDriver {
            name: "driver".to_string(),
            region: "central".to_string(),
            location: GeoPoint { lat, lon },
            capacity: 4,
            rating: 4.0,
            prior_offers: 10,
            prior_accepts: 5,
            online: true,
        },
    )
    .unwrap()
    .id
}

fn order_at(state: &AppState, lat: f64, lon: f64) -> Uuid {
    create_order(
        state,
        NewOrder {
            passenger_id: Uuid::new_v4(),
            pickup: GeoPoint { lat, lon },
            dropoff: GeoPoint {
                lat: lat + 0.05,
                lon: lon + 0.05,
            },
            region: "central".to_string(),
            required_capacity: 1,
        },
    )
    .unwrap()
    .id
}

fn order_status(state: &AppState, order_id: &Uuid) -> OrderStatus {
    state.orders.get(order_id).unwrap().status
}

fn driver_status(state: &AppState, driver_id: &Uuid) -> DriverStatus {
    state.drivers.get(driver_id).unwrap().status
}

#[test]
fn nearby_driver_is_offered_with_expected_eta() {
    let (state, _clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.0);
    let order_id = order_at(&state, 0.0, 0.01);

    let result = assign(&state, order_id).unwrap();

    assert_eq!(result.driver_id, driver_id);
    assert!((95.0..105.0).contains(&result.eta_seconds));
    assert_eq!(order_status(&state, &order_id), OrderStatus::Offered);
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineOffered);
    assert_eq!(state.offers.pending_for_order(&order_id), 1);
    assert_eq!(state.offers.pending_for_driver(&driver_id), 1);
}

#[test]
fn order_without_eligible_drivers_is_parked() {
    let (state, _clock) = setup(DispatchConfig::default());
    // Different region and far beyond the cross-region radius.
    register_driver(
        &state,
        NewDriver {
            name: "elsewhere".to_string(),
            region: "north".to_string(),
            location: GeoPoint { lat: 1.0, lon: 1.0 },
            capacity: 4,
            rating: 4.0,
            prior_offers: 0,
            prior_accepts: 0,
            online: true,
        },
    )
    .unwrap();
    let order_id = order_at(&state, 0.0, 0.0);

    let err = assign(&state, order_id).unwrap_err();

    assert!(matches!(err, DispatchError::NoAvailableDrivers { .. }));
    assert!(err.suggestion().is_some());
    assert_eq!(order_status(&state, &order_id), OrderStatus::ActiveQueue);
    assert_eq!(state.offers.len(), 0);
}

#[test]
fn concurrent_assigns_never_double_book_a_driver() {
    let (state, _clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.0);
    let first = order_at(&state, 0.0, 0.001);
    let second = order_at(&state, 0.0, 0.002);
    let barrier = Barrier::new(2);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|order_id| {
                let (state, barrier) = (&state, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    assign(state, order_id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let offered = results.iter().filter(|r| r.is_ok()).count();
    let parked = results
        .iter()
        .filter(|r| matches!(r, Err(DispatchError::NoAvailableDrivers { .. })))
        .count();

    assert_eq!(offered, 1);
    assert_eq!(parked, 1);
    assert_eq!(state.offers.pending_for_driver(&driver_id), 1);
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineOffered);
}

#[test]
fn concurrent_assigns_with_two_drivers_both_get_offers() {
    let (state, _clock) = setup(DispatchConfig::default());
    let near = driver_at(&state, 0.0, 0.0);
    let far = driver_at(&state, 0.0, 0.005);
    let first = order_at(&state, 0.0, 0.001);
    let second = order_at(&state, 0.0, 0.001);
    let barrier = Barrier::new(2);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|order_id| {
                let (state, barrier) = (&state, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    assign(state, order_id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut drivers: Vec<Uuid> = results
        .into_iter()
        .map(|result| result.unwrap().driver_id)
        .collect();
    drivers.sort();
    let mut expected = vec![near, far];
    expected.sort();

    assert_eq!(drivers, expected);
    assert_eq!(state.offers.pending_for_driver(&near), 1);
    assert_eq!(state.offers.pending_for_driver(&far), 1);
}

#[test]
fn going_offline_while_being_offered_never_loses_the_driver() {
    for _ in 0..200 {
        let (state, _clock) = setup(DispatchConfig::default());
        let driver_id = driver_at(&state, 0.0, 0.001);
        let order_id = order_at(&state, 0.0, 0.0);
        let barrier = Barrier::new(2);

        let (assigned, offline) = std::thread::scope(|scope| {
            let assigning = scope.spawn(|| {
                barrier.wait();
                assign(&state, order_id)
            });
            let leaving = scope.spawn(|| {
                barrier.wait();
                go_offline(&state, driver_id)
            });
            (assigning.join().unwrap(), leaving.join().unwrap())
        });

        assert!(matches!(
            assigned,
            Ok(_) | Err(DispatchError::NoAvailableDrivers { .. })
        ));
        let driver = offline.unwrap();
        assert_eq!(driver.status, DriverStatus::Offline);

        let driver = state.drivers.get(&driver_id).unwrap();
        assert!(driver.active_offer.is_none());
        assert_eq!(state.offers.pending_for_driver(&driver_id), 0);
        assert_eq!(order_status(&state, &order_id), OrderStatus::ActiveQueue);
    }
}

#[test]
fn unanswered_offer_expires_on_sweep() {
    let config = DispatchConfig {
        offer_ttl: Duration::seconds(15),
        ..DispatchConfig::default()
    };
    let (state, clock) = setup(config);
    let driver_id = driver_at(&state, 0.0, 0.0);
    let order_id = order_at(&state, 0.0, 0.01);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    clock.advance(Duration::seconds(14));
    let report = run_sweep(&state).unwrap();
    assert_eq!(report.expired, 0);
    assert_eq!(
        state.offers.get(&offer_id).unwrap().status,
        OfferStatus::Pending
    );

    clock.advance(Duration::seconds(1));
    let report = run_sweep(&state).unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.requeued, 1);

    assert_eq!(
        state.offers.get(&offer_id).unwrap().status,
        OfferStatus::Expired
    );
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineIdle);
    // The only driver is excluded after letting the offer lapse.
    assert_eq!(order_status(&state, &order_id), OrderStatus::ActiveQueue);

    let driver = state.drivers.get(&driver_id).unwrap();
    assert_eq!(driver.acceptance.offers_seen(), 11);
    assert!(driver.active_offer.is_none());
}

#[test]
fn expiring_twice_reports_already_resolved() {
    let (state, clock) = setup(DispatchConfig::default());
    driver_at(&state, 0.0, 0.0);
    let order_id = order_at(&state, 0.0, 0.01);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    clock.advance(Duration::seconds(30));
    expire(&state, offer_id).unwrap();

    assert!(matches!(
        expire(&state, offer_id),
        Err(DispatchError::OfferAlreadyResolved {
            status: OfferStatus::Expired,
            ..
        })
    ));
}

#[test]
fn late_accept_loses_to_the_timeout() {
    let (state, clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.0);
    let order_id = order_at(&state, 0.0, 0.01);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    clock.advance(state.config.offer_ttl);

    assert!(matches!(
        accept(&state, offer_id),
        Err(DispatchError::OfferAlreadyResolved {
            status: OfferStatus::Expired,
            ..
        })
    ));
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineIdle);
    assert_ne!(order_status(&state, &order_id), OrderStatus::Assigned);
}

#[test]
fn decline_reoffers_to_next_driver() {
    let (state, _clock) = setup(DispatchConfig::default());
    let near = driver_at(&state, 0.0, 0.001);
    let far = driver_at(&state, 0.0, 0.02);
    let order_id = order_at(&state, 0.0, 0.0);

    let first = assign(&state, order_id).unwrap();
    assert_eq!(first.driver_id, near);

    let resolution = decline(&state, first.offer_id).unwrap();
    assert_eq!(resolution.offer.status, OfferStatus::Declined);

    let rematch = resolution.rematch.unwrap();
    assert!(rematch.success);
    assert_eq!(rematch.offer.unwrap().driver_id, far);

    assert_eq!(driver_status(&state, &near), DriverStatus::OnlineIdle);
    assert_eq!(driver_status(&state, &far), DriverStatus::OnlineOffered);
    assert_eq!(state.offers.pending_for_order(&order_id), 1);
    assert!(state.orders.get(&order_id).unwrap().excluded_drivers.contains_key(&near));
}

#[test]
fn decline_by_only_driver_parks_the_order() {
    let (state, _clock) = setup(DispatchConfig::default());
    driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    let resolution = decline(&state, offer_id).unwrap();

    let rematch = resolution.rematch.unwrap();
    assert!(!rematch.success);
    assert_eq!(rematch.error.as_deref(), Some("NoAvailableDrivers"));
    assert_eq!(order_status(&state, &order_id), OrderStatus::ActiveQueue);
}

#[test]
fn queued_order_is_retried_after_backoff() {
    let (state, clock) = setup(DispatchConfig::default());
    let order_id = order_at(&state, 0.0, 0.0);
    assert!(assign(&state, order_id).is_err());

    let driver_id = driver_at(&state, 0.0, 0.001);

    let report = run_sweep(&state).unwrap();
    assert_eq!(report.offered, 0);
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineIdle);
    assert_eq!(order_status(&state, &order_id), OrderStatus::ActiveQueue);

    clock.advance(state.config.rematch_backoff);

    let report = run_sweep(&state).unwrap();
    assert_eq!(report.offered, 1);
    assert_eq!(order_status(&state, &order_id), OrderStatus::Offered);
}

#[test]
fn overlapping_sweep_is_coalesced() {
    let (state, _clock) = setup(DispatchConfig::default());

    let permit = state.sweep_guard.try_enter().unwrap();
    assert!(run_sweep(&state).is_none());
    drop(permit);

    assert!(run_sweep(&state).is_some());
}

#[test]
fn stale_heartbeat_excludes_driver() {
    let (state, clock) = setup(DispatchConfig::default());
    driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);

    clock.advance(state.config.location_freshness + Duration::seconds(1));

    assert!(matches!(
        assign(&state, order_id),
        Err(DispatchError::NoAvailableDrivers { .. })
    ));
}

#[test]
fn candidate_lists_are_prefixes_of_longer_lists() {
    let (state, clock) = setup(DispatchConfig::default());
    for step in 1..=6 {
        driver_at(&state, 0.0, step as f64 * 0.002);
    }
    let order_id = order_at(&state, 0.0, 0.0);
    let order = state.orders.get(&order_id).unwrap();

    let short = state
        .selector
        .candidates(&state.drivers, &order, 3, clock.now());
    let long = state
        .selector
        .candidates(&state.drivers, &order, 6, clock.now());

    assert_eq!(short.len(), 3);
    assert_eq!(long.len(), 6);
    for (a, b) in short.iter().zip(&long) {
        assert_eq!(a.driver.id, b.driver.id);
    }
    assert!(long.windows(2).all(|pair| pair[0].cost <= pair[1].cost));
}

#[test]
fn cancelling_an_offered_order_supersedes_without_penalty() {
    let (state, _clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;
    let seen_before = state.drivers.get(&driver_id).unwrap().acceptance.offers_seen();

    let cancelled = cancel_order(&state, order_id).unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(
        state.offers.get(&offer_id).unwrap().status,
        OfferStatus::Superseded
    );
    let driver = state.drivers.get(&driver_id).unwrap();
    assert_eq!(driver.status, DriverStatus::OnlineIdle);
    assert_eq!(driver.acceptance.offers_seen(), seen_before);

    assert!(matches!(
        accept(&state, offer_id),
        Err(DispatchError::OfferAlreadyResolved {
            status: OfferStatus::Superseded,
            ..
        })
    ));
}

#[test]
fn assigned_order_cannot_be_cancelled_or_reassigned() {
    let (state, _clock) = setup(DispatchConfig::default());
    driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;
    accept(&state, offer_id).unwrap();

    assert!(matches!(
        cancel_order(&state, order_id),
        Err(DispatchError::InvalidOrderStatus {
            status: OrderStatus::Assigned,
            ..
        })
    ));
    assert!(matches!(
        assign(&state, order_id),
        Err(DispatchError::InvalidOrderStatus { .. })
    ));
}

#[test]
fn trip_lifecycle_frees_the_driver() {
    let (state, _clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    accept(&state, offer_id).unwrap();
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::OnlineBusy);

    start_trip(&state, order_id).unwrap();
    let completed = complete_trip(&state, order_id).unwrap();

    assert_eq!(completed.status, OrderStatus::Completed);
    assert_eq!(completed.served_by, Some(driver_id));
    assert!(completed.assigned_driver.is_none());

    let driver = state.drivers.get(&driver_id).unwrap();
    assert_eq!(driver.status, DriverStatus::OnlineIdle);
    assert!(driver.current_order.is_none());
    assert_eq!(driver.trips.len(), 1);
}

#[test]
fn going_offline_with_pending_offer_rematches_the_order() {
    let (state, _clock) = setup(DispatchConfig::default());
    let leaving = driver_at(&state, 0.0, 0.001);
    let staying = driver_at(&state, 0.0, 0.01);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;

    let driver = go_offline(&state, leaving).unwrap();

    assert_eq!(driver.status, DriverStatus::Offline);
    assert_eq!(
        state.offers.get(&offer_id).unwrap().status,
        OfferStatus::Declined
    );
    assert_eq!(driver_status(&state, &staying), DriverStatus::OnlineOffered);
    assert_eq!(order_status(&state, &order_id), OrderStatus::Offered);
}

#[test]
fn going_offline_mid_trip_flags_the_order() {
    let (state, _clock) = setup(DispatchConfig::default());
    let driver_id = driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;
    accept(&state, offer_id).unwrap();
    start_trip(&state, order_id).unwrap();

    go_offline(&state, driver_id).unwrap();

    let order = state.orders.get(&order_id).unwrap();
    assert_eq!(order.status, OrderStatus::InProgress);
    assert!(order.review_flag.is_some());

    // The trip can still be closed out; the driver stays offline.
    complete_trip(&state, order_id).unwrap();
    assert_eq!(driver_status(&state, &driver_id), DriverStatus::Offline);
}

#[derive(Default)]
struct CountingNotifier {
    driver_notices: AtomicUsize,
    passenger_events: AtomicUsize,
}

impl Notifier for CountingNotifier {
    fn notify_driver(&self, _driver_id: Uuid, _notice: OfferNotice) {
        self.driver_notices.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_passenger(&self, _order_id: Uuid, _event: PassengerEvent) {
        self.passenger_events.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn notifications_go_to_the_configured_notifier() {
    let counter = Arc::new(CountingNotifier::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let state = AppState::with_clock(DispatchConfig::default(), 8, clock)
        .with_notifier(counter.clone());

    driver_at(&state, 0.0, 0.001);
    let order_id = order_at(&state, 0.0, 0.0);
    let offer_id = assign(&state, order_id).unwrap().offer_id;
    decline(&state, offer_id).unwrap();

    // Offer notice plus the declined notice.
    assert_eq!(counter.driver_notices.load(Ordering::SeqCst), 2);
    // Driver offered, then queued after the decline.
    assert_eq!(counter.passenger_events.load(Ordering::SeqCst), 2);
}
