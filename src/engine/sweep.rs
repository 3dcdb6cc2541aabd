use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::offers::{assign, expire};
use crate::error::DispatchError;
use crate::models::order::OrderStatus;
use crate::state::AppState;

/// Single-flight guard: at most one sweep runs at a time, overlapping
/// attempts return immediately instead of queueing.
#[derive(Debug, Default)]
pub struct SweepGuard {
    running: AtomicBool,
}

pub struct SweepPermit<'a> {
    guard: &'a SweepGuard,
}

impl SweepGuard {
    pub fn try_enter(&self) -> Option<SweepPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SweepPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub offered: usize,
    pub requeued: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.expired == 0 && self.offered == 0 && self.requeued == 0
    }
}

/// One pass: expire lapsed offers, then retry queued orders past their
/// backoff, oldest first. Returns `None` when another sweep is in flight.
pub fn run_sweep(state: &AppState) -> Option<SweepReport> {
    let Some(_permit) = state.sweep_guard.try_enter() else {
        state
            .metrics
            .sweeps_total
            .with_label_values(&["coalesced"])
            .inc();
        debug!("sweep already in flight; skipping");
        return None;
    };

    let now = state.clock.now();
    let mut report = SweepReport::default();

    for offer_id in state.offers.due(now) {
        match expire(state, offer_id) {
            Ok(resolution) => {
                report.expired += 1;
                match resolution.rematch {
                    Some(outcome) if outcome.success => report.offered += 1,
                    Some(_) => report.requeued += 1,
                    None => {}
                }
            }
            // Resolved by the driver between listing and expiring.
            Err(DispatchError::OfferAlreadyResolved { .. }) => {}
            Err(err) => warn!(offer_id = %offer_id, error = %err, "failed to expire offer"),
        }
    }

    for order_id in state.orders.due_for_rematch(now, state.config.rematch_backoff) {
        match assign(state, order_id) {
            Ok(_) => report.offered += 1,
            Err(DispatchError::NoAvailableDrivers { .. }) => report.requeued += 1,
            Err(DispatchError::InvalidOrderStatus { .. }) => {}
            Err(err) => warn!(order_id = %order_id, error = %err, "re-match failed"),
        }
    }

    state
        .metrics
        .orders_in_active_queue
        .set(state.orders.count_in(OrderStatus::ActiveQueue) as i64);
    state
        .metrics
        .sweeps_total
        .with_label_values(&["completed"])
        .inc();

    Some(report)
}

pub async fn run_sweep_scheduler(state: Arc<AppState>) {
    let mut ticker = interval(state.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_ms = state.config.sweep_interval.as_millis() as u64,
        "sweep scheduler started"
    );

    loop {
        ticker.tick().await;

        let sweep_state = state.clone();
        match tokio::task::spawn_blocking(move || run_sweep(&sweep_state)).await {
            Ok(Some(report)) if !report.is_empty() => info!(
                expired = report.expired,
                offered = report.offered,
                requeued = report.requeued,
                "sweep finished"
            ),
            Ok(_) => {}
            Err(err) => error!(error = %err, "sweep task failed"),
        }
    }
}
