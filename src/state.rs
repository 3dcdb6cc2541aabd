use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::engine::candidates::CandidateSelector;
use crate::engine::sweep::SweepGuard;
use crate::notify::{BroadcastNotifier, Notifier};
use crate::observability::metrics::Metrics;
use crate::registry::drivers::DriverRegistry;
use crate::registry::locks::OrderLocks;
use crate::registry::offers::OfferRegistry;
use crate::registry::orders::OrderRegistry;

pub struct AppState {
    pub config: DispatchConfig,
    pub drivers: DriverRegistry,
    pub orders: OrderRegistry,
    pub offers: OfferRegistry,
    pub order_locks: OrderLocks,
    pub selector: CandidateSelector,
    pub events: BroadcastNotifier,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub sweep_guard: SweepGuard,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: DispatchConfig, event_buffer_size: usize) -> Self {
        Self::with_clock(config, event_buffer_size, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatchConfig,
        event_buffer_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = BroadcastNotifier::new(event_buffer_size);

        Self {
            selector: CandidateSelector::new(&config),
            config,
            drivers: DriverRegistry::new(),
            orders: OrderRegistry::new(),
            offers: OfferRegistry::new(),
            order_locks: OrderLocks::new(),
            notifier: Arc::new(events.clone()),
            events,
            clock,
            sweep_guard: SweepGuard::default(),
            metrics: Metrics::new(),
        }
    }

    /// Routes outbound notifications to `notifier` instead of the websocket feed.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
