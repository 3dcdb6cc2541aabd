use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use uuid::Uuid;

/// One mutex per order. Everything that moves an order's status or offer
/// reference runs inside `with_lock` for that order, so unrelated orders never
/// contend with each other.
#[derive(Default)]
pub struct OrderLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock<R>(&self, order_id: &Uuid, f: impl FnOnce() -> R) -> R {
        // Clone the Arc out so the map shard is not held while we wait.
        let lock = self.locks.entry(*order_id).or_default().clone();
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drops the lock of an order that reached a terminal state.
    pub fn forget(&self, order_id: &Uuid) {
        self.locks.remove(order_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
