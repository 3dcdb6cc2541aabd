use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::order::{Order, OrderStatus};

#[derive(Default)]
pub struct OrderRegistry {
    orders: DashMap<Uuid, Order>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    pub fn get(&self, order_id: &Uuid) -> Option<Order> {
        self.orders.get(order_id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, order_id: &Uuid) -> Result<Order, DispatchError> {
        self.get(order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))
    }

    pub fn list(&self) -> Vec<Order> {
        self.orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn count_in(&self, status: OrderStatus) -> usize {
        self.orders
            .iter()
            .filter(|entry| entry.value().status == status)
            .count()
    }

    /// Compare-and-set: applies only if the order is currently `from`.
    pub fn transition<F>(
        &self,
        order_id: &Uuid,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Order, DispatchError>
    where
        F: FnOnce(&mut Order),
    {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;

        if order.status != from || !from.can_transition_to(to) {
            return Err(DispatchError::InvalidOrderStatus {
                order_id: *order_id,
                status: order.status,
            });
        }

        order.status = to;
        apply(&mut order);
        order.updated_at = now;

        Ok(order.clone())
    }

    /// Updates non-status fields, guarded on the order still being `expected`.
    pub fn modify<F>(
        &self,
        order_id: &Uuid,
        expected: OrderStatus,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Order, DispatchError>
    where
        F: FnOnce(&mut Order),
    {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;

        if order.status != expected {
            return Err(DispatchError::InvalidOrderStatus {
                order_id: *order_id,
                status: order.status,
            });
        }

        apply(&mut order);
        order.updated_at = now;

        Ok(order.clone())
    }

    /// Marks an assigned or running order for administrative follow-up
    /// without touching its status.
    pub fn flag_for_review(
        &self,
        order_id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Order, DispatchError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;

        if !matches!(order.status, OrderStatus::Assigned | OrderStatus::InProgress) {
            return Err(DispatchError::InvalidOrderStatus {
                order_id: *order_id,
                status: order.status,
            });
        }

        order.review_flag = Some(reason.to_string());
        order.updated_at = now;

        Ok(order.clone())
    }

    /// Queued orders whose backoff has elapsed, oldest queue entry first.
    pub fn due_for_rematch(&self, now: DateTime<Utc>, backoff: Duration) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .orders
            .iter()
            .filter_map(|entry| {
                let order = entry.value();
                let ready = order.status == OrderStatus::ActiveQueue
                    && order.queued_at + backoff <= now;
                ready.then_some((order.queued_at, order.id))
            })
            .collect();

        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }
}
