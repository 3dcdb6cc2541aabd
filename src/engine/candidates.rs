use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::engine::scoring::Scorer;
use crate::geo::haversine_km;
use crate::models::driver::{DriverSnapshot, DriverStatus, GeoPoint};
use crate::models::offer::ScoreBreakdown;
use crate::models::order::Order;

#[derive(Debug, Clone)]
pub struct DriverQuery {
    pub region: String,
    pub origin: GeoPoint,
    pub radius_km: f64,
    pub min_capacity: u8,
    pub now: DateTime<Utc>,
}

/// Source of driver snapshots. Implementations may over-return; the selector
/// re-checks every eligibility rule itself.
pub trait DriverDirectory: Send + Sync {
    fn eligible_drivers(&self, query: &DriverQuery) -> Vec<DriverSnapshot>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub driver: DriverSnapshot,
    pub cost: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    NotIdle(DriverStatus),
    OutOfRegion,
    StaleLocation,
    InsufficientCapacity,
    Excluded,
}

pub struct CandidateSelector {
    scorer: Scorer,
    location_freshness: Duration,
    cross_region_radius_km: f64,
    exclusion_ttl: Duration,
}

impl CandidateSelector {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            scorer: Scorer::new(config),
            location_freshness: config.location_freshness,
            cross_region_radius_km: config.cross_region_radius_km,
            exclusion_ttl: config.exclusion_ttl,
        }
    }

    pub fn cross_region_radius_km(&self) -> f64 {
        self.cross_region_radius_km
    }

    /// Ranks eligible drivers for `order`, cheapest first, ties by driver id.
    /// Each call takes a fresh snapshot from the directory.
    pub fn candidates(
        &self,
        directory: &dyn DriverDirectory,
        order: &Order,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<ScoredCandidate> {
        let query = DriverQuery {
            region: order.region.clone(),
            origin: order.pickup,
            radius_km: self.cross_region_radius_km,
            min_capacity: order.required_capacity,
            now,
        };

        let mut ranked: Vec<ScoredCandidate> = directory
            .eligible_drivers(&query)
            .into_iter()
            .filter(|driver| match self.check(driver, order, now) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(
                        order_id = %order.id,
                        driver_id = %driver.id,
                        reason = ?reason,
                        "driver filtered out"
                    );
                    false
                }
            })
            .map(|driver| {
                let (cost, breakdown) = self.scorer.score(&driver, order);
                ScoredCandidate {
                    driver,
                    cost,
                    breakdown,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.cost
                .total_cmp(&b.cost)
                .then_with(|| a.driver.id.cmp(&b.driver.id))
        });
        ranked.dedup_by_key(|candidate| candidate.driver.id);
        ranked.truncate(limit);
        ranked
    }

    pub fn check(
        &self,
        driver: &DriverSnapshot,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<(), Ineligible> {
        if driver.status != DriverStatus::OnlineIdle {
            return Err(Ineligible::NotIdle(driver.status));
        }
        if now - driver.location_updated_at > self.location_freshness {
            return Err(Ineligible::StaleLocation);
        }
        if driver.capacity < order.required_capacity {
            return Err(Ineligible::InsufficientCapacity);
        }
        if driver.region != order.region
            && haversine_km(&driver.location, &order.pickup) > self.cross_region_radius_km
        {
            return Err(Ineligible::OutOfRegion);
        }
        if order.is_excluded(&driver.id, now, self.exclusion_ttl) {
            return Err(Ineligible::Excluded);
        }

        Ok(())
    }
}
