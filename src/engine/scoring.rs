use crate::config::{DispatchConfig, ScoringWeights};
use crate::geo::haversine_km;
use crate::models::driver::DriverSnapshot;
use crate::models::offer::ScoreBreakdown;
use crate::models::order::Order;

/// Cost model for a driver/order pairing. Lower cost is better.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
    average_speed_kmh: f64,
    eta_saturation_secs: f64,
    distance_saturation_km: f64,
    load_saturation: f64,
    acceptance_default: f64,
    acceptance_min_offers: u32,
}

impl Scorer {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            weights: config.weights,
            average_speed_kmh: config.average_speed_kmh,
            eta_saturation_secs: config.eta_saturation_secs,
            distance_saturation_km: config.distance_saturation_km,
            load_saturation: config.load_saturation,
            acceptance_default: config.acceptance_default,
            acceptance_min_offers: config.acceptance_min_offers,
        }
    }

    pub fn score(&self, driver: &DriverSnapshot, order: &Order) -> (f64, ScoreBreakdown) {
        let distance_km = finite_or_zero(haversine_km(&driver.location, &order.pickup));
        let eta_seconds = self.eta_seconds(distance_km);

        let acceptance_rate = if driver.offers_seen < self.acceptance_min_offers {
            self.acceptance_default
        } else {
            finite_or(driver.acceptance_rate, self.acceptance_default)
        }
        .clamp(0.0, 1.0);

        let breakdown = ScoreBreakdown {
            eta_seconds,
            eta_norm: saturate(eta_seconds, self.eta_saturation_secs),
            distance_km,
            distance_norm: saturate(distance_km, self.distance_saturation_km),
            acceptance_rate,
            rating_norm: (finite_or_zero(driver.rating) / 5.0).clamp(0.0, 1.0),
            recent_load: saturate(driver.recent_load as f64, self.load_saturation),
        };

        (self.weighted_cost(&breakdown), breakdown)
    }

    pub fn eta_seconds(&self, distance_km: f64) -> f64 {
        distance_km / self.average_speed_kmh * 3600.0
    }

    pub fn weighted_cost(&self, breakdown: &ScoreBreakdown) -> f64 {
        let w = &self.weights;

        (breakdown.eta_norm * w.w_eta)
            + (breakdown.distance_norm * w.w_distance)
            + ((1.0 - breakdown.acceptance_rate) * w.w_acceptance)
            + ((1.0 - breakdown.rating_norm) * w.w_rating)
            + (breakdown.recent_load * w.w_load)
    }
}

/// Maps [0, inf) onto [0, 1); `x == k` lands on 0.5.
fn saturate(x: f64, k: f64) -> f64 {
    let x = finite_or_zero(x).max(0.0);
    x / (x + k)
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

fn finite_or_zero(value: f64) -> f64 {
    finite_or(value, 0.0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::Scorer;
    use crate::config::DispatchConfig;
    use crate::models::driver::{DriverSnapshot, DriverStatus, GeoPoint};
    use crate::models::order::{Order, OrderStatus};

    fn driver(lat: f64, lon: f64, rating: f64, acceptance: f64, seen: u32, load: u32) -> DriverSnapshot {
        DriverSnapshot {
            id: Uuid::new_v4(),
            region: "central".to_string(),
            location: GeoPoint { lat, lon },
            location_updated_at: Utc::now(),
            capacity: 4,
            rating,
            status: DriverStatus::OnlineIdle,
            acceptance_rate: acceptance,
            offers_seen: seen,
            recent_load: load,
        }
    }

    fn order(lat: f64, lon: f64) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            passenger_id: Uuid::new_v4(),
            pickup: GeoPoint { lat, lon },
            dropoff: GeoPoint {
                lat: lat + 0.05,
                lon: lon + 0.05,
            },
            region: "central".to_string(),
            required_capacity: 1,
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
        }
    }

    fn scorer() -> Scorer {
        Scorer::new(&DispatchConfig::default())
    }

    #[test]
    fn eta_for_1_1_km_at_40_kmh_is_about_100_seconds() {
        let (_, breakdown) = scorer().score(&driver(0.0, 0.0, 4.0, 0.5, 10, 0), &order(0.0, 0.01));

        assert!((breakdown.distance_km - 1.112).abs() < 0.01);
        assert!((breakdown.eta_seconds - 100.0).abs() < 2.0);
    }

    #[test]
    fn closer_driver_costs_less_when_other_factors_match() {
        let pickup = order(53.5511, 9.9937);

        let (near, _) = scorer().score(&driver(53.5512, 9.9938, 4.5, 0.8, 10, 0), &pickup);
        let (far, _) = scorer().score(&driver(53.7, 10.2, 4.5, 0.8, 10, 0), &pickup);

        assert!(near < far);
    }

    #[test]
    fn recent_load_raises_cost() {
        let pickup = order(0.0, 0.0);

        let (rested, _) = scorer().score(&driver(0.0, 0.001, 4.5, 0.8, 10, 0), &pickup);
        let (tired, _) = scorer().score(&driver(0.0, 0.001, 4.5, 0.8, 10, 6), &pickup);

        assert!(tired > rested);
    }

    #[test]
    fn cold_start_driver_gets_neutral_acceptance() {
        let pickup = order(0.0, 0.0);

        let (_, breakdown) = scorer().score(&driver(0.0, 0.001, 4.5, 0.0, 2, 0), &pickup);

        assert_eq!(breakdown.acceptance_rate, 0.5);
    }

    #[test]
    fn cost_stays_within_unit_interval_for_extreme_inputs() {
        let pickup = order(0.0, 0.0);

        for snapshot in [
            driver(0.0, 0.0, 5.0, 1.0, 100, 0),
            driver(60.0, 170.0, 0.0, 0.0, 100, 500),
            driver(0.0, 0.0, f64::NAN, f64::INFINITY, 100, 0),
        ] {
            let (cost, _) = scorer().score(&snapshot, &pickup);
            assert!(cost.is_finite());
            assert!((0.0..=1.0).contains(&cost));
        }
    }
}
