use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Cost weights. Each term is normalized to [0, 1], so weights must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub w_eta: f64,
    pub w_distance: f64,
    pub w_acceptance: f64,
    pub w_rating: f64,
    pub w_load: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            w_eta: 0.35,
            w_distance: 0.15,
            w_acceptance: 0.20,
            w_rating: 0.15,
            w_load: 0.15,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.w_eta + self.w_distance + self.w_acceptance + self.w_rating + self.w_load
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let all = [
            self.w_eta,
            self.w_distance,
            self.w_acceptance,
            self.w_rating,
            self.w_load,
        ];

        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(DispatchError::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }

        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(DispatchError::Config(format!(
                "scoring weights must sum to 1, got {}",
                self.sum()
            )));
        }

        Ok(())
    }
}

/// Tunables of the matching engine. None of these are coupled to each other.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub weights: ScoringWeights,
    pub offer_ttl: Duration,
    pub location_freshness: Duration,
    pub cross_region_radius_km: f64,
    pub acceptance_default: f64,
    pub acceptance_min_offers: u32,
    pub acceptance_window: usize,
    pub average_speed_kmh: f64,
    pub eta_saturation_secs: f64,
    pub distance_saturation_km: f64,
    pub load_saturation: f64,
    pub sweep_interval: StdDuration,
    pub rematch_backoff: Duration,
    pub exclusion_ttl: Duration,
    pub candidate_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            offer_ttl: Duration::seconds(20),
            location_freshness: Duration::seconds(60),
            cross_region_radius_km: 3.0,
            acceptance_default: 0.5,
            acceptance_min_offers: 5,
            acceptance_window: 50,
            average_speed_kmh: 40.0,
            eta_saturation_secs: 600.0,
            distance_saturation_km: 5.0,
            load_saturation: 3.0,
            sweep_interval: StdDuration::from_secs(2),
            rematch_backoff: Duration::seconds(10),
            exclusion_ttl: Duration::seconds(120),
            candidate_limit: 10,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        self.weights.validate()?;

        if self.offer_ttl <= Duration::zero() {
            return Err(DispatchError::Config("offer ttl must be positive".to_string()));
        }
        if !(self.average_speed_kmh.is_finite() && self.average_speed_kmh > 0.0) {
            return Err(DispatchError::Config(
                "average speed must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.acceptance_default) {
            return Err(DispatchError::Config(
                "acceptance default must be within [0, 1]".to_string(),
            ));
        }
        let saturations = [
            self.eta_saturation_secs,
            self.distance_saturation_km,
            self.load_saturation,
        ];
        if saturations.iter().any(|k| !(k.is_finite() && *k > 0.0)) {
            return Err(DispatchError::Config(
                "saturation constants must be positive".to_string(),
            ));
        }
        if !(self.cross_region_radius_km.is_finite() && self.cross_region_radius_km >= 0.0) {
            return Err(DispatchError::Config(
                "cross-region radius must be finite and non-negative".to_string(),
            ));
        }
        if self.candidate_limit == 0 {
            return Err(DispatchError::Config(
                "candidate limit must be > 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(DispatchError::Config(
                "sweep interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    fn from_env() -> Result<Self, DispatchError> {
        let defaults = Self::default();
        let default_weights = defaults.weights;

        let config = Self {
            weights: ScoringWeights {
                w_eta: parse_or_default("DISPATCH_W_ETA", default_weights.w_eta)?,
                w_distance: parse_or_default("DISPATCH_W_DISTANCE", default_weights.w_distance)?,
                w_acceptance: parse_or_default(
                    "DISPATCH_W_ACCEPTANCE",
                    default_weights.w_acceptance,
                )?,
                w_rating: parse_or_default("DISPATCH_W_RATING", default_weights.w_rating)?,
                w_load: parse_or_default("DISPATCH_W_LOAD", default_weights.w_load)?,
            },
            offer_ttl: Duration::seconds(parse_or_default(
                "DISPATCH_OFFER_TTL_SECS",
                defaults.offer_ttl.num_seconds(),
            )?),
            location_freshness: Duration::seconds(parse_or_default(
                "DISPATCH_LOCATION_FRESHNESS_SECS",
                defaults.location_freshness.num_seconds(),
            )?),
            cross_region_radius_km: parse_or_default(
                "DISPATCH_CROSS_REGION_RADIUS_KM",
                defaults.cross_region_radius_km,
            )?,
            acceptance_default: parse_or_default(
                "DISPATCH_ACCEPTANCE_DEFAULT",
                defaults.acceptance_default,
            )?,
            acceptance_min_offers: parse_or_default(
                "DISPATCH_ACCEPTANCE_MIN_OFFERS",
                defaults.acceptance_min_offers,
            )?,
            acceptance_window: parse_or_default(
                "DISPATCH_ACCEPTANCE_WINDOW",
                defaults.acceptance_window,
            )?,
            average_speed_kmh: parse_or_default(
                "DISPATCH_AVERAGE_SPEED_KMH",
                defaults.average_speed_kmh,
            )?,
            eta_saturation_secs: parse_or_default(
                "DISPATCH_ETA_SATURATION_SECS",
                defaults.eta_saturation_secs,
            )?,
            distance_saturation_km: parse_or_default(
                "DISPATCH_DISTANCE_SATURATION_KM",
                defaults.distance_saturation_km,
            )?,
            load_saturation: parse_or_default("DISPATCH_LOAD_SATURATION", defaults.load_saturation)?,
            sweep_interval: StdDuration::from_millis(parse_or_default(
                "DISPATCH_SWEEP_INTERVAL_MS",
                defaults.sweep_interval.as_millis() as u64,
            )?),
            rematch_backoff: Duration::seconds(parse_or_default(
                "DISPATCH_REMATCH_BACKOFF_SECS",
                defaults.rematch_backoff.num_seconds(),
            )?),
            exclusion_ttl: Duration::seconds(parse_or_default(
                "DISPATCH_EXCLUSION_TTL_SECS",
                defaults.exclusion_ttl.num_seconds(),
            )?),
            candidate_limit: parse_or_default(
                "DISPATCH_CANDIDATE_LIMIT",
                defaults.candidate_limit,
            )?,
        };

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, DispatchError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(DispatchError::Config(format!(
                    "invalid LOG_FORMAT: {other}, expected compact or json"
                )));
            }
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, DispatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
