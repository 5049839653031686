use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub jwt_secret: String,
    pub event_buffer_size: usize,
    pub sweep_interval: Duration,
    pub dispatch: DispatchSettings,
}

/// Tunables for discovery and the offer protocol.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub offer_timeout: Duration,
    pub session_retention: Duration,
    pub location_freshness: chrono::Duration,
    pub search_radius_km: f64,
    pub max_candidates: usize,
    pub stale_ride_after: chrono::Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(120),
            session_retention: Duration::from_secs(30),
            location_freshness: chrono::Duration::minutes(30),
            search_radius_km: 10.0,
            max_candidates: 3,
            stale_ride_after: chrono::Duration::minutes(15),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = DispatchSettings::default();
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Internal("JWT_SECRET must be set".to_string()))?;

        let max_candidates: usize = parse_or_default("MAX_CANDIDATES", defaults.max_candidates)?;
        if max_candidates == 0 {
            return Err(AppError::Internal("MAX_CANDIDATES must be > 0".to_string()));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 5000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            jwt_secret,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            sweep_interval: Duration::from_secs(parse_or_default("SWEEP_INTERVAL_SECS", 60)?),
            dispatch: DispatchSettings {
                offer_timeout: Duration::from_secs(parse_or_default("OFFER_TIMEOUT_SECS", 120)?),
                session_retention: Duration::from_secs(parse_or_default(
                    "SESSION_RETENTION_SECS",
                    30,
                )?),
                location_freshness: chrono::Duration::minutes(parse_or_default(
                    "LOCATION_FRESHNESS_MINS",
                    30,
                )?),
                search_radius_km: parse_or_default("SEARCH_RADIUS_KM", defaults.search_radius_km)?,
                max_candidates,
                stale_ride_after: chrono::Duration::seconds(parse_or_default(
                    "STALE_RIDE_SECS",
                    900,
                )?),
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
