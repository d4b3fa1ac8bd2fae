use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;

use crate::model::GeoPoint;

pub const DEFAULT_ONLINE_WINDOW_MS: u64 = 300_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_INITIAL_ZOOM: f64 = 16.0;
pub const DEFAULT_FALLBACK_LAT: f64 = 51.505;
pub const DEFAULT_FALLBACK_LON: f64 = -0.09;

#[derive(Debug, Clone)]
pub struct Config {
    pub online_window: Duration,
    pub marker_retry_delay: Duration,
    pub surface_retry_delay: Duration,

    pub fallback_position: GeoPoint,
    pub initial_zoom: f64,
    pub super_admin_id: Option<String>,

    pub locations_collection: String,
    pub incidents_collection: String,
    pub users_collection: String,

    pub geo_high_accuracy: bool,
    pub geo_timeout: Duration,
    pub geo_maximum_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            online_window: Duration::from_millis(DEFAULT_ONLINE_WINDOW_MS),
            marker_retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            surface_retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            fallback_position: GeoPoint::new(DEFAULT_FALLBACK_LAT, DEFAULT_FALLBACK_LON),
            initial_zoom: DEFAULT_INITIAL_ZOOM,
            super_admin_id: None,
            locations_collection: "locations".to_string(),
            incidents_collection: "incidents".to_string(),
            users_collection: "users".to_string(),
            geo_high_accuracy: true,
            geo_timeout: Duration::from_millis(10_000),
            geo_maximum_age: Duration::ZERO,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let online_window = Duration::from_millis(env_u64(
            "TRACKER_ONLINE_WINDOW_MS",
            Some(DEFAULT_ONLINE_WINDOW_MS),
        )?);
        let marker_retry_delay = Duration::from_millis(env_u64(
            "TRACKER_MARKER_RETRY_MS",
            Some(DEFAULT_RETRY_DELAY_MS),
        )?);
        let surface_retry_delay = Duration::from_millis(env_u64(
            "TRACKER_SURFACE_RETRY_MS",
            Some(DEFAULT_RETRY_DELAY_MS),
        )?);
        if marker_retry_delay.is_zero() || surface_retry_delay.is_zero() {
            return Err(anyhow!("retry delays must be greater than zero"));
        }

        let fallback_lat = env_f64("TRACKER_FALLBACK_LAT", Some(DEFAULT_FALLBACK_LAT))?;
        let fallback_lon = env_f64("TRACKER_FALLBACK_LON", Some(DEFAULT_FALLBACK_LON))?;
        let fallback_position = GeoPoint::new(fallback_lat, fallback_lon);
        if !fallback_position.is_valid() {
            return Err(anyhow!(
                "TRACKER_FALLBACK_LAT/TRACKER_FALLBACK_LON out of range: {fallback_lat}, {fallback_lon}"
            ));
        }

        let initial_zoom = env_f64("TRACKER_INITIAL_ZOOM", Some(DEFAULT_INITIAL_ZOOM))?;
        let super_admin_id = env_optional("TRACKER_SUPER_ADMIN_ID");

        let locations_collection =
            env_string("TRACKER_LOCATIONS_COLLECTION", Some("locations".to_string()))?;
        let incidents_collection =
            env_string("TRACKER_INCIDENTS_COLLECTION", Some("incidents".to_string()))?;
        let users_collection = env_string("TRACKER_USERS_COLLECTION", Some("users".to_string()))?;

        let geo_high_accuracy = env_bool("TRACKER_GEO_HIGH_ACCURACY", Some(true))?;
        let geo_timeout = Duration::from_millis(env_u64("TRACKER_GEO_TIMEOUT_MS", Some(10_000))?);
        let geo_maximum_age = Duration::from_millis(env_u64("TRACKER_GEO_MAX_AGE_MS", Some(0))?);

        Ok(Self {
            online_window,
            marker_retry_delay,
            surface_retry_delay,
            fallback_position,
            initial_zoom,
            super_admin_id,
            locations_collection,
            incidents_collection,
            users_collection,
            geo_high_accuracy,
            geo_timeout,
            geo_maximum_age,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<f64>()
                .with_context(|| format!("invalid {key}"))?;
            if !parsed.is_finite() {
                return Err(anyhow!("invalid {key}: not a finite number"));
            }
            Ok(parsed)
        }
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: Option<bool>) -> Result<bool> {
    match env::var(key) {
        Ok(value) => parse_bool(&value).ok_or_else(|| anyhow!("invalid {key}: expected a boolean")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("No"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.online_window, Duration::from_millis(300_000));
        assert_eq!(config.marker_retry_delay, Duration::from_millis(500));
        assert_eq!(config.locations_collection, "locations");
        assert!(config.fallback_position.is_valid());
        assert!(config.super_admin_id.is_none());
    }

    #[test]
    fn env_helpers_fall_back_to_defaults_for_unset_keys() {
        let key = "TRACKER_TEST_SURELY_UNSET_KEY";
        assert_eq!(env_u64(key, Some(7)).unwrap(), 7);
        assert_eq!(env_f64(key, Some(1.5)).unwrap(), 1.5);
        assert!(env_bool(key, Some(true)).unwrap());
        assert!(env_optional(key).is_none());
        assert!(env_string(key, None).is_err());
    }
}
