//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::util::rate_limit::MATCHMAKING_RATE_LIMIT;

/// Matchmaking configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct MatchmakingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// How often a searching client refreshes `lastHeartbeat`
    pub heartbeat_interval: Duration,
    /// Entries older than this are never chosen as opponents
    pub discovery_staleness: Duration,
    /// Tighter bound checked inside the match transaction
    pub transaction_staleness: Duration,
    /// Bounded wait for an authenticated principal
    pub auth_timeout: Duration,
    /// Pause after the pre-join cleanup
    pub settle_delay: Duration,
    /// Upper bound of the random delay before the immediate scan
    pub max_jitter: Duration,
    /// Fixed seed for the jitter RNG (deterministic runs)
    pub jitter_seed: Option<u64>,
    /// Rating written when the principal has none
    pub default_rating: f64,
    /// Interval of the fallback poll for matches addressed to this client
    pub reconcile_interval: Duration,
    /// Candidates tried by one immediate scan
    pub max_discovery_attempts: usize,
    /// Commit attempts of one match transaction
    pub max_transaction_attempts: usize,
    /// Join attempts allowed per second
    pub join_rate_limit: u32,
    /// Ready matches older than this are swept
    pub match_retention: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            discovery_staleness: Duration::from_secs(30),
            transaction_staleness: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(300),
            jitter_seed: None,
            default_rating: 1000.0,
            reconcile_interval: Duration::from_secs(10),
            max_discovery_attempts: 5,
            max_transaction_attempts: 5,
            join_rate_limit: MATCHMAKING_RATE_LIMIT,
            match_retention: Duration::from_secs(600),
        }
    }
}

impl MatchmakingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, defaulting absent keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let millis = |key: &'static str, fallback: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64, _>(&lookup, key)?
                .map(Duration::from_millis)
                .unwrap_or(fallback))
        };

        Ok(Self {
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            heartbeat_interval: millis("MM_HEARTBEAT_MS", defaults.heartbeat_interval)?,
            discovery_staleness: millis("MM_DISCOVERY_STALE_MS", defaults.discovery_staleness)?,
            transaction_staleness: millis(
                "MM_TRANSACTION_STALE_MS",
                defaults.transaction_staleness,
            )?,
            auth_timeout: millis("MM_AUTH_TIMEOUT_MS", defaults.auth_timeout)?,
            settle_delay: millis("MM_SETTLE_DELAY_MS", defaults.settle_delay)?,
            max_jitter: millis("MM_MAX_JITTER_MS", defaults.max_jitter)?,
            jitter_seed: parse_var(&lookup, "MM_JITTER_SEED")?,
            default_rating: parse_var(&lookup, "MM_DEFAULT_RATING")?
                .unwrap_or(defaults.default_rating),
            reconcile_interval: millis("MM_RECONCILE_MS", defaults.reconcile_interval)?,
            max_discovery_attempts: parse_var(&lookup, "MM_DISCOVERY_ATTEMPTS")?
                .unwrap_or(defaults.max_discovery_attempts),
            max_transaction_attempts: parse_var(&lookup, "MM_TRANSACTION_ATTEMPTS")?
                .unwrap_or(defaults.max_transaction_attempts),
            join_rate_limit: parse_var(&lookup, "MM_JOIN_RATE_LIMIT")?
                .unwrap_or(defaults.join_rate_limit),
            match_retention: millis("MM_MATCH_RETENTION_MS", defaults.match_retention)?,
        })
    }

    pub fn discovery_staleness_millis(&self) -> u64 {
        self.discovery_staleness.as_millis() as u64
    }

    pub fn transaction_staleness_millis(&self) -> u64 {
        self.transaction_staleness.as_millis() as u64
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key)),
        None => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn absent_variables_use_defaults() {
        let config = MatchmakingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.discovery_staleness, Duration::from_secs(30));
        assert_eq!(config.transaction_staleness, Duration::from_secs(10));
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.default_rating, 1000.0);
        assert!(config.jitter_seed.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = MatchmakingConfig::from_lookup(lookup(&[
            ("MM_HEARTBEAT_MS", "2000"),
            ("MM_JITTER_SEED", "42"),
            ("MM_DEFAULT_RATING", "1234.5"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.jitter_seed, Some(42));
        assert_eq!(config.default_rating, 1234.5);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = MatchmakingConfig::from_lookup(lookup(&[("MM_DEFAULT_RATING", "high")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MM_DEFAULT_RATING")));
    }
}
