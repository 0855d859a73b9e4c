//! Process-wide configuration, loaded once from the environment.
//!
//! Grounded on `gateway/config/settings.py::Settings` for the full set
//! of environment variable names, types and defaults (including
//! `DEFAULT_BACKENDS`). Unlike the teacher's file-based
//! `load_settings()`, this reads directly from `std::env::var` — the
//! gateway described here is configured once at process start, not
//! reloaded from a file.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::services::load_balancer::Strategy;
use crate::services::rate_limiter::Algorithm;

/// One entry of `DEFAULT_BACKENDS`: an upstream to register at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_health_check")]
    pub health_check: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_health_check() -> String {
    "/".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub app_name: String,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub gateway_prefix: String,

    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,

    pub load_balancer_strategy: Strategy,
    pub load_balancer_retry_count: u32,
    pub load_balancer_retry_delay: Duration,

    pub rate_limit_enabled: bool,
    pub rate_limit_strategy: Algorithm,
    pub rate_limit_requests_per_minute: u64,
    pub rate_limit_burst_size: u64,

    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_failure_threshold: u64,
    pub circuit_breaker_success_threshold: u64,
    pub circuit_breaker_timeout: Duration,
    pub circuit_breaker_half_open_max_calls: u64,

    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    pub default_backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid integer for {key}: {value}")]
    InvalidInt { key: &'static str, value: String },
    #[error("invalid float for {key}: {value}")]
    InvalidFloat { key: &'static str, value: String },
    #[error("invalid boolean for {key}: {value}")]
    InvalidBool { key: &'static str, value: String },
    #[error("invalid value for {key}: {source}")]
    InvalidEnum { key: &'static str, source: String },
    #[error("malformed DEFAULT_BACKENDS JSON: {0}")]
    InvalidBackends(#[from] serde_json::Error),
}

impl GatewayConfig {
    /// Loads configuration from environment variables, applying the
    /// defaults from `gateway/config/settings.py` where a variable is
    /// unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(GatewayConfig {
            app_name: env_string("GATEWAY_APP_NAME", "gateway"),
            gateway_host: env_string("GATEWAY_HOST", "0.0.0.0"),
            gateway_port: env_parse("GATEWAY_PORT", 8080)?,
            gateway_prefix: env_string("GATEWAY_PREFIX", "/api"),

            health_check_interval: Duration::from_secs(env_parse("SERVICE_HEALTH_CHECK_INTERVAL", 30)?),
            health_check_timeout: Duration::from_secs(env_parse("SERVICE_HEALTH_CHECK_TIMEOUT", 5)?),

            load_balancer_strategy: env_enum("LOAD_BALANCER_STRATEGY", "round_robin")?,
            load_balancer_retry_count: env_parse("LOAD_BALANCER_RETRY_COUNT", 3)?,
            load_balancer_retry_delay: Duration::from_secs_f64(env_parse_f64(
                "LOAD_BALANCER_RETRY_DELAY",
                0.5,
            )?),

            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true)?,
            rate_limit_strategy: env_enum("RATE_LIMIT_STRATEGY", "token_bucket")?,
            rate_limit_requests_per_minute: env_parse("RATE_LIMIT_REQUESTS_PER_MINUTE", 100)?,
            rate_limit_burst_size: env_parse("RATE_LIMIT_BURST_SIZE", 10)?,

            circuit_breaker_enabled: env_bool("CIRCUIT_BREAKER_ENABLED", true)?,
            circuit_breaker_failure_threshold: env_parse("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
            circuit_breaker_success_threshold: env_parse("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", 2)?,
            circuit_breaker_timeout: Duration::from_secs(env_parse("CIRCUIT_BREAKER_TIMEOUT", 60)?),
            circuit_breaker_half_open_max_calls: env_parse("CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS", 3)?,

            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT", 30)?),
            connect_timeout: Duration::from_secs(env_parse("CONNECT_TIMEOUT", 5)?),

            default_backends: env_backends("DEFAULT_BACKENDS")?,
        })
    }

    /// Flags nonsensical values without failing startup (warnings), and
    /// reserves hard errors for values that simply cannot be acted on.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.gateway_port == 0 {
            result.errors.push("GATEWAY_PORT must be in 1..=65535".into());
        }
        if self.rate_limit_enabled && self.rate_limit_requests_per_minute == 0 {
            result
                .warnings
                .push("RATE_LIMIT_REQUESTS_PER_MINUTE is 0 with rate limiting enabled; every request will be rejected".into());
        }
        if self.circuit_breaker_enabled && self.circuit_breaker_failure_threshold == 0 {
            result
                .warnings
                .push("CIRCUIT_BREAKER_FAILURE_THRESHOLD is 0; the breaker will trip on the very first failure".into());
        }
        if self.circuit_breaker_success_threshold == 0 {
            result
                .warnings
                .push("CIRCUIT_BREAKER_SUCCESS_THRESHOLD is 0; half-open will close immediately on any call".into());
        }
        if self.default_backends.is_empty() {
            result
                .recommendations
                .push("DEFAULT_BACKENDS is empty; no service will be reachable until one is registered".into());
        }
        if self.health_check_timeout >= self.health_check_interval {
            result.warnings.push(
                "SERVICE_HEALTH_CHECK_TIMEOUT is >= SERVICE_HEALTH_CHECK_INTERVAL; ticks may overlap".into(),
            );
        }

        result.is_valid = result.errors.is_empty();
        result
    }
}

/// Accumulator for configuration sanity checks.
///
/// Grounded on the teacher's `config::validation::ValidationResult`
/// pattern: errors fail startup, warnings and recommendations are
/// logged but non-fatal.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub is_valid: bool,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidInt { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_parse_f64(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidFloat { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value }),
        },
        Err(_) => Ok(default),
    }
}

fn env_enum<T>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|source| ConfigError::InvalidEnum { key, source })
}

fn env_backends(key: &str) -> Result<HashMap<String, BackendConfig>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(_) => Ok(default_backends()),
    }
}

fn default_backends() -> HashMap<String, BackendConfig> {
    let mut backends = HashMap::new();
    backends.insert(
        "auth".to_string(),
        BackendConfig { url: "http://localhost:8000".to_string(), health_check: "/".to_string(), weight: 1 },
    );
    backends.insert(
        "model".to_string(),
        BackendConfig { url: "http://localhost:8001".to_string(), health_check: "/".to_string(), weight: 1 },
    );
    backends
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests
    // that touch them so they don't observe each other's writes.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_the_documented_table_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("DEFAULT_BACKENDS");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.gateway_port, 8080);
        assert_eq!(config.gateway_prefix, "/api");
        assert_eq!(config.default_backends.len(), 2);
    }

    #[test]
    fn invalid_integer_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("GATEWAY_PORT", "not-a-number");
        let result = GatewayConfig::from_env();
        std::env::remove_var("GATEWAY_PORT");
        assert!(result.is_err());
    }

    #[test]
    fn zero_port_fails_validation() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("GATEWAY_PORT");
        let mut config = GatewayConfig::from_env().unwrap();
        config.gateway_port = 0;
        let validation = config.validate();
        assert!(!validation.is_valid);
        assert_eq!(validation.errors.len(), 1);
    }

    #[test]
    fn zero_rpm_with_rate_limiting_enabled_is_only_a_warning() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("GATEWAY_PORT");
        let mut config = GatewayConfig::from_env().unwrap();
        config.rate_limit_enabled = true;
        config.rate_limit_requests_per_minute = 0;
        let validation = config.validate();
        assert!(validation.is_valid);
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn malformed_default_backends_json_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DEFAULT_BACKENDS", "{not json");
        let result = GatewayConfig::from_env();
        std::env::remove_var("DEFAULT_BACKENDS");
        assert!(result.is_err());
    }
}
