use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use validator::{Validate, ValidationError};

use crate::error::GatewayError;
use crate::throttle::ThrottleSettings;

/// Service configuration, read from flags or the environment.
#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "persona-gateway", version, about = "Persona explanation gateway")]
#[validate(schema(function = "validate_upstream"))]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level for this crate when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Requests admitted per client before the cooldown starts
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    #[validate(range(min = 1, message = "Rate limit must be greater than 0"))]
    pub rate_limit: u32,

    /// How long a client is denied once it reaches the limit
    #[arg(long, env = "RATE_LIMIT_COOLDOWN", default_value = "15m")]
    pub cooldown: humantime::Duration,

    /// Idle time after which a client's record is dropped
    #[arg(long, env = "RATE_LIMIT_RETENTION", default_value = "15m")]
    pub retention: humantime::Duration,

    /// How often idle records are swept
    #[arg(long, env = "RATE_LIMIT_SWEEP_INTERVAL", default_value = "10m")]
    pub sweep_interval: humantime::Duration,

    /// Shared upstream credential protected by the throttle
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub gemini_base_url: String,

    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.5-flash")]
    #[validate(length(min = 1, message = "Model name cannot be empty"))]
    pub gemini_model: String,

    /// Timeout for each upstream generation request
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value = "30s")]
    pub upstream_timeout: humantime::Duration,
}

impl Config {
    pub fn throttle_settings(&self) -> ThrottleSettings {
        ThrottleSettings::new(self.rate_limit, *self.cooldown, *self.retention)
    }

    pub fn sweep_interval(&self) -> Duration {
        *self.sweep_interval
    }

    pub fn upstream_timeout(&self) -> Duration {
        *self.upstream_timeout
    }

    /// Validate everything the service needs before it starts.
    pub fn check(&self) -> Result<(), GatewayError> {
        self.validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        self.throttle_settings().validate()?;

        if self.sweep_interval().is_zero() {
            return Err(GatewayError::Configuration(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }
        if self.gemini_api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
            tracing::warn!("GEMINI_API_KEY is not set; only callers with their own key will be served");
        }

        Ok(())
    }
}

fn validate_upstream(config: &Config) -> Result<(), ValidationError> {
    let url = config.gemini_base_url.as_str();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ValidationError::new("upstream_url").with_message(Cow::from(
            "Upstream base URL must start with 'http://' or 'https://'",
        )));
    }
    if config.upstream_timeout.is_zero() {
        return Err(ValidationError::new("upstream_timeout")
            .with_message(Cow::from("Upstream timeout must be greater than 0")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["persona-gateway"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]);
        assert_eq!(config.rate_limit, 10);
        assert_eq!(*config.cooldown, Duration::from_secs(15 * 60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(10 * 60));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_durations_parse_with_units() {
        let config = parse(&["--cooldown", "2m", "--retention", "1h 30m"]);
        let settings = config.throttle_settings();
        assert_eq!(settings.cooldown, Duration::from_secs(120));
        assert_eq!(settings.retention, Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_retention_shorter_than_cooldown_rejected() {
        let config = parse(&["--cooldown", "15m", "--retention", "10m"]);
        assert!(matches!(config.check(), Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = parse(&["--rate-limit", "0"]);
        assert!(config.check().is_err());
    }

    #[test]
    fn test_invalid_upstream_url_rejected() {
        let config = parse(&["--gemini-base-url", "ftp://example.com"]);
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let config = parse(&["--sweep-interval", "0s"]);
        assert!(config.check().is_err());
    }

    #[test]
    fn test_invalid_duration_fails_to_parse() {
        assert!(Config::try_parse_from(["persona-gateway", "--cooldown", "soon"]).is_err());
    }
}
