//! Server configuration module.
//!
//! Parses configuration from environment variables for the Pulse relay
//! server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PULSE_ACCESS_TOKEN_SECRET` | Yes | - | HS256 secret for access tokens (min 32 chars) |
//! | `PULSE_REFRESH_TOKEN_SECRET` | Yes | - | HS256 secret for refresh tokens (min 32 chars, must differ) |
//! | `PULSE_ACCESS_TOKEN_TTL_SECS` | No | 900 | Access-token lifetime in seconds |
//! | `PULSE_REFRESH_TOKEN_TTL_SECS` | No | 864000 | Refresh-token lifetime in seconds |
//! | `PULSE_ALLOWED_ORIGIN` | No | - | Allowed cross-origin client address for CORS |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `PULSE_HANDSHAKE_TIMEOUT_SECS` | No | 10 | Deadline for the connection handshake |
//! | `PULSE_OUTBOUND_BUFFER` | No | 256 | Per-connection outbound queue capacity |
//! | `PULSE_MAX_DELIVERY_FAILURES` | No | 8 | Consecutive delivery failures before forced disconnect |

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default access-token TTL (15 minutes).
const DEFAULT_ACCESS_TTL_SECS: u64 = 900;

/// Default refresh-token TTL (10 days).
const DEFAULT_REFRESH_TTL_SECS: u64 = 864_000;

/// Default handshake deadline.
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default per-connection outbound queue capacity.
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default consecutive-delivery-failure bound.
const DEFAULT_MAX_DELIVERY_FAILURES: u32 = 8;

/// Minimum length for signing secrets.
const MIN_SECRET_LEN: usize = 32;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HS256 signing secret for access tokens.
    pub access_token_secret: String,

    /// Access-token lifetime.
    pub access_token_ttl: Duration,

    /// HS256 signing secret for refresh tokens. Independent from the access
    /// secret so compromising one token class does not compromise the other.
    pub refresh_token_secret: String,

    /// Refresh-token lifetime.
    pub refresh_token_ttl: Duration,

    /// Allowed cross-origin client address, if CORS is restricted.
    pub allowed_origin: Option<String>,

    /// HTTP server port.
    pub port: u16,

    /// Deadline for completing the connection handshake.
    pub handshake_timeout: Duration,

    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,

    /// Consecutive delivery failures before a connection is force-closed.
    pub max_delivery_failures: u32,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing
    /// - A numeric variable fails to parse
    /// - Validation fails (short or equal secrets, zero queue capacity)
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pulse_server::config::Config;
    ///
    /// let config = Config::from_env().expect("failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token_secret = require_env("PULSE_ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = require_env("PULSE_REFRESH_TOKEN_SECRET")?;
        let access_token_ttl = Duration::from_secs(parse_u64_env(
            "PULSE_ACCESS_TOKEN_TTL_SECS",
            DEFAULT_ACCESS_TTL_SECS,
        )?);
        let refresh_token_ttl = Duration::from_secs(parse_u64_env(
            "PULSE_REFRESH_TOKEN_TTL_SECS",
            DEFAULT_REFRESH_TTL_SECS,
        )?);
        let handshake_timeout = Duration::from_secs(parse_u64_env(
            "PULSE_HANDSHAKE_TIMEOUT_SECS",
            DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        )?);
        let outbound_buffer =
            parse_u64_env("PULSE_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER as u64)? as usize;
        let max_delivery_failures = parse_u64_env(
            "PULSE_MAX_DELIVERY_FAILURES",
            u64::from(DEFAULT_MAX_DELIVERY_FAILURES),
        )? as u32;
        let allowed_origin = env::var("PULSE_ALLOWED_ORIGIN").ok().filter(|s| !s.is_empty());
        let port = parse_port()?;

        let config = Self {
            access_token_secret,
            access_token_ttl,
            refresh_token_secret,
            refresh_token_ttl,
            allowed_origin,
            port,
            handshake_timeout,
            outbound_buffer,
            max_delivery_failures,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Both signing secrets must be at least [`MIN_SECRET_LEN`] characters
    /// and must differ from each other; the outbound queue must hold at
    /// least one frame.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::ValidationError(format!(
                "PULSE_ACCESS_TOKEN_SECRET must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        if self.refresh_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::ValidationError(format!(
                "PULSE_REFRESH_TOKEN_SECRET must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        if self.access_token_secret == self.refresh_token_secret {
            return Err(ConfigError::ValidationError(
                "access and refresh token secrets must differ".to_string(),
            ));
        }

        if self.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "PULSE_OUTBOUND_BUFFER must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Read a required environment variable.
fn require_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Parse an optional numeric environment variable, falling back to a
/// default when unset.
fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a non-negative integer, got '{value}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: format!("expected a port number, got '{value}'"),
        }),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ACCESS_SECRET: &str = "an-access-secret-of-at-least-32-chars!!";
    const REFRESH_SECRET: &str = "a-refresh-secret-of-at-least-32-chars!!";

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    /// Clears every Pulse variable and sets the two required secrets.
    fn baseline(guard: &mut EnvGuard) {
        guard.set("PULSE_ACCESS_TOKEN_SECRET", ACCESS_SECRET);
        guard.set("PULSE_REFRESH_TOKEN_SECRET", REFRESH_SECRET);
        guard.remove("PULSE_ACCESS_TOKEN_TTL_SECS");
        guard.remove("PULSE_REFRESH_TOKEN_TTL_SECS");
        guard.remove("PULSE_ALLOWED_ORIGIN");
        guard.remove("PULSE_HANDSHAKE_TIMEOUT_SECS");
        guard.remove("PULSE_OUTBOUND_BUFFER");
        guard.remove("PULSE_MAX_DELIVERY_FAILURES");
        guard.remove("PORT");
    }

    #[test]
    #[serial]
    fn config_defaults() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.access_token_secret, ACCESS_SECRET);
        assert_eq!(config.refresh_token_secret, REFRESH_SECRET);
        assert_eq!(config.access_token_ttl, Duration::from_secs(900));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(864_000));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.max_delivery_failures, 8);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.allowed_origin.is_none());
    }

    #[test]
    #[serial]
    fn config_with_overrides() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_ACCESS_TOKEN_TTL_SECS", "60");
        guard.set("PULSE_REFRESH_TOKEN_TTL_SECS", "3600");
        guard.set("PULSE_ALLOWED_ORIGIN", "http://localhost:5000");
        guard.set("PULSE_HANDSHAKE_TIMEOUT_SECS", "3");
        guard.set("PULSE_OUTBOUND_BUFFER", "16");
        guard.set("PULSE_MAX_DELIVERY_FAILURES", "2");
        guard.set("PORT", "9090");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.access_token_ttl, Duration::from_secs(60));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(3600));
        assert_eq!(
            config.allowed_origin.as_deref(),
            Some("http://localhost:5000")
        );
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.outbound_buffer, 16);
        assert_eq!(config.max_delivery_failures, 2);
        assert_eq!(config.port, 9090);
    }

    #[test]
    #[serial]
    fn config_missing_access_secret() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.remove("PULSE_ACCESS_TOKEN_SECRET");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingEnvVar(ref v) if v == "PULSE_ACCESS_TOKEN_SECRET")
        );
    }

    #[test]
    #[serial]
    fn config_missing_refresh_secret() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.remove("PULSE_REFRESH_TOKEN_SECRET");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingEnvVar(ref v) if v == "PULSE_REFRESH_TOKEN_SECRET")
        );
    }

    #[test]
    #[serial]
    fn config_rejects_short_secret() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_ACCESS_TOKEN_SECRET", "too-short");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn config_rejects_equal_secrets() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_REFRESH_TOKEN_SECRET", ACCESS_SECRET);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn config_rejects_zero_outbound_buffer() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_OUTBOUND_BUFFER", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn config_rejects_non_numeric_ttl() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_ACCESS_TOKEN_TTL_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidFormat { ref var, .. } if var == "PULSE_ACCESS_TOKEN_TTL_SECS"
        ));
    }

    #[test]
    #[serial]
    fn config_rejects_invalid_port() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PORT", "not-a-number");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "PORT"));
    }

    #[test]
    #[serial]
    fn config_rejects_out_of_range_port() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PORT", "99999");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn empty_allowed_origin_is_treated_as_unset() {
        let mut guard = EnvGuard::new();
        baseline(&mut guard);
        guard.set("PULSE_ALLOWED_ORIGIN", "");

        let config = Config::from_env().expect("should parse config");
        assert!(config.allowed_origin.is_none());
    }
}
