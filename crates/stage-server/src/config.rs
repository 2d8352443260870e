//! Stage server configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use stage_protocol::types::{CodecCapability, MediaKind};
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default signaling (TLS WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the media engine's RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the media engine's RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 40999;

/// Default maximum participants per stage.
pub const DEFAULT_MAX_PARTICIPANTS_PER_STAGE: usize = 64;

/// Stage server configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Signaling server bind address (default: "0.0.0.0:4443").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Path to the TLS certificate chain (PEM).
    pub tls_cert_path: String,

    /// Path to the TLS private key (PEM).
    pub tls_key_path: String,

    /// Shared secret for identity token (HS256) validation.
    /// Protected by `SecretString` to prevent accidental logging.
    pub identity_token_secret: SecretString,

    /// IP the media engine listens on for RTC traffic.
    pub rtc_listen_ip: String,

    /// Publicly announced IP, if different from the listen IP.
    pub rtc_announced_ip: Option<String>,

    /// Lower bound of the media engine's RTC port range.
    pub rtc_min_port: u16,

    /// Upper bound of the media engine's RTC port range.
    pub rtc_max_port: u16,

    /// Codecs the media engine routes.
    pub media_codecs: Vec<CodecCapability>,

    /// Maximum participants per stage.
    pub max_participants_per_stage: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("tls_cert_path", &self.tls_cert_path)
            .field("tls_key_path", &self.tls_key_path)
            .field("identity_token_secret", &"[REDACTED]")
            .field("rtc_listen_ip", &self.rtc_listen_ip)
            .field("rtc_announced_ip", &self.rtc_announced_ip)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("media_codecs", &self.media_codecs.len())
            .field(
                "max_participants_per_stage",
                &self.max_participants_per_stage,
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Codecs routed by default: stereo Opus and VP8.
#[must_use]
pub fn default_media_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Value::Null,
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({ "x-google-start-bitrate": 1000 }),
        },
    ]
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let tls_cert_path = vars
            .get("STAGE_TLS_CERT_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("STAGE_TLS_CERT_PATH".to_string()))?
            .clone();

        let tls_key_path = vars
            .get("STAGE_TLS_KEY_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("STAGE_TLS_KEY_PATH".to_string()))?
            .clone();

        let identity_token_secret = SecretString::from(
            vars.get("STAGE_IDENTITY_TOKEN_SECRET")
                .ok_or_else(|| {
                    ConfigError::MissingEnvVar("STAGE_IDENTITY_TOKEN_SECRET".to_string())
                })?
                .clone(),
        );

        let signaling_bind_address = vars
            .get("STAGE_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("STAGE_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let rtc_listen_ip = vars
            .get("STAGE_RTC_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let rtc_announced_ip = vars.get("STAGE_RTC_ANNOUNCED_IP").cloned();

        let rtc_min_port = vars
            .get("STAGE_RTC_MIN_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_MIN_PORT);

        let rtc_max_port = vars
            .get("STAGE_RTC_MAX_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_MAX_PORT);

        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC port range is empty: {rtc_min_port}..={rtc_max_port}"
            )));
        }

        let media_codecs = match vars.get("STAGE_MEDIA_CODECS") {
            Some(json) => serde_json::from_str(json).map_err(|e| {
                ConfigError::InvalidValue(format!("STAGE_MEDIA_CODECS is not valid JSON: {e}"))
            })?,
            None => default_media_codecs(),
        };

        let max_participants_per_stage = vars
            .get("STAGE_MAX_PARTICIPANTS_PER_STAGE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS_PER_STAGE);

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            tls_cert_path,
            tls_key_path,
            identity_token_secret,
            rtc_listen_ip,
            rtc_announced_ip,
            rtc_min_port,
            rtc_max_port,
            media_codecs,
            max_participants_per_stage,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "STAGE_TLS_CERT_PATH".to_string(),
                "/etc/stagelink/cert.pem".to_string(),
            ),
            (
                "STAGE_TLS_KEY_PATH".to_string(),
                "/etc/stagelink/key.pem".to_string(),
            ),
            (
                "STAGE_IDENTITY_TOKEN_SECRET".to_string(),
                "test-secret-1234567890".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.rtc_listen_ip, "0.0.0.0");
        assert_eq!(config.rtc_announced_ip, None);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.media_codecs.len(), 2);
        assert_eq!(
            config.max_participants_per_stage,
            DEFAULT_MAX_PARTICIPANTS_PER_STAGE
        );
        assert_eq!(
            config.identity_token_secret.expose_secret(),
            "test-secret-1234567890"
        );
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "STAGE_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:4444".to_string(),
        );
        vars.insert(
            "STAGE_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:8082".to_string(),
        );
        vars.insert("STAGE_RTC_LISTEN_IP".to_string(), "10.0.0.5".to_string());
        vars.insert(
            "STAGE_RTC_ANNOUNCED_IP".to_string(),
            "203.0.113.7".to_string(),
        );
        vars.insert("STAGE_RTC_MIN_PORT".to_string(), "50000".to_string());
        vars.insert("STAGE_RTC_MAX_PORT".to_string(), "50099".to_string());
        vars.insert(
            "STAGE_MAX_PARTICIPANTS_PER_STAGE".to_string(),
            "8".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:4444");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.rtc_listen_ip, "10.0.0.5");
        assert_eq!(config.rtc_announced_ip, Some("203.0.113.7".to_string()));
        assert_eq!(config.rtc_min_port, 50000);
        assert_eq!(config.rtc_max_port, 50099);
        assert_eq!(config.max_participants_per_stage, 8);
    }

    #[test]
    fn test_from_vars_missing_tls_material() {
        let mut vars = base_vars();
        vars.remove("STAGE_TLS_CERT_PATH");
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "STAGE_TLS_CERT_PATH"));

        let mut vars = base_vars();
        vars.remove("STAGE_TLS_KEY_PATH");
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "STAGE_TLS_KEY_PATH"));
    }

    #[test]
    fn test_from_vars_missing_identity_secret() {
        let mut vars = base_vars();
        vars.remove("STAGE_IDENTITY_TOKEN_SECRET");

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "STAGE_IDENTITY_TOKEN_SECRET")
        );
    }

    #[test]
    fn test_from_vars_rejects_empty_port_range() {
        let mut vars = base_vars();
        vars.insert("STAGE_RTC_MIN_PORT".to_string(), "50000".to_string());
        vars.insert("STAGE_RTC_MAX_PORT".to_string(), "40000".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_custom_codec_list() {
        let mut vars = base_vars();
        vars.insert(
            "STAGE_MEDIA_CODECS".to_string(),
            r#"[{"kind":"audio","mime_type":"audio/opus","clock_rate":48000,"channels":2}]"#
                .to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.media_codecs.len(), 1);
        assert_eq!(config.media_codecs[0].mime_type, "audio/opus");
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let vars = base_vars();
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("test-secret"));
    }
}
