//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_TRANSCRIBE_REGION, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! AWS credentials are deliberately NOT part of this configuration. They
//! are read from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
//! `AWS_SESSION_TOKEN` at the moment a session signs its connection URL,
//! so a missing credential surfaces as a per-session error event instead
//! of preventing the server from booting.

use crate::transcribe::signer::MAX_EXPIRY_SECONDS;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transcribe: TranscribeConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost
/// - `host = "0.0.0.0"`: accept connections from any address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream transcription settings.
///
/// ## Fields:
/// - `region`: region identifier used in both the endpoint host and the
///   credential scope of signed URLs
/// - `default_language_code`: applied when a start command omits one
/// - `default_sample_rate_hertz`: applied when a start command omits one
/// - `presign_expiry_seconds`: validity window requested for each signed
///   URL; the upstream rejects the URL after this many seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeConfig {
    pub region: String,
    pub default_language_code: String,
    pub default_sample_rate_hertz: u32,
    pub presign_expiry_seconds: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of concurrent relay sessions to report capacity
    /// against in health checks
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            transcribe: TranscribeConfig {
                region: "us-east-1".to_string(),
                default_language_code: "en-US".to_string(),
                default_sample_rate_hertz: 16000,
                presign_expiry_seconds: 300,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the bare HOST and PORT variables used by deployment
    ///    platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching these early gives a clear startup error instead of a
    /// confusing failure on the first session start.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.transcribe.region.is_empty() {
            return Err(anyhow::anyhow!("Transcribe region cannot be empty"));
        }

        if self.transcribe.default_sample_rate_hertz == 0 {
            return Err(anyhow::anyhow!("Default sample rate must be greater than 0"));
        }

        if self.transcribe.presign_expiry_seconds == 0
            || self.transcribe.presign_expiry_seconds > MAX_EXPIRY_SECONDS
        {
            return Err(anyhow::anyhow!(
                "Presign expiry must be between 1 and {} seconds",
                MAX_EXPIRY_SECONDS
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// Only the fields present in the JSON are touched, so a client can
    /// send e.g. `{"transcribe": {"region": "eu-west-1"}}` to change one
    /// value. The updated configuration is revalidated before use.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(transcribe) = partial_config.get("transcribe") {
            if let Some(region) = transcribe.get("region").and_then(|v| v.as_str()) {
                self.transcribe.region = region.to_string();
            }
            if let Some(language) = transcribe
                .get("default_language_code")
                .and_then(|v| v.as_str())
            {
                self.transcribe.default_language_code = language.to_string();
            }
            if let Some(rate) = transcribe
                .get("default_sample_rate_hertz")
                .and_then(|v| v.as_u64())
            {
                self.transcribe.default_sample_rate_hertz = rate as u32;
            }
            if let Some(expiry) = transcribe
                .get("presign_expiry_seconds")
                .and_then(|v| v.as_u64())
            {
                self.transcribe.presign_expiry_seconds = expiry;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transcribe.region, "us-east-1");
        assert_eq!(config.transcribe.default_language_code, "en-US");
        assert_eq!(config.transcribe.default_sample_rate_hertz, 16000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcribe.region = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcribe.presign_expiry_seconds = 301;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"transcribe": {"region": "eu-west-1", "default_sample_rate_hertz": 8000}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.transcribe.region, "eu-west-1");
        assert_eq!(config.transcribe.default_sample_rate_hertz, 8000);
        // Untouched fields keep their values
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"transcribe": {"presign_expiry_seconds": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
