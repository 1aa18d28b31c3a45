//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` (optional: every field has a default) and
//! deserializes it into strongly-typed sections. The credential is never
//! stored in the file; it is read from the environment variable named by
//! `api.api_key_env` (default `REFINORE_API_KEY`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::ConfigInvalid;
use crate::transport::client::DEFAULT_BASE_URL;
use crate::types::{Credentials, MiningToken, RiskTolerance, SessionConfig};

pub const API_URL_ENV: &str = "REFINORE_API_URL";
pub const API_KEY_ENV: &str = "REFINORE_API_KEY";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub ingest: IngestConfig,
    pub controller: ControllerConfig,
    pub session: SessionDefaults,
    pub status: StatusConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key_env: String,
    /// Field carrying tile ids on `/mining/start-strategy`.
    pub explicit_tiles_field: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: API_KEY_ENV.to_string(),
            explicit_tiles_field: "tile_ids".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    pub total_deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 30_000,
            max_attempts: 6,
            request_timeout_secs: 15,
            total_deadline_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub poll_round_ms: u64,
    pub poll_session_rounds_secs: u64,
    /// Consecutive failed SSE connects before degrading to polling.
    pub sse_failures_before_poll: u32,
    /// How long to poll before trying SSE again.
    pub poll_fallback_secs: u64,
    /// Rounds of (kind, round) keys remembered for duplicate suppression.
    pub dedup_window: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            poll_round_ms: 2_000,
            poll_session_rounds_secs: 10,
            sse_failures_before_poll: 3,
            poll_fallback_secs: 60,
            dedup_window: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerConfig {
    pub pause_recheck_secs: u64,
    /// Resume automatically this long after a risk pause. `None` waits for
    /// an operator.
    pub risk_cooldown_secs: Option<u64>,
    pub shutdown_grace_secs: u64,
    /// Consecutive `ProtocolMismatch` errors on one endpoint tolerated
    /// before faulting.
    pub protocol_mismatch_limit: u32,
    pub rate_limit_alarm_secs: u64,
    pub ledger_window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pause_recheck_secs: 60,
            risk_cooldown_secs: None,
            shutdown_grace_secs: 10,
            protocol_mismatch_limit: 3,
            rate_limit_alarm_secs: 300,
            ledger_window: 100,
        }
    }
}

/// `[session]`: the session `automine run` starts with.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionDefaults {
    pub sol_per_round: Decimal,
    pub num_tiles: u8,
    pub risk_tolerance: RiskTolerance,
    pub mining_token: MiningToken,
    /// `optimal`, `random`, or a comma-separated tile list.
    pub strategy: String,
    pub auto_restart: bool,
    pub frequency: String,
    pub ev_threshold: Decimal,
    pub motherlode_only: bool,
    pub stop_loss_sol: Option<Decimal>,
    pub max_loss_streak: Option<u32>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            sol_per_round: dec!(0.01),
            num_tiles: 25,
            risk_tolerance: RiskTolerance::Medium,
            mining_token: MiningToken::Sol,
            strategy: "optimal".to_string(),
            auto_restart: true,
            frequency: "every_round".to_string(),
            ev_threshold: Decimal::ZERO,
            motherlode_only: false,
            stop_loss_sol: None,
            max_loss_streak: None,
        }
    }
}

impl SessionDefaults {
    /// Build and validate the session config.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigInvalid> {
        let cfg = SessionConfig {
            sol_per_round: self.sol_per_round,
            num_tiles: self.num_tiles,
            risk_tolerance: self.risk_tolerance,
            mining_token: self.mining_token,
            tile_selection: self.strategy.parse()?,
            auto_restart: self.auto_restart,
            frequency: self.frequency.parse()?,
            ev_threshold: self.ev_threshold,
            motherlode_only: self.motherlode_only,
            stop_loss_sol: self.stop_loss_sol,
            max_loss_streak: self.max_loss_streak,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for per-session ledger files.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

/// The credential environment variable is unset or empty.
#[derive(Debug, Error)]
#[error("{0} is not set; export your refinORE API key (rsk_… or bearer token)")]
pub struct MissingCredential(pub String);

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            info!(path, "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|k| std::env::var(k).ok());
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.api.base_url = url;
        }
    }

    /// Read the credential from the process environment.
    pub fn credentials(&self) -> Result<Credentials, MissingCredential> {
        self.credentials_with(|k| std::env::var(k).ok())
    }

    pub fn credentials_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Credentials, MissingCredential> {
        lookup(&self.api.api_key_env)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(Credentials::from_secret)
            .ok_or_else(|| MissingCredential(self.api.api_key_env.clone()))
    }
}
