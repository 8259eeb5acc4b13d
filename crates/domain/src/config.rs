//! Validated runtime configuration shared by the monitor and API crates.
//!
//! Binaries gather raw values (CLI flags backed by `HOLDER_WATCH_*`
//! environment variables) into [`RawConfig`] and turn them into an
//! [`AppConfig`] here, so every component sees the same checked contract.

use std::{env, time::Duration};

use thiserror::Error;

use crate::model::{Mint, MintFormatError};

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_API_PORT: u16 = 56789;
pub const DEFAULT_API_BIND: &str = "0.0.0.0";

/// Unvalidated values as collected by a binary's argument parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConfig {
    pub mint_address: String,
    pub rpc_url: String,
    pub interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub api_enabled: bool,
    pub api_bind: String,
    pub api_port: u16,
    pub monitor_enabled: bool,
    pub json_log: bool,
}

impl RawConfig {
    /// Defaults for everything except the primary mint.
    pub fn with_mint(mint_address: impl Into<String>) -> Self {
        Self {
            mint_address: mint_address.into(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            api_enabled: false,
            api_bind: DEFAULT_API_BIND.to_string(),
            api_port: DEFAULT_API_PORT,
            monitor_enabled: true,
            json_log: false,
        }
    }
}

/// Transport and retry bounds for the upstream RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    url: String,
    timeout: Duration,
    max_retries: u32,
    backoff_seed: Duration,
    backoff_ceiling: Duration,
}

impl RpcConfig {
    pub const DEFAULT_BACKOFF_SEED: Duration = Duration::from_secs(1);
    pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            url: url.into(),
            timeout,
            max_retries: max_retries.max(1),
            backoff_seed: Self::DEFAULT_BACKOFF_SEED,
            backoff_ceiling: Self::DEFAULT_BACKOFF_CEILING,
        }
    }

    pub fn with_backoff(mut self, seed: Duration, ceiling: Duration) -> Self {
        self.backoff_seed = seed;
        self.backoff_ceiling = ceiling.max(seed);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Upper bound for a single attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Total attempts per fetch, including the first one.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_seed(&self) -> Duration {
        self.backoff_seed
    }

    pub fn backoff_ceiling(&self) -> Duration {
        self.backoff_ceiling
    }

    /// Deadline for one whole fetch, retries and backoff included.
    pub fn fetch_budget(&self) -> Duration {
        self.timeout * self.max_retries
    }
}

/// HTTP listener settings; present only when the API is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    bind_address: String,
    port: u16,
}

impl ApiConfig {
    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Fully validated process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    primary_mint: Mint,
    rpc: RpcConfig,
    poll_interval: Duration,
    cache_ttl: Duration,
    api: Option<ApiConfig>,
    monitor_enabled: bool,
    json_log: bool,
}

impl AppConfig {
    /// Checks raw values and builds the shared configuration. Zero durations
    /// or retry counts and malformed mints surface as [`ConfigError`].
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let primary_mint = Mint::parse(&raw.mint_address)?;

        let rpc_url = raw.rpc_url.trim();
        if !(rpc_url.starts_with("http://") || rpc_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl {
                url: rpc_url.to_string(),
            });
        }

        let interval_secs = require_positive("interval", raw.interval_secs)?;
        let cache_ttl_secs = require_positive("cache-ttl", raw.cache_ttl_secs)?;
        let timeout_secs = require_positive("timeout", raw.timeout_secs)?;
        if raw.max_retries == 0 {
            return Err(ConfigError::ZeroValue { key: "max-retries" });
        }

        if !raw.api_enabled && !raw.monitor_enabled {
            return Err(ConfigError::NothingToRun);
        }

        let api = raw.api_enabled.then(|| ApiConfig {
            bind_address: raw.api_bind.trim().to_string(),
            port: raw.api_port,
        });

        Ok(Self {
            primary_mint,
            rpc: RpcConfig::new(
                rpc_url,
                Duration::from_secs(timeout_secs),
                raw.max_retries,
            ),
            poll_interval: Duration::from_secs(interval_secs),
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            api,
            monitor_enabled: raw.monitor_enabled,
            json_log: raw.json_log,
        })
    }

    pub fn primary_mint(&self) -> &Mint {
        &self.primary_mint
    }

    pub fn rpc(&self) -> &RpcConfig {
        &self.rpc
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn api(&self) -> Option<&ApiConfig> {
        self.api.as_ref()
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor_enabled
    }

    pub fn json_log(&self) -> bool {
        self.json_log
    }
}

fn require_positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::ZeroValue { key })
    } else {
        Ok(value)
    }
}

pub(crate) fn get_optional_var(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Loads `.env` into the process environment unless
/// `HOLDER_WATCH_SKIP_DOTENV` is set. A missing file is not an error.
pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("HOLDER_WATCH_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or configuration validation fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid primary mint: {0}")]
    InvalidMint(#[from] MintFormatError),
    #[error("`{key}` must be greater than zero")]
    ZeroValue { key: &'static str },
    #[error("rpc url `{url}` must start with http:// or https://")]
    InvalidUrl { url: String },
    #[error("both the monitor loop and the API server are disabled")]
    NothingToRun,
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const WSOL: &str = "So11111111111111111111111111111111111111112";

    #[test]
    fn defaults_produce_monitor_only_config() {
        let config = AppConfig::from_raw(RawConfig::with_mint(WSOL)).expect("config builds");
        assert_eq!(config.primary_mint().as_str(), WSOL);
        assert_eq!(config.rpc().url(), DEFAULT_RPC_URL);
        assert_eq!(config.rpc().max_retries(), 3);
        assert_eq!(config.rpc().timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert!(config.api().is_none());
        assert!(config.monitor_enabled());
    }

    #[test]
    fn api_settings_are_kept_when_enabled() {
        let mut raw = RawConfig::with_mint(WSOL);
        raw.api_enabled = true;
        raw.api_port = 8080;
        let config = AppConfig::from_raw(raw).unwrap();
        let api = config.api().expect("api enabled");
        assert_eq!(api.socket_address(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_zero_values() {
        let mut raw = RawConfig::with_mint(WSOL);
        raw.interval_secs = 0;
        assert!(matches!(
            AppConfig::from_raw(raw),
            Err(ConfigError::ZeroValue { key: "interval" })
        ));

        let mut raw = RawConfig::with_mint(WSOL);
        raw.max_retries = 0;
        assert!(matches!(
            AppConfig::from_raw(raw),
            Err(ConfigError::ZeroValue { key: "max-retries" })
        ));
    }

    #[test]
    fn rejects_malformed_mint_and_url() {
        assert!(matches!(
            AppConfig::from_raw(RawConfig::with_mint("not-a-mint")),
            Err(ConfigError::InvalidMint(_))
        ));

        let mut raw = RawConfig::with_mint(WSOL);
        raw.rpc_url = "ftp://example.com".into();
        assert!(matches!(
            AppConfig::from_raw(raw),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn refuses_to_run_nothing() {
        let mut raw = RawConfig::with_mint(WSOL);
        raw.monitor_enabled = false;
        assert!(matches!(
            AppConfig::from_raw(raw),
            Err(ConfigError::NothingToRun)
        ));
    }

    #[test]
    fn fetch_budget_is_timeout_times_attempts() {
        let rpc = RpcConfig::new(DEFAULT_RPC_URL, Duration::from_secs(2), 3)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(rpc.fetch_budget(), Duration::from_secs(6));
    }

    #[test]
    fn retries_are_at_least_one_attempt() {
        let rpc = RpcConfig::new(DEFAULT_RPC_URL, Duration::from_secs(1), 0);
        assert_eq!(rpc.max_retries(), 1);
    }
}
