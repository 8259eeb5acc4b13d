use clap::Parser;
use holder_watch_domain::config::{
    RawConfig, DEFAULT_API_BIND, DEFAULT_API_PORT, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_RPC_URL,
};

/// Watches the holder count of SPL token mints and serves it over HTTP.
#[derive(Debug, Parser)]
#[command(name = "holder-watch", version, about)]
pub struct Cli {
    /// Mint polled by the console monitor.
    #[arg(value_name = "MINT_ADDRESS", env = "HOLDER_WATCH_MINT_ADDRESS")]
    pub mint_address: String,

    #[arg(long, env = "HOLDER_WATCH_RPC_URL", default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,

    /// Seconds between monitor polls.
    #[arg(long, env = "HOLDER_WATCH_INTERVAL", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub interval: u64,

    /// Seconds a cached count stays fresh; also the refresh period.
    #[arg(long, env = "HOLDER_WATCH_CACHE_TTL", default_value_t = DEFAULT_CACHE_TTL_SECS)]
    pub cache_ttl: u64,

    /// Attempts per RPC call, including the first.
    #[arg(long, env = "HOLDER_WATCH_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Per-attempt RPC timeout in seconds.
    #[arg(long, env = "HOLDER_WATCH_TIMEOUT", default_value_t = DEFAULT_RPC_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Serve the HTTP API.
    #[arg(long, env = "HOLDER_WATCH_API")]
    pub api: bool,

    #[arg(long, env = "HOLDER_WATCH_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    #[arg(long, env = "HOLDER_WATCH_API_BIND", default_value = DEFAULT_API_BIND)]
    pub api_bind: String,

    /// Emit JSON log records instead of console lines.
    #[arg(long, env = "HOLDER_WATCH_JSON_LOG")]
    pub json_log: bool,

    /// Run only the API and the refresher.
    #[arg(long, env = "HOLDER_WATCH_NO_MONITOR")]
    pub no_monitor: bool,
}

impl Cli {
    pub fn into_raw(self) -> RawConfig {
        RawConfig {
            mint_address: self.mint_address,
            rpc_url: self.rpc_url,
            interval_secs: self.interval,
            cache_ttl_secs: self.cache_ttl,
            max_retries: self.max_retries,
            timeout_secs: self.timeout,
            api_enabled: self.api,
            api_bind: self.api_bind,
            api_port: self.api_port,
            monitor_enabled: !self.no_monitor,
            json_log: self.json_log,
        }
    }
}
