use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use holder_watch_domain::{config::RpcConfig, FetchErrorKind, Mint};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::worker::MonitorError;

mod retry;
mod types;

pub use retry::{run_with_retry, RetryPolicy, RetrySequence, RetryState};
pub use types::{AccountData, AttemptError, JsonRpcError, ProgramAccount};
use types::{JsonRpcRequest, JsonRpcResponse};

/// SPL Token program; every holder account of a classic mint is owned by it.
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
/// Size of an SPL Token account.
pub const TOKEN_ACCOUNT_LEN: u64 = 165;
/// Owner (32 bytes) followed by the little-endian amount (8 bytes).
const SLICE_OFFSET: usize = 32;
const SLICE_LEN: usize = 40;

/// JSON-RPC codes the endpoint will answer identically on every retry.
const REJECTED_CODES: [i64; 4] = [-32600, -32601, -32602, -32010];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("rpc timed out after {attempts} attempt(s) in {elapsed:?}")]
    Timeout { attempts: u32, elapsed: Duration },
    #[error("rpc transport failure after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },
    #[error("rpc rejected the request: {message}")]
    RemoteRejected { attempts: u32, message: String },
    #[error("rpc rate limited after {attempts} attempt(s): {message}")]
    RateLimited { attempts: u32, message: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout { .. } => FetchErrorKind::Timeout,
            FetchError::Transport { .. } => FetchErrorKind::Transport,
            FetchError::RemoteRejected { .. } => FetchErrorKind::RemoteRejected,
            FetchError::RateLimited { .. } => FetchErrorKind::RateLimited,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Timeout { attempts, .. }
            | FetchError::Transport { attempts, .. }
            | FetchError::RemoteRejected { attempts, .. }
            | FetchError::RateLimited { attempts, .. } => *attempts,
        }
    }
}

/// Source of holder counts. The JSON-RPC client is the production
/// implementation; anything that can answer "how many holders" fits.
#[async_trait]
pub trait HolderSource: Send + Sync {
    async fn fetch_holder_count(&self, mint: &Mint) -> Result<u64, FetchError>;
    /// Cheap liveness probe; returns the current slot.
    async fn health_check(&self) -> Result<u64, FetchError>;
}

pub struct RpcHolderSource {
    http: reqwest::Client,
    config: RpcConfig,
    policy: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcHolderSource {
    pub fn new(config: RpcConfig) -> Result<Self, MonitorError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("holder-watch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let policy = RetryPolicy::from_config(&config);
        Ok(Self {
            http,
            config,
            policy,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn call<P, R>(&self, method: &'static str, params: P) -> Result<R, AttemptError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(self.config.url())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let body: JsonRpcResponse<R> = response.json().await?;
        if let Some(err) = body.error {
            return Err(classify_rpc_error(&err));
        }
        body.result.ok_or_else(|| {
            AttemptError::new(
                FetchErrorKind::Transport,
                format!("{method} response carried neither result nor error"),
            )
        })
    }
}

#[async_trait]
impl HolderSource for RpcHolderSource {
    async fn fetch_holder_count(&self, mint: &Mint) -> Result<u64, FetchError> {
        let params = json!([
            TOKEN_PROGRAM_ID,
            {
                "encoding": "base64",
                "commitment": "confirmed",
                "dataSlice": { "offset": SLICE_OFFSET, "length": SLICE_LEN },
                "filters": [
                    { "dataSize": TOKEN_ACCOUNT_LEN },
                    { "memcmp": { "offset": 0, "bytes": mint.as_str() } }
                ]
            }
        ]);

        let accounts: Vec<ProgramAccount> = run_with_retry(
            &self.policy,
            self.config.timeout(),
            "getProgramAccounts",
            move |_| self.call("getProgramAccounts", params.clone()),
        )
        .await?;

        let tally = count_holders(&accounts);
        debug!(
            mint = %mint,
            accounts = tally.accounts,
            holders = tally.holders,
            skipped = tally.skipped,
            "counted holders"
        );
        Ok(tally.holders)
    }

    async fn health_check(&self) -> Result<u64, FetchError> {
        let params = json!([{ "commitment": "confirmed" }]);
        run_with_retry(&self.policy, self.config.timeout(), "getSlot", move |_| {
            self.call("getSlot", params.clone())
        })
        .await
    }
}

fn classify_status(status: StatusCode) -> Option<AttemptError> {
    if status.is_success() {
        return None;
    }
    let kind = if status == StatusCode::TOO_MANY_REQUESTS {
        FetchErrorKind::RateLimited
    } else if status.is_client_error() {
        FetchErrorKind::RemoteRejected
    } else {
        FetchErrorKind::Transport
    };
    Some(AttemptError::new(kind, format!("http status {status}")))
}

fn classify_rpc_error(err: &JsonRpcError) -> AttemptError {
    let message = err.message.to_ascii_lowercase();
    let kind = if err.code == 429
        || message.contains("rate limit")
        || message.contains("too many requests")
    {
        FetchErrorKind::RateLimited
    } else if REJECTED_CODES.contains(&err.code) {
        FetchErrorKind::RemoteRejected
    } else {
        FetchErrorKind::Transport
    };
    AttemptError::new(kind, format!("rpc error {}: {}", err.code, err.message))
}

/// Outcome of scanning a `getProgramAccounts` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolderTally {
    pub accounts: usize,
    pub holders: u64,
    /// Accounts whose data slice could not be decoded.
    pub skipped: usize,
}

/// Counts distinct owners with a non-zero balance. Several token accounts of
/// one owner count once.
pub fn count_holders(accounts: &[ProgramAccount]) -> HolderTally {
    let mut owners: HashSet<[u8; 32]> = HashSet::with_capacity(accounts.len());
    let mut skipped = 0;

    for account in accounts {
        let Ok(bytes) = STANDARD.decode(&account.account.data.0) else {
            skipped += 1;
            continue;
        };
        if bytes.len() < SLICE_LEN {
            skipped += 1;
            continue;
        }
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&bytes[32..SLICE_LEN]);
        if u64::from_le_bytes(amount) == 0 {
            continue;
        }
        let mut owner = [0u8; 32];
        owner.copy_from_slice(&bytes[..32]);
        owners.insert(owner);
    }

    HolderTally {
        accounts: accounts.len(),
        holders: owners.len() as u64,
        skipped,
    }
}
