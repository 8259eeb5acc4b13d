//! Wire types for the JSON-RPC endpoint and the per-attempt failure record.

use holder_watch_domain::FetchErrorKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: T,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// One element of a `getProgramAccounts` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramAccount {
    pub pubkey: String,
    pub account: AccountData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountData {
    /// `[payload, encoding]`; payload is the requested slice, base64 encoded.
    pub data: (String, String),
}

/// Why a single attempt failed. Folded into a `FetchError` once the retry
/// sequence gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(value: reqwest::Error) -> Self {
        let kind = if value.is_timeout() {
            FetchErrorKind::Timeout
        } else {
            FetchErrorKind::Transport
        };
        Self::new(kind, value.to_string())
    }
}
