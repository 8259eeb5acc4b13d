//! Data structures and helpers shared across the API and monitor crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use thiserror::Error;

/// Shortest base58 rendering of a 32-byte public key.
pub const MINT_MIN_LENGTH: usize = 32;
/// Longest base58 rendering of a 32-byte public key.
pub const MINT_MAX_LENGTH: usize = 44;
/// Decoded size of a mint address.
pub const MINT_BYTES: usize = 32;

/// Errors emitted when user-supplied mint addresses fail validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MintFormatError {
    #[error("mint address must be 32-44 characters, got {0}")]
    WrongLength(usize),
    #[error("mint address contains non-base58 character `{0}`")]
    InvalidCharacter(char),
    #[error("mint address must decode to 32 bytes, got {0}")]
    WrongDecodedLength(usize),
}

/// Validates that the supplied string is a base58-encoded 32-byte address.
pub fn validate_mint(raw: &str) -> Result<(), MintFormatError> {
    let len = raw.chars().count();
    if !(MINT_MIN_LENGTH..=MINT_MAX_LENGTH).contains(&len) {
        return Err(MintFormatError::WrongLength(len));
    }

    if let Some(bad) = raw.chars().find(|c| !is_base58(*c)) {
        return Err(MintFormatError::InvalidCharacter(bad));
    }

    let decoded = bs58::decode(raw)
        .into_vec()
        .map_err(|_| MintFormatError::WrongDecodedLength(0))?;
    if decoded.len() != MINT_BYTES {
        return Err(MintFormatError::WrongDecodedLength(decoded.len()));
    }

    Ok(())
}

fn is_base58(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}

/// A validated token mint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mint(String);

impl Mint {
    pub fn parse(raw: &str) -> Result<Self, MintFormatError> {
        let trimmed = raw.trim();
        validate_mint(trimmed)?;
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Mint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Mint {
    type Error = MintFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Mint> for String {
    fn from(value: Mint) -> Self {
        value.0
    }
}

/// Lifecycle of a cached holder count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CacheState {
    /// Younger than the configured TTL.
    Fresh,
    /// Older than the TTL; the last known value is still served.
    Stale,
    /// First fetch in flight; no value has been stored yet.
    Pending,
}

/// Point-in-time view of a cache slot. Handed out by value; never a live
/// reference into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub mint: Mint,
    pub holder_count: u64,
    pub last_updated: DateTime<Utc>,
    pub state: CacheState,
    /// A refresh of this value is in flight.
    pub refreshing: bool,
}

impl CacheEntry {
    /// Older than the TTL, whether or not a refresh is running.
    pub fn is_stale(&self) -> bool {
        self.state == CacheState::Stale
    }
}

/// Failure categories surfaced by the holder-count data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    Transport,
    RemoteRejected,
    RateLimited,
}

impl FetchErrorKind {
    /// Whether another attempt may succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FetchErrorKind::RemoteRejected)
    }
}

/// Per-identifier bookkeeping exposed by `/tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub mint: Mint,
    pub holders: u64,
    pub last_updated: i64,
    pub request_count: u64,
    pub first_seen: i64,
    pub state: CacheState,
    pub refreshing: bool,
}

/// Aggregate counters over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_tracked_tokens: usize,
    pub total_requests: u64,
    pub stale_tokens: usize,
    pub pending_tokens: usize,
}
