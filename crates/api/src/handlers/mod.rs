pub mod holders;
pub mod metrics;
pub mod service;

pub use holders::holders_handler;
pub use metrics::metrics_handler;
pub use service::{health_handler, stats_handler, tokens_handler};

use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use holder_watch_domain::{FailureCache, FetchErrorKind, MintFormatError};
use holder_watch_monitor::LookupError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds a client is asked to wait before retrying a transient failure.
const RETRY_AFTER_PENDING_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid mint address: {0}")]
    InvalidMint(#[from] MintFormatError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl ApiError {
    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Lookup(LookupError::StillPending) => Some(RETRY_AFTER_PENDING_SECS),
            ApiError::Lookup(LookupError::RecentFailure(_)) => {
                Some(FailureCache::DEFAULT_TTL.as_secs())
            }
            ApiError::Lookup(LookupError::Fetch(err))
                if err.kind() == FetchErrorKind::RateLimited =>
            {
                Some(FailureCache::DEFAULT_TTL.as_secs())
            }
            _ => None,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidMint(_) => StatusCode::BAD_REQUEST,
            ApiError::Lookup(LookupError::Fetch(err)) => match err.kind() {
                FetchErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                FetchErrorKind::Transport | FetchErrorKind::RemoteRejected => {
                    StatusCode::BAD_GATEWAY
                }
                FetchErrorKind::RateLimited => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Lookup(LookupError::RecentFailure(_) | LookupError::StillPending) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Lookup(LookupError::Interrupted(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if let Some(secs) = self.retry_after() {
            response.insert_header((header::RETRY_AFTER, secs.to_string()));
        }
        response.json(ErrorBody {
            error: self.to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
