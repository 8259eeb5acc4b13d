use actix_web::{http::StatusCode, web, HttpResponse, ResponseError};
use holder_watch_domain::Mint;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldersResponse {
    pub mint: String,
    pub holders: u64,
    /// Unix seconds of the last successful fetch.
    pub timestamp: i64,
    pub cached: bool,
    pub stale: bool,
}

pub async fn holders_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let result = lookup(&state, &path.into_inner()).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status_code(),
    };
    counter!(
        "holder_api_requests_total",
        "endpoint" => "holders",
        "status" => status.as_str().to_owned()
    )
    .increment(1);

    result.map(|body| HttpResponse::Ok().json(body))
}

async fn lookup(state: &AppState, raw: &str) -> Result<HoldersResponse, ApiError> {
    let mint = Mint::parse(raw)?;
    let lookup = state.fetcher().lookup(&mint).await?;
    debug!(mint = %mint, fetched = ?lookup.fetched, "holders lookup");

    let cached = lookup.cached();
    let stale = lookup.entry.is_stale();
    Ok(HoldersResponse {
        mint: lookup.entry.mint.into_inner(),
        holders: lookup.entry.holder_count,
        timestamp: lookup.entry.last_updated.timestamp(),
        cached,
        stale,
    })
}
