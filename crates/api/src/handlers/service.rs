use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// Liveness only; never touches the cache or the RPC endpoint.
pub async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".into(),
        service: "holder-watch".into(),
    })
}

pub async fn tokens_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.cache().tracked())
}

pub async fn stats_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.cache().stats())
}
