// src/http/mod.rs
pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::context::RiskContextGatherer;
use crate::ratelimit::{SlidingWindowLimiter, WindowStore};
use crate::{AppError, Environment, TokenService, TokenStore};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TokenService>,
    pub store: Arc<dyn TokenStore>,
    pub risk: Arc<RiskContextGatherer>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub kv: Arc<dyn WindowStore>,
    pub environment: Environment,
    pub started_at: Instant,
}

impl AppState {
    /// Binds an error to its request id; production responses carry sanitized
    /// internals.
    pub fn api_error(&self, err: AppError, request_id: String) -> ApiError {
        ApiError::new(err, request_id, self.environment.is_production())
    }
}

pub fn router(state: AppState) -> Router {
    let token_routes = Router::new()
        .route("/tokens", post(handlers::mint))
        .route("/tokens/redeem", post(handlers::redeem))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit));

    Router::new()
        .merge(token_routes)
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .layer(from_fn(middleware::request_id))
        .with_state(state)
}

/// CORS allow-list from configuration. An empty list leaves cross-origin
/// requests unanswered.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}
