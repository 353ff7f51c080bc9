// src/http/middleware.rs
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::http::AppState;
use crate::ratelimit::{self, RateDecision};
use crate::AppError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct RequestId(pub String);

fn is_clean_header_value(value: &str) -> bool {
    !value.is_empty() && value.len() <= 128 && value.bytes().all(|b| b.is_ascii_graphic())
}

/// Assigns every request a correlation id (honoring a clean inbound
/// `x-request-id`), opens the request span, and echoes the id back.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| is_clean_header_value(value))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_rate_headers(
    response: &mut Response,
    limit: u32,
    remaining: u32,
    reset_after: std::time::Duration,
) {
    let reset_at = Utc::now().timestamp() + reset_after.as_secs() as i64;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at.max(0)));
}

/// Per-IP, per-route sliding-window gate in front of the token endpoints.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let route = request.uri().path().to_string();
    let key = ratelimit::ip_route_key(&client_ip(&request), &route);
    let member = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    match state.limiter.check(&key, &member).await {
        RateDecision::Allowed {
            limit,
            remaining,
            reset_after,
        } => {
            let mut response = next.run(request).await;
            if state.limiter.config().skip_successful && response.status().as_u16() < 400 {
                state.limiter.release(&key, &member).await;
            }
            apply_rate_headers(&mut response, limit, remaining, reset_after);
            response
        }
        RateDecision::Limited {
            limit,
            retry_after,
            reset_after,
        } => {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default();

            let mut response = state
                .api_error(AppError::rate_limited("Too many requests"), request_id)
                .into_response();

            let retry_secs = retry_after.as_millis().div_ceil(1000).max(1) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            apply_rate_headers(&mut response, limit, 0, reset_after);
            response
        }
    }
}
