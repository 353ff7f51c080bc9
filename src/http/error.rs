// src/http/error.rs
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::{AppError, ErrorKind};

/// A taxonomy error bound to its request, ready for the wire. Non-operational
/// messages are replaced with a generic one when `sanitize` is set; internals
/// never leave a production boundary.
pub struct ApiError {
    inner: AppError,
    request_id: String,
    sanitize: bool,
}

impl ApiError {
    pub fn new(inner: AppError, request_id: impl Into<String>, sanitize: bool) -> Self {
        Self {
            inner,
            request_id: request_id.into(),
            sanitize,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if self.inner.kind.is_operational() {
            warn!(
                event_type = "BUSINESS",
                component = "http",
                request_id = %self.request_id,
                kind = self.inner.kind.code(),
                error = %self.inner,
                "request refused"
            );
        } else {
            error!(
                event_type = "ERROR",
                component = "http",
                request_id = %self.request_id,
                error = %self.inner,
                "request failed"
            );
        }

        let message = if self.inner.kind.is_operational() || !self.sanitize {
            self.inner.message.clone()
        } else {
            "Internal server error".to_string()
        };

        // Risk refusals keep the flat shape dispensing agents already parse.
        let body = if self.inner.kind == ErrorKind::Forbidden && !self.inner.reasons.is_empty() {
            json!({
                "error": self.inner.kind.code(),
                "message": message,
                "reasons": self.inner.reasons,
            })
        } else {
            let mut detail = json!({
                "message": message,
                "statusCode": status.as_u16(),
                "requestId": self.request_id,
            });
            if !self.inner.field_errors.is_empty() {
                detail["errors"] = json!(self.inner.field_errors);
            }
            json!({ "error": detail })
        };

        (status, Json(body)).into_response()
    }
}
