// src/http/handlers.rs
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::http::AppState;
use crate::http::middleware::RequestId;
use crate::risk::{self, RiskDecision};
use crate::service::{Lookup, RedeemOutcome};
use crate::{AppError, AttemptMetadata, AttemptResult, RedemptionAttempt};

/// End-to-end deadline for one redemption request.
const REDEEM_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MintRequest {
    pub account_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedeemRequest {
    pub token: String,
    pub account_id: Uuid,
    pub agent_id: String,
    #[serde(default)]
    pub metadata: Option<AttemptMetadata>,
}

fn reject_body(rejection: JsonRejection) -> AppError {
    AppError::invalid_argument(rejection.body_text())
}

pub async fn mint(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<MintRequest>, JsonRejection>,
) -> Response {
    let result: Result<_, AppError> = async {
        let Json(req) = payload.map_err(reject_body)?;
        if req.amount < 1 {
            return Err(AppError::invalid_argument("amount must be an integer >= 1"));
        }

        let minted = state.service.mint(req.account_id, req.amount).await?;

        // The plaintext goes to the caller and nowhere else.
        info!(
            event_type = "BUSINESS",
            component = "http",
            amount = minted.amount,
            "withdrawal token minted"
        );

        Ok((
            StatusCode::CREATED,
            Json(json!({ "success": true, "data": minted })),
        ))
    }
    .await;

    match result {
        Ok(created) => created.into_response(),
        Err(err) => state.api_error(err, request_id).into_response(),
    }
}

async fn redeem_flow(
    state: &AppState,
    req: &RedeemRequest,
    metadata: &AttemptMetadata,
) -> Result<Response, AppError> {
    if req.agent_id.trim().is_empty() {
        return Err(AppError::invalid_argument("agentId must not be empty"));
    }

    let matched = match state
        .service
        .lookup(&req.token, &req.agent_id, metadata)
        .await?
    {
        Lookup::Malformed => {
            return Err(AppError::invalid_argument(
                "token does not match the expected format",
            ));
        }
        Lookup::NoMatch => {
            warn!(
                event_type = "SECURITY",
                component = "http",
                "invalid withdrawal token presented"
            );
            return Err(AppError::invalid_argument("invalid token"));
        }
        Lookup::Match(matched) => matched,
    };

    // A match observed terminal or past expiry answers 409 without consulting
    // risk; the locked transition records the USED/EXPIRED attempt row.
    if !matched.live {
        let outcome = state
            .service
            .finalize(matched.id, &req.agent_id, metadata)
            .await?;
        return finalize_response(outcome);
    }

    // Advisory risk gate, evaluated before any mutation.
    let context = state.risk.gather(req.account_id, matched.amount).await?;
    let assessment = risk::assess(&context, metadata);

    match assessment.decision {
        RiskDecision::Reject => {
            warn!(
                event_type = "SECURITY",
                component = "risk",
                score = assessment.score,
                decision = assessment.decision.as_str(),
                "redemption rejected by risk controls"
            );
            state
                .store
                .record_attempt(&RedemptionAttempt::record(
                    Some(matched.id),
                    &req.agent_id,
                    AttemptResult::RejectedByRisk,
                    metadata.clone(),
                ))
                .await?;
            Err(AppError::forbidden("Redemption rejected by risk controls")
                .with_reasons(assessment.reasons))
        }
        RiskDecision::Challenge => {
            warn!(
                event_type = "SECURITY",
                component = "risk",
                score = assessment.score,
                decision = assessment.decision.as_str(),
                "redemption challenged by risk controls"
            );
            state
                .store
                .record_attempt(&RedemptionAttempt::record(
                    Some(matched.id),
                    &req.agent_id,
                    AttemptResult::Challenged,
                    metadata.clone(),
                ))
                .await?;
            Err(AppError::forbidden("Additional verification required")
                .with_reasons(assessment.reasons))
        }
        RiskDecision::Approve => {
            let outcome = state
                .service
                .finalize(matched.id, &req.agent_id, metadata)
                .await?;
            finalize_response(outcome)
        }
    }
}

fn finalize_response(outcome: RedeemOutcome) -> Result<Response, AppError> {
    match outcome {
        RedeemOutcome::Success { transaction_id, .. } => {
            info!(
                event_type = "BUSINESS",
                component = "http",
                "withdrawal token redeemed"
            );
            Ok(Json(json!({
                "success": true,
                "message": "Withdrawal approved",
                "transactionId": transaction_id,
            }))
            .into_response())
        }
        RedeemOutcome::ExpiredOrUsed => Err(AppError::conflict("Token already used or expired")),
        RedeemOutcome::Invalid => Err(AppError::invalid_argument("invalid token")),
    }
}

pub async fn redeem(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Response {
    let result: Result<Response, AppError> = async {
        let Json(req) = payload.map_err(reject_body)?;
        let metadata = req.metadata.clone().unwrap_or_default();

        match tokio::time::timeout(REDEEM_DEADLINE, redeem_flow(&state, &req, &metadata)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::internal("redemption deadline exceeded")),
        }
    }
    .await;

    match result {
        Ok(response) => response,
        Err(err) => state.api_error(err, request_id).into_response(),
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
    .into_response()
}

pub async fn ready(State(state): State<AppState>) -> Response {
    let db = state.store.ping().await.is_ok();
    let kv = state.kv.ping().await.is_ok();

    let status = if db && kv {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(json!({ "db": db, "kv": kv }))).into_response()
}
