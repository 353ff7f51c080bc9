// tests/http_tests.rs
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use cardless::adapters::MemoryStore;
use cardless::context::RiskContextGatherer;
use cardless::http::{self, AppState};
use cardless::ratelimit::{
    MemoryWindowStore, RateLimitConfig, SlidingWindowLimiter, WindowStore,
};
use cardless::{
    AttemptResult, Environment, TokenHasher, TokenService, TokenStore, crypto,
};

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
}

fn test_app(max_requests: u32) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn TokenStore> = store.clone();

    let service = Arc::new(TokenService::new(
        store_dyn.clone(),
        TokenHasher::new(b"test-pepper".to_vec()),
        chrono::Duration::seconds(300),
    ));
    let risk = Arc::new(RiskContextGatherer::new(store_dyn.clone()));

    let kv: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let limiter = Arc::new(SlidingWindowLimiter::new(
        kv.clone(),
        RateLimitConfig {
            window: StdDuration::from_secs(60),
            max_requests,
            fail_closed: false,
            skip_successful: false,
        },
    ));

    let state = AppState {
        service,
        store: store_dyn,
        risk,
        limiter,
        kv,
        environment: Environment::Test,
        started_at: Instant::now(),
    };

    TestApp {
        router: http::router(state),
        store,
    }
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    ip: &str,
    body: Option<Value>,
) -> (StatusCode, Value, axum::http::HeaderMap) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip);
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    let request = builder
        .body(match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, value, headers)
}

fn mint_body(account: Uuid, amount: i64) -> Value {
    json!({ "accountId": account.to_string(), "amount": amount })
}

fn redeem_body(token: &str, account: Uuid, ip: &str) -> Value {
    json!({
        "token": token,
        "accountId": account.to_string(),
        "agentId": "atm-1",
        "metadata": { "ip": ip },
    })
}

#[tokio::test]
async fn mint_and_redeem_happy_path() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    let (status, body, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "10.0.0.1",
        Some(mint_body(account, 200)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["amount"], json!(200));
    assert!(body["data"]["expiresAt"].is_string());

    let plaintext = body["data"]["token"].as_str().unwrap().to_string();
    assert!(crypto::parse_plaintext(&plaintext).is_some());
    let token_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    let (status, body, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(redeem_body(&plaintext, account, "10.0.0.1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert!(body["transactionId"].is_string());

    let entries = app.store.transactions_for_token(token_id).await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn replayed_token_is_conflict() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    let (_, body, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "10.0.0.1",
        Some(mint_body(account, 100)),
    )
    .await;
    let plaintext = body["data"]["token"].as_str().unwrap().to_string();
    let token_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(redeem_body(&plaintext, account, "10.0.0.1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(redeem_body(&plaintext, account, "10.0.0.1")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["statusCode"], json!(409));
    assert!(body["error"]["requestId"].is_string());

    let entries = app.store.transactions_for_token(token_id).await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn malformed_token_is_rejected_without_storage() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(redeem_body("abc-xyz", account, "10.0.0.1")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.store.attempts_snapshot().is_empty());
}

#[tokio::test]
async fn unknown_token_is_rejected_with_evidence() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(redeem_body("ZZZZ-99999999", account, "10.0.0.1")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let attempts = app.store.attempts_snapshot();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].result, AttemptResult::Invalid);
    assert_eq!(attempts[0].token_id, None);
}

#[tokio::test]
async fn schema_violations_are_bad_requests() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    // amount below one
    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "10.0.0.1",
        Some(mint_body(account, 0)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // unknown top-level property
    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "10.0.0.1",
        Some(json!({ "accountId": account.to_string(), "amount": 100, "note": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // missing agentId
    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "10.0.0.1",
        Some(json!({ "token": "ABCD-12345678", "accountId": account.to_string() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rate_limit_caps_requests_per_ip_and_route() {
    let app = test_app(3);
    let account = Uuid::now_v7();

    for _ in 0..3 {
        let (status, _, _) = send(
            &app.router,
            "POST",
            "/tokens",
            "9.9.9.9",
            Some(mint_body(account, 100)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _, headers) = send(
        &app.router,
        "POST",
        "/tokens",
        "9.9.9.9",
        Some(mint_body(account, 100)),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = headers
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");

    // A different caller is unaffected.
    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "9.9.9.10",
        Some(mint_body(account, 100)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

/// Builds risk history for an account: one successful withdrawal from
/// `success_ip`, then `replays` failed attempts on the spent token.
async fn seed_history(app: &TestApp, account: Uuid, success_ip: &str, replays: usize) {
    let (_, body, _) = send(
        &app.router,
        "POST",
        "/tokens",
        success_ip,
        Some(mint_body(account, 200)),
    )
    .await;
    let plaintext = body["data"]["token"].as_str().unwrap().to_string();

    let (status, _, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        success_ip,
        Some(redeem_body(&plaintext, account, success_ip)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..replays {
        let (status, _, _) = send(
            &app.router,
            "POST",
            "/tokens/redeem",
            success_ip,
            Some(redeem_body(&plaintext, account, success_ip)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}

#[tokio::test]
async fn risky_redemption_is_rejected_with_reasons() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    // 6 failed attempts (+0.50), second mint in the window (+0.15), and an
    // IP change against the last success (+0.20): 0.85 rejects.
    seed_history(&app, account, "1.1.1.1", 6).await;

    let (_, body, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "1.1.1.1",
        Some(mint_body(account, 200)),
    )
    .await;
    let plaintext = body["data"]["token"].as_str().unwrap().to_string();
    let token_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    let (status, body, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "2.2.2.2",
        Some(redeem_body(&plaintext, account, "2.2.2.2")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("FORBIDDEN"));
    assert_eq!(
        body["reasons"],
        json!(["elevated velocity", "excessive failures", "ip mismatch"])
    );

    let attempts = app.store.attempts_for_token(token_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].result, AttemptResult::RejectedByRisk);

    // The token itself was never consumed.
    assert!(app
        .store
        .transactions_for_token(token_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn moderately_risky_redemption_is_challenged() {
    let app = test_app(100);
    let account = Uuid::now_v7();

    // 3 failed attempts (+0.25), second mint in the window (+0.15), IP change
    // (+0.20): 0.60 challenges.
    seed_history(&app, account, "1.1.1.1", 3).await;

    let (_, body, _) = send(
        &app.router,
        "POST",
        "/tokens",
        "1.1.1.1",
        Some(mint_body(account, 200)),
    )
    .await;
    let plaintext = body["data"]["token"].as_str().unwrap().to_string();
    let token_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    let (status, body, _) = send(
        &app.router,
        "POST",
        "/tokens/redeem",
        "2.2.2.2",
        Some(redeem_body(&plaintext, account, "2.2.2.2")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], json!("Additional verification required"));

    let attempts = app.store.attempts_for_token(token_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].result, AttemptResult::Challenged);
}

#[tokio::test]
async fn health_and_ready_report_status() {
    let app = test_app(100);

    let (status, body, _) = send(&app.router, "GET", "/health", "10.0.0.1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert!(body["timestamp"].is_string());
    assert!(body["uptime"].is_number());

    let (status, body, _) = send(&app.router, "GET", "/ready", "10.0.0.1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["db"], json!(true));
    assert_eq!(body["kv"], json!(true));
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = test_app(100);

    let (_, _, headers) = send(&app.router, "GET", "/health", "10.0.0.1", None).await;
    assert!(headers.get("x-request-id").is_some());

    // A clean inbound id is echoed back.
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-request-id", "test-correlation-1")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "test-correlation-1"
    );
}
