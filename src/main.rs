// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use cardless::adapters::PostgresStore;
use cardless::context::RiskContextGatherer;
use cardless::http::{self, AppState};
use cardless::ratelimit::{
    RateLimitConfig, RedisWindowStore, SlidingWindowLimiter, WindowStore,
};
use cardless::{Config, TokenHasher, TokenService, TokenStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    cardless::logging::init(&config.log_level);

    if let Err(err) = run(config).await {
        error!(event_type = "ERROR", component = "boot", error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // One connection per in-flight transaction, reaped when idle.
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .idle_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(2))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-query ceiling; redemption transactions stay well under it.
                sqlx::Executor::execute(&mut *conn, "SET statement_timeout = 2000").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await?;

    let redis_client = redis::Client::open(config.redis_url())?;
    let redis_config = redis::aio::ConnectionManagerConfig::new()
        .set_response_timeout(Duration::from_millis(200))
        .set_connection_timeout(Duration::from_secs(2));
    let redis_conn =
        redis::aio::ConnectionManager::new_with_config(redis_client, redis_config).await?;

    let store: Arc<dyn TokenStore> = Arc::new(PostgresStore::from_pool(pool.clone()));
    if config.auto_migrate {
        store.init_schema().await?;
        info!(event_type = "SYSTEM", component = "boot", "schema ready");
    }

    let pepper = match config.token_pepper.clone() {
        Some(pepper) => pepper.into_bytes(),
        None => {
            // Config::from_env refuses production without a pepper, so this
            // branch only runs in development and test.
            warn!(
                event_type = "SECURITY",
                component = "boot",
                "TOKEN_PEPPER not set; using a random per-boot pepper, live tokens will not survive a restart"
            );
            rand::rng().random::<[u8; 32]>().to_vec()
        }
    };

    let service = Arc::new(TokenService::new(
        store.clone(),
        TokenHasher::new(pepper),
        config.token_ttl,
    ));
    let risk = Arc::new(RiskContextGatherer::new(store.clone()));

    let kv: Arc<dyn WindowStore> = Arc::new(RedisWindowStore::new(redis_conn));
    let limiter = Arc::new(SlidingWindowLimiter::new(
        kv.clone(),
        RateLimitConfig {
            window: Duration::from_millis(config.rate_limit_window_ms),
            max_requests: config.rate_limit_max_requests,
            fail_closed: config.rate_limit_fail_closed,
            skip_successful: false,
        },
    ));

    let state = AppState {
        service,
        store,
        risk,
        limiter,
        kv,
        environment: config.environment,
        started_at: Instant::now(),
    };

    let router = http::router(state).layer(http::cors_layer(&config.cors_allowed_origins));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(
        event_type = "SYSTEM",
        component = "boot",
        addr = %listener.local_addr()?,
        env = config.environment.as_str(),
        "listening"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // In-flight redemption transactions have committed or rolled back by the
    // time serve returns; only then close the pool.
    pool.close().await;
    info!(event_type = "SYSTEM", component = "boot", "drained, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(
        event_type = "SYSTEM",
        component = "boot",
        "shutdown signal received, draining"
    );
}
