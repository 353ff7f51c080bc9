// src/logging.rs
use tracing_subscriber::EnvFilter;

/// Line-delimited JSON logs. `level`, `time`, and `msg` come from the
/// formatter; `event_type` and `component` ride as event fields and
/// `request_id` flows in from the request span.
///
/// Sensitive values (plaintext tokens, digests, salts, the pepper, account
/// ids) are dropped at the call sites; they are never handed to the logger,
/// so there is nothing to mask here.
pub fn init(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_env_filter(filter)
        .init();
}
