// src/context.rs
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::risk::RiskContext;
use crate::{StoreError, TokenStore};

/// Aggregates an account's history into the risk engine's inputs.
///
/// Reads are a point-in-time snapshot and deliberately not transactionally
/// tied to the redemption that follows; risk is advisory.
pub struct RiskContextGatherer {
    store: Arc<dyn TokenStore>,
}

impl RiskContextGatherer {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub async fn gather(
        &self,
        account_id: Uuid,
        current_amount: i64,
    ) -> Result<RiskContext, StoreError> {
        let now = Utc::now();

        let velocity_10m = self
            .store
            .count_tokens_created_since(account_id, now - Duration::minutes(10))
            .await?;
        let avg_amount = self.store.average_withdrawal_amount(account_id).await?;
        let failed_attempts_24h = self
            .store
            .count_failed_attempts_since(account_id, now - Duration::hours(24))
            .await?;
        let last_ip = self.store.last_successful_ip(account_id).await?;

        Ok(RiskContext {
            velocity_10m,
            avg_amount,
            failed_attempts_24h,
            last_ip,
            current_amount,
        })
    }
}
