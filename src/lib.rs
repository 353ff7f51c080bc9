// src/lib.rs
pub mod adapters;
pub mod attempt;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod http;
pub mod logging;
pub mod ratelimit;
pub mod risk;
pub mod service;
pub mod token;
pub mod transaction;

pub use attempt::{AttemptMetadata, AttemptResult, RedemptionAttempt};
pub use config::{Config, Environment};
pub use crypto::TokenHasher;
pub use error::{AppError, ErrorKind, StoreError};
pub use service::{MintedToken, RedeemOutcome, TokenService};
pub use token::{Token, TokenStatus};
pub use transaction::{Transaction, TransactionKind, TransactionStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of the locked redemption transaction for a matched token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemTransition {
    /// The row moved ACTIVE → USED and exactly one ledger entry was written.
    Redeemed { transaction_id: Uuid },
    /// The row was already USED when observed under the lock.
    AlreadyUsed,
    /// The row was EXPIRED, or ACTIVE past its expiry and upgraded in place.
    Expired,
}

/// Persistence boundary for token rows, the withdrawal ledger, and attempt
/// evidence.
///
/// Adapters own transaction scoping: `redeem` runs its row lock,
/// re-verification, guarded state transition, ledger insert, and attempt
/// insert as one atomic unit, so a token can be consumed at most once no
/// matter how many callers race on it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Inserts a freshly minted ACTIVE row. Fails with `DuplicateTokenHash`
    /// when the digest collides with an existing row; minting retries on that.
    async fn insert_token(&self, token: &Token) -> Result<(), StoreError>;

    /// Rows under a prefix regardless of status, newest first, capped at
    /// `limit`. Terminal rows stay matchable so a replayed token reports its
    /// terminal state instead of reading as unknown.
    async fn candidates_by_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<Token>, StoreError>;

    /// The single-use transition. Locks the row, re-verifies status and expiry
    /// under the lock, flips ACTIVE → USED, writes the ledger entry and the
    /// attempt row, and commits. Terminal observations (USED, EXPIRED) also
    /// write their attempt row before returning.
    async fn redeem(
        &self,
        token_id: Uuid,
        agent_id: &str,
        metadata: &AttemptMetadata,
        now: DateTime<Utc>,
    ) -> Result<RedeemTransition, StoreError>;

    /// Records an attempt outside the redemption transaction (unknown tokens,
    /// risk refusals).
    async fn record_attempt(&self, attempt: &RedemptionAttempt) -> Result<(), StoreError>;

    async fn get_token(&self, id: Uuid) -> Result<Token, StoreError>;

    async fn transactions_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn attempts_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<RedemptionAttempt>, StoreError>;

    // Read-only aggregates feeding the risk context. Snapshot semantics; they
    // are not transactionally tied to the redemption that follows.

    async fn count_tokens_created_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Mean amount of successful withdrawals for the account, None when the
    /// account has no ledger history.
    async fn average_withdrawal_amount(
        &self,
        account_id: Uuid,
    ) -> Result<Option<f64>, StoreError>;

    async fn count_failed_attempts_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// `metadata.ip` of the most recent successful attempt for the account.
    async fn last_successful_ip(&self, account_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
