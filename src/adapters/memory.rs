// src/adapters/memory.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    AttemptMetadata, AttemptResult, RedeemTransition, RedemptionAttempt, StoreError, Token,
    TokenStatus, TokenStore, Transaction,
};

/// In-memory token store. Redemptions hold every map mutex for the whole
/// operation, the in-memory equivalent of BEGIN / SELECT FOR UPDATE / COMMIT,
/// which is what makes the single-use guarantee hold under concurrency.
#[derive(Clone)]
pub struct MemoryStore {
    tokens: Arc<Mutex<HashMap<Uuid, Token>>>,
    transactions: Arc<Mutex<HashMap<Uuid, Transaction>>>,
    attempts: Arc<Mutex<Vec<RedemptionAttempt>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            transactions: Arc::new(Mutex::new(HashMap::new())),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every attempt row ever recorded, in insertion order. Covers rows with
    /// no token reference, which `attempts_for_token` cannot reach.
    pub fn attempts_snapshot(&self) -> Vec<RedemptionAttempt> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().unwrap();

        // Unique-index equivalent on token_hash.
        if tokens.values().any(|t| t.token_hash == token.token_hash) {
            return Err(StoreError::DuplicateTokenHash);
        }

        tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn candidates_by_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<Token>, StoreError> {
        let tokens = self.tokens.lock().unwrap();

        let mut candidates: Vec<Token> = tokens
            .values()
            .filter(|t| t.prefix == prefix)
            .cloned()
            .collect();
        candidates.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        candidates.truncate(limit.max(0) as usize);

        Ok(candidates)
    }

    async fn redeem(
        &self,
        token_id: Uuid,
        agent_id: &str,
        metadata: &AttemptMetadata,
        now: DateTime<Utc>,
    ) -> Result<RedeemTransition, StoreError> {
        // Lock order: tokens, transactions, attempts. Held until return.
        let mut tokens = self.tokens.lock().unwrap();
        let mut transactions = self.transactions.lock().unwrap();
        let mut attempts = self.attempts.lock().unwrap();

        let token = tokens.get_mut(&token_id).ok_or(StoreError::TokenNotFound)?;

        if token.status == TokenStatus::Used {
            attempts.push(RedemptionAttempt::record(
                Some(token_id),
                agent_id,
                AttemptResult::Used,
                metadata.clone(),
            ));
            return Ok(RedeemTransition::AlreadyUsed);
        }

        if token.status == TokenStatus::Expired || now >= token.expires_at {
            // Upgrade in place so later scans skip the row without date math.
            if token.status.is_active() {
                token.status = TokenStatus::Expired;
            }
            attempts.push(RedemptionAttempt::record(
                Some(token_id),
                agent_id,
                AttemptResult::Expired,
                metadata.clone(),
            ));
            return Ok(RedeemTransition::Expired);
        }

        // One ledger row per token, ever.
        if transactions.values().any(|tx| tx.token_id == token_id) {
            return Err(StoreError::Storage(format!(
                "ledger entry already exists for token {}",
                token_id
            )));
        }

        token.status = TokenStatus::Used;
        token.used_at = Some(now);

        let entry = Transaction::withdrawal(token.account_id, token_id, token.amount);
        let transaction_id = entry.id;
        transactions.insert(entry.id, entry);

        attempts.push(RedemptionAttempt::record(
            Some(token_id),
            agent_id,
            AttemptResult::Success,
            metadata.clone(),
        ));

        Ok(RedeemTransition::Redeemed { transaction_id })
    }

    async fn record_attempt(&self, attempt: &RedemptionAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.push(attempt.clone());
        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> Result<Token, StoreError> {
        let tokens = self.tokens.lock().unwrap();
        tokens.get(&id).cloned().ok_or(StoreError::TokenNotFound)
    }

    async fn transactions_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        let transactions = self.transactions.lock().unwrap();
        Ok(transactions
            .values()
            .filter(|tx| tx.token_id == token_id)
            .cloned()
            .collect())
    }

    async fn attempts_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<RedemptionAttempt>, StoreError> {
        let attempts = self.attempts.lock().unwrap();
        Ok(attempts
            .iter()
            .filter(|a| a.token_id == Some(token_id))
            .cloned()
            .collect())
    }

    async fn count_tokens_created_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let tokens = self.tokens.lock().unwrap();
        Ok(tokens
            .values()
            .filter(|t| t.account_id == account_id && t.created_at > since)
            .count() as u64)
    }

    async fn average_withdrawal_amount(
        &self,
        account_id: Uuid,
    ) -> Result<Option<f64>, StoreError> {
        let transactions = self.transactions.lock().unwrap();

        let amounts: Vec<i64> = transactions
            .values()
            .filter(|tx| tx.account_id == account_id)
            .map(|tx| tx.amount)
            .collect();

        if amounts.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            amounts.iter().sum::<i64>() as f64 / amounts.len() as f64,
        ))
    }

    async fn count_failed_attempts_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let tokens = self.tokens.lock().unwrap();
        let attempts = self.attempts.lock().unwrap();

        Ok(attempts
            .iter()
            .filter(|a| {
                !a.result.is_success()
                    && a.created_at > since
                    && a.token_id
                        .and_then(|id| tokens.get(&id))
                        .is_some_and(|t| t.account_id == account_id)
            })
            .count() as u64)
    }

    async fn last_successful_ip(&self, account_id: Uuid) -> Result<Option<String>, StoreError> {
        let tokens = self.tokens.lock().unwrap();
        let attempts = self.attempts.lock().unwrap();

        Ok(attempts
            .iter()
            .filter(|a| {
                a.result.is_success()
                    && a.token_id
                        .and_then(|id| tokens.get(&id))
                        .is_some_and(|t| t.account_id == account_id)
            })
            .max_by_key(|a| a.created_at)
            .and_then(|a| a.metadata.ip.clone()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
