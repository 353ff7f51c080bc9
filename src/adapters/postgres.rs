// src/adapters/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    AttemptMetadata, AttemptResult, RedeemTransition, RedemptionAttempt, StoreError, Token,
    TokenStatus, TokenStore, Transaction, TransactionKind, TransactionStatus,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateTokenHash
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn token_from_row(row: &PgRow) -> Result<Token, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = TokenStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown token status {:?}", status_raw)))?;

    Ok(Token {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        token_hash: row.try_get("token_hash")?,
        salt: row.try_get("salt")?,
        prefix: row.try_get("prefix")?,
        status,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<RedemptionAttempt, StoreError> {
    let result_raw: String = row.try_get("result")?;
    let result = AttemptResult::parse(&result_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown attempt result {:?}", result_raw)))?;

    let metadata_raw: serde_json::Value = row.try_get("metadata")?;
    let metadata: AttemptMetadata = serde_json::from_value(metadata_raw)
        .map_err(|e| StoreError::Storage(e.to_string()))?;

    Ok(RedemptionAttempt {
        id: row.try_get("id")?,
        token_id: row.try_get("token_id")?,
        agent_id: row.try_get("agent_id")?,
        result,
        metadata,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = TransactionKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown transaction kind {:?}", kind_raw)))?;

    let status_raw: String = row.try_get("status")?;
    let status = TransactionStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Storage(format!("unknown transaction status {:?}", status_raw))
    })?;

    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        token_id: row.try_get("token_id")?,
        kind,
        amount: row.try_get("amount")?,
        status,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_attempt_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    attempt: &RedemptionAttempt,
) -> Result<(), StoreError> {
    let metadata =
        serde_json::to_value(&attempt.metadata).map_err(|e| StoreError::Storage(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO redemption_attempts (id, token_id, agent_id, result, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.token_id)
    .bind(&attempt.agent_id)
    .bind(attempt.result.as_str())
    .bind(metadata)
    .bind(attempt.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl TokenStore for PostgresStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                token_hash BYTEA NOT NULL,
                salt BYTEA NOT NULL,
                prefix TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'USED', 'EXPIRED')),
                expires_at TIMESTAMPTZ NOT NULL,
                used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Collisions are rejected here, not deduplicated; minting retries
        // with a fresh draw.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_token_hash
            ON tokens(token_hash)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // The candidate scan probes (prefix, status); expiry is re-checked on
        // the fetched rows.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tokens_prefix_status
            ON tokens(prefix, status)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tokens_account
            ON tokens(account_id)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tokens_expires_at
            ON tokens(expires_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL,
                token_id UUID NOT NULL REFERENCES tokens(id),
                kind TEXT NOT NULL CHECK (kind IN ('WITHDRAWAL')),
                amount BIGINT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('SUCCESS')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // One ledger row per token, enforced by the database.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_token
            ON transactions(token_id)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_account_created
            ON transactions(account_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS redemption_attempts (
                id UUID PRIMARY KEY,
                token_id UUID REFERENCES tokens(id),
                agent_id TEXT NOT NULL,
                result TEXT NOT NULL CHECK (result IN
                    ('SUCCESS', 'INVALID', 'USED', 'EXPIRED', 'REJECTED_BY_RISK', 'CHALLENGED')),
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_redemption_attempts_token
            ON redemption_attempts(token_id)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_redemption_attempts_created
            ON redemption_attempts(created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tokens
                (id, account_id, amount, token_hash, salt, prefix, status, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(token.id)
        .bind(token.account_id)
        .bind(token.amount)
        .bind(&token.token_hash)
        .bind(&token.salt)
        .bind(&token.prefix)
        .bind(token.status.as_str())
        .bind(token.expires_at)
        .bind(token.used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn candidates_by_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, amount, token_hash, salt, prefix, status,
                   expires_at, used_at, created_at
            FROM tokens
            WHERE prefix = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(prefix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(token_from_row).collect()
    }

    async fn redeem(
        &self,
        token_id: Uuid,
        agent_id: &str,
        metadata: &AttemptMetadata,
        now: DateTime<Utc>,
    ) -> Result<RedeemTransition, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Isolation floor; the FOR UPDATE lock below is what serializes
        // competing redemptions of the same row.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, token_hash, salt, prefix, status,
                   expires_at, used_at, created_at
            FROM tokens
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(token_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::TokenNotFound)?;

        let token = token_from_row(&row)?;

        let transition = if token.status == TokenStatus::Used {
            insert_attempt_tx(
                &mut tx,
                &RedemptionAttempt::record(
                    Some(token_id),
                    agent_id,
                    AttemptResult::Used,
                    metadata.clone(),
                ),
            )
            .await?;
            RedeemTransition::AlreadyUsed
        } else if token.status == TokenStatus::Expired || now >= token.expires_at {
            // Upgrade ACTIVE-but-past-expiry in place so later scans skip the
            // row without date math.
            if token.status.is_active() {
                sqlx::query("UPDATE tokens SET status = 'EXPIRED' WHERE id = $1 AND status = 'ACTIVE'")
                    .bind(token_id)
                    .execute(&mut *tx)
                    .await?;
            }
            insert_attempt_tx(
                &mut tx,
                &RedemptionAttempt::record(
                    Some(token_id),
                    agent_id,
                    AttemptResult::Expired,
                    metadata.clone(),
                ),
            )
            .await?;
            RedeemTransition::Expired
        } else {
            // Optimistic guard on top of the row lock: zero rows affected
            // means someone else consumed the token first.
            let updated = sqlx::query(
                r#"
                UPDATE tokens SET status = 'USED', used_at = $2
                WHERE id = $1 AND status = 'ACTIVE'
                "#,
            )
            .bind(token_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                insert_attempt_tx(
                    &mut tx,
                    &RedemptionAttempt::record(
                        Some(token_id),
                        agent_id,
                        AttemptResult::Used,
                        metadata.clone(),
                    ),
                )
                .await?;
                RedeemTransition::AlreadyUsed
            } else {
                let entry = Transaction::withdrawal(token.account_id, token_id, token.amount);

                sqlx::query(
                    r#"
                    INSERT INTO transactions
                        (id, account_id, token_id, kind, amount, status, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(entry.id)
                .bind(entry.account_id)
                .bind(entry.token_id)
                .bind(entry.kind.as_str())
                .bind(entry.amount)
                .bind(entry.status.as_str())
                .bind(entry.created_at)
                .execute(&mut *tx)
                .await?;

                insert_attempt_tx(
                    &mut tx,
                    &RedemptionAttempt::record(
                        Some(token_id),
                        agent_id,
                        AttemptResult::Success,
                        metadata.clone(),
                    ),
                )
                .await?;

                RedeemTransition::Redeemed {
                    transaction_id: entry.id,
                }
            }
        };

        tx.commit().await?;
        Ok(transition)
    }

    async fn record_attempt(&self, attempt: &RedemptionAttempt) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&attempt.metadata)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO redemption_attempts (id, token_id, agent_id, result, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.token_id)
        .bind(&attempt.agent_id)
        .bind(attempt.result.as_str())
        .bind(metadata)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> Result<Token, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, token_hash, salt, prefix, status,
                   expires_at, used_at, created_at
            FROM tokens
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TokenNotFound)?;

        token_from_row(&row)
    }

    async fn transactions_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, token_id, kind, amount, status, created_at
            FROM transactions
            WHERE token_id = $1
            "#,
        )
        .bind(token_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn attempts_for_token(
        &self,
        token_id: Uuid,
    ) -> Result<Vec<RedemptionAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, token_id, agent_id, result, metadata, created_at
            FROM redemption_attempts
            WHERE token_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(token_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn count_tokens_created_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tokens
            WHERE account_id = $1 AND created_at > $2
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn average_withdrawal_amount(
        &self,
        account_id: Uuid,
    ) -> Result<Option<f64>, StoreError> {
        // AVG over BIGINT is NUMERIC; cast for a straight f64 decode.
        let avg: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(amount)::FLOAT8 FROM transactions
            WHERE account_id = $1 AND status = 'SUCCESS'
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(avg)
    }

    async fn count_failed_attempts_since(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM redemption_attempts ra
            JOIN tokens t ON ra.token_id = t.id
            WHERE t.account_id = $1 AND ra.result <> 'SUCCESS' AND ra.created_at > $2
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn last_successful_ip(&self, account_id: Uuid) -> Result<Option<String>, StoreError> {
        let ip: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT ra.metadata->>'ip'
            FROM redemption_attempts ra
            JOIN tokens t ON ra.token_id = t.id
            WHERE t.account_id = $1 AND ra.result = 'SUCCESS'
            ORDER BY ra.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ip.flatten())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
