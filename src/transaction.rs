// src/transaction.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TransactionKind {
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Withdrawal => "WITHDRAWAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WITHDRAWAL" => Some(TransactionKind::Withdrawal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "SUCCESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(TransactionStatus::Success),
            _ => None,
        }
    }
}

/// Immutable withdrawal ledger entry. Rows are insert-only and written solely
/// inside the redemption transaction; the unique index on `token_id` caps the
/// ledger at one row per token.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub token_id: Uuid,
    pub kind: TransactionKind,
    pub amount: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn withdrawal(account_id: Uuid, token_id: Uuid, amount: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            token_id,
            kind: TransactionKind::Withdrawal,
            amount,
            status: TransactionStatus::Success,
            created_at: Utc::now(),
        }
    }
}
