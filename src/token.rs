// src/token.rs
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::crypto::{self, TokenHasher};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    Used,
    Expired,
}

impl TokenStatus {
    /// ACTIVE moves to USED or EXPIRED exactly once; USED and EXPIRED are
    /// terminal.
    pub fn can_transition_to(&self, target: TokenStatus) -> bool {
        matches!(
            (self, target),
            (TokenStatus::Active, TokenStatus::Used) | (TokenStatus::Active, TokenStatus::Expired)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TokenStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "ACTIVE",
            TokenStatus::Used => "USED",
            TokenStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TokenStatus::Active),
            "USED" => Some(TokenStatus::Used),
            "EXPIRED" => Some(TokenStatus::Expired),
            _ => None,
        }
    }
}

/// A single withdrawal token row. The plaintext is never part of this struct:
/// only the digest, the per-token salt, and the non-secret prefix persist.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Minor currency units, always positive.
    pub amount: i64,
    #[serde(skip_serializing)]
    pub token_hash: Vec<u8>,
    #[serde(skip_serializing)]
    pub salt: Vec<u8>,
    pub prefix: String,
    pub status: TokenStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Mints a fresh ACTIVE token row. Returns the row together with the
    /// plaintext, which exists only in the caller's memory from here on.
    pub fn mint(
        account_id: Uuid,
        amount: i64,
        hasher: &TokenHasher,
        ttl: Duration,
    ) -> (Self, String) {
        let plaintext = crypto::generate_plaintext();
        let salt = crypto::generate_salt();
        let now = Utc::now();

        let token = Self {
            id: Uuid::now_v7(),
            account_id,
            amount,
            token_hash: hasher.digest(&plaintext, &salt).to_vec(),
            salt: salt.to_vec(),
            prefix: plaintext[..crypto::PREFIX_LEN].to_string(),
            status: TokenStatus::Active,
            expires_at: now + ttl,
            used_at: None,
            created_at: now,
        };

        (token, plaintext)
    }

    /// Strict liveness check: a token is redeemable only while
    /// `now < expires_at` and the status is still ACTIVE.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && now < self.expires_at
    }
}
