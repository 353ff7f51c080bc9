// src/service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::crypto::{self, TokenHasher};
use crate::{
    AppError, AttemptMetadata, AttemptResult, RedeemTransition, RedemptionAttempt, StoreError,
    Token, TokenStore,
};

/// Mint draws per request, counting the first. Exhaustion means the CSPRNG
/// collided three times in a row on a 32-byte digest and is treated as a
/// fault.
const MINT_ATTEMPTS: u32 = 3;

/// Hard cap on candidate rows scanned per prefix. A live prefix population
/// anywhere near this indicates abuse or a broken TTL, so hitting the cap is
/// a SECURITY event.
pub const CANDIDATE_SCAN_CAP: i64 = 32;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintedToken {
    pub id: Uuid,
    /// The only copy of the plaintext that ever leaves the process. Never
    /// logged, cached, or persisted.
    pub token: String,
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
}

/// Wire-level redemption outcome. USED and EXPIRED are fused at this boundary;
/// attempt rows keep them distinct for forensics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    Success { token_id: Uuid, transaction_id: Uuid },
    Invalid,
    ExpiredOrUsed,
}

/// A candidate row whose digest matched the presented plaintext. Nothing has
/// been mutated yet; amount and account feed the risk context.
#[derive(Debug, Clone, Copy)]
pub struct MatchedToken {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    /// False when the match was already terminal (or past expiry) at scan
    /// time. Callers skip the risk gate for these; the locked transition
    /// reports the terminal state either way.
    pub live: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Lookup {
    /// Fails the wire pattern; rejected without touching storage.
    Malformed,
    /// Well-formed but no digest under the prefix matched. An INVALID attempt
    /// row has been recorded.
    NoMatch,
    Match(MatchedToken),
}

pub struct TokenService {
    store: Arc<dyn TokenStore>,
    hasher: TokenHasher,
    ttl: Duration,
}

impl TokenService {
    pub fn new(store: Arc<dyn TokenStore>, hasher: TokenHasher, ttl: Duration) -> Self {
        Self { store, hasher, ttl }
    }

    /// Mints a fresh single-use withdrawal token and returns its plaintext
    /// exactly once.
    pub async fn mint(&self, account_id: Uuid, amount: i64) -> Result<MintedToken, AppError> {
        if amount <= 0 {
            return Err(AppError::invalid_argument(
                "amount must be a positive integer",
            ));
        }

        for attempt in 1..=MINT_ATTEMPTS {
            let (token, plaintext) = Token::mint(account_id, amount, &self.hasher, self.ttl);

            match self.store.insert_token(&token).await {
                Ok(()) => {
                    counter!("cardless_tokens_minted_total").increment(1);
                    return Ok(MintedToken {
                        id: token.id,
                        token: plaintext,
                        amount,
                        expires_at: token.expires_at,
                    });
                }
                Err(StoreError::DuplicateTokenHash) => {
                    warn!(
                        event_type = "SYSTEM",
                        component = "token_service",
                        attempt,
                        "token digest collision, redrawing"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(AppError::internal(
            "token minting exhausted its collision retries",
        ))
    }

    /// Parse, candidate scan, and constant-time match: the read-only half of
    /// redemption. A well-formed token that matches nothing records its
    /// INVALID attempt row here.
    pub async fn lookup(
        &self,
        full_token: &str,
        agent_id: &str,
        metadata: &AttemptMetadata,
    ) -> Result<Lookup, AppError> {
        let Some((prefix, _core)) = crypto::parse_plaintext(full_token) else {
            return Ok(Lookup::Malformed);
        };

        let now = Utc::now();
        let candidates = self
            .store
            .candidates_by_prefix(prefix, CANDIDATE_SCAN_CAP)
            .await?;

        if candidates.len() as i64 >= CANDIDATE_SCAN_CAP {
            warn!(
                event_type = "SECURITY",
                component = "token_service",
                prefix,
                "candidate scan hit its hard cap"
            );
        }

        for candidate in &candidates {
            if self
                .hasher
                .verify(full_token, &candidate.salt, &candidate.token_hash)
            {
                return Ok(Lookup::Match(MatchedToken {
                    id: candidate.id,
                    account_id: candidate.account_id,
                    amount: candidate.amount,
                    live: candidate.is_live(now),
                }));
            }
        }

        self.store
            .record_attempt(&RedemptionAttempt::record(
                None,
                agent_id,
                AttemptResult::Invalid,
                metadata.clone(),
            ))
            .await?;

        Ok(Lookup::NoMatch)
    }

    /// The locked single-use transition for a previously matched token.
    pub async fn finalize(
        &self,
        token_id: Uuid,
        agent_id: &str,
        metadata: &AttemptMetadata,
    ) -> Result<RedeemOutcome, AppError> {
        let now = Utc::now();

        match self.store.redeem(token_id, agent_id, metadata, now).await? {
            RedeemTransition::Redeemed { transaction_id } => {
                counter!("cardless_redemptions_total", "result" => "success").increment(1);
                Ok(RedeemOutcome::Success {
                    token_id,
                    transaction_id,
                })
            }
            RedeemTransition::AlreadyUsed | RedeemTransition::Expired => {
                counter!("cardless_redemptions_total", "result" => "expired_or_used").increment(1);
                Ok(RedeemOutcome::ExpiredOrUsed)
            }
        }
    }

    /// Full redemption protocol: lookup then finalize. Safe to retry, since a
    /// second call on the same plaintext observes the terminal state and
    /// returns `ExpiredOrUsed`; never a second ledger row.
    pub async fn redeem(
        &self,
        full_token: &str,
        agent_id: &str,
        metadata: &AttemptMetadata,
    ) -> Result<RedeemOutcome, AppError> {
        match self.lookup(full_token, agent_id, metadata).await? {
            Lookup::Malformed | Lookup::NoMatch => {
                counter!("cardless_redemptions_total", "result" => "invalid").increment(1);
                Ok(RedeemOutcome::Invalid)
            }
            Lookup::Match(matched) => self.finalize(matched.id, agent_id, metadata).await,
        }
    }
}
