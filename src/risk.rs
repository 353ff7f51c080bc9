// src/risk.rs
use serde::Serialize;

use crate::AttemptMetadata;

/// Historical signals for one account, gathered immediately before a
/// redemption is attempted.
#[derive(Debug, Clone, Default)]
pub struct RiskContext {
    /// Tokens minted in the last ten minutes.
    pub velocity_10m: u64,
    /// Mean successful withdrawal amount, None without ledger history.
    pub avg_amount: Option<f64>,
    /// Non-SUCCESS attempts in the last 24 hours.
    pub failed_attempts_24h: u64,
    /// IP recorded with the most recent successful attempt.
    pub last_ip: Option<String>,
    /// Amount of the token being redeemed now.
    pub current_amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskDecision {
    Approve,
    Challenge,
    Reject,
}

impl RiskDecision {
    /// Strict thresholds: above 0.7 rejects, below 0.3 approves, the closed
    /// band between challenges.
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            RiskDecision::Reject
        } else if score >= 0.3 {
            RiskDecision::Challenge
        } else {
            RiskDecision::Approve
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskDecision::Approve => "APPROVE",
            RiskDecision::Challenge => "CHALLENGE",
            RiskDecision::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// In [0.0, 1.0] at two-decimal precision.
    pub score: f64,
    pub decision: RiskDecision,
    pub reasons: Vec<String>,
}

/// Deterministic pre-redemption scorer. Pure: no I/O, no clock, no state.
/// Identical inputs always produce the identical assessment.
///
/// Contributions accumulate in integer hundredths so float noise can never
/// push an accumulated score across a threshold.
pub fn assess(ctx: &RiskContext, metadata: &AttemptMetadata) -> RiskAssessment {
    let mut points: u32 = 0;
    let mut reasons: Vec<String> = Vec::new();

    // Bucket upper bounds are inclusive: a tie lands in the lower bucket.
    if ctx.velocity_10m > 3 {
        points += 40;
        reasons.push("high velocity".to_string());
    } else if ctx.velocity_10m > 1 {
        points += 15;
        reasons.push("elevated velocity".to_string());
    }

    // Deviation is undefined without a positive historical mean.
    if let Some(avg) = ctx.avg_amount {
        if avg > 0.0 {
            let deviation = (ctx.current_amount as f64 - avg).abs() / avg;
            if deviation > 2.0 {
                points += 30;
                reasons.push("significant deviation".to_string());
            } else if deviation > 1.0 {
                points += 15;
                reasons.push("moderate deviation".to_string());
            }
        }
    }

    if ctx.failed_attempts_24h > 5 {
        points += 50;
        reasons.push("excessive failures".to_string());
    } else if ctx.failed_attempts_24h > 2 {
        points += 25;
        reasons.push("elevated failures".to_string());
    }

    if let (Some(last_ip), Some(current_ip)) = (&ctx.last_ip, &metadata.ip) {
        if last_ip != current_ip {
            points += 20;
            reasons.push("ip mismatch".to_string());
        }
    }

    let score = points.min(100) as f64 / 100.0;

    RiskAssessment {
        score,
        decision: RiskDecision::from_score(score),
        reasons,
    }
}
