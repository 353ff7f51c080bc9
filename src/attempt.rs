// src/attempt.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Forensic result of a redemption attempt. The wire protocol fuses USED and
/// EXPIRED into one terminal answer; attempt rows keep them distinct.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Invalid,
    Used,
    Expired,
    RejectedByRisk,
    Challenged,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Success => "SUCCESS",
            AttemptResult::Invalid => "INVALID",
            AttemptResult::Used => "USED",
            AttemptResult::Expired => "EXPIRED",
            AttemptResult::RejectedByRisk => "REJECTED_BY_RISK",
            AttemptResult::Challenged => "CHALLENGED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(AttemptResult::Success),
            "INVALID" => Some(AttemptResult::Invalid),
            "USED" => Some(AttemptResult::Used),
            "EXPIRED" => Some(AttemptResult::Expired),
            "REJECTED_BY_RISK" => Some(AttemptResult::RejectedByRisk),
            "CHALLENGED" => Some(AttemptResult::Challenged),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptResult::Success)
    }
}

/// Free-form evidence captured with an attempt. Known keys are typed; anything
/// else the agent sends rides along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AttemptMetadata {
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }
}

/// Evidence row recording every terminal redemption outcome. `token_id` is
/// None when the presented token never matched a row (unknown token, or a
/// risk refusal issued before matching).
#[derive(Debug, Clone, Serialize)]
pub struct RedemptionAttempt {
    pub id: Uuid,
    pub token_id: Option<Uuid>,
    pub agent_id: String,
    pub result: AttemptResult,
    pub metadata: AttemptMetadata,
    pub created_at: DateTime<Utc>,
}

impl RedemptionAttempt {
    pub fn record(
        token_id: Option<Uuid>,
        agent_id: &str,
        result: AttemptResult,
        metadata: AttemptMetadata,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            token_id,
            agent_id: agent_id.to_string(),
            result,
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trips_through_text() {
        for result in [
            AttemptResult::Success,
            AttemptResult::Invalid,
            AttemptResult::Used,
            AttemptResult::Expired,
            AttemptResult::RejectedByRisk,
            AttemptResult::Challenged,
        ] {
            assert_eq!(AttemptResult::parse(result.as_str()), Some(result));
        }
        assert_eq!(AttemptResult::parse("BOGUS"), None);
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let raw = r#"{"ip":"1.1.1.1","deviceId":"d-1","terminal":"lobby"}"#;
        let meta: AttemptMetadata = serde_json::from_str(raw).unwrap();

        assert_eq!(meta.ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(meta.device_id.as_deref(), Some("d-1"));
        assert_eq!(
            meta.extra.get("terminal").and_then(|v| v.as_str()),
            Some("lobby")
        );

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back.get("terminal").and_then(|v| v.as_str()), Some("lobby"));
    }
}
