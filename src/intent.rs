//! Intents and the upstream policy decision attached to them.
//!
//! The runtime never interprets an intent's context payload; it carries
//! it to the handler and into the cache fingerprint untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_type: Option<String>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl Intent {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            intent_type: None,
            context: serde_json::Map::new(),
        }
    }

    pub fn with_type(mut self, intent_type: impl Into<String>) -> Self {
        self.intent_type = Some(intent_type.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }
}

/// Verdict actions an upstream policy engine can attach. Only `Allow`
/// permits execution; everything else is rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Deny,
    Escalate,
    Limit,
    Monitor,
    Terminate,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Escalate => "escalate",
            Self::Limit => "limit",
            Self::Monitor => "monitor",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Low,
    Medium,
    High,
    Verified,
}

/// Upstream policy verdict for one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub trust_score: f64,
    pub trust_level: TrustLevel,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn allow(trust_score: f64, trust_level: TrustLevel) -> Self {
        Self { action: DecisionAction::Allow, trust_score, trust_level, timestamp: Utc::now() }
    }

    pub fn deny() -> Self {
        Self {
            action: DecisionAction::Deny,
            trust_score: 0.0,
            trust_level: TrustLevel::Untrusted,
            timestamp: Utc::now(),
        }
    }

    pub fn permits_execution(&self) -> bool {
        self.action == DecisionAction::Allow
    }
}
