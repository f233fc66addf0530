//! Risk classification and approval gate for proposed actions.
//!
//! The gate is a pure decision function over declarative rule data: no side
//! effects, no clock, no I/O. Rules are plain values so they can be loaded
//! from configuration, hot-reloaded, and unit-tested in isolation.

use serde::{Deserialize, Serialize};

use crate::domain::task::{ActionPayload, RiskTier};

/// Maps an action kind (exact or prefix match) to its risk tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub kind_prefix: String,
    pub tier: RiskTier,
}

/// Allow-list entry: a command prefix permitted at the given tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    pub tier: RiskTier,
    pub prefix: String,
}

/// Declarative policy rule set. The deny list always wins; irreversible
/// actions always escalate; an unclassifiable payload is denied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRules {
    pub classification: Vec<ClassificationRule>,
    pub deny_patterns: Vec<String>,
    pub allow: Vec<AllowRule>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            classification: Vec::new(),
            deny_patterns: vec![
                "rm -rf /".to_string(),
                "sudo rm".to_string(),
                "sudo shutdown".to_string(),
                "sudo reboot".to_string(),
                "sudo poweroff".to_string(),
                "mkfs".to_string(),
                "dd if=".to_string(),
            ],
            allow: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny { reason: String },
    Escalate,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny { .. } => "deny",
            Self::Escalate => "escalate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Effective risk tier. Unclassifiable payloads carry the highest tier.
    pub tier: RiskTier,
    pub verdict: Verdict,
    pub matched_rule: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PolicyGate {
    rules: PolicyRules,
}

impl PolicyGate {
    pub fn new(rules: PolicyRules) -> Self {
        Self { rules }
    }

    /// Swap in a fresh rule set (rules are data, not code).
    pub fn reload(&mut self, rules: PolicyRules) {
        self.rules = rules;
    }

    /// Resolve the payload's risk tier from the classification rules.
    /// `None` means the action kind is unknown to policy.
    pub fn classify(&self, payload: &ActionPayload) -> Option<RiskTier> {
        let kind = normalize(&payload.kind);
        self.rules
            .classification
            .iter()
            .find(|rule| kind.starts_with(&normalize(&rule.kind_prefix)))
            .map(|rule| rule.tier)
    }

    /// Full gate evaluation.
    ///
    /// Check order: deny list first (unconditional, any tier), then
    /// classification (unknown kind is denied at the irreversible tier), then
    /// tier rules: irreversible always escalates, read is permitted, write
    /// requires an allow-list prefix match.
    pub fn evaluate(&self, payload: &ActionPayload) -> GateDecision {
        let subject = subject_of(payload);
        let kind = normalize(&payload.kind);
        let tier = self.classify(payload);

        if let Some(pattern) = self.match_deny(&subject, &kind) {
            return GateDecision {
                tier: tier.unwrap_or(RiskTier::Irreversible),
                verdict: Verdict::Deny { reason: format!("matched deny pattern `{pattern}`") },
                matched_rule: Some(format!("deny:{pattern}")),
            };
        }

        let Some(tier) = tier else {
            return GateDecision {
                tier: RiskTier::Irreversible,
                verdict: Verdict::Deny {
                    reason: format!("action kind `{}` is not classified by policy", payload.kind),
                },
                matched_rule: None,
            };
        };

        match tier {
            RiskTier::Irreversible => {
                GateDecision { tier, verdict: Verdict::Escalate, matched_rule: None }
            }
            RiskTier::Read => GateDecision { tier, verdict: Verdict::Allow, matched_rule: None },
            RiskTier::Write => match self.match_allow(tier, &subject) {
                Some(prefix) => GateDecision {
                    tier,
                    verdict: Verdict::Allow,
                    matched_rule: Some(format!("allow:{}:{prefix}", tier.as_str())),
                },
                None => GateDecision {
                    tier,
                    verdict: Verdict::Deny {
                        reason: format!(
                            "no allow-list entry permits `{subject}` at the {} tier",
                            tier.as_str()
                        ),
                    },
                    matched_rule: None,
                },
            },
        }
    }

    fn match_deny(&self, subject: &str, kind: &str) -> Option<String> {
        self.rules
            .deny_patterns
            .iter()
            .find(|pattern| {
                let pattern = normalize(pattern);
                subject.starts_with(&pattern) || kind.starts_with(&pattern)
            })
            .cloned()
    }

    fn match_allow(&self, tier: RiskTier, subject: &str) -> Option<String> {
        self.rules
            .allow
            .iter()
            .filter(|rule| rule.tier == tier)
            .find(|rule| subject.starts_with(&normalize(&rule.prefix)))
            .map(|rule| rule.prefix.clone())
    }
}

/// The string policy patterns run against: the embedded command text when the
/// payload carries one, the action kind otherwise.
fn subject_of(payload: &ActionPayload) -> String {
    serde_json::from_str::<serde_json::Value>(&payload.detail_json)
        .ok()
        .and_then(|detail| {
            detail.get("command").and_then(|command| command.as_str()).map(normalize)
        })
        .unwrap_or_else(|| normalize(&payload.kind))
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
