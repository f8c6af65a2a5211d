//! Rule models for mocking, rewriting, remote mapping and breakpoints.
//!
//! Rules are created and removed through the engine control surface. Every
//! rule carries a wildcard URL pattern and an optional method filter.

use serde::{Deserialize, Serialize};

/// What part of the request a condition inspects.
///
/// Unrecognised kinds deserialize to `Unknown` and always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Header,
    Query,
    Body,
    #[serde(other)]
    Unknown,
}

/// Comparison operator of a condition.
///
/// Unrecognised operators deserialize to `Unknown` and compare for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    Exists,
    NotExists,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub key: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: String,
}

/// Canned response returned instead of contacting the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRule {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub url_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub delay_ms: u64,
}

impl MockRule {
    pub fn has_body_condition(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.kind == ConditionKind::Body)
    }
}

/// Which leg of an exchange a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    Request,
    Response,
    Both,
}

impl RulePhase {
    /// Whether a rule declared for `self` fires during `phase`.
    pub fn covers(&self, phase: ExchangePhase) -> bool {
        matches!(
            (self, phase),
            (RulePhase::Both, _)
                | (RulePhase::Request, ExchangePhase::Request)
                | (RulePhase::Response, ExchangePhase::Response)
        )
    }
}

/// The concrete leg currently being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePhase {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteTarget {
    Body,
    Header { name: String },
}

/// Regex substitution applied to a body or a single header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub url_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    pub phase: RulePhase,
    pub target: RewriteTarget,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Regex source; replacement may reference capture groups (`$1`, `${name}`)
    pub pattern: String,
    pub replacement: String,
}

/// Redirects matching requests to a different origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRemoteRule {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub url_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Target URL; a `*` receives the suffix matched by the source pattern
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointRule {
    pub id: String,
    pub url_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    pub phase: RulePhase,
}

fn enabled_by_default() -> bool {
    true
}

/// Whether an optional method filter admits `method`.
pub fn method_allows(filter: &Option<String>, method: &str) -> bool {
    match filter.as_deref().map(str::trim) {
        None | Some("") | Some("*") => true,
        Some(expected) => expected.eq_ignore_ascii_case(method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_condition_fields_deserialize_fail_open() {
        let json = r#"{"type":"cookie","key":"k","operator":"starts_with","value":"v"}"#;
        let cond: RuleCondition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.kind, ConditionKind::Unknown);
        assert_eq!(cond.operator, ConditionOperator::Unknown);
    }

    #[test]
    fn phase_coverage() {
        assert!(RulePhase::Both.covers(ExchangePhase::Request));
        assert!(RulePhase::Both.covers(ExchangePhase::Response));
        assert!(RulePhase::Request.covers(ExchangePhase::Request));
        assert!(!RulePhase::Request.covers(ExchangePhase::Response));
        assert!(!RulePhase::Response.covers(ExchangePhase::Request));
    }

    #[test]
    fn method_filter_is_case_insensitive() {
        assert!(method_allows(&None, "POST"));
        assert!(method_allows(&Some("*".into()), "POST"));
        assert!(method_allows(&Some("post".into()), "POST"));
        assert!(!method_allows(&Some("GET".into()), "POST"));
    }
}
