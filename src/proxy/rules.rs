//! Rule matching shared by mock, rewrite, map-remote and breakpoint rules.

use crate::models::rules::{
    method_allows, BreakpointRule, ConditionKind, ConditionOperator, ExchangePhase,
    MapRemoteRule, MockRule, RewriteRule, RewriteTarget, RuleCondition,
};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Match `text` against a `*` wildcard pattern.
///
/// Without `*` the pattern must equal the text. Otherwise every literal
/// segment must appear in order; the first one is anchored at the start unless
/// the pattern begins with `*`, and the text must end with the last one unless
/// the pattern ends with `*`.
pub fn wildcard_match(text: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return text == pattern;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let last = segments.len() - 1;
    let mut pos = 0usize;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(segment) {
                return false;
            }
            pos = segment.len();
            continue;
        }
        if i == last {
            // Trailing literal must close the text without overlapping
            // what earlier segments consumed.
            return text.len() >= pos + segment.len() && text.ends_with(segment);
        }
        match text[pos..].find(segment) {
            Some(found) => pos += found + segment.len(),
            None => return false,
        }
    }
    true
}

/// Rewrite `url` onto `target` for a map-remote rule.
///
/// The fixed prefix of `pattern` (text before its first `*`) is located in
/// the URL; whatever follows it is spliced into the target's `*`, or appended
/// when the target ends with `/` and has no wildcard.
pub fn apply_map_remote(pattern: &str, target: &str, url: &str) -> String {
    let prefix = pattern.split('*').next().unwrap_or("");
    if !url.contains(prefix) {
        return target.to_string();
    }

    let suffix = trailing_capture(url, pattern);
    if target.contains('*') {
        target.replacen('*', suffix, 1)
    } else if target.ends_with('/') {
        format!("{target}{}", suffix.trim_start_matches('/'))
    } else {
        target.to_string()
    }
}

/// Text consumed by the trailing `*` of `pattern`, locating each literal
/// segment left to right. Empty when the pattern does not end with `*`.
fn trailing_capture<'a>(text: &'a str, pattern: &str) -> &'a str {
    if !pattern.ends_with('*') {
        return "";
    }
    let mut pos = 0usize;
    for segment in pattern.split('*').filter(|s| !s.is_empty()) {
        match text[pos..].find(segment) {
            Some(found) => pos += found + segment.len(),
            None => break,
        }
    }
    &text[pos..]
}

/// Everything a condition may inspect about the request.
pub struct RequestFacts<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub body: Option<&'a [u8]>,
}

impl RequestFacts<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query(&self, key: &str) -> Option<String> {
        let parsed = url::Url::parse(self.url).ok()?;
        let value = parsed
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned());
        value
    }
}

/// Compiled-regex cache keyed by source pattern.
#[derive(Default)]
pub struct RegexCache {
    text: Mutex<HashMap<String, Option<Regex>>>,
    bytes: Mutex<HashMap<String, Option<BytesRegex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled regex, or `None` when the pattern does not compile.
    pub fn text(&self, pattern: &str) -> Option<Regex> {
        let mut cache = self.text.lock().ok()?;
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!("Skipping rule with invalid regex {pattern:?}: {err}");
                    None
                }
            })
            .clone()
    }

    pub fn bytes(&self, pattern: &str) -> Option<BytesRegex> {
        let mut cache = self.bytes.lock().ok()?;
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| match BytesRegex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!("Skipping rule with invalid regex {pattern:?}: {err}");
                    None
                }
            })
            .clone()
    }
}

fn compare(operator: ConditionOperator, actual: &str, expected: &str, regex: &RegexCache) -> bool {
    match operator {
        ConditionOperator::Contains => actual.contains(expected),
        ConditionOperator::Regex => regex
            .text(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        ConditionOperator::Exists => true,
        ConditionOperator::NotExists => false,
        ConditionOperator::Equals | ConditionOperator::Unknown => actual == expected,
    }
}

fn condition_holds(cond: &RuleCondition, facts: &RequestFacts<'_>, regex: &RegexCache) -> bool {
    let actual: Option<String> = match cond.kind {
        ConditionKind::Header => facts.header(&cond.key).map(str::to_string),
        ConditionKind::Query => facts.query(&cond.key),
        ConditionKind::Body => facts
            .body
            .filter(|b| !b.is_empty())
            .map(|b| String::from_utf8_lossy(b).into_owned()),
        // Unknown kinds pass.
        ConditionKind::Unknown => return true,
    };

    match (cond.operator, actual) {
        (ConditionOperator::NotExists, value) => value.is_none(),
        (_, None) => false,
        (op, Some(value)) => compare(op, &value, &cond.value, regex),
    }
}

/// AND of all conditions; an empty list matches.
pub fn conditions_match(
    conditions: &[RuleCondition],
    facts: &RequestFacts<'_>,
    regex: &RegexCache,
) -> bool {
    conditions
        .iter()
        .all(|cond| condition_holds(cond, facts, regex))
}

pub fn find_mock<'r>(
    rules: &'r [MockRule],
    facts: &RequestFacts<'_>,
    regex: &RegexCache,
) -> Option<&'r MockRule> {
    rules.iter().find(|rule| {
        rule.enabled
            && method_allows(&rule.method, facts.method)
            && wildcard_match(facts.url, &rule.url_pattern)
            && conditions_match(&rule.conditions, facts, regex)
    })
}

/// Target URL of the first matching map-remote rule.
pub fn map_remote_target(rules: &[MapRemoteRule], method: &str, url: &str) -> Option<String> {
    rules
        .iter()
        .find(|rule| {
            rule.enabled
                && method_allows(&rule.method, method)
                && wildcard_match(url, &rule.url_pattern)
        })
        .map(|rule| apply_map_remote(&rule.url_pattern, &rule.target, url))
}

pub fn find_breakpoint<'r>(
    rules: &'r [BreakpointRule],
    phase: ExchangePhase,
    method: &str,
    url: &str,
) -> Option<&'r BreakpointRule> {
    rules.iter().find(|rule| {
        rule.phase.covers(phase)
            && method_allows(&rule.method, method)
            && wildcard_match(url, &rule.url_pattern)
    })
}

/// Rewrite rules that fire for this phase and request.
pub fn applicable_rewrites<'r>(
    rules: &'r [RewriteRule],
    phase: ExchangePhase,
    facts: &RequestFacts<'_>,
    regex: &RegexCache,
) -> Vec<&'r RewriteRule> {
    rules
        .iter()
        .filter(|rule| {
            rule.enabled
                && rule.phase.covers(phase)
                && method_allows(&rule.method, facts.method)
                && wildcard_match(facts.url, &rule.url_pattern)
                && conditions_match(&rule.conditions, facts, regex)
        })
        .collect()
}

/// Header values staged by rewrite rules, applied when the head is written.
///
/// Kept apart from the body so framing headers are always derived from the
/// final body rather than from a rewritten value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderOverrides {
    entries: Vec<(String, String)>,
}

impl HeaderOverrides {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(&mut self, name: &str, value: String) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Apply onto a header list. Framing headers are left untouched.
    pub fn apply_to(&self, headers: &mut Vec<(String, String)>) {
        for (name, value) in &self.entries {
            if is_framing_header(name) {
                tracing::warn!("Ignoring rewrite of framing header {name}");
                continue;
            }
            match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some(existing) => existing.1 = value.clone(),
                None => headers.push((name.clone(), value.clone())),
            }
        }
    }
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Whether any of `rules` needs the full body in memory.
pub fn rewrites_touch_body(rules: &[&RewriteRule]) -> bool {
    rules
        .iter()
        .any(|rule| matches!(rule.target, RewriteTarget::Body))
}

/// Run rewrite rules over `headers` and `body`.
///
/// Header targets replace within the header's current value (the staged value
/// if an earlier rule already rewrote it). Body targets substitute on the raw
/// bytes. Returns whether the body changed.
pub fn apply_rewrites(
    rules: &[&RewriteRule],
    headers: &[(String, String)],
    body: &mut Vec<u8>,
    overrides: &mut HeaderOverrides,
    regex: &RegexCache,
) -> bool {
    let mut body_changed = false;
    for rule in rules {
        match &rule.target {
            RewriteTarget::Body => {
                let Some(re) = regex.bytes(&rule.pattern) else {
                    continue;
                };
                let rewritten = re
                    .replace_all(body, rule.replacement.as_bytes())
                    .into_owned();
                if rewritten != *body {
                    *body = rewritten;
                    body_changed = true;
                }
            }
            RewriteTarget::Header { name } => {
                let Some(re) = regex.text(&rule.pattern) else {
                    continue;
                };
                let current = overrides.get(name).map(str::to_string).or_else(|| {
                    headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(name))
                        .map(|(_, v)| v.clone())
                });
                let Some(current) = current else {
                    continue;
                };
                let replaced = re.replace_all(&current, rule.replacement.as_str());
                if replaced.as_ref() != current.as_str() {
                    overrides.set(name, replaced.into_owned());
                }
            }
        }
    }
    body_changed
}
