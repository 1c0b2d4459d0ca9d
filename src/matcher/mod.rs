//! Signal matcher: classifies console text against required / forbidden rules.
//!
//! The matcher is pure: it only mutates its own [`MatchState`]. A rule is
//! recorded the first time it matches and never again, so feeding the same
//! line twice (or the same marker on many lines) does not double-count.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::recorder::ConsoleEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleKind {
    Required,
    Forbidden,
}

/// How a rule's pattern is tested against a line.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Case-sensitive substring containment.
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Substring(needle) => text.contains(needle.as_str()),
            Pattern::Regex(re) => re.is_match(text),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Substring(s) => s,
            Pattern::Regex(re) => re.as_str(),
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Pattern::Regex(_))
    }
}

/// A single console expectation. Immutable once built.
#[derive(Debug, Clone)]
pub struct MatchRule {
    kind: RuleKind,
    pattern: Pattern,
    label: String,
}

impl MatchRule {
    pub fn new(kind: RuleKind, pattern: Pattern) -> Self {
        let label = pattern.as_str().to_string();
        Self {
            kind,
            pattern,
            label,
        }
    }

    pub fn required(needle: impl Into<String>) -> Self {
        Self::new(RuleKind::Required, Pattern::Substring(needle.into()))
    }

    pub fn forbidden(needle: impl Into<String>) -> Self {
        Self::new(RuleKind::Forbidden, Pattern::Substring(needle.into()))
    }

    pub fn regex(kind: RuleKind, expr: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(kind, Pattern::Regex(Regex::new(expr)?)))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn summary(&self) -> RuleSummary {
        RuleSummary {
            kind: self.kind,
            label: self.label.clone(),
            pattern: self.pattern.as_str().to_string(),
            regex: self.pattern.is_regex(),
        }
    }
}

/// Owned, serialisable description of a rule for verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub kind: RuleKind,
    pub label: String,
    pub pattern: String,
    pub regex: bool,
}

/// First console entry that tripped a forbidden rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RuleSummary,
    pub sequence: u64,
    pub text: String,
}

/// Per-rule record of the first matching entry, indexed like the rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchState {
    first_hit: Vec<Option<u64>>,
}

impl MatchState {
    fn for_rules(count: usize) -> Self {
        Self {
            first_hit: vec![None; count],
        }
    }

    pub fn is_hit(&self, index: usize) -> bool {
        self.first_hit.get(index).copied().flatten().is_some()
    }

    pub fn first_hit(&self, index: usize) -> Option<u64> {
        self.first_hit.get(index).copied().flatten()
    }
}

#[derive(Debug, Clone)]
pub struct SignalMatcher {
    rules: Vec<MatchRule>,
    state: MatchState,
    violations: Vec<Violation>,
}

impl SignalMatcher {
    pub fn new(rules: Vec<MatchRule>) -> Self {
        let state = MatchState::for_rules(rules.len());
        Self {
            rules,
            state,
            violations: Vec::new(),
        }
    }

    /// Rebuild a matcher by folding over an ordered sequence of entries.
    pub fn replay<'a>(
        rules: Vec<MatchRule>,
        entries: impl IntoIterator<Item = &'a ConsoleEntry>,
    ) -> Self {
        let mut matcher = Self::new(rules);
        for entry in entries {
            matcher.evaluate(entry.sequence, &entry.text);
        }
        matcher
    }

    /// Test `text` (the entry numbered `sequence`) against every rule that
    /// has not matched yet, returning the rules that matched for the first
    /// time. Forbidden rules in the result are violations.
    pub fn evaluate(&mut self, sequence: u64, text: &str) -> Vec<&MatchRule> {
        let mut fresh = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if self.state.first_hit[index].is_some() || !rule.matches(text) {
                continue;
            }
            self.state.first_hit[index] = Some(sequence);
            if rule.kind == RuleKind::Forbidden {
                tracing::warn!(
                    rule = %rule.label,
                    sequence,
                    "forbidden console pattern observed"
                );
                self.violations.push(Violation {
                    rule: rule.summary(),
                    sequence,
                    text: text.to_string(),
                });
            } else {
                tracing::debug!(rule = %rule.label, sequence, "required console pattern satisfied");
            }
            fresh.push(rule);
        }
        fresh
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn has_required(&self) -> bool {
        self.rules.iter().any(|r| r.kind == RuleKind::Required)
    }

    pub fn all_required_satisfied(&self) -> bool {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == RuleKind::Required)
            .all(|(i, _)| self.state.is_hit(i))
    }

    pub fn is_violated(&self) -> bool {
        !self.violations.is_empty()
    }

    /// MATCH readiness: at least one required rule, all of them satisfied,
    /// and nothing forbidden seen.
    pub fn is_ready(&self) -> bool {
        self.has_required() && self.all_required_satisfied() && !self.is_violated()
    }

    pub fn unmatched_required(&self) -> Vec<RuleSummary> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(i, r)| r.kind == RuleKind::Required && !self.state.is_hit(*i))
            .map(|(_, r)| r.summary())
            .collect()
    }

    /// Violations in the order they were observed.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rule_satisfied_exactly_once() {
        let mut m = SignalMatcher::new(vec![MatchRule::required("Spawning King Mushroom")]);

        let first = m.evaluate(1, "Spawning King Mushroom at (0, 0)");
        assert_eq!(first.len(), 1);

        assert!(m.evaluate(2, "Spawning King Mushroom at (4, 2)").is_empty());
        assert!(m.evaluate(1, "Spawning King Mushroom at (0, 0)").is_empty());
        assert_eq!(m.state().first_hit(0), Some(1));
        assert!(m.is_ready());
    }

    #[test]
    fn matching_is_case_sensitive() {
        let mut m = SignalMatcher::new(vec![MatchRule::required("Ready")]);
        assert!(m.evaluate(1, "ready").is_empty());
        assert!(!m.all_required_satisfied());
        assert_eq!(m.evaluate(2, "Ready!").len(), 1);
    }

    #[test]
    fn regex_rules_match_by_expression() {
        let rule = MatchRule::regex(RuleKind::Required, r"^Spawning \w+ Zone$").unwrap();
        let mut m = SignalMatcher::new(vec![rule]);
        assert!(m.evaluate(1, "Spawning Overgrown Zone now").is_empty());
        assert_eq!(m.evaluate(2, "Spawning Overgrown Zone").len(), 1);
        assert!(m.rules()[0].pattern().is_regex());
    }

    #[test]
    fn forbidden_rule_records_first_violation_only() {
        let mut m = SignalMatcher::new(vec![
            MatchRule::required("loaded"),
            MatchRule::forbidden("WebGPU"),
        ]);

        let hit = m.evaluate(3, "WebGPU not supported");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].kind(), RuleKind::Forbidden);
        m.evaluate(4, "WebGPU adapter lost");

        assert_eq!(m.violations().len(), 1);
        assert_eq!(m.violations()[0].sequence, 3);
        assert_eq!(m.violations()[0].text, "WebGPU not supported");

        m.evaluate(5, "loaded");
        assert!(m.all_required_satisfied());
        assert!(!m.is_ready(), "violation must block MATCH readiness");
    }

    #[test]
    fn one_line_can_satisfy_several_rules() {
        let mut m = SignalMatcher::new(vec![
            MatchRule::required("King"),
            MatchRule::required("Mushroom"),
        ]);
        assert_eq!(m.evaluate(1, "Spawning King Mushroom").len(), 2);
    }

    #[test]
    fn empty_rule_set_is_never_ready() {
        let m = SignalMatcher::new(Vec::new());
        assert!(m.all_required_satisfied());
        assert!(!m.is_ready());
    }

    #[test]
    fn unmatched_required_lists_outstanding_rules() {
        let mut m = SignalMatcher::new(vec![
            MatchRule::required("alpha").with_label("first"),
            MatchRule::required("beta"),
            MatchRule::forbidden("gamma"),
        ]);
        m.evaluate(1, "alpha");
        let left = m.unmatched_required();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].label, "beta");
    }

    #[test]
    fn replay_matches_live_state() {
        use crate::recorder::{ConsoleEntry, ConsoleLevel};
        use std::time::Duration;

        let rules = vec![MatchRule::required("b"), MatchRule::forbidden("x")];
        let entries: Vec<ConsoleEntry> = ["a", "b", "x", "b"]
            .iter()
            .enumerate()
            .map(|(i, t)| ConsoleEntry {
                sequence: i as u64 + 1,
                timestamp: Duration::from_millis(i as u64),
                text: t.to_string(),
                level: ConsoleLevel::Log,
            })
            .collect();

        let mut live = SignalMatcher::new(rules.clone());
        for e in &entries {
            live.evaluate(e.sequence, &e.text);
        }
        let replayed = SignalMatcher::replay(rules, &entries);

        assert_eq!(live.state(), replayed.state());
        assert_eq!(live.violations(), replayed.violations());
    }
}
