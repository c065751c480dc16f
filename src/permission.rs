//! Permission Engine: first-matching-rule-wins gating in front of
//! tool execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// A single rule in the ordered list evaluated by the Permission Engine:
/// matched against the tool name and, optionally, a substring pattern
/// over the argument JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Tool name this rule applies to; `*` matches every tool.
    pub tool: String,
    /// If present, the rule only matches when this substring is found in
    /// the serialised argument JSON.
    pub pattern: Option<String>,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(tool: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            tool: tool.into(),
            pattern: None,
            action,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    fn matches(&self, tool_name: &str, arguments: &serde_json::Value) -> bool {
        if self.tool != "*" && self.tool != tool_name {
            return false;
        }
        match &self.pattern {
            None => true,
            Some(pattern) => arguments.to_string().contains(pattern.as_str()),
        }
    }
}

/// Asks a human (or an automated policy) to resolve an `Ask` verdict. The
/// concrete implementation (a TUI prompt, an RPC round-trip) lives outside
/// this crate — this is a contract only.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn ask(&self, tool_name: &str, arguments: &serde_json::Value) -> PermissionAction;
}

/// A handler that always answers `Deny` — the safe default when no
/// interactive surface is wired up.
pub struct DenyByDefaultHandler;

#[async_trait]
impl PermissionHandler for DenyByDefaultHandler {
    async fn ask(&self, _tool_name: &str, _arguments: &serde_json::Value) -> PermissionAction {
        PermissionAction::Deny
    }
}

/// Evaluates an ordered rule list against a tool call: first matching rule
/// wins; if none match, falls back to the engine's configured default.
/// Rules can be mutated at runtime via `add_rule`/`remove_rule`.
pub struct PermissionEngine {
    rules: parking_lot::RwLock<Vec<PermissionRule>>,
    default_action: PermissionAction,
}

impl PermissionEngine {
    pub fn new(rules: Vec<PermissionRule>, default_action: PermissionAction) -> Self {
        Self {
            rules: parking_lot::RwLock::new(rules),
            default_action,
        }
    }

    /// Session bypass short-circuits straight to
    /// `Allow` without consulting rules — the Tool Runner checks this first.
    pub fn evaluate(&self, tool_name: &str, arguments: &serde_json::Value) -> PermissionAction {
        self.rules
            .read()
            .iter()
            .find(|r| r.matches(tool_name, arguments))
            .map(|r| r.action)
            .unwrap_or(self.default_action)
    }

    /// Appends a rule to the end of the evaluation order (inserted rules are
    /// lower priority than anything already present).
    pub fn add_rule(&self, rule: PermissionRule) {
        self.rules.write().push(rule);
    }

    /// Removes the first rule matching `tool` (and `pattern`, if given).
    pub fn remove_rule(&self, tool: &str, pattern: Option<&str>) {
        let mut rules = self.rules.write();
        if let Some(pos) = rules
            .iter()
            .position(|r| r.tool == tool && r.pattern.as_deref() == pattern)
        {
            rules.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> serde_json::Value {
        serde_json::json!({})
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = PermissionEngine::new(
            vec![
                PermissionRule::new("bash", PermissionAction::Deny),
                PermissionRule::new("*", PermissionAction::Allow),
            ],
            PermissionAction::Ask,
        );
        assert_eq!(engine.evaluate("bash", &empty_args()), PermissionAction::Deny);
        assert_eq!(engine.evaluate("read_file", &empty_args()), PermissionAction::Allow);
    }

    #[test]
    fn falls_back_to_default_action() {
        let engine = PermissionEngine::new(vec![], PermissionAction::Ask);
        assert_eq!(engine.evaluate("anything", &empty_args()), PermissionAction::Ask);
    }

    #[test]
    fn pattern_matches_argument_substring() {
        let engine = PermissionEngine::new(
            vec![
                PermissionRule::new("bash", PermissionAction::Deny).with_pattern("rm -rf"),
                PermissionRule::new("bash", PermissionAction::Allow),
            ],
            PermissionAction::Ask,
        );
        assert_eq!(
            engine.evaluate("bash", &serde_json::json!({"cmd": "rm -rf /"})),
            PermissionAction::Deny
        );
        assert_eq!(
            engine.evaluate("bash", &serde_json::json!({"cmd": "ls"})),
            PermissionAction::Allow
        );
    }

    #[test]
    fn add_and_remove_rule() {
        let engine = PermissionEngine::new(vec![], PermissionAction::Ask);
        engine.add_rule(PermissionRule::new("bash", PermissionAction::Deny));
        assert_eq!(engine.evaluate("bash", &empty_args()), PermissionAction::Deny);
        engine.remove_rule("bash", None);
        assert_eq!(engine.evaluate("bash", &empty_args()), PermissionAction::Ask);
    }
}
