//! Agent Definitions: named personas with a system-prompt override and
//! a tool allow/deny filter, selectable via `AgentSwitched` steering and by
//! the Sub-Agent Actor.

use crate::tool_registry::ToolRegistry;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: Option<String>,
    /// If non-empty, only these tool names are visible to this agent.
    pub allow: Vec<String>,
    /// Always excluded, even if present in `allow`.
    pub deny: Vec<String>,
    pub temperature: Option<f32>,
    pub preferred_model: Option<String>,
    /// Opaque passthrough: forwarded to the provider
    /// only when set, never interpreted by the core.
    pub reasoning_effort: Option<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: None,
            allow: Vec::new(),
            deny: Vec::new(),
            temperature: None,
            preferred_model: None,
            reasoning_effort: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    pub fn with_allow(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_deny(mut self, deny: Vec<String>) -> Self {
        self.deny = deny;
        self
    }

    /// Resolves the effective, ordered tool-name list this agent may call
    /// out of everything the registry holds.
    pub fn resolve_tool_names(&self, registry: &ToolRegistry) -> Vec<String> {
        let candidates = if self.allow.is_empty() {
            registry.all_names()
        } else {
            self.allow.clone()
        };
        candidates
            .into_iter()
            .filter(|name| !self.deny.contains(name))
            .collect()
    }
}

pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
}

/// The agent every new branch starts on.
pub const BASELINE_AGENT: &str = "baseline";

impl AgentRegistry {
    pub fn new() -> Self {
        let mut agents = HashMap::new();
        agents.insert(BASELINE_AGENT.to_string(), AgentDefinition::new(BASELINE_AGENT));
        Self { agents }
    }

    pub fn register(&mut self, definition: AgentDefinition) {
        self.agents.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    pub fn baseline(&self) -> &AgentDefinition {
        self.agents
            .get(BASELINE_AGENT)
            .expect("baseline agent is always registered")
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
