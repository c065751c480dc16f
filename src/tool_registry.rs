//! Tool registry: the declarative surface the Tool Runner looks
//! tools up in. Concrete tool implementations (shell, file IO, ...) are out
//! of scope — this crate only defines the `Tool` contract and a
//! registry to hold implementations supplied by the host.

use crate::error::InvalidToolInput;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a tool may run concurrently with other tool calls in the same
/// turn, or must hold the loop's serial-tool mutex for its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyClass {
    Parallel,
    Serial,
}

/// Identity of the call site passed to a tool's `execute`.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: crate::types::SessionId,
    pub branch_id: crate::types::BranchId,
    pub tool_call_id: String,
    pub agent_name: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    fn concurrency_class(&self) -> ConcurrencyClass {
        ConcurrencyClass::Parallel
    }

    /// Decode `arguments` against this tool's schema. The default
    /// implementation accepts anything; tools with required fields should
    /// validate and return `InvalidToolInput` on mismatch.
    fn decode(&self, arguments: &serde_json::Value) -> Result<serde_json::Value, InvalidToolInput> {
        Ok(arguments.clone())
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<serde_json::Value, String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Holds the tool implementations a host binary registers. Agent Definitions
/// filter this set down per-agent via allow/deny lists.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| t.definition()))
            .collect()
    }

    pub fn all_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

/// A no-op tool used only in tests (success-path echo).
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes its input back unchanged"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<serde_json::Value, String> {
        Ok(input)
    }
}

