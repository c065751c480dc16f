//! Tool Runner: permission check → decode → execute, with every
//! outcome folded into a [`ToolOutput`] instead of propagated as an error.

use crate::permission::{PermissionAction, PermissionEngine, PermissionHandler};
use crate::tool_registry::{ToolContext, ToolRegistry};
use crate::types::ToolOutput;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionEngine>,
    handler: Arc<dyn PermissionHandler>,
}

impl ToolRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionEngine>,
        handler: Arc<dyn PermissionHandler>,
    ) -> Self {
        Self {
            registry,
            permissions,
            handler,
        }
    }

    /// Runs one tool call to completion, never returning `Err` — every
    /// outcome becomes a tagged `ToolOutput`.
    pub async fn run(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        ctx: ToolContext,
        bypass: bool,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ToolOutput {
        let Some(tool) = self.registry.get(tool_name) else {
            warn!(tool_name, "unknown tool requested");
            return ToolOutput::error(format!("Unknown tool: {tool_name}"));
        };

        let decision = if bypass {
            PermissionAction::Allow
        } else {
            self.permissions.evaluate(tool_name, &arguments)
        };

        let decision = if decision == PermissionAction::Ask {
            if cancel.is_cancelled() {
                PermissionAction::Deny
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => PermissionAction::Deny,
                    verdict = self.handler.ask(tool_name, &arguments) => verdict,
                }
            }
        } else {
            decision
        };

        if decision == PermissionAction::Deny {
            debug!(tool_name, "permission denied");
            return ToolOutput::error("Permission denied");
        }

        let input = match tool.decode(&arguments) {
            Ok(input) => input,
            Err(err) => {
                debug!(tool_name, error = %err, "invalid tool input");
                return ToolOutput::error(format!("Invalid tool input: {}", err.reason));
            }
        };

        if cancel.is_cancelled() {
            return ToolOutput::error("interrupted");
        }

        match tool.execute(input, ctx, cancel).await {
            Ok(value) => ToolOutput::Json { value },
            Err(detail) => {
                warn!(tool_name, error = %detail, "tool execution failed");
                ToolOutput::error(format!("Tool failed: {detail}"))
            }
        }
    }
}
