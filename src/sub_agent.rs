//! Sub-Agent Actor: a recursive harness invocation bound to a named
//! agent definition, running a one-shot prompt to completion on a fresh
//! child session/branch. Two deployment modes share the `SubAgentRunner`
//! contract — this crate ships the in-process one;
//! an out-of-process runner (spawn a binary, wire stdin/stdout) is not
//! required.

use crate::agent_registry::{AgentRegistry, BASELINE_AGENT};
use crate::error::SubagentError;
use crate::event::{Event, InMemoryEventStore};
use crate::provider::{Chunk, Provider, ProviderRequest};
use crate::retry::{with_retry, RetryConfig};
use crate::session::NewSession;
use crate::storage::Storage;
use crate::tool_registry::{ToolContext, ToolRegistry};
use crate::tool_runner::ToolRunner;
use crate::types::{BranchId, Message, MessageId, MessageKind, Part, Role, SessionId, ToolOutput};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default turn cap for sub-agents.
pub const DEFAULT_MAX_TURNS: usize = 10;

#[derive(Debug, Clone)]
pub struct SubAgentConfig {
    pub retry: RetryConfig,
    pub timeout: Option<Duration>,
    pub max_turns: usize,
    pub model: String,
    pub base_system_prompt: String,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeout: Some(Duration::from_secs(300)),
            max_turns: DEFAULT_MAX_TURNS,
            model: "default-model".to_string(),
            base_system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubAgentRequest {
    pub parent_session_id: SessionId,
    pub parent_branch_id: BranchId,
    pub agent: String,
    pub prompt: String,
    pub cwd: Option<String>,
    pub bypass: bool,
}

#[derive(Debug, Clone)]
pub enum SubAgentOutcome {
    Success {
        text: String,
        session_id: SessionId,
        agent_name: String,
    },
    Error {
        error: String,
        session_id: SessionId,
        agent_name: String,
    },
}

#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run(&self, request: SubAgentRequest) -> SubAgentOutcome;
}

/// In-process implementation: runs the child turn loop directly on this
/// task rather than spawning a separate process.
pub struct InProcessSubAgentRunner {
    storage: Arc<dyn Storage>,
    events: Arc<InMemoryEventStore>,
    tool_registry: Arc<ToolRegistry>,
    tool_runner: Arc<ToolRunner>,
    agent_registry: Arc<AgentRegistry>,
    provider: Arc<dyn Provider>,
    config: SubAgentConfig,
}

impl InProcessSubAgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        events: Arc<InMemoryEventStore>,
        tool_registry: Arc<ToolRegistry>,
        tool_runner: Arc<ToolRunner>,
        agent_registry: Arc<AgentRegistry>,
        provider: Arc<dyn Provider>,
        config: SubAgentConfig,
    ) -> Self {
        Self {
            storage,
            events,
            tool_registry,
            tool_runner,
            agent_registry,
            provider,
            config,
        }
    }

    async fn run_inner(&self, request: SubAgentRequest) -> Result<(SessionId, String, String), SubagentError> {
        let agent = self
            .agent_registry
            .get(&request.agent)
            .cloned()
            .ok_or_else(|| SubagentError::UnknownAgent(request.agent.clone()))?;

        // Step 1: fresh session + root branch, parent references set.
        let session = self
            .storage
            .session_create(NewSession {
                name: None,
                cwd: request.cwd.clone(),
                bypass: request.bypass,
                parent: Some((request.parent_session_id, request.parent_branch_id)),
            })
            .await
            .map_err(crate::error::AgentLoopError::from)?;
        let branch = self
            .storage
            .branch_create(session.id, crate::session::NewBranch::default())
            .await
            .map_err(crate::error::AgentLoopError::from)?;

        // Step 2: announce the spawn and the agent switch on the child branch.
        let _ = self.events.publish(
            request.parent_session_id,
            request.parent_branch_id,
            Event::SubagentSpawned {
                parent_session_id: request.parent_session_id,
                parent_branch_id: request.parent_branch_id,
                child_session_id: session.id,
                agent: agent.name.clone(),
                prompt: request.prompt.clone(),
            },
        );
        let _ = self.events.publish(
            session.id,
            branch.id,
            Event::AgentSwitched {
                from_agent: BASELINE_AGENT.to_string(),
                to_agent: agent.name.clone(),
            },
        );

        // Step 3: run the child turn loop to completion.
        let text = self.run_turn_loop(&request, session.id, branch.id, &agent).await?;

        Ok((session.id, agent.name.clone(), text))
    }

    async fn run_turn_loop(
        &self,
        request: &SubAgentRequest,
        session_id: SessionId,
        branch_id: BranchId,
        agent: &crate::agent_registry::AgentDefinition,
    ) -> Result<String, SubagentError> {
        let mut messages = Vec::new();

        let user_message = Message::new_user(session_id, branch_id, request.prompt.clone(), MessageKind::Regular);
        let user_message = self
            .storage
            .message_append(user_message)
            .await
            .map_err(crate::error::AgentLoopError::from)?;
        messages.push(user_message);

        let tool_names = agent.resolve_tool_names(&self.tool_registry);
        let tools = self.tool_registry.definitions_for(&tool_names);
        let system_prompt = match &agent.system_prompt {
            Some(addendum) => format!("{}\n\n## Agent: {}\n{}", self.config.base_system_prompt, agent.name, addendum),
            None => self.config.base_system_prompt.clone(),
        };

        for turn in 0..self.config.max_turns {
            let request_msg = ProviderRequest {
                model: agent.preferred_model.clone().unwrap_or_else(|| self.config.model.clone()),
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: None,
                temperature: agent.temperature,
                reasoning_effort: agent.reasoning_effort.clone(),
                emit_reasoning: false,
                provider_options: None,
            };

            let provider = Arc::clone(&self.provider);
            let stream_result = with_retry(&self.config.retry, || {
                let provider = Arc::clone(&provider);
                let request_msg = request_msg.clone();
                async move { provider.stream(request_msg, CancellationToken::new()).await }
            })
            .await;

            let mut stream = stream_result.map_err(crate::error::AgentLoopError::from)?;

            let mut text = String::new();
            let mut tool_calls: Vec<(String, String, serde_json::Value)> = Vec::new();
            let mut open_calls: std::collections::HashMap<String, String> = std::collections::HashMap::new();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(Chunk::TextDelta { delta }) => text.push_str(&delta),
                    Ok(Chunk::ToolCallStart { id, name }) => {
                        open_calls.insert(id, name);
                    }
                    Ok(Chunk::ToolCallEnd { id, arguments }) => {
                        if let Some(name) = open_calls.remove(&id) {
                            tool_calls.push((id, name, arguments));
                        }
                    }
                    Ok(Chunk::ReasoningDelta { .. }) => {}
                    Ok(Chunk::Finish { .. }) => {}
                    Err(err) => return Err(crate::error::AgentLoopError::from(err).into()),
                }
            }

            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(Part::Text { text: text.clone() });
            }
            for (id, name, arguments) in &tool_calls {
                parts.push(Part::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
            }
            let assistant_message = Message {
                id: MessageId::new(),
                session_id,
                branch_id,
                role: Role::Assistant,
                kind: MessageKind::Regular,
                parts,
                created_at: chrono::Utc::now(),
                turn_duration_ms: None,
            };
            let assistant_message = self
                .storage
                .message_append(assistant_message)
                .await
                .map_err(crate::error::AgentLoopError::from)?;
            messages.push(assistant_message.clone());

            if tool_calls.is_empty() {
                return Ok(text);
            }

            if turn + 1 >= self.config.max_turns {
                warn!(turns = turn + 1, "sub-agent hit max turn count without finishing");
                return Ok(text);
            }

            let mut result_parts = Vec::with_capacity(tool_calls.len());
            for (id, name, arguments) in &tool_calls {
                let ctx = ToolContext {
                    session_id,
                    branch_id,
                    tool_call_id: id.clone(),
                    agent_name: agent.name.clone(),
                };
                let output = self
                    .tool_runner
                    .run(name, arguments.clone(), ctx, request.bypass, CancellationToken::new())
                    .await;
                result_parts.push(Part::ToolResult {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    output,
                });
            }

            let tool_message = Message {
                id: MessageId::new(),
                session_id,
                branch_id,
                role: Role::Tool,
                kind: MessageKind::Regular,
                parts: result_parts,
                created_at: chrono::Utc::now(),
                turn_duration_ms: None,
            };
            let tool_message = self
                .storage
                .message_append(tool_message)
                .await
                .map_err(crate::error::AgentLoopError::from)?;
            messages.push(tool_message);
        }

        Ok(String::new())
    }
}

#[async_trait]
impl SubAgentRunner for InProcessSubAgentRunner {
    async fn run(&self, request: SubAgentRequest) -> SubAgentOutcome {
        let agent_name = request.agent.clone();
        let timeout = self.config.timeout;

        let outcome = async {
            match timeout {
                Some(duration) => match tokio::time::timeout(duration, self.run_inner(request.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(SubagentError::AgentLoop(crate::error::AgentLoopError::LimitExceeded(
                        "timed out".to_string(),
                    ))),
                },
                None => self.run_inner(request.clone()).await,
            }
        }
        .await;

        let (session_id_for_event, success, result) = match outcome {
            Ok((session_id, resolved_agent_name, text)) => (session_id, true, Ok((session_id, resolved_agent_name, text))),
            Err(err) => {
                // No child session was necessarily created if the agent name
                // was unknown; fall back to a throwaway id purely so the
                // completion event still has a subject to report on.
                (request.parent_session_id, false, Err(err))
            }
        };

        let _ = self.events.publish(
            request.parent_session_id,
            request.parent_branch_id,
            Event::SubagentCompleted { success },
        );

        match result {
            Ok((session_id, resolved_agent_name, text)) => SubAgentOutcome::Success {
                text,
                session_id,
                agent_name: resolved_agent_name,
            },
            Err(err) => {
                warn!(error = %err, "sub-agent failed");
                SubAgentOutcome::Error {
                    error: err.to_string(),
                    session_id: session_id_for_event,
                    agent_name,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_registry::AgentDefinition;
    use crate::permission::{DenyByDefaultHandler, PermissionAction, PermissionEngine};
    use crate::provider::MockProvider;
    use crate::storage::InMemoryStorage;

    fn runner(provider: MockProvider) -> InProcessSubAgentRunner {
        let mut agents = AgentRegistry::new();
        agents.register(AgentDefinition::new("researcher"));
        let tool_registry = Arc::new(ToolRegistry::new());
        let tool_runner = Arc::new(ToolRunner::new(
            Arc::clone(&tool_registry),
            Arc::new(PermissionEngine::new(vec![], PermissionAction::Allow)),
            Arc::new(DenyByDefaultHandler),
        ));
        InProcessSubAgentRunner::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryEventStore::new()),
            tool_registry,
            tool_runner,
            Arc::new(agents),
            Arc::new(provider),
            SubAgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn success_returns_last_assistant_text() {
        let runner = runner(MockProvider::text("the answer is 42"));
        let outcome = runner
            .run(SubAgentRequest {
                parent_session_id: SessionId::new(),
                parent_branch_id: BranchId::new(),
                agent: "researcher".to_string(),
                prompt: "what is the answer?".to_string(),
                cwd: None,
                bypass: false,
            })
            .await;
        match outcome {
            SubAgentOutcome::Success { text, agent_name, .. } => {
                assert_eq!(text, "the answer is 42");
                assert_eq!(agent_name, "researcher");
            }
            SubAgentOutcome::Error { error, .. } => panic!("expected success, got {error}"),
        }
    }

    #[tokio::test]
    async fn unknown_agent_reports_error() {
        let runner = runner(MockProvider::text("unused"));
        let outcome = runner
            .run(SubAgentRequest {
                parent_session_id: SessionId::new(),
                parent_branch_id: BranchId::new(),
                agent: "missing".to_string(),
                prompt: "hi".to_string(),
                cwd: None,
                bypass: false,
            })
            .await;
        assert!(matches!(outcome, SubAgentOutcome::Error { .. }));
    }
}
