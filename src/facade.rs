//! Core Façade: the one public surface this crate exposes. Holds
//! construction-time references to Storage/EventStore/Provider/ToolRegistry/
//! AgentRegistry/PermissionHandler and lazily creates one [`AgentLoop`]
//! per (session,branch) the first time it's touched.

use crate::agent_loop::{AgentLoop, SteerCommand};
use crate::agent_registry::AgentRegistry;
use crate::checkpoint::{Checkpoint, CheckpointService};
use crate::config::EngineConfig;
use crate::context::{first_kept_index, summarize_messages, total_tokens, ExecutionLimits};
use crate::error::{CoreError, StorageError};
use crate::event::{Event, EventEnvelope, EventFilter, InMemoryEventStore};
use crate::permission::{PermissionEngine, PermissionHandler};
use crate::provider::Provider;
use crate::session::{Branch, BranchTreeNode, NewBranch, NewSession, Session, SessionUpdate};
use crate::storage::Storage;
use crate::tool_registry::ToolRegistry;
use crate::tool_runner::ToolRunner;
use crate::types::{BranchId, Message, MessageKind, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// `{sessionId, branchId, name, bypass}` — `createSession`'s return shape.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub branch_id: BranchId,
    pub name: Option<String>,
    pub bypass: bool,
}

#[derive(Debug, Default)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub first_message: Option<String>,
    pub bypass: bool,
}

/// `{messages, lastEventId, isStreaming, agent, model?, bypass?}` —
/// `getSessionState`'s return shape.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub messages: Vec<Message>,
    pub last_event_id: Option<crate::types::EventId>,
    pub is_streaming: bool,
    pub agent: String,
    pub model: Option<String>,
    pub bypass: Option<bool>,
}

pub struct CoreFacadeBuilder {
    storage: Arc<dyn Storage>,
    events: Arc<InMemoryEventStore>,
    tool_registry: Arc<ToolRegistry>,
    agent_registry: Arc<AgentRegistry>,
    provider: Arc<dyn Provider>,
    permission_handler: Arc<dyn PermissionHandler>,
    permission_rules: Vec<crate::permission::PermissionRule>,
    config: EngineConfig,
    execution_limits: Option<ExecutionLimits>,
}

impl CoreFacadeBuilder {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<dyn Provider>, permission_handler: Arc<dyn PermissionHandler>) -> Self {
        Self {
            storage,
            events: Arc::new(InMemoryEventStore::new()),
            tool_registry: Arc::new(ToolRegistry::new()),
            agent_registry: Arc::new(AgentRegistry::new()),
            provider,
            permission_handler,
            permission_rules: Vec::new(),
            config: EngineConfig::default(),
            execution_limits: None,
        }
    }

    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.tool_registry = Arc::new(registry);
        self
    }

    pub fn with_agent_registry(mut self, registry: AgentRegistry) -> Self {
        self.agent_registry = Arc::new(registry);
        self
    }

    pub fn with_permission_rules(mut self, rules: Vec<crate::permission::PermissionRule>) -> Self {
        self.permission_rules = rules;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_execution_limits(mut self, limits: ExecutionLimits) -> Self {
        self.execution_limits = Some(limits);
        self
    }

    pub fn build(self) -> CoreFacade {
        let permissions = Arc::new(PermissionEngine::new(self.permission_rules, self.config.default_permission_action));
        let tool_runner = Arc::new(ToolRunner::new(
            Arc::clone(&self.tool_registry),
            permissions,
            self.permission_handler,
        ));
        let checkpoints = Arc::new(CheckpointService::new(Arc::clone(&self.storage)));
        CoreFacade {
            storage: self.storage,
            events: self.events,
            checkpoints,
            tool_runner,
            tool_registry: self.tool_registry,
            agent_registry: self.agent_registry,
            provider: self.provider,
            config: self.config,
            execution_limits: self.execution_limits,
            loops: DashMap::new(),
        }
    }
}

pub struct CoreFacade {
    storage: Arc<dyn Storage>,
    events: Arc<InMemoryEventStore>,
    checkpoints: Arc<CheckpointService>,
    tool_runner: Arc<ToolRunner>,
    tool_registry: Arc<ToolRegistry>,
    agent_registry: Arc<AgentRegistry>,
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    execution_limits: Option<ExecutionLimits>,
    loops: DashMap<(SessionId, BranchId), Arc<AgentLoop>>,
}

impl CoreFacade {
    pub fn builder(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn Provider>,
        permission_handler: Arc<dyn PermissionHandler>,
    ) -> CoreFacadeBuilder {
        CoreFacadeBuilder::new(storage, provider, permission_handler)
    }

    /// Obtains the loop for (session,branch), creating it lazily and
    /// re-deriving its current agent from history on first creation.
    fn loop_for(&self, session_id: SessionId, branch_id: BranchId) -> Arc<AgentLoop> {
        if let Some(existing) = self.loops.get(&(session_id, branch_id)) {
            return Arc::clone(existing.value());
        }
        let created = AgentLoop::new(
            session_id,
            branch_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.events),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.tool_runner),
            Arc::clone(&self.tool_registry),
            Arc::clone(&self.agent_registry),
            Arc::clone(&self.provider),
            self.config.clone(),
            self.execution_limits.clone(),
        );
        created.restore_current_agent();
        self.loops.insert((session_id, branch_id), Arc::clone(&created));
        created
    }

    // -- Session management --

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<CreatedSession, CoreError> {
        let session = self
            .storage
            .session_create(NewSession {
                name: request.name.clone(),
                cwd: request.cwd,
                bypass: request.bypass,
                parent: None,
            })
            .await?;
        let branch = self.storage.branch_create(session.id, NewBranch::default()).await?;

        if let Some(first_message) = request.first_message {
            self.send_message(SendMessageRequest {
                session_id: session.id,
                branch_id: branch.id,
                content: first_message.clone(),
                bypass: request.bypass,
                model: None,
            })
            .await?;
            self.spawn_name_generation(session.id, first_message);
        }

        Ok(CreatedSession {
            session_id: session.id,
            branch_id: branch.id,
            name: session.name,
            bypass: session.bypass,
        })
    }

    /// Fires a background task that asks the configured checkpoint model for
    /// a short session name and persists it.
    fn spawn_name_generation(&self, session_id: SessionId, first_message: String) {
        let provider = Arc::clone(&self.provider);
        let storage = Arc::clone(&self.storage);
        let model = self.config.checkpoint_model.clone();
        tokio::spawn(async move {
            let request = crate::provider::ProviderRequest {
                model,
                system_prompt: "Generate a short (3-6 word) title for this conversation. Respond with the title only.".to_string(),
                messages: vec![Message::new_user(session_id, BranchId::new(), first_message, MessageKind::Regular)],
                tools: Vec::new(),
                max_tokens: Some(32),
                temperature: None,
                reasoning_effort: None,
                emit_reasoning: false,
                provider_options: None,
            };
            let cancel = tokio_util::sync::CancellationToken::new();
            let Ok(mut stream) = provider.stream(request, cancel).await else {
                return;
            };
            let mut name = String::new();
            use futures::StreamExt;
            while let Some(Ok(chunk)) = stream.next().await {
                if let crate::provider::Chunk::TextDelta { delta } = chunk {
                    name.push_str(&delta);
                }
            }
            let name = name.trim();
            if !name.is_empty() {
                if let Err(err) = storage
                    .session_update(
                        session_id,
                        SessionUpdate {
                            name: Some(Some(name.to_string())),
                            bypass: None,
                        },
                    )
                    .await
                {
                    warn!(error = %err, "failed to persist generated session name");
                }
            }
        });
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, CoreError> {
        Ok(self.storage.session_list().await?)
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session, CoreError> {
        Ok(self.storage.session_get(id).await?)
    }

    pub async fn delete_session(&self, id: SessionId) -> Result<(), CoreError> {
        self.storage.session_delete(id).await?;
        self.loops.retain(|(sid, _), _| *sid != id);
        Ok(())
    }

    pub async fn update_session_bypass(&self, id: SessionId, bypass: bool) -> Result<(), CoreError> {
        self.storage
            .session_update(
                id,
                SessionUpdate {
                    name: None,
                    bypass: Some(bypass),
                },
            )
            .await?;
        Ok(())
    }

    // -- Branching --

    pub async fn create_branch(&self, session_id: SessionId, name: Option<String>) -> Result<Branch, CoreError> {
        Ok(self
            .storage
            .branch_create(
                session_id,
                NewBranch {
                    parent_branch_id: None,
                    parent_message_id: None,
                    name,
                },
            )
            .await?)
    }

    /// Creates a new branch that reuses the parent's message history up to
    /// and including `at_message_id` (messages are copied with fresh ids).
    pub async fn fork_branch(
        &self,
        session_id: SessionId,
        from_branch_id: BranchId,
        at_message_id: crate::types::MessageId,
        name: Option<String>,
    ) -> Result<Branch, CoreError> {
        let history = self.storage.message_list_by_branch(from_branch_id).await?;
        let cut = history
            .iter()
            .position(|m| m.id == at_message_id)
            .ok_or(StorageError::MessageNotFound(at_message_id))?;

        let new_branch = self
            .storage
            .branch_create(
                session_id,
                NewBranch {
                    parent_branch_id: Some(from_branch_id),
                    parent_message_id: Some(at_message_id),
                    name,
                },
            )
            .await?;

        for original in &history[..=cut] {
            let mut copy = original.clone();
            copy.id = crate::types::MessageId::new();
            copy.branch_id = new_branch.id;
            self.storage.message_append(copy).await?;
        }

        Ok(new_branch)
    }

    /// Summarizes `from` (unless `summarize` is false) and emits
    /// `BranchSwitched` scoped to the destination branch.
    pub async fn switch_branch(
        &self,
        session_id: SessionId,
        from: BranchId,
        to: BranchId,
        summarize: bool,
    ) -> Result<(), CoreError> {
        if summarize {
            let messages = self.storage.message_list_by_branch(from).await?;
            let summary = summarize_messages(&messages);
            if !summary.is_empty() {
                self.storage.branch_update_summary(from, summary).await?;
            }
        }
        self.events.publish(session_id, to, Event::BranchSwitched { from, to })?;
        Ok(())
    }

    pub async fn get_branch_tree(&self, session_id: SessionId) -> Result<Vec<BranchTreeNode>, CoreError> {
        Ok(self.storage.branch_tree(session_id).await?)
    }

    // -- Conversation --

    pub async fn send_message(&self, request: SendMessageRequest) -> Result<(), CoreError> {
        if let Some(model) = request.model {
            self.storage.branch_update_preferred_model(request.branch_id, model).await?;
        }
        let agent_loop = self.loop_for(request.session_id, request.branch_id);
        agent_loop.send_message(request.content, request.bypass).await?;
        Ok(())
    }

    pub async fn list_messages(&self, branch_id: BranchId) -> Result<Vec<Message>, CoreError> {
        Ok(self.storage.message_list_by_branch(branch_id).await?)
    }

    pub async fn get_session_state(&self, session_id: SessionId, branch_id: BranchId) -> Result<SessionState, CoreError> {
        let messages = self.storage.message_list_by_branch(branch_id).await?;
        let branch = self.storage.branch_get(branch_id).await?;
        let session = self.storage.session_get(session_id).await?;

        let filter = EventFilter {
            session_id: Some(session_id),
            branch_id: Some(branch_id),
            after_id: None,
        };
        let last_event_id = self.events.get_latest_event_id(&filter);
        let is_streaming = self
            .events
            .get_latest_by_tags(&filter, |e| matches!(e, Event::StreamStarted | Event::StreamEnded { .. }))
            .map(|e| matches!(e.event, Event::StreamStarted))
            .unwrap_or(false);

        let agent_loop = self.loop_for(session_id, branch_id);

        Ok(SessionState {
            messages,
            last_event_id,
            is_streaming,
            agent: agent_loop.current_agent(),
            model: branch.preferred_model,
            bypass: Some(session.bypass),
        })
    }

    // -- Control --

    pub fn steer(&self, session_id: SessionId, branch_id: BranchId, command: SteerCommand) {
        self.loop_for(session_id, branch_id).steer(command);
    }

    pub async fn approve_plan(&self, session_id: SessionId, branch_id: BranchId, plan_path: String) -> Result<(), CoreError> {
        self.storage
            .checkpoint_create(
                branch_id,
                Checkpoint::Plan {
                    plan_path: plan_path.clone(),
                    created_at: chrono::Utc::now(),
                },
            )
            .await?;
        self.events.publish(session_id, branch_id, Event::PlanConfirmed { plan_path })?;
        Ok(())
    }

    /// Invokes the compaction engine: picks a cut point from the token
    /// budget, summarizes the dropped prefix, and creates a Compaction
    /// Checkpoint.
    pub async fn compact_branch(&self, session_id: SessionId, branch_id: BranchId) -> Result<(), CoreError> {
        self.events.publish(session_id, branch_id, Event::CompactionStarted)?;

        let messages = self.storage.message_list_by_branch(branch_id).await?;
        let keep_budget = total_tokens(&messages) / 4;
        let cut = first_kept_index(&messages, keep_budget);

        let (dropped, kept) = messages.split_at(cut);
        let summary = summarize_messages(dropped);
        let first_kept_message_id = kept
            .first()
            .map(|m| m.id)
            .unwrap_or_else(crate::types::MessageId::new);

        self.storage
            .checkpoint_create(
                branch_id,
                Checkpoint::Compaction {
                    summary,
                    first_kept_message_id,
                    created_at: chrono::Utc::now(),
                },
            )
            .await?;
        self.events.publish(
            session_id,
            branch_id,
            Event::CompactionCompleted { first_kept_message_id },
        )?;
        Ok(())
    }

    // -- Observation --

    pub fn subscribe_events(
        &self,
        session_id: SessionId,
        branch_id: Option<BranchId>,
        after: Option<crate::types::EventId>,
    ) -> futures::stream::BoxStream<'static, EventEnvelope> {
        self.events.subscribe(session_id, branch_id, after)
    }
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub session_id: SessionId,
    pub branch_id: BranchId,
    pub content: String,
    pub bypass: bool,
    pub model: Option<String>,
}
