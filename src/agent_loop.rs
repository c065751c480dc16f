//! Agent Loop: the per-(session,branch) state machine. One
//! `AgentLoop` drives `Start → Running → {Idle, Interrupted}` transitions,
//! running the per-turn algorithm and recursing across queued follow-ups
//! without leaving `Running` in between.

use crate::agent_registry::{AgentRegistry, BASELINE_AGENT};
use crate::checkpoint::{CheckpointService, TurnContextCache};
use crate::config::EngineConfig;
use crate::context::{ExecutionLimits, ExecutionTracker};
use crate::error::AgentLoopError;
use crate::event::{Event, InMemoryEventStore};
use crate::provider::{Chunk, Provider, ProviderRequest};
use crate::retry::with_retry;
use crate::storage::Storage;
use crate::tool_registry::{ConcurrencyClass, ToolContext, ToolRegistry};
use crate::tool_runner::ToolRunner;
use crate::types::{
    BranchId, FinishReason, Message, MessageId, MessageKind, Part, Role, SessionId, ToolOutput, Usage,
};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

/// Control messages targeting a running loop.
#[derive(Debug, Clone)]
pub enum SteerCommand {
    Cancel,
    Interrupt,
    Interject { message: String },
    SwitchAgent { name: String },
}

impl SteerCommand {
    fn is_interrupting(&self) -> bool {
        matches!(self, Self::Cancel | Self::Interrupt | Self::Interject { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FollowUpItem {
    pub message: String,
    pub bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Interrupted,
}

/// How a turn's inner loop came to an end — drives what happens after it.
enum TurnExit {
    Natural,
    Cancelled,
    Interrupted,
    Interjected(FollowUpItem),
    Failed(String),
}

type BoxedToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutput> + 'a>>;

pub struct AgentLoop {
    session_id: SessionId,
    branch_id: BranchId,
    storage: Arc<dyn Storage>,
    events: Arc<InMemoryEventStore>,
    checkpoints: Arc<CheckpointService>,
    tool_runner: Arc<ToolRunner>,
    tool_registry: Arc<ToolRegistry>,
    agent_registry: Arc<AgentRegistry>,
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    execution_limits: Option<ExecutionLimits>,

    state: SyncMutex<LoopState>,
    current_agent: SyncMutex<String>,
    steer_rx: AsyncMutex<mpsc::UnboundedReceiver<SteerCommand>>,
    steer_tx: mpsc::UnboundedSender<SteerCommand>,
    pending_steer: SyncMutex<Vec<SteerCommand>>,
    follow_ups: SyncMutex<VecDeque<FollowUpItem>>,
    serial_tool_lock: AsyncMutex<()>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        branch_id: BranchId,
        storage: Arc<dyn Storage>,
        events: Arc<InMemoryEventStore>,
        checkpoints: Arc<CheckpointService>,
        tool_runner: Arc<ToolRunner>,
        tool_registry: Arc<ToolRegistry>,
        agent_registry: Arc<AgentRegistry>,
        provider: Arc<dyn Provider>,
        config: EngineConfig,
        execution_limits: Option<ExecutionLimits>,
    ) -> Arc<Self> {
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id,
            branch_id,
            storage,
            events,
            checkpoints,
            tool_runner,
            tool_registry,
            agent_registry,
            provider,
            config,
            execution_limits,
            state: SyncMutex::new(LoopState::Idle),
            current_agent: SyncMutex::new(BASELINE_AGENT.to_string()),
            steer_rx: AsyncMutex::new(steer_rx),
            steer_tx,
            pending_steer: SyncMutex::new(Vec::new()),
            follow_ups: SyncMutex::new(VecDeque::new()),
            serial_tool_lock: AsyncMutex::new(()),
        })
    }

    /// Re-derives the current agent from the latest `AgentSwitched` event on
    /// the branch, falling back to baseline — called once when a loop is
    /// created on demand for a branch with prior history.
    pub fn restore_current_agent(&self) {
        if let Some(envelope) = self
            .events
            .latest_event(self.session_id, self.branch_id, |e| matches!(e, Event::AgentSwitched { .. }))
        {
            if let Event::AgentSwitched { to_agent, .. } = envelope.event {
                *self.current_agent.lock() = to_agent;
            }
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    pub fn current_agent(&self) -> String {
        self.current_agent.lock().clone()
    }

    /// Enqueue a Steer Command onto this loop's steer queue.
    pub fn steer(&self, command: SteerCommand) {
        let _ = self.steer_tx.send(command);
    }

    /// Admit a user message. Starts a new turn if the
    /// loop is `Idle`/`Interrupted`; enqueues to the follow-up queue and
    /// returns promptly if `Running`.
    pub async fn send_message(
        self: &Arc<Self>,
        message: String,
        bypass: bool,
    ) -> Result<(), AgentLoopError> {
        let mut state = self.state.lock();
        match *state {
            LoopState::Running => {
                drop(state);
                self.enqueue_follow_up(FollowUpItem { message, bypass })
            }
            LoopState::Idle | LoopState::Interrupted => {
                *state = LoopState::Running;
                drop(state);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.run_turns(message, bypass).await;
                });
                Ok(())
            }
        }
    }

    fn enqueue_follow_up(&self, item: FollowUpItem) -> Result<(), AgentLoopError> {
        let mut queue = self.follow_ups.lock();
        if queue.len() >= self.config.follow_up_max {
            return Err(AgentLoopError::LimitExceeded(format!(
                "follow-up queue is full ({}/{})",
                queue.len(),
                self.config.follow_up_max
            )));
        }
        queue.push_back(item);
        Ok(())
    }

    fn prepend_follow_up(&self, item: FollowUpItem) {
        self.follow_ups.lock().push_front(item);
    }

    fn dequeue_follow_up(&self) -> Option<FollowUpItem> {
        self.follow_ups.lock().pop_front()
    }

    fn drain_pending_steer(&self) -> Vec<SteerCommand> {
        std::mem::take(&mut *self.pending_steer.lock())
    }

    fn try_recv_steer(&self) -> Option<SteerCommand> {
        self.steer_rx
            .try_lock()
            .ok()
            .and_then(|mut rx| rx.try_recv().ok())
    }

    /// Applies queued `SwitchAgent`s, then returns the first interrupting
    /// command seen, if any.
    async fn drain_and_poll_steer(&self) -> Option<SteerCommand> {
        for command in self.drain_pending_steer() {
            self.apply_non_interrupting(command).await;
        }
        loop {
            match self.try_recv_steer() {
                None => return None,
                Some(command) if command.is_interrupting() => return Some(command),
                Some(command) => self.apply_non_interrupting(command).await,
            }
        }
    }

    async fn apply_non_interrupting(&self, command: SteerCommand) {
        if let SteerCommand::SwitchAgent { name } = command {
            let from = self.current_agent();
            *self.current_agent.lock() = name.clone();
            let _ = self.events.publish(
                self.session_id,
                self.branch_id,
                Event::AgentSwitched {
                    from_agent: from,
                    to_agent: name,
                },
            );
        }
    }

    /// Blocks until an interrupting steer command arrives, stashing any
    /// non-interrupting commands observed along the way into `pendingSteer`
    ///.
    async fn next_interrupting_steer(&self) -> Option<SteerCommand> {
        let mut rx = self.steer_rx.lock().await;
        loop {
            let command = rx.recv().await?;
            if command.is_interrupting() {
                return Some(command);
            }
            self.pending_steer.lock().push(command);
        }
    }

    /// Outer driver: runs one turn, then — unless the turn ended via
    /// `Cancel` — dequeues one follow-up and recurses without leaving
    /// `Running`.
    async fn run_turns(self: Arc<Self>, mut message: String, mut bypass: bool) {
        loop {
            let exit = self.run_one_turn(message, bypass).await;

            let (skip_follow_ups, interrupted) = match &exit {
                TurnExit::Natural => (false, false),
                TurnExit::Cancelled => (true, true),
                TurnExit::Interrupted => (false, true),
                TurnExit::Interjected(item) => {
                    self.prepend_follow_up(item.clone());
                    (false, true)
                }
                TurnExit::Failed(_) => (false, false),
            };

            if matches!(exit, TurnExit::Failed(_)) {
                *self.state.lock() = LoopState::Idle;
                return;
            }

            if !skip_follow_ups {
                if let Some(next) = self.dequeue_follow_up() {
                    message = next.message;
                    bypass = next.bypass;
                    continue;
                }
            }

            *self.state.lock() = if interrupted {
                LoopState::Interrupted
            } else {
                LoopState::Idle
            };
            return;
        }
    }

    /// Persists the user message, then loops over model turns until a
    /// natural end or an interrupting steer command, publishing
    /// `TurnCompleted` unless the exit was an `Interject` (which keeps the
    /// FSM `Running` with no boundary event).
    async fn run_one_turn(&self, message: String, bypass: bool) -> TurnExit {
        let turn_start = Instant::now();
        let user_message = Message::new_user(self.session_id, self.branch_id, message, MessageKind::Regular);
        let user_message_id = user_message.id;

        let user_message = match self.storage.message_append(user_message).await {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "failed to persist user message");
                return TurnExit::Failed(err.to_string());
            }
        };
        let _ = self.events.publish(
            self.session_id,
            self.branch_id,
            Event::MessageReceived {
                message_id: user_message.id,
                role: Role::User,
            },
        );

        // A session-wide bypass flag means every permission check is `allow`,
        // on top of whatever bypass the initiating message itself carried.
        let session_bypass = self
            .storage
            .session_get(self.session_id)
            .await
            .map(|s| s.bypass)
            .unwrap_or(false);
        let effective_bypass = bypass || session_bypass;

        let span = info_span!("turn", session_id = %self.session_id, branch_id = %self.branch_id);
        let exit = self.run_inner_loop(effective_bypass).instrument(span).await;

        let duration_ms = turn_start.elapsed().as_millis() as u64;
        let is_interject = matches!(exit, TurnExit::Interjected(_));
        if !is_interject {
            if let Err(err) = self
                .storage
                .message_set_turn_duration(user_message_id, duration_ms)
                .await
            {
                warn!(error = %err, "failed to annotate turn duration");
            }
            if let TurnExit::Failed(ref error) = exit {
                let _ = self.events.publish(
                    self.session_id,
                    self.branch_id,
                    Event::ErrorOccurred { error: error.clone() },
                );
            } else {
                let interrupted = matches!(exit, TurnExit::Cancelled | TurnExit::Interrupted);
                let _ = self.events.publish(
                    self.session_id,
                    self.branch_id,
                    Event::TurnCompleted {
                        duration_ms,
                        interrupted,
                    },
                );
            }
        }

        exit
    }

    /// The inner per-model-turn loop.
    async fn run_inner_loop(&self, bypass: bool) -> TurnExit {
        let mut cache = TurnContextCache::default();
        let mut tracker = self.execution_limits.clone().map(ExecutionTracker::new);

        loop {
            if let Some(ref tracker) = tracker {
                if let Some(reason) = tracker.check_limits() {
                    warn!(reason, "execution limit reached");
                    return TurnExit::Failed(reason);
                }
            }

            if let Some(command) = self.drain_and_poll_steer().await {
                return self.exit_for_interrupting_command(command, bypass).await;
            }

            let checkpoint_key = match self.checkpoints.get_latest_checkpoint(self.branch_id).await {
                Ok(cp) => cp.map(|c| c.cache_key()),
                Err(err) => return TurnExit::Failed(err.to_string()),
            };
            let turn_context = if let Some(cached) = cache.get(&checkpoint_key) {
                cached.clone()
            } else {
                match self.checkpoints.build_messages_for_turn(self.branch_id).await {
                    Ok(built) => cache.put(checkpoint_key, built).clone(),
                    Err(err) => return TurnExit::Failed(err.to_string()),
                }
            };

            let agent_name = self.current_agent();
            let baseline = self.agent_registry.baseline().clone();
            let agent = self
                .agent_registry
                .get(&agent_name)
                .cloned()
                .unwrap_or(baseline);
            let tool_names = agent.resolve_tool_names(&self.tool_registry);
            let tools = self.tool_registry.definitions_for(&tool_names);
            let system_prompt = build_system_prompt(&turn_context.context_prefix, &self.config.base_system_prompt, &agent);

            let _ = self
                .events
                .publish(self.session_id, self.branch_id, Event::StreamStarted);

            let request = ProviderRequest {
                model: agent.preferred_model.clone().unwrap_or_else(|| self.config.default_model.clone()),
                system_prompt,
                messages: turn_context.messages,
                tools,
                max_tokens: None,
                temperature: agent.temperature,
                reasoning_effort: agent.reasoning_effort.clone(),
                emit_reasoning: self.config.emit_reasoning,
                provider_options: None,
            };

            let turn_cancel = CancellationToken::new();
            let stream_result = {
                let provider = Arc::clone(&self.provider);
                let retry = self.config.retry.clone();
                with_retry(&retry, || {
                    let provider = Arc::clone(&provider);
                    let request = request.clone();
                    let cancel = turn_cancel.clone();
                    async move { provider.stream(request, cancel).await }
                })
                .await
            };

            let mut stream = match stream_result {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "provider stream failed");
                    return TurnExit::Failed(err.to_string());
                }
            };

            let mut accumulated_text = String::new();
            let mut tool_calls: Vec<(String, String, serde_json::Value)> = Vec::new();
            let mut open_calls: std::collections::HashMap<String, String> = std::collections::HashMap::new();
            let mut finish: Option<(FinishReason, Usage)> = None;
            let mut interrupting: Option<SteerCommand> = None;

            loop {
                tokio::select! {
                    biased;
                    command = self.next_interrupting_steer() => {
                        if let Some(command) = command {
                            interrupting = Some(command);
                            turn_cancel.cancel();
                            break;
                        }
                    }
                    chunk = stream.next() => {
                        match chunk {
                            None => break,
                            Some(Ok(Chunk::TextDelta { delta })) => {
                                accumulated_text.push_str(&delta);
                                let _ = self.events.publish(
                                    self.session_id,
                                    self.branch_id,
                                    Event::StreamChunk { delta },
                                );
                            }
                            Some(Ok(Chunk::ReasoningDelta { delta })) => {
                                // Persistence policy: never persisted,
                                // only forwarded on the event stream, and only when the
                                // provider request opted in.
                                if request.emit_reasoning {
                                    let _ = self.events.publish(
                                        self.session_id,
                                        self.branch_id,
                                        Event::StreamChunk { delta },
                                    );
                                }
                            }
                            Some(Ok(Chunk::ToolCallStart { id, name })) => {
                                open_calls.insert(id, name);
                            }
                            Some(Ok(Chunk::ToolCallArgumentsDelta { .. })) => {}
                            Some(Ok(Chunk::ToolCallEnd { id, arguments })) => {
                                if let Some(name) = open_calls.remove(&id) {
                                    tool_calls.push((id, name, arguments));
                                }
                            }
                            Some(Ok(Chunk::Finish { reason, usage })) => {
                                finish = Some((reason, usage));
                            }
                            Some(Err(err)) => {
                                warn!(error = %err, "provider stream errored mid-flight");
                                return TurnExit::Failed(err.to_string());
                            }
                        }
                    }
                }
            }

            if let Some(command) = interrupting {
                return self
                    .handle_mid_stream_interrupt(command, accumulated_text, bypass)
                    .await;
            }

            let (finish_reason, usage) = finish.unwrap_or((FinishReason::Stop, Usage::default()));
            let _ = self.events.publish(
                self.session_id,
                self.branch_id,
                Event::StreamEnded {
                    interrupted: false,
                    usage: Some(usage.clone()),
                },
            );

            let assistant_message = match self
                .persist_assistant_message(accumulated_text, tool_calls.clone())
                .await
            {
                Ok(m) => m,
                Err(err) => return TurnExit::Failed(err),
            };
            let _ = self.events.publish(
                self.session_id,
                self.branch_id,
                Event::MessageReceived {
                    message_id: assistant_message.id,
                    role: Role::Assistant,
                },
            );

            if let Some(ref mut tracker) = tracker {
                tracker.record_turn((usage.input + usage.output) as usize);
            }

            if tool_calls.is_empty() {
                return TurnExit::Natural;
            }
            if matches!(finish_reason, FinishReason::Error | FinishReason::Aborted) {
                return TurnExit::Failed(format!("model finished with {finish_reason:?}"));
            }

            let results = self.execute_tool_calls(&tool_calls, &agent_name, bypass).await;
            if let Err(err) = self.persist_tool_results(results).await {
                return TurnExit::Failed(err);
            }
        }
    }

    async fn exit_for_interrupting_command(&self, command: SteerCommand, bypass: bool) -> TurnExit {
        let _ = self.events.publish(
            self.session_id,
            self.branch_id,
            Event::StreamEnded {
                interrupted: true,
                usage: None,
            },
        );
        match command {
            SteerCommand::Cancel => TurnExit::Cancelled,
            SteerCommand::Interrupt => TurnExit::Interrupted,
            SteerCommand::Interject { message } => TurnExit::Interjected(FollowUpItem { message, bypass }),
            SteerCommand::SwitchAgent { .. } => unreachable!("applied in drain_and_poll_steer"),
        }
    }

    async fn handle_mid_stream_interrupt(
        &self,
        command: SteerCommand,
        accumulated_text: String,
        bypass: bool,
    ) -> TurnExit {
        let _ = self.events.publish(
            self.session_id,
            self.branch_id,
            Event::StreamEnded {
                interrupted: true,
                usage: None,
            },
        );

        if !accumulated_text.is_empty() {
            let partial = Message {
                id: MessageId::new(),
                session_id: self.session_id,
                branch_id: self.branch_id,
                role: Role::Assistant,
                kind: MessageKind::Regular,
                parts: vec![Part::Text { text: accumulated_text }],
                created_at: chrono::Utc::now(),
                turn_duration_ms: None,
            };
            if let Ok(persisted) = self.storage.message_append(partial).await {
                let _ = self.events.publish(
                    self.session_id,
                    self.branch_id,
                    Event::MessageReceived {
                        message_id: persisted.id,
                        role: Role::Assistant,
                    },
                );
            }
        }

        match command {
            SteerCommand::Cancel => TurnExit::Cancelled,
            SteerCommand::Interrupt => TurnExit::Interrupted,
            SteerCommand::Interject { message } => TurnExit::Interjected(FollowUpItem { message, bypass }),
            SteerCommand::SwitchAgent { .. } => unreachable!("not an interrupting poll result here"),
        }
    }

    async fn persist_assistant_message(
        &self,
        text: String,
        tool_calls: Vec<(String, String, serde_json::Value)>,
    ) -> Result<Message, String> {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(Part::Text { text });
        }
        for (id, name, arguments) in tool_calls {
            parts.push(Part::ToolCall { id, name, arguments });
        }
        let message = Message {
            id: MessageId::new(),
            session_id: self.session_id,
            branch_id: self.branch_id,
            role: Role::Assistant,
            kind: MessageKind::Regular,
            parts,
            created_at: chrono::Utc::now(),
            turn_duration_ms: None,
        };
        self.storage.message_append(message).await.map_err(|e| e.to_string())
    }

    async fn persist_tool_results(&self, results: Vec<Part>) -> Result<(), String> {
        let message = Message {
            id: MessageId::new(),
            session_id: self.session_id,
            branch_id: self.branch_id,
            role: Role::Tool,
            kind: MessageKind::Regular,
            parts: results,
            created_at: chrono::Utc::now(),
            turn_duration_ms: None,
        };
        self.storage
            .message_append(message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Executes all tool calls from one assistant turn, bounded by
    /// `tool_concurrency`, with serial-class tools additionally holding the
    /// per-loop serial mutex. `join_all` polls every future concurrently on
    /// this task and preserves input order in its output, so the resulting
    /// tool-result order matches call order regardless of completion order.
    async fn execute_tool_calls(
        &self,
        tool_calls: &[(String, String, serde_json::Value)],
        agent_name: &str,
        bypass: bool,
    ) -> Vec<Part> {
        let semaphore = Arc::new(Semaphore::new(self.config.tool_concurrency.max(1)));
        let mut ids = Vec::with_capacity(tool_calls.len());
        let mut names = Vec::with_capacity(tool_calls.len());
        let mut futures: Vec<BoxedToolFuture<'_>> = Vec::with_capacity(tool_calls.len());

        for (id, name, arguments) in tool_calls {
            let _ = self.events.publish(
                self.session_id,
                self.branch_id,
                Event::ToolCallStarted {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                },
            );

            let is_serial = self
                .tool_registry
                .get(name)
                .map(|t| t.concurrency_class() == ConcurrencyClass::Serial)
                .unwrap_or(false);

            let ctx = ToolContext {
                session_id: self.session_id,
                branch_id: self.branch_id,
                tool_call_id: id.clone(),
                agent_name: agent_name.to_string(),
            };
            let cancel = CancellationToken::new();

            let future: BoxedToolFuture<'_> = if is_serial {
                Box::pin(async move {
                    let _guard = self.serial_tool_lock.lock().await;
                    self.tool_runner.run(name, arguments.clone(), ctx, bypass, cancel).await
                })
            } else {
                let semaphore = Arc::clone(&semaphore);
                Box::pin(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                    self.tool_runner.run(name, arguments.clone(), ctx, bypass, cancel).await
                })
            };

            ids.push(id.clone());
            names.push(name.clone());
            futures.push(future);
        }

        let outputs = futures::future::join_all(futures).await;

        let mut results = Vec::with_capacity(outputs.len());
        for ((id, name), output) in ids.into_iter().zip(names.into_iter()).zip(outputs.into_iter()) {
            let output_value = match &output {
                ToolOutput::Json { value } => value.clone(),
                ToolOutput::ErrorJson { value } => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            };
            let _ = self.events.publish(
                self.session_id,
                self.branch_id,
                Event::ToolCallCompleted {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    summary: output.summary(),
                    is_error: output.is_error(),
                    output: output_value,
                },
            );
            results.push(Part::ToolResult {
                tool_call_id: id,
                tool_name: name,
                output,
            });
        }
        results
    }
}

fn build_system_prompt(context_prefix: &str, base_prompt: &str, agent: &crate::agent_registry::AgentDefinition) -> String {
    let mut prompt = format!("{context_prefix}{base_prompt}");
    if agent.name != BASELINE_AGENT {
        if let Some(addendum) = &agent.system_prompt {
            prompt.push_str(&format!("\n\n## Agent: {}\n{}", agent.name, addendum));
        }
    }
    prompt
}
