//! Agent execution engine core: session/branch/message model, an
//! append-only event store with catch-up subscriptions, checkpoint-aware
//! prompt assembly, a permission-gated tool runner, the per-(session,branch)
//! Agent Loop state machine, a Sub-Agent Actor, and the [`facade::CoreFacade`]
//! that ties them together into the crate's one public surface.

pub mod agent_loop;
pub mod agent_registry;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod facade;
pub mod permission;
pub mod provider;
pub mod retry;
pub mod session;
pub mod storage;
pub mod sub_agent;
pub mod tool_registry;
pub mod tool_runner;
pub mod types;

pub use agent_loop::{AgentLoop, FollowUpItem, LoopState, SteerCommand};
pub use agent_registry::{AgentDefinition, AgentRegistry, BASELINE_AGENT};
pub use checkpoint::{Checkpoint, CheckpointService, TurnContext};
pub use config::EngineConfig;
pub use error::CoreError;
pub use event::{Event, EventEnvelope, EventFilter, InMemoryEventStore};
pub use facade::{CoreFacade, CoreFacadeBuilder, CreateSessionRequest, CreatedSession, SendMessageRequest, SessionState};
pub use permission::{DenyByDefaultHandler, PermissionAction, PermissionEngine, PermissionHandler, PermissionRule};
pub use provider::{Chunk, MockProvider, MockResponse, MockToolCall, Provider, ProviderRequest, ToolDefinition};
pub use retry::RetryConfig;
pub use session::{Branch, BranchTreeNode, NewBranch, NewSession, Session, SessionUpdate};
pub use storage::{InMemoryStorage, Storage};
pub use sub_agent::{InProcessSubAgentRunner, SubAgentConfig, SubAgentOutcome, SubAgentRequest, SubAgentRunner};
pub use tool_registry::{ConcurrencyClass, EchoTool, Tool, ToolContext, ToolRegistry};
pub use types::*;
