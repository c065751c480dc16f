//! Storage Repository: the durable session/branch/message/checkpoint
//! store. The trait boundary is intentionally swappable — see DESIGN.md for
//! why this crate ships an in-memory implementation rather than a SQL one.

use crate::checkpoint::Checkpoint;
use crate::error::StorageError;
use crate::session::{Branch, BranchTreeNode, NewBranch, NewSession, Session, SessionUpdate};
use crate::types::{BranchId, Message, MessageId, SessionId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn session_create(&self, new: NewSession) -> Result<Session, StorageError>;
    async fn session_get(&self, id: SessionId) -> Result<Session, StorageError>;
    async fn session_update(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<Session, StorageError>;
    async fn session_list(&self) -> Result<Vec<Session>, StorageError>;
    async fn session_delete(&self, id: SessionId) -> Result<(), StorageError>;
    /// Most recently updated session whose `cwd` matches, if any.
    async fn session_get_last_by_cwd(&self, cwd: &str) -> Result<Option<Session>, StorageError>;

    async fn branch_create(
        &self,
        session_id: SessionId,
        new: NewBranch,
    ) -> Result<Branch, StorageError>;
    async fn branch_get(&self, id: BranchId) -> Result<Branch, StorageError>;
    async fn branch_list_by_session(&self, session_id: SessionId)
        -> Result<Vec<Branch>, StorageError>;
    async fn branch_tree(&self, session_id: SessionId) -> Result<Vec<BranchTreeNode>, StorageError>;
    async fn branch_update_summary(&self, id: BranchId, summary: String) -> Result<(), StorageError>;
    async fn branch_update_preferred_model(
        &self,
        id: BranchId,
        model: String,
    ) -> Result<(), StorageError>;
    async fn branch_count_messages(&self, id: BranchId) -> Result<usize, StorageError>;

    async fn message_append(&self, message: Message) -> Result<Message, StorageError>;
    async fn message_get(&self, id: MessageId) -> Result<Message, StorageError>;
    async fn message_list_by_branch(&self, branch_id: BranchId) -> Result<Vec<Message>, StorageError>;
    async fn message_list_since(
        &self,
        branch_id: BranchId,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Message>, StorageError>;
    async fn message_list_from(
        &self,
        branch_id: BranchId,
        from_message_id: MessageId,
    ) -> Result<Vec<Message>, StorageError>;
    async fn message_set_turn_duration(
        &self,
        id: MessageId,
        duration_ms: u64,
    ) -> Result<(), StorageError>;

    async fn checkpoint_create(
        &self,
        branch_id: BranchId,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError>;
    async fn checkpoint_get_latest(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<Checkpoint>, StorageError>;
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    branches: HashMap<BranchId, Branch>,
    branches_by_session: HashMap<SessionId, Vec<BranchId>>,
    messages: HashMap<MessageId, Message>,
    messages_by_branch: HashMap<BranchId, Vec<MessageId>>,
    checkpoints_by_branch: HashMap<BranchId, Vec<Checkpoint>>,
}

/// An in-memory `Storage` implementation. The repository operations
/// don't prescribe a schema, only a contract — this crate keeps the
/// trait object swappable for a real SQL-backed implementation at the
/// host binary's discretion.
pub struct InMemoryStorage {
    state: Arc<RwLock<State>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tree(branches: &[Branch], parent: Option<BranchId>) -> Vec<BranchTreeNode> {
    branches
        .iter()
        .filter(|b| b.parent_branch_id == parent)
        .map(|b| BranchTreeNode {
            branch: b.clone(),
            children: build_tree(branches, Some(b.id)),
        })
        .collect()
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn session_create(&self, new: NewSession) -> Result<Session, StorageError> {
        let now = chrono::Utc::now();
        let session = Session {
            id: SessionId::new(),
            name: new.name,
            cwd: new.cwd,
            bypass: new.bypass,
            parent: new.parent,
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .sessions
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn session_get(&self, id: SessionId) -> Result<Session, StorageError> {
        self.state
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StorageError::SessionNotFound(id))
    }

    async fn session_update(
        &self,
        id: SessionId,
        update: SessionUpdate,
    ) -> Result<Session, StorageError> {
        let mut state = self.state.write();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(StorageError::SessionNotFound(id))?;
        if let Some(name) = update.name {
            session.name = name;
        }
        if let Some(bypass) = update.bypass {
            session.bypass = bypass;
        }
        session.updated_at = chrono::Utc::now();
        Ok(session.clone())
    }

    async fn session_list(&self) -> Result<Vec<Session>, StorageError> {
        Ok(self.state.read().sessions.values().cloned().collect())
    }

    async fn session_delete(&self, id: SessionId) -> Result<(), StorageError> {
        let mut state = self.state.write();
        state
            .sessions
            .remove(&id)
            .ok_or(StorageError::SessionNotFound(id))?;
        if let Some(branch_ids) = state.branches_by_session.remove(&id) {
            for branch_id in branch_ids {
                state.branches.remove(&branch_id);
                if let Some(message_ids) = state.messages_by_branch.remove(&branch_id) {
                    for message_id in message_ids {
                        state.messages.remove(&message_id);
                    }
                }
                state.checkpoints_by_branch.remove(&branch_id);
            }
        }
        Ok(())
    }

    async fn session_get_last_by_cwd(&self, cwd: &str) -> Result<Option<Session>, StorageError> {
        Ok(self
            .state
            .read()
            .sessions
            .values()
            .filter(|s| s.cwd.as_deref() == Some(cwd))
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn branch_create(
        &self,
        session_id: SessionId,
        new: NewBranch,
    ) -> Result<Branch, StorageError> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(&session_id) {
            return Err(StorageError::SessionNotFound(session_id));
        }
        let branch = Branch {
            id: BranchId::new(),
            session_id,
            parent_branch_id: new.parent_branch_id,
            parent_message_id: new.parent_message_id,
            name: new.name,
            summary: None,
            preferred_model: None,
            created_at: chrono::Utc::now(),
        };
        state.branches.insert(branch.id, branch.clone());
        state
            .branches_by_session
            .entry(session_id)
            .or_default()
            .push(branch.id);
        Ok(branch)
    }

    async fn branch_get(&self, id: BranchId) -> Result<Branch, StorageError> {
        self.state
            .read()
            .branches
            .get(&id)
            .cloned()
            .ok_or(StorageError::BranchNotFound(id))
    }

    async fn branch_list_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Branch>, StorageError> {
        let state = self.state.read();
        Ok(state
            .branches_by_session
            .get(&session_id)
            .map(|ids| ids.iter().filter_map(|id| state.branches.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn branch_tree(&self, session_id: SessionId) -> Result<Vec<BranchTreeNode>, StorageError> {
        let branches = self.branch_list_by_session(session_id).await?;
        Ok(build_tree(&branches, None))
    }

    async fn branch_update_summary(&self, id: BranchId, summary: String) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let branch = state.branches.get_mut(&id).ok_or(StorageError::BranchNotFound(id))?;
        branch.summary = Some(summary);
        Ok(())
    }

    async fn branch_update_preferred_model(
        &self,
        id: BranchId,
        model: String,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let branch = state.branches.get_mut(&id).ok_or(StorageError::BranchNotFound(id))?;
        branch.preferred_model = Some(model);
        Ok(())
    }

    async fn branch_count_messages(&self, id: BranchId) -> Result<usize, StorageError> {
        Ok(self
            .state
            .read()
            .messages_by_branch
            .get(&id)
            .map(|ids| ids.len())
            .unwrap_or(0))
    }

    async fn message_append(&self, message: Message) -> Result<Message, StorageError> {
        let mut state = self.state.write();
        state
            .messages_by_branch
            .entry(message.branch_id)
            .or_default()
            .push(message.id);
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn message_get(&self, id: MessageId) -> Result<Message, StorageError> {
        self.state
            .read()
            .messages
            .get(&id)
            .cloned()
            .ok_or(StorageError::MessageNotFound(id))
    }

    async fn message_list_by_branch(&self, branch_id: BranchId) -> Result<Vec<Message>, StorageError> {
        let state = self.state.read();
        Ok(state
            .messages_by_branch
            .get(&branch_id)
            .map(|ids| ids.iter().filter_map(|id| state.messages.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn message_list_since(
        &self,
        branch_id: BranchId,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Message>, StorageError> {
        let all = self.message_list_by_branch(branch_id).await?;
        Ok(all.into_iter().filter(|m| m.created_at > since).collect())
    }

    async fn message_list_from(
        &self,
        branch_id: BranchId,
        from_message_id: MessageId,
    ) -> Result<Vec<Message>, StorageError> {
        let all = self.message_list_by_branch(branch_id).await?;
        let start = all.iter().position(|m| m.id == from_message_id).unwrap_or(0);
        Ok(all[start..].to_vec())
    }

    async fn message_set_turn_duration(
        &self,
        id: MessageId,
        duration_ms: u64,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let message = state
            .messages
            .get_mut(&id)
            .ok_or(StorageError::MessageNotFound(id))?;
        message.turn_duration_ms = Some(duration_ms);
        Ok(())
    }

    async fn checkpoint_create(
        &self,
        branch_id: BranchId,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        self.state
            .write()
            .checkpoints_by_branch
            .entry(branch_id)
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn checkpoint_get_latest(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self
            .state
            .read()
            .checkpoints_by_branch
            .get(&branch_id)
            .and_then(|v| v.last().cloned()))
    }
}
