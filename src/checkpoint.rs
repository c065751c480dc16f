//! Checkpoint Service: redefines a branch's effective prompt prefix
//! when a plan or compaction marker is present.

use crate::storage::Storage;
use crate::types::{BranchId, Message, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Checkpoint {
    Plan {
        plan_path: String,
        created_at: chrono::DateTime<chrono::Utc>,
    },
    Compaction {
        summary: String,
        first_kept_message_id: MessageId,
        created_at: chrono::DateTime<chrono::Utc>,
    },
}

impl Checkpoint {
    /// An opaque key that changes iff the checkpoint's identity changes —
    /// used by the Agent Loop's intra-turn cache.
    pub fn cache_key(&self) -> String {
        match self {
            Self::Plan {
                plan_path,
                created_at,
            } => format!("plan:{plan_path}:{created_at}"),
            Self::Compaction {
                first_kept_message_id,
                created_at,
                ..
            } => format!("compaction:{first_kept_message_id}:{created_at}"),
        }
    }
}

/// `{messages, contextPrefix}` as returned by `buildMessagesForTurn`.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub messages: Vec<Message>,
    pub context_prefix: String,
}

pub struct CheckpointService {
    storage: Arc<dyn Storage>,
}

impl CheckpointService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_latest_checkpoint(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<Checkpoint>, crate::error::StorageError> {
        self.storage.checkpoint_get_latest(branch_id).await
    }

    pub async fn build_messages_for_turn(
        &self,
        branch_id: BranchId,
    ) -> Result<TurnContext, crate::error::StorageError> {
        let checkpoint = self.get_latest_checkpoint(branch_id).await?;
        match checkpoint {
            None => Ok(TurnContext {
                messages: self.storage.message_list_by_branch(branch_id).await?,
                context_prefix: String::new(),
            }),
            Some(Checkpoint::Plan {
                plan_path,
                created_at,
            }) => {
                let messages = self.storage.message_list_since(branch_id, created_at).await?;
                let prefix = match tokio::fs::read_to_string(&plan_path).await {
                    Ok(body) => format!("Plan to execute:\n{body}\n\n"),
                    Err(_) => String::new(),
                };
                Ok(TurnContext {
                    messages,
                    context_prefix: prefix,
                })
            }
            Some(Checkpoint::Compaction {
                summary,
                first_kept_message_id,
                ..
            }) => {
                let messages = self
                    .storage
                    .message_list_from(branch_id, first_kept_message_id)
                    .await?;
                Ok(TurnContext {
                    messages,
                    context_prefix: format!("Previous context:\n{summary}\n\n"),
                })
            }
        }
    }
}

/// Per-turn cache keyed by checkpoint identity: caches the (messages,
/// prefix) result keyed by checkpoint id within a single turn, and
/// invalidates when the checkpoint id changes.
#[derive(Default)]
pub struct TurnContextCache {
    entry: Option<(Option<String>, TurnContext)>,
}

impl TurnContextCache {
    /// Returns the cached context only if `key` matches the last-cached key.
    pub fn get(&self, key: &Option<String>) -> Option<&TurnContext> {
        match &self.entry {
            Some((cached_key, context)) if cached_key == key => Some(context),
            _ => None,
        }
    }

    pub fn put(&mut self, key: Option<String>, context: TurnContext) -> &TurnContext {
        self.entry = Some((key, context));
        &self.entry.as_ref().unwrap().1
    }
}
