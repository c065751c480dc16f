//! Sessions and branches — the conversation containers messages live on.

use crate::types::{BranchId, SessionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: Option<String>,
    pub cwd: Option<String>,
    /// If true, the Tool Runner treats all permission checks as `allow`.
    pub bypass: bool,
    pub parent: Option<(SessionId, BranchId)>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub bypass: bool,
    pub parent: Option<(SessionId, BranchId)>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub name: Option<Option<String>>,
    pub bypass: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub session_id: SessionId,
    pub parent_branch_id: Option<BranchId>,
    pub parent_message_id: Option<crate::types::MessageId>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub preferred_model: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewBranch {
    pub parent_branch_id: Option<BranchId>,
    pub parent_message_id: Option<crate::types::MessageId>,
    pub name: Option<String>,
}

/// A node in the branch tree returned by `getBranchTree`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTreeNode {
    pub branch: Branch,
    pub children: Vec<BranchTreeNode>,
}
