//! Event Store: the append-only, monotonically-ided event log and
//! its pub/sub catch-up semantics.

use crate::error::EventStoreError;
use crate::types::{BranchId, EventId, MessageId, Role, SessionId, Usage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Event {
    MessageReceived {
        message_id: MessageId,
        role: Role,
    },
    StreamStarted,
    StreamChunk {
        delta: String,
    },
    StreamEnded {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
        usage: Option<Usage>,
    },
    ToolCallStarted {
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallCompleted {
        tool_call_id: String,
        tool_name: String,
        summary: String,
        is_error: bool,
        output: serde_json::Value,
    },
    TurnCompleted {
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
    },
    ErrorOccurred {
        error: String,
    },
    AgentSwitched {
        from_agent: String,
        to_agent: String,
    },
    SubagentSpawned {
        parent_session_id: SessionId,
        parent_branch_id: BranchId,
        child_session_id: SessionId,
        agent: String,
        prompt: String,
    },
    SubagentCompleted {
        success: bool,
    },
    PlanConfirmed {
        plan_path: String,
    },
    CompactionStarted,
    CompactionCompleted {
        first_kept_message_id: MessageId,
    },
    BranchSwitched {
        from: BranchId,
        to: BranchId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub session_id: SessionId,
    /// Every event kind this crate emits happens to be branch-scoped; the
    /// field stays optional to allow broadcast (session-wide) events that
    /// match any branch filter.
    pub branch_id: Option<BranchId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub event: Event,
}

/// Filter for `listEvents`/`getLatestEventId`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<SessionId>,
    pub branch_id: Option<BranchId>,
    pub after_id: Option<EventId>,
}

impl EventEnvelope {
    fn matches(&self, filter: &EventFilter) -> bool {
        if let Some(sid) = filter.session_id {
            if self.session_id != sid {
                return false;
            }
        }
        if let Some(bid) = filter.branch_id {
            // Events with no branch-id broadcast to every branch subscriber.
            if let Some(envelope_branch) = self.branch_id {
                if envelope_branch != bid {
                    return false;
                }
            }
        }
        if let Some(after) = filter.after_id {
            if self.id <= after {
                return false;
            }
        }
        true
    }
}

const CHANNEL_CAPACITY: usize = 1024;

struct SessionLog {
    envelopes: Vec<EventEnvelope>,
    tx: broadcast::Sender<EventEnvelope>,
}

impl SessionLog {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            envelopes: Vec::new(),
            tx,
        }
    }
}

/// Append-only per-session event log with subscribe-before-snapshot catch-up:
/// a subscriber first takes the live receiver, then reads the snapshot, so
/// no event published between the two can be missed. Live events already present in the snapshot are
/// filtered out of the forwarded tail so nothing is delivered twice.
///
/// Logs are keyed by session (not branch) because a branch-less filter must
/// see every branch's events for that session without cross-session leakage.
pub struct InMemoryEventStore {
    next_id: AtomicU64,
    logs: Mutex<std::collections::HashMap<SessionId, Arc<Mutex<SessionLog>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            logs: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn log_for(&self, session_id: SessionId) -> Arc<Mutex<SessionLog>> {
        self.logs
            .lock()
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new())))
            .clone()
    }

    pub fn publish(
        &self,
        session_id: SessionId,
        branch_id: BranchId,
        event: Event,
    ) -> Result<EventEnvelope, EventStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope {
            id,
            session_id,
            branch_id: Some(branch_id),
            created_at: chrono::Utc::now(),
            event,
        };
        let log = self.log_for(session_id);
        let mut log = log.lock();
        log.envelopes.push(envelope.clone());
        // No receivers is not an error: events are still durably appended.
        let _ = log.tx.send(envelope.clone());
        Ok(envelope)
    }

    pub fn latest_event<F>(&self, session_id: SessionId, branch_id: BranchId, matches: F) -> Option<EventEnvelope>
    where
        F: Fn(&Event) -> bool,
    {
        let log = self.log_for(session_id);
        let log = log.lock();
        log.envelopes
            .iter()
            .rev()
            .find(|e| e.branch_id == Some(branch_id) && matches(&e.event))
            .cloned()
    }

    /// `listEvents(filter)`.
    pub fn list_events(&self, filter: &EventFilter) -> Vec<EventEnvelope> {
        let Some(session_id) = filter.session_id else {
            return Vec::new();
        };
        let log = self.log_for(session_id);
        let log = log.lock();
        log.envelopes.iter().filter(|e| e.matches(filter)).cloned().collect()
    }

    /// `getLatestEventId(filter)`.
    pub fn get_latest_event_id(&self, filter: &EventFilter) -> Option<EventId> {
        self.list_events(filter).into_iter().map(|e| e.id).max()
    }

    /// `getLatestByTags`: latest event matching a filter and an
    /// additional predicate over the event kind.
    pub fn get_latest_by_tags<F>(&self, filter: &EventFilter, matches: F) -> Option<EventEnvelope>
    where
        F: Fn(&Event) -> bool,
    {
        self.list_events(filter).into_iter().rev().find(|e| matches(&e.event))
    }

    /// Subscribe to a (session, branch?) starting after `after_id`
    /// (exclusive). Returns a stream that first replays anything already on
    /// the log, then forwards live publishes, without a gap or duplicate at
    /// the boundary.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        branch_id: Option<BranchId>,
        after_id: Option<EventId>,
    ) -> futures::stream::BoxStream<'static, EventEnvelope> {
        use futures::StreamExt;

        let filter = EventFilter {
            session_id: Some(session_id),
            branch_id,
            after_id,
        };

        let log = self.log_for(session_id);
        let guard = log.lock();
        let rx = guard.tx.subscribe();
        let snapshot: Vec<EventEnvelope> = guard.envelopes.iter().filter(|e| e.matches(&filter)).cloned().collect();
        let last_snapshot_id = snapshot.last().map(|e| e.id);
        drop(guard);

        let live = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
            let filter = filter.clone();
            let last_snapshot_id = last_snapshot_id;
            async move {
                match res {
                    Ok(envelope) => {
                        if let Some(last) = last_snapshot_id {
                            if envelope.id <= last {
                                return None;
                            }
                        }
                        if envelope.matches(&EventFilter {
                            after_id: None,
                            ..filter
                        }) {
                            Some(envelope)
                        } else {
                            None
                        }
                    }
                    Err(_) => None,
                }
            }
        });

        futures::stream::iter(snapshot).chain(live).boxed()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribe_catches_up_then_streams_live() {
        let store = InMemoryEventStore::new();
        let session_id = SessionId::new();
        let branch_id = BranchId::new();

        store.publish(session_id, branch_id, Event::StreamStarted).unwrap();
        let mut stream = store.subscribe(session_id, Some(branch_id), None);

        let first = stream.next().await.unwrap();
        assert!(matches!(first.event, Event::StreamStarted));

        store
            .publish(
                session_id,
                branch_id,
                Event::StreamEnded {
                    interrupted: false,
                    usage: None,
                },
            )
            .unwrap();
        let second = stream.next().await.unwrap();
        assert!(matches!(second.event, Event::StreamEnded { .. }));
    }

    #[tokio::test]
    async fn subscribe_after_id_skips_earlier_events() {
        let store = InMemoryEventStore::new();
        let session_id = SessionId::new();
        let branch_id = BranchId::new();

        let first = store.publish(session_id, branch_id, Event::StreamStarted).unwrap();
        store
            .publish(
                session_id,
                branch_id,
                Event::StreamEnded {
                    interrupted: false,
                    usage: None,
                },
            )
            .unwrap();

        let mut stream = store.subscribe(session_id, Some(branch_id), Some(first.id));
        let next = stream.next().await.unwrap();
        assert!(matches!(next.event, Event::StreamEnded { .. }));
    }

    #[test]
    fn branchless_filter_sees_every_branch_in_session() {
        let store = InMemoryEventStore::new();
        let session_id = SessionId::new();
        let branch_a = BranchId::new();
        let branch_b = BranchId::new();
        store.publish(session_id, branch_a, Event::StreamStarted).unwrap();
        store.publish(session_id, branch_b, Event::StreamStarted).unwrap();

        let all = store.list_events(&EventFilter {
            session_id: Some(session_id),
            branch_id: None,
            after_id: None,
        });
        assert_eq!(all.len(), 2);

        let only_a = store.list_events(&EventFilter {
            session_id: Some(session_id),
            branch_id: Some(branch_a),
            after_id: None,
        });
        assert_eq!(only_a.len(), 1);
    }
}
