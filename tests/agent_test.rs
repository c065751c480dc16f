//! Tests for `CoreFacade`: session/branch lifecycle, steering, and
//! checkpoints, exercised the way a front-end would drive the one public
//! surface this crate exposes.

use conductor_core::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn facade(provider: MockProvider) -> CoreFacade {
    CoreFacade::builder(
        Arc::new(InMemoryStorage::new()),
        Arc::new(provider),
        Arc::new(DenyByDefaultHandler),
    )
    .build()
}

async fn wait_for_turn_completed(facade: &CoreFacade, session_id: SessionId, branch_id: BranchId) {
    let mut events = facade.subscribe_events(session_id, Some(branch_id), None);
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(envelope) = events.next().await {
            if matches!(envelope.event, Event::TurnCompleted { .. }) {
                return;
            }
        }
    })
    .await
    .expect("turn never completed");
}

#[tokio::test]
async fn create_session_starts_a_turn_from_the_first_message() {
    let facade = facade(MockProvider::text("Hello!"));

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: Some("/work".into()),
            first_message: Some("Hi there".into()),
            bypass: false,
        })
        .await
        .unwrap();

    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "Hi there");
    assert_eq!(messages[1].text(), "Hello!");

    let session = facade.get_session(created.session_id).await.unwrap();
    assert_eq!(session.cwd.as_deref(), Some("/work"));
}

#[tokio::test]
async fn create_session_without_first_message_stays_empty() {
    let facade = facade(MockProvider::text("unused"));
    let created = facade
        .create_session(CreateSessionRequest::default())
        .await
        .unwrap();
    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn send_message_while_idle_starts_a_new_turn() {
    let facade = facade(MockProvider::texts(vec!["first", "second"]));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("one".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    facade
        .send_message(SendMessageRequest {
            session_id: created.session_id,
            branch_id: created.branch_id,
            content: "two".into(),
            bypass: false,
            model: None,
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].text(), "first");
    assert_eq!(messages[3].text(), "second");
}

#[tokio::test]
async fn update_session_bypass_persists() {
    let facade = facade(MockProvider::text("unused"));
    let created = facade
        .create_session(CreateSessionRequest::default())
        .await
        .unwrap();
    assert!(!created.bypass);

    facade.update_session_bypass(created.session_id, true).await.unwrap();
    let session = facade.get_session(created.session_id).await.unwrap();
    assert!(session.bypass);
}

#[tokio::test]
async fn delete_session_removes_it_from_listing() {
    let facade = facade(MockProvider::text("unused"));
    let created = facade
        .create_session(CreateSessionRequest::default())
        .await
        .unwrap();
    facade.delete_session(created.session_id).await.unwrap();
    assert!(facade.get_session(created.session_id).await.is_err());
    let sessions = facade.list_sessions().await.unwrap();
    assert!(sessions.iter().all(|s| s.id != created.session_id));
}

#[tokio::test]
async fn fork_branch_copies_history_up_to_the_cut_with_fresh_ids() {
    let facade = facade(MockProvider::text("hi"));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("hello".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let original = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(original.len(), 2);
    let cut_id = original[0].id;

    let forked = facade
        .fork_branch(created.session_id, created.branch_id, cut_id, Some("fork".into()))
        .await
        .unwrap();

    let forked_messages = facade.list_messages(forked.id).await.unwrap();
    assert_eq!(forked_messages.len(), 1);
    assert_eq!(forked_messages[0].text(), "hello");
    assert_ne!(forked_messages[0].id, original[0].id);
    assert_eq!(forked.parent_branch_id, Some(created.branch_id));
    assert_eq!(forked.parent_message_id, Some(cut_id));
}

#[tokio::test]
async fn switch_branch_summarizes_the_source_and_emits_branch_switched() {
    let facade = facade(MockProvider::text("hi"));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("hello there".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let other = facade.create_branch(created.session_id, Some("peer".into())).await.unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(other.id), None);
    facade
        .switch_branch(created.session_id, created.branch_id, other.id, true)
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(envelope.event, Event::BranchSwitched { .. }));

    let tree = facade.get_branch_tree(created.session_id).await.unwrap();
    let root = tree
        .iter()
        .find(|n| n.branch.id == created.branch_id)
        .expect("root branch present in tree");
    assert!(root.branch.summary.is_some());
}

#[tokio::test]
async fn approve_plan_creates_a_checkpoint_and_emits_plan_confirmed() {
    let facade = facade(MockProvider::texts(vec!["first", "second"]));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("before the plan".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let dir = tempfile::tempdir().unwrap();
    let plan_path = dir.path().join("plan.md");
    std::fs::write(&plan_path, "1. do the thing\n2. ship it\n").unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), Some(0));
    facade
        .approve_plan(created.session_id, created.branch_id, plan_path.to_string_lossy().into_owned())
        .await
        .unwrap();

    let mut saw_plan_confirmed = false;
    while let Ok(Some(envelope)) = tokio::time::timeout(Duration::from_millis(500), events.next()).await {
        if matches!(envelope.event, Event::PlanConfirmed { .. }) {
            saw_plan_confirmed = true;
            break;
        }
    }
    assert!(saw_plan_confirmed);

    facade
        .send_message(SendMessageRequest {
            session_id: created.session_id,
            branch_id: created.branch_id,
            content: "after the plan".into(),
            bypass: false,
            model: None,
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let all_messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(all_messages.len(), 4);
}

#[tokio::test]
async fn compact_branch_creates_a_checkpoint_and_emits_lifecycle_events() {
    let facade = facade(MockProvider::text("ack"));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("lots of context".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for_turn_completed(&facade, created.session_id, created.branch_id).await;

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), Some(0));
    facade.compact_branch(created.session_id, created.branch_id).await.unwrap();

    let mut saw_started = false;
    let mut saw_completed = false;
    while let Ok(Some(envelope)) = tokio::time::timeout(Duration::from_millis(500), events.next()).await {
        match envelope.event {
            Event::CompactionStarted => saw_started = true,
            Event::CompactionCompleted { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_started);
    assert!(saw_completed);
}

#[tokio::test]
async fn get_session_state_reports_streaming_and_agent() {
    let facade = facade(MockProvider::new(vec![MockResponse::HangUntilCancelled]));
    let created = facade
        .create_session(CreateSessionRequest {
            first_message: Some("go slow".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(e) = events.next().await {
            if matches!(e.event, Event::StreamStarted) {
                return;
            }
        }
    })
    .await
    .unwrap();

    let state = facade
        .get_session_state(created.session_id, created.branch_id)
        .await
        .unwrap();
    assert!(state.is_streaming);
    assert_eq!(state.agent, BASELINE_AGENT);

    facade.steer(created.session_id, created.branch_id, SteerCommand::Cancel);
}
