//! Scenario tests for the Agent Loop, driven through `CoreFacade` the way a
//! real front-end would: create a session, steer it, and watch the event
//! stream.

use conductor_core::error::AgentLoopError;
use conductor_core::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn facade(provider: MockProvider, tools: ToolRegistry, rules: Vec<PermissionRule>, config: EngineConfig) -> CoreFacade {
    CoreFacade::builder(
        Arc::new(InMemoryStorage::new()),
        Arc::new(provider),
        Arc::new(DenyByDefaultHandler),
    )
    .with_tool_registry(tools)
    .with_permission_rules(rules)
    .with_config(config)
    .build()
}

/// Drains events from `stream` until one matches `done`, failing the test
/// if no matching event shows up within a couple of seconds (a hung Agent
/// Loop is a bug, not a slow test).
async fn collect_until(
    stream: &mut (impl futures::Stream<Item = EventEnvelope> + Unpin),
    mut done: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut out = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for the next event")
            .expect("event stream ended unexpectedly");
        let matched = done(&envelope.event);
        out.push(envelope.event);
        if matched {
            return out;
        }
    }
}

fn tag(event: &Event) -> &'static str {
    match event {
        Event::MessageReceived { .. } => "MessageReceived",
        Event::StreamStarted => "StreamStarted",
        Event::StreamChunk { .. } => "StreamChunk",
        Event::StreamEnded { .. } => "StreamEnded",
        Event::ToolCallStarted { .. } => "ToolCallStarted",
        Event::ToolCallCompleted { .. } => "ToolCallCompleted",
        Event::TurnCompleted { .. } => "TurnCompleted",
        Event::ErrorOccurred { .. } => "ErrorOccurred",
        Event::AgentSwitched { .. } => "AgentSwitched",
        Event::SubagentSpawned { .. } => "SubagentSpawned",
        Event::SubagentCompleted { .. } => "SubagentCompleted",
        Event::PlanConfirmed { .. } => "PlanConfirmed",
        Event::CompactionStarted => "CompactionStarted",
        Event::CompactionCompleted { .. } => "CompactionCompleted",
        Event::BranchSwitched { .. } => "BranchSwitched",
    }
}

/// Scenario A — single turn, no tools.
#[tokio::test]
async fn scenario_a_single_turn_no_tools() {
    let facade = facade(
        MockProvider::text("hello"),
        ToolRegistry::new(),
        vec![],
        EngineConfig::default(),
    );

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("hi".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    let seen = collect_until(&mut events, |e| matches!(e, Event::TurnCompleted { .. })).await;
    let tags: Vec<_> = seen.iter().map(tag).collect();

    assert_eq!(
        tags,
        vec![
            "MessageReceived",
            "StreamStarted",
            "StreamChunk",
            "StreamEnded",
            "MessageReceived",
            "TurnCompleted",
        ]
    );
    match seen.last().unwrap() {
        Event::TurnCompleted { interrupted, .. } => assert!(!interrupted),
        other => panic!("expected TurnCompleted, got {other:?}"),
    }

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
}

/// Scenario B — tool round-trip.
#[tokio::test]
async fn scenario_b_tool_round_trip() {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));

    let provider = MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall {
            name: "echo".into(),
            arguments: serde_json::json!({"x": 1}),
        }]),
        MockResponse::Text("done".into()),
    ]);

    let facade = facade(
        provider,
        tools,
        vec![PermissionRule::new("*", PermissionAction::Allow)],
        EngineConfig::default(),
    );

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("please echo".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    let seen = collect_until(&mut events, |e| matches!(e, Event::TurnCompleted { .. })).await;
    let tags: Vec<_> = seen.iter().map(tag).collect();

    assert_eq!(
        tags,
        vec![
            "MessageReceived", // user
            "StreamStarted",
            "StreamEnded",
            "MessageReceived", // assistant w/ tool call
            "ToolCallStarted",
            "ToolCallCompleted",
            "MessageReceived", // tool result
            "StreamStarted",
            "StreamChunk",
            "StreamEnded",
            "MessageReceived", // assistant text
            "TurnCompleted",
        ]
    );

    let tool_completed = seen
        .iter()
        .find_map(|e| match e {
            Event::ToolCallCompleted { is_error, tool_call_id, .. } => Some((*is_error, tool_call_id.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_completed, (false, "mock-tool-0".to_string()));

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, Role::Tool);
}

/// Scenario C — cancel mid-stream discards the turn and any queued
/// follow-ups.
#[tokio::test]
async fn scenario_c_cancel_mid_stream_discards_follow_ups() {
    let facade = facade(
        MockProvider::new(vec![MockResponse::TextThenHang("par".into())]),
        ToolRegistry::new(),
        vec![],
        EngineConfig::default(),
    );

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("hi".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    // Wait for the stream to actually open before cancelling, otherwise the
    // Cancel could land before StreamStarted is even published.
    collect_until(&mut events, |e| matches!(e, Event::StreamStarted)).await;

    facade.send_message(SendMessageRequest {
        session_id: created.session_id,
        branch_id: created.branch_id,
        content: "queued before cancel".into(),
        bypass: false,
        model: None,
    })
    .await
    .unwrap();

    facade.steer(created.session_id, created.branch_id, SteerCommand::Cancel);

    let seen = collect_until(&mut events, |e| matches!(e, Event::TurnCompleted { .. })).await;
    let tags: Vec<_> = seen.iter().map(tag).collect();
    assert_eq!(
        tags,
        vec!["StreamChunk", "StreamEnded", "MessageReceived", "TurnCompleted"]
    );
    match seen.last().unwrap() {
        Event::TurnCompleted { interrupted, .. } => assert!(interrupted),
        other => panic!("expected TurnCompleted, got {other:?}"),
    }

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    // user + partial assistant only — the queued follow-up was discarded.
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text(), "par");

    // Give the loop a moment to settle into Idle; no further turn should
    // start since Cancel drops the queued follow-up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = facade.list_messages(created.branch_id).await.unwrap();
    assert_eq!(messages.len(), 2);
}

/// Scenario D — interject hard-stops the turn, then immediately starts a
/// new one from the interjected message without a `TurnCompleted` boundary
/// in between.
#[tokio::test]
async fn scenario_d_interject_starts_next_turn_without_completing() {
    let facade = facade(
        MockProvider::new(vec![
            MockResponse::TextThenHang("par".into()),
            MockResponse::Text("switched to python".into()),
        ]),
        ToolRegistry::new(),
        vec![],
        EngineConfig::default(),
    );

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("write some rust".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    collect_until(&mut events, |e| matches!(e, Event::StreamStarted)).await;

    facade.steer(
        created.session_id,
        created.branch_id,
        SteerCommand::Interject {
            message: "wait, use Python instead".into(),
        },
    );

    let seen = collect_until(&mut events, |e| matches!(e, Event::TurnCompleted { .. })).await;
    // No TurnCompleted appears before the second StreamStarted.
    let second_stream_started = seen.iter().position(|e| tag(e) == "StreamStarted");
    let turn_completed = seen.iter().position(|e| tag(e) == "TurnCompleted");
    assert!(second_stream_started.unwrap() < turn_completed.unwrap());

    let messages = facade.list_messages(created.branch_id).await.unwrap();
    // user, assistant partial, user(interjection), assistant final.
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].kind, MessageKind::Interjection);
    assert_eq!(messages[2].text(), "wait, use Python instead");
    assert_eq!(messages[3].text(), "switched to python");
}

/// Scenario E — follow-up queue bound.
#[tokio::test]
async fn scenario_e_follow_up_queue_overflow() {
    let mut config = EngineConfig::default();
    config.follow_up_max = 2;

    let facade = facade(
        MockProvider::new(vec![MockResponse::HangUntilCancelled]),
        ToolRegistry::new(),
        vec![],
        config,
    );

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("start a long turn".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    collect_until(&mut events, |e| matches!(e, Event::StreamStarted)).await;

    for i in 0..2 {
        facade
            .send_message(SendMessageRequest {
                session_id: created.session_id,
                branch_id: created.branch_id,
                content: format!("follow-up {i}"),
                bypass: false,
                model: None,
            })
            .await
            .unwrap();
    }

    let overflow = facade
        .send_message(SendMessageRequest {
            session_id: created.session_id,
            branch_id: created.branch_id,
            content: "one too many".into(),
            bypass: false,
            model: None,
        })
        .await;
    assert!(overflow.is_err());
    match overflow.unwrap_err() {
        CoreError::AgentLoop(AgentLoopError::LimitExceeded(msg)) => assert!(msg.contains("full")),
        other => panic!("expected a follow-up LimitExceeded error, got {other:?}"),
    }

    facade.steer(created.session_id, created.branch_id, SteerCommand::Cancel);
}

/// Scenario F — permission `ask` denied never propagates out of the Tool
/// Runner; the turn continues to a second model call that observes the
/// error-json result.
#[tokio::test]
async fn scenario_f_permission_denied_is_observed_by_the_model() {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));

    let provider = MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall {
            name: "echo".into(),
            arguments: serde_json::json!({}),
        }]),
        MockResponse::Text("ok, it was denied".into()),
    ]);

    // No rule matches "echo" -> falls back to the engine default (Ask) ->
    // DenyByDefaultHandler always answers Deny.
    let facade = facade(provider, tools, vec![], EngineConfig::default());

    let created = facade
        .create_session(CreateSessionRequest {
            name: None,
            cwd: None,
            first_message: Some("try the tool".into()),
            bypass: false,
        })
        .await
        .unwrap();

    let mut events = facade.subscribe_events(created.session_id, Some(created.branch_id), None);
    let seen = collect_until(&mut events, |e| matches!(e, Event::TurnCompleted { .. })).await;

    let completed = seen
        .iter()
        .find_map(|e| match e {
            Event::ToolCallCompleted { is_error, summary, .. } => Some((*is_error, summary.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed, (true, "Permission denied".to_string()));

    match seen.last().unwrap() {
        Event::TurnCompleted { interrupted, .. } => assert!(!interrupted),
        other => panic!("expected TurnCompleted, got {other:?}"),
    }
}
