//! Serde round-trip tests for the wire-shaped core types: events, message
//! parts, tool outputs, and permission rules all cross a process boundary in
//! a real deployment, so their tagged representations matter.

use conductor_core::*;

fn roundtrip<T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug>(value: &T) {
    let json = serde_json::to_string(value).expect("serialize");
    let back: T = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(*value, back);
}

#[test]
fn message_kind_roundtrip() {
    roundtrip(&MessageKind::Regular);
    roundtrip(&MessageKind::Interjection);
}

#[test]
fn role_roundtrip() {
    roundtrip(&Role::User);
    roundtrip(&Role::Assistant);
    roundtrip(&Role::System);
    roundtrip(&Role::Tool);
}

#[test]
fn finish_reason_roundtrip() {
    roundtrip(&FinishReason::Stop);
    roundtrip(&FinishReason::ToolCalls);
    roundtrip(&FinishReason::Aborted);
}

#[test]
fn part_variants_are_tagged_by_type() {
    let text = Part::Text { text: "hello".into() };
    let json = serde_json::to_value(&text).unwrap();
    assert_eq!(json["type"], "text");

    let tool_call = Part::ToolCall {
        id: "tc-1".into(),
        name: "read_file".into(),
        arguments: serde_json::json!({"path": "main.rs"}),
    };
    let json = serde_json::to_string(&tool_call).unwrap();
    let back: Part = serde_json::from_str(&json).unwrap();
    match back {
        Part::ToolCall { id, name, .. } => {
            assert_eq!(id, "tc-1");
            assert_eq!(name, "read_file");
        }
        other => panic!("wrong variant decoded: {other:?}"),
    }
}

#[test]
fn tool_output_error_is_tagged() {
    let output = ToolOutput::error("permission denied");
    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["type"], "error-json");
    assert_eq!(json["value"]["error"], "permission denied");
}

#[test]
fn tool_output_json_roundtrips() {
    let output = ToolOutput::Json {
        value: serde_json::json!({"exit_code": 0}),
    };
    let json = serde_json::to_string(&output).unwrap();
    let back: ToolOutput = serde_json::from_str(&json).unwrap();
    assert!(!back.is_error());
}

#[test]
fn message_full_roundtrip() {
    let session_id = SessionId::new();
    let branch_id = BranchId::new();
    let mut message = Message::new_user(session_id, branch_id, "hi there", MessageKind::Regular);
    message.parts.push(Part::ToolResult {
        tool_call_id: "tc-1".into(),
        tool_name: "echo".into(),
        output: ToolOutput::error("boom"),
    });

    let json = serde_json::to_string(&message).unwrap();
    let back: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(back.id, message.id);
    assert_eq!(back.session_id, session_id);
    assert_eq!(back.branch_id, branch_id);
    assert_eq!(back.parts.len(), 2);
}

#[test]
fn event_carries_a_tag_discriminator() {
    let event = Event::ToolCallCompleted {
        tool_call_id: "tc-1".into(),
        tool_name: "bash".into(),
        summary: "exit 0".into(),
        is_error: false,
        output: serde_json::json!({"exit_code": 0}),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["_tag"], "ToolCallCompleted");
    assert_eq!(json["tool_name"], "bash");
}

#[test]
fn stream_ended_omits_interrupted_flag_when_false() {
    let event = Event::StreamEnded {
        interrupted: false,
        usage: None,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert!(json.get("interrupted").is_none());

    let event = Event::StreamEnded {
        interrupted: true,
        usage: None,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["interrupted"], true);
}

#[test]
fn permission_rule_roundtrip() {
    let rule = PermissionRule::new("bash", PermissionAction::Deny).with_pattern("rm -rf");
    let json = serde_json::to_string(&rule).unwrap();
    let back: PermissionRule = serde_json::from_str(&json).unwrap();
    assert_eq!(back.tool, "bash");
    assert_eq!(back.pattern.as_deref(), Some("rm -rf"));
    assert_eq!(back.action, PermissionAction::Deny);
}

#[test]
fn checkpoint_variants_roundtrip() {
    let plan = Checkpoint::Plan {
        plan_path: "/tmp/plan.md".into(),
        created_at: chrono::Utc::now(),
    };
    roundtrip(&plan);

    let compaction = Checkpoint::Compaction {
        summary: "did some stuff".into(),
        first_kept_message_id: MessageId::new(),
        created_at: chrono::Utc::now(),
    };
    roundtrip(&compaction);
}
