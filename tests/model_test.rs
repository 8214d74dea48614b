use chrono::Utc;
use mailroom::model::*;
use serde_json::json;

#[test]
fn pipeline_path_is_a_valid_sequence() {
    use PairState::*;
    let path = [Claimed, Processing, Building, Deploying, Committing, Ready, Idle, Released];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
}

#[test]
fn failures_and_interrupts_return_to_processing() {
    use PairState::*;
    for from in [Building, Deploying, Committing, Processing] {
        assert!(from.can_transition_to(Processing), "{from}");
    }
    assert!(Ready.can_transition_to(Processing));
    assert!(Idle.can_transition_to(Processing));
}

#[test]
fn invalid_transitions_are_rejected() {
    use PairState::*;
    assert!(!Claimed.can_transition_to(Building));
    assert!(!Processing.can_transition_to(Deploying));
    assert!(!Building.can_transition_to(Committing));
    assert!(!Ready.can_transition_to(Building));
    assert!(!Released.can_transition_to(Processing));
    assert!(!Released.can_transition_to(Released));
}

#[test]
fn only_pipeline_states_are_interruptible() {
    use PairState::*;
    let interruptible: Vec<_> = [Claimed, Processing, Building, Deploying, Committing, Ready, Idle, Released]
        .into_iter()
        .filter(|s| s.is_interruptible())
        .collect();
    assert_eq!(interruptible, vec![Processing, Building, Deploying]);
    assert!(Released.is_terminal());
    assert!(!Idle.is_terminal());
}

#[test]
fn queue_names_are_deterministic_and_identifier_safe() {
    let pair = PairKey::new("Site One/ü", "alice@example.com");
    assert_eq!(pair.input_queue(), PairKey::new("Site One/ü", "alice@example.com").input_queue());
    assert_ne!(pair.input_queue(), pair.output_queue());
    for name in [pair.input_queue(), pair.output_queue()] {
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'), "{name}");
    }
    // The separator keeps ("ab","c") and ("a","bc") apart.
    assert_ne!(PairKey::new("ab", "c").digest(), PairKey::new("a", "bc").digest());
}

#[test]
fn thread_tokens_round_trip() {
    let thread = Thread::start("alice@example.com", PairKey::new("site-1", "alice"), "Hello", Utc::now());
    let token = thread.continuity_token();
    assert!(token.starts_with("mr-"));
    assert_eq!(ThreadId::from_token(&token), Some(thread.thread_id));
    assert_eq!(thread.branch_name, format!("thread-{}", thread.thread_id));
    assert_eq!(ThreadId::from_token("mr-not-a-uuid"), None);
}

#[test]
fn inbound_message_falls_back_to_body_for_instruction() {
    let msg: InboundMessage = serde_json::from_value(json!({
        "sender": "alice@example.com",
        "body": "make it blue",
        "projectId": "site-1",
        "userId": "alice",
        "sourceRef": "/srv/site-1.git"
    }))
    .unwrap();
    assert_eq!(msg.instruction_text(), "make it blue");
    assert_eq!(msg.pair(), PairKey::new("site-1", "alice"));
}

#[test]
fn inbound_message_reads_camel_case_reply_headers() {
    let msg: InboundMessage = serde_json::from_value(json!({
        "messageId": "<m2@example.com>",
        "sender": "alice@example.com",
        "subject": "Re: Banner",
        "body": "bigger",
        "inReplyTo": "<m1@example.com>",
        "references": ["<m0@example.com>", "<m1@example.com>"],
        "projectId": "site-1",
        "userId": "alice",
        "sourceRef": "/srv/site-1.git",
        "instruction": "make the banner bigger"
    }))
    .unwrap();
    assert_eq!(msg.message_id.as_deref(), Some("<m2@example.com>"));
    assert_eq!(msg.in_reply_to.as_deref(), Some("<m1@example.com>"));
    assert_eq!(msg.references.len(), 2);
    assert_eq!(msg.instruction_text(), "make the banner bigger");

    let wire = serde_json::to_value(&msg).unwrap();
    assert!(wire.get("inReplyTo").is_some());
    assert!(wire.get("in_reply_to").is_none());
}

#[test]
fn response_wire_format_uses_camel_case_and_snake_case_kinds() {
    let request = WorkRequest {
        correlation_id: CorrelationId::new(),
        thread_id: ThreadId::new(),
        project_id: "site-1".into(),
        user_id: "alice".into(),
        instruction: "make it blue".into(),
        source_ref: "/srv/site-1.git".into(),
        received_at: Utc::now(),
    };
    let failed = ResponseMessage::failed(&request, ErrorKind::BuildFailure, "exit 1");
    let wire = serde_json::to_value(&failed).unwrap();
    assert_eq!(wire["errorKind"], "build_failure");
    assert_eq!(wire["success"], false);
    assert!(wire.get("correlationId").is_some());
    assert!(wire["deploymentRef"].is_null());

    let superseded = ResponseMessage::superseded(&request, CorrelationId::new());
    assert_eq!(superseded.error_kind, Some(ErrorKind::Superseded));
    assert_eq!(ErrorKind::Superseded.as_str(), "superseded");
}
