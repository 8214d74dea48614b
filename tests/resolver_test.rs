//! Thread continuity: headers, body marker, heuristic, ambiguity.

use std::sync::Arc;

use chrono::{Duration, Utc};
use mailroom::model::*;
use mailroom::resolver::strategy::{self, Confidence};
use mailroom::resolver::{ResolverConfig, ThreadResolver};
use mailroom::store::ThreadStore;
use mailroom::store::memory::MemoryBackend;

fn message(sender: &str, subject: &str, body: &str) -> InboundMessage {
    InboundMessage {
        message_id: None,
        sender: sender.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        in_reply_to: None,
        references: Vec::new(),
        project_id: "site-1".to_string(),
        user_id: "alice".to_string(),
        source_ref: "/srv/site-1.git".to_string(),
        instruction: None,
        received_at: Utc::now(),
    }
}

fn resolver() -> (Arc<MemoryBackend>, ThreadResolver) {
    let store = Arc::new(MemoryBackend::new());
    let resolver = ThreadResolver::new(store.clone(), ResolverConfig::default());
    (store, resolver)
}

#[tokio::test]
async fn first_message_starts_a_thread() {
    let (store, resolver) = resolver();
    let msg = message("alice@example.com", "Re: Update the hero banner", "make it blue");

    let resolution = resolver.resolve(&msg).await.unwrap();
    assert!(resolution.created());

    let thread = resolution.thread;
    assert_eq!(thread.pair, PairKey::new("site-1", "alice"));
    assert_eq!(thread.branch_name, format!("thread-{}", thread.thread_id.0));
    assert_eq!(thread.subject, "Update the hero banner");
    assert_eq!(
        ThreadId::from_token(&thread.continuity_token()),
        Some(thread.thread_id)
    );
    assert!(store.get_thread(thread.thread_id).await.unwrap().is_some());
}

#[tokio::test]
async fn reply_header_token_is_an_exact_match() {
    let (_, resolver) = resolver();
    let first = resolver
        .resolve(&message("alice@example.com", "Banner", "make it blue"))
        .await
        .unwrap()
        .thread;

    let mut reply = message("someone-else@example.com", "totally different", "now red");
    reply.in_reply_to = Some(strategy::message_id(first.thread_id));

    let resolution = resolver.resolve(&reply).await.unwrap();
    assert_eq!(resolution.thread.thread_id, first.thread_id);
    assert_eq!(resolution.confidence, Some(Confidence::Exact));
}

#[tokio::test]
async fn newest_reference_wins() {
    let (_, resolver) = resolver();
    let older = resolver
        .resolve(&message("a@example.com", "one", "x"))
        .await
        .unwrap()
        .thread;
    let newer = resolver
        .resolve(&message("b@example.com", "two", "y"))
        .await
        .unwrap()
        .thread;

    let mut reply = message("c@example.com", "three", "z");
    reply.references = vec![
        strategy::message_id(older.thread_id),
        strategy::message_id(newer.thread_id),
    ];

    let resolution = resolver.resolve(&reply).await.unwrap();
    assert_eq!(resolution.thread.thread_id, newer.thread_id);
}

#[tokio::test]
async fn body_marker_survives_stripped_headers() {
    let (_, resolver) = resolver();
    let first = resolver
        .resolve(&message("alice@example.com", "Banner", "make it blue"))
        .await
        .unwrap()
        .thread;

    let body = format!(
        "actually red please\n\n> earlier reply\n> {}",
        strategy::body_marker(first.thread_id)
    );
    let resolution = resolver
        .resolve(&message("alice@example.com", "no subject", &body))
        .await
        .unwrap();
    assert_eq!(resolution.thread.thread_id, first.thread_id);
    assert_eq!(resolution.confidence, Some(Confidence::Embedded));
}

#[tokio::test]
async fn unknown_token_falls_through() {
    let (_, resolver) = resolver();
    let mut reply = message("alice@example.com", "Banner", "hello");
    reply.in_reply_to = Some(strategy::message_id(ThreadId::new()));

    let resolution = resolver.resolve(&reply).await.unwrap();
    assert!(resolution.created());
}

#[tokio::test]
async fn heuristic_matches_recent_similar_subject_from_same_sender() {
    let (_, resolver) = resolver();
    let first = resolver
        .resolve(&message("alice@example.com", "Update the hero banner colour", "blue"))
        .await
        .unwrap()
        .thread;

    let follow_up = message("Alice@Example.com", "RE: Fwd: update the hero banner colour", "red");
    let resolution = resolver.resolve(&follow_up).await.unwrap();
    assert_eq!(resolution.thread.thread_id, first.thread_id);
    assert_eq!(resolution.confidence, Some(Confidence::Heuristic));
}

#[tokio::test]
async fn heuristic_ignores_other_senders_and_stale_threads() {
    let (_, resolver) = resolver();
    resolver
        .resolve(&message("alice@example.com", "Update the hero banner", "blue"))
        .await
        .unwrap();

    let other_sender = message("bob@example.com", "Update the hero banner", "red");
    assert!(resolver.resolve(&other_sender).await.unwrap().created());

    let mut much_later = message("alice@example.com", "Update the hero banner", "green");
    much_later.received_at = Utc::now() + Duration::days(30);
    assert!(resolver.resolve(&much_later).await.unwrap().created());
}

#[tokio::test]
async fn ambiguous_heuristic_starts_a_new_thread() {
    let (store, resolver) = resolver();
    let now = Utc::now();
    let pair = PairKey::new("site-1", "alice");
    for _ in 0..2 {
        let thread = Thread::start("alice@example.com", pair.clone(), "Update the footer links", now);
        store.insert_thread(&thread).await.unwrap();
    }

    let msg = message("alice@example.com", "Update the footer links", "again");
    let resolution = resolver.resolve(&msg).await.unwrap();
    assert!(resolution.created(), "never merge into one of several equal candidates");
}

#[test]
fn subject_helpers() {
    assert_eq!(strategy::normalize_subject("Re: RE:  Fwd: Hello   world"), "Hello world");
    assert_eq!(strategy::subject_similarity("Hello world", "re: hello WORLD"), 1.0);
    assert_eq!(strategy::subject_similarity("", "hello"), 0.0);
    let partial = strategy::subject_similarity("update hero banner", "update footer banner");
    assert!((partial - 0.5).abs() < 1e-9);
}
