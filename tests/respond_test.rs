//! Response emitters: queue, webhook and fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailroom::error::{Error, Result};
use mailroom::model::*;
use mailroom::resolver::strategy;
use mailroom::respond::{FanOut, QueueEmitter, ResponseEmitter, WebhookEmitter};
use mailroom::retry::Backoff;
use mailroom::store::MessageQueue;
use mailroom::store::memory::MemoryBackend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn context() -> ClaimContext {
    let pair = PairKey::new("site-1", "alice");
    ClaimContext {
        input_queue: pair.input_queue(),
        output_queue: pair.output_queue(),
        pair,
        worker_id: WorkerId::new("w1"),
        claim_token: ClaimToken::new(),
    }
}

fn response() -> ResponseMessage {
    let request = WorkRequest {
        correlation_id: CorrelationId::new(),
        thread_id: ThreadId::new(),
        project_id: "site-1".into(),
        user_id: "alice".into(),
        instruction: "make it blue".into(),
        source_ref: "/srv/site-1.git".into(),
        received_at: Utc::now(),
    };
    ResponseMessage::failed(&request, ErrorKind::BuildFailure, "exit 1")
}

fn quick() -> Backoff {
    Backoff {
        initial: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts: 3,
    }
}

/// Counts calls and fails them all when `fail` is set.
struct Recording {
    calls: AtomicUsize,
    fail: Option<&'static str>,
}

impl Recording {
    fn new(fail: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl ResponseEmitter for Recording {
    async fn emit(&self, _ctx: &ClaimContext, _response: &ResponseMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail {
            Some(reason) => Err(Error::Other(reason.to_string())),
            None => Ok(()),
        }
    }
}

/// A one-request-per-connection HTTP server answering with `statuses` in
/// turn. Request bodies come out of the returned channel.
async fn webhook_server(statuses: Vec<u16>) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for status in statuses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let body_start = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
            let length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while buf.len() < body_start + length {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = serde_json::from_slice(&buf[body_start..body_start + length]).unwrap();
            let _ = tx.send(body);

            let reply = format!("HTTP/1.1 {status} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
    });
    (url, rx)
}

fn webhook(url: &str) -> WebhookEmitter {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    WebhookEmitter::new(url).with_client(client).with_backoff(quick())
}

#[tokio::test]
async fn queue_emitter_sends_to_the_output_queue() {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = context();
    backend.create_queue(&ctx.output_queue).await.unwrap();
    let response = response();

    QueueEmitter::new(backend.clone())
        .emit(&ctx, &response)
        .await
        .unwrap();

    let sent = backend.pending(&ctx.output_queue).await;
    assert_eq!(sent.len(), 1);
    let back: ResponseMessage = serde_json::from_value(sent[0].clone()).unwrap();
    assert_eq!(back.correlation_id, response.correlation_id);
}

#[tokio::test]
async fn webhook_posts_the_response_with_threading_identifiers() {
    let (url, mut bodies) = webhook_server(vec![204]).await;
    let ctx = context();
    let response = response();

    webhook(&url).emit(&ctx, &response).await.unwrap();

    let body = bodies.recv().await.unwrap();
    assert_eq!(body["projectId"], "site-1");
    assert_eq!(body["userId"], "alice");
    assert_eq!(body["messageId"], strategy::message_id(response.thread_id));
    assert_eq!(body["bodyMarker"], strategy::body_marker(response.thread_id));
    assert_eq!(body["response"]["errorKind"], "build_failure");
    assert_eq!(
        body["response"]["correlationId"],
        serde_json::to_value(response.correlation_id).unwrap()
    );
}

#[tokio::test]
async fn webhook_retries_server_errors() {
    let (url, mut bodies) = webhook_server(vec![503, 200]).await;

    webhook(&url).emit(&context(), &response()).await.unwrap();

    assert!(bodies.recv().await.is_some());
    assert!(bodies.recv().await.is_some());
}

#[tokio::test]
async fn webhook_does_not_retry_a_rejected_payload() {
    let (url, mut bodies) = webhook_server(vec![422, 200]).await;

    let err = webhook(&url).emit(&context(), &response()).await.unwrap_err();
    assert!(err.to_string().contains("422"), "{err}");

    assert!(bodies.recv().await.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bodies.try_recv().is_err(), "rejected payload was retried");
}

#[tokio::test]
async fn fan_out_tries_every_emitter_and_reports_the_first_error() {
    let first = Recording::new(Some("first down"));
    let second = Recording::new(Some("second down"));
    let third = Recording::new(None);
    let fan = FanOut(vec![first.clone(), second.clone(), third.clone()]);

    let err = fan.emit(&context(), &response()).await.unwrap_err();
    assert_eq!(err.to_string(), "first down");
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    assert_eq!(third.calls.load(Ordering::SeqCst), 1);

    let healthy = FanOut(vec![third.clone()]);
    healthy.emit(&context(), &response()).await.unwrap();
    assert_eq!(third.calls.load(Ordering::SeqCst), 2);
}
