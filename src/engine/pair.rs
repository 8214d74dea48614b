//! Pair runner: the per-pair state machine.
//!
//! One task per owned pair. Requests run strictly one at a time through
//! edit, build, deploy and commit. While the current request can still be
//! interrupted the runner keeps reading its input queue. Requests wait in a
//! FIFO backlog; when the one at its head belongs to the same thread, it
//! supersedes the running request.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::Runtime;
use super::event::EventKind;
use super::lease::spawn_lease_keeper;
use super::steps::EditOutcome;
use crate::deploy::DeploymentRef;
use crate::dispatch::request_claim;
use crate::error::{Error, Result};
use crate::model::*;
use crate::resolver::strategy;
use crate::retry::with_backoff;
use crate::store::{self, QueueMessage};
use crate::telemetry::metrics;
use crate::telemetry::pair::{record_state_transition, start_pair_span};

/// A work message this runner has read and not yet answered.
#[derive(Debug, Clone)]
struct Pending {
    msg_id: i64,
    request: WorkRequest,
}

/// How a runner ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Released,
    LeaseLost,
}

/// Why a request stopped short of success.
enum Halt {
    /// A step failed; answer with this and return to `Processing`.
    Failed(ResponseMessage),
    /// A newer request for the same thread arrived.
    Superseded(Pending),
    /// Lease lost, or a runner fault.
    Error(Error),
}

impl From<Error> for Halt {
    fn from(e: Error) -> Self {
        Halt::Error(e)
    }
}

/// Owned inputs for one step, so step futures never borrow the runner.
#[derive(Clone)]
struct StepCall {
    runtime: Arc<Runtime>,
    ctx: ClaimContext,
    request: WorkRequest,
    cancel: CancellationToken,
}

impl StepCall {
    async fn edit(self) -> Result<(PathBuf, EditOutcome)> {
        let pipeline = &self.runtime.pipeline;
        let branch = self.request.branch_name();
        let workspace = pipeline
            .workspaces
            .prepare(&self.ctx, &self.request.source_ref, &branch)
            .await?;
        let outcome = pipeline
            .editor
            .edit(&self.ctx, &workspace, &self.request, &self.cancel)
            .await?;
        Ok((workspace, outcome))
    }

    async fn build(self, workspace: PathBuf) -> Result<PathBuf> {
        self.runtime
            .pipeline
            .builder
            .build(&self.ctx, &workspace, &self.request, &self.cancel)
            .await
    }

    async fn deploy(self, artifact: PathBuf) -> Result<DeploymentRef> {
        self.checkpoint()?;
        self.runtime.pipeline.sink.publish(&self.ctx.pair, &artifact).await
    }

    async fn commit(self, workspace: PathBuf, message: String) -> Result<()> {
        self.checkpoint()?;
        self.runtime
            .pipeline
            .workspaces
            .commit(&self.ctx, &workspace, &self.request.branch_name(), &message)
            .await
    }

    /// Nothing irreversible happens after cancellation.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn commit_message(request: &WorkRequest, summary: &str) -> String {
    let title = summary.lines().next().unwrap_or_default().trim();
    let title = if title.is_empty() { "Apply requested changes" } else { title };
    format!(
        "{title}\n\nCorrelation-Id: {}\n{}",
        request.correlation_id,
        strategy::body_marker(request.thread_id)
    )
}

/// Deliver responses in the order they were produced, off the state
/// machine's path.
fn spawn_outbox(
    runtime: Arc<Runtime>,
    ctx: ClaimContext,
    mut rx: mpsc::UnboundedReceiver<ResponseMessage>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = runtime.pipeline.emitter.emit(&ctx, &response).await {
                    error!(
                        correlation_id = %response.correlation_id,
                        error = %e,
                        "response emission failed"
                    );
                }
            }
        }
        .instrument(Span::current()),
    )
}

pub(crate) struct PairRunner {
    runtime: Arc<Runtime>,
    ctx: ClaimContext,
    /// Repository of the most recent request, for re-posted claims.
    source_ref: String,
    state: PairState,
    span: Span,
    lease_lost: CancellationToken,
    shutdown: CancellationToken,
    backlog: VecDeque<Pending>,
    /// Read and unanswered messages, by message id.
    held: HashMap<i64, CorrelationId>,
    last_activity: Instant,
    idle_since: Option<Instant>,
    outbox: mpsc::UnboundedSender<ResponseMessage>,
    outbox_rx: Option<mpsc::UnboundedReceiver<ResponseMessage>>,
}

impl PairRunner {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        ctx: ClaimContext,
        source_ref: String,
        shutdown: CancellationToken,
    ) -> Self {
        let span = start_pair_span(&ctx.pair, ctx.worker_id.as_str());
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            ctx,
            source_ref,
            state: PairState::Claimed,
            span,
            lease_lost: CancellationToken::new(),
            shutdown,
            backlog: VecDeque::new(),
            held: HashMap::new(),
            last_activity: Instant::now(),
            idle_since: None,
            outbox,
            outbox_rx: Some(outbox_rx),
        }
    }

    /// Drive the pair until it is released or its lease is lost.
    pub(crate) async fn run(mut self) -> Exit {
        let span = self.span.clone();
        let stop = CancellationToken::new();
        let keeper = spawn_lease_keeper(
            self.runtime.backends.registry.clone(),
            self.ctx.clone(),
            self.runtime.config.lease,
            self.lease_lost.clone(),
            stop.clone(),
        );
        let outbox = self.outbox_rx.take().map(|rx| {
            let _enter = span.enter();
            spawn_outbox(self.runtime.clone(), self.ctx.clone(), rx)
        });

        let exit = match self.drive().instrument(span.clone()).await {
            Ok(exit) => exit,
            Err(Error::LeaseLost(_)) => self.lose_lease().instrument(span.clone()).await,
            Err(e) => {
                span.in_scope(|| error!(error = %e, "pair runner failed"));
                self.release("runner error").instrument(span.clone()).await
            }
        };

        stop.cancel();
        let _ = keeper.await;
        // Closing the channel lets the outbox drain and finish.
        drop(self);
        if let Some(outbox) = outbox {
            let _ = outbox.await;
        }
        exit
    }

    async fn drive(&mut self) -> Result<Exit> {
        info!(token = %self.ctx.claim_token, "pair claimed");
        loop {
            if self.lease_lost.is_cancelled() {
                return Err(Error::LeaseLost(self.ctx.pair.to_string()));
            }
            if self.shutdown.is_cancelled() {
                return Ok(self.release("shutdown").await);
            }

            let next = match self.backlog.pop_front() {
                Some(pending) => Some(pending),
                None => self.poll().await,
            };

            match next {
                Some(pending) => {
                    self.handle(pending).await?;
                    self.last_activity = Instant::now();
                }
                None => {
                    if let Some(exit) = self.idle_tick().await? {
                        return Ok(exit);
                    }
                    let (lease_lost, shutdown) = (self.lease_lost.clone(), self.shutdown.clone());
                    tokio::select! {
                        _ = tokio::time::sleep(self.runtime.config.poll_interval) => {}
                        _ = lease_lost.cancelled() => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Quiet-time bookkeeping: go idle, then give the pair back.
    async fn idle_tick(&mut self) -> Result<Option<Exit>> {
        let config = &self.runtime.config;
        match self.state {
            PairState::Idle => {
                if self
                    .idle_since
                    .is_some_and(|since| since.elapsed() >= config.release_timeout)
                {
                    return Ok(Some(self.release("idle").await));
                }
            }
            PairState::Claimed | PairState::Ready | PairState::Processing => {
                if self.last_activity.elapsed() >= config.idle_timeout {
                    self.transition(PairState::Idle)?;
                }
            }
            _ => {}
        }
        Ok(None)
    }

    /// Run one request to an answer, following supersessions.
    async fn handle(&mut self, first: Pending) -> Result<()> {
        let mut current = first;
        loop {
            match self.attempt(&current).await {
                Ok(response) => {
                    self.finish(&current, response).await;
                    return Ok(());
                }
                Err(Halt::Failed(response)) => {
                    self.transition(PairState::Processing)?;
                    self.finish(&current, response).await;
                    return Ok(());
                }
                Err(Halt::Superseded(newer)) => {
                    info!(
                        correlation_id = %current.request.correlation_id,
                        superseded_by = %newer.request.correlation_id,
                        "request superseded"
                    );
                    self.transition(PairState::Processing)?;
                    let response =
                        ResponseMessage::superseded(&current.request, newer.request.correlation_id);
                    self.finish(&current, response).await;
                    current = newer;
                }
                Err(Halt::Error(e)) => return Err(e),
            }
        }
    }

    async fn attempt(&mut self, pending: &Pending) -> std::result::Result<ResponseMessage, Halt> {
        let registry = self.runtime.backends.registry.clone();
        match registry.is_owned_by(&self.ctx.pair, &self.ctx.worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.lease_lost.cancel();
                return Err(Error::LeaseLost(self.ctx.pair.to_string()).into());
            }
            Err(e) => warn!(error = %e, "ownership check failed, relying on the lease keeper"),
        }

        let request = &pending.request;
        self.source_ref = request.source_ref.clone();
        debug!(
            correlation_id = %request.correlation_id,
            thread_id = %request.thread_id,
            "processing request"
        );

        let call = StepCall {
            runtime: self.runtime.clone(),
            ctx: self.ctx.clone(),
            request: request.clone(),
            cancel: self.lease_lost.child_token(),
        };
        let cancel = call.cancel.clone();

        self.transition(PairState::Processing)?;
        let (workspace, edit) = self
            .step("edit", ErrorKind::EditFailure, pending, &cancel, call.clone().edit())
            .await?;

        self.transition(PairState::Building)?;
        let artifact = self
            .step("build", ErrorKind::BuildFailure, pending, &cancel, call.clone().build(workspace.clone()))
            .await?;

        self.transition(PairState::Deploying)?;
        let deployment = self
            .step("deploy", ErrorKind::DeployFailure, pending, &cancel, call.clone().deploy(artifact))
            .await?;

        self.transition(PairState::Committing)?;
        let message = commit_message(request, &edit.summary);
        self.step("commit", ErrorKind::CommitFailure, pending, &cancel, call.commit(workspace, message))
            .await?;

        self.transition(PairState::Ready)?;
        Ok(ResponseMessage::succeeded(
            request,
            edit.summary,
            edit.changed_files,
            deployment.to_wire(),
        ))
    }

    /// Run one step under the step timeout, watching for interrupts while
    /// the current state allows them.
    async fn step<T>(
        &mut self,
        name: &'static str,
        failure: ErrorKind,
        current: &Pending,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, Halt> {
        let started = Instant::now();
        let limit = self.runtime.config.step_timeout;
        let interruptible = self.state.is_interruptible();
        let lease_lost = self.lease_lost.clone();
        let work = tokio::time::timeout(limit, work.instrument(tracing::info_span!("pair.step", step = name)));
        tokio::pin!(work);

        let result = tokio::select! {
            biased;
            _ = lease_lost.cancelled() => {
                // The step sees the same cancellation; let it stop cleanly.
                let _ = work.await;
                return Err(Error::LeaseLost(self.ctx.pair.to_string()).into());
            }
            result = &mut work => result,
            newer = self.next_interrupt(current), if interruptible => {
                cancel.cancel();
                let _ = work.await;
                return Err(Halt::Superseded(newer));
            }
        };
        metrics::step_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("step", name)],
        );

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if self.lease_lost.is_cancelled() => {
                Err(Error::LeaseLost(self.ctx.pair.to_string()).into())
            }
            Ok(Err(e)) => {
                let kind = match e.kind() {
                    ErrorKind::Internal => failure,
                    kind => kind,
                };
                warn!(step = name, %kind, error = %e, "step failed");
                Err(Halt::Failed(ResponseMessage::failed(&current.request, kind, e.to_string())))
            }
            Err(_) => {
                cancel.cancel();
                let e = Error::Timeout(limit);
                warn!(step = name, error = %e, "step timed out");
                Err(Halt::Failed(ResponseMessage::failed(&current.request, e.kind(), format!("{name} {e}"))))
            }
        }
    }

    /// Resolves with a newer request for the current thread, as long as
    /// nothing read before it is still waiting. Requests for other threads
    /// go to the backlog; once one of them is at its head the current request
    /// is left to finish.
    async fn next_interrupt(&mut self, current: &Pending) -> Pending {
        let thread = current.request.thread_id;
        loop {
            match self.backlog.front().map(|p| p.request.thread_id == thread) {
                Some(true) => {
                    if let Some(newer) = self.backlog.pop_front() {
                        return newer;
                    }
                }
                Some(false) => std::future::pending::<()>().await,
                None => {}
            }
            tokio::time::sleep(self.runtime.config.poll_interval).await;
            while let Some(pending) = self.poll().await {
                debug!(
                    correlation_id = %pending.request.correlation_id,
                    thread_id = %pending.request.thread_id,
                    "request queued behind the current one"
                );
                self.backlog.push_back(pending);
            }
        }
    }

    /// Read the next new request from the input queue, if any.
    async fn poll(&mut self) -> Option<Pending> {
        let queue = self.runtime.backends.queue.clone();
        loop {
            let msg = match queue
                .read(&self.ctx.input_queue, self.runtime.config.work_visibility)
                .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) => return None,
                Err(e) => {
                    warn!(queue = %self.ctx.input_queue, error = %e, "input queue read failed");
                    return None;
                }
            };
            if self.held.contains_key(&msg.msg_id) {
                continue;
            }
            if let Some(pending) = self.admit(msg).await {
                self.held.insert(pending.msg_id, pending.request.correlation_id);
                return Some(pending);
            }
        }
    }

    /// Parse and deduplicate a freshly read message.
    async fn admit(&self, msg: QueueMessage) -> Option<Pending> {
        let request: WorkRequest = match serde_json::from_value(msg.message.clone()) {
            Ok(request) => request,
            Err(e) => {
                self.discard(msg, format!("malformed work message: {e}")).await;
                return None;
            }
        };
        if request.pair() != self.ctx.pair {
            self.discard(msg, format!("work message for pair {}", request.pair()))
                .await;
            return None;
        }
        if self.held.values().any(|id| *id == request.correlation_id) {
            debug!(correlation_id = %request.correlation_id, "duplicate of a held request");
            self.archive(msg.msg_id).await;
            return None;
        }
        match self
            .runtime
            .backends
            .responses
            .find_response(request.correlation_id)
            .await
        {
            Ok(Some(_)) => {
                info!(correlation_id = %request.correlation_id, "already answered, dropping redelivery");
                self.archive(msg.msg_id).await;
                return None;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "response log lookup failed, processing anyway"),
        }
        Some(Pending {
            msg_id: msg.msg_id,
            request,
        })
    }

    async fn discard(&self, msg: QueueMessage, reason: String) {
        warn!(msg_id = msg.msg_id, %reason, "dead-lettering work message");
        let queue = self.runtime.backends.queue.as_ref();
        match store::dead_letter(queue, &self.ctx.input_queue, reason, msg.message).await {
            Ok(_) => self.archive(msg.msg_id).await,
            Err(e) => error!(msg_id = msg.msg_id, error = %e, "dead-letter failed, leaving message queued"),
        }
    }

    async fn archive(&self, msg_id: i64) {
        let queue = self.runtime.backends.queue.as_ref();
        let input = &self.ctx.input_queue;
        if let Err(e) =
            with_backoff(&self.runtime.config.backoff, "archive", || queue.archive(input, msg_id)).await
        {
            warn!(msg_id, error = %e, "archive failed, message will be redelivered");
        }
    }

    /// Record, emit and archive. The response log comes first so a
    /// redelivery of this message is recognised as answered.
    async fn finish(&mut self, pending: &Pending, response: ResponseMessage) {
        self.held.remove(&pending.msg_id);

        let responses = self.runtime.backends.responses.as_ref();
        if let Err(e) = with_backoff(&self.runtime.config.backoff, "record_response", || {
            responses.record_response(&response)
        })
        .await
        {
            error!(correlation_id = %response.correlation_id, error = %e, "could not record response");
        }

        let error_kind = response.error_kind.map(ErrorKind::as_str).unwrap_or("none");
        metrics::responses().add(
            1,
            &[
                KeyValue::new("success", response.success),
                KeyValue::new("error_kind", error_kind),
            ],
        );
        self.runtime.events.emit(EventKind::RequestCompleted {
            pair: self.ctx.pair.clone(),
            correlation_id: response.correlation_id,
            success: response.success,
            error_kind: response.error_kind,
        });
        info!(
            correlation_id = %response.correlation_id,
            success = response.success,
            error_kind,
            "request answered"
        );

        if self.outbox.send(response).is_err() {
            error!("response outbox closed");
        }
        self.archive(pending.msg_id).await;
    }

    fn transition(&mut self, to: PairState) -> Result<()> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.idle_since = (to == PairState::Idle).then(Instant::now);
        record_state_transition(&self.span, from, to);
        self.runtime.events.emit(EventKind::StateTransition {
            pair: self.ctx.pair.clone(),
            from,
            to,
        });
        Ok(())
    }

    /// Make every read but unanswered message visible again, so whoever
    /// owns the pair next sees it straight away.
    async fn hand_back(&mut self) {
        self.backlog.clear();
        let queue = self.runtime.backends.queue.as_ref();
        let input = &self.ctx.input_queue;
        let mut held: Vec<i64> = self.held.drain().map(|(msg_id, _)| msg_id).collect();
        held.sort_unstable();
        for msg_id in held {
            match queue.set_visibility(input, msg_id, Duration::ZERO).await {
                Ok(()) => debug!(msg_id, "unanswered message handed back"),
                Err(e) => warn!(msg_id, error = %e, "could not hand back message, it reappears after its visibility timeout"),
            }
        }
    }

    /// Give the pair back. Work still queued gets a fresh claim request so
    /// it is not stranded.
    async fn release(&mut self, reason: &str) -> Exit {
        if let Err(e) = self.transition(PairState::Released) {
            warn!(error = %e, "unexpected state at release");
        }
        self.hand_back().await;
        let backoff = &self.runtime.config.backoff;
        let registry = self.runtime.backends.registry.as_ref();
        match with_backoff(backoff, "release", || registry.release(&self.ctx)).await {
            Ok(true) => info!(reason, "pair released"),
            Ok(false) => warn!(reason, "claim was already gone at release"),
            Err(e) => warn!(reason, error = %e, "release failed, the lease will lapse"),
        }
        self.runtime.events.emit(EventKind::PairReleased {
            pair: self.ctx.pair.clone(),
            worker_id: self.ctx.worker_id.clone(),
        });

        let queue = self.runtime.backends.queue.as_ref();
        match queue.queue_length(&self.ctx.input_queue).await {
            Ok(0) => {}
            Ok(pending) => {
                let pair = &self.ctx.pair;
                let source_ref = &self.source_ref;
                match with_backoff(backoff, "request_claim", || request_claim(queue, pair, source_ref)).await {
                    Ok(_) => info!(pending, "work still queued, claim re-requested"),
                    Err(e) => error!(pending, error = %e, "could not re-request claim for queued work"),
                }
            }
            Err(e) => warn!(error = %e, "could not check for queued work after release"),
        }
        Exit::Released
    }

    /// Stop without touching the claim or the requester. Unanswered
    /// messages go back to the queue for the pair's next owner.
    async fn lose_lease(&mut self) -> Exit {
        self.lease_lost.cancel();
        if let Err(e) = self.transition(PairState::Released) {
            warn!(error = %e, "unexpected state at lease loss");
        }
        warn!(held = self.held.len(), "lease lost, abandoning pair");
        self.hand_back().await;
        self.runtime.events.emit(EventKind::LeaseLost {
            pair: self.ctx.pair.clone(),
            worker_id: self.ctx.worker_id.clone(),
        });
        Exit::LeaseLost
    }
}
