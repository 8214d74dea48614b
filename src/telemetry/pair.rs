//! Span helpers for owned pairs.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{PairKey, PairState};
use crate::telemetry::metrics;

/// Start the span that wraps a pair's whole ownership on this worker.
///
/// `pair.state` is declared empty and updated by [`record_state_transition`].
pub fn start_pair_span(pair: &PairKey, worker_id: &str) -> Span {
    tracing::info_span!(
        "pair.run",
        "pair.project" = %pair.project_id,
        "pair.user" = %pair.user_id,
        "worker.id" = worker_id,
        "pair.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the pair span and count it.
pub fn record_state_transition(span: &Span, from: PairState, to: PairState) {
    span.record("pair.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
    metrics::pair_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
