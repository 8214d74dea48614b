//! Metric instrument factories for mailroom.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"mailroom"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("mailroom")
}

/// Counter: ownership registry outcomes.
/// Labels: `result` ("acquired" | "already_owned" | "renewed" | "renew_rejected" | "released" | "release_rejected").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.claims")
        .with_description("Ownership registry operations by outcome")
        .build()
}

/// Counter: dispatcher routing decisions.
/// Labels: `route` ("owned" | "unclaimed" | "dead_letter").
pub fn dispatch() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.dispatch")
        .with_description("Inbound messages routed by the dispatcher")
        .build()
}

/// Counter: per-pair state machine transitions.
/// Labels: `from`, `to`.
pub fn pair_transitions() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.pair.transitions")
        .with_description("Number of pair state transitions")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: responses produced.
/// Labels: `success`, `error_kind`.
pub fn responses() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.responses")
        .with_description("Responses produced for work requests")
        .build()
}

/// Histogram: pipeline step duration in milliseconds.
/// Labels: `step`.
pub fn step_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("mailroom.step.duration_ms")
        .with_description("Pipeline step duration in milliseconds")
        .with_unit("ms")
        .build()
}
