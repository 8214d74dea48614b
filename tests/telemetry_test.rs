//! Integration tests for telemetry initialization and span helpers.

use mailroom::model::{PairKey, PairState};
use mailroom::telemetry::{TelemetryConfig, init_telemetry, metrics, pair};

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // initialisation in the same binary may return Err, which is fine here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "mailroom-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn pair_span_records_transitions() {
    let key = PairKey::new("site-1", "alice");
    let span = pair::start_pair_span(&key, "worker-1");
    pair::record_state_transition(&span, PairState::Claimed, PairState::Processing);
    pair::record_state_transition(&span, PairState::Processing, PairState::Building);
}

#[test]
fn instruments_are_usable_without_a_meter_provider() {
    metrics::claims().add(1, &[]);
    metrics::responses().add(1, &[]);
    metrics::step_duration_ms().record(12.5, &[]);
}
