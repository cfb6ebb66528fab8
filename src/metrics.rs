// Prometheus metrics for the quota relay
//
// Exposes metrics on /metrics HTTP endpoint:
// - Admission grants and denials (counter, denials labelled by bucket)
// - Invocation outcomes and durations (counter / histogram by terminal state)
// - Pending correlation entries (gauge)
// - Response channel traffic and malformed frames (counter)
// - Relay send and bucket correction failures (counter)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSION_GRANTED_TOTAL: IntCounter = IntCounter::new(
        "relay_admission_granted_total",
        "Total number of admission grants"
    ).expect("Failed to create admission granted metric");

    pub static ref ADMISSION_DENIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_admission_denied_total", "Total number of rate-limited admission attempts"),
        &["bucket"]
    ).expect("Failed to create admission denied metric");

    // Invocation metrics
    pub static ref INVOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_invocations_total", "Total number of invocations by terminal state"),
        &["state"]
    ).expect("Failed to create invocations metric");

    pub static ref INVOCATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("relay_invocation_duration_seconds", "End-to-end invocation duration in seconds"),
        &["state"]
    ).expect("Failed to create invocation duration metric");

    pub static ref PENDING_ENTRIES: IntGauge = IntGauge::new(
        "relay_pending_entries",
        "Number of entries currently in the correlation table"
    ).expect("Failed to create pending entries metric");

    // Response channel metrics
    pub static ref RESPONSES_RECEIVED_TOTAL: IntCounter = IntCounter::new(
        "relay_responses_received_total",
        "Total number of response envelopes read by the listener"
    ).expect("Failed to create responses received metric");

    pub static ref DUPLICATE_RESPONSES_TOTAL: IntCounter = IntCounter::new(
        "relay_duplicate_responses_total",
        "Total number of responses for already settled entries"
    ).expect("Failed to create duplicate responses metric");

    pub static ref UNKNOWN_RESPONSES_TOTAL: IntCounter = IntCounter::new(
        "relay_unknown_responses_total",
        "Total number of responses for unregistered correlation ids"
    ).expect("Failed to create unknown responses metric");

    pub static ref MALFORMED_FRAMES_TOTAL: IntCounter = IntCounter::new(
        "relay_malformed_frames_total",
        "Total number of malformed frames on the response channel"
    ).expect("Failed to create malformed frames metric");

    // Failure metrics
    pub static ref RELAY_SEND_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "relay_send_failures_total",
        "Total number of envelopes the queue transport rejected"
    ).expect("Failed to create relay send failures metric");

    pub static ref BUCKET_CORRECTION_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "relay_bucket_correction_failures_total",
        "Total number of failed authoritative limit corrections"
    ).expect("Failed to create bucket correction failures metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(ADMISSION_GRANTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_DENIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVOCATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVOCATION_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(PENDING_ENTRIES.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DUPLICATE_RESPONSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNKNOWN_RESPONSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MALFORMED_FRAMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RELAY_SEND_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BUCKET_CORRECTION_FAILURES_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // A second init in the same process fails with AlreadyReg
        let _ = init();
        assert!(init().is_err());
    }

    #[test]
    fn test_admission_metrics() {
        let _ = init();

        ADMISSION_GRANTED_TOTAL.inc();
        ADMISSION_DENIED_TOTAL.with_label_values(&["GET /users/{id}"]).inc();
        assert!(ADMISSION_DENIED_TOTAL.with_label_values(&["GET /users/{id}"]).get() >= 1);

        let text = gather_metrics().unwrap();
        assert!(text.contains("relay_admission_granted_total"));
        assert!(text.contains("relay_admission_denied_total"));
    }

    #[test]
    fn test_pending_gauge() {
        PENDING_ENTRIES.set(3);
        assert_eq!(PENDING_ENTRIES.get(), 3);
        PENDING_ENTRIES.set(0);
    }
}
