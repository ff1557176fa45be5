use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PODS_EVICTED_TOTAL: IntCounter = IntCounter::new(
        "verify_pods_evicted_total",
        "Pods deleted because they could not pull their image."
    )
    .unwrap();
    pub static ref POD_EVICTION_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "verify_pod_eviction_failures_total",
        "Pod deletions that failed."
    )
    .unwrap();
    pub static ref STATUS_TRANSITIONS_TOTAL: IntCounter = IntCounter::new(
        "verify_status_transitions_total",
        "Pod status changes observed."
    )
    .unwrap();
    pub static ref READY_PODS: IntGauge =
        IntGauge::new("verify_ready_pods", "Pods currently counted as ready.").unwrap();
    pub static ref POLL_TICKS_TOTAL: IntCounter =
        IntCounter::new("verify_poll_ticks_total", "Poll loop iterations.").unwrap();
}

// Registering twice returns an error which is safe to ignore.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(PODS_EVICTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(POD_EVICTION_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STATUS_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(READY_PODS.clone()));
    let _ = REGISTRY.register(Box::new(POLL_TICKS_TOTAL.clone()));
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        register_metrics();
        register_metrics();
        PODS_EVICTED_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("verify_pods_evicted_total"));
        assert!(text.contains("verify_ready_pods"));
    }
}
