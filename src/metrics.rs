use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_requests_total", "Total number of pipeline requests by outcome"),
        &["pipeline", "outcome"]
    ).unwrap();

    pub static ref REQUEST_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "gateway_request_duration_seconds",
            "End-to-end pipeline latency in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["pipeline"]
    ).unwrap();

    // Admission metrics
    pub static ref ADMISSION_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("admission_rejections_total", "Requests that found no free slot within the wait limit"),
        &["pipeline"]
    ).unwrap();

    pub static ref SLOTS_IN_FLIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("admission_slots_in_flight", "Admission slots currently held"),
        &["pipeline"]
    ).unwrap();

    // Engine metrics
    pub static ref INFERENCE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Time spent inside the inference session in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["model"]
    ).unwrap();

    pub static ref OCR_PROCESS_TIMEOUTS: IntCounter = IntCounter::new(
        "ocr_process_timeouts_total",
        "External OCR invocations killed at the deadline"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(REQUESTS.clone())).unwrap();
        REGISTRY.register(Box::new(REQUEST_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(ADMISSION_REJECTIONS.clone())).unwrap();
        REGISTRY.register(Box::new(SLOTS_IN_FLIGHT.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(OCR_PROCESS_TIMEOUTS.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe(&self, histogram: &HistogramVec, label: &str) {
        histogram
            .with_label_values(&[label])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
