#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Task Lifecycle Metrics ====
    pub static ref TASKS_CREATED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("coordinator_tasks_created_total", "Total number of tasks created"),
            &["kind"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref TASK_TRANSITIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "coordinator_task_transitions_total",
                "Total number of applied task state transitions",
            ),
            &["from", "to"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref TASK_OPERATIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "coordinator_task_operations_total",
                "Total number of caller-initiated task operations",
            ),
            &["operation", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Session / Processing Loop Metrics ====
    pub static ref ACTIVE_SESSIONS: IntGauge = {
        let metric = IntGauge::new(
            "coordinator_active_sessions",
            "Number of registered processing sessions",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FRAMES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "coordinator_frames_processed_total",
                "Total number of frames pulled from frame sources",
            ),
            &["kind"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref DETECTIONS_WRITTEN: IntCounter = {
        let metric = IntCounter::new(
            "coordinator_detections_written_total",
            "Total number of detection records persisted",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LOOP_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "coordinator_loop_failures_total",
                "Recoverable and fatal failures observed inside processing loops",
            ),
            &["stage", "outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SINK_WRITE_RETRIES: IntCounter = {
        let metric = IntCounter::new(
            "coordinator_sink_write_retries_total",
            "Total number of retried detection writes",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref DETECTOR_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "coordinator_detector_latency_seconds",
                "Detector inference latency per frame",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["detector"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}
