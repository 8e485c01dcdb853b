//! Prometheus metrics for the orchestration core.
//!
//! Best-effort paths (storage deletes, counter applies, event publishes,
//! cache invalidation, compensations) never fail the caller, so each failure
//! kind gets its own counter instead.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static BEST_EFFORT_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "storage_best_effort_failures_total",
            "Failures swallowed on best-effort paths, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static STORAGE_FALLBACKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "storage_remote_fallbacks_total",
            "Saves that fell back to the staged local copy, by failing provider",
        ),
        &["provider"],
    )
    .expect("metric creation failed")
});

pub static DEDUP_HITS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "storage_dedup_hits_total",
            "Uploads resolved to an existing copy, by mode (sync/deferred)",
        ),
        &["mode"],
    )
    .expect("metric creation failed")
});

pub static UPLOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("storage_uploads_total", "Uploads by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static EVENTS_PUBLISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "storage_events_published_total",
            "Events published, by delivery mode",
        ),
        &["mode"],
    )
    .expect("metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "storage_background_queue_depth",
        "Background jobs submitted but not yet finished",
    )
    .expect("metric creation failed")
});

pub static QUEUE_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "storage_background_queue_rejections_total",
            "Background jobs refused because the queue was full or closed",
        ),
        &["job"],
    )
    .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "storage_upload_duration_seconds",
            "Time from upload receipt to acknowledgement",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(BEST_EFFORT_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STORAGE_FALLBACKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DEDUP_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EVENTS_PUBLISHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUEUE_REJECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// GET /_internal/metrics
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count a swallowed failure on a best-effort path.
pub fn record_best_effort_failure(kind: &str) {
    BEST_EFFORT_FAILURES.with_label_values(&[kind]).inc();
}
