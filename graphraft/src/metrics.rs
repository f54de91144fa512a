//! Metrics collection module for the replicated stores
//!
//! This module provides functionality for collecting and exposing service metrics
//! using Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Counter for tracking failed requests by method and error kind
    pub static ref ERR_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("request_error_counter", "request error counter"),
        &["method", "kind"]
    )
    .unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Cache invalidations dropped because the event channel was full
    pub static ref CACHE_DROPPED_COUNTER: CounterVec = CounterVec::new(
        Opts::new("cache_invalidation_dropped", "dropped cache invalidations"),
        &["store"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ERR_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CACHE_DROPPED_COUNTER.clone()));
}

/// Records metrics for an async operation
///
/// Counts the call, measures how long `handler` takes and counts the error
/// kind if it fails.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());
    if let Err(e) = &result {
        ERR_COUNTER_VEC
            .with_label_values(&[method_name, error_kind(e)])
            .inc();
    }

    result
}

fn error_kind(e: &crate::Error) -> &'static str {
    use crate::Error;
    match e {
        Error::Configuration(_) => "configuration",
        Error::Startup(_) => "startup",
        Error::NotLeader { .. } => "not_leader",
        Error::Busy => "busy",
        Error::Timeout(_) => "timeout",
        Error::Apply(_) => "apply",
        Error::ConsensusFatal(_) => "fatal",
        Error::Stopped => "stopped",
    }
}
