//! Process-wide prometheus metrics, registered on first use with the default
//! registry.

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

pub static DETECT_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("aqs_detect_requests_total", "Detection requests by method"),
        &["method"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("aqs_detect_errors_total", "Failed detection requests by error kind"),
        &["kind"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new("aqs_detect_duration_seconds", "Detection latency by method")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        &["method"],
    )
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static PIPELINE_UNITS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("aqs_pipeline_units_total", "Spline fit units by outcome"),
        &["granularity", "outcome"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static PIPELINE_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("aqs_pipeline_records_total", "Residual records written"),
        &["granularity"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

/// Force registration so `/metrics` lists every family from the start.
pub fn init() {
    let _ = &*DETECT_REQUESTS;
    let _ = &*DETECT_ERRORS;
    let _ = &*DETECT_LATENCY;
    let _ = &*PIPELINE_UNITS;
    let _ = &*PIPELINE_RECORDS;
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
