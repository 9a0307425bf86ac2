//! Anomaly detection over EPA air-quality series.
//!
//! Offline, [`pipeline::Pipeline`] fits cubic splines per site and variable and
//! publishes residuals. Online, [`dispatcher::Dispatcher`] slices a series to
//! a date range and runs one of four detectors over it.

pub mod algo;
pub mod api;
pub mod assemble;
pub mod budget;
pub mod config;
pub mod detectors;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod store;

pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, OverviewRequest};
pub use error::{ConfigError, DetectError, FitError, PipelineError, StoreError};
pub use model::{
    DetectionRequest, DetectionResult, Granularity, Method, MethodParams, PointResult, Reading,
    SeriesKey, Site, Verdict,
};
pub use pipeline::{BatchSummary, Pipeline};
