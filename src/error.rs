use crate::model::{Granularity, Method, SeriesKey};
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised on the online detection path.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("no {granularity} data for {key}")]
    NotFound { key: SeriesKey, granularity: Granularity },

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("{method} needs at least {required} observed points, got {actual}")]
    InsufficientData {
        method: Method,
        required: usize,
        actual: usize,
    },

    #[error("invalid {method} parameters: {reason}")]
    InvalidParams { method: Method, reason: String },

    #[error("detection exceeded its time budget of {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    #[error("{method} returned {actual} points for {expected} readings")]
    LengthMismatch {
        method: Method,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DetectError {
    /// Short machine-readable kind, used for metrics labels and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidRange { .. } => "invalid_range",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Timeout { .. } => "timeout",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::Store(_) => "store",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt partition {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("site catalogue error: {0}")]
    Catalogue(#[from] serde_json::Error),

    #[error("residual run already published")]
    AlreadyPublished,
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Why a single spline window could not be fitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("too few points: need {required}, got {actual}")]
    TooFewPoints { required: usize, actual: usize },

    #[error("singular normal equations (pivot {pivot} at column {column})")]
    Singular { column: usize, pivot: f64 },

    #[error("non-finite value in fit input or output")]
    NonFinite,
}

/// Run-level pipeline failures. Per-unit problems are reported as outcomes.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker pool failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
