//! Shared domain types: sites, variables, readings, residuals and the
//! detection request/response pair.
//!
//! Everything in here is plain data. Stores own readings and residuals,
//! the dispatcher builds results.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// EPA AQS site identifier (state code + county code + site number).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Measurement identifier: an EPA parameter code (`88101`) or a short
/// variable name (`PM2.5 FRM`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableId(pub String);

impl VariableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Catalogue entry for this id, if it is one of the known variables.
    pub fn info(&self) -> Option<&'static VariableInfo> {
        VARIABLES
            .iter()
            .find(|v| v.name == self.0 || v.codes.contains(&self.0.as_str()))
    }

    /// English label for charts; unknown ids are shown verbatim.
    pub fn label(&self) -> &str {
        self.info().map(|v| v.label).unwrap_or(&self.0)
    }

    /// Multiplier applied to the density-clustering radius.
    pub fn density_factor(&self) -> f64 {
        self.info().map(|v| v.density_factor).unwrap_or(1.0)
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static description of one of the monitored variables.
#[derive(Debug)]
pub struct VariableInfo {
    pub name: &'static str,
    pub label: &'static str,
    /// EPA parameter codes reported under this variable.
    pub codes: &'static [&'static str],
    /// Heavy-tailed variables (particulates, VOCs) get a wider radius so that
    /// routine plumes are not flagged; smooth meteorological series a tighter one.
    pub density_factor: f64,
}

pub const VARIABLES: [VariableInfo; 16] = [
    VariableInfo { name: "AQI", label: "Air Quality Index", codes: &[], density_factor: 1.2 },
    VariableInfo { name: "CO", label: "Carbon Monoxide", codes: &["42101"], density_factor: 1.2 },
    VariableInfo { name: "NO2", label: "Nitrogen Dioxide", codes: &["42602"], density_factor: 1.1 },
    VariableInfo { name: "Ozone", label: "Ozone", codes: &["44201"], density_factor: 1.0 },
    VariableInfo {
        name: "PM10",
        label: "Particulate Matter <10 microns",
        codes: &["81102"],
        density_factor: 1.3,
    },
    VariableInfo {
        name: "PM2.5 FRM",
        label: "Particulate Matter <2.5 microns (FRM)",
        codes: &["88101"],
        density_factor: 1.3,
    },
    VariableInfo {
        name: "PM2.5 non-FRM",
        label: "Particulate Matter <2.5 microns (non-FRM)",
        codes: &["88502"],
        density_factor: 1.3,
    },
    VariableInfo {
        name: "PMc",
        label: "Particulate Matter Coarse Fraction",
        codes: &["86101"],
        density_factor: 1.3,
    },
    VariableInfo { name: "SO2", label: "Sulfur Dioxide", codes: &["42401"], density_factor: 1.2 },
    VariableInfo { name: "HAPs", label: "Hazardous Air Pollutants", codes: &[], density_factor: 1.4 },
    VariableInfo { name: "VOCs", label: "Volatile Organic Compounds", codes: &[], density_factor: 1.4 },
    VariableInfo {
        name: "NONOxNOy",
        label: "Nitrous oxides concentration (ppb)",
        codes: &["42601", "42603", "42600"],
        density_factor: 1.1,
    },
    VariableInfo { name: "Temperature", label: "Temperature", codes: &["62101"], density_factor: 0.8 },
    VariableInfo { name: "Pressure", label: "Barometric Pressure", codes: &["64101"], density_factor: 0.8 },
    VariableInfo {
        name: "RH_DP",
        label: "Relative Humidity / Dew Point",
        codes: &["62201", "62103"],
        density_factor: 0.9,
    },
    VariableInfo { name: "Wind", label: "Wind", codes: &["61101", "61102", "61103", "61104"], density_factor: 1.0 },
];

/// A (site, variable) pair: the unit of partitioning for every store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub site_id: SiteId,
    pub variable_id: VariableId,
}

impl SeriesKey {
    pub fn new(site_id: impl Into<String>, variable_id: impl Into<String>) -> Self {
        Self {
            site_id: SiteId::new(site_id),
            variable_id: VariableId::new(variable_id),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site_id, self.variable_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    #[default]
    Daily,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Hourly, Granularity::Daily];

    /// Directory name used by the on-disk layout.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ============================================================================
// REFERENCE DATA
// ============================================================================

/// A fixed EPA monitoring location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: SiteId,
    pub latitude: f64,
    pub longitude: f64,
    pub state_code: String,
    pub county_code: String,
    pub site_number: String,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub county_name: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
}

impl Site {
    pub fn new(
        state_code: &str,
        county_code: &str,
        site_number: &str,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            site_id: Self::compose_id(state_code, county_code, site_number),
            latitude,
            longitude,
            state_code: state_code.to_string(),
            county_code: county_code.to_string(),
            site_number: site_number.to_string(),
            state_name: None,
            county_name: None,
            city_name: None,
        }
    }

    /// Site ids are the plain concatenation of the three AQS codes.
    pub fn compose_id(state_code: &str, county_code: &str, site_number: &str) -> SiteId {
        SiteId(format!("{}{}{}", state_code, county_code, site_number))
    }
}

// ============================================================================
// READINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadingFlag {
    #[default]
    Raw,
    Valid,
    /// Explicit gap marker: the slot exists but carries no measurement.
    Missing,
}

impl ReadingFlag {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Valid => 1,
            Self::Missing => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Raw),
            1 => Some(Self::Valid),
            2 => Some(Self::Missing),
            _ => None,
        }
    }
}

/// One measurement slot of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub site_id: SiteId,
    pub variable_id: VariableId,
    pub timestamp: NaiveDateTime,
    pub value: f64,
    pub flag: ReadingFlag,
}

impl Reading {
    pub fn new(key: &SeriesKey, timestamp: NaiveDateTime, value: f64) -> Self {
        Self {
            site_id: key.site_id.clone(),
            variable_id: key.variable_id.clone(),
            timestamp,
            value,
            flag: ReadingFlag::Valid,
        }
    }

    pub fn missing(key: &SeriesKey, timestamp: NaiveDateTime) -> Self {
        Self {
            site_id: key.site_id.clone(),
            variable_id: key.variable_id.clone(),
            timestamp,
            value: f64::NAN,
            flag: ReadingFlag::Missing,
        }
    }

    /// The measured value, or `None` for gap markers and non-finite values.
    pub fn observed(&self) -> Option<f64> {
        if self.flag == ReadingFlag::Missing || !self.value.is_finite() {
            None
        } else {
            Some(self.value)
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Range covering every representable date.
    pub fn unbounded() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn contains(&self, timestamp: &NaiveDateTime) -> bool {
        let d = timestamp.date();
        d >= self.start && d <= self.end
    }

    pub fn contains_year(&self, year: i32) -> bool {
        year >= self.start.year() && year <= self.end.year()
    }
}

// ============================================================================
// PRECOMPUTED RESIDUALS
// ============================================================================

/// Residual of one observed reading against its window's spline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRecord {
    pub site_id: SiteId,
    pub variable_id: VariableId,
    pub timestamp: NaiveDateTime,
    /// observed − fitted
    pub residual: f64,
    /// Per-point fit error used as the anomaly score.
    pub local_error: f64,
}

/// A fitted smoothing spline over one window (a day or the full span).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineFit {
    pub key: SeriesKey,
    pub granularity: Granularity,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    /// Interior knots on the unit interval.
    pub knots: Vec<f64>,
    pub coefficients: Vec<f64>,
    pub degree: usize,
    /// Number of observed readings the fit was computed from.
    pub points: usize,
    pub mse: f64,
}

impl SplineFit {
    /// Fitted value at `position` in `[0, 1]` (sample order within the window).
    pub fn evaluate_at(&self, position: f64) -> f64 {
        let basis = crate::algo::bspline::BSplineBasis::new(&self.knots, self.degree);
        basis.evaluate(position, &self.coefficients)
    }

    /// Fitted value for the `index`-th of the window's `points` readings.
    pub fn evaluate_sample(&self, index: usize) -> f64 {
        self.evaluate_at(crate::algo::bspline::sample_position(index, self.points))
    }
}

// ============================================================================
// DETECTION REQUEST / RESULT
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    DensityClustering = 0,
    DriftDetection = 1,
    AutoregressiveResidual = 2,
    SplineResidual = 3,
}

pub const NUM_METHODS: usize = 4;

impl Method {
    pub const ALL: [Method; NUM_METHODS] = [
        Method::DensityClustering,
        Method::DriftDetection,
        Method::AutoregressiveResidual,
        Method::SplineResidual,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DensityClustering => "density_clustering",
            Self::DriftDetection => "drift_detection",
            Self::AutoregressiveResidual => "autoregressive_residual",
            Self::SplineResidual => "spline_residual",
        }
    }

    /// Whether the method reads the precomputed residual store.
    pub fn requires_residuals(&self) -> bool {
        matches!(self, Self::SplineResidual)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Overrides for the density-clustering detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityParams {
    pub eps: Option<f64>,
    pub min_samples: Option<usize>,
    pub time_weight: Option<f64>,
}

/// Overrides for the CUSUM detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftParams {
    pub reference_mean: Option<f64>,
    pub reference_std: Option<f64>,
    pub slack_sigmas: Option<f64>,
    pub threshold_sigmas: Option<f64>,
}

/// Overrides for the autoregressive detector. Supplying `coefficients`
/// skips fitting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoregressiveParams {
    pub order: Option<usize>,
    pub min_points: Option<usize>,
    pub sigma_multiplier: Option<f64>,
    pub coefficients: Option<Vec<f64>>,
    pub mean: Option<f64>,
}

/// How the spline-residual detector turns local errors into flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum SplineThreshold {
    Static(f64),
    Quantile(f64),
    ZScore(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineParams {
    pub threshold: Option<SplineThreshold>,
    pub min_points: Option<usize>,
}

/// Per-method parameters, handed to the detector untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodParams {
    pub density: Option<DensityParams>,
    pub drift: Option<DriftParams>,
    pub autoregressive: Option<AutoregressiveParams>,
    pub spline: Option<SplineParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRequest {
    pub site_id: SiteId,
    pub variable_id: VariableId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub granularity: Granularity,
    pub method: Method,
    #[serde(default)]
    pub params: MethodParams,
}

impl DetectionRequest {
    pub fn new(key: &SeriesKey, start_date: NaiveDate, end_date: NaiveDate, method: Method) -> Self {
        Self {
            site_id: key.site_id.clone(),
            variable_id: key.variable_id.clone(),
            start_date,
            end_date,
            granularity: Granularity::Daily,
            method,
            params: MethodParams::default(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_params(mut self, params: MethodParams) -> Self {
        self.params = params;
        self
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            site_id: self.site_id.clone(),
            variable_id: self.variable_id.clone(),
        }
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Inlier,
    Outlier,
    /// No judgement possible (missing value, no precomputed fit, warm-up).
    NotEvaluable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResult {
    pub timestamp: NaiveDateTime,
    pub verdict: Verdict,
    pub score: Option<f64>,
}

impl PointResult {
    pub fn inlier(timestamp: NaiveDateTime, score: f64) -> Self {
        Self { timestamp, verdict: Verdict::Inlier, score: Some(score) }
    }

    pub fn outlier(timestamp: NaiveDateTime, score: f64) -> Self {
        Self { timestamp, verdict: Verdict::Outlier, score: Some(score) }
    }

    pub fn not_evaluable(timestamp: NaiveDateTime) -> Self {
        Self { timestamp, verdict: Verdict::NotEvaluable, score: None }
    }

    pub fn is_outlier(&self) -> bool {
        self.verdict == Verdict::Outlier
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub key: SeriesKey,
    pub granularity: Granularity,
    pub method: Method,
    pub points: Vec<PointResult>,
}

impl DetectionResult {
    pub fn empty(key: SeriesKey, granularity: Granularity, method: Method) -> Self {
        Self { key, granularity, method, points: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn outliers(&self) -> impl Iterator<Item = &PointResult> {
        self.points.iter().filter(|p| p.is_outlier())
    }

    pub fn outlier_count(&self) -> usize {
        self.outliers().count()
    }

    pub fn evaluated_count(&self) -> usize {
        self.points
            .iter()
            .filter(|p| p.verdict != Verdict::NotEvaluable)
            .count()
    }
}
