use crate::assemble::{LineChart, MapMarker, SiteVariable};
use crate::budget::Budget;
use crate::config::DetectionConfig;
use crate::detectors::{DetectionInput, DetectorSet};
use crate::error::DetectError;
use crate::metrics::{DETECT_ERRORS, DETECT_LATENCY, DETECT_REQUESTS};
use crate::model::{
    DetectionRequest, DetectionResult, Granularity, Method, MethodParams, Reading, SeriesKey,
    SiteId, VariableId,
};
use crate::store::{ResidualStore, SeriesStore};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Same request as [`DetectionRequest`] minus the site: run for every site
/// reporting the variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewRequest {
    pub variable_id: VariableId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub granularity: Granularity,
    pub method: Method,
    #[serde(default)]
    pub params: MethodParams,
}

pub struct Dispatcher {
    series: Arc<dyn SeriesStore>,
    residuals: Arc<dyn ResidualStore>,
    detectors: DetectorSet,
    timeout: Duration,
    overview_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        series: Arc<dyn SeriesStore>,
        residuals: Arc<dyn ResidualStore>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            series,
            residuals,
            detectors: DetectorSet::new(config),
            timeout: config.timeout(),
            overview_timeout: config.overview_timeout(),
        }
    }

    pub fn series_store(&self) -> &Arc<dyn SeriesStore> {
        &self.series
    }

    pub fn detect(&self, request: &DetectionRequest) -> Result<DetectionResult, DetectError> {
        self.detect_with_readings(request).map(|(_, result)| result)
    }

    /// Detection plus the readings it was computed from, aligned one-to-one.
    pub fn detect_with_readings(
        &self,
        request: &DetectionRequest,
    ) -> Result<(Vec<Reading>, DetectionResult), DetectError> {
        let method = request.method.name();
        DETECT_REQUESTS.with_label_values(&[method]).inc();
        let timer = DETECT_LATENCY.with_label_values(&[method]).start_timer();

        let outcome = self.run(request);
        timer.observe_duration();
        if let Err(e) = &outcome {
            DETECT_ERRORS.with_label_values(&[e.kind()]).inc();
            debug!(
                site = %request.site_id,
                variable = %request.variable_id,
                method,
                error = %e,
                "Detection failed."
            );
        }
        outcome
    }

    fn run(&self, request: &DetectionRequest) -> Result<(Vec<Reading>, DetectionResult), DetectError> {
        let range = request.range();
        if !range.is_valid() {
            return Err(DetectError::InvalidRange {
                start: request.start_date,
                end: request.end_date,
            });
        }

        let detector = self.detectors.get(request.method);
        detector.validate(&request.params)?;

        let key = request.key();
        let granularity = request.granularity;
        if !self.series.contains(&key, granularity)? {
            return Err(DetectError::NotFound { key, granularity });
        }

        let budget = Budget::new(self.timeout);
        let readings = self.series.readings(&key, granularity, &range)?;
        if readings.is_empty() {
            return Ok((
                readings,
                DetectionResult::empty(key, granularity, request.method),
            ));
        }
        let residuals = if request.method.requires_residuals() {
            self.residuals.residuals(&key, granularity, &range)?
        } else {
            Vec::new()
        };
        budget.check()?;

        let points = detector.detect(&DetectionInput {
            key: &key,
            granularity,
            readings: &readings,
            residuals: &residuals,
            params: &request.params,
            budget: &budget,
        })?;

        let aligned = points.len() == readings.len()
            && points
                .iter()
                .zip(&readings)
                .all(|(p, r)| p.timestamp == r.timestamp);
        if !aligned {
            return Err(DetectError::LengthMismatch {
                method: request.method,
                expected: readings.len(),
                actual: points.len(),
            });
        }

        let result = DetectionResult {
            key,
            granularity,
            method: request.method,
            points,
        };
        debug!(
            site = %request.site_id,
            variable = %request.variable_id,
            method = request.method.name(),
            points = result.len(),
            outliers = result.outlier_count(),
            "Detection complete."
        );
        Ok((readings, result))
    }

    pub fn chart(&self, request: &DetectionRequest) -> Result<LineChart, DetectError> {
        let (readings, result) = self.detect_with_readings(request)?;
        Ok(LineChart::assemble(&readings, &result))
    }

    /// One marker per catalogued site reporting the variable. Sites with too
    /// little data get an "insufficient data" marker; pairs that vanish
    /// between listing and reading are skipped.
    pub fn overview(&self, request: &OverviewRequest) -> Result<Vec<MapMarker>, DetectError> {
        if request.start_date > request.end_date {
            return Err(DetectError::InvalidRange {
                start: request.start_date,
                end: request.end_date,
            });
        }
        self.detectors.get(request.method).validate(&request.params)?;
        let budget = Budget::new(self.overview_timeout);
        let sites = self
            .series
            .sites_for_variable(&request.variable_id, request.granularity)?;

        let mut markers = Vec::with_capacity(sites.len());
        for site_id in sites {
            budget.check()?;
            let Some(site) = self.series.site(&site_id)? else {
                debug!(site = %site_id, "Site missing from catalogue; skipped.");
                continue;
            };
            let key = SeriesKey {
                site_id,
                variable_id: request.variable_id.clone(),
            };
            let detection = DetectionRequest::new(&key, request.start_date, request.end_date, request.method)
                .with_granularity(request.granularity)
                .with_params(request.params.clone());
            match self.detect(&detection) {
                Ok(result) => markers.push(MapMarker::from_result(&site, &result)),
                Err(DetectError::InsufficientData { .. }) => markers.push(MapMarker::insufficient(&site)),
                Err(DetectError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(markers)
    }

    /// Variables recorded at a site, labelled for the chart checklist.
    /// `None` when the site is neither catalogued nor has any series.
    pub fn site_variables(
        &self,
        site_id: &SiteId,
        granularity: Granularity,
    ) -> Result<Option<Vec<SiteVariable>>, DetectError> {
        let variables = self.series.variables_for_site(site_id, granularity)?;
        if variables.is_empty() && self.series.site(site_id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(variables.into_iter().map(SiteVariable::new).collect()))
    }
}
