use crate::algo::{autoregressive::ArModel, cusum::Cusum, dbscan, stats};
use crate::budget::Budget;
use crate::config::{
    AutoregressiveDefaults, DensityDefaults, DetectionConfig, DriftDefaults, SplineDefaults,
};
use crate::error::DetectError;
use crate::model::{
    Granularity, Method, MethodParams, PointResult, Reading, ResidualRecord, SeriesKey,
    SplineThreshold, NUM_METHODS,
};
use std::collections::HashMap;

// --- Core Abstractions ---

/// Everything a strategy may look at for one request. `readings` is the
/// already-sliced range; `residuals` is empty for methods that do not need
/// the precomputed store.
pub struct DetectionInput<'a> {
    pub key: &'a SeriesKey,
    pub granularity: Granularity,
    pub readings: &'a [Reading],
    pub residuals: &'a [ResidualRecord],
    pub params: &'a MethodParams,
    pub budget: &'a Budget,
}

impl DetectionInput<'_> {
    /// Indices and values of the observed readings.
    fn observed(&self) -> (Vec<usize>, Vec<f64>) {
        self.readings
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.observed().map(|v| (i, v)))
            .unzip()
    }
}

/// A detection strategy. Implementations return exactly one point per input
/// reading, in input order.
pub trait Detector: Send + Sync {
    fn method(&self) -> Method;

    fn name(&self) -> &str {
        self.method().name()
    }

    /// Reject request parameters the strategy cannot run with.
    fn validate(&self, _params: &MethodParams) -> Result<(), DetectError> {
        Ok(())
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<PointResult>, DetectError>;
}

/// Lookup table of strategies indexed by `Method as usize`.
pub struct DetectorSet {
    detectors: [Box<dyn Detector>; NUM_METHODS],
}

impl DetectorSet {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            detectors: [
                Box::new(DensityClusteringDetector::new(config.density.clone())),
                Box::new(DriftDetector::new(config.drift.clone())),
                Box::new(AutoregressiveDetector::new(config.autoregressive.clone())),
                Box::new(SplineResidualDetector::new(config.spline.clone())),
            ],
        }
    }

    pub fn get(&self, method: Method) -> &dyn Detector {
        self.detectors[method as usize].as_ref()
    }
}

/// Builds the per-reading output: non-observed readings are `NotEvaluable`,
/// observed ones take the verdict computed for their position.
fn scatter(
    readings: &[Reading],
    indices: &[usize],
    mut verdict: impl FnMut(usize, &Reading) -> PointResult,
) -> Vec<PointResult> {
    let mut out: Vec<PointResult> = readings
        .iter()
        .map(|r| PointResult::not_evaluable(r.timestamp))
        .collect();
    for (k, &i) in indices.iter().enumerate() {
        out[i] = verdict(k, &readings[i]);
    }
    out
}

fn require_positive(method: Method, name: &str, value: f64) -> Result<(), DetectError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DetectError::InvalidParams {
            method,
            reason: format!("{} must be positive, got {}", name, value),
        })
    }
}

fn require_non_negative(method: Method, name: &str, value: f64) -> Result<(), DetectError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DetectError::InvalidParams {
            method,
            reason: format!("{} must be non-negative, got {}", name, value),
        })
    }
}

fn require_finite(method: Method, name: &str, value: f64) -> Result<(), DetectError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DetectError::InvalidParams {
            method,
            reason: format!("{} must be finite", name),
        })
    }
}

fn all_not_evaluable(readings: &[Reading]) -> Vec<PointResult> {
    readings
        .iter()
        .map(|r| PointResult::not_evaluable(r.timestamp))
        .collect()
}

// --- Concrete Detectors ---

/// 1. Density clustering (DBSCAN). Noise points are outliers.
pub struct DensityClusteringDetector {
    defaults: DensityDefaults,
}

impl DensityClusteringDetector {
    pub fn new(defaults: DensityDefaults) -> Self {
        Self { defaults }
    }

    /// Radius actually used for `n` points of a variable with the given
    /// density factor. Shorter ranges get a smaller radius, never a larger one.
    pub fn effective_eps(eps: f64, variable_factor: f64, n: usize) -> f64 {
        let length_factor = (n as f64 / 30.0).sqrt().clamp(0.75, 1.0);
        eps * variable_factor * length_factor
    }
}

impl Detector for DensityClusteringDetector {
    fn method(&self) -> Method {
        Method::DensityClustering
    }

    fn validate(&self, params: &MethodParams) -> Result<(), DetectError> {
        let p = params.density.clone().unwrap_or_default();
        require_positive(self.method(), "eps", p.eps.unwrap_or(self.defaults.eps))?;
        require_non_negative(
            self.method(),
            "time_weight",
            p.time_weight.unwrap_or(self.defaults.time_weight),
        )?;
        if p.min_samples == Some(0) {
            return Err(DetectError::InvalidParams {
                method: self.method(),
                reason: "min_samples must be at least 1".into(),
            });
        }
        Ok(())
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<PointResult>, DetectError> {
        self.validate(input.params)?;
        let (indices, values) = input.observed();
        if values.len() < self.defaults.min_points {
            return Ok(all_not_evaluable(input.readings));
        }
        let first = values[0];
        if values.iter().all(|v| *v == first) {
            return Ok(scatter(input.readings, &indices, |_, r| {
                PointResult::inlier(r.timestamp, 0.0)
            }));
        }

        let p = input.params.density.clone().unwrap_or_default();
        let eps = p.eps.unwrap_or(self.defaults.eps);
        let min_samples = p.min_samples.unwrap_or(self.defaults.min_samples);
        let time_weight = p.time_weight.unwrap_or(self.defaults.time_weight);

        let n = values.len();
        let eps_eff = Self::effective_eps(eps, input.key.variable_id.density_factor(), n);
        let min_samples_eff = min_samples.min(n - 1).max(1);

        let times: Vec<i64> = indices
            .iter()
            .map(|&i| input.readings[i].timestamp.and_utc().timestamp())
            .collect();
        let points = dbscan::embed(&times, &values, time_weight, self.defaults.max_gap_steps);
        let clustering = dbscan::cluster(&points, eps_eff, min_samples_eff, input.budget)?;

        Ok(scatter(input.readings, &indices, |k, r| {
            let score = clustering.core_distances[k] / eps_eff;
            if clustering.labels[k].is_noise() {
                PointResult::outlier(r.timestamp, score)
            } else {
                PointResult::inlier(r.timestamp, score)
            }
        }))
    }
}

/// 2. Two-sided CUSUM drift detection.
pub struct DriftDetector {
    defaults: DriftDefaults,
}

impl DriftDetector {
    pub fn new(defaults: DriftDefaults) -> Self {
        Self { defaults }
    }
}

impl Detector for DriftDetector {
    fn method(&self) -> Method {
        Method::DriftDetection
    }

    fn validate(&self, params: &MethodParams) -> Result<(), DetectError> {
        let p = params.drift.clone().unwrap_or_default();
        let method = self.method();
        if let Some(mean) = p.reference_mean {
            require_finite(method, "reference_mean", mean)?;
        }
        if let Some(sigma) = p.reference_std {
            require_positive(method, "reference_std", sigma)?;
        }
        require_non_negative(
            method,
            "slack_sigmas",
            p.slack_sigmas.unwrap_or(self.defaults.slack_sigmas),
        )?;
        require_positive(
            method,
            "threshold_sigmas",
            p.threshold_sigmas.unwrap_or(self.defaults.threshold_sigmas),
        )
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<PointResult>, DetectError> {
        self.validate(input.params)?;
        let (indices, values) = input.observed();
        if values.is_empty() {
            return Ok(all_not_evaluable(input.readings));
        }

        let p = input.params.drift.clone().unwrap_or_default();
        let mean = p.reference_mean.unwrap_or_else(|| stats::mean(&values));
        let sigma = p.reference_std.unwrap_or_else(|| stats::std_dev(&values));
        if !(sigma > 0.0) {
            return Ok(scatter(input.readings, &indices, |_, r| {
                PointResult::inlier(r.timestamp, 0.0)
            }));
        }

        let slack = p.slack_sigmas.unwrap_or(self.defaults.slack_sigmas) * sigma;
        let threshold = p.threshold_sigmas.unwrap_or(self.defaults.threshold_sigmas) * sigma;
        let mut cusum = Cusum::new(mean, slack, threshold);

        let mut steps = Vec::with_capacity(values.len());
        for (k, v) in values.iter().enumerate() {
            if k % 1024 == 0 {
                input.budget.check()?;
            }
            steps.push(cusum.update(*v));
        }

        Ok(scatter(input.readings, &indices, |k, r| {
            let step = steps[k];
            if step.alarm.is_some() {
                PointResult::outlier(r.timestamp, step.score)
            } else {
                PointResult::inlier(r.timestamp, step.score)
            }
        }))
    }
}

/// 3. Autoregressive one-step residuals.
pub struct AutoregressiveDetector {
    defaults: AutoregressiveDefaults,
}

impl AutoregressiveDetector {
    pub fn new(defaults: AutoregressiveDefaults) -> Self {
        Self { defaults }
    }
}

impl Detector for AutoregressiveDetector {
    fn method(&self) -> Method {
        Method::AutoregressiveResidual
    }

    fn validate(&self, params: &MethodParams) -> Result<(), DetectError> {
        let p = params.autoregressive.clone().unwrap_or_default();
        let method = self.method();
        require_positive(
            method,
            "sigma_multiplier",
            p.sigma_multiplier.unwrap_or(self.defaults.sigma_multiplier),
        )?;
        if let Some(mean) = p.mean {
            require_finite(method, "mean", mean)?;
        }
        match &p.coefficients {
            Some(coefficients) => {
                if coefficients.is_empty() {
                    return Err(DetectError::InvalidParams {
                        method,
                        reason: "coefficients must not be empty".into(),
                    });
                }
                for c in coefficients {
                    require_finite(method, "coefficients", *c)?;
                }
            }
            None if p.order == Some(0) => {
                return Err(DetectError::InvalidParams {
                    method,
                    reason: "order must be at least 1".into(),
                });
            }
            None => {}
        }
        Ok(())
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<PointResult>, DetectError> {
        self.validate(input.params)?;
        let (indices, values) = input.observed();
        let p = input.params.autoregressive.clone().unwrap_or_default();
        let multiplier = p.sigma_multiplier.unwrap_or(self.defaults.sigma_multiplier);

        let model = match p.coefficients {
            Some(coefficients) => {
                let required = coefficients.len().saturating_add(1);
                if values.len() < required {
                    return Err(DetectError::InsufficientData {
                        method: self.method(),
                        required,
                        actual: values.len(),
                    });
                }
                let mean = p.mean.unwrap_or_else(|| stats::mean(&values));
                ArModel::new(mean, coefficients)
            }
            None => {
                let order = p.order.unwrap_or(self.defaults.order);
                let required = p
                    .min_points
                    .unwrap_or(self.defaults.min_points)
                    .max(order.saturating_add(1));
                if values.len() < required {
                    return Err(DetectError::InsufficientData {
                        method: self.method(),
                        required,
                        actual: values.len(),
                    });
                }
                ArModel::fit(&values, order)
            }
        };
        input.budget.check()?;

        let order = model.order();
        let residuals = model.residuals(&values);
        let sigma = stats::std_dev(&residuals);

        Ok(scatter(input.readings, &indices, |k, r| {
            if k < order {
                return PointResult::not_evaluable(r.timestamp);
            }
            let residual = residuals[k - order];
            if !(sigma > 0.0) {
                return PointResult::inlier(r.timestamp, 0.0);
            }
            let score = residual.abs() / sigma;
            if score > multiplier {
                PointResult::outlier(r.timestamp, score)
            } else {
                PointResult::inlier(r.timestamp, score)
            }
        }))
    }
}

/// 4. Precomputed spline residuals. Never refits.
pub struct SplineResidualDetector {
    defaults: SplineDefaults,
}

impl SplineResidualDetector {
    pub fn new(defaults: SplineDefaults) -> Self {
        Self { defaults }
    }
}

impl Detector for SplineResidualDetector {
    fn method(&self) -> Method {
        Method::SplineResidual
    }

    fn validate(&self, params: &MethodParams) -> Result<(), DetectError> {
        let method = self.method();
        match params.spline.as_ref().and_then(|p| p.threshold) {
            Some(SplineThreshold::Static(limit)) => require_non_negative(method, "static threshold", limit),
            Some(SplineThreshold::Quantile(q)) => {
                if (0.0..=1.0).contains(&q) {
                    Ok(())
                } else {
                    Err(DetectError::InvalidParams {
                        method,
                        reason: format!("quantile must lie in [0, 1], got {}", q),
                    })
                }
            }
            Some(SplineThreshold::ZScore(critical)) => require_positive(method, "z-score threshold", critical),
            None => Ok(()),
        }
    }

    fn detect(&self, input: &DetectionInput) -> Result<Vec<PointResult>, DetectError> {
        self.validate(input.params)?;
        let by_timestamp: HashMap<_, _> = input
            .residuals
            .iter()
            .map(|r| (r.timestamp, r.local_error))
            .collect();

        // Reading index -> local error, for observed readings with a record.
        let (indices, errors): (Vec<usize>, Vec<f64>) = input
            .readings
            .iter()
            .enumerate()
            .filter(|(_, r)| r.observed().is_some())
            .filter_map(|(i, r)| by_timestamp.get(&r.timestamp).map(|e| (i, *e)))
            .unzip();
        input.budget.check()?;

        let p = input.params.spline.clone().unwrap_or_default();
        let threshold = p.threshold.unwrap_or_else(|| self.defaults.threshold(input.granularity));
        let min_points = p.min_points.unwrap_or(self.defaults.min_points);

        let statistical = !matches!(threshold, SplineThreshold::Static(_));
        if statistical && errors.len() <= min_points {
            return Ok(all_not_evaluable(input.readings));
        }

        // Map each local error to (score, flagged).
        let judge: Box<dyn Fn(f64) -> (f64, bool)> = match threshold {
            SplineThreshold::Static(limit) => Box::new(move |e| {
                let score = if limit > 0.0 { e / limit } else { e };
                (score, e > limit)
            }),
            SplineThreshold::Quantile(q) => {
                let limit = stats::quantile(&errors, q);
                Box::new(move |e| {
                    let score = if limit > 0.0 { e / limit } else { 0.0 };
                    (score, e > limit)
                })
            }
            SplineThreshold::ZScore(critical) => {
                let mean = stats::mean(&errors);
                let sigma = stats::std_dev(&errors);
                Box::new(move |e| {
                    if sigma > 0.0 {
                        let z = (e - mean) / sigma;
                        (z, z > critical)
                    } else {
                        (0.0, false)
                    }
                })
            }
        };

        Ok(scatter(input.readings, &indices, |k, r| {
            let (score, flagged) = judge(errors[k]);
            if flagged {
                PointResult::outlier(r.timestamp, score)
            } else {
                PointResult::inlier(r.timestamp, score)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AutoregressiveParams, DensityParams, DriftParams, SplineParams, Verdict};
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    fn key() -> SeriesKey {
        SeriesKey::new("060371103", "88101")
    }

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn daily(values: &[f64]) -> Vec<Reading> {
        let k = key();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let ts = start() + Duration::days(i as i64);
                if v.is_nan() {
                    Reading::missing(&k, ts)
                } else {
                    Reading::new(&k, ts, *v)
                }
            })
            .collect()
    }

    fn run(
        detector: &dyn Detector,
        readings: &[Reading],
        residuals: &[ResidualRecord],
        params: &MethodParams,
    ) -> Result<Vec<PointResult>, DetectError> {
        let k = key();
        let budget = Budget::unlimited();
        detector.detect(&DetectionInput {
            key: &k,
            granularity: Granularity::Daily,
            readings,
            residuals,
            params,
            budget: &budget,
        })
    }

    fn outlier_positions(points: &[PointResult]) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_outlier())
            .map(|(i, _)| i)
            .collect()
    }

    fn wavy(n: usize) -> Vec<f64> {
        (0..n).map(|i| 10.0 + 0.8 * (i as f64 * 1.7).sin()).collect()
    }

    #[test]
    fn test_constant_series_has_no_outliers() {
        let readings = daily(&[7.5; 40]);
        let params = MethodParams::default();
        let set = DetectorSet::new(&DetectionConfig::default());
        for method in [
            Method::DensityClustering,
            Method::DriftDetection,
            Method::AutoregressiveResidual,
        ] {
            let points = run(set.get(method), &readings, &[], &params).unwrap();
            assert_eq!(points.len(), 40, "{method}");
            assert!(outlier_positions(&points).is_empty(), "{method}");
        }
    }

    #[test]
    fn test_density_flags_isolated_spike() {
        let mut values = wavy(31);
        values[14] = 50.0;
        let readings = daily(&values);
        let detector = DensityClusteringDetector::new(DensityDefaults::default());
        let points = run(&detector, &readings, &[], &MethodParams::default()).unwrap();
        assert_eq!(outlier_positions(&points), vec![14]);
        assert!(points[14].score.unwrap() > 1.0);
    }

    #[test]
    fn test_density_short_range_not_evaluable() {
        let readings = daily(&[1.0, 2.0, 30.0, f64::NAN]);
        let detector = DensityClusteringDetector::new(DensityDefaults::default());
        let points = run(&detector, &readings, &[], &MethodParams::default()).unwrap();
        assert_eq!(points.len(), 4);
        assert!(points.iter().all(|p| p.verdict == Verdict::NotEvaluable));
    }

    #[test]
    fn test_density_radius_never_grows_for_shorter_ranges() {
        let mut previous = 0.0;
        for n in [5, 10, 17, 30, 100, 10_000] {
            let eps = DensityClusteringDetector::effective_eps(1.5, 1.0, n);
            assert!(eps >= previous);
            previous = eps;
        }
        assert_eq!(DensityClusteringDetector::effective_eps(1.5, 1.0, 10_000), 1.5);
    }

    #[test]
    fn test_cusum_flags_both_excursions() {
        let mut values = vec![10.0; 100];
        values[30..40].fill(20.0);
        values[70..80].fill(20.0);
        let readings = daily(&values);
        let detector = DriftDetector::new(DriftDefaults::default());
        let flagged = outlier_positions(&run(&detector, &readings, &[], &MethodParams::default()).unwrap());
        assert_eq!(flagged, vec![32, 35, 38, 72, 75, 78]);
    }

    #[test]
    fn test_cusum_uses_supplied_reference() {
        let readings = daily(&[0.0, 0.0, 3.0, 3.0, 0.0]);
        let params = MethodParams {
            drift: Some(DriftParams {
                reference_mean: Some(0.0),
                reference_std: Some(1.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let detector = DriftDetector::new(DriftDefaults::default());
        let points = run(&detector, &readings, &[], &params).unwrap();
        // C+ = 2.5 then 5.0 > 4.0
        assert_eq!(outlier_positions(&points), vec![3]);
        assert_eq!(points[3].score, Some(1.25));
    }

    #[test]
    fn test_autoregressive_requires_enough_points() {
        let readings = daily(&[1.0, 2.0]);
        let detector = AutoregressiveDetector::new(AutoregressiveDefaults::default());
        let err = run(&detector, &readings, &[], &MethodParams::default()).unwrap_err();
        assert!(matches!(
            err,
            DetectError::InsufficientData { required: 20, actual: 2, .. }
        ));
    }

    #[test]
    fn test_autoregressive_flags_shock_and_skips_warmup() {
        let mut values = wavy(60);
        values[40] += 15.0;
        let readings = daily(&values);
        let detector = AutoregressiveDetector::new(AutoregressiveDefaults::default());
        let points = run(&detector, &readings, &[], &MethodParams::default()).unwrap();
        assert_eq!(points[0].verdict, Verdict::NotEvaluable);
        assert_eq!(points[1].verdict, Verdict::NotEvaluable);
        assert!(points[40].is_outlier());
    }

    fn records_for(readings: &[Reading], errors: &[f64]) -> Vec<ResidualRecord> {
        readings
            .iter()
            .zip(errors)
            .filter(|(r, _)| r.observed().is_some())
            .map(|(r, e)| ResidualRecord {
                site_id: r.site_id.clone(),
                variable_id: r.variable_id.clone(),
                timestamp: r.timestamp,
                residual: *e,
                local_error: *e,
            })
            .collect()
    }

    #[test]
    fn test_spline_gaps_are_not_evaluable() {
        let mut values = wavy(30);
        values[5] = f64::NAN;
        let readings = daily(&values);
        let mut errors = vec![0.1; 30];
        errors[20] = 9.0;
        let mut records = records_for(&readings, &errors);
        // Drop the record for day 10: fit unavailable there.
        records.retain(|r| r.timestamp != readings[10].timestamp);

        let params = MethodParams {
            spline: Some(SplineParams {
                threshold: Some(SplineThreshold::Static(1.0)),
                min_points: None,
            }),
            ..Default::default()
        };
        let detector = SplineResidualDetector::new(SplineDefaults::default());
        let points = run(&detector, &readings, &records, &params).unwrap();
        assert_eq!(points.len(), 30);
        assert_eq!(points[5].verdict, Verdict::NotEvaluable);
        assert_eq!(points[10].verdict, Verdict::NotEvaluable);
        assert_eq!(outlier_positions(&points), vec![20]);
    }

    #[test]
    fn test_spline_zscore_needs_enough_records() {
        let readings = daily(&wavy(15));
        let records = records_for(&readings, &[1.0; 15]);
        let detector = SplineResidualDetector::new(SplineDefaults::default());
        let points = run(&detector, &readings, &records, &MethodParams::default()).unwrap();
        assert!(points.iter().all(|p| p.verdict == Verdict::NotEvaluable));
    }

    #[test]
    fn test_spline_zscore_flags_large_error() {
        let readings = daily(&wavy(60));
        let mut errors: Vec<f64> = (0..60).map(|i| 0.5 + 0.1 * ((i % 5) as f64)).collect();
        errors[33] = 40.0;
        let records = records_for(&readings, &errors);
        let detector = SplineResidualDetector::new(SplineDefaults::default());
        let points = run(&detector, &readings, &records, &MethodParams::default()).unwrap();
        assert_eq!(outlier_positions(&points), vec![33]);
    }

    fn ar_params(p: AutoregressiveParams) -> MethodParams {
        MethodParams {
            autoregressive: Some(p),
            ..Default::default()
        }
    }

    #[test]
    fn test_autoregressive_huge_order_is_insufficient() {
        let readings = daily(&wavy(40));
        let params = ar_params(AutoregressiveParams {
            order: Some(usize::MAX),
            ..Default::default()
        });
        let detector = AutoregressiveDetector::new(AutoregressiveDefaults::default());
        let err = run(&detector, &readings, &[], &params).unwrap_err();
        assert!(matches!(
            err,
            DetectError::InsufficientData { required: usize::MAX, actual: 40, .. }
        ));
    }

    #[test]
    fn test_autoregressive_with_supplied_coefficients() {
        let mut values = wavy(30);
        values[15] += 20.0;
        let readings = daily(&values);
        // Flat AR(1) around 10: residuals are the raw deviations.
        let params = ar_params(AutoregressiveParams {
            coefficients: Some(vec![0.0]),
            mean: Some(10.0),
            ..Default::default()
        });
        let detector = AutoregressiveDetector::new(AutoregressiveDefaults::default());
        let points = run(&detector, &readings, &[], &params).unwrap();
        assert_eq!(points.len(), 30);
        assert_eq!(points[0].verdict, Verdict::NotEvaluable);
        assert_eq!(outlier_positions(&points), vec![15]);
    }

    #[test]
    fn test_autoregressive_supplied_coefficients_need_enough_points() {
        let readings = daily(&[1.0, 2.0, 3.0]);
        let params = ar_params(AutoregressiveParams {
            coefficients: Some(vec![0.5, 0.2, 0.1]),
            ..Default::default()
        });
        let detector = AutoregressiveDetector::new(AutoregressiveDefaults::default());
        let err = run(&detector, &readings, &[], &params).unwrap_err();
        assert!(matches!(
            err,
            DetectError::InsufficientData { required: 4, actual: 3, .. }
        ));
    }

    #[test]
    fn test_density_rejects_non_positive_eps() {
        let readings = daily(&wavy(31));
        let detector = DensityClusteringDetector::new(DensityDefaults::default());
        for eps in [0.0, -1.0, f64::NAN] {
            let params = MethodParams {
                density: Some(DensityParams {
                    eps: Some(eps),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let err = run(&detector, &readings, &[], &params).unwrap_err();
            assert!(matches!(
                err,
                DetectError::InvalidParams { method: Method::DensityClustering, .. }
            ));
        }
    }

    #[test]
    fn test_out_of_range_params_are_rejected() {
        let readings = daily(&wavy(40));
        let set = DetectorSet::new(&DetectionConfig::default());
        let cases = [
            (
                Method::DriftDetection,
                MethodParams {
                    drift: Some(DriftParams {
                        threshold_sigmas: Some(-1.0),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            (
                Method::AutoregressiveResidual,
                ar_params(AutoregressiveParams {
                    sigma_multiplier: Some(-2.0),
                    ..Default::default()
                }),
            ),
            (
                Method::SplineResidual,
                MethodParams {
                    spline: Some(SplineParams {
                        threshold: Some(SplineThreshold::Quantile(1.5)),
                        min_points: None,
                    }),
                    ..Default::default()
                },
            ),
        ];
        for (method, params) in cases {
            let err = run(set.get(method), &readings, &[], &params).unwrap_err();
            assert_eq!(err.kind(), "invalid_params", "{method}");
            assert!(set.get(method).validate(&params).is_err());
        }
        assert!(set
            .get(Method::DriftDetection)
            .validate(&MethodParams::default())
            .is_ok());
    }

    #[test]
    fn test_spline_quantile_threshold() {
        let readings = daily(&wavy(30));
        let mut errors = vec![0.5; 30];
        errors[20] = 9.0;
        let records = records_for(&readings, &errors);
        let detector = SplineResidualDetector::new(SplineDefaults::default());
        let quantile = |q: f64| MethodParams {
            spline: Some(SplineParams {
                threshold: Some(SplineThreshold::Quantile(q)),
                min_points: None,
            }),
            ..Default::default()
        };

        let points = run(&detector, &readings, &records, &quantile(0.95)).unwrap();
        assert_eq!(outlier_positions(&points), vec![20]);
        assert_eq!(points[20].score, Some(18.0));
        assert_eq!(points[3].score, Some(1.0));

        // The maximum itself is never above the 1.0 quantile.
        let points = run(&detector, &readings, &records, &quantile(1.0)).unwrap();
        assert!(outlier_positions(&points).is_empty());
    }
}
