//! Presentation shapes: one map marker per site for an overview, and a line
//! chart with per-point flags for a single series.

use crate::model::{
    DetectionResult, Granularity, Method, Reading, Site, SiteId, VariableId, Verdict,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerStatus {
    /// At least one outlier in range.
    Yes,
    No,
    #[serde(rename = "Insufficient data")]
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMarker {
    pub site_id: SiteId,
    pub latitude: f64,
    pub longitude: f64,
    pub state_name: Option<String>,
    pub county_name: Option<String>,
    pub city_name: Option<String>,
    pub status: MarkerStatus,
    pub outliers: usize,
    pub evaluated: usize,
}

impl MapMarker {
    fn for_site(site: &Site, status: MarkerStatus, outliers: usize, evaluated: usize) -> Self {
        Self {
            site_id: site.site_id.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
            state_name: site.state_name.clone(),
            county_name: site.county_name.clone(),
            city_name: site.city_name.clone(),
            status,
            outliers,
            evaluated,
        }
    }

    pub fn from_result(site: &Site, result: &DetectionResult) -> Self {
        let outliers = result.outlier_count();
        let evaluated = result.evaluated_count();
        let status = if evaluated == 0 {
            MarkerStatus::InsufficientData
        } else if outliers > 0 {
            MarkerStatus::Yes
        } else {
            MarkerStatus::No
        };
        Self::for_site(site, status, outliers, evaluated)
    }

    pub fn insufficient(site: &Site) -> Self {
        Self::for_site(site, MarkerStatus::InsufficientData, 0, 0)
    }
}

/// One entry of a site's variable checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteVariable {
    pub variable_id: VariableId,
    pub label: String,
}

impl SiteVariable {
    pub fn new(variable_id: VariableId) -> Self {
        let label = variable_id.label().to_string();
        Self { variable_id, label }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    pub verdict: Verdict,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineChart {
    pub site_id: SiteId,
    pub variable_id: VariableId,
    /// English label of the variable, for the axis title.
    pub label: String,
    pub granularity: Granularity,
    pub method: Method,
    pub points: Vec<ChartPoint>,
    pub outliers: usize,
}

impl LineChart {
    /// Zip readings with their verdicts. Both slices are aligned by the
    /// dispatcher, so a plain zip is enough.
    pub fn assemble(readings: &[Reading], result: &DetectionResult) -> Self {
        let points: Vec<ChartPoint> = readings
            .iter()
            .zip(&result.points)
            .map(|(r, p)| ChartPoint {
                timestamp: r.timestamp,
                value: r.observed(),
                verdict: p.verdict,
                score: p.score.filter(|s| s.is_finite()),
            })
            .collect();
        Self {
            site_id: result.key.site_id.clone(),
            variable_id: result.key.variable_id.clone(),
            label: result.key.variable_id.label().to_string(),
            granularity: result.granularity,
            method: result.method,
            outliers: result.outlier_count(),
            points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PointResult, SeriesKey};
    use chrono::NaiveDate;

    fn site() -> Site {
        let mut s = Site::new("06", "037", "1103", 34.06659, -118.22688);
        s.state_name = Some("California".into());
        s.city_name = Some("Los Angeles".into());
        s
    }

    fn result(verdicts: &[Verdict]) -> DetectionResult {
        let ts = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        DetectionResult {
            key: SeriesKey::new("060371103", "88101"),
            granularity: Granularity::Daily,
            method: Method::DensityClustering,
            points: verdicts
                .iter()
                .map(|v| PointResult {
                    timestamp: ts,
                    verdict: *v,
                    score: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_marker_status() {
        let s = site();
        let yes = MapMarker::from_result(&s, &result(&[Verdict::Inlier, Verdict::Outlier]));
        assert_eq!(yes.status, MarkerStatus::Yes);
        assert_eq!(yes.outliers, 1);
        assert_eq!(yes.city_name.as_deref(), Some("Los Angeles"));

        let no = MapMarker::from_result(&s, &result(&[Verdict::Inlier, Verdict::NotEvaluable]));
        assert_eq!(no.status, MarkerStatus::No);
        assert_eq!(no.evaluated, 1);

        let none = MapMarker::from_result(&s, &result(&[Verdict::NotEvaluable]));
        assert_eq!(none.status, MarkerStatus::InsufficientData);
    }

    #[test]
    fn test_marker_status_serializes_like_the_dashboard_expects() {
        let json = serde_json::to_string(&MarkerStatus::InsufficientData).unwrap();
        assert_eq!(json, "\"Insufficient data\"");
        assert_eq!(serde_json::to_string(&MarkerStatus::Yes).unwrap(), "\"Yes\"");
    }

    #[test]
    fn test_site_variable_uses_catalogue_label() {
        let known = SiteVariable::new(VariableId::new("44201"));
        assert_eq!(known.label, "Ozone");
        let unknown = SiteVariable::new(VariableId::new("12345"));
        assert_eq!(unknown.label, "12345");
    }

    #[test]
    fn test_chart_keeps_gaps() {
        let key = SeriesKey::new("060371103", "88101");
        let ts = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let readings = vec![Reading::new(&key, ts, 3.0), Reading::missing(&key, ts)];
        let res = DetectionResult {
            key,
            granularity: Granularity::Daily,
            method: Method::DriftDetection,
            points: vec![PointResult::inlier(ts, 0.1), PointResult::not_evaluable(ts)],
        };
        let chart = LineChart::assemble(&readings, &res);
        assert_eq!(chart.label, "Particulate Matter <2.5 microns (FRM)");
        assert_eq!(chart.points[0].value, Some(3.0));
        assert_eq!(chart.points[1].value, None);
        assert_eq!(chart.outliers, 0);
    }
}
