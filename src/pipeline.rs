//! Offline spline precomputation.
//!
//! A coordinator feeds `(site, variable)` jobs into a bounded queue drained by
//! a pool of fit workers. Workers send finished partitions to a single writer
//! thread that owns the staging generation, and per-unit outcomes back to the
//! coordinator. The generation is published only after every job finished.

use crate::algo::bspline::{self, DEGREE};
use crate::config::PipelineConfig;
use crate::error::{FitError, PipelineError, StoreError};
use crate::metrics::{PIPELINE_RECORDS, PIPELINE_UNITS};
use crate::model::{DateRange, Granularity, Reading, ResidualRecord, SeriesKey, SplineFit};
use crate::store::{ResidualPartition, ResidualStore, ResidualWriter, SeriesStore};
use chrono::{NaiveDate, NaiveDateTime};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    TooFewPoints { required: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnitFailure {
    Fit(String),
    Read(String),
    Panicked(String),
}

impl From<FitError> for UnitFailure {
    fn from(e: FitError) -> Self {
        UnitFailure::Fit(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Fitted { records: usize },
    Skipped(SkipReason),
    Failed(UnitFailure),
}

impl UnitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fitted { .. } => "fitted",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// Outcome of one fit unit: a day (hourly run) or a whole series (daily run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub key: SeriesKey,
    /// Calendar day for hourly units; `None` for whole-series units.
    pub day: Option<NaiveDate>,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub granularity: Granularity,
    pub generation: String,
    pub series: usize,
    pub fitted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: usize,
    /// Order-independent digest of everything written; equal digests mean
    /// bit-identical residual output.
    pub checksum: u64,
    pub failures: Vec<UnitReport>,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    pub fn units(&self) -> usize {
        self.fitted + self.skipped + self.failed
    }
}

// ============================================================================
// FITTING
// ============================================================================

/// Knot count for one hourly window of `n` observed readings.
pub fn hourly_knots(n: usize, config: &PipelineConfig) -> usize {
    if n >= 24 {
        config.hourly_full_day_knots
    } else {
        config.hourly_partial_max_knots.min(n / 2).max(2)
    }
}

/// Knot count for a whole-series window of `n` observed readings.
pub fn daily_knots(n: usize, config: &PipelineConfig) -> usize {
    (n / config.daily_points_per_knot.max(1)).max(2)
}

/// Fit one window of observed `(timestamp, value)` pairs and derive its
/// residual records. Hourly windows score squared residuals, daily windows
/// absolute residuals.
pub fn fit_window(
    key: &SeriesKey,
    granularity: Granularity,
    observed: &[(NaiveDateTime, f64)],
    num_knots: usize,
) -> Result<(Vec<ResidualRecord>, SplineFit), FitError> {
    let (Some(first), Some(last)) = (observed.first(), observed.last()) else {
        return Err(FitError::TooFewPoints {
            required: DEGREE + 1,
            actual: 0,
        });
    };
    let values: Vec<f64> = observed.iter().map(|(_, v)| *v).collect();
    let solution = bspline::fit(&values, num_knots)?;

    let records = observed
        .iter()
        .zip(&solution.fitted)
        .map(|((timestamp, value), fitted)| {
            let residual = value - fitted;
            let local_error = match granularity {
                Granularity::Hourly => residual * residual,
                Granularity::Daily => residual.abs(),
            };
            ResidualRecord {
                site_id: key.site_id.clone(),
                variable_id: key.variable_id.clone(),
                timestamp: *timestamp,
                residual,
                local_error,
            }
        })
        .collect();

    let fit = SplineFit {
        key: key.clone(),
        granularity,
        window_start: first.0,
        window_end: last.0,
        knots: solution.knots,
        coefficients: solution.coefficients,
        degree: DEGREE,
        points: observed.len(),
        mse: solution.mse,
    };
    Ok((records, fit))
}

fn observed_points<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Vec<(NaiveDateTime, f64)> {
    readings
        .into_iter()
        .filter_map(|r| r.observed().map(|v| (r.timestamp, v)))
        .collect()
}

/// Fit every unit of one series. Returns the partition to persist and one
/// report per unit.
pub fn process_series(
    key: &SeriesKey,
    granularity: Granularity,
    readings: &[Reading],
    config: &PipelineConfig,
) -> (ResidualPartition, Vec<UnitReport>) {
    let windows: Vec<(Option<NaiveDate>, Vec<(NaiveDateTime, f64)>)> = match granularity {
        Granularity::Hourly => {
            let mut days: BTreeMap<NaiveDate, Vec<&Reading>> = BTreeMap::new();
            for r in readings {
                days.entry(r.date()).or_default().push(r);
            }
            days.into_iter()
                .map(|(day, rs)| (Some(day), observed_points(rs)))
                .collect()
        }
        Granularity::Daily => vec![(None, observed_points(readings))],
    };

    let min_points = config.min_points(granularity);
    let mut partition = ResidualPartition::default();
    let mut reports = Vec::with_capacity(windows.len());

    for (day, observed) in windows {
        let n = observed.len();
        let outcome = if n < min_points {
            UnitOutcome::Skipped(SkipReason::TooFewPoints {
                required: min_points,
                actual: n,
            })
        } else {
            let knots = match granularity {
                Granularity::Hourly => hourly_knots(n, config),
                Granularity::Daily => daily_knots(n, config),
            };
            match fit_window(key, granularity, &observed, knots) {
                Ok((records, fit)) => {
                    let count = records.len();
                    partition.records.extend(records);
                    partition.fits.push(fit);
                    UnitOutcome::Fitted { records: count }
                }
                Err(e) => {
                    warn!(
                        site = %key.site_id,
                        variable = %key.variable_id,
                        day = ?day,
                        error = %e,
                        "Spline fit failed."
                    );
                    UnitOutcome::Failed(e.into())
                }
            }
        };
        reports.push(UnitReport {
            key: key.clone(),
            day,
            outcome,
        });
    }

    (partition, reports)
}

// ============================================================================
// WORKER POOL
// ============================================================================

struct Partition {
    key: SeriesKey,
    partition: ResidualPartition,
}

struct FitWorker {
    id: usize,
    granularity: Granularity,
    config: PipelineConfig,
    series: Arc<dyn SeriesStore>,
    jobs: Receiver<SeriesKey>,
    partitions: Sender<Partition>,
    reports: Sender<Vec<UnitReport>>,
}

impl FitWorker {
    fn spawn(self) -> Result<thread::JoinHandle<()>, PipelineError> {
        thread::Builder::new()
            .name(format!("aqs-fit-{}", self.id))
            .spawn(move || {
                self.run();
            })
            .map_err(|e| PipelineError::Worker(e.to_string()))
    }

    fn run(self) {
        debug!(worker = self.id, granularity = %self.granularity, "Fit worker active.");
        while let Ok(key) = self.jobs.recv() {
            let reports = match catch_unwind(AssertUnwindSafe(|| self.process(&key))) {
                Ok(reports) => reports,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(site = %key.site_id, variable = %key.variable_id, message = %message, "Fit unit panicked.");
                    vec![UnitReport {
                        key,
                        day: None,
                        outcome: UnitOutcome::Failed(UnitFailure::Panicked(message)),
                    }]
                }
            };
            if self.reports.send(reports).is_err() {
                break;
            }
        }
        debug!(worker = self.id, "Fit worker stopped.");
    }

    fn process(&self, key: &SeriesKey) -> Vec<UnitReport> {
        let readings = match self.series.readings(key, self.granularity, &DateRange::unbounded()) {
            Ok(readings) => readings,
            Err(e) => {
                warn!(site = %key.site_id, variable = %key.variable_id, error = %e, "Failed to read series.");
                return vec![UnitReport {
                    key: key.clone(),
                    day: None,
                    outcome: UnitOutcome::Failed(UnitFailure::Read(e.to_string())),
                }];
            }
        };

        let (partition, reports) = process_series(key, self.granularity, &readings, &self.config);
        if !partition.is_empty() {
            let _ = self.partitions.send(Partition {
                key: key.clone(),
                partition,
            });
        }
        reports
    }
}

/// Owns the staging generation; returns it with the per-series digests once
/// every worker has hung up.
struct ResidualSink;

type SinkResult = Result<(Box<dyn ResidualWriter>, Vec<(SeriesKey, u64)>, usize), StoreError>;

impl ResidualSink {
    fn spawn(
        mut writer: Box<dyn ResidualWriter>,
        rx: Receiver<Partition>,
    ) -> Result<thread::JoinHandle<SinkResult>, PipelineError> {
        thread::Builder::new()
            .name("aqs-residual-writer".into())
            .spawn(move || {
                let mut digests = Vec::new();
                let mut records = 0;
                let mut first_error = None;
                while let Ok(Partition { key, partition }) = rx.recv() {
                    if first_error.is_some() {
                        continue;
                    }
                    let digest = match partition_digest(&partition) {
                        Ok(d) => d,
                        Err(e) => {
                            first_error = Some(e);
                            continue;
                        }
                    };
                    let count = partition.records.len();
                    match writer.write_partition(&key, partition) {
                        Ok(()) => {
                            digests.push((key, digest));
                            records += count;
                        }
                        Err(e) => first_error = Some(e),
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok((writer, digests, records)),
                }
            })
            .map_err(|e| PipelineError::Worker(e.to_string()))
    }
}

fn partition_digest(partition: &ResidualPartition) -> Result<u64, StoreError> {
    let records: Vec<(i64, u64, u64)> = partition
        .records
        .iter()
        .map(|r| {
            (
                r.timestamp.and_utc().timestamp(),
                r.residual.to_bits(),
                r.local_error.to_bits(),
            )
        })
        .collect();
    let bytes = bincode::serialize(&(records, &partition.fits))?;
    Ok(xxhash_rust::xxh3::xxh3_64(&bytes))
}

fn batch_digest(mut digests: Vec<(SeriesKey, u64)>) -> Result<u64, StoreError> {
    digests.sort();
    Ok(xxhash_rust::xxh3::xxh3_64(&bincode::serialize(&digests)?))
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    series: Arc<dyn SeriesStore>,
    residuals: Arc<dyn ResidualStore>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        series: Arc<dyn SeriesStore>,
        residuals: Arc<dyn ResidualStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            series,
            residuals,
            config,
        }
    }

    /// Recompute every residual at `granularity` and publish a new generation.
    pub fn run(&self, granularity: Granularity) -> Result<BatchSummary, PipelineError> {
        let started = Instant::now();
        let keys = self.series.series_keys(granularity)?;
        let workers = self.config.worker_count().min(keys.len().max(1));
        info!(%granularity, series = keys.len(), workers, "Starting spline precomputation.");

        let writer = self.residuals.begin_run(granularity)?;
        let generation = writer.generation().to_string();

        let (job_tx, job_rx) = bounded::<SeriesKey>(self.config.queue_depth);
        let (part_tx, part_rx) = bounded::<Partition>(self.config.queue_depth);
        let (report_tx, report_rx) = unbounded::<Vec<UnitReport>>();

        let sink = ResidualSink::spawn(writer, part_rx)?;
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = FitWorker {
                id,
                granularity,
                config: self.config.clone(),
                series: Arc::clone(&self.series),
                jobs: job_rx.clone(),
                partitions: part_tx.clone(),
                reports: report_tx.clone(),
            };
            handles.push(worker.spawn()?);
        }
        // Only workers hold these now.
        drop(job_rx);
        drop(part_tx);
        drop(report_tx);

        let series_count = keys.len();
        for key in keys {
            if job_tx.send(key).is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut summary = BatchSummary {
            granularity,
            generation,
            series: series_count,
            fitted: 0,
            skipped: 0,
            failed: 0,
            records: 0,
            checksum: 0,
            failures: Vec::new(),
            elapsed_ms: 0,
        };
        for reports in report_rx.iter() {
            for report in reports {
                PIPELINE_UNITS
                    .with_label_values(&[granularity.dir_name(), report.outcome.label()])
                    .inc();
                match report.outcome {
                    UnitOutcome::Fitted { .. } => summary.fitted += 1,
                    UnitOutcome::Skipped(_) => summary.skipped += 1,
                    UnitOutcome::Failed(_) => {
                        summary.failed += 1;
                        summary.failures.push(report);
                    }
                }
            }
        }

        for handle in handles {
            handle
                .join()
                .map_err(|_| PipelineError::Worker("fit worker panicked".into()))?;
        }
        let (writer, digests, records) = sink
            .join()
            .map_err(|_| PipelineError::Worker("residual writer panicked".into()))??;

        summary.records = records;
        summary.checksum = batch_digest(digests)?;
        summary.generation = writer.publish()?;
        summary.failures.sort_by(|a, b| (&a.key, a.day).cmp(&(&b.key, b.day)));
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        PIPELINE_RECORDS
            .with_label_values(&[granularity.dir_name()])
            .inc_by(records as u64);

        info!(
            %granularity,
            generation = %summary.generation,
            fitted = summary.fitted,
            skipped = summary.skipped,
            failed = summary.failed,
            records = summary.records,
            elapsed_ms = summary.elapsed_ms,
            "Spline precomputation published."
        );
        Ok(summary)
    }

    /// Hourly then daily; the two runs share nothing.
    pub fn run_all(&self) -> Result<Vec<BatchSummary>, PipelineError> {
        Granularity::ALL.iter().map(|g| self.run(*g)).collect()
    }
}
