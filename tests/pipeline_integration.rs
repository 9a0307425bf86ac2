use aqs_anomaly::config::PipelineConfig;
use aqs_anomaly::model::{DateRange, ResidualRecord};
use aqs_anomaly::pipeline::{UnitFailure, UnitOutcome};
use aqs_anomaly::store::{FsResidualStore, FsSeriesStore, ResidualStore, SeriesStore};
use aqs_anomaly::{Granularity, Pipeline, Reading, SeriesKey};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

const SITES: [&str; 3] = ["060371103", "060375005", "061112002"];

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 7, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Ten days of hourly ozone with a diurnal cycle and seeded noise.
fn hourly_series(key: &SeriesKey, seed: u64) -> Vec<Reading> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 2.0).unwrap();
    (0..240)
        .map(|h| {
            let ts = start() + Duration::hours(h);
            let cycle = 30.0 + 15.0 * ((h % 24) as f64 / 24.0 * std::f64::consts::TAU).sin();
            Reading::new(key, ts, cycle + noise.sample(&mut rng))
        })
        .collect()
}

fn seeded_store(root: &std::path::Path) -> Arc<FsSeriesStore> {
    let store = FsSeriesStore::open(root).unwrap();
    for (i, site) in SITES.iter().enumerate() {
        let key = SeriesKey::new(*site, "44201");
        let readings = hourly_series(&key, i as u64 + 1);
        store.write_series(&key, Granularity::Hourly, &readings).unwrap();
        let daily: Vec<Reading> = readings
            .chunks(24)
            .map(|day| {
                let mean = day.iter().map(|r| r.value).sum::<f64>() / day.len() as f64;
                Reading::new(&key, day[0].timestamp, mean)
            })
            .collect();
        store.write_series(&key, Granularity::Daily, &daily).unwrap();
    }
    Arc::new(store)
}

fn all_records(store: &FsResidualStore, granularity: Granularity) -> Vec<ResidualRecord> {
    SITES
        .iter()
        .flat_map(|site| {
            store
                .residuals(&SeriesKey::new(*site, "44201"), granularity, &DateRange::unbounded())
                .unwrap()
        })
        .collect()
}

#[test]
fn test_hourly_reruns_are_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let series = seeded_store(dir.path());
    let residuals = Arc::new(FsResidualStore::open(dir.path()));
    let config = PipelineConfig {
        workers: 3,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(series, residuals.clone(), config);

    let first = pipeline.run(Granularity::Hourly).unwrap();
    let first_records = all_records(&residuals, Granularity::Hourly);
    let second = pipeline.run(Granularity::Hourly).unwrap();
    let second_records = all_records(&residuals, Granularity::Hourly);

    assert_eq!(first.fitted, 30);
    assert_eq!(first.records, 720);
    assert_eq!(first.checksum, second.checksum);
    assert_ne!(first.generation, second.generation);
    assert_eq!(first_records.len(), second_records.len());
    for (a, b) in first_records.iter().zip(&second_records) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.residual.to_bits(), b.residual.to_bits());
        assert_eq!(a.local_error.to_bits(), b.local_error.to_bits());
    }
    // Superseded generation is gone.
    assert!(!dir.path().join("residuals/hourly").join(&first.generation).exists());
}

#[test]
fn test_hourly_and_daily_runs_are_kept_apart() {
    let dir = tempfile::tempdir().unwrap();
    let series = seeded_store(dir.path());
    let residuals = Arc::new(FsResidualStore::open(dir.path()));
    let pipeline = Pipeline::new(series, residuals.clone(), PipelineConfig::default());

    let summaries = pipeline.run_all().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].granularity, Granularity::Hourly);
    assert_eq!(summaries[1].granularity, Granularity::Daily);
    assert_eq!(summaries[1].fitted, 3);
    assert_eq!(summaries[1].records, 30);

    for r in all_records(&residuals, Granularity::Hourly) {
        assert!((r.local_error - r.residual * r.residual).abs() < 1e-12);
    }
    for r in all_records(&residuals, Granularity::Daily) {
        assert_eq!(r.local_error, r.residual.abs());
    }

    let key = SeriesKey::new(SITES[0], "44201");
    assert_eq!(residuals.fits(&key, Granularity::Hourly).unwrap().len(), 10);
    assert_eq!(residuals.fits(&key, Granularity::Daily).unwrap().len(), 1);
}

#[test]
fn test_bad_units_do_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let series = seeded_store(dir.path());

    // A sparse series: one day with three readings, one with six.
    let sparse = SeriesKey::new("060379033", "44201");
    let mut readings: Vec<Reading> = (0..3)
        .map(|h| Reading::new(&sparse, start() + Duration::hours(h), 20.0 + h as f64))
        .collect();
    readings.extend((0..6).map(|h| Reading::new(&sparse, start() + Duration::hours(24 + h), 20.0 + h as f64)));
    series.write_series(&sparse, Granularity::Hourly, &readings).unwrap();

    // A series whose partition cannot be decoded.
    let corrupt = SeriesKey::new("060371201", "44201");
    let corrupt_dir = dir.path().join("hourly/sites/060371201/44201");
    std::fs::create_dir_all(&corrupt_dir).unwrap();
    std::fs::write(corrupt_dir.join("2020.bin"), b"not a partition").unwrap();

    let residuals = Arc::new(FsResidualStore::open(dir.path()));
    let pipeline = Pipeline::new(series.clone(), residuals.clone(), PipelineConfig::default());
    let summary = pipeline.run(Granularity::Hourly).unwrap();

    assert_eq!(summary.series, 5);
    assert_eq!(summary.fitted, 31);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].key, corrupt);
    assert!(matches!(
        summary.failures[0].outcome,
        UnitOutcome::Failed(UnitFailure::Read(_))
    ));

    // The skipped day has no records; the fitted day has all six.
    let records = residuals
        .residuals(&sparse, Granularity::Hourly, &DateRange::unbounded())
        .unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.timestamp >= start() + Duration::hours(24)));

    // Healthy series were unaffected.
    assert_eq!(all_records(&residuals, Granularity::Hourly).len(), 720);
    assert!(series.contains(&corrupt, Granularity::Hourly).unwrap());
}

#[test]
fn test_concurrent_runs_publish_a_complete_generation() {
    let dir = tempfile::tempdir().unwrap();
    let series = seeded_store(dir.path());
    let residuals = Arc::new(FsResidualStore::open(dir.path()));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pipeline = Pipeline::new(series.clone(), residuals.clone(), PipelineConfig::default());
            std::thread::spawn(move || pipeline.run(Granularity::Hourly).unwrap())
        })
        .collect();
    let summaries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let current = residuals.current_generation(Granularity::Hourly).unwrap().unwrap();
    assert!(summaries.iter().any(|s| s.generation == current));
    assert_eq!(summaries[0].checksum, summaries[1].checksum);
    assert_eq!(all_records(&residuals, Granularity::Hourly).len(), 720);
}
