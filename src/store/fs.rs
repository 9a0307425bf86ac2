//! On-disk layout:
//!
//! ```text
//! {root}/sites.json
//! {root}/{hourly|daily}/sites/{site_id}/{variable}/{year}.bin
//! {root}/residuals/{hourly|daily}/CURRENT
//! {root}/residuals/{hourly|daily}/PUBLISH.lock
//! {root}/residuals/{hourly|daily}/{generation}/sites/{site_id}/{variable}.bin
//! ```
//!
//! Partitions are bincode-encoded column vectors.

use super::{new_generation_name, normalize, ResidualPartition, ResidualStore, ResidualWriter, SeriesStore};
use crate::error::StoreError;
use crate::model::{
    DateRange, Granularity, Reading, ReadingFlag, ResidualRecord, SeriesKey, Site, SiteId, SplineFit,
    VariableId,
};
use chrono::{DateTime, Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SITES_FILE: &str = "sites.json";
const CURRENT_FILE: &str = "CURRENT";
const LOCK_FILE: &str = "PUBLISH.lock";
/// A lock held longer than this belongs to a crashed publisher.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Default)]
struct SeriesColumns {
    timestamps: Vec<i64>,
    values: Vec<f64>,
    flags: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct ResidualColumns {
    timestamps: Vec<i64>,
    residuals: Vec<f64>,
    local_errors: Vec<f64>,
    fits: Vec<SplineFit>,
}

fn encode_ts(ts: &NaiveDateTime) -> i64 {
    ts.and_utc().timestamp()
}

fn decode_ts(secs: i64, path: &Path) -> Result<NaiveDateTime, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .map(|d| d.naive_utc())
        .ok_or_else(|| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("timestamp {} out of range", secs),
        })
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Write to a sibling temp file and rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("partition"),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Sorted names of the sub-directories of `dir`; empty if it does not exist.
fn list_dirs(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Exclusive lock over reading and swapping `CURRENT`. Held only for the
/// swap itself, so waiters poll.
struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed() > LOCK_STALE_AFTER {
                        warn!(path = %path.display(), "Breaking stale publish lock.");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// SERIES
// ============================================================================

/// Partitioned series store rooted at a data directory.
#[derive(Debug)]
pub struct FsSeriesStore {
    root: PathBuf,
    sites: RwLock<BTreeMap<SiteId, Site>>,
}

impl FsSeriesStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let path = root.join(SITES_FILE);
        let sites = match read_file(&path)? {
            Some(bytes) => {
                let list: Vec<Site> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|s| (s.site_id.clone(), s)).collect()
            }
            None => BTreeMap::new(),
        };
        Ok(Self {
            root,
            sites: RwLock::new(sites),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self, key: &SeriesKey, granularity: Granularity) -> PathBuf {
        self.root
            .join(granularity.dir_name())
            .join("sites")
            .join(key.site_id.as_str())
            .join(key.variable_id.as_str())
    }

    /// Write `readings` into their yearly partitions, merging with what is
    /// already stored. Existing readings win on duplicate timestamps.
    pub fn write_series(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        readings: &[Reading],
    ) -> Result<(), StoreError> {
        let mut by_year: BTreeMap<i32, Vec<Reading>> = BTreeMap::new();
        for r in readings {
            by_year.entry(r.timestamp.year()).or_default().push(r.clone());
        }
        let dir = self.series_dir(key, granularity);
        for (year, fresh) in by_year {
            let path = dir.join(format!("{}.bin", year));
            let mut merged = match read_file(&path)? {
                Some(bytes) => decode_series(key, &bytes, &path)?,
                None => Vec::new(),
            };
            merged.extend(fresh);
            normalize(&mut merged);

            let columns = SeriesColumns {
                timestamps: merged.iter().map(|r| encode_ts(&r.timestamp)).collect(),
                values: merged.iter().map(|r| r.value).collect(),
                flags: merged.iter().map(|r| r.flag.to_u8()).collect(),
            };
            write_atomic(&path, &bincode::serialize(&columns)?)?;
        }
        Ok(())
    }

    /// Merge `sites` into the catalogue and persist it.
    pub fn write_sites(&self, sites: &[Site]) -> Result<(), StoreError> {
        let mut catalogue = self
            .sites
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for site in sites {
            catalogue.insert(site.site_id.clone(), site.clone());
        }
        let list: Vec<&Site> = catalogue.values().collect();
        write_atomic(&self.root.join(SITES_FILE), &serde_json::to_vec_pretty(&list)?)
    }
}

fn decode_series(key: &SeriesKey, bytes: &[u8], path: &Path) -> Result<Vec<Reading>, StoreError> {
    let columns: SeriesColumns = bincode::deserialize(bytes)?;
    if columns.values.len() != columns.timestamps.len() || columns.flags.len() != columns.timestamps.len() {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: "column lengths differ".into(),
        });
    }
    let mut out = Vec::with_capacity(columns.timestamps.len());
    for ((secs, value), flag) in columns.timestamps.iter().zip(&columns.values).zip(&columns.flags) {
        let flag = ReadingFlag::from_u8(*flag).ok_or_else(|| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unknown flag {}", flag),
        })?;
        out.push(Reading {
            site_id: key.site_id.clone(),
            variable_id: key.variable_id.clone(),
            timestamp: decode_ts(*secs, path)?,
            value: *value,
            flag,
        });
    }
    Ok(out)
}

impl SeriesStore for FsSeriesStore {
    fn readings(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<Reading>, StoreError> {
        let dir = self.series_dir(key, granularity);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            let year = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok());
            let Some(year) = year else { continue };
            if !range.contains_year(year) {
                continue;
            }
            if let Some(bytes) = read_file(&path)? {
                out.extend(
                    decode_series(key, &bytes, &path)?
                        .into_iter()
                        .filter(|r| range.contains(&r.timestamp)),
                );
            }
        }
        normalize(&mut out);
        debug!(series = %key, %granularity, readings = out.len(), "Loaded series slice.");
        Ok(out)
    }

    fn contains(&self, key: &SeriesKey, granularity: Granularity) -> Result<bool, StoreError> {
        Ok(self.series_dir(key, granularity).is_dir())
    }

    fn series_keys(&self, granularity: Granularity) -> Result<Vec<SeriesKey>, StoreError> {
        let sites_dir = self.root.join(granularity.dir_name()).join("sites");
        let mut keys = Vec::new();
        for site in list_dirs(&sites_dir)? {
            for variable in list_dirs(&sites_dir.join(&site))? {
                keys.push(SeriesKey::new(site.clone(), variable));
            }
        }
        Ok(keys)
    }

    fn sites_for_variable(
        &self,
        variable: &VariableId,
        granularity: Granularity,
    ) -> Result<Vec<SiteId>, StoreError> {
        let sites_dir = self.root.join(granularity.dir_name()).join("sites");
        Ok(list_dirs(&sites_dir)?
            .into_iter()
            .filter(|site| sites_dir.join(site).join(variable.as_str()).is_dir())
            .map(SiteId::new)
            .collect())
    }

    fn variables_for_site(
        &self,
        site_id: &SiteId,
        granularity: Granularity,
    ) -> Result<Vec<VariableId>, StoreError> {
        let site_dir = self
            .root
            .join(granularity.dir_name())
            .join("sites")
            .join(site_id.as_str());
        Ok(list_dirs(&site_dir)?.into_iter().map(VariableId::new).collect())
    }

    fn site(&self, site_id: &SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self
            .sites
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(site_id)
            .cloned())
    }
}

// ============================================================================
// RESIDUALS
// ============================================================================

/// Residual store publishing whole generations behind a `CURRENT` pointer.
#[derive(Debug, Clone)]
pub struct FsResidualStore {
    root: PathBuf,
}

impl FsResidualStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn granularity_dir(&self, granularity: Granularity) -> PathBuf {
        self.root.join("residuals").join(granularity.dir_name())
    }

    fn partition_path(generation_dir: &Path, key: &SeriesKey) -> PathBuf {
        generation_dir
            .join("sites")
            .join(key.site_id.as_str())
            .join(format!("{}.bin", key.variable_id.as_str()))
    }

    /// Decoded partition of the current generation. A superseded generation
    /// is deleted after `CURRENT` moves on, possibly while it is being read.
    /// A missing file is therefore only final once `CURRENT` is unchanged.
    fn load(&self, key: &SeriesKey, granularity: Granularity) -> Result<Option<ResidualColumns>, StoreError> {
        match self.current_generation(granularity)? {
            Some(generation) => self.load_from(key, granularity, generation),
            None => Ok(None),
        }
    }

    fn load_from(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        mut generation: String,
    ) -> Result<Option<ResidualColumns>, StoreError> {
        let dir = self.granularity_dir(granularity);
        for _ in 0..3 {
            let path = Self::partition_path(&dir.join(&generation), key);
            if let Some(bytes) = read_file(&path)? {
                return Ok(Some(bincode::deserialize(&bytes)?));
            }
            match self.current_generation(granularity)? {
                Some(next) if next != generation => generation = next,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }
}

impl ResidualStore for FsResidualStore {
    fn residuals(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<ResidualRecord>, StoreError> {
        let Some(columns) = self.load(key, granularity)? else {
            return Ok(Vec::new());
        };
        let path = self.granularity_dir(granularity);
        let mut out = Vec::new();
        for i in 0..columns.timestamps.len() {
            let timestamp = decode_ts(columns.timestamps[i], &path)?;
            if !range.contains(&timestamp) {
                continue;
            }
            let (Some(residual), Some(local_error)) =
                (columns.residuals.get(i), columns.local_errors.get(i))
            else {
                return Err(StoreError::Corrupt {
                    path,
                    reason: "residual column lengths differ".into(),
                });
            };
            out.push(ResidualRecord {
                site_id: key.site_id.clone(),
                variable_id: key.variable_id.clone(),
                timestamp,
                residual: *residual,
                local_error: *local_error,
            });
        }
        Ok(out)
    }

    fn fits(&self, key: &SeriesKey, granularity: Granularity) -> Result<Vec<SplineFit>, StoreError> {
        Ok(self
            .load(key, granularity)?
            .map(|c| c.fits)
            .unwrap_or_default())
    }

    fn current_generation(&self, granularity: Granularity) -> Result<Option<String>, StoreError> {
        let path = self.granularity_dir(granularity).join(CURRENT_FILE);
        Ok(read_file(&path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|name| !name.is_empty()))
    }

    fn begin_run(&self, granularity: Granularity) -> Result<Box<dyn ResidualWriter>, StoreError> {
        let base = self.granularity_dir(granularity);
        let generation = new_generation_name();
        let dir = base.join(&generation);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        debug!(%granularity, generation = %generation, "Opened staging generation.");
        Ok(Box::new(FsResidualWriter {
            store: self.clone(),
            granularity,
            generation,
            dir,
            published: false,
        }))
    }
}

struct FsResidualWriter {
    store: FsResidualStore,
    granularity: Granularity,
    generation: String,
    dir: PathBuf,
    published: bool,
}

impl ResidualWriter for FsResidualWriter {
    fn generation(&self) -> &str {
        &self.generation
    }

    fn write_partition(&mut self, key: &SeriesKey, partition: ResidualPartition) -> Result<(), StoreError> {
        let path = FsResidualStore::partition_path(&self.dir, key);
        let mut records = partition.records;
        records.sort_by_key(|r| r.timestamp);
        let columns = ResidualColumns {
            timestamps: records.iter().map(|r| encode_ts(&r.timestamp)).collect(),
            residuals: records.iter().map(|r| r.residual).collect(),
            local_errors: records.iter().map(|r| r.local_error).collect(),
            fits: partition.fits,
        };
        write_atomic(&path, &bincode::serialize(&columns)?)
    }

    fn publish(mut self: Box<Self>) -> Result<String, StoreError> {
        if self.published {
            return Err(StoreError::AlreadyPublished);
        }
        let base = self.store.granularity_dir(self.granularity);
        let lock = PublishLock::acquire(&base)?;
        let previous = self.store.current_generation(self.granularity)?;

        write_atomic(&base.join(CURRENT_FILE), self.generation.as_bytes())?;
        self.published = true;
        drop(lock);

        if let Some(old) = previous.filter(|old| *old != self.generation) {
            let old_dir = base.join(&old);
            if let Err(e) = std::fs::remove_dir_all(&old_dir) {
                warn!(generation = %old, error = %e, "Failed to remove superseded generation.");
            }
        }
        Ok(self.generation.clone())
    }
}

impl Drop for FsResidualWriter {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}
