//! Storage seams. Series readings are read-only to the engine; residuals are
//! written by the pipeline in whole generations and read by the dispatcher.

pub mod fs;
pub mod memory;

pub use fs::{FsResidualStore, FsSeriesStore};
pub use memory::{MemoryResidualStore, MemorySeriesStore};

use crate::error::StoreError;
use crate::model::{
    DateRange, Granularity, Reading, ResidualRecord, SeriesKey, Site, SiteId, SplineFit, VariableId,
};

/// Read access to per-site, per-variable readings.
pub trait SeriesStore: Send + Sync {
    /// Readings for `key` inside `range`, ascending by timestamp and
    /// deduplicated (first occurrence wins). Missing-value markers are kept.
    fn readings(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<Reading>, StoreError>;

    fn contains(&self, key: &SeriesKey, granularity: Granularity) -> Result<bool, StoreError>;

    fn series_keys(&self, granularity: Granularity) -> Result<Vec<SeriesKey>, StoreError>;

    fn sites_for_variable(
        &self,
        variable: &VariableId,
        granularity: Granularity,
    ) -> Result<Vec<SiteId>, StoreError>;

    /// Variables with a series at `site_id`, sorted.
    fn variables_for_site(
        &self,
        site_id: &SiteId,
        granularity: Granularity,
    ) -> Result<Vec<VariableId>, StoreError>;

    fn site(&self, site_id: &SiteId) -> Result<Option<Site>, StoreError>;
}

/// Residuals and fits for one (site, variable) pair from a single run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResidualPartition {
    pub records: Vec<ResidualRecord>,
    pub fits: Vec<SplineFit>,
}

impl ResidualPartition {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.fits.is_empty()
    }
}

/// Precomputed residuals, organised in published generations.
pub trait ResidualStore: Send + Sync {
    /// Records of the current generation for `key` inside `range`, ascending.
    /// Empty when no run has been published or the pair had no fitted window.
    fn residuals(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<ResidualRecord>, StoreError>;

    fn fits(&self, key: &SeriesKey, granularity: Granularity) -> Result<Vec<SplineFit>, StoreError>;

    /// Name of the currently published generation, if any.
    fn current_generation(&self, granularity: Granularity) -> Result<Option<String>, StoreError>;

    /// Open a staging generation. Nothing is visible to readers until
    /// [`ResidualWriter::publish`].
    fn begin_run(&self, granularity: Granularity) -> Result<Box<dyn ResidualWriter>, StoreError>;
}

pub trait ResidualWriter: Send {
    fn generation(&self) -> &str;

    fn write_partition(&mut self, key: &SeriesKey, partition: ResidualPartition) -> Result<(), StoreError>;

    /// Atomically make this generation current. Returns its name.
    fn publish(self: Box<Self>) -> Result<String, StoreError>;
}

/// Sort ascending by timestamp and keep the first reading of each timestamp.
pub(crate) fn normalize(readings: &mut Vec<Reading>) {
    readings.sort_by_key(|r| r.timestamp);
    readings.dedup_by_key(|r| r.timestamp);
}

pub(crate) fn new_generation_name() -> String {
    format!("gen-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingFlag;
    use chrono::NaiveDate;

    #[test]
    fn test_normalize_keeps_first_duplicate() {
        let key = SeriesKey::new("060371103", "88101");
        let day = |d| {
            NaiveDate::from_ymd_opt(2020, 1, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        let mut readings = vec![
            Reading::new(&key, day(2), 2.0),
            Reading::new(&key, day(1), 1.0),
            Reading::new(&key, day(2), 99.0),
            Reading::missing(&key, day(3)),
        ];
        normalize(&mut readings);
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[1].value, 2.0);
        assert_eq!(readings[2].flag, ReadingFlag::Missing);
    }
}
