use super::{new_generation_name, normalize, ResidualPartition, ResidualStore, ResidualWriter, SeriesStore};
use crate::error::StoreError;
use crate::model::{
    DateRange, Granularity, Reading, ResidualRecord, SeriesKey, Site, SiteId, SplineFit, VariableId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// In-memory series store for fixtures and tests.
#[derive(Debug, Default)]
pub struct MemorySeriesStore {
    series: BTreeMap<(Granularity, SeriesKey), Vec<Reading>>,
    sites: BTreeMap<SiteId, Site>,
}

impl MemorySeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add readings to a series; later duplicates of a timestamp are dropped.
    pub fn insert(&mut self, granularity: Granularity, key: SeriesKey, readings: Vec<Reading>) {
        let entry = self.series.entry((granularity, key)).or_default();
        entry.extend(readings);
        normalize(entry);
    }

    pub fn insert_site(&mut self, site: Site) {
        self.sites.insert(site.site_id.clone(), site);
    }
}

impl SeriesStore for MemorySeriesStore {
    fn readings(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<Reading>, StoreError> {
        Ok(self
            .series
            .get(&(granularity, key.clone()))
            .map(|all| {
                all.iter()
                    .filter(|r| range.contains(&r.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn contains(&self, key: &SeriesKey, granularity: Granularity) -> Result<bool, StoreError> {
        Ok(self.series.contains_key(&(granularity, key.clone())))
    }

    fn series_keys(&self, granularity: Granularity) -> Result<Vec<SeriesKey>, StoreError> {
        Ok(self
            .series
            .keys()
            .filter(|(g, _)| *g == granularity)
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn sites_for_variable(
        &self,
        variable: &VariableId,
        granularity: Granularity,
    ) -> Result<Vec<SiteId>, StoreError> {
        Ok(self
            .series
            .keys()
            .filter(|(g, k)| *g == granularity && &k.variable_id == variable)
            .map(|(_, k)| k.site_id.clone())
            .collect())
    }

    fn variables_for_site(
        &self,
        site_id: &SiteId,
        granularity: Granularity,
    ) -> Result<Vec<VariableId>, StoreError> {
        Ok(self
            .series
            .keys()
            .filter(|(g, k)| *g == granularity && &k.site_id == site_id)
            .map(|(_, k)| k.variable_id.clone())
            .collect())
    }

    fn site(&self, site_id: &SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.sites.get(site_id).cloned())
    }
}

type Generation = HashMap<SeriesKey, ResidualPartition>;

#[derive(Debug, Default)]
struct Published {
    name: String,
    partitions: Generation,
}

/// In-memory residual store. Publishing swaps a whole generation under a
/// write lock, so readers never observe a partial run.
#[derive(Debug, Default, Clone)]
pub struct MemoryResidualStore {
    current: Arc<RwLock<HashMap<Granularity, Arc<Published>>>>,
}

impl MemoryResidualStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn published(&self, granularity: Granularity) -> Option<Arc<Published>> {
        self.current
            .read()
            .ok()
            .and_then(|map| map.get(&granularity).cloned())
    }
}

impl ResidualStore for MemoryResidualStore {
    fn residuals(
        &self,
        key: &SeriesKey,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<ResidualRecord>, StoreError> {
        Ok(self
            .published(granularity)
            .and_then(|p| {
                p.partitions.get(key).map(|part| {
                    part.records
                        .iter()
                        .filter(|r| range.contains(&r.timestamp))
                        .cloned()
                        .collect()
                })
            })
            .unwrap_or_default())
    }

    fn fits(&self, key: &SeriesKey, granularity: Granularity) -> Result<Vec<SplineFit>, StoreError> {
        Ok(self
            .published(granularity)
            .and_then(|p| p.partitions.get(key).map(|part| part.fits.clone()))
            .unwrap_or_default())
    }

    fn current_generation(&self, granularity: Granularity) -> Result<Option<String>, StoreError> {
        Ok(self.published(granularity).map(|p| p.name.clone()))
    }

    fn begin_run(&self, granularity: Granularity) -> Result<Box<dyn ResidualWriter>, StoreError> {
        Ok(Box::new(MemoryResidualWriter {
            granularity,
            staging: Published {
                name: new_generation_name(),
                partitions: HashMap::new(),
            },
            target: Arc::clone(&self.current),
        }))
    }
}

struct MemoryResidualWriter {
    granularity: Granularity,
    staging: Published,
    target: Arc<RwLock<HashMap<Granularity, Arc<Published>>>>,
}

impl ResidualWriter for MemoryResidualWriter {
    fn generation(&self) -> &str {
        &self.staging.name
    }

    fn write_partition(&mut self, key: &SeriesKey, partition: ResidualPartition) -> Result<(), StoreError> {
        let entry = self.staging.partitions.entry(key.clone()).or_default();
        entry.records.extend(partition.records);
        entry.records.sort_by_key(|r| r.timestamp);
        entry.fits.extend(partition.fits);
        entry.fits.sort_by_key(|f| f.window_start);
        Ok(())
    }

    fn publish(self: Box<Self>) -> Result<String, StoreError> {
        let name = self.staging.name.clone();
        let mut map = self
            .target
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(self.granularity, Arc::new(self.staging));
        Ok(name)
    }
}
