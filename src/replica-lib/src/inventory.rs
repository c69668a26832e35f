use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{ReplicaError, ReplicaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Disk,
    Mss,
    Buffer,
    Unknown,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Disk
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Active,
    Waitroom,
    Ignore,
    NoCopy,
}

impl FromStr for SiteStatus {
    type Err = ReplicaError;

    /// Unrecognized values map to `Ignore`; parsing never fails.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "active" | "1" => SiteStatus::Active,
            "waitroom" | "2" => SiteStatus::Waitroom,
            "nocopy" | "no_copy" | "-1" => SiteStatus::NoCopy,
            _ => SiteStatus::Ignore,
        })
    }
}

impl SiteStatus {
    pub fn is_targetable(&self) -> bool {
        matches!(self, SiteStatus::Active)
    }
}

impl Default for SiteStatus {
    fn default() -> Self {
        SiteStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub status: SiteStatus,
}

impl Site {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_type: StorageType::Disk,
            status: SiteStatus::Active,
        }
    }
}

/// Owner of replica records that report a deletion rather than a holding.
pub const NULL_GROUP: &str = "";

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Internal name, unique within the dataset.
    pub name: String,
    pub size: u64,
}

impl Block {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
        }
    }

    /// Translate a block real name (`/dataset#real` or just `real`) to the internal name.
    pub fn to_internal_name(real_name: &str) -> ReplicaResult<String> {
        let name = match real_name.rfind('#') {
            Some(pos) => &real_name[pos + 1..],
            None => real_name,
        };
        if name.is_empty() {
            return Err(ReplicaError::InvalidName(format!(
                "empty block name in {}",
                real_name
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ReplicaError::InvalidName(format!(
                "invalid block name {}",
                real_name
            )));
        }
        Ok(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockReplica {
    pub block: String,
    pub site: String,
    pub group: String,
    /// Bytes actually present; never exceeds the block size.
    pub size: u64,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub last_update: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetReplica {
    pub dataset: String,
    pub site: String,
    pub block_replicas: BTreeMap<String, BlockReplica>,
}

impl DatasetReplica {
    pub fn new(dataset: &str, site: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            site: site.to_string(),
            block_replicas: BTreeMap::new(),
        }
    }

    /// Bytes physically present at the site.
    pub fn physical_size(&self) -> u64 {
        self.block_replicas.values().map(|br| br.size).sum()
    }

    /// Sum of the full sizes of the blocks this replica holds.
    pub fn nominal_size(&self, dataset: &Dataset) -> u64 {
        self.block_replicas
            .keys()
            .filter_map(|name| dataset.blocks.get(name))
            .map(|b| b.size)
            .sum()
    }

    pub fn is_complete(&self, dataset: &Dataset) -> bool {
        !dataset.blocks.is_empty()
            && dataset.blocks.keys().all(|name| {
                self.block_replicas
                    .get(name)
                    .map(|br| br.is_complete)
                    .unwrap_or(false)
            })
    }

    /// Unix time of the most recent block replica update, 0 if empty.
    pub fn last_block_created(&self) -> i64 {
        self.block_replicas
            .values()
            .map(|br| br.last_update)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub blocks: BTreeMap<String, Block>,
    pub replicas: BTreeMap<String, DatasetReplica>,
}

impl Dataset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blocks: BTreeMap::new(),
            replicas: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.blocks.values().map(|b| b.size).sum()
    }

    pub fn find_block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    pub fn find_replica(&self, site: &str) -> Option<&DatasetReplica> {
        self.replicas.get(site)
    }
}

/// One block replica as reported by the catalog source.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReplicaRecord {
    pub dataset: String,
    pub block: String,
    pub block_size: u64,
    pub site: String,
    pub group: String,
    pub size: u64,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub last_update: i64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyStats {
    pub applied: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Read-only access used by the policies.
pub trait InventoryView: Send + Sync {
    fn sites(&self) -> Box<dyn Iterator<Item = &Site> + '_>;
    fn site(&self, name: &str) -> Option<&Site>;
    fn datasets(&self) -> Box<dyn Iterator<Item = &Dataset> + '_>;
    fn dataset(&self, name: &str) -> Option<&Dataset>;
}

#[derive(Debug, Default, Clone)]
pub struct Inventory {
    pub sites: BTreeMap<String, Site>,
    pub datasets: BTreeMap<String, Dataset>,
    /// Unix time of the last successful catalog refresh.
    pub last_refresh: Option<i64>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_site(&mut self, site: Site) {
        self.sites.insert(site.name.clone(), site);
    }

    pub fn set_site_status(&mut self, name: &str, status: SiteStatus) -> bool {
        match self.sites.get_mut(name) {
            Some(site) => {
                site.status = status;
                true
            }
            None => false,
        }
    }

    pub fn apply_replica_records(&mut self, records: &[BlockReplicaRecord]) -> ApplyStats {
        let mut stats = ApplyStats::default();
        for record in records {
            if !self.sites.contains_key(&record.site) {
                debug!(
                    "skip replica of {}#{} at unknown site {}",
                    record.dataset, record.block, record.site
                );
                stats.skipped += 1;
                continue;
            }

            if record.group == NULL_GROUP {
                if self.remove_block_replica(&record.dataset, &record.block, &record.site) {
                    stats.removed += 1;
                }
                continue;
            }

            if record.size > record.block_size {
                warn!(
                    "replica of {}#{} at {} reports {} bytes, larger than block size {}",
                    record.dataset, record.block, record.site, record.size, record.block_size
                );
                stats.skipped += 1;
                continue;
            }

            let dataset = self
                .datasets
                .entry(record.dataset.clone())
                .or_insert_with(|| Dataset::new(&record.dataset));
            let block = dataset
                .blocks
                .entry(record.block.clone())
                .or_insert_with(|| Block::new(&record.block, record.block_size));
            block.size = record.block_size;

            // a block that shrank can leave older replicas oversized
            for replica in dataset.replicas.values_mut() {
                if let Some(br) = replica.block_replicas.get_mut(&record.block) {
                    if br.size > record.block_size {
                        br.size = record.block_size;
                    }
                }
            }

            let replica = dataset
                .replicas
                .entry(record.site.clone())
                .or_insert_with(|| DatasetReplica::new(&record.dataset, &record.site));
            replica.block_replicas.insert(
                record.block.clone(),
                BlockReplica {
                    block: record.block.clone(),
                    site: record.site.clone(),
                    group: record.group.clone(),
                    size: record.size,
                    is_complete: record.is_complete,
                    is_custodial: record.is_custodial,
                    last_update: record.last_update,
                },
            );
            stats.applied += 1;
        }
        stats
    }

    fn remove_block_replica(&mut self, dataset_name: &str, block: &str, site: &str) -> bool {
        let Some(dataset) = self.datasets.get_mut(dataset_name) else {
            return false;
        };
        let Some(replica) = dataset.replicas.get_mut(site) else {
            return false;
        };
        let removed = replica.block_replicas.remove(block).is_some();
        if replica.block_replicas.is_empty() {
            dataset.replicas.remove(site);
        }
        removed
    }
}

impl InventoryView for Inventory {
    fn sites(&self) -> Box<dyn Iterator<Item = &Site> + '_> {
        Box::new(self.sites.values())
    }

    fn site(&self, name: &str) -> Option<&Site> {
        self.sites.get(name)
    }

    fn datasets(&self) -> Box<dyn Iterator<Item = &Dataset> + '_> {
        Box::new(self.datasets.values())
    }

    fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }
}
