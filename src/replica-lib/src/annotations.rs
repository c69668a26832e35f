use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Demand summary of one dataset replica.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplicaAccess {
    pub rank: f64,
    pub num_access: u64,
    pub tot_cpu: f64,
    /// Unix time of the last access day, 0 if never accessed.
    pub last_access: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDemand {
    pub global_usage_rank: f64,
    /// site -> access summary
    pub local_usage: BTreeMap<String, ReplicaAccess>,
}

/// site -> locked block names
pub type LockedBlocks = BTreeMap<String, BTreeSet<String>>;

/// dataset -> locked blocks per site
pub type LockMap = HashMap<String, LockedBlocks>;

/// dataset -> demand
pub type DemandMap = HashMap<String, DatasetDemand>;

/// Per-cycle annotations kept beside the inventory, keyed by dataset name.
#[derive(Debug, Clone, Default)]
pub struct CycleAnnotations {
    demand: DemandMap,
    locks: LockMap,
    request_weights: HashMap<String, f64>,
    locks_valid: bool,
}

impl CycleAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_usage_rank(&self, dataset: &str) -> Option<f64> {
        self.demand.get(dataset).map(|d| d.global_usage_rank)
    }

    pub fn is_locked(&self, dataset: &str, site: &str, block: &str) -> bool {
        self.locks
            .get(dataset)
            .and_then(|per_site| per_site.get(site))
            .map(|blocks| blocks.contains(block))
            .unwrap_or(false)
    }

    pub fn request_weight(&self, dataset: &str) -> Option<f64> {
        self.request_weights.get(dataset).copied()
    }

    /// True while the lock table was read completely against the current inventory.
    pub fn locks_valid(&self) -> bool {
        self.locks_valid
    }

    /// Replaces the whole demand table.
    pub fn replace_demand(&mut self, demand: DemandMap) {
        self.demand = demand;
    }

    /// Replaces the whole lock table; the previous table is dropped, never merged.
    pub fn replace_locks(&mut self, locks: LockMap) {
        self.locks = locks;
        self.locks_valid = true;
    }

    /// Keeps the lock table for later inspection but stops deletion from
    /// trusting it until the next complete read.
    pub fn mark_locks_stale(&mut self) {
        self.locks_valid = false;
    }

    pub fn set_request_weights(&mut self, weights: HashMap<String, f64>) {
        self.request_weights = weights;
    }

    pub fn set_request_weight(&mut self, dataset: &str, weight: f64) {
        self.request_weights.insert(dataset.to_string(), weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_locks_drops_previous() {
        let mut ann = CycleAnnotations::new();
        assert!(!ann.locks_valid());

        let mut locks = LockMap::new();
        locks
            .entry("/A/B/RECO".to_string())
            .or_default()
            .entry("T2_US_MIT".to_string())
            .or_default()
            .insert("b1".to_string());
        ann.replace_locks(locks);
        assert!(ann.locks_valid());
        assert!(ann.is_locked("/A/B/RECO", "T2_US_MIT", "b1"));

        ann.mark_locks_stale();
        assert!(!ann.locks_valid());
        assert!(ann.is_locked("/A/B/RECO", "T2_US_MIT", "b1"));

        ann.replace_locks(LockMap::new());
        assert!(!ann.is_locked("/A/B/RECO", "T2_US_MIT", "b1"));
        assert!(ann.locks_valid());
    }

    #[test]
    fn test_rank_lookup() {
        let mut ann = CycleAnnotations::new();
        let mut demand = DemandMap::new();
        demand.insert(
            "/A/B/RECO".to_string(),
            DatasetDemand {
                global_usage_rank: 3.5,
                local_usage: BTreeMap::new(),
            },
        );
        ann.replace_demand(demand);
        assert_eq!(ann.global_usage_rank("/A/B/RECO"), Some(3.5));
        assert_eq!(ann.global_usage_rank("/X/Y/Z"), None);
    }
}
