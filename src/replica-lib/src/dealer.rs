use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::annotations::CycleAnnotations;
use crate::error::{ReplicaError, ReplicaResult};
use crate::inventory::InventoryView;

const BYTES_PER_TB: f64 = 1.0e12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DealerConfig {
    /// Groups whose holdings make a dataset eligible for replication.
    pub source_groups: BTreeSet<String>,
    /// In TB.
    pub max_dataset_size: f64,
    pub max_replication: u32,
    /// Request weight per desired replica.
    pub request_to_replica_threshold: f64,
}

impl Default for DealerConfig {
    fn default() -> Self {
        Self {
            source_groups: BTreeSet::from(["AnalysisOps".to_string()]),
            max_dataset_size: 50.0,
            max_replication: 10,
            request_to_replica_threshold: 1.75,
        }
    }
}

impl DealerConfig {
    pub fn validate(&self) -> ReplicaResult<()> {
        if !(self.request_to_replica_threshold > 0.0 && self.request_to_replica_threshold.is_finite()) {
            return Err(ReplicaError::InvalidParam(format!(
                "request_to_replica_threshold must be positive, got {}",
                self.request_to_replica_threshold
            )));
        }
        if self.max_dataset_size.is_nan() || self.max_dataset_size < 0.0 {
            return Err(ReplicaError::InvalidParam(format!(
                "invalid max_dataset_size {}",
                self.max_dataset_size
            )));
        }
        Ok(())
    }
}

/// A dataset that passed the eligibility gates in this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsideredDataset {
    pub name: String,
    pub request_weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationRequests {
    /// Dataset names in request order; a name repeats once per desired new replica.
    pub requests: Vec<String>,
    pub considered: Vec<ConsideredDataset>,
}

pub struct ReplicationPolicy {
    config: DealerConfig,
}

impl ReplicationPolicy {
    pub fn new(config: DealerConfig) -> ReplicaResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DealerConfig {
        &self.config
    }

    /// Number of new replicas wanted for a dataset, clamped at 0.
    pub fn desired_new_replicas(&self, request_weight: f64, current_replicas: usize) -> usize {
        let wanted = (request_weight / self.config.request_to_replica_threshold).ceil();
        let wanted = wanted.min(self.config.max_replication as f64).max(0.0) as usize;
        wanted.saturating_sub(current_replicas)
    }

    pub fn get_requests(
        &self,
        inventory: &dyn InventoryView,
        annotations: &CycleAnnotations,
    ) -> ReplicationRequests {
        let max_size = self.config.max_dataset_size * BYTES_PER_TB;
        let mut considered = Vec::new();
        let mut pending: Vec<(&str, f64, usize)> = Vec::new();

        for dataset in inventory.datasets() {
            let Some(weight) = annotations.request_weight(&dataset.name) else {
                continue;
            };
            if !(weight > 0.0) {
                continue;
            }

            let in_source_groups = dataset.replicas.values().any(|dr| {
                dr.block_replicas
                    .values()
                    .any(|br| self.config.source_groups.contains(&br.group))
            });
            if !in_source_groups {
                continue;
            }
            if dataset.size() as f64 > max_size {
                debug!("{} too large to replicate ({} bytes)", dataset.name, dataset.size());
                continue;
            }

            considered.push(ConsideredDataset {
                name: dataset.name.clone(),
                request_weight: weight,
            });

            let count = self.desired_new_replicas(weight, dataset.replicas.len());
            if count == 0 {
                continue;
            }
            debug!("requesting {} copies of {} (weight {})", count, dataset.name, weight);
            pending.push((dataset.name.as_str(), weight, count));
        }

        pending.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let requests = interleave(&mut pending);

        info!(
            "dealer: {} requests over {} considered datasets",
            requests.len(),
            considered.len()
        );
        ReplicationRequests {
            requests,
            considered,
        }
    }
}

/// One pass per round, one unit per entry with a remaining count, in list order.
fn interleave(pending: &mut [(&str, f64, usize)]) -> Vec<String> {
    let mut out = Vec::with_capacity(pending.iter().map(|p| p.2).sum());
    loop {
        let mut added = false;
        for entry in pending.iter_mut() {
            if entry.2 == 0 {
                continue;
            }
            out.push(entry.0.to_string());
            entry.2 -= 1;
            added = true;
        }
        if !added {
            break;
        }
    }
    out
}
