use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::dealer::DealerConfig;
use crate::demand::DemandConfig;
use crate::detox::DetoxConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::inventory::Site;
use crate::lock::LocksConfig;
use crate::quota::QuotaConfig;
use crate::rest::RestConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub sites: Vec<Site>,
    /// Replica catalog endpoint; without it the inventory is never refreshed.
    pub catalog: Option<RestConfig>,
    pub demand: DemandConfig,
    pub locks: LocksConfig,
    pub quota: QuotaConfig,
    pub detox: DetoxConfig,
    pub dealer: DealerConfig,
    /// Retry policy of persistent store calls.
    pub retry: RetryPolicy,
    pub history_db_path: Option<String>,
}

impl ReplicaConfig {
    pub fn load(path: &Path) -> ReplicaResult<Self> {
        let config: ReplicaConfig = read_json_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReplicaResult<()> {
        let mut names = BTreeSet::new();
        for site in self.sites.iter() {
            if site.name.is_empty() {
                return Err(ReplicaError::InvalidParam("site with empty name".to_string()));
            }
            if !names.insert(site.name.as_str()) {
                return Err(ReplicaError::InvalidParam(format!("duplicate site {}", site.name)));
            }
        }
        if self.demand.max_parallel_fetch == 0 {
            return Err(ReplicaError::InvalidParam(
                "demand.max_parallel_fetch must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || !(self.retry.multiplier >= 1.0) {
            return Err(ReplicaError::InvalidParam(format!(
                "invalid retry policy {:?}",
                self.retry
            )));
        }
        for (name, source) in self.locks.sources.iter() {
            if source.url.is_empty() {
                return Err(ReplicaError::InvalidParam(format!("lock source {} has no url", name)));
            }
        }
        self.detox.validate()?;
        self.dealer.validate()?;
        Ok(())
    }
}

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> ReplicaResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ReplicaError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| ReplicaError::InvalidData(format!("parse {} failed: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::SiteStatus;
    use crate::lock::LockContentType;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "sites": [
            {"name": "T2_US_MIT"},
            {"name": "T1_US_FNAL_Disk", "storage_type": "disk", "status": "waitroom"}
        ],
        "catalog": {"url_base": "https://cmsweb.cern.ch/phedex/datasvc/json/prod", "timeout_secs": 120},
        "demand": {"max_back_query": 3, "popdb": {"url_base": "https://cmsweb.cern.ch/popdb"}},
        "locks": {
            "sources": {
                "unified": {
                    "url": "https://cmst2.web.cern.ch/unified/datalocks.json",
                    "content_type": "SITE_TO_DATASETS",
                    "sites": "T2_*",
                    "lock_url": "https://cmst2.web.cern.ch/unified/globallocks.json.lock"
                }
            }
        },
        "quota": {"quotas": {"T2_US_MIT": {"AnalysisOps": 500}}},
        "detox": {"exceptions": [["Keep", "*", "/ZeroBias*/*/RECO"]]},
        "dealer": {"source_groups": ["AnalysisOps", "DataOps"], "max_replication": 4}
    }"#;

    #[test]
    fn test_load_sample() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("replica.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ReplicaConfig::load(&path).unwrap();
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.sites[0].status, SiteStatus::Active);
        assert_eq!(config.sites[1].status, SiteStatus::Waitroom);
        assert_eq!(config.catalog.as_ref().unwrap().timeout_secs, 120);
        assert_eq!(config.demand.max_back_query, 3);
        assert_eq!(config.demand.retention_days, 730);
        assert_eq!(config.locks.lock_wait_secs, 60);
        let unified = config.locks.sources.get("unified").unwrap();
        assert_eq!(unified.content_type, LockContentType::SiteToDatasets);
        assert!(unified.sites.as_ref().unwrap().matches("T2_CH_CERN"));
        assert_eq!(config.detox.threshold_occupancy, 0.9);
        assert_eq!(config.detox.exceptions.len(), 1);
        assert_eq!(config.dealer.max_replication, 4);
        assert!(config.dealer.source_groups.contains("DataOps"));
        assert!(config.history_db_path.is_none());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");

        std::fs::write(&path, r#"{"detox": {"exceptions": [["Keep", "*", "*"], ["Maybe", "*", "*"]]}}"#).unwrap();
        assert!(matches!(
            ReplicaConfig::load(&path).unwrap_err(),
            ReplicaError::InvalidData(_)
        ));

        std::fs::write(&path, r#"{"dealer": {"request_to_replica_threshold": -1}}"#).unwrap();
        assert!(matches!(
            ReplicaConfig::load(&path).unwrap_err(),
            ReplicaError::InvalidParam(_)
        ));

        std::fs::write(&path, r#"{"sites": [{"name": "T2_A"}, {"name": "T2_A"}]}"#).unwrap();
        assert!(ReplicaConfig::load(&path).is_err());

        assert!(matches!(
            ReplicaConfig::load(&tmp.path().join("missing.json")).unwrap_err(),
            ReplicaError::IoError(_)
        ));
    }
}
