use async_trait::async_trait;
use log::*;
use serde_json::Value;

use crate::error::{ReplicaError, ReplicaResult};
use crate::inventory::{Block, BlockReplicaRecord, NULL_GROUP};
use crate::rest::{RestConfig, RestService};

#[async_trait]
pub trait ReplicaInfoSource: Send + Sync {
    /// Replicas filtered by any combination of site, dataset and block.
    /// Without a filter nothing is fetched.
    async fn get_replicas(
        &self,
        site: Option<&str>,
        dataset: Option<&str>,
        block: Option<&str>,
    ) -> ReplicaResult<Vec<BlockReplicaRecord>>;

    async fn get_updated_replicas(&self, updated_since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>>;

    /// Deleted replicas, reported as records owned by the null group.
    async fn get_deleted_replicas(&self, deleted_since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>>;
}

#[derive(Clone, Copy)]
enum EntryKind {
    Replica,
    Deletion,
}

pub struct PhedexReplicaSource {
    service: RestService,
}

impl PhedexReplicaSource {
    pub fn new(config: RestConfig) -> ReplicaResult<Self> {
        Ok(Self {
            service: RestService::new(config)?,
        })
    }

    fn dataset_entries(result: &Value) -> ReplicaResult<&Vec<Value>> {
        let entries = result
            .get("phedex")
            .and_then(|p| p.get("dataset"))
            .or_else(|| result.get("dataset"))
            .unwrap_or(result);
        entries
            .as_array()
            .ok_or_else(|| ReplicaError::DecodeError("dataset list not found in catalog reply".to_string()))
    }

    pub fn make_block_replicas(result: &Value) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        Self::make_records(result, EntryKind::Replica)
    }

    pub fn make_deletions(result: &Value) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        Self::make_records(result, EntryKind::Deletion)
    }

    fn make_records(result: &Value, kind: EntryKind) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        let mut records = Vec::new();
        for dataset_entry in Self::dataset_entries(result)? {
            let dataset_name = str_field(dataset_entry, "name")?;
            let empty = Vec::new();
            let blocks = dataset_entry
                .get("block")
                .and_then(|b| b.as_array())
                .unwrap_or(&empty);

            for block_entry in blocks {
                let real_name = str_field(block_entry, "name")?;
                let block_name = match Block::to_internal_name(real_name) {
                    Ok(name) => name,
                    Err(e) => {
                        debug!("skip block {}: {}", real_name, e);
                        continue;
                    }
                };
                let block_size = u64_field(block_entry, "bytes").unwrap_or(0);

                match kind {
                    EntryKind::Replica => {
                        let replicas = block_entry
                            .get("replica")
                            .and_then(|r| r.as_array())
                            .unwrap_or(&empty);
                        for replica_entry in replicas {
                            let bytes = u64_field(replica_entry, "bytes").unwrap_or(0);
                            let group = replica_entry
                                .get("group")
                                .and_then(|g| g.as_str())
                                .unwrap_or(NULL_GROUP);
                            records.push(BlockReplicaRecord {
                                dataset: dataset_name.to_string(),
                                block: block_name.clone(),
                                block_size,
                                site: str_field(replica_entry, "node")?.to_string(),
                                group: group.to_string(),
                                size: bytes,
                                is_complete: bytes == block_size,
                                is_custodial: replica_entry
                                    .get("custodial")
                                    .and_then(|c| c.as_str())
                                    == Some("y"),
                                last_update: time_field(replica_entry, "time_update"),
                            });
                        }
                    }
                    EntryKind::Deletion => {
                        let deletions = block_entry
                            .get("deletion")
                            .and_then(|r| r.as_array())
                            .unwrap_or(&empty);
                        for deletion_entry in deletions {
                            records.push(BlockReplicaRecord {
                                dataset: dataset_name.to_string(),
                                block: block_name.clone(),
                                block_size,
                                site: str_field(deletion_entry, "node")?.to_string(),
                                group: NULL_GROUP.to_string(),
                                size: 0,
                                is_complete: false,
                                is_custodial: false,
                                last_update: time_field(deletion_entry, "time_complete"),
                            });
                        }
                    }
                }
            }
        }
        Ok(records)
    }
}

fn str_field<'a>(entry: &'a Value, key: &str) -> ReplicaResult<&'a str> {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ReplicaError::DecodeError(format!("missing string field {} in {}", key, entry)))
}

fn u64_field(entry: &Value, key: &str) -> Option<u64> {
    match entry.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

// timestamps come either as numbers or as strings with a fractional part
fn time_field(entry: &Value, key: &str) -> i64 {
    match entry.get(key) {
        Some(Value::Number(n)) => n.as_f64().map(|f| f as i64).unwrap_or(0),
        Some(Value::String(s)) => s.parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl ReplicaInfoSource for PhedexReplicaSource {
    async fn get_replicas(
        &self,
        site: Option<&str>,
        dataset: Option<&str>,
        block: Option<&str>,
    ) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        let mut options: Vec<(&str, String)> = Vec::new();
        if let Some(site) = site {
            options.push(("node", site.to_string()));
        }
        if let Some(dataset) = dataset {
            options.push(("dataset", dataset.to_string()));
        }
        if let Some(block) = block {
            options.push(("block", block.to_string()));
        }

        let desc = options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        info!("get_replicas({})  Fetching the list of replicas from PhEDEx", desc);

        if options.is_empty() {
            return Ok(Vec::new());
        }

        options.insert(0, ("show_dataset", "y".to_string()));
        let result = self.service.make_request("blockreplicas", &options).await?;
        Self::make_block_replicas(&result)
    }

    async fn get_updated_replicas(&self, updated_since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        info!("get_updated_replicas({})  Fetching the list of replicas from PhEDEx", updated_since);
        let options = [
            ("show_dataset", "y".to_string()),
            ("update_since", updated_since.to_string()),
        ];
        let result = self.service.make_request("blockreplicas", &options).await?;
        Self::make_block_replicas(&result)
    }

    async fn get_deleted_replicas(&self, deleted_since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        info!("get_deleted_replicas({})  Fetching the list of replicas from PhEDEx", deleted_since);
        let options = [("complete_since", deleted_since.to_string())];
        let result = self.service.make_request("deletions", &options).await?;
        Self::make_deletions(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_make_block_replicas() {
        let reply = json!({
            "phedex": {
                "dataset": [{
                    "name": "/A/B-v1/AOD",
                    "block": [
                        {
                            "name": "/A/B-v1/AOD#1234-abcd",
                            "bytes": 100,
                            "replica": [
                                {"node": "T1_US_FNAL_MSS", "group": "DataOps", "bytes": 100,
                                 "custodial": "y", "time_update": "1500000000.5"},
                                {"node": "T2_US_MIT", "group": "AnalysisOps", "bytes": 40,
                                 "custodial": "n", "time_update": 1500000100}
                            ]
                        },
                        {
                            "name": "/A/B-v1/AOD#bad name",
                            "bytes": 5,
                            "replica": [{"node": "T2_US_MIT", "group": "AnalysisOps", "bytes": 5,
                                         "custodial": "n", "time_update": 1}]
                        }
                    ]
                }]
            }
        });

        let records = PhedexReplicaSource::make_block_replicas(&reply).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].block, "1234-abcd");
        assert!(records[0].is_custodial);
        assert!(records[0].is_complete);
        assert_eq!(records[0].last_update, 1500000000);
        assert_eq!(records[1].site, "T2_US_MIT");
        assert!(!records[1].is_complete);
        assert!(!records[1].is_custodial);
        assert_eq!(records[1].size, 40);
    }

    #[test]
    fn test_make_deletions_use_null_group() {
        let reply = json!({
            "phedex": {
                "dataset": [{
                    "name": "/A/B-v1/AOD",
                    "block": [{
                        "name": "/A/B-v1/AOD#1234",
                        "bytes": 100,
                        "deletion": [{"node": "T2_US_MIT", "time_complete": 1500000200}]
                    }]
                }]
            }
        });
        let records = PhedexReplicaSource::make_deletions(&reply).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].group, NULL_GROUP);
        assert_eq!(records[0].site, "T2_US_MIT");
    }

    #[test]
    fn test_missing_dataset_list() {
        assert!(PhedexReplicaSource::make_block_replicas(&json!({"phedex": {}})).is_err());
    }
}
