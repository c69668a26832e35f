use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::access_store::SqliteAccessStore;
use crate::catalog::ReplicaInfoSource;
use crate::dealer::{DealerConfig, ReplicationPolicy};
use crate::demand::{DemandCollector, DemandConfig};
use crate::detox::{DecisionRule, DeletionPolicy, DetoxConfig};
use crate::error::{ReplicaError, ReplicaResult};
use crate::history::SqliteHistory;
use crate::inventory::tests::record;
use crate::inventory::{BlockReplicaRecord, Site, NULL_GROUP};
use crate::lock::{LockAggregator, LockContentType, LockFetcher, LockSource};
use crate::manager::ReplicaManager;
use crate::popularity::{UsageEntry, UsageStatsSource};
use crate::quota::StaticQuota;
use crate::retry::tests::RecordingSleeper;

const TB: u64 = 1_000_000_000_000;
const DAY: i64 = 86400;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

#[derive(Default)]
struct FakeCatalog {
    full: Vec<BlockReplicaRecord>,
    updated: Mutex<Vec<BlockReplicaRecord>>,
    deleted: Mutex<Vec<BlockReplicaRecord>>,
    fail: Mutex<bool>,
}

impl FakeCatalog {
    fn check(&self) -> ReplicaResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(ReplicaError::RemoteError("catalog down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaInfoSource for FakeCatalog {
    async fn get_replicas(
        &self,
        site: Option<&str>,
        _dataset: Option<&str>,
        _block: Option<&str>,
    ) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        self.check()?;
        Ok(self
            .full
            .iter()
            .filter(|r| Some(r.site.as_str()) == site)
            .cloned()
            .collect())
    }

    async fn get_updated_replicas(&self, _since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        self.check()?;
        Ok(std::mem::take(&mut *self.updated.lock().unwrap()))
    }

    async fn get_deleted_replicas(&self, _since: i64) -> ReplicaResult<Vec<BlockReplicaRecord>> {
        self.check()?;
        Ok(std::mem::take(&mut *self.deleted.lock().unwrap()))
    }
}

struct NoUsage;

#[async_trait]
impl UsageStatsSource for NoUsage {
    async fn fetch(&self, _site: &str, _date: NaiveDate) -> ReplicaResult<Vec<UsageEntry>> {
        Ok(Vec::new())
    }
}

/// Serves a dataset list; `None` makes the fetch fail.
struct FakeLocks {
    data: Mutex<Option<Value>>,
}

#[async_trait]
impl LockFetcher for FakeLocks {
    fn describe(&self) -> String {
        "fake locks".to_string()
    }

    async fn fetch(&self) -> ReplicaResult<Value> {
        self.data
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ReplicaError::RemoteError("lock source down".to_string()))
    }

    async fn is_regenerating(&self) -> ReplicaResult<bool> {
        Ok(false)
    }
}

/// 95 TB at T2_X under a 100 TB quota: custodial C 77, P 10 (rank 5), Q 8 (rank 2).
/// Never-accessed replicas rank by age in days minus one per TB.
fn site_x_catalog() -> FakeCatalog {
    let mut p = record("/P/A/AOD", "p1", "T2_X", "AnalysisOps", 10 * TB);
    p.last_update = now().timestamp() - 15 * DAY;
    let mut q = record("/Q/A/AOD", "q1", "T2_X", "AnalysisOps", 8 * TB);
    q.last_update = now().timestamp() - 10 * DAY;
    let mut c = record("/C/A/AOD", "c1", "T2_X", "AnalysisOps", 77 * TB);
    c.is_custodial = true;
    FakeCatalog {
        full: vec![p, q, c],
        ..Default::default()
    }
}

struct Fixture {
    tmp: TempDir,
    catalog: Arc<FakeCatalog>,
    locks: Arc<FakeLocks>,
    manager: ReplicaManager,
}

impl Fixture {
    fn new(locks: Option<Value>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().unwrap();
        let catalog = Arc::new(site_x_catalog());
        let locks = Arc::new(FakeLocks {
            data: Mutex::new(locks),
        });

        let mut quota = StaticQuota::default();
        quota.set_quota_tb("T2_X", "AnalysisOps", 100.0);

        let store = Arc::new(SqliteAccessStore::new(Self::path(&tmp, "accesses.db")).unwrap());
        let demand = DemandCollector::new(
            DemandConfig {
                max_back_query: 1,
                ..Default::default()
            },
            Arc::new(NoUsage),
            store,
        );
        let aggregator = LockAggregator::new(
            vec![LockSource {
                name: "test".to_string(),
                content_type: LockContentType::ListOfDatasets,
                site_pattern: None,
                fetcher: locks.clone(),
            }],
            Duration::from_secs(60),
            3,
            Arc::new(RecordingSleeper::default()),
        );

        let manager = ReplicaManager::new(
            vec![Site::new("T2_X")],
            aggregator,
            Arc::new(quota),
            DeletionPolicy::new(DetoxConfig::default()).unwrap(),
            ReplicationPolicy::new(DealerConfig::default()).unwrap(),
        )
        .with_catalog(catalog.clone())
        .with_demand(demand)
        .with_history(SqliteHistory::new(Self::path(&tmp, "history.db")).unwrap())
        .unwrap();

        Self {
            tmp,
            catalog,
            locks,
            manager,
        }
    }

    fn path(tmp: &TempDir, name: &str) -> String {
        tmp.path().join(name).to_string_lossy().to_string()
    }

    fn deleted_datasets(report: &crate::manager::CycleReport) -> Vec<String> {
        report
            .deletions
            .as_ref()
            .map(|d| d.decisions.iter().map(|x| x.dataset.clone()).collect())
            .unwrap_or_default()
    }
}

#[tokio::test]
async fn test_full_cycle_selects_lowest_rank() {
    let fixture = Fixture::new(Some(json!([])));
    let mut weights = HashMap::new();
    weights.insert("/P/A/AOD".to_string(), 3.5);
    fixture.manager.set_request_weights(weights).await;

    let report = fixture.manager.run_cycle_at(now()).await.unwrap();
    assert_eq!(report.run_number, 1);
    assert_eq!(report.refresh.as_ref().unwrap().applied, 3);
    assert!(report.demand_updated);
    assert!(report.locks_updated);

    let detox = report.deletions.as_ref().unwrap();
    assert_eq!(Fixture::deleted_datasets(&report), vec!["/Q/A/AOD"]);
    assert_eq!(detox.decisions[0].rule, DecisionRule::Occupancy);
    assert_eq!(detox.partitions[0].projected, 87 * TB);

    // 3.5 / 1.75 -> two replicas wanted, one exists
    assert_eq!(report.replication.requests, vec!["/P/A/AOD"]);

    let history = SqliteHistory::new(Fixture::path(&fixture.tmp, "history.db")).unwrap();
    assert_eq!(history.last_run().unwrap(), Some(1));
    let rows = history.load_deletions(1).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].block, "q1");
    assert_eq!(rows[0].rule, "occupancy");
    assert_eq!(history.load_dataset_popularity(1).unwrap()[0].name, "/P/A/AOD");
}

#[tokio::test]
async fn test_lock_failure_skips_deletion_and_keeps_previous_locks() {
    let fixture = Fixture::new(Some(json!(["/Q/A/AOD"])));

    let report = fixture.manager.run_cycle_at(now()).await.unwrap();
    assert_eq!(Fixture::deleted_datasets(&report), vec!["/P/A/AOD"]);

    *fixture.locks.data.lock().unwrap() = None;
    let report = fixture.manager.run_cycle_at(now() + chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(report.run_number, 2);
    assert!(!report.locks_updated);
    assert!(report.deletions.is_none());

    let annotations = fixture.manager.annotations_snapshot().await;
    assert!(!annotations.locks_valid());
    assert!(annotations.is_locked("/Q/A/AOD", "T2_X", "q1"));

    *fixture.locks.data.lock().unwrap() = Some(json!(["/Q/A/AOD"]));
    let report = fixture.manager.run_cycle_at(now() + chrono::Duration::hours(2)).await.unwrap();
    assert!(report.locks_updated);
    assert_eq!(Fixture::deleted_datasets(&report), vec!["/P/A/AOD"]);
}

#[tokio::test]
async fn test_new_dataset_not_deleted_while_locks_unreadable() {
    let fixture = Fixture::new(Some(json!([])));
    fixture.manager.run_cycle_at(now()).await.unwrap();

    // /R pushes T2_X over the threshold again
    let mut fresh = record("/R/A/AOD", "r1", "T2_X", "AnalysisOps", 5 * TB);
    fresh.last_update = now().timestamp() - 30 * DAY;
    fixture.catalog.updated.lock().unwrap().push(fresh);
    *fixture.locks.data.lock().unwrap() = None;

    let report = fixture.manager.run_cycle_at(now() + chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(report.refresh.as_ref().unwrap().applied, 1);
    assert!(!report.locks_updated);
    assert!(report.deletions.is_none());

    let history = SqliteHistory::new(Fixture::path(&fixture.tmp, "history.db")).unwrap();
    assert!(history.load_deletions(2).unwrap().is_empty());
}

#[tokio::test]
async fn test_no_deletion_without_lock_status() {
    let fixture = Fixture::new(None);
    let report = fixture.manager.run_cycle_at(now()).await.unwrap();
    assert!(!report.locks_updated);
    assert!(report.deletions.is_none());

    let history = SqliteHistory::new(Fixture::path(&fixture.tmp, "history.db")).unwrap();
    assert!(history.load_deletions(1).unwrap().is_empty());
}

#[tokio::test]
async fn test_incremental_refresh_and_catalog_failure() {
    let fixture = Fixture::new(Some(json!([])));
    fixture.manager.run_cycle_at(now()).await.unwrap();

    let mut gone = record("/Q/A/AOD", "q1", "T2_X", NULL_GROUP, 0);
    gone.block_size = 8 * TB;
    fixture.catalog.deleted.lock().unwrap().push(gone);
    let mut fresh = record("/R/A/AOD", "r1", "T2_X", "AnalysisOps", TB);
    fresh.last_update = now().timestamp() - DAY;
    fixture.catalog.updated.lock().unwrap().push(fresh);

    let report = fixture.manager.run_cycle_at(now() + chrono::Duration::hours(1)).await.unwrap();
    let stats = report.refresh.as_ref().unwrap();
    assert_eq!((stats.applied, stats.removed), (1, 1));

    let inventory = fixture.manager.inventory_snapshot().await;
    assert!(inventory.datasets.get("/Q/A/AOD").unwrap().replicas.is_empty());
    assert!(inventory.datasets.contains_key("/R/A/AOD"));

    // 77 + 10 + 1 TB stays under the threshold
    assert!(Fixture::deleted_datasets(&report).is_empty());

    *fixture.catalog.fail.lock().unwrap() = true;
    let report = fixture.manager.run_cycle_at(now() + chrono::Duration::hours(2)).await.unwrap();
    assert!(report.refresh.is_none());
    assert_eq!(fixture.manager.inventory_snapshot().await.datasets.len(), 4);
}

#[tokio::test]
async fn test_cycles_are_serialized() {
    let fixture = Fixture::new(Some(json!([])));
    let (a, b) = tokio::join!(
        fixture.manager.run_cycle_at(now()),
        fixture.manager.run_cycle_at(now())
    );
    let mut runs = vec![a.unwrap().run_number, b.unwrap().run_number];
    runs.sort();
    assert_eq!(runs, vec![1, 2]);

    // a reopened history continues the run numbering
    drop(fixture.manager);
    let history = SqliteHistory::new(Fixture::path(&fixture.tmp, "history.db")).unwrap();
    assert_eq!(history.last_run().unwrap(), Some(2));
}
