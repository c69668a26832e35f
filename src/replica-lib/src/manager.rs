use chrono::{DateTime, Utc};
use log::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::access_store::SqliteAccessStore;
use crate::annotations::CycleAnnotations;
use crate::catalog::{PhedexReplicaSource, ReplicaInfoSource};
use crate::config::ReplicaConfig;
use crate::dealer::{ReplicationPolicy, ReplicationRequests};
use crate::demand::DemandCollector;
use crate::detox::{DeletionPolicy, DetoxResult};
use crate::error::ReplicaResult;
use crate::history::SqliteHistory;
use crate::inventory::{ApplyStats, Inventory, InventoryView, Site, SiteStatus};
use crate::lock::LockAggregator;
use crate::popularity::PopDbSource;
use crate::quota::{QuotaProvider, SqliteQuotaSource, StaticQuota};
use crate::retry::default_sleeper;

/// Outcome of one policy cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub run_number: u64,
    /// `None` when the catalog could not be read; the previous inventory was used.
    pub refresh: Option<ApplyStats>,
    pub demand_updated: bool,
    pub locks_updated: bool,
    /// `None` when deletion was skipped because locks could not be read this cycle.
    pub deletions: Option<DetoxResult>,
    pub replication: ReplicationRequests,
}

struct CycleState {
    inventory: Inventory,
    annotations: CycleAnnotations,
    run_number: u64,
}

/// Runs policy cycles over an inventory it owns. At most one cycle is in
/// flight; the inventory is only written during refresh and annotation.
pub struct ReplicaManager {
    state: tokio::sync::Mutex<CycleState>,
    catalog: Option<Arc<dyn ReplicaInfoSource>>,
    demand: Option<DemandCollector>,
    locks: LockAggregator,
    quota: Arc<dyn QuotaProvider>,
    detox: DeletionPolicy,
    dealer: ReplicationPolicy,
    history: Option<SqliteHistory>,
}

impl ReplicaManager {
    pub fn new(
        sites: Vec<Site>,
        locks: LockAggregator,
        quota: Arc<dyn QuotaProvider>,
        detox: DeletionPolicy,
        dealer: ReplicationPolicy,
    ) -> Self {
        let mut inventory = Inventory::new();
        for site in sites {
            inventory.add_site(site);
        }
        Self {
            state: tokio::sync::Mutex::new(CycleState {
                inventory,
                annotations: CycleAnnotations::new(),
                run_number: 0,
            }),
            catalog: None,
            demand: None,
            locks,
            quota,
            detox,
            dealer,
            history: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ReplicaInfoSource>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_demand(mut self, demand: DemandCollector) -> Self {
        self.demand = Some(demand);
        self
    }

    /// Run numbers continue after the last run recorded in the history.
    pub fn with_history(mut self, history: SqliteHistory) -> ReplicaResult<Self> {
        let last = history.last_run()?.unwrap_or(0);
        self.state.get_mut().run_number = last;
        self.history = Some(history);
        Ok(self)
    }

    pub fn from_config(config: &ReplicaConfig) -> ReplicaResult<Self> {
        config.validate()?;

        let quota: Arc<dyn QuotaProvider> = match config.quota.db_path.as_ref() {
            Some(path) => Arc::new(SqliteQuotaSource::new(path.clone())?),
            None => {
                let mut quota = StaticQuota::new(config.quota.quotas.clone());
                for site in config.sites.iter() {
                    quota.set_status(&site.name, site.status);
                }
                Arc::new(quota)
            }
        };

        let mut manager = Self::new(
            config.sites.clone(),
            LockAggregator::from_config(&config.locks)?,
            quota,
            DeletionPolicy::new(config.detox.clone())?,
            ReplicationPolicy::new(config.dealer.clone())?,
        );

        if let Some(catalog) = config.catalog.as_ref() {
            manager = manager.with_catalog(Arc::new(PhedexReplicaSource::new(catalog.clone())?));
        } else {
            warn!("no catalog configured, inventory will not be refreshed");
        }

        if config.demand.popdb.url_base.is_empty() {
            warn!("no popularity service configured, demand will not be computed");
        } else {
            let source = Arc::new(PopDbSource::new(config.demand.popdb.clone())?);
            let store = Arc::new(SqliteAccessStore::new(config.demand.store_path.clone())?);
            let collector = DemandCollector::new(config.demand.clone(), source, store)
                .with_store_retry(config.retry.clone(), default_sleeper());
            manager = manager.with_demand(collector);
        }

        if let Some(path) = config.history_db_path.as_ref() {
            manager = manager.with_history(SqliteHistory::new(path.clone())?)?;
        }
        Ok(manager)
    }

    /// Request weights for the next cycles, replacing any previous ones.
    pub async fn set_request_weights(&self, weights: HashMap<String, f64>) {
        let mut state = self.state.lock().await;
        state.annotations.set_request_weights(weights);
    }

    pub async fn run_cycle(&self) -> ReplicaResult<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> ReplicaResult<CycleReport> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.run_number += 1;
        let mut report = CycleReport {
            run_number: state.run_number,
            ..Default::default()
        };
        info!("starting cycle {}", report.run_number);

        self.update_site_status(&mut state.inventory);
        report.refresh = match self.refresh_inventory(&mut state.inventory, now).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("inventory refresh failed, using previous inventory: {}", e);
                None
            }
        };

        if let Some(collector) = self.demand.as_ref() {
            match collector.update(&state.inventory, now).await {
                Ok(demand) => {
                    state.annotations.replace_demand(demand);
                    report.demand_updated = true;
                }
                Err(e) => error!("demand update failed, keeping previous demand: {}", e),
            }
        }

        match self.locks.update(&state.inventory).await {
            Ok(locks) => {
                state.annotations.replace_locks(locks);
                report.locks_updated = true;
            }
            Err(e) => {
                error!("lock update failed, no deletion this cycle: {}", e);
                state.annotations.mark_locks_stale();
            }
        }

        let inventory: &dyn InventoryView = &state.inventory;
        report.deletions = if state.annotations.locks_valid() {
            Some(self.detox.evaluate(
                inventory,
                &state.annotations,
                self.quota.as_ref(),
                now.timestamp(),
            )?)
        } else {
            warn!("lock status not determined, skipping deletion in cycle {}", report.run_number);
            None
        };

        report.replication = self.dealer.get_requests(inventory, &state.annotations);

        if let Some(history) = self.history.as_ref() {
            history.new_run(report.run_number, "cycle", now.timestamp())?;
            if let Some(deletions) = report.deletions.as_ref() {
                history.save_deletions(report.run_number, &deletions.decisions)?;
            }
            history.save_dataset_popularity(report.run_number, &report.replication.considered)?;
        }

        info!(
            "cycle {} done: {} deletions, {} replication requests",
            report.run_number,
            report.deletions.as_ref().map(|d| d.decisions.len()).unwrap_or(0),
            report.replication.requests.len()
        );
        Ok(report)
    }

    /// Sites whose status cannot be read are not targeted this cycle.
    fn update_site_status(&self, inventory: &mut Inventory) {
        let names: Vec<String> = inventory.sites.keys().cloned().collect();
        for name in names {
            let status = match self.quota.get_status(&name) {
                Ok(status) => status,
                Err(e) => {
                    warn!("status of {} unavailable: {}", name, e);
                    SiteStatus::Ignore
                }
            };
            inventory.set_site_status(&name, status);
        }
    }

    /// First refresh loads every site; later ones apply changes since the last refresh.
    /// Records are applied only when every fetch succeeded.
    async fn refresh_inventory(
        &self,
        inventory: &mut Inventory,
        now: DateTime<Utc>,
    ) -> ReplicaResult<Option<ApplyStats>> {
        let Some(catalog) = self.catalog.as_ref() else {
            return Ok(None);
        };

        let records = match inventory.last_refresh {
            None => {
                let mut records = Vec::new();
                for site in inventory.sites.keys() {
                    records.extend(catalog.get_replicas(Some(site), None, None).await?);
                }
                records
            }
            Some(since) => {
                let mut records = catalog.get_updated_replicas(since).await?;
                records.extend(catalog.get_deleted_replicas(since).await?);
                records
            }
        };

        let stats = inventory.apply_replica_records(&records);
        inventory.last_refresh = Some(now.timestamp());
        info!(
            "inventory refreshed: {} applied, {} removed, {} skipped",
            stats.applied, stats.removed, stats.skipped
        );
        Ok(Some(stats))
    }

    pub async fn inventory_snapshot(&self) -> Inventory {
        self.state.lock().await.inventory.clone()
    }

    pub async fn annotations_snapshot(&self) -> CycleAnnotations {
        self.state.lock().await.annotations.clone()
    }
}
