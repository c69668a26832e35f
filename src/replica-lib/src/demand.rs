use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::access_store::{AccessRecord, AccessStore};
use crate::annotations::{DatasetDemand, DemandMap, ReplicaAccess};
use crate::error::ReplicaResult;
use crate::inventory::InventoryView;
use crate::popularity::UsageStatsSource;
use crate::rest::RestConfig;
use crate::retry::{default_sleeper, with_timeout, RetryPolicy, SleeperRef};

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;
/// Rank penalty per GB of replica size.
const SIZE_PENALTY_PER_GB: f64 = 1.0e-3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    /// Days to look back when no prior update timestamp exists.
    pub max_back_query: u32,
    /// Stored access records older than this are pruned.
    pub retention_days: u32,
    pub max_parallel_fetch: usize,
    pub fetch_timeout_secs: u64,
    pub store_path: String,
    pub popdb: RestConfig,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            max_back_query: 7,
            retention_days: 730,
            max_parallel_fetch: 8,
            fetch_timeout_secs: 600,
            store_path: "dataset_accesses.db".to_string(),
            popdb: RestConfig::default(),
        }
    }
}

/// (site, dataset) -> date -> (number of accesses, cpu time)
pub type AccessHistory = HashMap<(String, String), BTreeMap<NaiveDate, (u64, f64)>>;

pub struct DemandCollector {
    config: DemandConfig,
    source: Arc<dyn UsageStatsSource>,
    store: Arc<dyn AccessStore>,
    store_retry: RetryPolicy,
    sleeper: SleeperRef,
}

impl DemandCollector {
    pub fn new(
        config: DemandConfig,
        source: Arc<dyn UsageStatsSource>,
        store: Arc<dyn AccessStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            store_retry: RetryPolicy::no_retry(),
            sleeper: default_sleeper(),
        }
    }

    /// Retries record store calls that fail with a transient error.
    pub fn with_store_retry(mut self, retry: RetryPolicy, sleeper: SleeperRef) -> Self {
        self.store_retry = retry;
        self.sleeper = sleeper;
        self
    }

    async fn store_call<T, F>(&self, op_name: &str, op: F) -> ReplicaResult<T>
    where
        F: Fn() -> ReplicaResult<T>,
    {
        let op = &op;
        self.store_retry
            .run(op_name, self.sleeper.as_ref(), move || async move { op() })
            .await
    }

    /// Loads stored accesses, fetches new ones and computes the demand table.
    /// Store failures abort; a failed (site, day) fetch is skipped.
    pub async fn update(&self, inventory: &dyn InventoryView, now: DateTime<Utc>) -> ReplicaResult<DemandMap> {
        let today = now.date_naive();
        let retention_start = today - ChronoDuration::days(self.config.retention_days as i64);

        let (mut history, last_update) = self.get_stored_records(inventory, retention_start).await?;
        let next_last_update = self
            .get_source_records(inventory, &mut history, last_update, now)
            .await?;

        let pruned = self
            .store_call("prune access records", || self.store.prune_before(retention_start))
            .await?;
        if pruned > 0 {
            debug!("pruned {} access records older than {}", pruned, retention_start);
        }
        self.store_call("set access last update", || self.store.set_last_update(next_last_update))
            .await?;

        Ok(compute_demand(inventory, &history, now))
    }

    async fn get_stored_records(
        &self,
        inventory: &dyn InventoryView,
        since: NaiveDate,
    ) -> ReplicaResult<(AccessHistory, Option<i64>)> {
        let records = self
            .store_call("load access records", || self.store.load_records(since))
            .await?;
        let num_records = records.len();

        let mut history = AccessHistory::new();
        for record in records {
            if !replica_exists(inventory, &record.site, &record.dataset) {
                continue;
            }
            history
                .entry((record.site, record.dataset))
                .or_default()
                .insert(record.date, (record.num_accesses, record.cputime));
        }

        let last_update = self
            .store_call("read access last update", || self.store.last_update())
            .await?;
        info!(
            "Loaded {} replica access data. Last update on {} UTC",
            num_records,
            last_update
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        Ok((history, last_update))
    }

    /// Fetches one unit per (site, day), saving each unit as soon as it arrives.
    /// Returns the timestamp to record as the new last update.
    async fn get_source_records(
        &self,
        inventory: &dyn InventoryView,
        history: &mut AccessHistory,
        last_update: Option<i64>,
        now: DateTime<Utc>,
    ) -> ReplicaResult<i64> {
        let today = now.date_naive();
        let earliest = now.timestamp() - self.config.max_back_query as i64 * 86400;
        let start_time = last_update.unwrap_or(0).max(earliest);
        let start_date = DateTime::<Utc>::from_timestamp(start_time, 0)
            .map(|t| t.date_naive())
            .unwrap_or(today);

        let mut days = Vec::new();
        let mut day = start_date;
        while day <= today {
            days.push(day);
            day = day + ChronoDuration::days(1);
        }

        info!(
            "Updating dataset access info from {} to {}",
            start_date.format("%Y-%m-%d"),
            today.format("%Y-%m-%d")
        );

        let mut units = Vec::new();
        for site in inventory.sites() {
            for day in days.iter() {
                units.push((site.name.clone(), *day));
            }
        }

        let timeout = Duration::from_secs(self.config.fetch_timeout_secs.max(1));
        let mut results = stream::iter(units)
            .map(|(site, day)| {
                let source = self.source.clone();
                async move {
                    let result = with_timeout("usage fetch", timeout, source.fetch(&site, day)).await;
                    (site, day, result)
                }
            })
            .buffer_unordered(self.config.max_parallel_fetch.max(1));

        let mut earliest_failed: Option<NaiveDate> = None;
        while let Some((site, day, result)) = results.next().await {
            let entries = match result {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("fetch access info of {} on {} failed, skipping: {}", site, day, e);
                    earliest_failed = Some(earliest_failed.map_or(day, |d| d.min(day)));
                    continue;
                }
            };

            let mut unit_records = Vec::new();
            for entry in entries {
                if !replica_exists(inventory, &site, &entry.dataset) {
                    continue;
                }
                history
                    .entry((site.clone(), entry.dataset.clone()))
                    .or_default()
                    .insert(day, (entry.num_accesses, entry.cpu_time));
                unit_records.push(AccessRecord {
                    site: site.clone(),
                    dataset: entry.dataset,
                    date: day,
                    num_accesses: entry.num_accesses,
                    cputime: entry.cpu_time,
                });
            }

            if !unit_records.is_empty() {
                self.store_call("save access records", || self.store.save_records(&unit_records))
                    .await?;
            }
        }

        // a failed day is fetched again next cycle
        let next_last_update = match earliest_failed {
            Some(day) => day
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc().timestamp())
                .unwrap_or(start_time),
            None => now.timestamp(),
        };
        Ok(next_last_update)
    }
}

fn replica_exists(inventory: &dyn InventoryView, site: &str, dataset: &str) -> bool {
    inventory
        .dataset(dataset)
        .map(|d| d.replicas.contains_key(site))
        .unwrap_or(false)
}

/// Local rank of one replica.
///
/// Never-accessed replicas rank by age in days; accessed ones by days since
/// the last access minus accesses per GB. Bigger replicas get a small
/// reduction. Higher rank means a staler replica.
pub fn local_rank(
    num_access: u64,
    days_since_last_access: i64,
    age_seconds: f64,
    size_gb: f64,
) -> f64 {
    let rank = if num_access == 0 {
        age_seconds / SECONDS_PER_DAY
    } else if size_gb > 0.0 {
        days_since_last_access as f64 - num_access as f64 / size_gb
    } else {
        days_since_last_access as f64
    };
    rank - size_gb * SIZE_PENALTY_PER_GB
}

pub fn compute_demand(inventory: &dyn InventoryView, history: &AccessHistory, now: DateTime<Utc>) -> DemandMap {
    let today = now.date_naive();
    let now_ts = now.timestamp();
    let mut demand = DemandMap::new();

    for dataset in inventory.datasets() {
        let mut local_usage = BTreeMap::new();

        for (site, replica) in dataset.replicas.iter() {
            let size_gb = replica.nominal_size(dataset) as f64 * 1.0e-9;

            let (num_access, tot_cpu, last_access) =
                match history.get(&(site.clone(), dataset.name.clone())) {
                    Some(accesses) if !accesses.is_empty() => {
                        let num: u64 = accesses.values().map(|(n, _)| *n).sum();
                        let cpu: f64 = accesses.values().map(|(_, c)| *c).sum();
                        (num, cpu, accesses.keys().next_back().copied())
                    }
                    _ => (0, 0.0, None),
                };

            let days_since = last_access
                .map(|d| (today - d).num_days())
                .unwrap_or(0);
            let age_seconds = (now_ts - replica.last_block_created()) as f64;
            let rank = local_rank(num_access, days_since, age_seconds, size_gb);

            local_usage.insert(
                site.clone(),
                ReplicaAccess {
                    rank,
                    num_access,
                    tot_cpu,
                    last_access: last_access
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|t| t.and_utc().timestamp())
                        .unwrap_or(0),
                },
            );
        }

        let global_usage_rank = if local_usage.is_empty() {
            0.0
        } else {
            local_usage.values().map(|u| u.rank).sum::<f64>() / local_usage.len() as f64
        };

        demand.insert(
            dataset.name.clone(),
            DatasetDemand {
                global_usage_rank,
                local_usage,
            },
        );
    }

    demand
}
