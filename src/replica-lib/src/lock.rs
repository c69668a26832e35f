use async_trait::async_trait;
use log::*;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::annotations::LockMap;
use crate::error::{ReplicaError, ReplicaResult};
use crate::glob::GlobPattern;
use crate::inventory::{Block, InventoryView};
use crate::rest::{RestConfig, RestService};
use crate::retry::{default_sleeper, RetryPolicy, SleeperRef};

/// How a source publishes its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockContentType {
    /// `["/dataset/a", "/dataset/b", ...]`
    #[serde(rename = "LIST_OF_DATASETS")]
    ListOfDatasets,
    /// `{"result": ["/dataset/a", ...]}`
    #[serde(rename = "CMSWEB_LIST_OF_DATASETS")]
    CmswebListOfDatasets,
    /// `{site: {"/dataset" | "/dataset#block": {"lock": ...}}}`
    #[serde(rename = "SITE_TO_DATASETS")]
    SiteToDatasets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSourceConfig {
    pub url: String,
    pub content_type: LockContentType,
    /// Locks from this source only apply to matching sites.
    #[serde(default)]
    pub sites: Option<GlobPattern>,
    /// Marker resource present while the lock files are being regenerated.
    #[serde(default)]
    pub lock_url: Option<String>,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_data_type() -> String {
    "application/json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub sources: BTreeMap<String, LockSourceConfig>,
    /// Delay between checks of a lock-of-locks marker.
    pub lock_wait_secs: u64,
    /// Give up on a marker after this many checks; 0 waits forever.
    pub max_lock_waits: u32,
    pub retry: RetryPolicy,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            lock_wait_secs: 60,
            max_lock_waits: 60,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
pub trait LockFetcher: Send + Sync {
    fn describe(&self) -> String;
    async fn fetch(&self) -> ReplicaResult<Value>;
    /// Ok(true) while the source's lock files are being regenerated.
    async fn is_regenerating(&self) -> ReplicaResult<bool>;
}

pub struct WebLockFetcher {
    service: RestService,
    lock_url: Option<String>,
}

impl WebLockFetcher {
    pub fn new(config: &LockSourceConfig, retry: RetryPolicy) -> ReplicaResult<Self> {
        let rest_config = RestConfig {
            url_base: config.url.clone(),
            accept: config.data_type.clone(),
            headers: config.headers.clone(),
            retry,
            ..Default::default()
        };
        Ok(Self {
            service: RestService::new(rest_config)?,
            lock_url: config.lock_url.clone(),
        })
    }
}

#[async_trait]
impl LockFetcher for WebLockFetcher {
    fn describe(&self) -> String {
        self.service.url_base().to_string()
    }

    async fn fetch(&self) -> ReplicaResult<Value> {
        self.service.make_request("", &[]).await
    }

    async fn is_regenerating(&self) -> ReplicaResult<bool> {
        let Some(lock_url) = self.lock_url.as_ref() else {
            return Ok(false);
        };
        let status = self.service.get_status(lock_url).await?;
        if status == StatusCode::NOT_FOUND {
            // no marker -> lock files are stable
            Ok(false)
        } else if status.is_success() {
            Ok(true)
        } else {
            Err(ReplicaError::from_http_status(status, lock_url.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockContent {
    /// Whole datasets locked at every (matching) site. `None` entries are nulls in the source.
    Datasets(Vec<Option<String>>),
    /// site -> object name -> locked
    SiteObjects(BTreeMap<String, BTreeMap<String, bool>>),
}

impl LockContent {
    pub fn decode(content_type: LockContentType, data: &Value) -> ReplicaResult<Self> {
        match content_type {
            LockContentType::ListOfDatasets => Self::decode_dataset_list(data),
            LockContentType::CmswebListOfDatasets => {
                let result = data.get("result").ok_or_else(|| {
                    ReplicaError::DecodeError("lock list envelope without result".to_string())
                })?;
                Self::decode_dataset_list(result)
            }
            LockContentType::SiteToDatasets => {
                let sites = data.as_object().ok_or_else(|| {
                    ReplicaError::DecodeError("site lock map is not an object".to_string())
                })?;
                let mut out = BTreeMap::new();
                for (site, objects) in sites {
                    let objects = objects.as_object().ok_or_else(|| {
                        ReplicaError::DecodeError(format!("lock entries of {} are not an object", site))
                    })?;
                    let mut entries = BTreeMap::new();
                    for (name, info) in objects {
                        entries.insert(name.clone(), is_locked(info));
                    }
                    out.insert(site.clone(), entries);
                }
                Ok(LockContent::SiteObjects(out))
            }
        }
    }

    fn decode_dataset_list(data: &Value) -> ReplicaResult<Self> {
        let list = data
            .as_array()
            .ok_or_else(|| ReplicaError::DecodeError("lock list is not an array".to_string()))?;
        Ok(LockContent::Datasets(
            list.iter().map(|v| v.as_str().map(|s| s.to_string())).collect(),
        ))
    }
}

fn is_locked(info: &Value) -> bool {
    match info.get("lock") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

pub struct LockSource {
    pub name: String,
    pub content_type: LockContentType,
    pub site_pattern: Option<GlobPattern>,
    pub fetcher: Arc<dyn LockFetcher>,
}

pub struct LockAggregator {
    sources: Vec<LockSource>,
    wait_delay: Duration,
    max_waits: u32,
    sleeper: SleeperRef,
}

impl LockAggregator {
    pub fn new(sources: Vec<LockSource>, wait_delay: Duration, max_waits: u32, sleeper: SleeperRef) -> Self {
        Self {
            sources,
            wait_delay,
            max_waits,
            sleeper,
        }
    }

    pub fn from_config(config: &LocksConfig) -> ReplicaResult<Self> {
        let mut sources = Vec::new();
        for (name, source_config) in config.sources.iter() {
            let fetcher = WebLockFetcher::new(source_config, config.retry.clone())?;
            sources.push(LockSource {
                name: name.clone(),
                content_type: source_config.content_type,
                site_pattern: source_config.sites.clone(),
                fetcher: Arc::new(fetcher),
            });
        }
        Ok(Self::new(
            sources,
            Duration::from_secs(config.lock_wait_secs),
            config.max_lock_waits,
            default_sleeper(),
        ))
    }

    /// Builds a fresh lock map from all sources. Nothing from an earlier cycle
    /// survives; on error the caller keeps its previous map.
    pub async fn update(&self, inventory: &dyn InventoryView) -> ReplicaResult<LockMap> {
        let mut locks = LockMap::new();

        for source in self.sources.iter() {
            self.wait_for_lock_files(source).await?;

            info!("Retrieving lock information from {}", source.fetcher.describe());
            let data = source.fetcher.fetch().await?;
            let content = LockContent::decode(source.content_type, &data)?;
            apply_content(&content, source, inventory, &mut locks);
        }

        Ok(locks)
    }

    async fn wait_for_lock_files(&self, source: &LockSource) -> ReplicaResult<()> {
        let mut checks = 0u32;
        while source.fetcher.is_regenerating().await? {
            checks += 1;
            if self.max_waits > 0 && checks >= self.max_waits {
                return Err(ReplicaError::Timeout(format!(
                    "lock files of {} still being produced after {} checks",
                    source.name, checks
                )));
            }
            info!(
                "Lock files of {} are being produced. Waiting {} seconds.",
                source.name,
                self.wait_delay.as_secs()
            );
            self.sleeper.sleep(self.wait_delay).await;
        }
        Ok(())
    }
}

fn site_allowed(source: &LockSource, site: &str) -> bool {
    source
        .site_pattern
        .as_ref()
        .map(|p| p.matches(site))
        .unwrap_or(true)
}

fn apply_content(content: &LockContent, source: &LockSource, inventory: &dyn InventoryView, locks: &mut LockMap) {
    let desc = source.fetcher.describe();
    match content {
        LockContent::Datasets(names) => {
            for name in names {
                let Some(name) = name else {
                    debug!("Dataset name None found in {}", desc);
                    continue;
                };
                let Some(dataset) = inventory.dataset(name) else {
                    debug!("Unknown dataset {} in {}", name, desc);
                    continue;
                };

                for (site, replica) in dataset.replicas.iter() {
                    if !site_allowed(source, site) {
                        continue;
                    }
                    locks
                        .entry(dataset.name.clone())
                        .or_default()
                        .entry(site.clone())
                        .or_default()
                        .extend(replica.block_replicas.keys().cloned());
                }
            }
        }
        LockContent::SiteObjects(sites) => {
            for (site_name, objects) in sites {
                if inventory.site(site_name).is_none() {
                    debug!("Unknown site {} in {}", site_name, desc);
                    continue;
                }
                if !site_allowed(source, site_name) {
                    continue;
                }

                for (object_name, locked) in objects {
                    if !locked {
                        debug!("Object {} is not locked at {}", object_name, site_name);
                        continue;
                    }

                    let (dataset_name, block_real_name) = match object_name.split_once('#') {
                        Some((d, b)) => (d, Some(b)),
                        None => (object_name.as_str(), None),
                    };

                    let Some(dataset) = inventory.dataset(dataset_name) else {
                        debug!("Unknown dataset {} in {}", dataset_name, desc);
                        continue;
                    };
                    if dataset.find_replica(site_name).is_none() {
                        debug!("Replica of {} is not at {} in {}", dataset_name, site_name, desc);
                        continue;
                    }

                    let blocks: BTreeSet<String> = match block_real_name {
                        None => dataset.blocks.keys().cloned().collect(),
                        Some(real) => {
                            let block = Block::to_internal_name(real)
                                .ok()
                                .and_then(|internal| dataset.find_block(&internal));
                            match block {
                                Some(block) => std::iter::once(block.name.clone()).collect(),
                                None => {
                                    debug!("Unknown block {} of {} in {}", real, dataset_name, desc);
                                    continue;
                                }
                            }
                        }
                    };

                    locks
                        .entry(dataset.name.clone())
                        .or_default()
                        .entry(site_name.clone())
                        .or_default()
                        .extend(blocks);
                }
            }
        }
    }
}
