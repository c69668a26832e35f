use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::annotations::CycleAnnotations;
use crate::error::{ReplicaError, ReplicaResult};
use crate::glob::GlobPattern;
use crate::inventory::{Dataset, DatasetReplica, InventoryView, NULL_GROUP};
use crate::quota::QuotaProvider;

const SECONDS_PER_DAY: i64 = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Keep,
    Delete,
}

/// `(action, site glob, dataset glob)`, written in JSON as a three-element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "(RuleAction, GlobPattern, GlobPattern)",
    into = "(RuleAction, GlobPattern, GlobPattern)"
)]
pub struct ExceptionRule {
    pub action: RuleAction,
    pub site: GlobPattern,
    pub dataset: GlobPattern,
}

impl ExceptionRule {
    pub fn new(action: RuleAction, site: &str, dataset: &str) -> ReplicaResult<Self> {
        Ok(Self {
            action,
            site: GlobPattern::new(site)?,
            dataset: GlobPattern::new(dataset)?,
        })
    }

    pub fn matches(&self, site: &str, dataset: &str) -> bool {
        self.site.matches(site) && self.dataset.matches(dataset)
    }
}

impl From<(RuleAction, GlobPattern, GlobPattern)> for ExceptionRule {
    fn from((action, site, dataset): (RuleAction, GlobPattern, GlobPattern)) -> Self {
        Self {
            action,
            site,
            dataset,
        }
    }
}

impl From<ExceptionRule> for (RuleAction, GlobPattern, GlobPattern) {
    fn from(rule: ExceptionRule) -> Self {
        (rule.action, rule.site, rule.dataset)
    }
}

/// Replicas of datasets matching `dataset` are protected until their newest
/// block replica is `days` old.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxAgeRule {
    pub dataset: GlobPattern,
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetoxConfig {
    pub threshold_occupancy: f64,
    pub deletion_per_iteration: usize,
    pub max_age: Vec<MaxAgeRule>,
    pub max_nonusage_rank: Option<f64>,
    /// Evaluated in order; the first rule matching a (site, dataset) decides.
    pub exceptions: Vec<ExceptionRule>,
}

impl Default for DetoxConfig {
    fn default() -> Self {
        Self {
            threshold_occupancy: 0.9,
            deletion_per_iteration: 50,
            max_age: Vec::new(),
            max_nonusage_rank: Some(400.0),
            exceptions: Vec::new(),
        }
    }
}

impl DetoxConfig {
    pub fn validate(&self) -> ReplicaResult<()> {
        if !(self.threshold_occupancy > 0.0 && self.threshold_occupancy.is_finite()) {
            return Err(ReplicaError::InvalidParam(format!(
                "threshold_occupancy must be positive, got {}",
                self.threshold_occupancy
            )));
        }
        if self.deletion_per_iteration == 0 {
            return Err(ReplicaError::InvalidParam(
                "deletion_per_iteration must be at least 1".to_string(),
            ));
        }
        if let Some(rank) = self.max_nonusage_rank {
            if rank.is_nan() {
                return Err(ReplicaError::InvalidParam("max_nonusage_rank is NaN".to_string()));
            }
        }
        Ok(())
    }
}

/// Which rule produced a deletion decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionRule {
    Occupancy,
    NonUsage,
    /// Index into the exception rule list.
    Exception(usize),
}

impl fmt::Display for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionRule::Occupancy => write!(f, "occupancy"),
            DecisionRule::NonUsage => write!(f, "nonusage"),
            DecisionRule::Exception(idx) => write!(f, "exception:{}", idx),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionDecision {
    pub site: String,
    pub dataset: String,
    pub block: String,
    pub group: String,
    pub size: u64,
    pub rule: DecisionRule,
}

/// Occupancy of one (site, partition) before and after the decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionUsage {
    pub site: String,
    pub partition: String,
    pub quota: u64,
    pub occupancy: u64,
    pub projected: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetoxResult {
    pub decisions: Vec<DeletionDecision>,
    pub partitions: Vec<PartitionUsage>,
}

impl DetoxResult {
    pub fn deleted_bytes(&self) -> u64 {
        self.decisions.iter().map(|d| d.size).sum()
    }
}

struct Candidate<'a> {
    site: &'a str,
    group: &'a str,
    dataset: &'a str,
    block: &'a str,
    size: u64,
    /// `None` when rank-based selection may not touch this replica.
    rank: Option<f64>,
}

impl<'a> Candidate<'a> {
    fn key(&self) -> (&'a str, &'a str, &'a str) {
        (self.site, self.dataset, self.block)
    }

    fn decide(&self, rule: DecisionRule) -> DeletionDecision {
        DeletionDecision {
            site: self.site.to_string(),
            dataset: self.dataset.to_string(),
            block: self.block.to_string(),
            group: self.group.to_string(),
            size: self.size,
            rule,
        }
    }
}

fn by_rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    let ra = a.rank.unwrap_or(f64::INFINITY);
    let rb = b.rank.unwrap_or(f64::INFINITY);
    ra.total_cmp(&rb)
        .then_with(|| a.dataset.cmp(b.dataset))
        .then_with(|| a.block.cmp(b.block))
}

#[derive(Debug, Default)]
struct PartitionState {
    quota: Option<u64>,
    occupancy: u64,
    projected: u64,
}

/// Selects block replicas to delete at over-quota sites.
pub struct DeletionPolicy {
    config: DetoxConfig,
}

impl DeletionPolicy {
    pub fn new(config: DetoxConfig) -> ReplicaResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetoxConfig {
        &self.config
    }

    /// Runs one evaluation. Fails with `CycleAborted` when the lock status of
    /// the inventory is unknown.
    pub fn evaluate(
        &self,
        inventory: &dyn InventoryView,
        annotations: &CycleAnnotations,
        quota: &dyn QuotaProvider,
        now: i64,
    ) -> ReplicaResult<DetoxResult> {
        if !annotations.locks_valid() {
            return Err(ReplicaError::CycleAborted(
                "lock status unknown, no deletion this cycle".to_string(),
            ));
        }

        let mut partitions = self.account_partitions(inventory, quota);
        let candidates = self.collect_candidates(inventory, annotations, &partitions, now);

        let mut decisions: Vec<DeletionDecision> = Vec::new();
        let mut selected: HashSet<(&str, &str, &str)> = HashSet::new();
        let cap = self.config.deletion_per_iteration;

        // occupancy driven, one partition at a time in (site, partition) order
        for ((site, partition), state) in partitions.iter() {
            let Some(quota_bytes) = state.quota else {
                continue;
            };
            let limit = self.config.threshold_occupancy * quota_bytes as f64;
            if (state.occupancy as f64) < limit {
                continue;
            }
            info!(
                "site {} partition {} over threshold: {} of {} bytes",
                site, partition, state.occupancy, quota_bytes
            );

            let mut victims: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| c.site == site && c.group == partition && c.rank.is_some())
                .filter(|c| !self.is_kept(c))
                .collect();
            victims.sort_by(|a, b| by_rank(a, b));

            let mut projected = state.occupancy;
            for victim in victims {
                if (projected as f64) < limit || decisions.len() >= cap {
                    break;
                }
                projected = projected.saturating_sub(victim.size);
                selected.insert(victim.key());
                decisions.push(victim.decide(DecisionRule::Occupancy));
            }
            if (projected as f64) >= limit {
                debug!(
                    "site {} partition {} still at {} bytes after selection",
                    site, partition, projected
                );
            }
        }

        if let Some(max_rank) = self.config.max_nonusage_rank {
            let mut idle: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| c.rank.map(|r| r > max_rank).unwrap_or(false))
                .filter(|c| !selected.contains(&c.key()) && !self.is_kept(c))
                .collect();
            idle.sort_by(|a, b| by_rank(a, b));
            for victim in idle {
                if decisions.len() >= cap {
                    break;
                }
                selected.insert(victim.key());
                decisions.push(victim.decide(DecisionRule::NonUsage));
            }
        }

        // forced deletions are uncapped
        for candidate in candidates.iter() {
            if selected.contains(&candidate.key()) {
                continue;
            }
            if let Some((idx, RuleAction::Delete)) =
                self.first_exception(candidate.site, candidate.dataset)
            {
                selected.insert(candidate.key());
                decisions.push(candidate.decide(DecisionRule::Exception(idx)));
            }
        }

        for decision in decisions.iter() {
            if let Some(state) = partitions.get_mut(&(decision.site.clone(), decision.group.clone())) {
                state.projected = state.projected.saturating_sub(decision.size);
            }
        }
        let usage: Vec<PartitionUsage> = partitions
            .into_iter()
            .filter_map(|((site, partition), state)| {
                Some(PartitionUsage {
                    site,
                    partition,
                    quota: state.quota?,
                    occupancy: state.occupancy,
                    projected: state.projected,
                })
            })
            .collect();

        info!(
            "detox selected {} block replicas over {} partitions",
            decisions.len(),
            usage.len()
        );
        Ok(DetoxResult {
            decisions,
            partitions: usage,
        })
    }

    fn first_exception(&self, site: &str, dataset: &str) -> Option<(usize, RuleAction)> {
        self.config
            .exceptions
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(site, dataset))
            .map(|(idx, rule)| (idx, rule.action))
    }

    /// A `Keep` rule takes the replica out of rank-based selection entirely.
    fn is_kept(&self, candidate: &Candidate<'_>) -> bool {
        match self.first_exception(candidate.site, candidate.dataset) {
            Some((idx, RuleAction::Keep)) => {
                debug!(
                    "exception {} keeps {}#{} at {}",
                    idx, candidate.dataset, candidate.block, candidate.site
                );
                true
            }
            _ => false,
        }
    }

    fn is_young(&self, dataset: &Dataset, replica: &DatasetReplica, now: i64) -> bool {
        self.config.max_age.iter().any(|rule| {
            rule.dataset.matches(&dataset.name)
                && now - replica.last_block_created() < rule.days as i64 * SECONDS_PER_DAY
        })
    }

    fn account_partitions(
        &self,
        inventory: &dyn InventoryView,
        quota: &dyn QuotaProvider,
    ) -> BTreeMap<(String, String), PartitionState> {
        let mut partitions: BTreeMap<(String, String), PartitionState> = BTreeMap::new();
        for dataset in inventory.datasets() {
            for (site_name, replica) in dataset.replicas.iter() {
                if !self.is_target(inventory, site_name) {
                    continue;
                }
                for br in replica.block_replicas.values() {
                    if br.group == NULL_GROUP {
                        continue;
                    }
                    partitions
                        .entry((site_name.clone(), br.group.clone()))
                        .or_default()
                        .occupancy += br.size;
                }
            }
        }

        for ((site, partition), state) in partitions.iter_mut() {
            state.projected = state.occupancy;
            state.quota = match quota.get_quota(site, partition) {
                Ok(Some(bytes)) if bytes > 0 => Some(bytes),
                Ok(_) => {
                    debug!("no quota for {} at {}, partition skipped", partition, site);
                    None
                }
                Err(e) => {
                    warn!("quota of {} at {} unavailable, partition skipped: {}", partition, site, e);
                    None
                }
            };
        }
        partitions
    }

    fn is_target(&self, inventory: &dyn InventoryView, site_name: &str) -> bool {
        inventory
            .site(site_name)
            .map(|s| s.status.is_targetable())
            .unwrap_or(false)
    }

    /// Every deletable block replica in a partition with a known quota.
    /// Custodial and locked replicas never become candidates.
    fn collect_candidates<'a>(
        &self,
        inventory: &'a dyn InventoryView,
        annotations: &CycleAnnotations,
        partitions: &BTreeMap<(String, String), PartitionState>,
        now: i64,
    ) -> Vec<Candidate<'a>> {
        let mut candidates = Vec::new();
        for dataset in inventory.datasets() {
            let rank = annotations.global_usage_rank(&dataset.name);
            for (site_name, replica) in dataset.replicas.iter() {
                if !self.is_target(inventory, site_name) {
                    continue;
                }
                let young = self.is_young(dataset, replica, now);
                for br in replica.block_replicas.values() {
                    if br.group == NULL_GROUP || br.is_custodial {
                        continue;
                    }
                    if annotations.is_locked(&dataset.name, site_name, &br.block) {
                        continue;
                    }
                    let known_quota = partitions
                        .get(&(site_name.clone(), br.group.clone()))
                        .map(|p| p.quota.is_some())
                        .unwrap_or(false);
                    if !known_quota {
                        continue;
                    }
                    candidates.push(Candidate {
                        site: site_name.as_str(),
                        group: br.group.as_str(),
                        dataset: dataset.name.as_str(),
                        block: br.block.as_str(),
                        size: br.size,
                        rank: if young { None } else { rank },
                    });
                }
            }
        }
        candidates
    }
}
