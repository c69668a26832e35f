use log::{error, info, warn};
use replica_lib::{CycleReport, ReplicaConfig, ReplicaError, ReplicaManager, ReplicaResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonRunOptions {
    pub config_path: PathBuf,
    pub once: bool,
    pub interval: Duration,
}

pub fn summarize(report: &CycleReport) -> String {
    let deletions = match report.deletions.as_ref() {
        Some(d) => format!("{} deletions ({} bytes)", d.decisions.len(), d.deleted_bytes()),
        None => "deletion skipped".to_string(),
    };
    format!(
        "run {}: refresh={} demand={} locks={} {}, {} replication requests over {} datasets",
        report.run_number,
        report.refresh.is_some(),
        report.demand_updated,
        report.locks_updated,
        deletions,
        report.replication.requests.len(),
        report.replication.considered.len()
    )
}

/// Runs cycles until `max_cycles` is reached; `None` runs forever. A failed
/// cycle is logged and the next one runs on schedule.
pub async fn run_cycles(manager: &ReplicaManager, interval: Duration, max_cycles: Option<u64>) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut done = 0u64;
    while max_cycles.map(|max| done < max).unwrap_or(true) {
        ticker.tick().await;
        match manager.run_cycle().await {
            Ok(report) => info!("{}", summarize(&report)),
            Err(e) => error!("cycle failed: {}", e),
        }
        done += 1;
    }
    done
}

pub fn run_replica_daemon(options: DaemonRunOptions) -> ReplicaResult<()> {
    let config = ReplicaConfig::load(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| ReplicaError::Internal(e.to_string()))?;
    let manager = ReplicaManager::from_config(&config)?;

    if options.once {
        let report = runtime.block_on(manager.run_cycle())?;
        info!("{}", summarize(&report));
        println!("{}", summarize(&report));
        return Ok(());
    }

    if options.interval.is_zero() {
        warn!("zero cycle interval, using {} seconds", DEFAULT_CYCLE_INTERVAL_SECS);
    }
    let interval = if options.interval.is_zero() {
        Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS)
    } else {
        options.interval
    };
    info!(
        "replica daemon started, config={}, interval={}s",
        options.config_path.display(),
        interval.as_secs()
    );
    runtime.block_on(run_cycles(&manager, interval, None));
    Ok(())
}
