use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use serde_json::Value;

use crate::error::{ReplicaError, ReplicaResult};
use crate::rest::{RestConfig, RestService};

/// Access statistics of one dataset at one site on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEntry {
    pub dataset: String,
    pub num_accesses: u64,
    pub cpu_time: f64,
}

#[async_trait]
pub trait UsageStatsSource: Send + Sync {
    async fn fetch(&self, site: &str, date: NaiveDate) -> ReplicaResult<Vec<UsageEntry>>;
}

/// How a site is addressed at the popularity service; `None` means never queried.
pub fn popularity_query_target(site: &str) -> Option<(String, &'static str)> {
    if site.starts_with("T0") {
        None
    } else if site.starts_with("T1") && site.matches('_').count() > 2 {
        let short = site.split('_').take(3).collect::<Vec<_>>().join("_");
        Some((short, "popularity/DSStatInTimeWindow/"))
    } else if site == "T2_CH_CERN" {
        Some((site.to_string(), "xrdpopularity/DSStatInTimeWindow"))
    } else {
        Some((site.to_string(), "popularity/DSStatInTimeWindow/"))
    }
}

pub struct PopDbSource {
    service: RestService,
}

impl PopDbSource {
    pub fn new(config: RestConfig) -> ReplicaResult<Self> {
        Ok(Self {
            service: RestService::new(config)?,
        })
    }

    pub fn parse_entries(result: &Value) -> ReplicaResult<Vec<UsageEntry>> {
        let entries = result
            .get("DATA")
            .unwrap_or(result)
            .as_array()
            .ok_or_else(|| ReplicaError::DecodeError("popularity reply is not a list".to_string()))?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(dataset) = entry.get("COLLNAME").and_then(|v| v.as_str()) else {
                debug!("popularity entry without COLLNAME: {}", entry);
                continue;
            };
            out.push(UsageEntry {
                dataset: dataset.to_string(),
                num_accesses: number(entry.get("NACC")).max(0.0) as u64,
                cpu_time: number(entry.get("TOTCPU")),
            });
        }
        Ok(out)
    }
}

fn number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl UsageStatsSource for PopDbSource {
    async fn fetch(&self, site: &str, date: NaiveDate) -> ReplicaResult<Vec<UsageEntry>> {
        let Some((site_name, service)) = popularity_query_target(site) else {
            return Ok(Vec::new());
        };
        let date_str = date.format("%Y-%m-%d").to_string();
        let options = [
            ("sitename", site_name),
            ("tstart", date_str.clone()),
            ("tstop", date_str),
        ];
        let result = self.service.make_request(service, &options).await?;
        Self::parse_entries(&result)
    }
}
