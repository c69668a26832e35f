use log::{debug, warn};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{ReplicaError, ReplicaResult};
use crate::inventory::SiteStatus;

const BYTES_PER_TB: f64 = 1.0e12;

/// Storage ceilings and activity status of sites.
pub trait QuotaProvider: Send + Sync {
    /// Quota in bytes of a (site, partition); `None` if unknown.
    fn get_quota(&self, site: &str, partition: &str) -> ReplicaResult<Option<u64>>;
    fn get_status(&self, site: &str) -> ReplicaResult<SiteStatus>;
}

/// The quota database knows the "IB RelVal" partition under another name.
pub fn quota_partition_name(partition: &str) -> &str {
    if partition == "IB RelVal" {
        "IB-RelVal"
    } else {
        partition
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// site -> partition -> quota in TB
    pub quotas: BTreeMap<String, BTreeMap<String, f64>>,
    /// Quota database; takes precedence over the static table when set.
    pub db_path: Option<String>,
}

/// Quotas served from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticQuota {
    quotas: BTreeMap<String, BTreeMap<String, f64>>,
    statuses: BTreeMap<String, SiteStatus>,
}

impl StaticQuota {
    pub fn new(quotas: BTreeMap<String, BTreeMap<String, f64>>) -> Self {
        Self {
            quotas,
            statuses: BTreeMap::new(),
        }
    }

    pub fn set_quota_tb(&mut self, site: &str, partition: &str, tb: f64) {
        self.quotas
            .entry(site.to_string())
            .or_default()
            .insert(partition.to_string(), tb);
    }

    pub fn set_status(&mut self, site: &str, status: SiteStatus) {
        self.statuses.insert(site.to_string(), status);
    }
}

impl QuotaProvider for StaticQuota {
    fn get_quota(&self, site: &str, partition: &str) -> ReplicaResult<Option<u64>> {
        let partition = quota_partition_name(partition);
        Ok(self
            .quotas
            .get(site)
            .and_then(|p| p.get(partition))
            .map(|tb| (tb * BYTES_PER_TB) as u64))
    }

    fn get_status(&self, site: &str) -> ReplicaResult<SiteStatus> {
        if let Some(status) = self.statuses.get(site) {
            return Ok(*status);
        }
        if self.quotas.contains_key(site) {
            Ok(SiteStatus::Active)
        } else {
            Ok(SiteStatus::Ignore)
        }
    }
}

/// Reads the latest quota entries from a quota database
/// (`Sites`, `Groups`, `Quotas` tables, sizes in TB).
pub struct SqliteQuotaSource {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteQuotaSource {
    pub fn new(db_path: String) -> ReplicaResult<Self> {
        debug!("SqliteQuotaSource: open {}", db_path);
        let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
            warn!("SqliteQuotaSource: open db failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> ReplicaResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReplicaError::Internal("quota db connection poisoned".to_string()))
    }
}

impl QuotaProvider for SqliteQuotaSource {
    fn get_quota(&self, site: &str, partition: &str) -> ReplicaResult<Option<u64>> {
        let partition = quota_partition_name(partition);
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT q.SizeTb FROM Quotas AS q
             INNER JOIN Sites AS s ON s.SiteId = q.SiteId
             INNER JOIN \"Groups\" AS g ON g.GroupId = q.GroupId
             WHERE s.SiteName LIKE ?1 AND g.GroupName LIKE ?2
             ORDER BY q.EntryDateUT DESC LIMIT 1",
            params![site, partition],
            |row| row.get::<_, f64>(0),
        );
        match result {
            Ok(tb) => Ok(Some((tb * BYTES_PER_TB) as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ReplicaError::DbError(e.to_string())),
        }
    }

    fn get_status(&self, site: &str) -> ReplicaResult<SiteStatus> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT Status FROM Sites WHERE SiteName LIKE ?1",
            params![site],
            |row| row.get::<_, rusqlite::types::Value>(0),
        );
        match result {
            Ok(rusqlite::types::Value::Text(s)) => s.parse::<SiteStatus>(),
            Ok(rusqlite::types::Value::Integer(i)) => i.to_string().parse::<SiteStatus>(),
            Ok(_) => Ok(SiteStatus::Ignore),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SiteStatus::Ignore),
            Err(e) => Err(ReplicaError::DbError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_quota_db(tmp: &TempDir) -> String {
        let path = tmp.path().join("quota.db").to_string_lossy().to_string();
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Sites (SiteId INTEGER PRIMARY KEY, SiteName TEXT, Status TEXT);
             CREATE TABLE \"Groups\" (GroupId INTEGER PRIMARY KEY, GroupName TEXT);
             CREATE TABLE Quotas (SiteId INTEGER, GroupId INTEGER, SizeTb REAL, EntryDateUT INTEGER);
             INSERT INTO Sites VALUES (1, 'T2_US_MIT', 'active'), (2, 'T2_DE_DESY', 'nocopy');
             INSERT INTO \"Groups\" VALUES (1, 'AnalysisOps'), (2, 'IB-RelVal');
             INSERT INTO Quotas VALUES (1, 1, 100.0, 1000), (1, 1, 250.0, 2000), (1, 2, 5.0, 1000);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_sqlite_quota_latest_entry() {
        let tmp = TempDir::new().unwrap();
        let source = SqliteQuotaSource::new(create_quota_db(&tmp)).unwrap();

        assert_eq!(
            source.get_quota("T2_US_MIT", "AnalysisOps").unwrap(),
            Some(250_000_000_000_000)
        );
        assert_eq!(
            source.get_quota("T2_US_MIT", "IB RelVal").unwrap(),
            Some(5_000_000_000_000)
        );
        assert_eq!(source.get_quota("T2_US_MIT", "DataOps").unwrap(), None);
    }

    #[test]
    fn test_sqlite_site_status() {
        let tmp = TempDir::new().unwrap();
        let source = SqliteQuotaSource::new(create_quota_db(&tmp)).unwrap();
        assert_eq!(source.get_status("T2_US_MIT").unwrap(), SiteStatus::Active);
        assert_eq!(source.get_status("T2_DE_DESY").unwrap(), SiteStatus::NoCopy);
        assert_eq!(source.get_status("T3_Nowhere").unwrap(), SiteStatus::Ignore);
    }

    #[test]
    fn test_static_quota() {
        let mut quota = StaticQuota::default();
        quota.set_quota_tb("T2_US_MIT", "IB-RelVal", 1.5);
        assert_eq!(
            quota.get_quota("T2_US_MIT", "IB RelVal").unwrap(),
            Some(1_500_000_000_000)
        );
        assert_eq!(quota.get_status("T2_US_MIT").unwrap(), SiteStatus::Active);
        assert_eq!(quota.get_status("T2_XX").unwrap(), SiteStatus::Ignore);
    }
}
