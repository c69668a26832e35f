use chrono::NaiveDate;
use log::{debug, warn};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ReplicaError, ReplicaResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Accesses of one dataset replica on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRecord {
    pub site: String,
    pub dataset: String,
    pub date: NaiveDate,
    pub num_accesses: u64,
    pub cputime: f64,
}

/// Persistent store of daily replica access records.
pub trait AccessStore: Send + Sync {
    /// Records dated on or after `since`, ordered by site, dataset, date.
    fn load_records(&self, since: NaiveDate) -> ReplicaResult<Vec<AccessRecord>>;
    /// Upsert keyed by (site, dataset, date).
    fn save_records(&self, records: &[AccessRecord]) -> ReplicaResult<usize>;
    fn prune_before(&self, date: NaiveDate) -> ReplicaResult<usize>;
    fn last_update(&self) -> ReplicaResult<Option<i64>>;
    fn set_last_update(&self, unix_time: i64) -> ReplicaResult<()>;
}

pub struct SqliteAccessStore {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteAccessStore {
    pub fn new(db_path: String) -> ReplicaResult<Self> {
        debug!("SqliteAccessStore: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("SqliteAccessStore: open db failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        // a concurrent writer makes us wait instead of failing the cycle
        conn.busy_timeout(Duration::from_secs(30))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dataset_accesses (
                site TEXT NOT NULL,
                dataset TEXT NOT NULL,
                date TEXT NOT NULL,
                num_accesses INTEGER NOT NULL,
                cputime REAL NOT NULL,
                PRIMARY KEY (site, dataset, date)
            )",
            [],
        )
        .map_err(|e| {
            warn!("SqliteAccessStore: create table dataset_accesses failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS system (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                dataset_accesses_last_update INTEGER
            )",
            [],
        )
        .map_err(|e| {
            warn!("SqliteAccessStore: create table system failed! {}", e);
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
            .map_err(|_| ReplicaError::Internal("access store connection poisoned".to_string()))
    }
}

impl AccessStore for SqliteAccessStore {
    fn load_records(&self, since: NaiveDate) -> ReplicaResult<Vec<AccessRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT site, dataset, date, num_accesses, cputime FROM dataset_accesses
             WHERE date >= ?1 ORDER BY site, dataset, date",
        )?;

        let rows = stmt.query_map(params![since.format(DATE_FORMAT).to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (site, dataset, date_str, num_accesses, cputime) = row?;
            let date = NaiveDate::parse_from_str(&date_str, DATE_FORMAT).map_err(|e| {
                ReplicaError::DbError(format!("bad date {} in dataset_accesses: {}", date_str, e))
            })?;
            records.push(AccessRecord {
                site,
                dataset,
                date,
                num_accesses: num_accesses.max(0) as u64,
                cputime,
            });
        }
        Ok(records)
    }

    fn save_records(&self, records: &[AccessRecord]) -> ReplicaResult<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(|e| {
            warn!("SqliteAccessStore: transaction failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO dataset_accesses (site, dataset, date, num_accesses, cputime)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.site,
                    record.dataset,
                    record.date.format(DATE_FORMAT).to_string(),
                    record.num_accesses as i64,
                    record.cputime,
                ])?;
            }
        }
        tx.commit().map_err(|e| {
            warn!("SqliteAccessStore: commit failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        Ok(records.len())
    }

    fn prune_before(&self, date: NaiveDate) -> ReplicaResult<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM dataset_accesses WHERE date < ?1",
            params![date.format(DATE_FORMAT).to_string()],
        )?;
        Ok(removed)
    }

    fn last_update(&self) -> ReplicaResult<Option<i64>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT dataset_accesses_last_update FROM system WHERE id = 0",
            [],
            |row| row.get::<_, Option<i64>>(0),
        );
        match result {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ReplicaError::DbError(e.to_string())),
        }
    }

    fn set_last_update(&self, unix_time: i64) -> ReplicaResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO system (id, dataset_accesses_last_update) VALUES (0, ?1)",
            params![unix_time],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rec(site: &str, dataset: &str, day: NaiveDate, n: u64) -> AccessRecord {
        AccessRecord {
            site: site.to_string(),
            dataset: dataset.to_string(),
            date: day,
            num_accesses: n,
            cputime: n as f64 * 2.0,
        }
    }

    fn open_store(tmp: &TempDir) -> SqliteAccessStore {
        let path = tmp.path().join("accesses.db");
        SqliteAccessStore::new(path.to_string_lossy().to_string()).unwrap()
    }

    #[test]
    fn test_upsert_overwrites_same_key() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store
            .save_records(&[
                rec("T2_US_MIT", "/A/B/RECO", date(2026, 10, 1), 3),
                rec("T2_US_MIT", "/A/B/RECO", date(2026, 10, 2), 4),
            ])
            .unwrap();
        store
            .save_records(&[rec("T2_US_MIT", "/A/B/RECO", date(2026, 10, 2), 9)])
            .unwrap();

        let records = store.load_records(date(2026, 1, 1)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].num_accesses, 9);
        assert_eq!(records[1].cputime, 18.0);
    }

    #[test]
    fn test_prune_and_since_filter() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store
            .save_records(&[
                rec("T2_US_MIT", "/A/B/RECO", date(2024, 1, 1), 1),
                rec("T2_US_MIT", "/A/B/RECO", date(2026, 10, 1), 2),
            ])
            .unwrap();

        assert_eq!(store.load_records(date(2025, 1, 1)).unwrap().len(), 1);
        assert_eq!(store.prune_before(date(2025, 1, 1)).unwrap(), 1);
        assert_eq!(store.load_records(date(2000, 1, 1)).unwrap().len(), 1);
    }

    #[test]
    fn test_last_update_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        assert_eq!(store.last_update().unwrap(), None);
        store.set_last_update(1_700_000_000).unwrap();
        store.set_last_update(1_700_000_100).unwrap();
        assert_eq!(store.last_update().unwrap(), Some(1_700_000_100));
    }
}
