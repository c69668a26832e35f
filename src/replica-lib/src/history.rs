use log::{debug, warn};
use rusqlite::{params, Connection};
use std::sync::Mutex;

use crate::dealer::ConsideredDataset;
use crate::detox::DeletionDecision;
use crate::error::{ReplicaError, ReplicaResult};

/// Deletion decision as read back from the history.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionHistoryRow {
    pub site: String,
    pub dataset: String,
    pub block: String,
    pub rule: String,
}

/// Per-cycle record of policy decisions.
pub struct SqliteHistory {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    pub fn new(db_path: String) -> ReplicaResult<Self> {
        debug!("SqliteHistory: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("SqliteHistory: open db failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_number INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                time INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deletion_decisions (
                run_number INTEGER NOT NULL,
                site TEXT NOT NULL,
                dataset TEXT NOT NULL,
                block TEXT NOT NULL,
                rule TEXT NOT NULL,
                PRIMARY KEY (run_number, site, dataset, block)
            );
            CREATE TABLE IF NOT EXISTS dataset_popularity (
                run_number INTEGER NOT NULL,
                dataset TEXT NOT NULL,
                request_weight REAL NOT NULL,
                PRIMARY KEY (run_number, dataset)
            );",
        )
        .map_err(|e| {
            warn!("SqliteHistory: create tables failed! {}", e);
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
            .map_err(|_| ReplicaError::Internal("history connection poisoned".to_string()))
    }

    pub fn last_run(&self) -> ReplicaResult<Option<u64>> {
        let conn = self.lock_conn()?;
        let last = conn.query_row("SELECT MAX(run_number) FROM runs", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        Ok(last.map(|n| n.max(0) as u64))
    }

    pub fn new_run(&self, run_number: u64, kind: &str, time: i64) -> ReplicaResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO runs (run_number, kind, time) VALUES (?1, ?2, ?3)",
            params![run_number as i64, kind, time],
        )
        .map_err(|e| {
            warn!("SqliteHistory: insert run {} failed! {}", run_number, e);
            ReplicaError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn save_deletions(&self, run_number: u64, decisions: &[DeletionDecision]) -> ReplicaResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO deletion_decisions (run_number, site, dataset, block, rule)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for d in decisions {
                stmt.execute(params![
                    run_number as i64,
                    d.site,
                    d.dataset,
                    d.block,
                    d.rule.to_string()
                ])?;
            }
        }
        tx.commit().map_err(|e| {
            warn!("SqliteHistory: commit deletions failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn save_dataset_popularity(&self, run_number: u64, datasets: &[ConsideredDataset]) -> ReplicaResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO dataset_popularity (run_number, dataset, request_weight)
                 VALUES (?1, ?2, ?3)",
            )?;
            for d in datasets {
                stmt.execute(params![run_number as i64, d.name, d.request_weight])?;
            }
        }
        tx.commit().map_err(|e| {
            warn!("SqliteHistory: commit popularity failed! {}", e);
            ReplicaError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn load_deletions(&self, run_number: u64) -> ReplicaResult<Vec<DeletionHistoryRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT site, dataset, block, rule FROM deletion_decisions
             WHERE run_number = ?1 ORDER BY site, dataset, block",
        )?;
        let rows = stmt.query_map(params![run_number as i64], |row| {
            Ok(DeletionHistoryRow {
                site: row.get(0)?,
                dataset: row.get(1)?,
                block: row.get(2)?,
                rule: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn load_dataset_popularity(&self, run_number: u64) -> ReplicaResult<Vec<ConsideredDataset>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT dataset, request_weight FROM dataset_popularity
             WHERE run_number = ?1 ORDER BY dataset",
        )?;
        let rows = stmt.query_map(params![run_number as i64], |row| {
            Ok(ConsideredDataset {
                name: row.get(0)?,
                request_weight: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
