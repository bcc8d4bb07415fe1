use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::AggregateStore;
use crate::models::{AggregatePoint, Granularity, Timestamp};

/// Statistics database holding one row per (counter, granularity, bucket).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open statistics db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory statistics db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS counter_meta (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                counter_id TEXT NOT NULL UNIQUE,
                unit TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS aggregates (
                meta_id INTEGER NOT NULL REFERENCES counter_meta(id),
                granularity TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                sum REAL,
                PRIMARY KEY (meta_id, granularity, start_ts)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_aggregates_meta_start ON aggregates(meta_id, start_ts)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn meta_id(conn: &Connection, counter_id: &str) -> Result<Option<i64>> {
        conn.query_row(
            "SELECT id FROM counter_meta WHERE counter_id = ?1",
            params![counter_id],
            |row| row.get(0),
        )
        .optional()
        .context("lookup counter meta")
    }

    fn ensure_meta(conn: &Connection, counter_id: &str, unit: Option<&str>) -> Result<i64> {
        if let Some(id) = Self::meta_id(conn, counter_id)? {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO counter_meta (counter_id, unit) VALUES (?1, ?2)",
            params![counter_id, unit],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert or replace points of one counter at one granularity.
    pub async fn record_points(
        &self,
        counter_id: &str,
        unit: &str,
        granularity: Granularity,
        points: &[AggregatePoint],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let meta_id = Self::ensure_meta(&tx, counter_id, Some(unit))?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO aggregates (meta_id, granularity, start_ts, sum)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for p in points {
                stmt.execute(params![meta_id, granularity.as_str(), p.start, p.sum])?;
            }
        }
        tx.commit()?;
        debug!(counter_id, count = points.len(), "Recorded aggregate points");
        Ok(())
    }
}

#[async_trait::async_trait]
impl AggregateStore for SqliteStore {
    async fn query(
        &self,
        counter_ids: &[String],
        start: Timestamp,
        end: Timestamp,
        granularity: Granularity,
    ) -> Result<HashMap<String, Vec<AggregatePoint>>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT a.start_ts, a.sum
             FROM aggregates a
             JOIN counter_meta m ON m.id = a.meta_id
             WHERE m.counter_id = ?1 AND a.granularity = ?2
               AND a.start_ts >= ?3 AND a.start_ts < ?4
             ORDER BY a.start_ts ASC",
        )?;

        let mut result = HashMap::with_capacity(counter_ids.len());
        for id in counter_ids {
            let rows = stmt.query_map(params![id, granularity.as_str(), start, end], |row| {
                Ok(AggregatePoint {
                    start: row.get(0)?,
                    sum: row.get(1)?,
                })
            })?;
            let points = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("read aggregates for {}", id))?;
            result.insert(id.clone(), points);
        }
        Ok(result)
    }

    async fn adjust(&self, counter_id: &str, anchor: Timestamp, delta: f64, unit: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let meta_id = Self::meta_id(&conn, counter_id)?
            .with_context(|| format!("unknown counter {}", counter_id))?;

        let updated = conn.execute(
            "UPDATE aggregates SET sum = sum + ?1
             WHERE meta_id = ?2 AND start_ts >= ?3 AND sum IS NOT NULL",
            params![delta, meta_id, anchor],
        )?;

        info!(
            counter_id,
            anchor,
            delta,
            unit,
            rows = updated,
            "Applied aggregate adjustment"
        );
        Ok(())
    }
}
