//! Aggregate Store
//!
//! Boundary to the periodic statistics holding each counter's cumulative sums.
//! The engine only ever queries ranges and submits additive adjustments; it
//! never deletes or rewrites raw points.
//!
//! Adjustments are not guaranteed to be visible to the very next query. Callers
//! that re-query after adjusting must tolerate stale reads.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{StoreConfig, StoreKind};
use crate::models::{AggregatePoint, Granularity, Timestamp};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait::async_trait]
pub trait AggregateStore: Send + Sync {
    /// Points with `start` in `[start, end)`, ordered by `start`, per counter.
    /// Counters without data map to an empty list.
    async fn query(
        &self,
        counter_ids: &[String],
        start: Timestamp,
        end: Timestamp,
        granularity: Granularity,
    ) -> Result<HashMap<String, Vec<AggregatePoint>>>;

    /// Add `delta` to the point starting at `anchor` and every later point of
    /// the counter, at every granularity.
    async fn adjust(&self, counter_id: &str, anchor: Timestamp, delta: f64, unit: &str) -> Result<()>;
}

/// Open the store selected by configuration.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn AggregateStore>> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Sqlite => {
            let store = SqliteStore::open(&config.path)
                .with_context(|| format!("open sqlite store at {}", config.path))?;
            Ok(Arc::new(store))
        }
    }
}
