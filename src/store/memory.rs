//! In-process aggregate store.
//!
//! Adjustments are queued and only become visible after `commit_lag`
//! subsequent queries, which reproduces the read-after-adjust latency of a
//! real statistics backend. A lag of zero applies adjustments immediately.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::AggregateStore;
use crate::models::{AggregatePoint, Granularity, Timestamp};

/// One call to `adjust`, as received.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustCall {
    pub counter_id: String,
    pub anchor: Timestamp,
    pub delta: f64,
    pub unit: String,
}

#[derive(Debug)]
struct PendingAdjustment {
    counter_id: String,
    anchor: Timestamp,
    delta: f64,
    queries_left: usize,
}

#[derive(Debug, Default)]
struct Inner {
    series: HashMap<(String, Granularity), BTreeMap<Timestamp, Option<f64>>>,
    pending: VecDeque<PendingAdjustment>,
    calls: Vec<AdjustCall>,
    rejected_anchors: HashSet<Timestamp>,
    commit_lag: usize,
}

impl Inner {
    fn apply(&mut self, counter_id: &str, anchor: Timestamp, delta: f64) {
        for ((id, _), points) in self.series.iter_mut() {
            if id != counter_id {
                continue;
            }
            for (_, sum) in points.range_mut(anchor..) {
                if let Some(v) = sum {
                    *v += delta;
                }
            }
        }
    }

    fn commit_due(&mut self) {
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(p) = self.pending.pop_front() {
            if p.queries_left == 0 {
                self.apply(&p.counter_id, p.anchor, p.delta);
            } else {
                still_pending.push_back(p);
            }
        }
        self.pending = still_pending;
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose adjustments stay invisible for `lag` queries.
    pub fn with_commit_lag(lag: usize) -> Self {
        let store = Self::default();
        store.inner.lock().commit_lag = lag;
        store
    }

    /// Insert or replace points of one counter at one granularity.
    pub fn insert(&self, counter_id: &str, granularity: Granularity, points: &[AggregatePoint]) {
        let mut inner = self.inner.lock();
        let series = inner
            .series
            .entry((counter_id.to_string(), granularity))
            .or_default();
        for p in points {
            series.insert(p.start, p.sum);
        }
    }

    /// Visible points of a counter, ignoring queued adjustments.
    pub fn points(&self, counter_id: &str, granularity: Granularity) -> Vec<AggregatePoint> {
        self.inner
            .lock()
            .series
            .get(&(counter_id.to_string(), granularity))
            .map(|s| {
                s.iter()
                    .map(|(&start, &sum)| AggregatePoint { start, sum })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply every queued adjustment now.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        for p in inner.pending.iter_mut() {
            p.queries_left = 0;
        }
        inner.commit_due();
    }

    /// Make every future adjust anchored at `anchor` fail.
    pub fn reject_anchor(&self, anchor: Timestamp) {
        self.inner.lock().rejected_anchors.insert(anchor);
    }

    pub fn adjust_calls(&self) -> Vec<AdjustCall> {
        self.inner.lock().calls.clone()
    }
}

#[async_trait::async_trait]
impl AggregateStore for MemoryStore {
    async fn query(
        &self,
        counter_ids: &[String],
        start: Timestamp,
        end: Timestamp,
        granularity: Granularity,
    ) -> Result<HashMap<String, Vec<AggregatePoint>>> {
        let mut inner = self.inner.lock();
        inner.commit_due();

        let mut result = HashMap::with_capacity(counter_ids.len());
        for id in counter_ids {
            let points = match inner.series.get(&(id.clone(), granularity)) {
                Some(series) if start < end => series
                    .range(start..end)
                    .map(|(&start, &sum)| AggregatePoint { start, sum })
                    .collect(),
                _ => Vec::new(),
            };
            result.insert(id.clone(), points);
        }

        for p in inner.pending.iter_mut() {
            p.queries_left = p.queries_left.saturating_sub(1);
        }
        Ok(result)
    }

    async fn adjust(&self, counter_id: &str, anchor: Timestamp, delta: f64, unit: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.rejected_anchors.contains(&anchor) {
            return Err(anyhow!("adjustment rejected for {} at {}", counter_id, anchor));
        }

        inner.calls.push(AdjustCall {
            counter_id: counter_id.to_string(),
            anchor,
            delta,
            unit: unit.to_string(),
        });

        if inner.commit_lag == 0 {
            inner.apply(counter_id, anchor, delta);
        } else {
            let queries_left = inner.commit_lag;
            inner.pending.push_back(PendingAdjustment {
                counter_id: counter_id.to_string(),
                anchor,
                delta,
                queries_left,
            });
        }
        debug!(counter_id, anchor, delta, "Adjustment queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(id: &str) -> Vec<String> {
        vec![id.to_string()]
    }

    #[tokio::test]
    async fn test_query_is_half_open_and_ordered() {
        let store = MemoryStore::new();
        store.insert(
            "c",
            Granularity::Hour,
            &[
                AggregatePoint::new(7200, 3.0),
                AggregatePoint::new(0, 1.0),
                AggregatePoint::new(3600, 2.0),
            ],
        );

        let out = store.query(&ids("c"), 0, 7200, Granularity::Hour).await.unwrap();
        let starts: Vec<_> = out["c"].iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![0, 3600]);

        let missing = store.query(&ids("x"), 0, 7200, Granularity::Hour).await.unwrap();
        assert!(missing["x"].is_empty());
    }

    #[tokio::test]
    async fn test_adjust_shifts_anchor_and_later_points_at_every_granularity() {
        let store = MemoryStore::new();
        store.insert(
            "c",
            Granularity::Hour,
            &[AggregatePoint::new(0, 10.0), AggregatePoint::new(3600, 5.0), AggregatePoint::empty(7200)],
        );
        store.insert("c", Granularity::FiveMinute, &[AggregatePoint::new(3300, 9.0), AggregatePoint::new(3600, 5.0)]);

        store.adjust("c", 3600, 5.0, "kWh").await.unwrap();

        let hourly = store.points("c", Granularity::Hour);
        assert_eq!(hourly[0].sum, Some(10.0));
        assert_eq!(hourly[1].sum, Some(10.0));
        assert_eq!(hourly[2].sum, None);

        let fine = store.points("c", Granularity::FiveMinute);
        assert_eq!(fine[0].sum, Some(9.0));
        assert_eq!(fine[1].sum, Some(10.0));
    }

    #[tokio::test]
    async fn test_commit_lag_hides_adjustment_for_one_query() {
        let store = MemoryStore::with_commit_lag(1);
        store.insert("c", Granularity::Hour, &[AggregatePoint::new(0, 10.0)]);
        store.adjust("c", 0, 1.0, "kWh").await.unwrap();

        let first = store.query(&ids("c"), 0, 3600, Granularity::Hour).await.unwrap();
        assert_eq!(first["c"][0].sum, Some(10.0));

        let second = store.query(&ids("c"), 0, 3600, Granularity::Hour).await.unwrap();
        assert_eq!(second["c"][0].sum, Some(11.0));
    }

    #[tokio::test]
    async fn test_rejected_anchor_fails_without_recording() {
        let store = MemoryStore::new();
        store.reject_anchor(3600);
        assert!(store.adjust("c", 3600, 1.0, "kWh").await.is_err());
        assert!(store.adjust_calls().is_empty());
    }
}
