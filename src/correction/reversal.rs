//! Reversal Engine
//!
//! Undoes a correction ledger by submitting the exact negation of each record,
//! and manufactures synthetic resets for exercising the corrector.

use std::sync::Arc;

use tracing::{info, warn};

use crate::metrics::CorrectionMetrics;
use crate::models::{
    to_utc, AdjustmentRecord, AggregatePoint, CounterSpec, DropAmount, Granularity, ReversalReport,
    Timestamp,
};
use crate::store::AggregateStore;

/// How far back the simulation looks for the sum at the reset time.
const FINE_LOOKBACK_SECS: i64 = 3600;
const HOURLY_LOOKBACK_SECS: i64 = 2 * 3600;

pub struct ReversalEngine {
    store: Arc<dyn AggregateStore>,
    metrics: Option<Arc<CorrectionMetrics>>,
}

impl ReversalEngine {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CorrectionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Submit `-adjustment` for every record, newest first. Entries are
    /// independent; a failure is recorded and the rest still run.
    pub async fn reverse(&self, ledger: &[AdjustmentRecord]) -> ReversalReport {
        let total = ledger.len();
        if total == 0 {
            return ReversalReport {
                success: false,
                reversed_count: 0,
                total_adjustments: 0,
                errors: None,
                message: "No adjustments to reverse".into(),
                adjustments: None,
            };
        }

        let mut applied = Vec::with_capacity(total);
        let mut errors = Vec::new();

        for record in ledger.iter().rev() {
            let negated = record.negated();
            match self
                .store
                .adjust(&negated.counter_id, negated.anchor(), negated.adjustment, &negated.unit)
                .await
            {
                Ok(()) => {
                    info!(
                        counter_id = %record.counter_id,
                        timestamp = %record.timestamp,
                        adjustment = negated.adjustment,
                        "Reversed adjustment"
                    );
                    if let Some(m) = &self.metrics {
                        m.record_reversal(true);
                    }
                    applied.push(negated);
                }
                Err(e) => {
                    warn!(
                        counter_id = %record.counter_id,
                        timestamp = %record.timestamp,
                        "Reversal failed: {:#}", e
                    );
                    if let Some(m) = &self.metrics {
                        m.record_reversal(false);
                    }
                    errors.push(format!(
                        "{} at {}: {}",
                        record.counter_id,
                        record.timestamp.to_rfc3339(),
                        e
                    ));
                }
            }
        }

        let reversed = applied.len();
        let message = if errors.is_empty() {
            format!("Reversed {} of {} adjustments", reversed, total)
        } else {
            format!(
                "Reversed {} of {} adjustments, {} failed",
                reversed,
                total,
                errors.len()
            )
        };

        ReversalReport {
            success: reversed > 0,
            reversed_count: reversed,
            total_adjustments: total,
            errors: if errors.is_empty() { None } else { Some(errors) },
            message,
            adjustments: if applied.is_empty() { None } else { Some(applied) },
        }
    }

    /// Sum of the counter at or just before `at`, preferring 5-minute buckets.
    async fn sum_at(&self, counter_id: &str, at: Timestamp) -> anyhow::Result<Option<f64>> {
        let ids = [counter_id.to_string()];
        for (granularity, lookback) in [
            (Granularity::FiveMinute, FINE_LOOKBACK_SECS),
            (Granularity::Hour, HOURLY_LOOKBACK_SECS),
        ] {
            let mut result = self
                .store
                .query(&ids, at - lookback, at + 1, granularity)
                .await?;
            let points = result.remove(counter_id).unwrap_or_default();
            if let Some(sum) = last_usable_at_or_before(&points, at) {
                return Ok(Some(sum));
            }
        }
        Ok(None)
    }

    /// Manufacture a reset: drop the counter at `at` by a fixed amount or to zero.
    pub async fn simulate_reset(&self, counter: &CounterSpec, at: Timestamp, drop: DropAmount) -> ReversalReport {
        let failed = |message: String| ReversalReport {
            success: false,
            reversed_count: 0,
            total_adjustments: 1,
            errors: Some(vec![message.clone()]),
            message,
            adjustments: None,
        };

        let current = match self.sum_at(&counter.id, at).await {
            Ok(sum) => sum,
            Err(e) => return failed(format!("query failed for {}: {}", counter.id, e)),
        };

        let amount = match drop {
            DropAmount::Explicit(v) if v.is_finite() && v > 0.0 => v,
            DropAmount::Explicit(v) => return failed(format!("invalid drop amount {}", v)),
            DropAmount::ToZero => match current {
                Some(sum) => sum,
                None => {
                    return failed(format!(
                        "no data for {} at or before {}",
                        counter.id,
                        to_utc(at).to_rfc3339()
                    ))
                }
            },
        };

        let record = AdjustmentRecord {
            counter_id: counter.id.clone(),
            timestamp: to_utc(at),
            adjustment: -amount,
            unit: counter.unit.clone(),
        };

        if let Err(e) = self
            .store
            .adjust(&record.counter_id, at, record.adjustment, &record.unit)
            .await
        {
            return failed(format!("adjustment failed for {}: {}", counter.id, e));
        }

        info!(
            counter_id = %counter.id,
            at,
            amount,
            sum_before = ?current,
            "Simulated counter reset"
        );

        ReversalReport {
            success: true,
            reversed_count: 1,
            total_adjustments: 1,
            errors: None,
            message: format!("Simulated reset on {}: dropped {:.3} {}", counter.id, amount, counter.unit),
            adjustments: Some(vec![record]),
        }
    }
}

fn last_usable_at_or_before(points: &[AggregatePoint], at: Timestamp) -> Option<f64> {
    points
        .iter()
        .rev()
        .filter(|p| p.start <= at)
        .find_map(|p| p.usable_sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const H: i64 = 3600;

    fn counter() -> CounterSpec {
        CounterSpec {
            id: "c".into(),
            unit: "kWh".into(),
            tags: vec![],
        }
    }

    fn record(at: i64, adjustment: f64) -> AdjustmentRecord {
        AdjustmentRecord {
            counter_id: "c".into(),
            timestamp: to_utc(at),
            adjustment,
            unit: "kWh".into(),
        }
    }

    #[tokio::test]
    async fn test_reverse_submits_exact_negation() {
        let store = Arc::new(MemoryStore::new());
        let engine = ReversalEngine::new(store.clone());

        let report = engine.reverse(&[record(H, 60.5), record(3 * H, 12.0)]).await;
        assert!(report.success);
        assert_eq!(report.reversed_count, 2);
        assert_eq!(report.total_adjustments, 2);
        assert!(report.errors.is_none());

        let calls = store.adjust_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].anchor, calls[0].delta), (3 * H, -12.0));
        assert_eq!((calls[1].anchor, calls[1].delta), (H, -60.5));
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_honestly() {
        let store = Arc::new(MemoryStore::new());
        store.reject_anchor(H);
        let engine = ReversalEngine::new(store.clone());

        let report = engine.reverse(&[record(H, 1.0), record(2 * H, 2.0)]).await;
        assert!(report.success);
        assert_eq!(report.reversed_count, 1);
        assert_eq!(report.total_adjustments, 2);
        assert_eq!(report.errors.as_ref().map(Vec::len), Some(1));

        let empty = engine.reverse(&[]).await;
        assert!(!empty.success);
    }

    #[tokio::test]
    async fn test_all_failures_is_not_success() {
        let store = Arc::new(MemoryStore::new());
        store.reject_anchor(H);
        let engine = ReversalEngine::new(store);
        let report = engine.reverse(&[record(H, 1.0)]).await;
        assert!(!report.success);
        assert_eq!(report.reversed_count, 0);
    }

    #[tokio::test]
    async fn test_simulate_drop_to_zero_prefers_fine_buckets() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "c",
            Granularity::FiveMinute,
            &[AggregatePoint::new(H - 300, 48.0), AggregatePoint::new(H, 50.0), AggregatePoint::new(H + 300, 51.0)],
        );
        store.insert("c", Granularity::Hour, &[AggregatePoint::new(0, 40.0), AggregatePoint::new(H, 50.0)]);
        let engine = ReversalEngine::new(store.clone());

        let report = engine.simulate_reset(&counter(), H + 60, DropAmount::ToZero).await;
        assert!(report.success, "{:?}", report);
        let calls = store.adjust_calls();
        assert_eq!((calls[0].anchor, calls[0].delta), (H + 60, -50.0));

        let submitted = report.adjustments.unwrap();
        assert_eq!(submitted[0].adjustment, -50.0);
    }

    #[tokio::test]
    async fn test_simulate_falls_back_to_hourly_and_validates() {
        let store = Arc::new(MemoryStore::new());
        store.insert("c", Granularity::Hour, &[AggregatePoint::new(0, 40.0)]);
        let engine = ReversalEngine::new(store.clone());

        let report = engine.simulate_reset(&counter(), H, DropAmount::ToZero).await;
        assert!(report.success);
        assert_eq!(store.adjust_calls()[0].delta, -40.0);

        let bad = engine.simulate_reset(&counter(), H, DropAmount::Explicit(-3.0)).await;
        assert!(!bad.success);

        let none = engine
            .simulate_reset(&counter(), 100 * H, DropAmount::ToZero)
            .await;
        assert!(!none.success);
        assert_eq!(store.adjust_calls().len(), 1);
    }
}
