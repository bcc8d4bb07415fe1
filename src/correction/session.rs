//! Correction Session
//!
//! One invocation against one group: resolve counters, detect on the main
//! counter over a window widened by one bucket, report the resets that fall in
//! the caller's window, and (unless previewing) correct each counter that
//! shows its own reset. Counters are corrected one after another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::FixedOffset;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::corrector::{CorrectorSettings, SpikeCorrector};
use super::detector::detect;
use super::window::{parse_local, Window};
use crate::config::CorrectionConfig;
use crate::groups::GroupDirectory;
use crate::metrics::CorrectionMetrics;
use crate::models::{
    format_local, format_utc, CounterDetail, CounterSpec, Group, ResetEvent, ResetTimestamp, SessionReport,
    SessionRequest, SpikeDetail,
};
use crate::store::AggregateStore;

/// Reasons a session ends early with an empty report.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionFault {
    GroupNotFound(String),
    InvalidTime(String),
    InvalidWindow,
    NoCounters(String),
    NoMainCounter(String),
    QueryFailed(String),
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFault::GroupNotFound(id) => write!(f, "group '{}' not found", id),
            SessionFault::InvalidTime(e) => write!(f, "invalid time: {}", e),
            SessionFault::InvalidWindow => write!(f, "start time is after end time"),
            SessionFault::NoCounters(id) => write!(f, "no counters in group '{}'", id),
            SessionFault::NoMainCounter(id) => write!(f, "no main counter found in group '{}'", id),
            SessionFault::QueryFailed(e) => write!(f, "aggregate query failed: {}", e),
        }
    }
}

pub struct SessionRunner {
    store: Arc<dyn AggregateStore>,
    directory: Arc<dyn GroupDirectory>,
    config: CorrectionConfig,
    metrics: Arc<CorrectionMetrics>,
    /// One lock per group so two sessions never correct the same counters at once
    group_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRunner {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        directory: Arc<dyn GroupDirectory>,
        config: CorrectionConfig,
        metrics: Arc<CorrectionMetrics>,
    ) -> Self {
        Self {
            store,
            directory,
            config,
            metrics,
            group_locks: Mutex::new(HashMap::new()),
        }
    }

    fn group_lock(&self, group_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.group_locks
            .lock()
            .entry(group_id.to_string())
            .or_default()
            .clone()
    }

    /// Run one session. Only an unreachable group directory is an `Err`;
    /// every other fault comes back inside the report.
    pub async fn run(&self, request: &SessionRequest) -> Result<SessionReport> {
        // Resolve before locking so unknown ids never enter the lock map
        let report = match self.directory.resolve(&request.group_id).await? {
            Some(group) => {
                let lock = self.group_lock(&group.id);
                let _guard = lock.lock().await;
                self.run_locked(request, &group).await
            }
            None => {
                let fault = SessionFault::GroupNotFound(request.group_id.clone());
                warn!(group_id = %request.group_id, dry_run = request.dry_run, "Correction session aborted: {}", fault);
                SessionReport::failed(&request.group_id, request.dry_run, fault.to_string())
            }
        };

        self.metrics
            .record_session(request.dry_run, report.error.is_some());
        Ok(report)
    }

    async fn run_locked(&self, request: &SessionRequest, group: &Group) -> SessionReport {
        let group_id = request.group_id.as_str();
        let dry_run = request.dry_run;
        let offset = self.config.local_offset();
        let granularity = self.config.granularity;

        let abort = |fault: SessionFault| {
            warn!(group_id, dry_run, "Correction session aborted: {}", fault);
            SessionReport::failed(group_id, dry_run, fault.to_string())
        };

        let start = match parse_local(&request.start_time, &offset) {
            Ok(ts) => ts,
            Err(e) => return abort(SessionFault::InvalidTime(e.to_string())),
        };
        let end = match parse_local(&request.end_time, &offset) {
            Ok(ts) => ts,
            Err(e) => return abort(SessionFault::InvalidTime(e.to_string())),
        };
        let Ok(window) = Window::new(start, end) else {
            return abort(SessionFault::InvalidWindow);
        };

        if group.counters.is_empty() {
            return abort(SessionFault::NoCounters(group_id.to_string()));
        }
        let Some(main) = group.main_counter() else {
            return abort(SessionFault::NoMainCounter(group_id.to_string()));
        };

        let (query_start, query_end) = window.expanded(granularity);
        info!(
            group_id,
            main_counter = %main.id,
            query_start,
            query_end,
            dry_run,
            "Starting correction session"
        );

        let main_points = match self
            .store
            .query(&[main.id.clone()], query_start, query_end, granularity)
            .await
        {
            Ok(mut points) => points.remove(&main.id).unwrap_or_default(),
            Err(e) => return abort(SessionFault::QueryFailed(e.to_string())),
        };

        let reset_timestamps: Vec<_> = detect(&main_points)
            .events
            .iter()
            .map(|e| e.timestamp)
            .filter(|ts| window.contains(*ts))
            .collect();

        let mut report = SessionReport::empty(group_id, dry_run);
        report.counters_processed = group.counters.len();
        report.reset_timestamps = reset_timestamps
            .iter()
            .map(|&ts| ResetTimestamp {
                utc: format_utc(ts),
                local: format_local(ts, &offset),
            })
            .collect();
        self.metrics.record_resets(reset_timestamps.len());

        if reset_timestamps.is_empty() {
            report.message = format!("No resets found on {} in the requested window", main.id);
            info!(group_id, "{}", report.message);
            return report;
        }

        // Diagnostic scan of every counter in the group
        let ids: Vec<String> = group.counters.iter().map(|c| c.id.clone()).collect();
        let mut all_points = match self
            .store
            .query(&ids, query_start, query_end, granularity)
            .await
        {
            Ok(points) => points,
            Err(e) => {
                let fault = SessionFault::QueryFailed(e.to_string());
                warn!(group_id, "Detail scan failed: {}", fault);
                report.message = format!("Correction aborted: {}", fault);
                report.error = Some(fault.to_string());
                return report;
            }
        };

        let mut affected: Vec<&CounterSpec> = Vec::new();
        for counter in &group.counters {
            let points = all_points.remove(&counter.id).unwrap_or_default();
            let events = detect(&points).events;
            if events.is_empty() {
                continue;
            }
            report.details.push(CounterDetail {
                counter_id: counter.id.clone(),
                spikes: events.iter().map(|e| spike_detail(e, &offset)).collect(),
            });
            affected.push(counter);
        }

        if dry_run {
            report.message = format!(
                "Preview: {} reset(s) found, {} counter(s) would be corrected",
                reset_timestamps.len(),
                affected.len()
            );
            info!(group_id, "{}", report.message);
            return report;
        }

        let corrector = SpikeCorrector::new(self.store.clone(), CorrectorSettings::from(&self.config))
            .with_metrics(self.metrics.clone());

        let mut ledger = Vec::new();
        for counter in affected {
            let result = corrector.correct(counter, query_start, query_end).await;
            if !result.adjustments.is_empty() {
                report.counters_adjusted += 1;
            }
            if !result.succeeded() {
                report.failed_counters.push(counter.id.clone());
            }
            ledger.extend(result.adjustments);
        }

        report.message = format!(
            "Applied {} adjustment(s) across {} counter(s)",
            ledger.len(),
            report.counters_adjusted
        );
        if !report.failed_counters.is_empty() {
            report.message.push_str(&format!(
                "; {} counter(s) did not converge",
                report.failed_counters.len()
            ));
        }
        if !ledger.is_empty() {
            report.adjustments = Some(ledger);
        }
        info!(group_id, "{}", report.message);
        report
    }
}

fn spike_detail(event: &ResetEvent, offset: &FixedOffset) -> SpikeDetail {
    SpikeDetail {
        timestamp_utc: format_utc(event.timestamp),
        timestamp_local: format_local(event.timestamp, offset),
        current_value: event.current_sum,
        previous_value: event.previous_sum,
        delta: event.delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::StaticGroupDirectory;
    use crate::models::{AggregatePoint, Granularity, Group};
    use crate::models::Timestamp;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const H: i64 = 3600;
    // 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200;

    fn counter(id: &str, tags: &[&str]) -> CounterSpec {
        CounterSpec {
            id: id.into(),
            unit: "kWh".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn hourly(store: &MemoryStore, id: &str, sums: &[f64]) {
        let points: Vec<_> = sums
            .iter()
            .enumerate()
            .map(|(i, &s)| AggregatePoint::new(T0 + i as i64 * H, s))
            .collect();
        store.insert(id, Granularity::Hour, &points);
    }

    fn runner(store: Arc<dyn AggregateStore>, groups: Vec<Group>) -> SessionRunner {
        let config = CorrectionConfig {
            commit_delay: Duration::ZERO,
            ..Default::default()
        };
        SessionRunner::new(
            store,
            Arc::new(StaticGroupDirectory::new(groups)),
            config,
            Arc::new(CorrectionMetrics::new()),
        )
    }

    fn inverter() -> Group {
        Group {
            id: "inv".into(),
            name: None,
            counters: vec![
                counter("main", &["primary", "consumed"]),
                counter("phase_a", &[]),
                counter("phase_b", &[]),
            ],
        }
    }

    fn request(start: &str, end: &str, dry_run: bool) -> SessionRequest {
        SessionRequest {
            group_id: "inv".into(),
            start_time: start.into(),
            end_time: end.into(),
            dry_run,
        }
    }

    #[tokio::test]
    async fn test_guard_clauses_return_structured_reports() {
        let store = Arc::new(MemoryStore::new());
        let no_main = Group {
            id: "bare".into(),
            name: None,
            counters: vec![counter("x", &[])],
        };
        let empty = Group {
            id: "empty".into(),
            name: None,
            counters: vec![],
        };
        let r = runner(store, vec![no_main, empty]);

        let mut req = request("2024-01-01 00:00", "2024-01-01 05:00", true);
        req.group_id = "missing".into();
        let report = r.run(&req).await.unwrap();
        assert!(report.error.unwrap().contains("not found"));

        req.group_id = "bare".into();
        let report = r.run(&req).await.unwrap();
        assert!(report.error.unwrap().contains("no main counter"));

        req.group_id = "empty".into();
        let report = r.run(&req).await.unwrap();
        assert!(report.error.unwrap().contains("no counters"));

        let mut backwards = request("2024-01-01 05:00", "2024-01-01 00:00", true);
        backwards.group_id = "bare".into();
        let report = r.run(&backwards).await.unwrap();
        assert_eq!(report.error.as_deref(), Some("start time is after end time"));
        assert!(report.reset_timestamps.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_adjusting() {
        let store = Arc::new(MemoryStore::new());
        hourly(&store, "main", &[100.0, 110.0, 20.0, 30.0, 40.0, 5.0, 10.0]);
        hourly(&store, "phase_a", &[50.0, 55.0, 10.0, 15.0, 20.0, 25.0, 30.0]);
        hourly(&store, "phase_b", &[50.0, 55.0, 60.0, 65.0, 70.0, 75.0, 80.0]);
        let r = runner(store.clone(), vec![inverter()]);

        let report = r
            .run(&request("2024-01-01 00:00", "2024-01-01 06:00", true))
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.counters_processed, 3);
        assert_eq!(report.reset_timestamps.len(), 2);
        assert_eq!(report.reset_timestamps[0].utc, "2024-01-01T02:00:00+00:00");
        assert_eq!(report.details.len(), 2);
        assert_eq!(report.details[1].counter_id, "phase_a");
        assert_eq!(report.details[1].spikes[0].delta, -45.0);
        assert_eq!(report.counters_adjusted, 0);
        assert!(report.adjustments.is_none());
        assert!(store.adjust_calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_corrects_only_counters_with_their_own_resets() {
        let store = Arc::new(MemoryStore::new());
        hourly(&store, "main", &[100.0, 110.0, 20.0, 30.0]);
        hourly(&store, "phase_a", &[50.0, 55.0, 10.0, 15.0]);
        hourly(&store, "phase_b", &[50.0, 55.0, 60.0, 65.0]);
        let r = runner(store.clone(), vec![inverter()]);

        let report = r
            .run(&request("2024-01-01 00:00", "2024-01-01 03:00", false))
            .await
            .unwrap();
        assert_eq!(report.counters_adjusted, 2);
        let ledger = report.adjustments.unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.iter().all(|a| a.counter_id != "phase_b"));
        assert!(store.adjust_calls().iter().all(|c| c.counter_id != "phase_b"));

        let again = r
            .run(&request("2024-01-01 00:00", "2024-01-01 03:00", false))
            .await
            .unwrap();
        assert!(again.reset_timestamps.is_empty());
        assert!(again.adjustments.is_none());
    }

    #[tokio::test]
    async fn test_window_boundaries() {
        let store = Arc::new(MemoryStore::new());
        // drops at T0+2H and T0+5H
        hourly(&store, "main", &[10.0, 20.0, 5.0, 6.0, 7.0, 1.0, 2.0]);
        let r = runner(store, vec![inverter()]);

        // Drop landing exactly at `end` is still found.
        let at_end = r
            .run(&request("2024-01-01 01:00", "2024-01-01 02:00", true))
            .await
            .unwrap();
        assert_eq!(at_end.reset_timestamps.len(), 1);
        assert_eq!(at_end.reset_timestamps[0].utc, "2024-01-01T02:00:00+00:00");

        // Drop at `start` needs the bucket before the window.
        let at_start = r
            .run(&request("2024-01-01 05:00", "2024-01-01 06:00", true))
            .await
            .unwrap();
        assert_eq!(at_start.reset_timestamps.len(), 1);

        // The expanded range reaches the T0+5H drop but it is outside [start, end].
        let outside = r
            .run(&request("2024-01-01 03:00", "2024-01-01 04:30", true))
            .await
            .unwrap();
        assert!(outside.reset_timestamps.is_empty());
        assert!(outside.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_groups_leave_no_locks_behind() {
        let r = runner(Arc::new(MemoryStore::new()), vec![inverter()]);
        for i in 0..50 {
            let mut req = request("2024-01-01 00:00", "2024-01-01 05:00", true);
            req.group_id = format!("bogus-{}", i);
            let report = r.run(&req).await.unwrap();
            assert!(report.error.is_some());
        }
        assert!(r.group_locks.lock().is_empty());

        r.run(&request("2024-01-01 00:00", "2024-01-01 05:00", true))
            .await
            .unwrap();
        assert_eq!(r.group_locks.lock().len(), 1);
    }

    /// Memory store whose queries can be made to fail selectively.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_all: bool,
        fail_group_scan: bool,
        fail_counter: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl AggregateStore for FlakyStore {
        async fn query(
            &self,
            counter_ids: &[String],
            start: Timestamp,
            end: Timestamp,
            granularity: Granularity,
        ) -> Result<HashMap<String, Vec<AggregatePoint>>> {
            if self.fail_all {
                anyhow::bail!("db offline");
            }
            if self.fail_group_scan && counter_ids.len() > 1 {
                anyhow::bail!("scan timed out");
            }
            if let (Some(bad), [only]) = (self.fail_counter, counter_ids) {
                if only == bad {
                    anyhow::bail!("read error on {}", bad);
                }
            }
            self.inner.query(counter_ids, start, end, granularity).await
        }

        async fn adjust(&self, counter_id: &str, anchor: Timestamp, delta: f64, unit: &str) -> Result<()> {
            self.inner.adjust(counter_id, anchor, delta, unit).await
        }
    }

    #[tokio::test]
    async fn test_main_counter_query_failure_aborts_session() {
        let store = FlakyStore {
            fail_all: true,
            ..Default::default()
        };
        let r = runner(Arc::new(store), vec![inverter()]);

        let report = r
            .run(&request("2024-01-01 00:00", "2024-01-01 03:00", false))
            .await
            .unwrap();
        assert_eq!(report.error.as_deref(), Some("aggregate query failed: db offline"));
        assert!(report.reset_timestamps.is_empty());
        assert!(report.adjustments.is_none());
    }

    #[tokio::test]
    async fn test_detail_scan_failure_keeps_resets_but_corrects_nothing() {
        let store = FlakyStore {
            fail_group_scan: true,
            ..Default::default()
        };
        hourly(&store.inner, "main", &[100.0, 110.0, 20.0, 30.0]);
        let store = Arc::new(store);
        let r = runner(store.clone(), vec![inverter()]);

        let report = r
            .run(&request("2024-01-01 00:00", "2024-01-01 03:00", false))
            .await
            .unwrap();
        assert_eq!(report.reset_timestamps.len(), 1);
        assert!(report.error.as_deref().unwrap().contains("scan timed out"));
        assert!(report.details.is_empty());
        assert!(store.inner.adjust_calls().is_empty());
    }

    #[tokio::test]
    async fn test_counter_query_failure_does_not_block_the_others() {
        let store = FlakyStore {
            fail_counter: Some("phase_a"),
            ..Default::default()
        };
        hourly(&store.inner, "main", &[100.0, 110.0, 20.0, 30.0]);
        hourly(&store.inner, "phase_a", &[50.0, 55.0, 10.0, 15.0]);
        hourly(&store.inner, "phase_b", &[50.0, 55.0, 60.0, 65.0]);
        let store = Arc::new(store);
        let r = runner(store.clone(), vec![inverter()]);

        let report = r
            .run(&request("2024-01-01 00:00", "2024-01-01 03:00", false))
            .await
            .unwrap();
        assert!(report.error.is_none());
        assert_eq!(report.failed_counters, vec!["phase_a".to_string()]);
        assert_eq!(report.counters_adjusted, 1);
        let ledger = report.adjustments.unwrap();
        assert!(ledger.iter().all(|a| a.counter_id == "main"));
        assert!(report.message.contains("did not converge"));
    }
}
