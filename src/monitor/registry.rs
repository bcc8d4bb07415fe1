//! Monitor Registry
//!
//! Owns one `LiveResetMonitor` per group. Readings can be fed one at a time
//! (returning the alert directly) or pumped from a stream by a background task.
//! Every alert is also published on the shared broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::live::{LiveResetMonitor, ResetAlert, StateChange};
use crate::metrics::CorrectionMetrics;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorInfo {
    pub group_id: String,
    pub counter_id: String,
    pub alerts_sent: u64,
    pub streaming: bool,
}

struct MonitorEntry {
    monitor: Mutex<LiveResetMonitor>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorEntry {
    fn info(&self) -> MonitorInfo {
        let monitor = self.monitor.lock();
        MonitorInfo {
            group_id: monitor.group_id().to_string(),
            counter_id: monitor.counter_id().to_string(),
            alerts_sent: monitor.alerts_sent(),
            streaming: self
                .feed_task
                .lock()
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false),
        }
    }
}

pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, Arc<MonitorEntry>>>,
    alert_tx: broadcast::Sender<ResetAlert>,
    metrics: Arc<CorrectionMetrics>,
}

impl MonitorRegistry {
    pub fn new(alert_capacity: usize, metrics: Arc<CorrectionMetrics>) -> Self {
        let (alert_tx, _) = broadcast::channel(alert_capacity.max(1));
        Self {
            monitors: RwLock::new(HashMap::new()),
            alert_tx,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResetAlert> {
        self.alert_tx.subscribe()
    }

    /// Start monitoring `counter_id` for `group_id`. Returns `false` when the
    /// group already has a monitor; the existing one is left untouched.
    pub fn create(&self, group_id: &str, counter_id: &str) -> bool {
        let mut monitors = self.monitors.write();
        if monitors.contains_key(group_id) {
            return false;
        }
        monitors.insert(
            group_id.to_string(),
            Arc::new(MonitorEntry {
                monitor: Mutex::new(LiveResetMonitor::new(group_id, counter_id)),
                feed_task: Mutex::new(None),
            }),
        );
        info!(group_id, counter_id, "Live monitor created");
        true
    }

    pub fn lookup(&self, group_id: &str) -> Option<MonitorInfo> {
        self.monitors.read().get(group_id).map(|e| e.info())
    }

    pub fn list(&self) -> Vec<MonitorInfo> {
        let mut all: Vec<MonitorInfo> = self.monitors.read().values().map(|e| e.info()).collect();
        all.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        all
    }

    /// Feed one state change. `None` when the group has no monitor.
    pub fn observe(&self, group_id: &str, change: &StateChange) -> Option<Option<ResetAlert>> {
        let entry = self.monitors.read().get(group_id).cloned()?;
        let alert = entry.monitor.lock().observe(change);
        if let Some(alert) = &alert {
            self.publish(alert.clone());
        }
        Some(alert)
    }

    fn publish(&self, alert: ResetAlert) {
        self.metrics.record_live_alert(&alert.group_id);
        if self.alert_tx.send(alert).is_err() {
            debug!("No alert subscribers");
        }
    }

    /// Pump a stream of state changes into the group's monitor on a background
    /// task. Replaces any earlier stream. Returns `false` when the group has
    /// no monitor.
    pub fn attach_stream<S>(self: &Arc<Self>, group_id: &str, changes: S) -> bool
    where
        S: Stream<Item = StateChange> + Send + Unpin + 'static,
    {
        let Some(entry) = self.monitors.read().get(group_id).cloned() else {
            return false;
        };

        let registry = Arc::clone(self);
        let task_entry = Arc::clone(&entry);
        let group = group_id.to_string();
        let task = tokio::spawn(async move {
            let mut changes = changes;
            while let Some(change) = changes.next().await {
                let alert = task_entry.monitor.lock().observe(&change);
                if let Some(alert) = alert {
                    registry.publish(alert);
                }
            }
            debug!(group_id = %group, "Monitor stream ended");
        });

        if let Some(previous) = entry.feed_task.lock().replace(task) {
            previous.abort();
        }
        true
    }

    /// Stop and forget the group's monitor. Returns `false` if there was none.
    pub fn teardown(&self, group_id: &str) -> bool {
        let Some(entry) = self.monitors.write().remove(group_id) else {
            return false;
        };
        if let Some(task) = entry.feed_task.lock().take() {
            task.abort();
        }
        info!(group_id, "Live monitor torn down");
        true
    }

    pub fn shutdown(&self) {
        let ids: Vec<String> = self.monitors.read().keys().cloned().collect();
        for id in ids {
            self.teardown(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<MonitorRegistry> {
        Arc::new(MonitorRegistry::new(16, Arc::new(CorrectionMetrics::new())))
    }

    #[test]
    fn test_create_lookup_teardown() {
        let registry = registry();
        assert!(registry.create("inv", "energy"));
        assert!(!registry.create("inv", "other"));

        let info = registry.lookup("inv").unwrap();
        assert_eq!(info.counter_id, "energy");
        assert_eq!(registry.list().len(), 1);

        assert!(registry.teardown("inv"));
        assert!(!registry.teardown("inv"));
        assert!(registry.lookup("inv").is_none());
    }

    #[test]
    fn test_observe_publishes_and_counts() {
        let metrics = Arc::new(CorrectionMetrics::new());
        let registry = MonitorRegistry::new(16, metrics.clone());
        let mut rx = registry.subscribe();
        registry.create("inv", "energy");

        let alert = registry
            .observe("inv", &StateChange::new("energy", Some("500"), Some("480")))
            .unwrap()
            .unwrap();
        assert_eq!(alert.delta, -20.0);
        assert_eq!(rx.try_recv().unwrap(), alert);
        assert_eq!(metrics.snapshot().live_alerts, 1);

        assert!(registry
            .observe("missing", &StateChange::new("energy", Some("2"), Some("1")))
            .is_none());
    }

    #[tokio::test]
    async fn test_attached_stream_feeds_monitor() {
        let registry = registry();
        let mut rx = registry.subscribe();
        registry.create("inv", "energy");

        let (tx, rx_changes) = tokio::sync::mpsc::channel(4);
        let stream = Box::pin(futures_util::stream::unfold(rx_changes, |mut rx| async move {
            rx.recv().await.map(|c| (c, rx))
        }));
        assert!(registry.attach_stream("inv", stream));

        tx.send(StateChange::new("energy", Some("10"), Some("3")))
            .await
            .unwrap();
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.delta, -7.0);

        assert!(registry.teardown("inv"));
    }
}
