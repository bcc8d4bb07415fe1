//! Application state shared by the HTTP server and the CLI.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::correction::{parse_local, ReversalEngine, SessionRunner};
use crate::groups::{GroupDirectory, StaticGroupDirectory};
use crate::metrics::CorrectionMetrics;
use crate::models::{
    CounterSpec, DropAmount, ReversalReport, ReversalRequest, SessionReport, SessionRequest,
};
use crate::monitor::{spawn_webhook_forwarder, MonitorInfo, MonitorRegistry};
use crate::store::{self, AggregateStore};

/// Outcome of asking for a live monitor on a group.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorStart {
    Created(MonitorInfo),
    AlreadyRunning(MonitorInfo),
    UnknownGroup,
    NoMainCounter,
}

pub struct ResetGuard {
    pub config: AppConfig,
    pub store: Arc<dyn AggregateStore>,
    pub directory: Arc<StaticGroupDirectory>,
    pub metrics: Arc<CorrectionMetrics>,
    pub sessions: SessionRunner,
    pub reversals: ReversalEngine,
    pub monitors: Arc<MonitorRegistry>,
}

impl ResetGuard {
    pub fn new(config: AppConfig, store: Arc<dyn AggregateStore>) -> Self {
        let metrics = Arc::new(CorrectionMetrics::new());
        let directory = Arc::new(StaticGroupDirectory::new(config.groups.clone()));
        let sessions = SessionRunner::new(
            store.clone(),
            directory.clone(),
            config.correction.clone(),
            metrics.clone(),
        );
        let reversals = ReversalEngine::new(store.clone()).with_metrics(metrics.clone());
        let monitors = Arc::new(MonitorRegistry::new(
            config.monitor.alert_capacity,
            metrics.clone(),
        ));

        Self {
            config,
            store,
            directory,
            metrics,
            sessions,
            reversals,
            monitors,
        }
    }

    /// Open the configured store and build the service on top of it.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = store::open(&config.store)?;
        info!(
            store = ?config.store.kind,
            groups = config.groups.len(),
            "Reset guard initialized"
        );
        Ok(Self::new(config, store))
    }

    /// Start forwarding live alerts to the configured webhook, if any.
    /// Must be called from within a tokio runtime.
    pub fn start_alert_delivery(&self) -> Option<tokio::task::JoinHandle<()>> {
        let url = self.config.monitor.webhook_url.clone()?;
        Some(spawn_webhook_forwarder(url, self.monitors.subscribe()))
    }

    pub async fn run_session(&self, request: &SessionRequest) -> Result<SessionReport> {
        self.sessions.run(request).await
    }

    /// Replay a ledger backwards, or manufacture a synthetic reset.
    pub async fn handle_reversal(&self, request: ReversalRequest) -> ReversalReport {
        match request {
            ReversalRequest::Ledger { adjustments } => self.reversals.reverse(&adjustments).await,
            ReversalRequest::Simulate {
                counter_id,
                reset_time,
                drop_amount,
            } => {
                let offset = self.config.correction.local_offset();
                let at = match parse_local(&reset_time, &offset) {
                    Ok(at) => at,
                    Err(e) => {
                        let message = format!("invalid reset_time: {}", e);
                        return ReversalReport {
                            success: false,
                            reversed_count: 0,
                            total_adjustments: 1,
                            errors: Some(vec![message.clone()]),
                            message,
                            adjustments: None,
                        };
                    }
                };
                let counter = self.counter_spec(&counter_id);
                let drop = match drop_amount {
                    Some(amount) => DropAmount::Explicit(amount),
                    None => DropAmount::ToZero,
                };
                self.reversals.simulate_reset(&counter, at, drop).await
            }
        }
    }

    /// Configured counter for `counter_id`, or a bare one with the default unit.
    fn counter_spec(&self, counter_id: &str) -> CounterSpec {
        self.directory
            .group_of(counter_id)
            .and_then(|g| g.counter(counter_id))
            .cloned()
            .unwrap_or_else(|| CounterSpec {
                id: counter_id.to_string(),
                unit: "kWh".to_string(),
                tags: Vec::new(),
            })
    }

    /// Create a live monitor on the group's main counter.
    pub async fn start_monitor(&self, group_id: &str) -> Result<MonitorStart> {
        let Some(group) = self.directory.resolve(group_id).await? else {
            return Ok(MonitorStart::UnknownGroup);
        };
        let Some(main) = group.main_counter() else {
            return Ok(MonitorStart::NoMainCounter);
        };

        let created = self.monitors.create(group_id, &main.id);
        let Some(info) = self.monitors.lookup(group_id) else {
            return Ok(MonitorStart::UnknownGroup);
        };
        Ok(if created {
            MonitorStart::Created(info)
        } else {
            MonitorStart::AlreadyRunning(info)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregatePoint, Granularity, Group};
    use crate::store::MemoryStore;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.correction.commit_delay = std::time::Duration::ZERO;
        config.groups = vec![Group {
            id: "inv".into(),
            name: None,
            counters: vec![CounterSpec {
                id: "energy".into(),
                unit: "Wh".into(),
                tags: vec!["primary".into()],
            }],
        }];
        config
    }

    #[tokio::test]
    async fn test_simulate_uses_configured_unit() {
        let store = Arc::new(MemoryStore::new());
        store.insert("energy", Granularity::Hour, &[AggregatePoint::new(0, 12.0)]);
        let guard = ResetGuard::new(config(), store.clone());

        let report = guard
            .handle_reversal(ReversalRequest::Simulate {
                counter_id: "energy".into(),
                reset_time: "1970-01-01T00:30:00Z".into(),
                drop_amount: Some(5.0),
            })
            .await;
        assert!(report.success, "{:?}", report);
        let calls = store.adjust_calls();
        assert_eq!(calls[0].delta, -5.0);
        assert_eq!(calls[0].anchor, 1800);
        assert_eq!(report.adjustments.unwrap()[0].unit, "Wh");
    }

    #[tokio::test]
    async fn test_simulate_rejects_bad_time() {
        let guard = ResetGuard::new(config(), Arc::new(MemoryStore::new()));
        let report = guard
            .handle_reversal(ReversalRequest::Simulate {
                counter_id: "energy".into(),
                reset_time: "yesterday".into(),
                drop_amount: None,
            })
            .await;
        assert!(!report.success);
        assert!(report.message.contains("invalid reset_time"));
    }

    #[tokio::test]
    async fn test_start_monitor_outcomes() {
        let guard = ResetGuard::new(config(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            guard.start_monitor("inv").await.unwrap(),
            MonitorStart::Created(ref info) if info.counter_id == "energy"
        ));
        assert!(matches!(
            guard.start_monitor("inv").await.unwrap(),
            MonitorStart::AlreadyRunning(_)
        ));
        assert_eq!(
            guard.start_monitor("nope").await.unwrap(),
            MonitorStart::UnknownGroup
        );
    }
}
