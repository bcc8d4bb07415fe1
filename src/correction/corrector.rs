//! Spike Corrector
//!
//! Bounded fixed-point loop for one counter: query, take the first decrease
//! not yet handled in this run, submit a compensating adjustment, wait for the
//! store to commit, repeat. Every pass counts toward `max_iterations`.
//!
//! The per-run handled set keeps an adjustment that is not yet visible from
//! being submitted a second time. It is not persisted across runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::detector::{detect, Detection};
use crate::config::CorrectionConfig;
use crate::metrics::CorrectionMetrics;
use crate::models::{to_utc, AdjustmentRecord, AggregatePoint, CounterSpec, Granularity, Timestamp};
use crate::store::AggregateStore;

/// Loop settings, derived from `CorrectionConfig`.
#[derive(Debug, Clone)]
pub struct CorrectorSettings {
    pub granularity: Granularity,
    pub commit_delay: Duration,
    pub max_iterations: usize,
    pub estimate_missing_energy: bool,
}

impl From<&CorrectionConfig> for CorrectorSettings {
    fn from(config: &CorrectionConfig) -> Self {
        Self {
            granularity: config.granularity,
            commit_delay: config.commit_delay,
            max_iterations: config.max_iterations.max(1),
            estimate_missing_energy: config.estimate_missing_energy,
        }
    }
}

/// Amount needed to undo one reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensation {
    /// Brings the dropped point back up to its predecessor.
    pub discontinuity: f64,
    /// Rate-based estimate of what accrued during the gap.
    pub missing_energy: f64,
}

impl Compensation {
    pub fn total(&self) -> f64 {
        self.discontinuity + self.missing_energy
    }
}

/// Compensation for the reset at `index` (the point that dropped).
///
/// The post-reset rate is taken from the next point when it is usable and
/// above the dropped value, then projected over the gap to the previous point.
pub fn compensation(points: &[AggregatePoint], index: usize, estimate_missing: bool) -> Option<Compensation> {
    if index == 0 || index >= points.len() {
        return None;
    }
    let previous = &points[index - 1];
    let current = &points[index];
    let prev_sum = previous.usable_sum()?;
    let cur_sum = current.usable_sum()?;

    let discontinuity = (prev_sum - cur_sum).max(0.0);

    let mut missing_energy = 0.0;
    if estimate_missing {
        if let Some(next) = points.get(index + 1) {
            if let Some(next_sum) = next.usable_sum() {
                let span = next.start - current.start;
                if next_sum > cur_sum && span > 0 {
                    let rate = (next_sum - cur_sum) / span as f64;
                    let gap = (current.start - previous.start).max(0) as f64;
                    missing_energy = rate * gap;
                }
            }
        }
    }

    Some(Compensation {
        discontinuity,
        missing_energy,
    })
}

/// Result of correcting one counter.
#[derive(Debug, Clone, Default)]
pub struct CounterCorrection {
    pub counter_id: String,
    /// Ledger, in submission order.
    pub adjustments: Vec<AdjustmentRecord>,
    pub iterations: usize,
    pub failed_attempts: usize,
    /// Loop stopped at `max_iterations` with a decrease still pending.
    pub capped: bool,
    /// Query failure that aborted this counter.
    pub error: Option<String>,
}

impl CounterCorrection {
    pub fn succeeded(&self) -> bool {
        !self.capped && self.error.is_none()
    }
}

pub struct SpikeCorrector {
    store: Arc<dyn AggregateStore>,
    settings: CorrectorSettings,
    metrics: Option<Arc<CorrectionMetrics>>,
}

impl SpikeCorrector {
    pub fn new(store: Arc<dyn AggregateStore>, settings: CorrectorSettings) -> Self {
        Self {
            store,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CorrectionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn load(&self, counter_id: &str, start: Timestamp, end: Timestamp) -> anyhow::Result<Vec<AggregatePoint>> {
        let ids = [counter_id.to_string()];
        let mut result = self
            .store
            .query(&ids, start, end, self.settings.granularity)
            .await?;
        Ok(result.remove(counter_id).unwrap_or_default())
    }

    /// Make the counter non-decreasing over `[start, end)`.
    pub async fn correct(&self, counter: &CounterSpec, start: Timestamp, end: Timestamp) -> CounterCorrection {
        let mut result = CounterCorrection {
            counter_id: counter.id.clone(),
            ..Default::default()
        };
        let mut handled: HashSet<Timestamp> = HashSet::new();
        let mut converged = false;
        // At least one pass, or a clean counter would be reported as capped
        let max_iterations = self.settings.max_iterations.max(1);

        while result.iterations < max_iterations {
            result.iterations += 1;

            let points = match self.load(&counter.id, start, end).await {
                Ok(points) => points,
                Err(e) => {
                    error!(counter_id = %counter.id, "Aggregate query failed: {:#}", e);
                    result.error = Some(format!("query failed for {}: {}", counter.id, e));
                    return result;
                }
            };

            let Detection { events, indices, .. } = detect(&points);
            let next = events
                .iter()
                .zip(indices.iter())
                .find(|(event, _)| !handled.contains(&event.timestamp));

            let Some((event, &index)) = next else {
                converged = true;
                break;
            };

            let Some(comp) = compensation(&points, index, self.settings.estimate_missing_energy) else {
                // detect() only flags usable pairs
                handled.insert(event.timestamp);
                continue;
            };
            let adjustment = comp.total();

            debug!(
                counter_id = %counter.id,
                timestamp = event.timestamp,
                discontinuity = comp.discontinuity,
                missing_energy = comp.missing_energy,
                "Computed compensation"
            );

            match self
                .store
                .adjust(&counter.id, event.timestamp, adjustment, &counter.unit)
                .await
            {
                Ok(()) => {
                    handled.insert(event.timestamp);
                    result.adjustments.push(AdjustmentRecord {
                        counter_id: counter.id.clone(),
                        timestamp: to_utc(event.timestamp),
                        adjustment,
                        unit: counter.unit.clone(),
                    });
                    if let Some(m) = &self.metrics {
                        m.record_adjustment(adjustment);
                    }
                    info!(
                        counter_id = %counter.id,
                        timestamp = event.timestamp,
                        previous_sum = event.previous_sum,
                        current_sum = event.current_sum,
                        adjustment,
                        "Submitted reset correction"
                    );

                    if !self.settings.commit_delay.is_zero() {
                        tokio::time::sleep(self.settings.commit_delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        counter_id = %counter.id,
                        timestamp = event.timestamp,
                        "Adjustment failed, moving to next reset: {:#}", e
                    );
                    handled.insert(event.timestamp);
                    result.failed_attempts += 1;
                    if let Some(m) = &self.metrics {
                        m.record_adjustment_failure();
                    }
                }
            }
        }

        if !converged {
            result.capped = true;
            if let Some(m) = &self.metrics {
                m.record_cap_hit();
            }
            error!(
                counter_id = %counter.id,
                iterations = result.iterations,
                adjustments = result.adjustments.len(),
                "Correction stopped at iteration cap"
            );
        }

        result
    }
}
