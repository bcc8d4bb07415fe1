//! Prometheus Metrics for Reset Correction
//!
//! Plain atomic counters rendered in the Prometheus text format by
//! `to_prometheus`, served on `/metrics`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correction metrics registry
#[derive(Debug, Default)]
pub struct CorrectionMetrics {
    pub sessions_total: AtomicU64,
    pub sessions_dry_run: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub resets_detected: AtomicU64,
    pub adjustments_applied: AtomicU64,
    pub adjustments_failed: AtomicU64,
    pub cap_hits: AtomicU64,
    pub reversals_applied: AtomicU64,
    pub reversals_failed: AtomicU64,
    pub live_alerts: AtomicU64,

    /// Sum of applied adjustment amounts, stored as f64 bits
    adjustment_volume_bits: AtomicU64,

    /// Live alerts per group
    pub alerts_by_group: RwLock<HashMap<String, u64>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub resets_detected: u64,
    pub adjustments_applied: u64,
    pub adjustments_failed: u64,
    pub cap_hits: u64,
    pub reversals_applied: u64,
    pub reversals_failed: u64,
    pub live_alerts: u64,
    pub adjustment_volume: f64,
}

impl CorrectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session(&self, dry_run: bool, failed: bool) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        if dry_run {
            self.sessions_dry_run.fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resets(&self, count: usize) {
        self.resets_detected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_adjustment(&self, amount: f64) {
        self.adjustments_applied.fetch_add(1, Ordering::Relaxed);
        let mut current = self.adjustment_volume_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + amount.abs()).to_bits();
            match self.adjustment_volume_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn record_adjustment_failure(&self) {
        self.adjustments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cap_hit(&self) {
        self.cap_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reversal(&self, success: bool) {
        if success {
            self.reversals_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reversals_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_live_alert(&self, group_id: &str) {
        self.live_alerts.fetch_add(1, Ordering::Relaxed);
        *self
            .alerts_by_group
            .write()
            .entry(group_id.to_string())
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            resets_detected: self.resets_detected.load(Ordering::Relaxed),
            adjustments_applied: self.adjustments_applied.load(Ordering::Relaxed),
            adjustments_failed: self.adjustments_failed.load(Ordering::Relaxed),
            cap_hits: self.cap_hits.load(Ordering::Relaxed),
            reversals_applied: self.reversals_applied.load(Ordering::Relaxed),
            reversals_failed: self.reversals_failed.load(Ordering::Relaxed),
            live_alerts: self.live_alerts.load(Ordering::Relaxed),
            adjustment_volume: f64::from_bits(self.adjustment_volume_bits.load(Ordering::Relaxed)),
        }
    }

    /// Export all metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &AtomicU64); 9] = [
            ("resetguard_sessions_total", "Correction sessions run", &self.sessions_total),
            ("resetguard_sessions_dry_run_total", "Sessions run as preview", &self.sessions_dry_run),
            ("resetguard_sessions_failed_total", "Sessions ending with an error", &self.sessions_failed),
            ("resetguard_resets_detected_total", "Reset timestamps reported", &self.resets_detected),
            ("resetguard_adjustments_applied_total", "Adjustments submitted to the store", &self.adjustments_applied),
            ("resetguard_adjustments_failed_total", "Adjustments rejected by the store", &self.adjustments_failed),
            ("resetguard_iteration_cap_hits_total", "Counters stopped at the iteration cap", &self.cap_hits),
            ("resetguard_reversals_applied_total", "Reversal entries applied", &self.reversals_applied),
            ("resetguard_reversals_failed_total", "Reversal entries that failed", &self.reversals_failed),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
        }

        output.push_str("# HELP resetguard_adjustment_volume_total Absolute sum of applied adjustments\n");
        output.push_str("# TYPE resetguard_adjustment_volume_total counter\n");
        output.push_str(&format!(
            "resetguard_adjustment_volume_total {}\n\n",
            self.snapshot().adjustment_volume
        ));

        output.push_str("# HELP resetguard_live_alerts_total Live reset alerts emitted\n");
        output.push_str("# TYPE resetguard_live_alerts_total counter\n");
        for (group, count) in self.alerts_by_group.read().iter() {
            output.push_str(&format!(
                "resetguard_live_alerts_total{{group=\"{}\"}} {}\n",
                group, count
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjustment_volume_accumulates_absolute_values() {
        let m = CorrectionMetrics::new();
        m.record_adjustment(60.0);
        m.record_adjustment(-20.0);
        let snap = m.snapshot();
        assert_eq!(snap.adjustments_applied, 2);
        assert_eq!(snap.adjustment_volume, 80.0);
    }

    #[test]
    fn test_metrics_prometheus_export() {
        let m = CorrectionMetrics::new();
        m.record_session(false, false);
        m.record_cap_hit();
        m.record_live_alert("inverter-1");

        let output = m.to_prometheus();
        assert!(output.contains("resetguard_sessions_total 1"));
        assert!(output.contains("resetguard_iteration_cap_hits_total 1"));
        assert!(output.contains("resetguard_live_alerts_total{group=\"inverter-1\"} 1"));
    }
}
