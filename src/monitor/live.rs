//! Live reset monitor for one designated counter.
//!
//! Watches consecutive readings and raises an alert the moment a reading is
//! lower than the one before it. Purely advisory: it never reads or writes
//! the aggregate store and keeps no state across restarts.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// One live state change of a counter, as raw reading strings.
///
/// `observed_at` is part of the alert identity: a redelivered change is only
/// recognised as the same event if it carries the same timestamp, or none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub counter_id: String,
    #[serde(default)]
    pub old_state: Option<String>,
    #[serde(default)]
    pub new_state: Option<String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl StateChange {
    pub fn new(counter_id: &str, old_state: Option<&str>, new_state: Option<&str>) -> Self {
        Self {
            counter_id: counter_id.to_string(),
            old_state: old_state.map(str::to_string),
            new_state: new_state.map(str::to_string),
            observed_at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetAlert {
    pub group_id: String,
    pub counter_id: String,
    pub old_value: f64,
    pub new_value: f64,
    /// Always negative.
    pub delta: f64,
    pub observed_at: DateTime<Utc>,
}

/// Identity of the event pair an alert was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertKey {
    old_bits: u64,
    new_bits: u64,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    AlertSent(AlertKey),
}

/// Numeric value of a reading; `None` for unavailable, unknown or garbage.
pub fn parse_reading(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    match raw {
        "" | "unavailable" | "unknown" | "none" | "None" => None,
        _ => raw.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}

/// Newline-delimited JSON `StateChange`s read from `reader`. Blank and
/// malformed lines are skipped; the stream ends at EOF or on a read error.
pub fn state_change_lines<R>(reader: R) -> Pin<Box<dyn Stream<Item = StateChange> + Send>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    Box::pin(futures_util::stream::unfold(
        reader.lines(),
        |mut lines| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<StateChange>(line) {
                            Ok(change) => return Some((change, lines)),
                            Err(e) => warn!(error = %e, "Skipping malformed state change"),
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(error = %e, "State change input failed");
                        return None;
                    }
                }
            }
        },
    ))
}

#[derive(Debug, Clone)]
pub struct LiveResetMonitor {
    group_id: String,
    counter_id: String,
    state: MonitorState,
    alerts_sent: u64,
}

impl LiveResetMonitor {
    pub fn new(group_id: &str, counter_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            counter_id: counter_id.to_string(),
            state: MonitorState::Idle,
            alerts_sent: 0,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn counter_id(&self) -> &str {
        &self.counter_id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent
    }

    /// Feed one state change; returns the alert if it shows a decrease.
    pub fn observe(&mut self, change: &StateChange) -> Option<ResetAlert> {
        if change.counter_id != self.counter_id {
            return None;
        }

        let (Some(old), Some(new)) = (
            parse_reading(change.old_state.as_deref()),
            parse_reading(change.new_state.as_deref()),
        ) else {
            debug!(
                counter_id = %self.counter_id,
                old = ?change.old_state,
                new = ?change.new_state,
                "Ignoring unparsable reading"
            );
            return None;
        };

        if new >= old {
            return None;
        }

        let key = AlertKey {
            old_bits: old.to_bits(),
            new_bits: new.to_bits(),
            observed_at: change.observed_at,
        };
        if self.state == MonitorState::AlertSent(key) {
            return None;
        }
        self.state = MonitorState::AlertSent(key);
        self.alerts_sent += 1;

        let alert = ResetAlert {
            group_id: self.group_id.clone(),
            counter_id: self.counter_id.clone(),
            old_value: old,
            new_value: new,
            delta: new - old,
            observed_at: change.observed_at.unwrap_or_else(Utc::now),
        };
        warn!(
            group_id = %alert.group_id,
            counter_id = %alert.counter_id,
            old_value = old,
            new_value = new,
            delta = alert.delta,
            "Live counter reset detected"
        );
        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrease_emits_one_alert() {
        let mut monitor = LiveResetMonitor::new("inv", "energy");
        let alert = monitor
            .observe(&StateChange::new("energy", Some("500"), Some("480")))
            .unwrap();
        assert_eq!(alert.delta, -20.0);
        assert_eq!(alert.old_value, 500.0);
        assert_eq!(alert.new_value, 480.0);
        assert!(matches!(monitor.state(), MonitorState::AlertSent(_)));
    }

    #[test]
    fn test_unavailable_reading_is_ignored() {
        let mut monitor = LiveResetMonitor::new("inv", "energy");
        assert!(monitor
            .observe(&StateChange::new("energy", Some("unavailable"), Some("480")))
            .is_none());
        assert!(monitor
            .observe(&StateChange::new("energy", Some("500"), None))
            .is_none());
        assert!(monitor
            .observe(&StateChange::new("energy", Some("abc"), Some("1")))
            .is_none());
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn test_increase_and_other_counters_ignored() {
        let mut monitor = LiveResetMonitor::new("inv", "energy");
        assert!(monitor
            .observe(&StateChange::new("energy", Some("480"), Some("481.5")))
            .is_none());
        assert!(monitor
            .observe(&StateChange::new("other", Some("500"), Some("1")))
            .is_none());
        assert_eq!(monitor.alerts_sent(), 0);
    }

    #[test]
    fn test_same_event_pair_alerts_once() {
        let mut monitor = LiveResetMonitor::new("inv", "energy");
        let change = StateChange::new("energy", Some("500"), Some("480"));
        assert!(monitor.observe(&change).is_some());
        assert!(monitor.observe(&change).is_none());

        let later = StateChange::new("energy", Some("480"), Some("2"));
        assert!(monitor.observe(&later).is_some());
        assert_eq!(monitor.alerts_sent(), 2);
    }

    #[test]
    fn test_timestamp_distinguishes_repeated_values() {
        let mut monitor = LiveResetMonitor::new("inv", "energy");
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::minutes(5);
        let first = StateChange::new("energy", Some("10"), Some("1")).observed_at(t1);
        assert_eq!(monitor.observe(&first).unwrap().observed_at, t1);
        assert!(monitor.observe(&first).is_none());

        let second = StateChange::new("energy", Some("10"), Some("1")).observed_at(t2);
        assert!(monitor.observe(&second).is_some());
    }

    #[tokio::test]
    async fn test_state_change_lines_skips_bad_input() {
        use futures_util::StreamExt;

        let input: &'static [u8] = b"{\"counter_id\":\"energy\",\"old_state\":\"500\",\"new_state\":\"480\"}\n\
            \n\
            not json\n\
            {\"counter_id\":\"energy\",\"old_state\":\"480\",\"new_state\":\"2\",\"observed_at\":\"2024-03-01T12:00:00Z\"}";
        let changes: Vec<StateChange> = state_change_lines(input).collect().await;

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], StateChange::new("energy", Some("500"), Some("480")));
        assert!(changes[0].observed_at.is_none());
        assert_eq!(
            changes[1].observed_at.map(|t| t.to_rfc3339()).as_deref(),
            Some("2024-03-01T12:00:00+00:00")
        );
    }
}
