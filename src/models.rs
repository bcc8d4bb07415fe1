//! Core data types shared by the store, the correction engine and the reports.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch, UTC.
pub type Timestamp = i64;

/// Bucket width of the periodic aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    FiveMinute,
    Hour,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::FiveMinute => 300,
            Granularity::Hour => 3600,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Granularity::FiveMinute => "5minute",
            Granularity::Hour => "hour",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5minute" | "five_minute" | "5m" => Some(Granularity::FiveMinute),
            "hour" | "1h" => Some(Granularity::Hour),
            _ => None,
        }
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::Hour
    }
}

/// One periodic bucket of a counter's cumulative sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatePoint {
    pub start: Timestamp,
    pub sum: Option<f64>,
}

impl AggregatePoint {
    pub fn new(start: Timestamp, sum: f64) -> Self {
        Self {
            start,
            sum: Some(sum),
        }
    }

    pub fn empty(start: Timestamp) -> Self {
        Self { start, sum: None }
    }

    /// Sum usable on either side of a delta comparison: present and strictly positive.
    pub fn usable_sum(&self) -> Option<f64> {
        match self.sum {
            Some(v) if v.is_finite() && v > 0.0 => Some(v),
            _ => None,
        }
    }
}

/// A decrease between two consecutive aggregate points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResetEvent {
    /// Start of the point whose sum dropped.
    pub timestamp: Timestamp,
    pub previous_sum: f64,
    pub current_sum: f64,
    /// Always negative.
    pub delta: f64,
}

/// One additive correction submitted to the aggregate store.
///
/// The store applies `adjustment` to the point starting at `timestamp` and to
/// every later point of the same counter. Reversal submits the exact negation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub counter_id: String,
    pub timestamp: DateTime<Utc>,
    pub adjustment: f64,
    pub unit: String,
}

impl AdjustmentRecord {
    pub fn anchor(&self) -> Timestamp {
        self.timestamp.timestamp()
    }

    pub fn negated(&self) -> Self {
        Self {
            counter_id: self.counter_id.clone(),
            timestamp: self.timestamp,
            adjustment: -self.adjustment,
            unit: self.unit.clone(),
        }
    }
}

/// A counter belonging to a group, with the tags used to pick the main counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSpec {
    pub id: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_unit() -> String {
    "kWh".to_string()
}

impl CounterSpec {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// A logical device: the set of counters corrected together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub counters: Vec<CounterSpec>,
}

impl Group {
    /// The counter used for detection: tagged both `primary` and `consumed`,
    /// else the first tagged `primary`.
    pub fn main_counter(&self) -> Option<&CounterSpec> {
        self.counters
            .iter()
            .find(|c| c.has_tag("primary") && c.has_tag("consumed"))
            .or_else(|| self.counters.iter().find(|c| c.has_tag("primary")))
    }

    pub fn counter(&self, counter_id: &str) -> Option<&CounterSpec> {
        self.counters.iter().find(|c| c.id == counter_id)
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Input of one correction session. Times are local wall-clock strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub group_id: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetTimestamp {
    pub utc: String,
    pub local: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeDetail {
    pub timestamp_utc: String,
    pub timestamp_local: String,
    pub current_value: f64,
    pub previous_value: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterDetail {
    pub counter_id: String,
    pub spikes: Vec<SpikeDetail>,
}

/// Result of one correction session, preview or applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub dry_run: bool,
    pub group_id: String,
    pub counters_processed: usize,
    pub reset_timestamps: Vec<ResetTimestamp>,
    pub counters_adjusted: usize,
    pub details: Vec<CounterDetail>,
    /// Present only when corrections were applied; this is what reversal replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustments: Option<Vec<AdjustmentRecord>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_counters: Vec<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionReport {
    pub fn empty(group_id: &str, dry_run: bool) -> Self {
        Self {
            dry_run,
            group_id: group_id.to_string(),
            counters_processed: 0,
            reset_timestamps: Vec::new(),
            counters_adjusted: 0,
            details: Vec::new(),
            adjustments: None,
            failed_counters: Vec::new(),
            message: String::new(),
            error: None,
        }
    }

    pub fn failed(group_id: &str, dry_run: bool, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut report = Self::empty(group_id, dry_run);
        report.message = format!("Correction aborted: {}", error);
        report.error = Some(error);
        report
    }
}

/// How far a simulated reset drops the counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropAmount {
    Explicit(f64),
    ToZero,
}

/// Input of the reversal engine: a prior report's ledger, or a manual simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReversalRequest {
    Ledger {
        adjustments: Vec<AdjustmentRecord>,
    },
    Simulate {
        counter_id: String,
        reset_time: String,
        #[serde(default)]
        drop_amount: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalReport {
    pub success: bool,
    pub reversed_count: usize,
    pub total_adjustments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    pub message: String,
    /// Adjustments submitted by this call (negations, or the synthetic drop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustments: Option<Vec<AdjustmentRecord>>,
}

// ============================================================================
// Time formatting
// ============================================================================

pub fn to_utc(ts: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn format_utc(ts: Timestamp) -> String {
    to_utc(ts).to_rfc3339()
}

pub fn format_local(ts: Timestamp, offset: &FixedOffset) -> String {
    to_utc(ts).with_timezone(offset).to_rfc3339()
}
