//! Time windows: local wall-clock input to UTC epoch seconds.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};

use crate::models::{Granularity, Timestamp};

const LOCAL_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a time given either with an explicit offset (RFC 3339) or as local
/// wall-clock time in `offset`. A bare date means local midnight.
pub fn parse_local(input: &str, offset: &FixedOffset) -> Result<Timestamp> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp());
    }

    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| anyhow!("unrecognized time '{}'", input))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| anyhow!("ambiguous local time '{}'", input))
}

/// Caller window `[start, end]`, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self> {
        if start > end {
            return Err(anyhow!("start time is after end time"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Half-open query range widened by one bucket on both sides.
    ///
    /// The point before `start` is needed to see a drop at `start`, and a
    /// drop landing at `end` needs `end` itself inside the half-open range.
    pub fn expanded(&self, granularity: Granularity) -> (Timestamp, Timestamp) {
        let g = granularity.seconds();
        (self.start - g, self.end + g)
    }
}
