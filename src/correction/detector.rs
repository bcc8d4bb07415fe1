//! Reset detection over one counter's aggregate sequence.
//!
//! The counter is defined as non-decreasing, so any drop between two usable
//! consecutive points is a reset. There is no smoothing or threshold.

use tracing::debug;

use crate::models::{AggregatePoint, ResetEvent};

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Chronological, one per qualifying pair.
    pub events: Vec<ResetEvent>,
    /// Indices (into the scanned slice) of the point that dropped, parallel to `events`.
    pub indices: Vec<usize>,
    /// Pairs skipped because a sum was negative.
    pub corrupted_pairs: usize,
}

/// Flag every index whose sum is lower than its predecessor's.
///
/// Pairs where either sum is absent or zero are skipped (uninitialized
/// sensor). Pairs where either sum is negative are counted as corrupted and
/// never reported.
pub fn detect(points: &[AggregatePoint]) -> Detection {
    let mut detection = Detection::default();

    for (i, pair) in points.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        let (Some(prev_sum), Some(cur_sum)) = (previous.sum, current.sum) else {
            continue;
        };
        if prev_sum == 0.0 || cur_sum == 0.0 {
            continue;
        }
        if prev_sum < 0.0 || cur_sum < 0.0 {
            debug!(
                timestamp = current.start,
                prev_sum, cur_sum, "Skipping corrupted aggregate pair"
            );
            detection.corrupted_pairs += 1;
            continue;
        }
        if cur_sum < prev_sum {
            detection.events.push(ResetEvent {
                timestamp: current.start,
                previous_sum: prev_sum,
                current_sum: cur_sum,
                delta: cur_sum - prev_sum,
            });
            detection.indices.push(i + 1);
        }
    }

    detection
}
