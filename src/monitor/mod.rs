//! Live reset monitoring: per-group watchers raising advisory alerts.

pub mod live;
pub mod registry;
pub mod webhook;

pub use live::{
    parse_reading, state_change_lines, LiveResetMonitor, MonitorState, ResetAlert, StateChange,
};
pub use registry::{MonitorInfo, MonitorRegistry};
pub use webhook::spawn_webhook_forwarder;
