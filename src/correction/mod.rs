//! Reset Correction Engine
//!
//! Detects drops in cumulative counters and repairs them with additive
//! adjustments against the aggregate store.
//!
//! - `detector`: pure scan for decreases
//! - `corrector`: bounded per-counter correction loop and its ledger
//! - `reversal`: exact undo of a ledger, and synthetic resets
//! - `session`: per-group orchestration and reporting
//!
//! ## Usage
//!
//! ```rust,ignore
//! let runner = SessionRunner::new(store, directory, config.correction.clone(), metrics);
//! let preview = runner.run(&SessionRequest {
//!     group_id: "inverter-1".into(),
//!     start_time: "2024-03-01 00:00".into(),
//!     end_time: "2024-03-02 00:00".into(),
//!     dry_run: true,
//! }).await?;
//! ```

pub mod corrector;
pub mod detector;
pub mod reversal;
pub mod session;
pub mod window;

pub use corrector::{compensation, Compensation, CounterCorrection, CorrectorSettings, SpikeCorrector};
pub use detector::{detect, Detection};
pub use reversal::ReversalEngine;
pub use session::{SessionFault, SessionRunner};
pub use window::{parse_local, Window};
