//! resetguard backend library
//!
//! Counter reset detection and correction over an aggregate statistics store,
//! plus live reset monitoring. Used by the `resetguard` binary and by tests.

pub mod api;
pub mod config;
pub mod correction;
pub mod groups;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod monitor;
pub mod service;
pub mod store;
