//! IP-monitoring gateway for the quotes application.
//!
//! Every inbound request is checked against an in-memory, time-bucketed request counter
//! ([`monitor::RateMonitor`]). IPs that go over the configured rate are banned for an
//! escalating period, and bans are persisted so they survive restarts.

pub mod ban_store;
pub mod bans;
pub mod buckets;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod worker;

pub use error::{Error, Result};
