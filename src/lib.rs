//! # jobgate
//!
//! Admission control for database-backed workers sharing one Postgres.
//!
//! Provides a generic skip-locked job queue ([`queue`]), a polling worker
//! harness ([`harness`]), a host/pool health monitor ([`health`]), and a
//! per-worker-type concurrency scaler driven by that health ([`scaler`]).

pub mod config;
pub mod db;
pub mod error;
pub mod harness;
pub mod health;
pub mod model;
pub mod queue;
pub mod scaler;
pub mod telemetry;

pub use error::{Error, Result};
