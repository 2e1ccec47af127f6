//! Agent run orchestration.
//!
//! Covers background process supervision, runner re-invocation markers,
//! single-run coordination, and display-status housekeeping.

pub mod coordinator;
pub mod runner;
pub mod status;
pub mod supervisor;
