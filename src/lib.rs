//! UPDOWN — fixed-run directional agent for five-minute up/down markets.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod feed;
pub mod indicators;
pub mod platforms;
pub mod shutdown;
pub mod storage;
pub mod strategy;
pub mod types;
