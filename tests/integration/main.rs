//! Integration tests: full runs of the orchestrator against a scripted
//! in-memory market.

mod mock_market;
mod simulation;
