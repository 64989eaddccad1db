//! Core engine — the interval clock and the decide → execute → settle loop.

pub mod accountant;
pub mod clock;
pub mod executor;
pub mod orchestrator;
