//! Persistence layer.
//!
//! Saves and loads the run state to/from a JSON file. Saves are atomic:
//! the state is written to a sibling temp file, flushed to disk and
//! renamed over the target, so a reader sees either the old or the new
//! state, never a torn write. Loads are schema-validated.

pub mod audit;

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{PositionStatus, RunState, SCHEMA_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt: {0}")]
    Corrupt(String),
}

/// Durable home of the run state. Only the orchestrator calls `save`.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when no state has been saved yet.
    fn load(&self) -> Result<Option<RunState>, StoreError>;

    /// All-or-nothing replace of the persisted state.
    fn save(&self, state: &RunState) -> Result<(), StoreError>;
}

/// JSON file store.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Delete the state file (for tests or a manual reset).
    pub fn delete(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<Option<RunState>, StoreError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No saved state found, starting fresh");
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&json)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        validate(&state).map_err(StoreError::Corrupt)?;

        info!(
            path = %self.path.display(),
            run_id = %state.run_id,
            equity = %state.current_equity,
            cycles = state.cycles_completed,
            trades = state.trades.len(),
            "State loaded from disk"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Corrupt(format!("serialise: {e}")))?;

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        // Persist the rename itself where the platform allows it.
        #[cfg(unix)]
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }

        debug!(
            path = %self.path.display(),
            equity = %state.current_equity,
            cycles = state.cycles_completed,
            "State saved"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks on a loaded state. Returns a description of the first
/// violation.
pub fn validate(state: &RunState) -> Result<(), String> {
    if state.schema_version != SCHEMA_VERSION {
        return Err(format!(
            "schema version {} (expected {SCHEMA_VERSION})",
            state.schema_version
        ));
    }
    if state.starting_capital <= Decimal::ZERO {
        return Err("starting capital must be positive".into());
    }
    if state.current_equity < Decimal::ZERO {
        return Err(format!("negative equity {}", state.current_equity));
    }

    let expected_equity = state.starting_capital + state.total_pnl();
    if state.current_equity != expected_equity {
        return Err(format!(
            "equity {} does not match starting capital plus trade P&L ({expected_equity})",
            state.current_equity
        ));
    }

    let streak = state.recompute_streak();
    if state.win_streak != streak {
        return Err(format!(
            "win streak {} disagrees with trade log ({streak})",
            state.win_streak
        ));
    }

    let mut ids = HashSet::new();
    for t in &state.trades {
        if !ids.insert(t.client_order_id.as_str()) {
            return Err(format!("duplicate trade {}", t.client_order_id));
        }
    }

    if state
        .equity_curve
        .windows(2)
        .any(|w| w[1].timestamp < w[0].timestamp)
    {
        return Err("equity curve is not time-ordered".into());
    }

    if state.cycles_completed > state.intervals_elapsed {
        return Err(format!(
            "cycles completed {} exceeds intervals elapsed {}",
            state.cycles_completed, state.intervals_elapsed
        ));
    }

    if state.halted && state.halt_reason.is_none() {
        return Err("halted without a reason".into());
    }

    if let Some(pos) = &state.open_position {
        if pos.status == PositionStatus::Settled || pos.outcome.is_some() || pos.pnl.is_some() {
            return Err(format!("open position {} carries a settlement", pos.client_order_id));
        }
        if pos.size <= Decimal::ZERO {
            return Err(format!("open position {} has non-positive size", pos.client_order_id));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
