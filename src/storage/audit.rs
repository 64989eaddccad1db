//! Append-only audit log.
//!
//! One JSON line per committed cycle, late settlement or fatal stop, written by a
//! background task so the decision loop never waits on disk. The log holds
//! enough to rebuild the run's equity, streak, counters and halt flag by
//! replay.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::accountant::Accountant;
use crate::strategy::DecisionRecord;
use crate::types::{PositionStatus, RunState, TradeRecord};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A committed interval slot.
    Cycle,
    /// A position resolved outside its own cycle (startup or sweep).
    Reconciliation,
    /// The run was halted.
    Halt,
    /// A fatal error stopped the process; the run resumes once it is fixed.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    pub kind: AuditKind,
    /// Interval index this record belongs to.
    pub cycle: u32,
    pub timestamp: DateTime<Utc>,
    /// Signal, gate decision and sizing result.
    pub decision: Option<DecisionRecord>,
    /// Why the cycle did not trade, when the pipeline never ran.
    pub skip_reason: Option<String>,
    pub client_order_id: Option<String>,
    pub external_order_id: Option<String>,
    /// Whether an order reached the market this interval.
    pub traded: bool,
    /// Status of the open position after this record, if any remains.
    pub position_status: Option<PositionStatus>,
    /// Trade folded by this record.
    pub settlement: Option<TradeRecord>,
    pub equity_after: Decimal,
    pub streak_after: u32,
    pub cycles_after: u32,
    pub intervals_after: u32,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

impl AuditRecord {
    /// Record skeleton carrying the state's post-commit counters.
    pub fn from_state(kind: AuditKind, state: &RunState, timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id: state.run_id.clone(),
            kind,
            cycle: state.intervals_elapsed,
            timestamp,
            decision: None,
            skip_reason: None,
            client_order_id: state.open_position.as_ref().map(|p| p.client_order_id.clone()),
            external_order_id: state
                .open_position
                .as_ref()
                .and_then(|p| p.external_order_id.clone()),
            traded: false,
            position_status: state.open_position.as_ref().map(|p| p.status),
            settlement: None,
            equity_after: state.current_equity,
            streak_after: state.win_streak,
            cycles_after: state.cycles_completed,
            intervals_after: state.intervals_elapsed,
            halted: state.halted,
            halt_reason: state.halt_reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Non-blocking handle to the audit writer task.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditLog {
    /// Start the writer task appending to `path`.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(path.into(), rx));
        (Self { tx }, handle)
    }

    /// Queue a record. Never waits.
    pub fn record(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            warn!("Audit writer has stopped, record dropped");
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<AuditRecord>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open audit log, records will be dropped");
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to serialise audit record");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(path = %path.display(), error = %e, "Audit write failed");
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!(error = %e, "Audit flush failed");
        }
        debug!(cycle = record.cycle, kind = ?record.kind, "Audit record written");
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Read every record from a JSONL audit file.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l)
                .with_context(|| format!("Malformed audit record on line {}", i + 1))
        })
        .collect()
}

/// Rebuild a run's durable counters from its audit records, checking every
/// record's post-state against the replayed state.
pub fn replay(
    starting_capital: Decimal,
    skips_consume_cycle: bool,
    records: &[AuditRecord],
) -> Result<RunState> {
    let mut state = RunState::new(starting_capital, skips_consume_cycle);
    if let Some(first) = records.first() {
        state.run_id = first.run_id.clone();
        state.started_at = first.timestamp;
    }

    for (i, rec) in records.iter().enumerate() {
        if let Some(trade) = &rec.settlement {
            if !state.has_trade(&trade.client_order_id) {
                state.current_equity += trade.pnl;
                state.trades.push(trade.clone());
                state.win_streak = state.recompute_streak();
            }
        }

        match rec.kind {
            AuditKind::Cycle => Accountant::commit_cycle(&mut state, rec.traded, rec.timestamp),
            AuditKind::Reconciliation => Accountant::record_equity(&mut state, rec.timestamp),
            AuditKind::Halt | AuditKind::Fatal => {}
        }

        if rec.halted {
            state.halt(rec.halt_reason.clone().unwrap_or_else(|| "halted".into()));
        }

        let diverged = state.current_equity != rec.equity_after
            || state.win_streak != rec.streak_after
            || state.cycles_completed != rec.cycles_after
            || state.intervals_elapsed != rec.intervals_after
            || state.halted != rec.halted;
        if diverged {
            anyhow::bail!(
                "Replay diverged at record {} (cycle {}): equity {} vs {}, streak {} vs {}, cycles {} vs {}",
                i + 1,
                rec.cycle,
                state.current_equity,
                rec.equity_after,
                state.win_streak,
                rec.streak_after,
                state.cycles_completed,
                rec.cycles_after,
            );
        }
    }

    Ok(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
