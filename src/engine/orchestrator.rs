//! Cycle orchestrator.
//!
//! Drives the run one interval at a time:
//!
//! ```text
//! Idle → AwaitingInterval → Deciding → Gating → Sizing → Executing
//!      → Settling → Committing → AwaitingInterval ... → Finished | Halted
//! ```
//!
//! Skips jump straight to Committing. A halt short-circuits everything
//! after the commit. State is persisted after every commit and before any
//! order is submitted, so a crash at any point restarts from the last
//! committed cycle plus, at most, one intended order that reconciliation
//! resolves by its idempotency key.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::accountant::Accountant;
use crate::engine::clock::{CycleClock, Tick};
use crate::engine::executor::{Executor, Reconciliation, SettlementResult};
use crate::feed::FeedSnapshot;
use crate::indicators::MaRelation;
use crate::platforms::{ConnectorError, OrderHandle};
use crate::shutdown::Shutdown;
use crate::storage::audit::{AuditKind, AuditLog, AuditRecord};
use crate::storage::{StateStore, StoreError};
use crate::strategy::{DecisionRecord, StrategyPipeline};
use crate::types::{ErrorClass, Position, PositionStatus, RunState, TradeRecord, UpdownError};

// ---------------------------------------------------------------------------
// Phases and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingInterval,
    Deciding,
    Gating,
    Sizing,
    Executing,
    Settling,
    Committing,
    Halted,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AwaitingInterval => "awaiting_interval",
            Self::Deciding => "deciding",
            Self::Gating => "gating",
            Self::Sizing => "sizing",
            Self::Executing => "executing",
            Self::Settling => "settling",
            Self::Committing => "committing",
            Self::Halted => "halted",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// How a run ended, short of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Cycle quota or interval bound reached.
    Finished,
    Halted(String),
    /// Shutdown requested. The persisted state resumes cleanly.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: RunState,
}

/// Run-level knobs the orchestrator needs from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub run_length: u32,
    pub max_intervals: u32,
    pub skips_consume_cycle: bool,
    pub starting_capital: Decimal,
    pub increment: Decimal,
    pub max_price_age: chrono::Duration,
    pub reconcile_budget: Duration,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            run_length: config.agent.run_length,
            max_intervals: config.agent.max_intervals(),
            skips_consume_cycle: config.agent.skips_consume_cycle,
            starting_capital: config.agent.starting_capital,
            increment: config.sizing.increment,
            max_price_age: chrono::Duration::seconds(config.feed.max_price_age_secs as i64),
            reconcile_budget: Duration::from_secs(config.execution.reconcile_timeout_secs),
        }
    }
}

/// What one commit writes to the audit log besides the post-state.
#[derive(Default)]
struct CommitNote {
    decision: Option<DecisionRecord>,
    skip_reason: Option<String>,
    settlement: Option<TradeRecord>,
    traded: bool,
}

impl CommitNote {
    fn skip(decision: Option<DecisionRecord>, reason: impl Into<String>) -> Self {
        Self {
            decision,
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Where a submission that gave up actually left the order.
enum SubmitFallback {
    Placed(OrderHandle),
    NotPlaced,
    /// The venue could not be asked. The intent is kept as UNKNOWN.
    Unknown(String),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: RunSettings,
    pipeline: StrategyPipeline,
    executor: Executor,
    store: Arc<dyn StateStore>,
    audit: AuditLog,
    feed: watch::Receiver<FeedSnapshot>,
    clock: CycleClock,
    state: RunState,
    phase: Phase,
    prev_relation: Option<MaRelation>,
    status_tx: watch::Sender<RunState>,
}

impl Orchestrator {
    /// Load the persisted run, or start a fresh one.
    ///
    /// A persisted run created under a different skip policy is refused:
    /// its counters mean something else.
    pub fn start(
        settings: RunSettings,
        pipeline: StrategyPipeline,
        executor: Executor,
        store: Arc<dyn StateStore>,
        audit: AuditLog,
        feed: watch::Receiver<FeedSnapshot>,
        clock: CycleClock,
    ) -> Result<Self, UpdownError> {
        let state = match store.load() {
            Ok(Some(state)) => {
                if state.skips_consume_cycle != settings.skips_consume_cycle {
                    return Err(UpdownError::Config(format!(
                        "persisted run {} was started with skips_consume_cycle = {}",
                        state.run_id, state.skips_consume_cycle
                    )));
                }
                if state.starting_capital != settings.starting_capital {
                    warn!(
                        persisted = %state.starting_capital,
                        configured = %settings.starting_capital,
                        "Configured starting capital differs from the persisted run, keeping persisted"
                    );
                }
                info!(
                    run_id = %state.run_id,
                    cycles = state.cycles_completed,
                    intervals = state.intervals_elapsed,
                    equity = %state.current_equity,
                    streak = state.win_streak,
                    open_position = state.open_position.is_some(),
                    "Resuming run"
                );
                state
            }
            Ok(None) => {
                let state =
                    RunState::new(settings.starting_capital, settings.skips_consume_cycle);
                info!(run_id = %state.run_id, capital = %state.starting_capital, "Starting new run");
                state
            }
            Err(StoreError::Corrupt(msg)) => return Err(UpdownError::CorruptState(msg)),
            Err(StoreError::Io(e)) => return Err(UpdownError::Storage(e.to_string())),
        };

        let (status_tx, _) = watch::channel(state.clone());
        Ok(Self {
            settings,
            pipeline,
            executor,
            store,
            audit,
            feed,
            clock,
            state,
            phase: Phase::Idle,
            prev_relation: None,
            status_tx,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Live view of the committed state, for the status API.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.status_tx.subscribe()
    }

    /// Confirm the configured market is listed. Missing is fatal.
    pub async fn preflight(&self) -> Result<(), UpdownError> {
        match self.executor.connector().market_exists().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(UpdownError::MarketMissing(
                "configured market is not listed".into(),
            )),
            Err(ConnectorError::Auth(msg)) => Err(UpdownError::Auth(msg)),
            Err(e) => Err(UpdownError::MarketMissing(e.to_string())),
        }
    }

    /// Drive the run to completion, halt, or shutdown.
    ///
    /// A fatal error persists what has been committed and is returned to
    /// the caller. Only drawdown and an equity update that cannot be applied
    /// mark the run halted; other fatal errors leave it resumable once the
    /// cause is fixed.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<RunReport, UpdownError> {
        match self.drive(&mut shutdown).await {
            Ok(outcome) => Ok(RunReport {
                outcome,
                state: self.state,
            }),
            Err(e) => {
                error!(error = %e, phase = %self.phase, "Fatal error, stopping run");
                if let Err(save_err) = self.persist() {
                    error!(error = %save_err, "Could not persist state after fatal error");
                }
                let kind = if self.state.halted {
                    AuditKind::Halt
                } else {
                    AuditKind::Fatal
                };
                let mut record = AuditRecord::from_state(kind, &self.state, Utc::now());
                record.skip_reason = Some(e.to_string());
                self.audit.record(record);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, shutdown: &mut Shutdown) -> Result<RunOutcome, UpdownError> {
        self.persist()?;
        if self.state.open_position.is_some() {
            info!("Reconciling position left open by a previous process");
            self.reconcile_open(self.settings.reconcile_budget, shutdown)
                .await?;
        }

        while !self.is_terminal() {
            if shutdown.is_triggered() {
                return Ok(self.interrupted());
            }
            self.set_phase(Phase::AwaitingInterval);
            let Some(tick) = self.clock.wait(shutdown).await else {
                return Ok(self.interrupted());
            };
            self.run_cycle(tick, shutdown).await?;
        }

        if self.state.open_position.is_some() && !shutdown.is_triggered() {
            info!("Final reconciliation of unresolved position");
            self.reconcile_open(self.settings.reconcile_budget, shutdown)
                .await?;
        }
        self.persist()?;

        Ok(if self.state.halted {
            self.set_phase(Phase::Halted);
            let reason = self.state.halt_reason.clone().unwrap_or_default();
            error!(
                reason = %reason,
                cycles = self.state.cycles_completed,
                equity = %self.state.current_equity,
                "Run halted"
            );
            RunOutcome::Halted(reason)
        } else {
            self.set_phase(Phase::Finished);
            info!(
                cycles = self.state.cycles_completed,
                intervals = self.state.intervals_elapsed,
                wins = self.state.wins(),
                losses = self.state.losses(),
                equity = %self.state.current_equity,
                pnl = %self.state.total_pnl(),
                "Run finished"
            );
            RunOutcome::Finished
        })
    }

    fn interrupted(&mut self) -> RunOutcome {
        info!(
            cycles = self.state.cycles_completed,
            intervals = self.state.intervals_elapsed,
            "Shutdown requested, stopping at cycle boundary"
        );
        self.set_phase(Phase::Idle);
        RunOutcome::Interrupted
    }

    fn is_terminal(&self) -> bool {
        self.state
            .is_terminal(self.settings.run_length, self.settings.max_intervals)
    }

    fn set_phase(&mut self, next: Phase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "Phase transition");
            self.phase = next;
        }
    }

    // -----------------------------------------------------------------------
    // One cycle
    // -----------------------------------------------------------------------

    async fn run_cycle(&mut self, tick: Tick, shutdown: &mut Shutdown) -> Result<(), UpdownError> {
        let now = Utc::now();
        self.set_phase(Phase::Deciding);
        info!(
            cycle = self.state.cycles_completed + 1,
            interval = self.state.intervals_elapsed + 1,
            at = %tick.scheduled_at.format("%H:%M:%S"),
            "Cycle started"
        );

        // An UNKNOWN position gets one settlement query per cycle.
        if self.state.open_position.is_some() {
            self.reconcile_open(Duration::ZERO, shutdown).await?;
        }

        let snapshot = self.feed.borrow().clone();
        if snapshot.fresh_price(now, self.settings.max_price_age).is_none() {
            debug!(mode = ?snapshot.mode, "No fresh price");
            return self.abandon(None, UpdownError::FeedUnavailable);
        }
        let indicators = match snapshot.indicators {
            Ok(indicators) => indicators,
            Err(e) => {
                let err = UpdownError::InsufficientData {
                    have: e.have,
                    need: e.need,
                };
                return self.abandon(None, err);
            }
        };

        self.set_phase(Phase::Gating);
        let decision =
            self.pipeline
                .decide(&indicators, self.prev_relation, &self.state, &snapshot.prices);
        self.prev_relation = Some(indicators.ma_relation());

        if let Some(reason) = decision.halt_reason() {
            error!(reason = %reason, "Halting run");
            self.state.halt(reason.to_string());
            let note = CommitNote::skip(Some(decision.clone()), reason.to_string());
            return self.commit(note);
        }

        if let Some(err) = decision.rejection() {
            return self.abandon(Some(decision), err);
        }
        let (direction, size) = match &decision {
            DecisionRecord::Selected { signal, size } => match signal.direction {
                Some(direction) => (direction, *size),
                None => return self.commit(CommitNote::skip(Some(decision.clone()), "no direction")),
            },
            other => {
                let reason = other.to_string();
                warn!(reason = %reason, "Cycle skipped");
                return self.commit(CommitNote::skip(Some(decision.clone()), reason));
            }
        };

        self.set_phase(Phase::Sizing);
        debug!(direction = %direction, size = %size, "Position sized");

        // Persist the intent before the order can exist anywhere.
        self.set_phase(Phase::Executing);
        let (close_wall, close_instant) = tick.closes_at(self.clock.interval());
        let client_order_id = Uuid::new_v4().to_string();
        self.state.open_position = Some(Position {
            cycle: self.state.intervals_elapsed + 1,
            direction,
            size,
            entry_price: Decimal::ZERO,
            opened_at: now,
            expected_settlement_at: close_wall,
            client_order_id: client_order_id.clone(),
            external_order_id: None,
            status: PositionStatus::Open,
            outcome: None,
            pnl: None,
        });
        self.persist()?;

        let handle = match self
            .executor
            .submit(direction, size, &client_order_id, shutdown)
            .await
        {
            Ok(handle) => handle,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => match self.lookup_after_failed_submit(&client_order_id).await? {
                SubmitFallback::Placed(handle) => handle,
                SubmitFallback::NotPlaced => {
                    self.state.open_position = None;
                    return self.abandon(Some(decision), e);
                }
                SubmitFallback::Unknown(reason) => {
                    Accountant::mark_unknown(&mut self.state);
                    return self.commit(CommitNote {
                        decision: Some(decision),
                        skip_reason: Some(reason),
                        settlement: None,
                        traded: true,
                    });
                }
            },
        };
        self.adopt(&handle);
        self.persist()?;

        self.set_phase(Phase::Settling);
        let result = self
            .executor
            .await_settlement(&handle, close_instant, shutdown)
            .await?;

        self.set_phase(Phase::Committing);
        let (settlement, unresolved) = match result {
            SettlementResult::Resolved(outcome) => {
                let trade = Accountant::apply_settlement(
                    &mut self.state,
                    outcome,
                    self.settings.increment,
                    Utc::now(),
                )?;
                (trade, None)
            }
            SettlementResult::TimedOut => {
                let reason = UpdownError::SettlementTimeout.to_string();
                (None, Some(self.leave_unresolved(&handle, reason)))
            }
            SettlementResult::Interrupted => {
                let reason = "settlement wait interrupted by shutdown".to_string();
                (None, Some(self.leave_unresolved(&handle, reason)))
            }
        };

        self.commit(CommitNote {
            decision: Some(decision),
            skip_reason: unresolved,
            settlement,
            traded: true,
        })
    }

    /// Keep the position open as UNKNOWN for later reconciliation.
    fn leave_unresolved(&mut self, handle: &OrderHandle, reason: String) -> String {
        warn!(
            client_order_id = %handle.client_order_id,
            order_id = %handle.order_id,
            reason = %reason,
            "Settlement unknown, position stays open for reconciliation"
        );
        Accountant::mark_unknown(&mut self.state);
        reason
    }

    /// Close the interval without trading because of `err`. Its class
    /// decides the consequence.
    fn abandon(
        &mut self,
        decision: Option<DecisionRecord>,
        err: UpdownError,
    ) -> Result<(), UpdownError> {
        match err.class() {
            ErrorClass::Fatal => Err(err),
            ErrorClass::Skip => {
                warn!(error = %err, "Cycle skipped");
                self.commit(CommitNote::skip(decision, err.to_string()))
            }
            ErrorClass::Validation => {
                warn!(error = %err, "Cycle rejected before execution");
                self.commit(CommitNote::skip(decision, err.to_string()))
            }
        }
    }

    /// After submission gave up, ask the venue whether the order landed
    /// anyway.
    async fn lookup_after_failed_submit(
        &self,
        client_order_id: &str,
    ) -> Result<SubmitFallback, UpdownError> {
        match self.executor.connector().find_order(client_order_id).await {
            Ok(Some(handle)) => {
                info!(order_id = %handle.order_id, "Order reached the market despite submit failure");
                Ok(SubmitFallback::Placed(handle))
            }
            Ok(None) => Ok(SubmitFallback::NotPlaced),
            Err(ConnectorError::Auth(msg)) => Err(UpdownError::Auth(msg)),
            Err(e) => {
                warn!(error = %e, "Order lookup failed, keeping intent for reconciliation");
                Ok(SubmitFallback::Unknown(format!("submit outcome unknown: {e}")))
            }
        }
    }

    /// Copy the venue's view of the order onto the open position.
    fn adopt(&mut self, handle: &OrderHandle) {
        if let Some(pos) = self.state.open_position.as_mut() {
            pos.external_order_id = Some(handle.order_id.clone());
            pos.entry_price = handle.fill_price;
            pos.size = handle.size;
            pos.opened_at = handle.placed_at;
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Resolve a persisted OPEN or UNKNOWN position against the venue.
    ///
    /// If the position belongs to an interval the previous process never
    /// committed (it crashed mid-cycle), that interval is committed here.
    async fn reconcile_open(
        &mut self,
        budget: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<(), UpdownError> {
        let Some(position) = self.state.open_position.clone() else {
            return Ok(());
        };
        let uncommitted = position.cycle > self.state.intervals_elapsed;

        match self.executor.reconcile(&position, budget, shutdown).await? {
            Reconciliation::Resolved { handle, outcome } => {
                self.adopt(&handle);
                let settlement = Accountant::apply_settlement(
                    &mut self.state,
                    outcome,
                    self.settings.increment,
                    Utc::now(),
                )?;
                self.finish_reconcile(uncommitted, true, settlement)
            }
            Reconciliation::Pending(handle) => {
                if let Some(handle) = &handle {
                    self.adopt(handle);
                }
                Accountant::mark_unknown(&mut self.state);
                debug!(client_order_id = %position.client_order_id, "Position still unresolved");
                if uncommitted {
                    self.finish_reconcile(true, true, None)
                } else {
                    self.persist()
                }
            }
            Reconciliation::NeverPlaced => {
                info!(
                    client_order_id = %position.client_order_id,
                    "Intended order never reached the market, discarding"
                );
                self.state.open_position = None;
                self.finish_reconcile(uncommitted, false, None)
            }
        }
    }

    fn finish_reconcile(
        &mut self,
        uncommitted: bool,
        traded: bool,
        settlement: Option<TradeRecord>,
    ) -> Result<(), UpdownError> {
        let now = Utc::now();
        let kind = if uncommitted {
            Accountant::commit_cycle(&mut self.state, traded, now);
            AuditKind::Cycle
        } else {
            Accountant::record_equity(&mut self.state, now);
            AuditKind::Reconciliation
        };
        self.persist()?;

        let mut record = AuditRecord::from_state(kind, &self.state, now);
        record.traded = traded;
        Self::attach_settlement(&mut record, settlement);
        self.audit.record(record);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Close the interval: counters, equity point, persist, audit, publish.
    fn commit(&mut self, note: CommitNote) -> Result<(), UpdownError> {
        self.set_phase(Phase::Committing);
        let now = Utc::now();
        Accountant::commit_cycle(&mut self.state, note.traded, now);
        self.persist()?;

        let mut record = AuditRecord::from_state(AuditKind::Cycle, &self.state, now);
        record.decision = note.decision;
        record.skip_reason = note.skip_reason;
        record.traded = note.traded;
        Self::attach_settlement(&mut record, note.settlement);
        self.audit.record(record);

        info!(
            cycles = self.state.cycles_completed,
            intervals = self.state.intervals_elapsed,
            traded = note.traded,
            equity = %self.state.current_equity,
            streak = self.state.win_streak,
            drawdown = %self.state.drawdown().round_dp(4),
            "Cycle committed"
        );
        Ok(())
    }

    fn attach_settlement(record: &mut AuditRecord, settlement: Option<TradeRecord>) {
        if let Some(trade) = &settlement {
            record.client_order_id = Some(trade.client_order_id.clone());
            record.external_order_id = trade.external_order_id.clone();
        }
        record.settlement = settlement;
    }

    fn persist(&mut self) -> Result<(), UpdownError> {
        self.store
            .save(&self.state)
            .map_err(|e| UpdownError::Storage(e.to_string()))?;
        self.status_tx.send_replace(self.state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
