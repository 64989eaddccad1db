//! Full-run simulation harness.
//!
//! Drives the orchestrator through whole runs on paused time against the
//! scripted market, then checks the committed state, the persisted file
//! and the audit log against each other.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use updown::config::{ExecutionConfig, RiskConfig, SignalConfig, SizingConfig};
use updown::engine::clock::CycleClock;
use updown::engine::executor::Executor;
use updown::engine::orchestrator::{Orchestrator, RunOutcome, RunReport, RunSettings};
use updown::feed::{FeedMode, FeedSnapshot};
use updown::indicators::IndicatorSnapshot;
use updown::platforms::MarketConnector;
use updown::shutdown::{self, Shutdown};
use updown::storage::audit::{read_records, replay, AuditKind, AuditLog, AuditRecord};
use updown::storage::{JsonStateStore, StateStore};
use updown::strategy::risk::RiskGate;
use updown::strategy::signal::SignalGenerator;
use updown::strategy::sizing::CapitalAllocator;
use updown::strategy::StrategyPipeline;
use updown::types::{Direction, Outcome, Position, PositionStatus, PriceSample, RunState, UpdownError};

use crate::mock_market::ScriptedMarket;

const OVERSOLD: f64 = 20.0;
const NEUTRAL: f64 = 50.0;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A feed snapshot with a fresh price and fixed indicators. Equal averages
/// never cross, so the RSI alone decides the signal.
fn snapshot(rsi: f64) -> FeedSnapshot {
    let now = Utc::now();
    FeedSnapshot {
        latest: Some(PriceSample {
            timestamp: now,
            price: 50_000.0,
            source: "test".into(),
        }),
        indicators: Ok(IndicatorSnapshot {
            rsi,
            fast_ema: 50_000.0,
            slow_ema: 50_000.0,
            last_price: 50_000.0,
            samples: 60,
            as_of: now,
        }),
        prices: Arc::from(Vec::<f64>::new()),
        mode: FeedMode::Streaming,
        rejected: 0,
    }
}

struct Harness {
    market: Arc<ScriptedMarket>,
    settings: RunSettings,
    state_path: PathBuf,
    audit_path: PathBuf,
    feed_tx: watch::Sender<FeedSnapshot>,
}

impl Harness {
    fn new(market: ScriptedMarket, rsi: f64) -> Self {
        let id = uuid::Uuid::new_v4();
        let dir = std::env::temp_dir();
        let (feed_tx, _) = watch::channel(snapshot(rsi));
        Self {
            market: Arc::new(market),
            settings: RunSettings {
                run_length: 18,
                max_intervals: 18,
                skips_consume_cycle: true,
                starting_capital: dec!(100),
                increment: dec!(0.01),
                max_price_age: chrono::Duration::hours(1),
                reconcile_budget: Duration::from_secs(30),
            },
            state_path: dir.join(format!("updown_sim_{id}.json")),
            audit_path: dir.join(format!("updown_sim_{id}.jsonl")),
            feed_tx,
        }
    }

    /// Bound the run to `n` cycles and `n` intervals.
    fn run_length(mut self, n: u32) -> Self {
        self.settings.run_length = n;
        self.settings.max_intervals = n;
        self
    }

    fn store(&self) -> JsonStateStore {
        JsonStateStore::new(&self.state_path)
    }

    fn start(&self) -> Result<(Orchestrator, tokio::task::JoinHandle<()>), UpdownError> {
        let connector: Arc<dyn MarketConnector> = self.market.clone();
        let pipeline = StrategyPipeline::new(
            SignalGenerator::new(&SignalConfig::default()),
            RiskGate::new(RiskConfig::default()),
            CapitalAllocator::new(SizingConfig::default()),
        );
        let executor = Executor::new(connector, ExecutionConfig::default());
        let (audit, audit_task) = AuditLog::spawn(&self.audit_path);
        let clock = CycleClock::new(Duration::from_secs(300), Duration::from_secs(60), false);
        let orchestrator = Orchestrator::start(
            self.settings.clone(),
            pipeline,
            executor,
            Arc::new(self.store()),
            audit,
            self.feed_tx.subscribe(),
            clock,
        )?;
        Ok((orchestrator, audit_task))
    }

    async fn run_with(&self, shutdown: Shutdown) -> Result<RunReport, UpdownError> {
        let (orchestrator, audit_task) = self.start()?;
        let result = orchestrator.run(shutdown).await;
        audit_task.await.unwrap();
        result
    }

    async fn run(&self) -> Result<RunReport, UpdownError> {
        self.run_with(Shutdown::never()).await
    }

    fn persisted(&self) -> RunState {
        self.store().load().unwrap().unwrap()
    }

    fn records(&self) -> Vec<AuditRecord> {
        read_records(&self.audit_path).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.state_path);
        let _ = std::fs::remove_file(&self.audit_path);
    }
}

// ---------------------------------------------------------------------------
// Full runs
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_winning_run_compounds_to_cap() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    let report = h.run().await.unwrap();
    let state = &report.state;

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(state.cycles_completed, 18);
    assert_eq!(state.intervals_elapsed, 18);
    assert_eq!(state.trades.len(), 18);
    assert_eq!(state.win_streak, 18);
    // 5 + 7.5 + 11.25 + 16.87, then fourteen trades at the 25 cap.
    assert_eq!(state.current_equity, dec!(490.62));
    assert!(state.trades.iter().all(|t| t.size <= dec!(25)));
    assert!(state.open_position.is_none());
    assert_eq!(state.equity_curve.len(), 18);
    assert_eq!(h.market.order_count(), 18);

    assert_eq!(&h.persisted(), state);
}

#[tokio::test(start_paused = true)]
async fn test_status_channel_tracks_commits() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    let (orchestrator, audit_task) = h.start().unwrap();
    let status = orchestrator.subscribe();
    assert_eq!(status.borrow().cycles_completed, 0);

    let report = orchestrator.run(Shutdown::never()).await.unwrap();
    audit_task.await.unwrap();
    assert_eq!(*status.borrow(), report.state);
}

#[tokio::test(start_paused = true)]
async fn test_drawdown_halts_run() {
    let h = Harness::new(ScriptedMarket::with_outcomes(vec![Outcome::Loss; 18]), OVERSOLD);
    let report = h.run().await.unwrap();
    let state = &report.state;

    assert!(matches!(report.outcome, RunOutcome::Halted(_)));
    assert!(state.halted);
    assert!(state.halt_reason.as_deref().unwrap().contains("drawdown"));
    // Six losses at base size reach exactly 30% drawdown; the seventh
    // cycle's gate halts before trading.
    assert_eq!(state.trades.len(), 6);
    assert_eq!(state.current_equity, dec!(70));
    assert_eq!(state.win_streak, 0);
    assert_eq!(state.cycles_completed, 7);
    assert_eq!(h.market.order_count(), 6);

    let records = h.records();
    let last = records.last().unwrap();
    assert_eq!(last.kind, AuditKind::Cycle);
    assert!(last.halted);
    assert!(!last.traded);
}

#[tokio::test(start_paused = true)]
async fn test_halted_run_stays_halted_after_restart() {
    let h = Harness::new(ScriptedMarket::with_outcomes(vec![Outcome::Loss; 18]), OVERSOLD);
    h.run().await.unwrap();

    let report = h.run().await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Halted(_)));
    assert_eq!(report.state.cycles_completed, 7);
    assert_eq!(h.market.order_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_audit_replay_matches_live_state() {
    let outcomes = [
        Outcome::Win,
        Outcome::Win,
        Outcome::Loss,
        Outcome::Win,
        Outcome::Loss,
        Outcome::Loss,
    ];
    let h = Harness::new(ScriptedMarket::with_outcomes(outcomes), OVERSOLD);
    let report = h.run().await.unwrap();

    let records = h.records();
    assert_eq!(records.len(), 18);
    assert!(records.iter().all(|r| r.run_id == report.state.run_id));

    let replayed = replay(dec!(100), true, &records).unwrap();
    assert_eq!(replayed.current_equity, report.state.current_equity);
    assert_eq!(replayed.win_streak, report.state.win_streak);
    assert_eq!(replayed.cycles_completed, report.state.cycles_completed);
    assert_eq!(replayed.trades, report.state.trades);
}

#[tokio::test(start_paused = true)]
async fn test_streak_resets_after_loss() {
    let h = Harness::new(
        ScriptedMarket::with_outcomes([Outcome::Win, Outcome::Win, Outcome::Loss, Outcome::Win]),
        OVERSOLD,
    );
    let h = h.run_length(4);
    let report = h.run().await.unwrap();
    let sizes: Vec<Decimal> = report.state.trades.iter().map(|t| t.size).collect();
    assert_eq!(sizes, vec![dec!(5), dec!(7.5), dec!(11.25), dec!(5)]);
    assert_eq!(report.state.win_streak, 1);
    // 100 + 5 + 7.5 - 11.25 + 5
    assert_eq!(report.state.current_equity, dec!(106.25));
}

// ---------------------------------------------------------------------------
// Skips
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_skips_consume_cycles_by_default() {
    let h = Harness::new(ScriptedMarket::new(), NEUTRAL);
    let h = h.run_length(3);
    let report = h.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.state.cycles_completed, 3);
    assert_eq!(report.state.intervals_elapsed, 3);
    assert_eq!(h.market.submit_calls(), 0);
    assert!(h.records().iter().all(|r| !r.traded && r.skip_reason.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_skips_bounded_by_max_intervals_when_not_counted() {
    let mut h = Harness::new(ScriptedMarket::new(), NEUTRAL);
    h.settings.run_length = 2;
    h.settings.max_intervals = 6;
    h.settings.skips_consume_cycle = false;
    let report = h.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.state.cycles_completed, 0);
    assert_eq!(report.state.intervals_elapsed, 6);
    assert_eq!(report.state.equity_curve.len(), 6);
    assert!(!report.state.skips_consume_cycle);
}

#[tokio::test(start_paused = true)]
async fn test_skip_policy_mismatch_is_refused() {
    let mut h = Harness::new(ScriptedMarket::new(), NEUTRAL).run_length(1);
    h.run().await.unwrap();

    h.settings.skips_consume_cycle = false;
    assert!(matches!(h.start(), Err(UpdownError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_feed_outage_skips_cycle() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.feed_tx.send_replace(FeedSnapshot::empty(21));
    let h = h.run_length(2);
    let report = h.run().await.unwrap();

    assert_eq!(report.state.cycles_completed, 2);
    assert_eq!(h.market.submit_calls(), 0);
    let reason = h.records()[0].skip_reason.clone().unwrap();
    assert!(reason.contains("feed unavailable"), "{reason}");
}

// ---------------------------------------------------------------------------
// Submission failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_lost_ack_does_not_duplicate_order() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.market.lose_next_acks(1);
    let h = h.run_length(1);
    let report = h.run().await.unwrap();

    assert_eq!(h.market.submit_calls(), 2);
    assert_eq!(h.market.order_count(), 1);
    assert_eq!(report.state.trades.len(), 1);
    assert_eq!(report.state.current_equity, dec!(105));
}

#[tokio::test(start_paused = true)]
async fn test_submit_outage_skips_cycle() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.market.fail_next_submits(4);
    let h = h.run_length(1);
    let report = h.run().await.unwrap();

    // One attempt plus three retries, none reached the book.
    assert_eq!(h.market.submit_calls(), 4);
    assert_eq!(h.market.order_count(), 0);
    assert!(report.state.trades.is_empty());
    assert!(report.state.open_position.is_none());
    assert_eq!(report.state.cycles_completed, 1);
    assert_eq!(report.state.current_equity, dec!(100));

    let record = &h.records()[0];
    assert!(!record.traded);
    assert!(record.skip_reason.as_deref().unwrap().contains("gave up"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_fatal_but_resumable() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.market.fail_auth(true);
    let h = h.run_length(2);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, UpdownError::Auth(_)));
    let persisted = h.persisted();
    assert!(!persisted.halted);
    assert_eq!(persisted.intervals_elapsed, 0);
    let stop = h.records().pop().unwrap();
    assert_eq!(stop.kind, AuditKind::Fatal);
    assert!(!stop.halted);
    assert!(stop.skip_reason.as_deref().unwrap().contains("Authentication"));
    // The intent was persisted before the failed submission.
    let intent = persisted.open_position.unwrap();
    assert!(intent.external_order_id.is_none());

    // Credentials fixed: the intent never reached the book, so its
    // interval closes as a skip and the run carries on.
    h.market.fail_auth(false);
    let report = h.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.state.cycles_completed, 2);
    assert_eq!(report.state.trades.len(), 1);
    assert_eq!(h.market.order_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_market_fails_preflight() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.market.delist();
    let (orchestrator, _audit) = h.start().unwrap();
    assert!(matches!(
        orchestrator.preflight().await,
        Err(UpdownError::MarketMissing(_))
    ));
}

// ---------------------------------------------------------------------------
// Unknown settlements and recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_unknown_settlement_changes_nothing_until_resolved() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    h.market.hold_settlements(true);
    let h = h.run_length(2);

    let report = h.run().await.unwrap();
    let state = &report.state;
    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(state.cycles_completed, 2);
    assert_eq!(state.current_equity, dec!(100));
    assert_eq!(state.win_streak, 0);
    assert!(state.trades.is_empty());
    let pos = state.open_position.as_ref().unwrap();
    assert_eq!(pos.status, PositionStatus::Unknown);
    assert!(pos.external_order_id.is_some());
    // The second cycle saw the open position and did not trade.
    assert_eq!(h.market.order_count(), 1);
    assert!(h.market.polls() > 2);

    let records = h.records();
    assert_eq!(records[0].position_status, Some(PositionStatus::Unknown));
    assert!(records[0].traded);
    assert!(records[0].skip_reason.as_deref().unwrap().contains("timeout"));
    assert!(!records[1].traded);

    // Next process: the venue has settled it.
    h.market.hold_settlements(false);
    let report = h.run().await.unwrap();
    assert_eq!(report.state.trades.len(), 1);
    assert_eq!(report.state.current_equity, dec!(105));
    assert!(report.state.open_position.is_none());
    assert_eq!(report.state.cycles_completed, 2);

    let replayed = replay(dec!(100), true, &h.records()).unwrap();
    assert_eq!(replayed.current_equity, dec!(105));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_settling_leaves_position_unknown() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD).run_length(2);
    let (trigger, shutdown) = shutdown::channel();

    // The first order is placed at t=0 and settles at the 300s close.
    let (result, _) = tokio::join!(h.run_with(shutdown), async {
        tokio::time::sleep(Duration::from_secs(100)).await;
        trigger.trigger();
    });
    let report = result.unwrap();
    let state = &report.state;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(state.intervals_elapsed, 1);
    assert_eq!(state.current_equity, dec!(100));
    assert_eq!(state.win_streak, 0);
    assert!(state.trades.is_empty());
    let pos = state.open_position.as_ref().unwrap();
    assert_eq!(pos.status, PositionStatus::Unknown);
    assert!(pos.external_order_id.is_some());
    assert_eq!(&h.persisted(), state);

    let record = &h.records()[0];
    assert!(record.traded);
    assert_eq!(record.position_status, Some(PositionStatus::Unknown));
    assert!(record.skip_reason.as_deref().unwrap().contains("shutdown"));

    // Next process: the held order resolves first, then the run carries on.
    let report = h.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.state.trades.len(), 2);
    assert_eq!(report.state.trades[0].client_order_id, pos.client_order_id);
    // 100 + 5 + 7.5
    assert_eq!(report.state.current_equity, dec!(112.5));
    assert_eq!(h.market.order_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drawdown_behind_unknown_position_halts_once_resolved() {
    let h = Harness::new(ScriptedMarket::with_outcomes(vec![Outcome::Loss; 6]), OVERSOLD);

    // Five losses settle at their closes. The sixth order (placed at 1500s)
    // is held past its settlement timeout at 1920s, then released before
    // the next boundary at 2100s.
    let (result, _) = tokio::join!(h.run(), async {
        tokio::time::sleep(Duration::from_secs(1600)).await;
        h.market.hold_settlements(true);
        tokio::time::sleep(Duration::from_secs(400)).await;
        h.market.hold_settlements(false);
    });
    let report = result.unwrap();
    let state = &report.state;

    assert!(matches!(report.outcome, RunOutcome::Halted(_)));
    assert!(state.halted);
    assert!(state.halt_reason.as_deref().unwrap().contains("drawdown"));
    assert_eq!(state.trades.len(), 6);
    assert_eq!(state.current_equity, dec!(70));
    assert!(state.open_position.is_none());
    assert_eq!(h.market.order_count(), 6);
    // The 1800s boundary was missed while settling and is not counted.
    assert_eq!(state.intervals_elapsed, 7);
    assert_eq!(state.cycles_completed, 7);

    let records = h.records();
    let unresolved = records.iter().find(|r| r.cycle == 6 && r.kind == AuditKind::Cycle).unwrap();
    assert_eq!(unresolved.position_status, Some(PositionStatus::Unknown));
    assert_eq!(unresolved.equity_after, dec!(75));
    assert!(!unresolved.halted);
    assert!(records.iter().any(|r| r.kind == AuditKind::Reconciliation));
    let last = records.last().unwrap();
    assert!(last.halted);
    assert!(!last.traded);

    let replayed = replay(dec!(100), true, &records).unwrap();
    assert_eq!(replayed.current_equity, dec!(70));
    assert!(replayed.halted);
}

#[tokio::test(start_paused = true)]
async fn test_crash_mid_cycle_recovers_exactly_once() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    let h = h.run_length(3);
    let first = h.run().await.unwrap();
    assert_eq!(first.state.current_equity, dec!(123.75));

    // The fourth cycle's order reached the venue, then the process died
    // before committing.
    let handle = h.market.place("crash-4", Direction::Up, dec!(16.87));
    let mut state = h.persisted();
    state.open_position = Some(Position {
        cycle: 4,
        direction: Direction::Up,
        size: dec!(16.87),
        entry_price: handle.fill_price,
        opened_at: handle.placed_at,
        expected_settlement_at: handle.placed_at,
        client_order_id: "crash-4".into(),
        external_order_id: Some(handle.order_id.clone()),
        status: PositionStatus::Open,
        outcome: None,
        pnl: None,
    });
    h.store().save(&state).unwrap();

    let mut h = h;
    h.settings.run_length = 5;
    h.settings.max_intervals = 5;
    let report = h.run().await.unwrap();
    let state = &report.state;

    assert_eq!(state.cycles_completed, 5);
    assert_eq!(state.intervals_elapsed, 5);
    assert_eq!(state.trades.len(), 5);
    assert_eq!(
        state.trades.iter().filter(|t| t.client_order_id == "crash-4").count(),
        1
    );
    // 123.75 + 16.87 + 25
    assert_eq!(state.current_equity, dec!(165.62));
    assert_eq!(state.win_streak, 5);

    // A further restart changes nothing.
    let again = h.run().await.unwrap();
    assert_eq!(&again.state, state);
    assert_eq!(h.market.order_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_unplaced_intent_is_discarded_on_restart() {
    let h = Harness::new(ScriptedMarket::new(), NEUTRAL);
    let mut state = RunState::new(dec!(100), true);
    state.open_position = Some(Position {
        cycle: 1,
        direction: Direction::Down,
        size: dec!(5),
        entry_price: Decimal::ZERO,
        opened_at: Utc::now(),
        expected_settlement_at: Utc::now(),
        client_order_id: "ghost".into(),
        external_order_id: None,
        status: PositionStatus::Open,
        outcome: None,
        pnl: None,
    });
    h.store().save(&state).unwrap();
    let h = h.run_length(2);

    let report = h.run().await.unwrap();
    assert!(report.state.open_position.is_none());
    assert!(report.state.trades.is_empty());
    assert_eq!(report.state.current_equity, dec!(100));
    // The interrupted interval closes as a skip, then one more runs.
    assert_eq!(report.state.intervals_elapsed, 2);
    assert_eq!(h.records()[0].kind, AuditKind::Cycle);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_first_tick() {
    let h = Harness::new(ScriptedMarket::new(), OVERSOLD);
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let report = h.run_with(shutdown).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.state.intervals_elapsed, 0);
    assert_eq!(h.persisted(), report.state);
}
