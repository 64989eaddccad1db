//! UPDOWN — fixed-run directional agent for five-minute up/down markets.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the price feed, connector, store and audit log together, and
//! runs the orchestrator until the run finishes, halts, or is stopped.
//!
//! Exit codes: 0 finished or stopped cleanly, 2 halted, 1 fatal error.

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use updown::config::{AppConfig, ConnectorKind};
use updown::dashboard::{self, AppState};
use updown::engine::clock::CycleClock;
use updown::engine::executor::Executor;
use updown::engine::orchestrator::{Orchestrator, RunOutcome, RunSettings};
use updown::feed::rest::build_fallbacks;
use updown::feed::stream::WsTradeStream;
use updown::feed::{FeedPublisher, PriceFeed, StreamSource};
use updown::platforms::gateway::GatewayConnector;
use updown::platforms::paper::PaperConnector;
use updown::platforms::MarketConnector;
use updown::shutdown::{self, ShutdownTrigger};
use updown::storage::audit::AuditLog;
use updown::storage::{JsonStateStore, StateStore};
use updown::strategy::risk::RiskGate;
use updown::strategy::signal::SignalGenerator;
use updown::strategy::sizing::CapitalAllocator;
use updown::strategy::StrategyPipeline;

const BANNER: &str = r#"
 _   _ ____  ____   _____        ___   _
| | | |  _ \|  _ \ / _ \ \      / / \ | |
| | | | |_) | | | | | | \ \ /\ / /|  \| |
| |_| |  __/| |_| | |_| |\ V  V / | |\  |
 \___/|_|   |____/ \___/  \_/\_/  |_| \_|

  Five-minute up/down directional agent
  v0.1.0
"#;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("UPDOWN_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {config_path}: {e:#}");
            return ExitCode::from(1);
        }
    };

    init_logging();
    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        run_length = cfg.agent.run_length,
        interval_secs = cfg.agent.interval_secs,
        starting_capital = %cfg.agent.starting_capital,
        dry_run = cfg.agent.dry_run,
        "UPDOWN starting up"
    );

    match run(cfg).await {
        Ok(RunOutcome::Finished) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => {
            info!("Stopped before the run completed, state saved for resume");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Halted(reason)) => {
            error!(reason = %reason, "Run ended halted");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "UPDOWN stopped on a fatal error");
            ExitCode::from(1)
        }
    }
}

/// Wire the components and drive one run.
async fn run(cfg: AppConfig) -> Result<RunOutcome> {
    let (trigger, shutdown) = shutdown::channel();
    spawn_signal_handler(trigger);

    // -- Price feed ------------------------------------------------------

    let (publisher, feed_rx) = FeedPublisher::new(&cfg.indicators, cfg.feed.anomaly_threshold);
    let stream: Option<Box<dyn StreamSource>> = if cfg.feed.stream_url.is_empty() {
        warn!("No stream URL configured, polling fallbacks only");
        None
    } else {
        Some(Box::new(WsTradeStream::new(&cfg.feed.stream_url)))
    };
    let fallbacks = build_fallbacks(&cfg.feed.fallbacks)?;
    let feed_task =
        PriceFeed::new(cfg.feed.clone(), stream, fallbacks, publisher).spawn(shutdown.clone());

    // -- Market connector ------------------------------------------------

    let connector: Arc<dyn MarketConnector> =
        if cfg.agent.dry_run || cfg.market.connector == ConnectorKind::Paper {
            Arc::new(PaperConnector::new(
                feed_rx.clone(),
                cfg.market.paper_fill_price,
                chrono::Duration::seconds(cfg.agent.interval_secs as i64),
                chrono::Duration::seconds(cfg.feed.max_price_age_secs as i64),
            ))
        } else {
            Arc::new(
                GatewayConnector::from_config(&cfg.market)
                    .context("Failed to build gateway connector")?,
            )
        };
    info!(connector = connector.name(), market = %cfg.market.market_slug, "Market connector ready");

    // -- Strategy, execution, persistence --------------------------------

    let pipeline = StrategyPipeline::new(
        SignalGenerator::new(&cfg.signal),
        RiskGate::new(cfg.risk.clone()),
        CapitalAllocator::new(cfg.sizing.clone()),
    );
    let executor = Executor::new(connector, cfg.execution.clone());
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(&cfg.storage.state_path));
    let (audit, audit_task) = AuditLog::spawn(&cfg.storage.audit_path);
    let clock = CycleClock::new(
        Duration::from_secs(cfg.agent.interval_secs),
        Duration::from_secs(cfg.agent.late_start_grace_secs),
        cfg.agent.align_to_wall_clock,
    );

    let orchestrator = Orchestrator::start(
        RunSettings::from_config(&cfg),
        pipeline,
        executor,
        store,
        audit,
        feed_rx,
        clock,
    )?;
    orchestrator.preflight().await?;

    if cfg.dashboard.enabled {
        let state = AppState::new(orchestrator.subscribe(), cfg.agent.run_length);
        dashboard::spawn_dashboard(state, cfg.dashboard.port).await?;
    }

    // -- Run -------------------------------------------------------------

    let result = orchestrator.run(shutdown).await;

    feed_task.abort();
    // The orchestrator held the last audit sender; wait for the writer to drain.
    if let Err(e) = audit_task.await {
        warn!(error = %e, "Audit writer did not finish cleanly");
    }

    let report = result?;
    info!(
        run_id = %report.state.run_id,
        cycles = report.state.cycles_completed,
        wins = report.state.wins(),
        losses = report.state.losses(),
        equity = %report.state.current_equity,
        pnl = %report.state.total_pnl(),
        "UPDOWN shut down"
    );
    Ok(report.outcome)
}

/// Trigger shutdown on Ctrl+C or SIGTERM.
fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing the current step");
        trigger.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("updown=info"));

    if std::env::var("UPDOWN_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
