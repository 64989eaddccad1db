//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` (or the file named by `UPDOWN_CONFIG`) and
//! deserializes into strongly-typed structs. Every section falls back to
//! the reference values, so a partial file is valid. Secrets (the gateway
//! API key) are referenced by env-var name and resolved at runtime.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub indicators: IndicatorConfig,
    pub signal: SignalConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
    pub market: MarketConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Number of cycles in one run.
    pub run_length: u32,
    pub interval_secs: u64,
    /// Start the first cycle on the next multiple of `interval_secs`.
    pub align_to_wall_clock: bool,
    /// A boundary missed by more than this is skipped rather than run late.
    pub late_start_grace_secs: u64,
    /// Whether a skipped interval consumes one of the `run_length` slots.
    pub skips_consume_cycle: bool,
    /// Hard ceiling on interval slots. Defaults to `run_length` when skips
    /// count and `3 * run_length` otherwise.
    pub max_intervals: Option<u32>,
    pub starting_capital: Decimal,
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "UPDOWN-001".to_string(),
            run_length: 18,
            interval_secs: 300,
            align_to_wall_clock: true,
            late_start_grace_secs: 60,
            skips_consume_cycle: true,
            max_intervals: None,
            starting_capital: dec!(100),
            dry_run: true,
        }
    }
}

impl AgentConfig {
    pub fn max_intervals(&self) -> u32 {
        match self.max_intervals {
            Some(n) => n.max(self.run_length),
            None if self.skips_consume_cycle => self.run_length,
            None => self.run_length.saturating_mul(3),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndicatorConfig {
    pub buffer_capacity: usize,
    pub rsi_period: usize,
    pub fast_period: usize,
    pub slow_period: usize,
    /// Minimum spacing between samples folded into the ring buffer.
    pub sample_interval_secs: u64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 60,
            rsi_period: 14,
            fast_period: 9,
            slow_period: 21,
            sample_interval_secs: 5,
        }
    }
}

/// What to do when no rule fires.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoSignalPolicy {
    Skip,
    DefaultDown,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub no_signal_policy: NoSignalPolicy,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            no_signal_policy: NoSignalPolicy::Skip,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SizingConfig {
    pub base_size: Decimal,
    pub multiplier: Decimal,
    pub max_exposure: Decimal,
    /// Smallest tradable increment.
    pub increment: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_size: dec!(5),
            multiplier: dec!(1.5),
            max_exposure: dec!(25),
            increment: dec!(0.01),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    /// Halt when drawdown from starting capital reaches this fraction.
    pub max_drawdown: Decimal,
    /// Number of most recent returns in the short volatility window.
    pub volatility_window: usize,
    /// Skip when short-window volatility exceeds this multiple of baseline.
    pub volatility_multiplier: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: dec!(0.30),
            volatility_window: 10,
            volatility_multiplier: 2.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Retries after the first submission attempt.
    pub submit_retries: u32,
    /// Delay before each retry; the last entry repeats if retries outnumber it.
    pub submit_backoff_secs: Vec<u64>,
    /// How long past the expected settlement time to keep polling.
    pub settlement_timeout_secs: u64,
    pub settlement_poll_secs: u64,
    /// Polling budget for startup / end-of-run reconciliation.
    pub reconcile_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            submit_retries: 3,
            submit_backoff_secs: vec![2, 4, 8],
            settlement_timeout_secs: 120,
            settlement_poll_secs: 10,
            reconcile_timeout_secs: 30,
        }
    }
}

/// A pull-based fallback price source.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FallbackSourceConfig {
    /// "binance" | "coinbase"
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    pub stream_url: String,
    pub max_stream_attempts: u32,
    pub stream_backoff_base_ms: u64,
    pub stream_backoff_max_ms: u64,
    /// Longest silence on an open stream before it is considered dead.
    pub stream_idle_timeout_secs: u64,
    /// Latest price older than this counts as no price at all.
    pub max_price_age_secs: u64,
    pub fallback_poll_secs: u64,
    pub stream_reprobe_secs: u64,
    /// Reject a sample whose relative change from the last accepted price
    /// exceeds this fraction.
    pub anomaly_threshold: f64,
    pub fallbacks: Vec<FallbackSourceConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stream_url: "wss://stream.binance.com:9443/ws/btcusdt@trade".to_string(),
            max_stream_attempts: 5,
            stream_backoff_base_ms: 1_000,
            stream_backoff_max_ms: 30_000,
            stream_idle_timeout_secs: 30,
            max_price_age_secs: 30,
            fallback_poll_secs: 5,
            stream_reprobe_secs: 120,
            anomaly_threshold: 0.10,
            fallbacks: vec![
                FallbackSourceConfig {
                    kind: "binance".to_string(),
                    url: "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT".to_string(),
                },
                FallbackSourceConfig {
                    kind: "coinbase".to_string(),
                    url: "https://api.coinbase.com/v2/prices/BTC-USD/spot".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Paper,
    Gateway,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    pub connector: ConnectorKind,
    pub base_url: String,
    pub market_slug: String,
    pub api_key_env: String,
    /// Share price the paper connector fills at.
    pub paper_fill_price: Decimal,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            connector: ConnectorKind::Paper,
            base_url: "http://127.0.0.1:8090".to_string(),
            market_slug: "btc-updown-5m".to_string(),
            api_key_env: "UPDOWN_GATEWAY_KEY".to_string(),
            paper_fill_price: dec!(0.50),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: String,
    pub audit_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: "updown_state.json".to_string(),
            audit_path: "updown_audit.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8088,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.agent;
        if a.run_length == 0 {
            bail!("agent.run_length must be at least 1");
        }
        if a.interval_secs == 0 {
            bail!("agent.interval_secs must be positive");
        }
        if a.starting_capital <= Decimal::ZERO {
            bail!("agent.starting_capital must be positive");
        }

        let i = &self.indicators;
        if i.rsi_period < 2 || i.fast_period == 0 {
            bail!("indicator periods too small");
        }
        if i.fast_period >= i.slow_period {
            bail!(
                "indicators.fast_period ({}) must be below slow_period ({})",
                i.fast_period,
                i.slow_period
            );
        }
        let warmup = (i.rsi_period + 1).max(i.slow_period);
        if i.buffer_capacity < warmup {
            bail!(
                "indicators.buffer_capacity ({}) must hold the warm-up of {warmup} samples",
                i.buffer_capacity
            );
        }

        let s = &self.signal;
        if !(0.0..=100.0).contains(&s.rsi_oversold)
            || !(0.0..=100.0).contains(&s.rsi_overbought)
            || s.rsi_oversold >= s.rsi_overbought
        {
            bail!("signal thresholds must satisfy 0 <= oversold < overbought <= 100");
        }

        let z = &self.sizing;
        if z.base_size <= Decimal::ZERO || z.max_exposure <= Decimal::ZERO {
            bail!("sizing.base_size and sizing.max_exposure must be positive");
        }
        if z.multiplier < Decimal::ONE {
            bail!("sizing.multiplier must be at least 1");
        }
        if z.increment < Decimal::ZERO {
            bail!("sizing.increment must not be negative");
        }

        let r = &self.risk;
        if r.max_drawdown <= Decimal::ZERO || r.max_drawdown > Decimal::ONE {
            bail!("risk.max_drawdown must be in (0, 1]");
        }
        if r.volatility_window < 2 || r.volatility_multiplier <= 0.0 {
            bail!("risk.volatility_window must be >= 2 and volatility_multiplier positive");
        }

        let e = &self.execution;
        if e.settlement_poll_secs == 0 {
            bail!("execution.settlement_poll_secs must be positive");
        }
        if e.submit_retries > 0 && e.submit_backoff_secs.is_empty() {
            bail!("execution.submit_backoff_secs must not be empty when retries are enabled");
        }

        let f = &self.feed;
        if f.anomaly_threshold <= 0.0 {
            bail!("feed.anomaly_threshold must be positive");
        }
        for fb in &f.fallbacks {
            if !matches!(fb.kind.as_str(), "binance" | "coinbase") {
                bail!("Unknown fallback price source kind: {}", fb.kind);
            }
        }

        let m = &self.market;
        if m.paper_fill_price <= Decimal::ZERO || m.paper_fill_price >= Decimal::ONE {
            bail!("market.paper_fill_price must be in (0, 1)");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
