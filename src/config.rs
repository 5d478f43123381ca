// =============================================================================
// Runner configuration — one immutable snapshot built once at startup from
// CLI flags (highest precedence) and environment variables (§6.1).
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::types::ExecutionMode;

/// CLI surface (§6): a single runner entry point.
#[derive(Debug, Parser)]
#[command(name = "execution-core", about = "Core execution engine runner")]
pub struct Cli {
    /// Path to the signal bus fallback file.
    #[arg(long, default_value = "signals.json")]
    pub signals: PathBuf,

    /// Comma-separated list of symbols to trade.
    #[arg(long, default_value = "")]
    pub assets: String,

    /// Override for the base risk-per-trade fraction.
    #[arg(long)]
    pub risk_level: Option<f64>,

    /// Run the strategy loop forever instead of a single cycle.
    #[arg(long)]
    pub r#loop: bool,

    /// Seconds to sleep between cycles when `--loop` is set.
    #[arg(long, default_value_t = 5)]
    pub sleep: u64,
}

/// The fully resolved, immutable configuration snapshot referenced
/// throughout §4 and §5. Built once; runtime overrides (only `risk_level`)
/// are folded in at construction time, never watched afterward.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub execution_mode: ExecutionMode,
    pub allow_live: bool,

    pub risk_per_trade: f64,
    pub max_risk_per_trade: f64,
    pub max_open_positions: u32,
    pub max_position_notional: f64,
    pub max_daily_drawdown: f64,
    pub pullback_mult: f64,

    pub strict_protections_live: bool,
    pub use_native_protections: bool,

    pub order_confirm_timeout_s: f64,
    pub pending_entry_max_age_s: i64,
    pub heartbeat_every_s: f64,
    pub runner_max_consecutive_errors: u32,

    pub trail: DynamicTrailConfig,

    pub state_dir: PathBuf,
    pub runner_state_file: PathBuf,
    pub protections_file: PathBuf,
    pub trade_db_file: PathBuf,
    pub heartbeat_file: PathBuf,
    pub kill_switch_file: PathBuf,

    pub asset_routing: HashMap<String, String>,
    pub default_broker: String,

    pub signals_path: PathBuf,
    pub assets: Vec<String>,
    pub sleep_interval: std::time::Duration,
}

/// Knobs for the dynamic trailing-stop controller (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct DynamicTrailConfig {
    pub breakeven_atr: f64,
    pub breakeven_buffer_atr: f64,
    pub trigger_dist_atr: f64,
    pub trail_offset_atr: f64,
    pub min_step_atr: f64,
    pub cooldown_s: i64,
    pub min_gap_pct: f64,
}

impl Default for DynamicTrailConfig {
    fn default() -> Self {
        Self {
            breakeven_atr: 1.0,
            breakeven_buffer_atr: 0.1,
            trigger_dist_atr: 3.0,
            trail_offset_atr: 1.0,
            min_step_atr: 0.1,
            cooldown_s: 15,
            min_gap_pct: 0.001,
        }
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a float, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be an integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be an integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{key} must be a bool, got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

fn parse_asset_routing(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (symbol, broker) = pair.split_once(':')?;
            let symbol = symbol.trim();
            let broker = broker.trim();
            if symbol.is_empty() || broker.is_empty() {
                None
            } else {
                Some((symbol.to_uppercase(), broker.to_lowercase()))
            }
        })
        .collect()
}

impl RunnerConfig {
    /// Build the snapshot from CLI flags plus environment variables.
    /// Malformed numeric/bool environment values are a fatal startup error.
    pub fn load(cli: &Cli) -> Result<Self> {
        let execution_mode: ExecutionMode = std::env::var("EXECUTION_MODE")
            .unwrap_or_else(|_| "paper".to_string())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("EXECUTION_MODE")?;

        let risk_per_trade = cli
            .risk_level
            .map(Ok)
            .unwrap_or_else(|| env_f64("RISK_PER_TRADE", 0.01))?;

        let assets: Vec<String> = if cli.assets.trim().is_empty() {
            std::env::var("ASSETS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            cli.assets
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let state_dir = env_path("STATE_DIR", "state");

        let trail = DynamicTrailConfig {
            breakeven_atr: env_f64("DYNAMIC_TRAIL_BREAKEVEN_ATR", DynamicTrailConfig::default().breakeven_atr)?,
            breakeven_buffer_atr: env_f64(
                "DYNAMIC_TRAIL_BREAKEVEN_BUFFER_ATR",
                DynamicTrailConfig::default().breakeven_buffer_atr,
            )?,
            trigger_dist_atr: env_f64("DYNAMIC_TRAIL_TRIGGER_DIST_ATR", DynamicTrailConfig::default().trigger_dist_atr)?,
            trail_offset_atr: env_f64("DYNAMIC_TRAIL_OFFSET_ATR", DynamicTrailConfig::default().trail_offset_atr)?,
            min_step_atr: env_f64("DYNAMIC_TRAIL_MIN_STEP_ATR", DynamicTrailConfig::default().min_step_atr)?,
            cooldown_s: env_i64("DYNAMIC_TRAIL_COOLDOWN_S", DynamicTrailConfig::default().cooldown_s)?,
            min_gap_pct: env_f64("DYNAMIC_TRAIL_MIN_GAP_PCT", DynamicTrailConfig::default().min_gap_pct)?,
        };

        Ok(Self {
            execution_mode,
            allow_live: env_bool("ALLOW_LIVE", false)?,

            risk_per_trade,
            max_risk_per_trade: env_f64("MAX_RISK_PER_TRADE", 0.02)?,
            max_open_positions: env_u32("MAX_OPEN_POSITIONS", 5)?,
            max_position_notional: env_f64("MAX_POSITION_NOTIONAL", 0.0)?,
            max_daily_drawdown: env_f64("MAX_DAILY_DRAWDOWN", 0.0)?,
            pullback_mult: env_f64("PULLBACK_MULT", 0.0)?,

            strict_protections_live: env_bool("STRICT_PROTECTIONS_LIVE", true)?,
            use_native_protections: env_bool("USE_NATIVE_PROTECTIONS", true)?,

            order_confirm_timeout_s: env_f64("ORDER_CONFIRM_TIMEOUT_S", 30.0)?,
            pending_entry_max_age_s: env_i64("PENDING_ENTRY_MAX_AGE_S", 120)?,
            heartbeat_every_s: env_f64("HEARTBEAT_EVERY_S", 5.0)?,
            runner_max_consecutive_errors: env_u32("RUNNER_MAX_CONSECUTIVE_ERRORS", 5)?,

            trail,

            runner_state_file: env_path(
                "RUNNER_STATE_FILE",
                state_dir.join("runner_state.json").to_str().unwrap_or("state/runner_state.json"),
            ),
            protections_file: env_path(
                "PROTECTIONS_FILE",
                state_dir.join("protections.json").to_str().unwrap_or("state/protections.json"),
            ),
            trade_db_file: env_path(
                "TRADE_DB_FILE",
                state_dir.join("trades.sqlite").to_str().unwrap_or("state/trades.sqlite"),
            ),
            heartbeat_file: env_path(
                "HEARTBEAT_FILE",
                state_dir.join("runner_heartbeat.json").to_str().unwrap_or("state/runner_heartbeat.json"),
            ),
            kill_switch_file: env_path(
                "KILL_SWITCH_FILE",
                state_dir.join("kill_switch.json").to_str().unwrap_or("state/kill_switch.json"),
            ),
            state_dir,

            asset_routing: parse_asset_routing(&std::env::var("ASSET_ROUTING").unwrap_or_default()),
            default_broker: std::env::var("DEFAULT_BROKER").unwrap_or_else(|_| "venue_a".to_string()),

            signals_path: cli.signals.clone(),
            assets,
            sleep_interval: std::time::Duration::from_secs(cli.sleep),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_asset_routing_csv() {
        let map = parse_asset_routing("BTCUSDT:venue_a, AAPL:venue_b");
        assert_eq!(map.get("BTCUSDT").map(String::as_str), Some("venue_a"));
        assert_eq!(map.get("AAPL").map(String::as_str), Some("venue_b"));
    }

    #[test]
    fn ignores_malformed_routing_entries() {
        let map = parse_asset_routing("not-a-pair,BTCUSDT:venue_a");
        assert_eq!(map.len(), 1);
    }
}
