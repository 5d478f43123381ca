// =============================================================================
// execution-core — Main Entry Point
// =============================================================================
//
// Boots the CLI surface, resolves configuration, wires the durable ledger,
// broker adapters, router, protection engine and strategy runner together,
// runs start-up reconciliation, then either a single cycle or the forever
// loop depending on `--loop`.
// =============================================================================

mod alerter;
mod broker;
mod config;
mod error;
mod killswitch;
mod ledger;
mod protection;
mod rate_limiter;
mod router;
mod runner;
mod state_store;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerter::{Alerter, LogAlerter, WebhookAlerter};
use crate::broker::simulator::{SimulatorBroker, SimulatorParams};
use crate::broker::venue_a::VenueAAdapter;
use crate::broker::venue_b::VenueBAdapter;
use crate::broker::BrokerPort;
use crate::config::{Cli, RunnerConfig};
use crate::ledger::Ledger;
use crate::protection::ProtectionEngine;
use crate::router::ExecutionRouter;
use crate::runner::StrategyRunner;
use crate::types::SignalRow;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("execution-core starting up");

    let cli = Cli::parse();
    let config = RunnerConfig::load(&cli)?;
    info!(mode = %config.execution_mode, assets = ?config.assets, "configuration loaded");

    let ledger = Arc::new(Ledger::open(&config.trade_db_file)?);
    let protections = Arc::new(ProtectionEngine::load(
        config.protections_file.clone(),
        config.trail,
        config.pending_entry_max_age_s,
    ));

    let brokers = build_brokers(&config)?;
    for (name, broker) in &brokers {
        if let Err(e) = broker.initialize().await {
            error!(broker = name, error = %e, "broker initialization failed");
            anyhow::bail!("failed to initialize broker {name}: {e}");
        }
    }

    let router = Arc::new(ExecutionRouter::new(
        brokers,
        config.asset_routing.clone(),
        config.default_broker.clone(),
        config.max_daily_drawdown,
        config.execution_mode,
        std::time::Duration::from_secs_f64(config.order_confirm_timeout_s),
    ));

    let alerter: Arc<dyn Alerter> = match std::env::var("ALERT_WEBHOOK_URL") {
        Ok(url) if !url.is_empty() => Arc::new(WebhookAlerter::new(url)),
        _ => Arc::new(LogAlerter),
    };

    let runner = Arc::new(StrategyRunner::new(config.clone(), router.clone(), ledger.clone(), protections.clone(), alerter.clone()));

    if cli.r#loop {
        let watchdog = killswitch::Watchdog::new(
            config.heartbeat_file.clone(),
            std::time::Duration::from_secs_f64(config.heartbeat_every_s),
            std::time::Duration::from_secs_f64(config.heartbeat_every_s * 3.0),
            std::time::Duration::from_secs(300),
            alerter,
        );
        tokio::spawn(async move { watchdog.run().await });
    }

    info!("running start-up reconciliation");
    runner.reconcile_at_startup().await?;

    if cli.r#loop {
        runner
            .run_forever(|| load_signals(&config.signals_path, &config.assets))
            .await?;
    } else {
        let signals = load_signals(&config.signals_path, &config.assets);
        runner.run_cycle(&signals).await?;
    }

    info!("execution-core exiting normally");
    Ok(())
}

/// Construct one adapter per recognized broker name. Unrecognized names in
/// `ASSET_ROUTING`/`DEFAULT_BROKER` are a configuration error surfaced at the
/// first order attempt, not here — the router tolerates partial broker maps.
fn build_brokers(config: &RunnerConfig) -> anyhow::Result<HashMap<String, Arc<dyn BrokerPort>>> {
    let mut brokers: HashMap<String, Arc<dyn BrokerPort>> = HashMap::new();

    let sim_state = config.state_dir.join("simulator_account.json");
    brokers.insert("simulator".to_string(), Arc::new(SimulatorBroker::new("simulator", sim_state, SimulatorParams::default())));

    if let (Ok(key), Ok(secret)) = (std::env::var("VENUE_A_API_KEY"), std::env::var("VENUE_A_API_SECRET")) {
        let base_url = std::env::var("VENUE_A_BASE_URL").unwrap_or_else(|_| "https://api.venue-a.example".to_string());
        brokers.insert("venue_a".to_string(), Arc::new(VenueAAdapter::new(key, secret, base_url)));
    } else {
        warn!("VENUE_A_API_KEY/VENUE_A_API_SECRET not set, venue_a adapter not registered");
    }

    if let Ok(token) = std::env::var("VENUE_B_TOKEN") {
        let base_url = std::env::var("VENUE_B_BASE_URL").unwrap_or_else(|_| "https://api.venue-b.example".to_string());
        brokers.insert("venue_b".to_string(), Arc::new(VenueBAdapter::new(token, base_url)));
    } else {
        warn!("VENUE_B_TOKEN not set, venue_b adapter not registered");
    }

    if !brokers.contains_key(&config.default_broker) {
        warn!(default_broker = %config.default_broker, "configured default broker is not registered; falling back to simulator");
    }

    Ok(brokers)
}

/// Signal freshness source (§3): in-memory bus with file fallback. No
/// in-process bus exists in this standalone binary, so every cycle reads the
/// file fallback directly — a symbol-keyed JSON map of `SignalRow`.
fn load_signals(path: &std::path::Path, assets: &[String]) -> HashMap<String, SignalRow> {
    let all: HashMap<String, SignalRow> = state_store::read_json(path, HashMap::new());
    if assets.is_empty() {
        return all;
    }
    all.into_iter().filter(|(symbol, _)| assets.contains(symbol)).collect()
}
