// =============================================================================
// Kill Switch & Watchdog (C8)
// =============================================================================
//
// The kill switch's actual engagement procedure (cancel plan orders, close
// all positions, persist empty protections) lives on `StrategyRunner` since
// it needs the trading lock and the protections map; this module owns the
// two pieces that stand apart from that: the on-disk flag primitives shared
// with manual operator tooling, and the watchdog that alerts on a stale
// heartbeat.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alerter::Alerter;
use crate::state_store;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    ts: i64,
    status: String,
    reason: Option<String>,
}

/// Read the kill-switch flag file; missing or corrupt means disengaged.
pub fn is_engaged(path: &Path) -> bool {
    state_store::read_json(path, false)
}

/// Manually engage the kill switch from outside the runner process (e.g. an
/// operator CLI) by writing the flag file directly; the running process
/// picks it up on its next cycle poll.
pub fn engage_manually(path: &Path) -> anyhow::Result<()> {
    state_store::write_json(path, &true)
}

pub fn clear(path: &Path) -> anyhow::Result<()> {
    state_store::write_json(path, &false)
}

/// Polls the heartbeat file at a fixed interval; alerts at most once per
/// `alert_every` while the heartbeat stays stale, and resets silently on
/// recovery.
pub struct Watchdog {
    heartbeat_path: PathBuf,
    poll_interval: Duration,
    stale_threshold: Duration,
    alert_every: Duration,
    alerter: Arc<dyn Alerter>,
}

impl Watchdog {
    pub fn new(
        heartbeat_path: PathBuf,
        poll_interval: Duration,
        stale_threshold: Duration,
        alert_every: Duration,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self { heartbeat_path, poll_interval, stale_threshold, alert_every, alerter }
    }

    /// Runs until cancelled by the caller dropping the returned task handle.
    /// Kept as a plain loop (not spawned here) so the caller decides how to
    /// supervise it.
    pub async fn run(&self) {
        let mut last_alert: Option<std::time::Instant> = None;
        let mut currently_stale = false;

        loop {
            let heartbeat: Option<Heartbeat> = read_heartbeat(&self.heartbeat_path);
            let now = Utc::now().timestamp();

            let is_stale = match &heartbeat {
                Some(hb) => (now - hb.ts) as u64 > self.stale_threshold.as_secs(),
                None => true,
            };

            if is_stale {
                let should_alert = match last_alert {
                    None => true,
                    Some(t) => t.elapsed() >= self.alert_every,
                };
                if should_alert {
                    self.alerter
                        .send(&format!(
                            "watchdog: heartbeat stale (last status: {})",
                            heartbeat.map(|h| h.status).unwrap_or_else(|| "unknown".to_string())
                        ))
                        .await;
                    last_alert = Some(std::time::Instant::now());
                    warn!("watchdog: heartbeat stale, alert sent");
                }
                currently_stale = true;
            } else if currently_stale {
                info!("watchdog: heartbeat recovered");
                currently_stale = false;
                last_alert = None;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(label: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("execution-core-killswitch-test-{label}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn missing_flag_file_means_disengaged() {
        let path = tmp_path("missing");
        assert!(!is_engaged(&path));
    }

    #[test]
    fn engage_then_clear_round_trips() {
        let path = tmp_path("roundtrip");
        engage_manually(&path).unwrap();
        assert!(is_engaged(&path));
        clear(&path).unwrap();
        assert!(!is_engaged(&path));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_heartbeat_file_reads_as_none() {
        let path = tmp_path("hb_missing");
        assert!(read_heartbeat(&path).is_none());
    }
}
