// =============================================================================
// Protection Engine (C6) — synthetic/native SL-TP arming, trigger detection,
// pending-entry resolution, and the adaptive trailing-stop controller.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::broker::BrokerPort;
use crate::config::DynamicTrailConfig;
use crate::error::{BrokerError, RunnerError};
use crate::ledger::Ledger;
use crate::state_store;
use crate::types::{
    make_client_id, NativeLeg, NativeProtection, OrderRole, OrderStatus, PendingEntry, PositionSide, Protection,
    ProtectionMode, SignalRow,
};

/// Everything `update_trailing`'s pure candidate computation needs to carry
/// out of the lock before doing broker/ledger I/O for the native path.
struct TrailCandidate {
    mode: ProtectionMode,
    candidate: f64,
    old_sl_order_id: Option<String>,
    broker: String,
    trade_id: String,
    qty: f64,
    side: PositionSide,
}

/// Arming/trailing inputs computed once at entry confirmation.
pub struct ArmParams {
    pub broker: String,
    pub trade_id: String,
    pub signal_id: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub atr: f64,
    pub sl_mult: f64,
    pub tp_mult: f64,
    pub use_native: bool,
}

/// Computes `(sl, tp)` for the given side; the prior implementation this core
/// is modeled on applied the long formula unconditionally for both sides —
/// corrected here per §9.
pub fn compute_sl_tp(side: PositionSide, entry_price: f64, atr: f64, sl_mult: f64, tp_mult: f64) -> (f64, f64) {
    match side {
        PositionSide::Long => (entry_price - atr * sl_mult, entry_price + atr * tp_mult),
        PositionSide::Short => (entry_price + atr * sl_mult, entry_price - atr * tp_mult),
    }
}

fn clip01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

pub struct ProtectionEngine {
    protections: Mutex<HashMap<String, Protection>>,
    state_path: PathBuf,
    trail: DynamicTrailConfig,
    pending_entry_max_age_s: i64,
}

impl ProtectionEngine {
    pub fn load(state_path: PathBuf, trail: DynamicTrailConfig, pending_entry_max_age_s: i64) -> Self {
        let protections: HashMap<String, Protection> = state_store::read_json(&state_path, HashMap::new());
        Self { protections: Mutex::new(protections), state_path, trail, pending_entry_max_age_s }
    }

    fn persist(&self) -> Result<(), RunnerError> {
        let snapshot = self.protections.lock();
        state_store::write_json(&self.state_path, &*snapshot).map_err(RunnerError::Store)
    }

    pub fn get(&self, symbol: &str) -> Option<Protection> {
        self.protections.lock().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.protections.lock().keys().cloned().collect()
    }

    fn insert(&self, symbol: &str, protection: Protection) -> Result<(), RunnerError> {
        self.protections.lock().insert(symbol.to_string(), protection);
        self.persist()
    }

    pub fn drop_protection(&self, symbol: &str) -> Result<(), RunnerError> {
        self.protections.lock().remove(symbol);
        self.persist()
    }

    /// Record a `pending_entry` protection while the entry order's outcome is
    /// still unknown (§4.6 Pending-entry mode).
    pub fn arm_pending(&self, symbol: &str, params: &ArmParams, entry_client_id: String, qty_expected: f64) -> Result<(), RunnerError> {
        let protection = Protection {
            mode: ProtectionMode::PendingEntry,
            broker: params.broker.clone(),
            trade_id: params.trade_id.clone(),
            signal_id: params.signal_id.clone(),
            side: params.side,
            qty: params.qty,
            sl: None,
            tp: None,
            atr: params.atr,
            sl_mult: params.sl_mult,
            tp_mult: params.tp_mult,
            sl_client_id: None,
            tp_client_id: None,
            native: None,
            entry_price: None,
            watermark: None,
            trail_last_ts: None,
            trail_count: 0,
            use_native: params.use_native,
            last_price: params.entry_price,
            created_at: Utc::now().to_rfc3339(),
            pending: Some(PendingEntry {
                entry_client_id,
                order_id: None,
                qty_expected,
                created_at: Utc::now().to_rfc3339(),
            }),
        };
        self.insert(symbol, protection)
    }

    /// Arm protections on entry confirmation (§4.6 Arming flow). Falls back
    /// to synthetic on any native placement failure unless `strict_live` is
    /// set and the adapter supports native protections, in which case the
    /// caller must panic-close instead.
    pub async fn arm_after_entry(
        &self,
        symbol: &str,
        broker_port: &dyn BrokerPort,
        params: ArmParams,
        strict_live: bool,
    ) -> Result<(), RunnerError> {
        let (sl, tp) = compute_sl_tp(params.side, params.entry_price, params.atr, params.sl_mult, params.tp_mult);
        let caps = broker_port.capabilities();

        if params.use_native && caps.supports_native_protections {
            let sl_client_id = make_client_id(&params.broker, symbol, OrderRole::Sl, &params.signal_id);
            let tp_client_id = make_client_id(&params.broker, symbol, OrderRole::Tp, &params.signal_id);

            match broker_port
                .place_protection_orders(symbol, params.qty, Some(sl), Some(tp), Some(&sl_client_id), Some(&tp_client_id))
                .await
            {
                Ok(orders) if orders.sl_order_id.is_some() && orders.tp_order_id.is_some() => {
                    let protection = Protection {
                        mode: ProtectionMode::Native,
                        broker: params.broker.clone(),
                        trade_id: params.trade_id.clone(),
                        signal_id: params.signal_id.clone(),
                        side: params.side,
                        qty: params.qty,
                        sl: Some(sl),
                        tp: Some(tp),
                        atr: params.atr,
                        sl_mult: params.sl_mult,
                        tp_mult: params.tp_mult,
                        sl_client_id: Some(sl_client_id),
                        tp_client_id: Some(tp_client_id),
                        native: Some(NativeProtection {
                            sl: Some(NativeLeg { order_id: orders.sl_order_id }),
                            tp: Some(NativeLeg { order_id: orders.tp_order_id }),
                        }),
                        entry_price: Some(params.entry_price),
                        watermark: Some(params.entry_price),
                        trail_last_ts: None,
                        trail_count: 0,
                        use_native: true,
                        last_price: params.entry_price,
                        created_at: Utc::now().to_rfc3339(),
                        pending: None,
                    };
                    return self.insert(symbol, protection);
                }
                Ok(_) => {
                    warn!(symbol, "native protection placement returned empty order id");
                }
                Err(e) => {
                    warn!(symbol, error = %e, "native protection placement failed");
                }
            }

            if strict_live {
                return Err(RunnerError::Broker(BrokerError::VenueLogical(format!(
                    "native protections required but failed to arm for {symbol}"
                ))));
            }
        }

        let protection = Protection {
            mode: ProtectionMode::Synthetic,
            broker: params.broker.clone(),
            trade_id: params.trade_id.clone(),
            signal_id: params.signal_id.clone(),
            side: params.side,
            qty: params.qty,
            sl: Some(sl),
            tp: Some(tp),
            atr: params.atr,
            sl_mult: params.sl_mult,
            tp_mult: params.tp_mult,
            sl_client_id: None,
            tp_client_id: None,
            native: None,
            entry_price: Some(params.entry_price),
            watermark: Some(params.entry_price),
            trail_last_ts: None,
            trail_count: 0,
            use_native: false,
            last_price: params.entry_price,
            created_at: Utc::now().to_rfc3339(),
            pending: None,
        };
        self.insert(symbol, protection)
    }

    /// Resolve a `pending_entry` protection (§4.6). Returns `true` if the
    /// entry's fate was resolved (armed, or trade aborted) this call.
    pub async fn resolve_pending_entry(
        &self,
        symbol: &str,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
        strict_live: bool,
    ) -> Result<bool, RunnerError> {
        let Some(protection) = self.get(symbol) else { return Ok(false) };
        let Some(pending) = protection.pending.clone() else { return Ok(false) };

        let positions = broker_port.list_open_positions().await?;
        if let Some(position) = positions.iter().find(|p| p.symbol == symbol) {
            let entry_price = position.avg_price;
            ledger.set_trade_entry(&protection.trade_id, entry_price, position.quantity)?;
            let params = ArmParams {
                broker: protection.broker.clone(),
                trade_id: protection.trade_id.clone(),
                signal_id: protection.signal_id.clone(),
                side: protection.side,
                qty: position.quantity,
                entry_price,
                atr: protection.atr,
                sl_mult: protection.sl_mult,
                tp_mult: protection.tp_mult,
                use_native: protection.use_native,
            };
            self.arm_after_entry(symbol, broker_port, params, strict_live).await?;
            info!(symbol, "pending entry resolved: position confirmed");
            return Ok(true);
        }

        let created = chrono::DateTime::parse_from_rfc3339(&pending.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let age_s = (Utc::now() - created).num_seconds();
        if age_s < self.pending_entry_max_age_s {
            return Ok(false);
        }

        let result = broker_port
            .wait_for_order_final(pending.order_id.as_deref(), Some(&pending.entry_client_id), symbol, std::time::Duration::from_secs(5))
            .await?;

        ledger.mark_order_final(&pending.entry_client_id, result.status, serde_json::json!({"resolved_by": "pending_entry_ttl"}))?;
        ledger.abort_trade(&protection.trade_id, &format!("pending_entry_timeout:{}", result.status))?;
        self.drop_protection(symbol)?;
        warn!(symbol, status = %result.status, "pending entry TTL expired; trade aborted");
        Ok(true)
    }

    /// Synthetic/native trigger check (§4.6). Returns the exit reason if the
    /// trade was closed this call.
    pub async fn check_and_trigger(
        &self,
        symbol: &str,
        current_price: f64,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
    ) -> Result<Option<String>, RunnerError> {
        let Some(protection) = self.get(symbol) else { return Ok(None) };

        match protection.mode {
            ProtectionMode::Native => self.check_native_trigger(symbol, &protection, ledger, broker_port).await,
            ProtectionMode::Synthetic => self.check_synthetic_trigger(symbol, current_price, &protection, ledger, broker_port).await,
            ProtectionMode::PendingEntry => Ok(None),
        }
    }

    async fn check_synthetic_trigger(
        &self,
        symbol: &str,
        current_price: f64,
        protection: &Protection,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
    ) -> Result<Option<String>, RunnerError> {
        let (Some(sl), Some(tp)) = (protection.sl, protection.tp) else { return Ok(None) };

        let (hit_sl, hit_tp, role) = match protection.side {
            PositionSide::Long => (current_price <= sl, current_price >= tp, ()),
            PositionSide::Short => (current_price >= sl, current_price <= tp, ()),
        };
        let _ = role;

        let reason = if hit_sl {
            "sl"
        } else if hit_tp {
            "tp"
        } else {
            return Ok(None);
        };

        let role = if hit_sl { OrderRole::Sl } else { OrderRole::Tp };
        let exit_client_id = make_client_id(&protection.broker, symbol, role, &protection.signal_id);
        let exit_side = match protection.side {
            PositionSide::Long => crate::types::Side::Sell,
            PositionSide::Short => crate::types::Side::Buy,
        };

        if !ledger.reserve_order(&exit_client_id, &protection.broker, symbol, role, exit_side, serde_json::json!({"qty": protection.qty}))? {
            return Ok(None);
        }

        let result = broker_port
            .place_order(crate::broker::OrderRequest {
                symbol: symbol.to_string(),
                side: exit_side,
                quantity: protection.qty,
                order_type: crate::types::OrderType::Market,
                price: None,
                client_id: Some(exit_client_id.clone()),
            })
            .await?;

        if result.status == crate::types::OrderStatus::Filled {
            ledger.mark_order_final(&exit_client_id, result.status, serde_json::json!({"price": result.price}))?;
            ledger.close_trade(&protection.trade_id, result.price, reason)?;
            self.drop_protection(symbol)?;
            info!(symbol, reason, price = result.price, "synthetic protection triggered, trade closed");
            Ok(Some(reason.to_string()))
        } else {
            ledger.mark_order_submitted(&exit_client_id, &result.order_id, serde_json::json!({}))?;
            warn!(symbol, reason, status = %result.status, "protection exit order not filled yet; protection left intact");
            Ok(None)
        }
    }

    async fn check_native_trigger(
        &self,
        symbol: &str,
        protection: &Protection,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
    ) -> Result<Option<String>, RunnerError> {
        let Some(native) = &protection.native else { return Ok(None) };

        let sl_id = native.sl.as_ref().and_then(|l| l.order_id.as_deref());
        let tp_id = native.tp.as_ref().and_then(|l| l.order_id.as_deref());

        let sl_child = if let Some(id) = sl_id { broker_port.get_plan_sub_order(id).await? } else { None };
        let tp_child = if let Some(id) = tp_id { broker_port.get_plan_sub_order(id).await? } else { None };

        let (reason, filled, surviving_leg) = if let Some(child) = sl_child {
            ("native_sl", child, tp_id)
        } else if let Some(child) = tp_child {
            ("native_tp", child, sl_id)
        } else {
            return Ok(None);
        };

        if let Some(leg_id) = surviving_leg {
            if let Err(e) = broker_port.cancel_plan_order(leg_id).await {
                if !e.is_unsupported() {
                    warn!(symbol, leg_id, error = %e, "failed to cancel surviving protection leg");
                }
            }
        }

        ledger.close_trade(&protection.trade_id, filled.price, reason)?;
        self.drop_protection(symbol)?;
        info!(symbol, reason, price = filled.price, "native protection triggered, trade closed");
        Ok(Some(reason.to_string()))
    }

    /// Adaptive trailing-stop update (§4.6). `signal` carries the opaque
    /// `whale_footprint`/`iceberg_pressure` inputs when available. Under
    /// `ProtectionMode::Native` an improved stop is pushed to the venue via
    /// cancel-then-replace before the local state commits; under `Synthetic`
    /// only the in-memory/persisted state moves.
    pub async fn update_trailing(
        &self,
        symbol: &str,
        current_price: f64,
        signal: Option<&SignalRow>,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
        strict_live: bool,
    ) -> Result<bool, RunnerError> {
        let decision = {
            let mut guard = self.protections.lock();
            let Some(protection) = guard.get_mut(symbol) else { return Ok(false) };
            if protection.mode == ProtectionMode::PendingEntry {
                return Ok(false);
            }
            let (Some(sl), Some(entry_price), atr) = (protection.sl, protection.entry_price, protection.atr) else {
                return Ok(false);
            };
            if atr <= 0.0 || protection.qty == 0.0 {
                return Ok(false);
            }

            if let Some(last_ts) = protection.trail_last_ts {
                let elapsed = Utc::now().timestamp() - last_ts;
                if elapsed < self.trail.cooldown_s {
                    return Ok(false);
                }
            }

            let sign: f64 = match protection.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
            };

            let watermark = protection.watermark.unwrap_or(entry_price);
            let new_watermark = if sign > 0.0 { watermark.max(current_price) } else { watermark.min(current_price) };
            protection.watermark = Some(new_watermark);

            let profit = (new_watermark - entry_price) * sign;
            let min_gap = (current_price * self.trail.min_gap_pct).max(atr * 0.05);

            let mut candidate: Option<f64> = None;

            if profit >= self.trail.breakeven_atr * atr {
                let be = entry_price + sign * atr * self.trail.breakeven_buffer_atr;
                candidate = Some(be);
            }

            let dist_to_sl = (current_price - sl).abs();
            if dist_to_sl > self.trail.trigger_dist_atr * atr {
                let whale_override = signal.map(|s| s.whale_footprint).unwrap_or(false) && profit > 2.0 * atr;
                let moon_mode = profit > 4.0 * atr;

                let offset = if whale_override {
                    4.5 * atr
                } else if moon_mode {
                    3.5 * atr
                } else if let Some(tp) = protection.tp {
                    let squeeze = clip01((tp - new_watermark) / (tp - entry_price).max(1e-9));
                    squeeze.max(0.1) * (self.trail.trail_offset_atr * atr)
                } else {
                    self.trail.trail_offset_atr * atr
                };

                let trail_candidate = new_watermark - sign * offset;
                candidate = Some(match candidate {
                    Some(be) => {
                        if sign > 0.0 {
                            be.max(trail_candidate)
                        } else {
                            be.min(trail_candidate)
                        }
                    }
                    None => trail_candidate,
                });
            }

            let Some(mut candidate) = candidate else { return Ok(false) };

            // Clip to preserve min_gap from current price.
            if sign > 0.0 {
                candidate = candidate.min(current_price - min_gap);
            } else {
                candidate = candidate.max(current_price + min_gap);
            }

            let improvement = (candidate - sl) * sign;
            if improvement < self.trail.min_step_atr * atr {
                return Ok(false);
            }

            TrailCandidate {
                mode: protection.mode,
                candidate,
                old_sl_order_id: protection.native.as_ref().and_then(|n| n.sl.as_ref()).and_then(|l| l.order_id.clone()),
                broker: protection.broker.clone(),
                trade_id: protection.trade_id.clone(),
                qty: protection.qty,
                side: protection.side,
            }
        };

        match decision.mode {
            ProtectionMode::Native => self.replace_native_sl(symbol, decision, ledger, broker_port, strict_live).await,
            _ => {
                let mut guard = self.protections.lock();
                if let Some(protection) = guard.get_mut(symbol) {
                    protection.sl = Some(decision.candidate);
                    protection.trail_last_ts = Some(Utc::now().timestamp());
                    protection.trail_count += 1;
                }
                drop(guard);
                self.persist()?;
                info!(symbol, new_sl = decision.candidate, "trailing stop updated");
                Ok(true)
            }
        }
    }

    /// Cancel-then-replace the venue-side SL plan order for a native
    /// protection under the runner's trading lock (§4.6). Reserves a
    /// dedicated `sl_trail` ledger row keyed by the integer-scaled candidate
    /// price, so a repeated call with the same candidate (e.g. after a
    /// crash-restart) is idempotent rather than placing a duplicate order.
    /// Replacement failure escalates to a panic close when `strict_live`.
    async fn replace_native_sl(
        &self,
        symbol: &str,
        decision: TrailCandidate,
        ledger: &Ledger,
        broker_port: &dyn BrokerPort,
        strict_live: bool,
    ) -> Result<bool, RunnerError> {
        let scaled = (decision.candidate * 1_000_000.0).round() as i64;
        let sl_client_id = make_client_id(&decision.broker, symbol, OrderRole::SlTrail, &format!("{}:{scaled}", decision.trade_id));
        let closing_side = match decision.side {
            PositionSide::Long => crate::types::Side::Sell,
            PositionSide::Short => crate::types::Side::Buy,
        };

        if !ledger.reserve_order(
            &sl_client_id,
            &decision.broker,
            symbol,
            OrderRole::SlTrail,
            closing_side,
            serde_json::json!({"new_sl": decision.candidate}),
        )? {
            return Ok(false);
        }

        if let Some(old_id) = &decision.old_sl_order_id {
            if let Err(e) = broker_port.cancel_plan_order(old_id).await {
                if !e.is_unsupported() {
                    warn!(symbol, old_id, error = %e, "failed to cancel prior native SL before replacement");
                }
            }
        }

        let placed = broker_port
            .place_protection_orders(symbol, decision.qty, Some(decision.candidate), None, Some(&sl_client_id), None)
            .await;

        match placed {
            Ok(orders) if orders.sl_order_id.is_some() => {
                ledger.mark_order_final(&sl_client_id, OrderStatus::Filled, serde_json::json!({"order_id": orders.sl_order_id}))?;

                let mut guard = self.protections.lock();
                if let Some(protection) = guard.get_mut(symbol) {
                    protection.sl = Some(decision.candidate);
                    protection.sl_client_id = Some(sl_client_id.clone());
                    protection.trail_last_ts = Some(Utc::now().timestamp());
                    protection.trail_count += 1;
                    let native = protection.native.get_or_insert_with(NativeProtection::default);
                    native.sl = Some(NativeLeg { order_id: orders.sl_order_id });
                }
                drop(guard);
                self.persist()?;
                info!(symbol, new_sl = decision.candidate, "native trailing stop replaced");
                Ok(true)
            }
            Ok(_) => {
                ledger.mark_order_final(&sl_client_id, OrderStatus::Rejected, serde_json::json!({}))?;
                warn!(symbol, "native SL replacement returned no order id");
                if strict_live {
                    self.panic_close(symbol, ledger, broker_port, "native_sl_replace_failed").await?;
                }
                Ok(false)
            }
            Err(e) => {
                ledger.mark_order_final(&sl_client_id, OrderStatus::Rejected, serde_json::json!({"error": e.to_string()}))?;
                warn!(symbol, error = %e, "native SL replacement failed");
                if strict_live {
                    self.panic_close(symbol, ledger, broker_port, "native_sl_replace_failed").await?;
                }
                Ok(false)
            }
        }
    }

    /// Panic close (§4.6): market-sell the full remaining quantity and drop
    /// protections regardless of the outcome.
    pub async fn panic_close(&self, symbol: &str, ledger: &Ledger, broker_port: &dyn BrokerPort, reason: &str) -> Result<(), RunnerError> {
        let Some(protection) = self.get(symbol) else { return Ok(()) };

        let client_id = make_client_id(&protection.broker, symbol, OrderRole::PanicExit, &protection.signal_id);
        let side = match protection.side {
            PositionSide::Long => crate::types::Side::Sell,
            PositionSide::Short => crate::types::Side::Buy,
        };

        if ledger.reserve_order(&client_id, &protection.broker, symbol, OrderRole::PanicExit, side, serde_json::json!({"reason": reason}))? {
            let result = broker_port
                .place_order(crate::broker::OrderRequest {
                    symbol: symbol.to_string(),
                    side,
                    quantity: protection.qty,
                    order_type: crate::types::OrderType::Market,
                    price: None,
                    client_id: Some(client_id.clone()),
                })
                .await?;

            ledger.mark_order_final(&client_id, result.status, serde_json::json!({"price": result.price}))?;
            if result.status == crate::types::OrderStatus::Filled {
                ledger.close_trade(&protection.trade_id, result.price, reason)?;
            } else {
                ledger.abort_trade(&protection.trade_id, reason)?;
            }
        }

        self.drop_protection(symbol)?;
        warn!(symbol, reason, "panic close executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(label: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("execution-core-protection-test-{label}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn short_side_protection_arithmetic_is_inverted() {
        let (sl, tp) = compute_sl_tp(PositionSide::Short, 20_000.0, 100.0, 2.0, 4.0);
        assert!(sl > 20_000.0, "short SL must sit above entry, got {sl}");
        assert!(tp < 20_000.0, "short TP must sit below entry, got {tp}");
        assert_eq!(sl, 20_200.0);
        assert_eq!(tp, 19_600.0);
    }

    #[test]
    fn long_side_protection_arithmetic_is_unchanged() {
        let (sl, tp) = compute_sl_tp(PositionSide::Long, 20_000.0, 100.0, 2.0, 4.0);
        assert_eq!(sl, 19_800.0);
        assert_eq!(tp, 20_400.0);
    }

    use crate::broker::{Candle, Capabilities, OrderRequest, OrderResult, ProtectionOrders};
    use crate::ledger::Ledger;
    use crate::types::{AccountState, Position};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Minimal broker double for trailing-stop tests. Synthetic-mode tests
    /// never reach the native methods; the native-replacement test configures
    /// `sl_order_id_on_replace` to control what `place_protection_orders`
    /// hands back.
    struct StubBroker {
        sl_order_id_on_replace: Option<String>,
        cancelled: Mutex<Vec<String>>,
    }

    impl StubBroker {
        fn new() -> Self {
            Self { sl_order_id_on_replace: Some("sl-new".into()), cancelled: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl BrokerPort for StubBroker {
        fn name(&self) -> &str {
            "sim"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn initialize(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_historical_klines(&self, _: &str, _: &str, _: i64, _: i64) -> Result<Vec<Candle>, BrokerError> {
            Ok(vec![])
        }
        async fn get_current_price(&self, _: &str) -> Result<f64, BrokerError> {
            Ok(100.0)
        }
        async fn get_account_state(&self) -> Result<AccountState, BrokerError> {
            Ok(AccountState { equity: 10_000.0, balance: 10_000.0, currency: "USD".into(), margin_used: 0.0, broker: "sim".into() })
        }
        async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError> {
            Ok(vec![])
        }
        async fn place_order(&self, _: OrderRequest) -> Result<OrderResult, BrokerError> {
            unimplemented!("not exercised by trailing-stop tests")
        }
        async fn wait_for_order_final(&self, _: Option<&str>, _: Option<&str>, _: &str, _: Duration) -> Result<OrderResult, BrokerError> {
            unimplemented!("not exercised by trailing-stop tests")
        }
        async fn get_open_orders(&self, _: &str) -> Result<Vec<OrderResult>, BrokerError> {
            Ok(vec![])
        }
        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn place_protection_orders(
            &self,
            _symbol: &str,
            _qty: f64,
            _sl_price: Option<f64>,
            _tp_price: Option<f64>,
            _sl_client_oid: Option<&str>,
            _tp_client_oid: Option<&str>,
        ) -> Result<ProtectionOrders, BrokerError> {
            Ok(ProtectionOrders { sl_order_id: self.sl_order_id_on_replace.clone(), tp_order_id: None })
        }
        async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BrokerError> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }
        async fn get_plan_sub_order(&self, _: &str) -> Result<Option<OrderResult>, BrokerError> {
            Ok(None)
        }
        async fn close_position(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        fn normalize_qty(&self, _: &str, qty: f64) -> f64 {
            qty
        }
        fn normalize_price(&self, _: &str, price: f64) -> f64 {
            price
        }
    }

    #[tokio::test]
    async fn trail_ratchet_does_not_regress_below_min_step() {
        let path = tmp_path("ratchet");
        let engine = ProtectionEngine::load(path.clone(), DynamicTrailConfig::default(), 120);
        let ledger = Ledger::open_in_memory().unwrap();
        let broker = StubBroker::new();
        engine
            .insert(
                "BTCUSDT",
                Protection {
                    mode: ProtectionMode::Synthetic,
                    broker: "sim".into(),
                    trade_id: "t1".into(),
                    signal_id: "sig-1".into(),
                    side: PositionSide::Long,
                    qty: 1.0,
                    sl: Some(98.0),
                    tp: Some(110.0),
                    atr: 1.0,
                    sl_mult: 2.0,
                    tp_mult: 4.0,
                    sl_client_id: None,
                    tp_client_id: None,
                    native: None,
                    entry_price: Some(100.0),
                    watermark: Some(100.0),
                    trail_last_ts: None,
                    trail_count: 0,
                    use_native: false,
                    last_price: 100.0,
                    created_at: Utc::now().to_rfc3339(),
                    pending: None,
                },
            )
            .unwrap();

        let moved = engine.update_trailing("BTCUSDT", 104.0, None, &ledger, &broker, false).await.unwrap();
        assert!(moved);
        let after_first = engine.get("BTCUSDT").unwrap().sl.unwrap();
        // squeeze = clip01((110-104)/(110-100)) = 0.6 -> offset = 0.6*atr -> sl = 104 - 0.6
        assert!((after_first - 103.4).abs() < 1e-9, "expected 103.4, got {after_first}");

        // A dip should never move SL backward even without the cooldown.
        let moved_on_dip = engine.update_trailing("BTCUSDT", 103.3, None, &ledger, &broker, false).await.unwrap();
        assert!(!moved_on_dip);
        assert_eq!(engine.get("BTCUSDT").unwrap().sl, Some(after_first));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn moon_mode_and_whale_override_pick_the_wider_offset() {
        let path = tmp_path("moonmode");
        let engine = ProtectionEngine::load(path.clone(), DynamicTrailConfig::default(), 120);
        let ledger = Ledger::open_in_memory().unwrap();
        let broker = StubBroker::new();
        engine
            .insert(
                "ETHUSDT",
                Protection {
                    mode: ProtectionMode::Synthetic,
                    broker: "sim".into(),
                    trade_id: "t2".into(),
                    signal_id: "sig-2".into(),
                    side: PositionSide::Long,
                    qty: 1.0,
                    sl: Some(95.0),
                    tp: Some(200.0),
                    atr: 1.0,
                    sl_mult: 2.0,
                    tp_mult: 4.0,
                    sl_client_id: None,
                    tp_client_id: None,
                    native: None,
                    entry_price: Some(100.0),
                    watermark: Some(100.0),
                    trail_last_ts: None,
                    trail_count: 0,
                    use_native: false,
                    last_price: 100.0,
                    created_at: Utc::now().to_rfc3339(),
                    pending: None,
                },
            )
            .unwrap();

        let signal = SignalRow { timestamp: 1, p_long: 0.9, p_short: 0.0, regime: 1, atr: 1.0, close: 105.0, whale_footprint: true, iceberg_pressure: 0.0 };
        engine.update_trailing("ETHUSDT", 105.0, Some(&signal), &ledger, &broker, false).await.unwrap();
        let sl = engine.get("ETHUSDT").unwrap().sl.unwrap();
        // whale override: offset 4.5*atr from watermark 105 -> 100.5
        assert!((sl - 100.5).abs() < 1e-6, "expected whale-override SL ~100.5, got {sl}");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn native_trail_cancels_and_replaces_the_venue_sl_and_reserves_an_sl_trail_row() {
        let path = tmp_path("native-trail");
        let engine = ProtectionEngine::load(path.clone(), DynamicTrailConfig::default(), 120);
        let ledger = Ledger::open_in_memory().unwrap();
        let broker = StubBroker::new();
        engine
            .insert(
                "BTCUSDT",
                Protection {
                    mode: ProtectionMode::Native,
                    broker: "sim".into(),
                    trade_id: "t3".into(),
                    signal_id: "sig-3".into(),
                    side: PositionSide::Long,
                    qty: 1.0,
                    sl: Some(98.0),
                    tp: Some(110.0),
                    atr: 1.0,
                    sl_mult: 2.0,
                    tp_mult: 4.0,
                    sl_client_id: None,
                    tp_client_id: None,
                    native: Some(NativeProtection { sl: Some(NativeLeg { order_id: Some("sl-old".into()) }), tp: None }),
                    entry_price: Some(100.0),
                    watermark: Some(100.0),
                    trail_last_ts: None,
                    trail_count: 0,
                    use_native: true,
                    last_price: 100.0,
                    created_at: Utc::now().to_rfc3339(),
                    pending: None,
                },
            )
            .unwrap();

        let moved = engine.update_trailing("BTCUSDT", 104.0, None, &ledger, &broker, false).await.unwrap();
        assert!(moved);

        assert_eq!(broker.cancelled.lock().as_slice(), ["sl-old".to_string()]);

        let protection = engine.get("BTCUSDT").unwrap();
        let after_first = protection.sl.unwrap();
        assert!((after_first - 103.4).abs() < 1e-9, "expected 103.4, got {after_first}");
        assert_eq!(protection.native.unwrap().sl.unwrap().order_id.as_deref(), Some("sl-new"));

        let reserved = ledger.list_reserved_orders("sim").unwrap();
        assert!(reserved.is_empty(), "sl_trail row should have been marked final, not left reserved");

        let _ = std::fs::remove_file(&path);
    }
}
