// =============================================================================
// Durable Ledger (C1) — transactional store of orders + trades; the
// idempotency gate every order must pass through before it reaches a venue.
// =============================================================================
//
// Single-writer, multi-reader: all access goes through one `Mutex<Connection>`
// so concurrent async callers never have to reason about write interleaving.
// Every operation here is synchronous and durable before it returns, per the
// ledger's contract — callers that need this off the async executor's thread
// are expected to wrap calls in `spawn_blocking`; the ledger itself stays a
// plain blocking API because sqlite commits are fast and local.
// =============================================================================

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::types::{OrderRecord, OrderRole, OrderStatus, Side, Trade, TradeStatus};

pub struct Ledger {
    conn: Mutex<Connection>,
}

/// Statuses from which a `client_id` may be re-reserved (§4.1).
const RETRYABLE_STATUSES: [OrderStatus; 3] = [OrderStatus::Failed, OrderStatus::Canceled, OrderStatus::Rejected];

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::Store(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.migrate()?;
        Ok(ledger)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS orders (
                client_id   TEXT PRIMARY KEY,
                broker      TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                role        TEXT NOT NULL,
                side        TEXT NOT NULL,
                status      TEXT NOT NULL,
                order_id    TEXT,
                payload     TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                trade_id        TEXT PRIMARY KEY,
                strategy_id     TEXT NOT NULL,
                broker          TEXT NOT NULL,
                symbol          TEXT NOT NULL,
                side            TEXT NOT NULL,
                signal_id       TEXT NOT NULL,
                entry_client_id TEXT NOT NULL,
                status          TEXT NOT NULL,
                entry_price     REAL,
                entry_qty       REAL,
                exit_price      REAL,
                exit_reason     TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades (broker, symbol, status);
            ",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------

    /// See §4.1. Returns `true` when the caller may proceed to submission.
    pub fn reserve_order(
        &self,
        client_id: &str,
        broker: &str,
        symbol: &str,
        role: OrderRole,
        side: Side,
        payload: serde_json::Value,
    ) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT status, payload FROM orders WHERE client_id = ?1",
                params![client_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO orders (client_id, broker, symbol, role, side, status, order_id, payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?8)",
                    params![
                        client_id,
                        broker,
                        symbol,
                        role.to_string(),
                        side.to_string(),
                        OrderStatus::Reserved.to_string(),
                        payload.to_string(),
                        now,
                    ],
                )?;
                debug!(client_id, "order reserved (new)");
                Ok(true)
            }
            Some((status_str, old_payload_str)) => {
                let status: OrderStatus = status_str
                    .parse()
                    .map_err(|e: String| LedgerError::Invariant(e))?;
                if RETRYABLE_STATUSES.contains(&status) {
                    let mut merged: serde_json::Value =
                        serde_json::from_str(&old_payload_str).unwrap_or(serde_json::json!({}));
                    merge_payload(&mut merged, &payload);
                    let retry_n = merged
                        .get("_retry_n")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        + 1;
                    merged["_retry_n"] = serde_json::json!(retry_n);

                    conn.execute(
                        "UPDATE orders SET status = ?1, order_id = NULL, payload = ?2, updated_at = ?3 WHERE client_id = ?4",
                        params![OrderStatus::Reserved.to_string(), merged.to_string(), now, client_id],
                    )?;
                    info!(client_id, retry_n, "order re-reserved after terminal negative status");
                    Ok(true)
                } else {
                    debug!(client_id, status = %status, "reserve refused — not in a retryable status");
                    Ok(false)
                }
            }
        }
    }

    pub fn mark_order_submitted(
        &self,
        client_id: &str,
        order_id: &str,
        payload_delta: serde_json::Value,
    ) -> Result<(), LedgerError> {
        self.transition_order(client_id, OrderStatus::Submitted, Some(order_id), payload_delta)
    }

    pub fn mark_order_final(
        &self,
        client_id: &str,
        status: OrderStatus,
        payload_delta: serde_json::Value,
    ) -> Result<(), LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::Invariant(format!("{status} is not a terminal status")));
        }
        self.transition_order(client_id, status, None, payload_delta)
    }

    fn transition_order(
        &self,
        client_id: &str,
        status: OrderStatus,
        order_id: Option<&str>,
        payload_delta: serde_json::Value,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let now = Utc::now().to_rfc3339();

        let old_payload_str: String = conn
            .query_row("SELECT payload FROM orders WHERE client_id = ?1", params![client_id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(format!("order {client_id}")))?;

        let mut merged: serde_json::Value = serde_json::from_str(&old_payload_str).unwrap_or(serde_json::json!({}));
        merge_payload(&mut merged, &payload_delta);

        if let Some(oid) = order_id {
            conn.execute(
                "UPDATE orders SET status = ?1, order_id = ?2, payload = ?3, updated_at = ?4 WHERE client_id = ?5",
                params![status.to_string(), oid, merged.to_string(), now, client_id],
            )?;
        } else {
            conn.execute(
                "UPDATE orders SET status = ?1, payload = ?2, updated_at = ?3 WHERE client_id = ?4",
                params![status.to_string(), merged.to_string(), now, client_id],
            )?;
        }
        debug!(client_id, status = %status, "order transitioned");
        Ok(())
    }

    pub fn get_order(&self, client_id: &str) -> Result<Option<OrderRecord>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row(
            "SELECT client_id, broker, symbol, role, side, status, order_id, payload, created_at, updated_at
             FROM orders WHERE client_id = ?1",
            params![client_id],
            row_to_order_record,
        )
        .optional()
        .map_err(LedgerError::from)
    }

    pub fn list_reserved_orders(&self, broker: &str) -> Result<Vec<OrderRecord>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT client_id, broker, symbol, role, side, status, order_id, payload, created_at, updated_at
             FROM orders WHERE broker = ?1 AND status = ?2",
        )?;
        let rows = stmt
            .query_map(params![broker, OrderStatus::Reserved.to_string()], row_to_order_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------

    pub fn upsert_trade(
        &self,
        trade_id: &str,
        strategy_id: &str,
        broker: &str,
        symbol: &str,
        side: Side,
        signal_id: &str,
        entry_client_id: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO trades (trade_id, strategy_id, broker, symbol, side, signal_id, entry_client_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(trade_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![
                trade_id,
                strategy_id,
                broker,
                symbol,
                side.to_string(),
                signal_id,
                entry_client_id,
                TradeStatus::Open.to_string(),
                now,
            ],
        )?;
        info!(trade_id, broker, symbol, "trade upserted");
        Ok(())
    }

    pub fn set_trade_entry(&self, trade_id: &str, entry_price: f64, entry_qty: f64) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE trades SET entry_price = ?1, entry_qty = ?2, updated_at = ?3 WHERE trade_id = ?4",
            params![entry_price, entry_qty, now, trade_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("trade {trade_id}")));
        }
        Ok(())
    }

    pub fn close_trade(&self, trade_id: &str, exit_price: f64, reason: &str) -> Result<(), LedgerError> {
        self.finalize_trade(trade_id, TradeStatus::Closed, Some(exit_price), reason)
    }

    pub fn abort_trade(&self, trade_id: &str, reason: &str) -> Result<(), LedgerError> {
        self.finalize_trade(trade_id, TradeStatus::Aborted, None, reason)
    }

    fn finalize_trade(
        &self,
        trade_id: &str,
        status: TradeStatus,
        exit_price: Option<f64>,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE trades SET status = ?1, exit_price = ?2, exit_reason = ?3, updated_at = ?4 WHERE trade_id = ?5",
            params![status.to_string(), exit_price, reason, now, trade_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("trade {trade_id}")));
        }
        info!(trade_id, status = %status, reason, "trade finalized");
        Ok(())
    }

    pub fn get_open_trade(&self, broker: &str, symbol: &str) -> Result<Option<Trade>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row(
            "SELECT trade_id, strategy_id, broker, symbol, side, signal_id, entry_client_id, status,
                    entry_price, entry_qty, exit_price, exit_reason, created_at, updated_at
             FROM trades WHERE broker = ?1 AND symbol = ?2 AND status = ?3",
            params![broker, symbol, TradeStatus::Open.to_string()],
            row_to_trade,
        )
        .optional()
        .map_err(LedgerError::from)
    }

    pub fn has_open_trade(&self, broker: &str, symbol: &str) -> Result<bool, LedgerError> {
        Ok(self.get_open_trade(broker, symbol)?.is_some())
    }

    pub fn list_open_trades(&self, broker: Option<&str>) -> Result<Vec<Trade>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let trades = if let Some(broker) = broker {
            let mut stmt = conn.prepare(
                "SELECT trade_id, strategy_id, broker, symbol, side, signal_id, entry_client_id, status,
                        entry_price, entry_qty, exit_price, exit_reason, created_at, updated_at
                 FROM trades WHERE broker = ?1 AND status = ?2",
            )?;
            stmt.query_map(params![broker, TradeStatus::Open.to_string()], row_to_trade)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT trade_id, strategy_id, broker, symbol, side, signal_id, entry_client_id, status,
                        entry_price, entry_qty, exit_price, exit_reason, created_at, updated_at
                 FROM trades WHERE status = ?1",
            )?;
            stmt.query_map(params![TradeStatus::Open.to_string()], row_to_trade)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(trades)
    }

    pub fn get_trade_entry_price(&self, trade_id: &str) -> Result<Option<f64>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row("SELECT entry_price FROM trades WHERE trade_id = ?1", params![trade_id], |row| row.get(0))
            .optional()
            .map_err(LedgerError::from)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

/// Merge new keys over old ones without ever dropping a prior field.
fn merge_payload(base: &mut serde_json::Value, delta: &serde_json::Value) {
    if let (Some(base_obj), Some(delta_obj)) = (base.as_object_mut(), delta.as_object()) {
        for (k, v) in delta_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    } else {
        warn!("payload merge skipped — non-object payload");
    }
}

fn row_to_order_record(row: &rusqlite::Row) -> rusqlite::Result<OrderRecord> {
    let role_str: String = row.get(3)?;
    let side_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let payload_str: String = row.get(7)?;
    Ok(OrderRecord {
        client_id: row.get(0)?,
        broker: row.get(1)?,
        symbol: row.get(2)?,
        role: parse_role(&role_str),
        side: parse_side(&side_str),
        status: status_str.parse().unwrap_or(OrderStatus::Failed),
        order_id: row.get(6)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({})),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let side_str: String = row.get(4)?;
    let status_str: String = row.get(7)?;
    Ok(Trade {
        trade_id: row.get(0)?,
        strategy_id: row.get(1)?,
        broker: row.get(2)?,
        symbol: row.get(3)?,
        side: parse_side(&side_str),
        signal_id: row.get(5)?,
        entry_client_id: row.get(6)?,
        status: match status_str.as_str() {
            "open" => TradeStatus::Open,
            "closed" => TradeStatus::Closed,
            _ => TradeStatus::Aborted,
        },
        entry_price: row.get(8)?,
        entry_qty: row.get(9)?,
        exit_price: row.get(10)?,
        exit_reason: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn parse_role(s: &str) -> OrderRole {
    match s {
        "entry" => OrderRole::Entry,
        "exit" => OrderRole::Exit,
        "sl" => OrderRole::Sl,
        "tp" => OrderRole::Tp,
        "sl_trail" => OrderRole::SlTrail,
        "panic_exit" => OrderRole::PanicExit,
        _ => OrderRole::TimeExit,
    }
}

fn parse_side(s: &str) -> Side {
    if s == "sell" {
        Side::Sell
    } else {
        Side::Buy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> Ledger {
        Ledger::open_in_memory().unwrap()
    }

    #[test]
    fn reserve_then_reserve_again_is_refused() {
        let l = ledger();
        assert!(l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({"qty": 1.0})).unwrap());
        assert!(!l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({"qty": 1.0})).unwrap());
    }

    #[test]
    fn reserve_after_terminal_negative_status_succeeds_and_bumps_retry() {
        let l = ledger();
        assert!(l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({"qty": 1.0})).unwrap());
        l.mark_order_final("c1", OrderStatus::Failed, json!({"error": "timeout"})).unwrap();
        assert!(l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({"qty": 2.0})).unwrap());

        let order = l.get_order("c1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Reserved);
        assert_eq!(order.order_id, None);
        assert_eq!(order.payload["_retry_n"], json!(1));
        // payload merge never drops the prior error field
        assert_eq!(order.payload["error"], json!("timeout"));
        assert_eq!(order.payload["qty"], json!(2.0));
    }

    #[test]
    fn reserve_after_submitted_is_refused() {
        let l = ledger();
        l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({})).unwrap();
        l.mark_order_submitted("c1", "oid-1", json!({})).unwrap();
        assert!(!l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({})).unwrap());
    }

    #[test]
    fn at_most_one_open_trade_guard_is_enforced_by_caller_via_get_open_trade() {
        let l = ledger();
        l.upsert_trade("t1", "strat", "venuea", "BTCUSDT", Side::Buy, "sig-1", "c1").unwrap();
        assert!(l.has_open_trade("venuea", "BTCUSDT").unwrap());
        l.close_trade("t1", 100.0, "tp").unwrap();
        assert!(!l.has_open_trade("venuea", "BTCUSDT").unwrap());
    }

    #[test]
    fn set_trade_entry_requires_existing_row() {
        let l = ledger();
        let err = l.set_trade_entry("missing", 1.0, 1.0).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn mark_order_final_rejects_non_terminal_status() {
        let l = ledger();
        l.reserve_order("c1", "venuea", "BTCUSDT", OrderRole::Entry, Side::Buy, json!({})).unwrap();
        let err = l.mark_order_final("c1", OrderStatus::Submitted, json!({})).unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
    }
}
