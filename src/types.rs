// =============================================================================
// Shared data model used across the execution engine
// =============================================================================

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Trading side of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Long/short position direction, separate from order `Side` because a SELL
/// order can either open a short or close a long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Execution mode the whole process runs under. Gates live order submission
/// and strict-protection behavior (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Backtest,
    Paper,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backtest => write!(f, "backtest"),
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(Self::Backtest),
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Order type accepted by the broker port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Terminal and non-terminal order statuses (§3 Lifecycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Reserved,
    Submitted,
    Pending,
    Filled,
    Canceled,
    Rejected,
    Failed,
}

impl OrderStatus {
    /// Terminal statuses are the ones a ledger row settles into; `reserved`
    /// and `submitted` are never terminal, `pending` is a venue-reported
    /// non-final acknowledgement distinct from our own `reserved`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }

    /// Negative terminal statuses are eligible for re-reservation under the
    /// same `client_id` (§4.1).
    pub fn is_negative_terminal(self) -> bool {
        matches!(self, OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reserved => "reserved",
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "submitted" => Ok(Self::Submitted),
            "pending" | "unknown" => Ok(Self::Pending),
            "filled" => Ok(Self::Filled),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Role an order plays within a trade's lifecycle; part of the `client_id`
/// formula (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderRole {
    Entry,
    Exit,
    Sl,
    Tp,
    SlTrail,
    PanicExit,
    TimeExit,
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Sl => "sl",
            Self::Tp => "tp",
            Self::SlTrail => "sl_trail",
            Self::PanicExit => "panic_exit",
            Self::TimeExit => "time_exit",
        };
        write!(f, "{s}")
    }
}

/// Final disposition of a trade row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
    Aborted,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

// -----------------------------------------------------------------------
// Identifiers
// -----------------------------------------------------------------------

/// Keep only ASCII alphanumerics, lowercased, then truncate — used by every
/// component of the `client_id` formula in §3.
pub fn sanitize(input: &str, max_len: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    cleaned.chars().take(max_len).collect()
}

fn hex_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// `client_id = sanitize(broker)[:6] ++ sanitize(symbol)[:10] ++ sanitize(role)[:6] ++ hash(...)[:20]`.
pub fn make_client_id(broker: &str, symbol: &str, role: OrderRole, signal_id: &str) -> String {
    let role_str = role.to_string();
    let digest = hex_digest(&[broker, symbol, &role_str, signal_id]);
    format!(
        "{}{}{}{}",
        sanitize(broker, 6),
        sanitize(symbol, 10),
        sanitize(&role_str, 6),
        &digest[..20.min(digest.len())]
    )
}

/// `trade_id = hash(broker, symbol, signal_id)`.
pub fn make_trade_id(broker: &str, symbol: &str, signal_id: &str) -> String {
    hex_digest(&[broker, symbol, signal_id])[..16].to_string()
}

/// Deterministic 16-char fingerprint of a signal row: same input always
/// produces the same id, so the runner can detect "nothing new happened".
pub fn signal_fingerprint(symbol: &str, last_timestamp: i64, p_long: f64, p_short: f64) -> String {
    let payload = format!("{symbol}|{last_timestamp}|{p_long:.6}|{p_short:.6}");
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

// -----------------------------------------------------------------------
// Signal
// -----------------------------------------------------------------------

/// A single time-indexed signal row (§3). Produced upstream; the core only
/// reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub timestamp: i64,
    pub p_long: f64,
    pub p_short: f64,
    pub regime: i32,
    pub atr: f64,
    pub close: f64,
    /// Opaque informational input consumed only by the trailing controller.
    #[serde(default)]
    pub whale_footprint: bool,
    /// Opaque informational input consumed only by the trailing controller.
    #[serde(default)]
    pub iceberg_pressure: f64,
}

// -----------------------------------------------------------------------
// Ledger rows
// -----------------------------------------------------------------------

/// A row in the `trades` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub strategy_id: String,
    pub broker: String,
    pub symbol: String,
    pub side: Side,
    pub signal_id: String,
    pub entry_client_id: String,
    pub status: TradeStatus,
    pub entry_price: Option<f64>,
    pub entry_qty: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row in the `orders` table. `payload` is opaque JSON merged on every
/// transition, never truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_id: String,
    pub broker: String,
    pub symbol: String,
    pub role: OrderRole,
    pub side: Side,
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

// -----------------------------------------------------------------------
// Protection entry
// -----------------------------------------------------------------------

/// Which of the three arming modes a protection entry is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    PendingEntry,
    Synthetic,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NativeLeg {
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NativeProtection {
    pub sl: Option<NativeLeg>,
    pub tp: Option<NativeLeg>,
}

/// Per-symbol protection state (§3). One entry per symbol with an open
/// position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protection {
    pub mode: ProtectionMode,
    pub broker: String,
    pub trade_id: String,
    pub signal_id: String,
    pub side: PositionSide,
    pub qty: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub atr: f64,
    pub sl_mult: f64,
    pub tp_mult: f64,
    pub sl_client_id: Option<String>,
    pub tp_client_id: Option<String>,
    pub native: Option<NativeProtection>,
    pub entry_price: Option<f64>,
    /// Running high-water (long) / low-water (short) mark since entry.
    pub watermark: Option<f64>,
    pub trail_last_ts: Option<i64>,
    pub trail_count: u32,
    pub use_native: bool,
    pub last_price: f64,
    pub created_at: String,
    /// Only populated while `mode == PendingEntry`.
    pub pending: Option<PendingEntry>,
}

/// Extra bookkeeping carried only while a protection is waiting for an
/// ambiguous entry to resolve (§4.6 Pending-entry mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub entry_client_id: String,
    pub order_id: Option<String>,
    pub qty_expected: f64,
    pub created_at: String,
}

// -----------------------------------------------------------------------
// Venue truth
// -----------------------------------------------------------------------

/// A position as reported by a venue. Never fabricated by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed or unsigned depending on the adapter's capability set.
    pub quantity: f64,
    pub avg_price: f64,
    pub last_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub broker: String,
}

impl Position {
    pub fn side(&self, signed_quantities: bool) -> PositionSide {
        if signed_quantities && self.quantity < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }
}

/// Account snapshot for a single broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub balance: f64,
    pub currency: String,
    pub margin_used: f64,
    pub broker: String,
}

/// Aggregated account state across every initialized broker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalAccountState {
    pub equity: f64,
    pub balance: f64,
    pub details: std::collections::HashMap<String, AccountState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_non_alphanumeric_and_truncates() {
        assert_eq!(sanitize("Venue-A_1", 6), "venuea");
        assert_eq!(sanitize("BTC/USDT", 10), "btcusdt");
    }

    #[test]
    fn client_id_is_deterministic() {
        let a = make_client_id("venuea", "BTCUSDT", OrderRole::Entry, "sig-1");
        let b = make_client_id("venuea", "BTCUSDT", OrderRole::Entry, "sig-1");
        assert_eq!(a, b);
        let c = make_client_id("venuea", "BTCUSDT", OrderRole::Entry, "sig-2");
        assert_ne!(a, c);
    }

    #[test]
    fn client_id_has_expected_shape() {
        let id = make_client_id("venuea", "BTCUSDT", OrderRole::Sl, "sig-1");
        assert!(id.starts_with("venuea"));
        assert!(id.len() >= "venuea".len() + "btcusdt".len() + "sl".len());
    }

    #[test]
    fn trade_id_is_stable_for_same_inputs() {
        let a = make_trade_id("venuea", "BTCUSDT", "sig-1");
        let b = make_trade_id("venuea", "BTCUSDT", "sig-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn signal_fingerprint_changes_with_probabilities() {
        let a = signal_fingerprint("BTCUSDT", 1000, 0.7, 0.1);
        let b = signal_fingerprint("BTCUSDT", 1000, 0.71, 0.1);
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn order_status_terminal_classification() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Reserved.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Failed.is_negative_terminal());
        assert!(!OrderStatus::Filled.is_negative_terminal());
    }
}
