// =============================================================================
// Error taxonomy (§7) — closed enums at internal seams, `anyhow` at the
// application boundary.
// =============================================================================

use thiserror::Error;

/// Errors a broker adapter can return. Every venue call site matches on
/// these kinds rather than string-sniffing.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// HTTP 5xx, timeouts, connection resets — retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 429 or a rate-like API message — retry with backoff, honoring
    /// `Retry-After` when present.
    #[error("rate limited: {0}")]
    RateLimited { message: String, retry_after_ms: Option<u64> },

    /// A retryable error occurred after submission may have already reached
    /// the venue. Caller must look up by `client_id` before retrying.
    #[error("ambiguous outcome: {0}")]
    Ambiguous(String),

    /// Rejected order, insufficient funds, precision violation — terminal.
    #[error("venue rejected request: {0}")]
    VenueLogical(String),

    /// Unexpected payload shape or an empty critical id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The adapter does not implement this operation at all (as opposed to
    /// rejecting it). Callers degrade gracefully rather than treating this
    /// as fatal.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BrokerError::Unsupported(_))
    }
}

/// Errors the durable ledger can return. Persistence failures are fatal to
/// the calling action — the caller must not submit to the venue.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store unavailable: {0}")]
    Store(String),

    #[error("ledger row not found: {0}")]
    NotFound(String),

    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Store(e.to_string())
    }
}

/// Policy refusals — raised before any external call is attempted.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("kill switch is engaged")]
    KillSwitchActive,

    #[error("daily drawdown guard tripped: {0}")]
    DrawdownBreached(String),

    #[error("LIVE trading is not armed (ALLOW_LIVE=false)")]
    LiveDisarmed,

    #[error("max open positions reached ({0})")]
    MaxPositionsReached(u32),
}

/// Top-level cycle error used by the strategy runner loop to decide between
/// local recovery, trade-abort, or escalation to the kill switch.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}
