// =============================================================================
// Terminal driver contract — blocking MT5 session operations
// =============================================================================
//
// IMPORTANT: the terminal session is a process-wide exclusive resource. The
// SDK is not re-entrant, so only the single queue worker may hold a session;
// every call here blocks the calling OS thread.
//
// History queries are eventually consistent: a deal or order closed seconds
// ago may be absent until the terminal refreshes its internal cache. The
// history fetcher is built entirely around this fact.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::types::{Credentials, TradeSide};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structured terminal failure, mirroring the SDK's `last_error()` pair.
///
/// Implementations are expected to consult `last_error()` when an operation
/// reports failure and fold the code/message into this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("terminal error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw records, field-for-field what the SDK reports
// ---------------------------------------------------------------------------

/// How a deal relates to its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealEntry {
    /// Opens or adds to a position.
    In,
    /// Closes or reduces a position.
    Out,
    /// Reverses a position in one fill.
    InOut,
    /// Close-by against an opposite position.
    OutBy,
}

/// Deal type. Balance operations show up in history alongside trades and must
/// be filtered out by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealKind {
    Buy,
    Sell,
    Balance,
    Other,
}

impl DealKind {
    /// The trade direction this deal implies, if it is a market deal.
    pub fn side(&self) -> Option<TradeSide> {
        match self {
            Self::Buy => Some(TradeSide::Buy),
            Self::Sell => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// A currently open position as reported by `positions_get`.
#[derive(Debug, Clone)]
pub struct RawPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub price_open: f64,
    pub price_current: f64,
    /// Zero means no stop loss is set.
    pub sl: f64,
    /// Zero means no take profit is set.
    pub tp: f64,
    pub profit: f64,
    pub swap: f64,
    /// Open time, unix seconds.
    pub time: i64,
    pub comment: String,
}

/// An executed deal from the account history.
#[derive(Debug, Clone)]
pub struct Deal {
    pub ticket: u64,
    pub order: u64,
    pub position_id: u64,
    pub symbol: String,
    pub kind: DealKind,
    pub entry: DealEntry,
    pub volume: f64,
    pub price: f64,
    /// Execution time, unix seconds.
    pub time: i64,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub comment: String,
}

/// A historical order. Carries the trader's intent (sl/tp) and the final
/// price/time, but not the realized financials.
#[derive(Debug, Clone)]
pub struct HistoryOrder {
    pub ticket: u64,
    pub position_id: u64,
    pub symbol: String,
    /// Zero means unset.
    pub sl: f64,
    /// Zero means unset.
    pub tp: f64,
    pub price_current: f64,
    /// Completion time, unix seconds.
    pub time_done: i64,
}

/// Account state snapshot from `account_info`.
#[derive(Debug, Clone)]
pub struct RawAccountInfo {
    pub login: i64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub margin_free: f64,
    pub margin_level: f64,
    pub currency: String,
    pub leverage: i64,
    pub profit: f64,
    pub company: String,
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// Blocking interface over one MT5 terminal session.
///
/// All methods may stall for hundreds of milliseconds; callers on an async
/// runtime must keep these off the scheduler (the queue worker runs them on
/// its own dedicated OS thread).
pub trait Terminal: Send + Sync {
    /// Start (or confirm) the terminal process connection. Idempotent.
    fn initialize(&self) -> Result<(), DriverError>;

    /// Authorize the already-initialized session for the given account.
    /// On failure the caller must abort the request without touching history.
    fn login(&self, credentials: &Credentials) -> Result<(), DriverError>;

    /// Release the session.
    fn shutdown(&self);

    /// Unordered snapshot of the currently open positions.
    fn positions_get(&self) -> Result<Vec<RawPosition>, DriverError>;

    /// Deals executed in `[from, to]`. Eventually consistent; an empty result
    /// for a window that should contain a recent deal is a cache miss, not an
    /// error.
    fn history_deals_get(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DriverError>;

    /// Historical orders completed in `[from, to]`. Same consistency caveat
    /// as `history_deals_get`.
    fn history_orders_get(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryOrder>, DriverError>;

    /// Account state for the logged-in session.
    fn account_info(&self) -> Result<RawAccountInfo, DriverError>;
}
