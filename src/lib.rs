// =============================================================================
// MT5 Gateway — multi-tenant polling and change-detection engine in front of
// a MetaTrader 5 terminal
// =============================================================================
//
// The terminal is single-session, blocking, and eventually consistent about
// recent history. This crate serializes many users onto that one session
// (`queue` + `worker`), detects position closures by snapshot diffing
// (`snapshot`), reconstructs closed trades accurately from two history
// sources (`fetcher`), enriches them with risk metrics (`risk`), and exposes
// the whole thing over a small REST surface (`api`).
// =============================================================================

pub mod api;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod queue;
pub mod risk;
pub mod snapshot;
pub mod terminal;
pub mod types;

mod worker;
