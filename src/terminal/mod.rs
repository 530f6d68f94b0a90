// =============================================================================
// Terminal integration — driver seam over the MetaTrader 5 session
// =============================================================================
//
// The native SDK is procedural, blocking, and single-session. Everything the
// gateway needs from it is expressed as the `Terminal` trait in `driver`;
// `sim` provides the in-memory implementation used by the binary when no real
// terminal is attached and by every test.
// =============================================================================

mod driver;
mod sim;

pub use driver::{
    Deal, DealEntry, DealKind, DriverError, HistoryOrder, RawAccountInfo, RawPosition, Terminal,
};
pub use sim::SimTerminal;
