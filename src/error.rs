// =============================================================================
// Gateway error type — outcome classification for queued terminal requests
// =============================================================================

use crate::terminal::DriverError;

/// Errors surfaced to callers of the smart queue.
///
/// Fetch misses and transient history gaps are absorbed internally by the
/// history fetcher's retry tiers and never reach this type. Queue saturation
/// is likewise invisible here: a caller that cannot get a slot keeps waiting
/// and eventually reports `CallerTimeout`, leaving other users unaffected.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The caller's wait ceiling elapsed before the worker produced a result.
    #[error("timed out waiting for the terminal worker")]
    CallerTimeout,

    /// The terminal could not be initialized.
    #[error("terminal initialization failed: {0}")]
    InitFailure(DriverError),

    /// The terminal rejected the supplied credentials.
    #[error("login rejected: {0}")]
    AuthFailure(DriverError),

    /// Any other driver-level failure while serving the request.
    #[error("terminal request failed: {0}")]
    Driver(#[from] DriverError),

    /// The worker thread is gone and can no longer serve requests.
    #[error("terminal worker is not running")]
    WorkerGone,
}

// =============================================================================
// Tests
// =============================================================================
