// =============================================================================
// Gateway configuration — tunable timings for the queue, cache, and fetcher
// =============================================================================
//
// Every timing knob in the engine flows from this struct so that deployments
// can retune polling behaviour and tests can run the full pipeline at
// millisecond scale. All fields carry serde defaults, so loading an older
// JSON file after new fields are added never breaks.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    2_000
}

fn default_warmup_interval_secs() -> u64 {
    30
}

fn default_warmup_range_days() -> i64 {
    90
}

fn default_warmup_settle_ms() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    3_000
}

fn default_queue_capacity() -> usize {
    100
}

fn default_worker_idle_ms() -> u64 {
    50
}

fn default_worker_error_cooldown_ms() -> u64 {
    1_000
}

fn default_caller_poll_ms() -> u64 {
    100
}

fn default_caller_timeout_ms() -> u64 {
    10_000
}

fn default_deals_window_mins() -> i64 {
    30
}

fn default_entry_backfill_days() -> i64 {
    7
}

fn default_sltp_scan_hours() -> i64 {
    1
}

fn default_history_default_days() -> i64 {
    30
}

fn default_events_capacity() -> usize {
    256
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Top-level configuration for the MT5 gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the REST API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Read-through position cache -----------------------------------------
    /// How long a cached positions list stays fresh. Bursts of callers for
    /// the same user inside this window share one terminal round-trip.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    // --- History cache warming ------------------------------------------------
    /// Minimum gap between history-cache warmups.
    #[serde(default = "default_warmup_interval_secs")]
    pub warmup_interval_secs: u64,

    /// Span of the wide deals query used to force a history refresh.
    #[serde(default = "default_warmup_range_days")]
    pub warmup_range_days: i64,

    /// Pause after a warmup query so the terminal can settle.
    #[serde(default = "default_warmup_settle_ms")]
    pub warmup_settle_ms: u64,

    // --- Closed-position fetching ---------------------------------------------
    /// Attempts per closed position within one poll cycle.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between attempts; attempt n waits n times this.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Span of the primary deals query.
    #[serde(default = "default_deals_window_mins")]
    pub deals_window_mins: i64,

    /// Span searched for the entry deal when only the exit is in the recent
    /// window.
    #[serde(default = "default_entry_backfill_days")]
    pub entry_backfill_days: i64,

    /// Span of the order scan used to recover sl/tp.
    #[serde(default = "default_sltp_scan_hours")]
    pub sltp_scan_hours: i64,

    // --- Queue & worker --------------------------------------------------------
    /// Maximum pending requests; enqueue fails beyond this.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Worker sleep when the queue is empty.
    #[serde(default = "default_worker_idle_ms")]
    pub worker_idle_ms: u64,

    /// Worker sleep after an unexpected processing error.
    #[serde(default = "default_worker_error_cooldown_ms")]
    pub worker_error_cooldown_ms: u64,

    // --- Caller wait loop -------------------------------------------------------
    /// Cache recheck cadence while a caller waits for its poll.
    #[serde(default = "default_caller_poll_ms")]
    pub caller_poll_ms: u64,

    /// Hard ceiling on a caller's wait; beyond it the caller gets an empty
    /// list while the poll completes in the background.
    #[serde(default = "default_caller_timeout_ms")]
    pub caller_timeout_ms: u64,

    // --- Trade history endpoint -------------------------------------------------
    /// Default lookback for the trade-history endpoint when the request does
    /// not specify one.
    #[serde(default = "default_history_default_days")]
    pub history_default_days: i64,

    // --- Events -------------------------------------------------------------------
    /// Buffer size of the trade-closed broadcast channel.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cache_ttl_ms: default_cache_ttl_ms(),
            warmup_interval_secs: default_warmup_interval_secs(),
            warmup_range_days: default_warmup_range_days(),
            warmup_settle_ms: default_warmup_settle_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            deals_window_mins: default_deals_window_mins(),
            entry_backfill_days: default_entry_backfill_days(),
            sltp_scan_hours: default_sltp_scan_hours(),
            queue_capacity: default_queue_capacity(),
            worker_idle_ms: default_worker_idle_ms(),
            worker_error_cooldown_ms: default_worker_error_cooldown_ms(),
            caller_poll_ms: default_caller_poll_ms(),
            caller_timeout_ms: default_caller_timeout_ms(),
            history_default_days: default_history_default_days(),
            events_capacity: default_events_capacity(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error if the file is missing or malformed so the caller can
    /// fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gateway config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse gateway config from {}", path.display()))?;

        info!(
            path = %path.display(),
            cache_ttl_ms = config.cache_ttl_ms,
            queue_capacity = config.queue_capacity,
            "gateway config loaded"
        );

        Ok(config)
    }

    // --- Duration views ---------------------------------------------------------

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_secs(self.warmup_interval_secs)
    }

    pub fn warmup_settle(&self) -> Duration {
        Duration::from_millis(self.warmup_settle_ms)
    }

    /// Backoff before retry attempt `attempt` (1-based): attempt 1 waits one
    /// base unit, attempt 2 two, and so on.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms * u64::from(attempt))
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn worker_error_cooldown(&self) -> Duration {
        Duration::from_millis(self.worker_error_cooldown_ms)
    }

    pub fn caller_poll(&self) -> Duration {
        Duration::from_millis(self.caller_poll_ms)
    }

    pub fn caller_timeout(&self) -> Duration {
        Duration::from_millis(self.caller_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
