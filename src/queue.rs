// =============================================================================
// Smart queue — serialized terminal access with a read-through position cache
// =============================================================================
//
// The terminal session is exclusive, so every request that needs it goes
// through one bounded FIFO drained by a single worker on its own OS thread.
// Callers of `get_positions` never talk to the worker directly: they watch
// the shared per-user cache, which is what coalesces bursts of callers for
// the same user onto a single terminal round-trip.
//
// Closed-trade detection results are published on a broadcast channel; any
// number of consumers can subscribe and each emitted record is delivered at
// most once per closed ticket.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::terminal::Terminal;
use crate::types::{AccountSummary, ClosedTrade, Credentials, PositionInfo, TradeRecord};
use crate::worker;

// ---------------------------------------------------------------------------
// Queue requests
// ---------------------------------------------------------------------------

/// A request to poll one user's account. Consumed once by the worker; the
/// result lands in the shared cache rather than a reply channel.
#[derive(Debug)]
pub struct PollRequest {
    pub request_id: Uuid,
    pub user_id: String,
    pub credentials: Credentials,
    pub account_id: Option<String>,
}

/// A request for the account summary, answered over a oneshot channel.
#[derive(Debug)]
pub struct AccountRequest {
    pub request_id: Uuid,
    pub credentials: Credentials,
    pub reply: oneshot::Sender<Result<AccountSummary, GatewayError>>,
}

/// A request for grouped closed-trade history, answered over a oneshot
/// channel.
#[derive(Debug)]
pub struct TradeHistoryRequest {
    pub request_id: Uuid,
    pub credentials: Credentials,
    pub days: i64,
    pub reply: oneshot::Sender<Result<Vec<ClosedTrade>, GatewayError>>,
}

/// Work items accepted by the terminal worker, in FIFO order.
#[derive(Debug)]
pub enum QueueRequest {
    Poll(PollRequest),
    Account(AccountRequest),
    TradeHistory(TradeHistoryRequest),
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// One user's formatted positions list plus when the worker produced it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub positions: Vec<PositionInfo>,
    pub refreshed_at: Instant,
}

pub(crate) type PositionCache = Arc<RwLock<HashMap<String, CacheEntry>>>;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns all smart-queue state: the bounded request queue, the per-user
/// position cache, the trade-closed event channel, and the worker lifecycle.
/// Constructed once at startup and shared via `Arc`.
pub struct SmartQueue {
    config: GatewayConfig,
    tx: mpsc::Sender<QueueRequest>,
    /// Taken by the first `start` call.
    rx: Mutex<Option<mpsc::Receiver<QueueRequest>>>,
    cache: PositionCache,
    events: broadcast::Sender<TradeRecord>,
    worker_running: Arc<AtomicBool>,
    terminal_ready: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SmartQueue {
    pub fn new(config: GatewayConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (events, _) = broadcast::channel(config.events_capacity);

        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            cache: Arc::new(RwLock::new(HashMap::new())),
            events,
            worker_running: Arc::new(AtomicBool::new(false)),
            terminal_ready: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Worker lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the worker on a dedicated OS thread. The terminal driver blocks,
    /// so it must never run on the async scheduler.
    pub fn start(&self, terminal: Arc<dyn Terminal>) {
        let Some(rx) = self.rx.lock().take() else {
            warn!("smart queue worker already started");
            return;
        };

        self.worker_running.store(true, Ordering::SeqCst);

        let ctx = worker::WorkerContext {
            config: self.config.clone(),
            terminal,
            cache: Arc::clone(&self.cache),
            events: self.events.clone(),
            running: Arc::clone(&self.worker_running),
            terminal_ready: Arc::clone(&self.terminal_ready),
        };

        let handle = std::thread::Builder::new()
            .name("mt5-worker".into())
            .spawn(move || worker::run(ctx, rx))
            .expect("failed to spawn worker thread");

        *self.worker.lock() = Some(handle);
        info!("smart queue worker started");
    }

    /// Signal the worker to stop after its current request and wait for it.
    pub fn stop(&self) {
        self.worker_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("smart queue worker stopped");
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker_running.load(Ordering::SeqCst)
    }

    /// Whether the worker has successfully initialized the terminal at least
    /// once.
    pub fn is_terminal_ready(&self) -> bool {
        self.terminal_ready.load(Ordering::SeqCst)
    }

    /// Requests currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Subscribe to trade-closed events.
    pub fn subscribe(&self) -> broadcast::Receiver<TradeRecord> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Read-through positions
    // -------------------------------------------------------------------------

    /// Positions for `user_id`, served from cache when fresh.
    ///
    /// On a miss a poll request is enqueued and the caller polls the cache
    /// until the worker refreshes it or the wait ceiling elapses. A full
    /// queue is not an error here: the caller simply waits, and either an
    /// in-flight poll for this user lands in time or the wait times out to an
    /// empty list.
    pub async fn get_positions(
        &self,
        user_id: &str,
        credentials: Credentials,
        account_id: Option<String>,
    ) -> Vec<PositionInfo> {
        if let Some(positions) = self.fresh_positions(user_id) {
            debug!(user_id, "positions served from cache");
            return positions;
        }

        let request = QueueRequest::Poll(PollRequest {
            request_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            credentials,
            account_id,
        });

        match self.tx.try_send(request) {
            Ok(()) => debug!(user_id, depth = self.queue_depth(), "poll request enqueued"),
            Err(TrySendError::Full(_)) => {
                warn!(user_id, "request queue full, caller will wait on the cache")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(user_id, "worker is gone, caller will wait on the cache")
            }
        }

        let deadline = Instant::now() + self.config.caller_timeout();
        loop {
            tokio::time::sleep(self.config.caller_poll()).await;

            if let Some(positions) = self.fresh_positions(user_id) {
                return positions;
            }
            if Instant::now() >= deadline {
                warn!(user_id, "timed out waiting for a positions refresh");
                return Vec::new();
            }
        }
    }

    /// Cached positions if the entry is younger than the TTL.
    pub fn fresh_positions(&self, user_id: &str) -> Option<Vec<PositionInfo>> {
        let cache = self.cache.read();
        let entry = cache.get(user_id)?;
        (entry.refreshed_at.elapsed() < self.config.cache_ttl()).then(|| entry.positions.clone())
    }

    // -------------------------------------------------------------------------
    // Serialized one-shot requests
    // -------------------------------------------------------------------------

    /// Account summary for the given credentials, via the serialized queue.
    pub async fn account_summary(
        &self,
        credentials: Credentials,
    ) -> Result<AccountSummary, GatewayError> {
        let deadline = Instant::now() + self.config.caller_timeout();
        let (reply, rx) = oneshot::channel();
        let request = QueueRequest::Account(AccountRequest {
            request_id: Uuid::new_v4(),
            credentials,
            reply,
        });
        self.submit(request, deadline).await?;
        self.await_reply(rx, deadline).await
    }

    /// Resolve an optional caller-supplied lookback to a concrete day count.
    pub fn history_window_days(&self, days: Option<i64>) -> i64 {
        days.unwrap_or(self.config.history_default_days)
    }

    /// Grouped closed-trade history over the last `days` days (default from
    /// config), via the serialized queue.
    pub async fn trade_history(
        &self,
        credentials: Credentials,
        days: Option<i64>,
    ) -> Result<Vec<ClosedTrade>, GatewayError> {
        let days = self.history_window_days(days);
        let deadline = Instant::now() + self.config.caller_timeout();
        let (reply, rx) = oneshot::channel();
        let request = QueueRequest::TradeHistory(TradeHistoryRequest {
            request_id: Uuid::new_v4(),
            credentials,
            days,
            reply,
        });
        self.submit(request, deadline).await?;
        self.await_reply(rx, deadline).await
    }

    /// Enqueue a one-shot request, waiting for a slot while the queue is
    /// saturated. Queue pressure only affects this caller: it surfaces as a
    /// timeout once the wait ceiling elapses, never as a distinct error.
    async fn submit(&self, mut request: QueueRequest, deadline: Instant) -> Result<(), GatewayError> {
        loop {
            match self.tx.try_send(request) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        warn!("request queue stayed full until the wait ceiling");
                        return Err(GatewayError::CallerTimeout);
                    }
                    request = returned;
                    tokio::time::sleep(self.config.caller_poll()).await;
                }
                Err(TrySendError::Closed(_)) => return Err(GatewayError::WorkerGone),
            }
        }
    }

    /// Wait for the worker's reply within whatever remains of the caller's
    /// budget (enqueueing may already have consumed part of it).
    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<Result<T, GatewayError>>,
        deadline: Instant,
    ) -> Result<T, GatewayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::WorkerGone),
            Err(_) => Err(GatewayError::CallerTimeout),
        }
    }
}

impl std::fmt::Debug for SmartQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartQueue")
            .field("queue_depth", &self.queue_depth())
            .field("cached_users", &self.cache.read().len())
            .field("worker_running", &self.is_worker_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
