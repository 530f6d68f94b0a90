// =============================================================================
// Terminal worker — drains the request queue on a dedicated OS thread
// =============================================================================
//
// The worker is the only code that touches the terminal driver. It owns the
// snapshot store and the history fetcher outright; everything it shares with
// the async side (cache, event channel, flags) goes through the handles in
// `WorkerContext`.
//
// Error policy: initialization and login failures abort the request quietly
// (the caller falls back to stale cache or times out). Anything else is
// logged and followed by a short cooldown, and the loop continues; the worker
// never dies, because it is the only path to recovery.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::fetcher::{FetchedTrade, HistoryFetcher};
use crate::queue::{CacheEntry, PollRequest, PositionCache, QueueRequest};
use crate::risk::enrich_with_risk_metrics;
use crate::snapshot::{PositionSnapshot, SnapshotStore};
use crate::terminal::{Deal, Terminal};
use crate::types::{AccountSummary, ClosedTrade, Credentials, TradeRecord};

/// Shared handles the worker needs from the manager.
pub(crate) struct WorkerContext {
    pub config: GatewayConfig,
    pub terminal: Arc<dyn Terminal>,
    pub cache: PositionCache,
    pub events: broadcast::Sender<TradeRecord>,
    pub running: Arc<AtomicBool>,
    pub terminal_ready: Arc<AtomicBool>,
}

/// Worker main loop. Polls the queue, sleeping briefly when it is empty, and
/// exits when the running flag drops or every sender is gone.
pub(crate) fn run(ctx: WorkerContext, mut rx: mpsc::Receiver<QueueRequest>) {
    let mut store = SnapshotStore::new();
    let mut fetcher = HistoryFetcher::new(ctx.config.clone());

    while ctx.running.load(Ordering::SeqCst) {
        match rx.try_recv() {
            Ok(request) => {
                if let Err(err) = process_request(&ctx, &mut store, &mut fetcher, request) {
                    error!(error = %err, "request processing failed");
                    std::thread::sleep(ctx.config.worker_error_cooldown());
                }
            }
            Err(TryRecvError::Empty) => std::thread::sleep(ctx.config.worker_idle()),
            Err(TryRecvError::Disconnected) => break,
        }
    }
}

fn process_request(
    ctx: &WorkerContext,
    store: &mut SnapshotStore,
    fetcher: &mut HistoryFetcher,
    request: QueueRequest,
) -> anyhow::Result<()> {
    match request {
        QueueRequest::Poll(poll) => process_poll(ctx, store, fetcher, poll),
        QueueRequest::Account(req) => {
            let result = serve_account(ctx, &req.credentials);
            if req.reply.send(result).is_err() {
                debug!(request_id = %req.request_id, "account caller gave up before the reply");
            }
            Ok(())
        }
        QueueRequest::TradeHistory(req) => {
            let result = serve_trade_history(ctx, fetcher, &req.credentials, req.days);
            if req.reply.send(result).is_err() {
                debug!(request_id = %req.request_id, "history caller gave up before the reply");
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Poll processing
// ---------------------------------------------------------------------------

/// One full poll cycle for a user: session, snapshot diff, closed-position
/// resolution, snapshot replacement, cache refresh.
fn process_poll(
    ctx: &WorkerContext,
    store: &mut SnapshotStore,
    fetcher: &mut HistoryFetcher,
    request: PollRequest,
) -> anyhow::Result<()> {
    let user_id = request.user_id;
    let started = Instant::now();

    // A burst of callers enqueues more than one poll for the same user; if an
    // earlier one already refreshed the cache inside the TTL, this one is
    // redundant.
    if let Some(entry) = ctx.cache.read().get(&user_id) {
        if entry.refreshed_at.elapsed() < ctx.config.cache_ttl() {
            debug!(%user_id, "skipping poll, cache still fresh");
            return Ok(());
        }
    }

    debug!(request_id = %request.request_id, %user_id, "processing poll request");

    if let Err(err) = ctx.terminal.initialize() {
        error!(%user_id, error = %err, "terminal initialization failed, aborting poll");
        return Ok(());
    }
    ctx.terminal_ready.store(true, Ordering::SeqCst);

    if let Err(err) = ctx.terminal.login(&request.credentials) {
        error!(
            %user_id,
            login = request.credentials.login,
            error = %err,
            "terminal login failed, aborting poll"
        );
        return Ok(());
    }

    let raw_positions = match ctx.terminal.positions_get() {
        Ok(positions) => positions,
        Err(err) => {
            ctx.terminal.shutdown();
            return Err(err.into());
        }
    };

    let current: HashMap<u64, PositionSnapshot> = raw_positions
        .iter()
        .map(|p| (p.ticket, PositionSnapshot::from_raw(p)))
        .collect();

    let previous = store.previous(&user_id);
    let closed = SnapshotStore::closed_tickets(&previous, &current);

    if !closed.is_empty() {
        info!(%user_id, count = closed.len(), tickets = ?closed, "closed positions detected");
    }

    let mut failed: Vec<u64> = Vec::new();
    for ticket in &closed {
        let snapshot = &previous[ticket];
        let delivered = handle_closed_position(
            ctx,
            fetcher,
            &user_id,
            request.account_id.as_deref(),
            *ticket,
            snapshot,
        );
        if !delivered {
            failed.push(*ticket);
        }
    }

    // Refresh the cache from what is open right now, then replace the
    // snapshot map, keeping unresolved closures so the next poll retries
    // them.
    let mut positions: Vec<_> = current.values().map(PositionSnapshot::to_info).collect();
    positions.sort_by_key(|p| p.ticket);

    store.install(&user_id, current, &failed, &previous);

    ctx.cache.write().insert(
        user_id.clone(),
        CacheEntry {
            positions,
            refreshed_at: Instant::now(),
        },
    );

    ctx.terminal.shutdown();

    info!(
        %user_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        tracked = store.tracked(&user_id),
        "poll request completed"
    );
    Ok(())
}

/// Resolve one detected closure. Returns whether a trade record was emitted;
/// a `false` keeps the ticket in the snapshot for the next cycle.
fn handle_closed_position(
    ctx: &WorkerContext,
    fetcher: &mut HistoryFetcher,
    user_id: &str,
    account_id: Option<&str>,
    ticket: u64,
    snapshot: &PositionSnapshot,
) -> bool {
    info!(user_id, ticket, "resolving closed position");

    let Some(data) = fetcher.get_closed_position_data(&*ctx.terminal, ticket) else {
        warn!(
            user_id,
            ticket, "closed position not in history yet, will retry on the next poll"
        );
        return false;
    };

    let mut record = build_trade_record(user_id, account_id, ticket, snapshot, data);
    enrich_with_risk_metrics(&mut record);

    info!(
        external_id = %record.external_id,
        symbol = %record.symbol,
        side = %record.side,
        net_pnl = record.net_pnl,
        source = %record.source,
        accuracy = record.accuracy,
        "trade closed"
    );

    // Delivery is best-effort: consumers are expected to be idempotent on
    // external_id, and a missing subscriber must not hold the ticket hostage.
    match ctx.events.send(record) {
        Ok(receivers) => debug!(ticket, receivers, "trade record delivered"),
        Err(_) => debug!(ticket, "no trade event subscribers"),
    }
    true
}

/// Merge fetched history with the last open snapshot. History wins wherever
/// it produced a value; the snapshot fills the entry-side gaps the orders
/// fallback cannot see.
fn build_trade_record(
    user_id: &str,
    account_id: Option<&str>,
    ticket: u64,
    snapshot: &PositionSnapshot,
    data: FetchedTrade,
) -> TradeRecord {
    let gross_pnl = data.profit;
    let commission = data.commission;
    let swap = data.swap;

    TradeRecord {
        external_id: format!("mt5_{ticket}"),
        user_id: user_id.to_string(),
        account_id: account_id.map(str::to_string),

        symbol: data.symbol.unwrap_or_else(|| snapshot.symbol.clone()),
        side: data.side.unwrap_or(snapshot.side),
        volume: data.volume.unwrap_or(snapshot.volume),

        entry_price: data.entry_price.unwrap_or(snapshot.price_open),
        entry_time: data.entry_time.unwrap_or(snapshot.open_time),
        exit_price: data.exit_price,
        exit_time: data.exit_time,

        gross_pnl,
        commission,
        swap,
        net_pnl: gross_pnl + commission + swap,

        stop_loss: data.sl.or((snapshot.sl > 0.0).then_some(snapshot.sl)),
        take_profit: data.tp.or((snapshot.tp > 0.0).then_some(snapshot.tp)),

        status: "closed",
        source: data.source,
        accuracy: data.source.accuracy(),

        risk_amount: None,
        r_multiple: None,
        risk_reward: None,
    }
}

// ---------------------------------------------------------------------------
// Account summary
// ---------------------------------------------------------------------------

fn serve_account(
    ctx: &WorkerContext,
    credentials: &Credentials,
) -> Result<AccountSummary, GatewayError> {
    ctx.terminal
        .initialize()
        .map_err(GatewayError::InitFailure)?;
    ctx.terminal_ready.store(true, Ordering::SeqCst);

    ctx.terminal
        .login(credentials)
        .map_err(GatewayError::AuthFailure)?;

    let result = ctx.terminal.account_info();
    ctx.terminal.shutdown();

    let info = result?;
    Ok(AccountSummary {
        login: info.login,
        server: info.server,
        balance: info.balance,
        equity: info.equity,
        margin: info.margin,
        free_margin: info.margin_free,
        margin_level: info.margin_level,
        currency: info.currency,
        leverage: info.leverage,
        profit: info.profit,
        company: info.company,
    })
}

// ---------------------------------------------------------------------------
// Trade history
// ---------------------------------------------------------------------------

fn serve_trade_history(
    ctx: &WorkerContext,
    fetcher: &mut HistoryFetcher,
    credentials: &Credentials,
    days: i64,
) -> Result<Vec<ClosedTrade>, GatewayError> {
    ctx.terminal
        .initialize()
        .map_err(GatewayError::InitFailure)?;
    ctx.terminal_ready.store(true, Ordering::SeqCst);

    ctx.terminal
        .login(credentials)
        .map_err(GatewayError::AuthFailure)?;

    // History must be loaded before a windowed query is trustworthy.
    fetcher.warm_history_cache(&*ctx.terminal);

    let now = Utc::now();
    let from = now - ChronoDuration::days(days);
    let result = ctx.terminal.history_deals_get(from, now);
    ctx.terminal.shutdown();

    let deals = result?;
    let trades = group_deals_into_trades(deals);
    info!(login = credentials.login, days, count = trades.len(), "trade history served");
    Ok(trades)
}

/// Group market deals by position id into complete trades: first deal is the
/// entry, last is the exit, financials summed across every leg. Groups with a
/// single visible deal are positions still open (or half-synced) and are
/// skipped. Balance operations never enter a group.
pub(crate) fn group_deals_into_trades(deals: Vec<Deal>) -> Vec<ClosedTrade> {
    let mut groups: HashMap<u64, Vec<Deal>> = HashMap::new();
    for deal in deals {
        if deal.kind.side().is_some() {
            groups.entry(deal.position_id).or_default().push(deal);
        }
    }

    let mut trades = Vec::new();
    for (position_id, mut group) in groups {
        group.sort_by_key(|d| d.time);
        if group.len() < 2 {
            debug!(position_id, "skipping incomplete trade group");
            continue;
        }

        let entry = &group[0];
        let exit = &group[group.len() - 1];
        let Some(side) = entry.kind.side() else {
            continue;
        };

        let profit: f64 = group.iter().map(|d| d.profit).sum();
        let commission: f64 = group.iter().map(|d| d.commission).sum();
        let swap: f64 = group.iter().map(|d| d.swap).sum();

        let comment = if entry.comment.is_empty() {
            exit.comment.clone()
        } else {
            entry.comment.clone()
        };

        trades.push(ClosedTrade {
            ticket: entry.ticket,
            position_id,
            symbol: entry.symbol.clone(),
            side,
            volume: entry.volume,
            entry_price: entry.price,
            entry_time: rfc3339(entry.time),
            exit_price: exit.price,
            exit_time: rfc3339(exit.time),
            profit,
            commission,
            swap,
            comment,
        });
    }

    trades.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
    trades
}

fn rfc3339(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH)
        .to_rfc3339()
}

// =============================================================================
// Tests
// =============================================================================
