// =============================================================================
// End-to-end smart queue tests — full pipeline against the simulated terminal
// =============================================================================
//
// Each test wires a real SmartQueue + worker thread to a scripted
// SimTerminal and drives poll cycles through `get_positions`, exactly as the
// REST layer does. Timings come from a millisecond-scale config so retry and
// TTL paths run fast.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;

use mt5_gateway::config::GatewayConfig;
use mt5_gateway::error::GatewayError;
use mt5_gateway::queue::SmartQueue;
use mt5_gateway::terminal::{
    Deal, DealEntry, DealKind, HistoryOrder, RawAccountInfo, RawPosition, SimTerminal, Terminal,
};
use mt5_gateway::types::{Credentials, TradeRecord, TradeSide, TradeSource};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const TTL_MS: u64 = 150;

fn fast_config() -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.cache_ttl_ms = TTL_MS;
    cfg.caller_poll_ms = 10;
    cfg.caller_timeout_ms = 3_000;
    cfg.worker_idle_ms = 5;
    cfg.worker_error_cooldown_ms = 10;
    cfg.retry_backoff_ms = 5;
    cfg.warmup_settle_ms = 1;
    cfg.warmup_interval_secs = 300;
    cfg
}

fn creds() -> Credentials {
    Credentials {
        login: 10_001,
        password: "pw".into(),
        server: "Demo".into(),
    }
}

fn started_queue(sim: &Arc<SimTerminal>) -> Arc<SmartQueue> {
    let queue = Arc::new(SmartQueue::new(fast_config()));
    queue.start(Arc::clone(sim) as Arc<dyn Terminal>);
    queue
}

/// Wait out the cache TTL so the next call triggers a fresh poll cycle.
async fn expire_cache() {
    tokio::time::sleep(Duration::from_millis(TTL_MS + 50)).await;
}

fn open_position(ticket: u64) -> RawPosition {
    RawPosition {
        ticket,
        symbol: "EURUSD".into(),
        side: TradeSide::Buy,
        volume: 0.1,
        price_open: 1.1000,
        price_current: 1.1010,
        sl: 0.0,
        tp: 0.0,
        profit: 10.0,
        swap: 0.0,
        time: Utc::now().timestamp(),
        comment: String::new(),
    }
}

fn entry_deal(ticket: u64) -> Deal {
    Deal {
        ticket: ticket * 100 + 1,
        order: ticket * 10 + 1,
        position_id: ticket,
        symbol: "EURUSD".into(),
        kind: DealKind::Buy,
        entry: DealEntry::In,
        volume: 0.1,
        price: 1.1000,
        time: (Utc::now() - chrono::Duration::minutes(10)).timestamp(),
        profit: 0.0,
        commission: -0.5,
        swap: 0.0,
        comment: String::new(),
    }
}

fn exit_deal(ticket: u64) -> Deal {
    Deal {
        ticket: ticket * 100 + 2,
        order: ticket * 10 + 2,
        position_id: ticket,
        symbol: "EURUSD".into(),
        kind: DealKind::Sell,
        entry: DealEntry::Out,
        volume: 0.1,
        price: 1.1020,
        time: Utc::now().timestamp(),
        profit: 20.0,
        commission: -0.5,
        swap: -0.1,
        comment: String::new(),
    }
}

fn sl_tp_order(ticket: u64) -> HistoryOrder {
    HistoryOrder {
        ticket: ticket * 1000,
        position_id: ticket,
        symbol: "EURUSD".into(),
        sl: 1.0980,
        tp: 1.1050,
        price_current: 1.1020,
        time_done: Utc::now().timestamp(),
    }
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<TradeRecord>,
) -> Option<TradeRecord> {
    timeout(Duration::from_secs(5), events.recv()).await.ok()?.ok()
}

// ---------------------------------------------------------------------------
// Polling & caching
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn first_poll_fills_cache_and_tracks_positions() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    let queue = started_queue(&sim);

    let positions = queue.get_positions("u1", creds(), None).await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].ticket, 1);
    assert_eq!(positions[0].symbol, "EURUSD");
    assert_eq!(sim.login_calls(), 1);

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_caller_within_ttl_is_served_from_cache() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    let queue = started_queue(&sim);

    let first = queue.get_positions("u1", creds(), None).await;
    let second = queue.get_positions("u1", creds(), None).await;

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    // One terminal round-trip serves both callers.
    assert_eq!(sim.login_calls(), 1);

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_of_concurrent_callers_shares_one_round_trip() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    let queue = started_queue(&sim);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.get_positions("u1", creds(), None).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().len(), 1);
    }

    // Redundant queued polls for the same user are coalesced by TTL.
    assert_eq!(sim.login_calls(), 1);

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_positions_emit_no_events() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    let queue = started_queue(&sim);
    let mut events = queue.subscribe();

    queue.get_positions("u1", creds(), None).await;
    expire_cache().await;
    let positions = queue.get_positions("u1", creds(), None).await;

    assert_eq!(positions.len(), 1);
    assert_eq!(sim.login_calls(), 2);
    assert!(events.try_recv().is_err());

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn login_failure_aborts_without_cache_update() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    sim.set_login_ok(false);

    let mut cfg = fast_config();
    cfg.caller_timeout_ms = 300;
    let queue = Arc::new(SmartQueue::new(cfg));
    queue.start(Arc::clone(&sim) as Arc<dyn Terminal>);

    let positions = queue.get_positions("u1", creds(), None).await;
    assert!(positions.is_empty());

    // Once credentials work, the same user polls normally.
    sim.set_login_ok(true);
    let positions = queue.get_positions("u1", creds(), None).await;
    assert_eq!(positions.len(), 1);

    queue.stop();
}

// ---------------------------------------------------------------------------
// Closure detection & trade events
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn closed_position_emits_accurate_trade_record() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(1)]);
    let queue = started_queue(&sim);
    let mut events = queue.subscribe();

    // Cycle 1 observes the open position.
    queue.get_positions("u1", creds(), Some("acct-9".into())).await;
    expire_cache().await;

    // Cycle 2: the position is gone and its history is visible.
    sim.set_positions(Vec::new());
    sim.push_deal(entry_deal(1));
    sim.push_deal(exit_deal(1));
    sim.push_order(sl_tp_order(1));

    let positions = queue.get_positions("u1", creds(), Some("acct-9".into())).await;
    assert!(positions.is_empty());

    let trade = next_event(&mut events).await.expect("trade event");
    assert_eq!(trade.external_id, "mt5_1");
    assert_eq!(trade.user_id, "u1");
    assert_eq!(trade.account_id.as_deref(), Some("acct-9"));
    assert_eq!(trade.side, TradeSide::Buy);
    assert_eq!(trade.entry_price, 1.1000);
    assert_eq!(trade.exit_price, 1.1020);
    assert_eq!(trade.gross_pnl, 20.0);
    assert!((trade.commission + 1.0).abs() < 1e-9);
    assert!((trade.swap + 0.1).abs() < 1e-9);
    assert!((trade.net_pnl - 18.9).abs() < 1e-9);
    assert_eq!(trade.stop_loss, Some(1.0980));
    assert_eq!(trade.take_profit, Some(1.1050));
    assert_eq!(trade.source, TradeSource::HistoryDeals);
    assert_eq!(trade.accuracy, "100%");
    assert_eq!(trade.status, "closed");

    // Risk metrics: 20 pips risked on 0.1 lots.
    assert!((trade.risk_amount.unwrap() - 20.0).abs() < 1e-9);
    assert!((trade.r_multiple.unwrap() - 1.0).abs() < 1e-9);
    assert!((trade.risk_reward.unwrap() - 2.5).abs() < 1e-9);

    // Cycle 3: the ticket was removed from the snapshot, nothing re-fires.
    expire_cache().await;
    queue.get_positions("u1", creds(), Some("acct-9".into())).await;
    assert!(events.try_recv().is_err());

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_succeeds_on_retry_and_fires_once() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(2)]);
    let queue = started_queue(&sim);
    let mut events = queue.subscribe();

    queue.get_positions("u2", creds(), None).await;
    expire_cache().await;

    sim.set_positions(Vec::new());
    sim.push_deal(entry_deal(2));
    sim.push_deal(exit_deal(2));
    // First attempt's warmup and window query both miss; the retry sees the
    // deals.
    sim.hide_deals_for(2);

    queue.get_positions("u2", creds(), None).await;

    let trade = next_event(&mut events).await.expect("trade event");
    assert_eq!(trade.external_id, "mt5_2");
    assert!(events.try_recv().is_err());

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unfetchable_closure_is_retried_next_cycle() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(3)]);
    let queue = started_queue(&sim);
    let mut events = queue.subscribe();

    queue.get_positions("u3", creds(), None).await;
    expire_cache().await;

    // The position vanishes but history stays empty: every attempt misses.
    sim.set_positions(Vec::new());
    queue.get_positions("u3", creds(), None).await;
    assert!(events.try_recv().is_err());

    // Next cycle the history has synced; exactly one event fires in total.
    expire_cache().await;
    sim.push_deal(entry_deal(3));
    sim.push_deal(exit_deal(3));
    queue.get_positions("u3", creds(), None).await;

    let trade = next_event(&mut events).await.expect("trade event");
    assert_eq!(trade.external_id, "mt5_3");
    assert!(events.try_recv().is_err());

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn closures_for_multiple_tickets_each_fire_once() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_positions(vec![open_position(10), open_position(11), open_position(12)]);
    let queue = started_queue(&sim);
    let mut events = queue.subscribe();

    queue.get_positions("u4", creds(), None).await;
    expire_cache().await;

    // Tickets 10 and 12 close; 11 stays open.
    sim.set_positions(vec![open_position(11)]);
    for ticket in [10, 12] {
        sim.push_deal(entry_deal(ticket));
        sim.push_deal(exit_deal(ticket));
    }

    let positions = queue.get_positions("u4", creds(), None).await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].ticket, 11);

    let mut ids = vec![
        next_event(&mut events).await.expect("first event").external_id,
        next_event(&mut events).await.expect("second event").external_id,
    ];
    ids.sort();
    assert_eq!(ids, vec!["mt5_10".to_string(), "mt5_12".to_string()]);
    assert!(events.try_recv().is_err());

    queue.stop();
}

// ---------------------------------------------------------------------------
// Queue overflow
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn overflowing_callers_time_out_with_empty_lists() {
    // No worker: accepted requests stay queued, the rest are rejected.
    let mut cfg = fast_config();
    cfg.caller_timeout_ms = 100;
    let queue = Arc::new(SmartQueue::new(cfg));

    let mut handles = Vec::new();
    for i in 0..200 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.get_positions(&format!("user-{i}"), creds(), None).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_empty());
    }

    // Exactly the queue capacity was ever accepted.
    assert_eq!(queue.queue_depth(), 100);
}

// ---------------------------------------------------------------------------
// Account & trade history
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn account_summary_round_trip() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_account(RawAccountInfo {
        login: 10_001,
        server: "Demo".into(),
        balance: 5_000.0,
        equity: 5_050.0,
        margin: 100.0,
        margin_free: 4_950.0,
        margin_level: 5_050.0,
        currency: "USD".into(),
        leverage: 200,
        profit: 50.0,
        company: "Test Broker".into(),
    });
    let queue = started_queue(&sim);

    let summary = queue.account_summary(creds()).await.unwrap();
    assert_eq!(summary.login, 10_001);
    assert_eq!(summary.free_margin, 4_950.0);
    assert_eq!(summary.currency, "USD");
    assert_eq!(sim.shutdown_calls(), 1);

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn account_summary_reports_auth_failure() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_login_ok(false);
    let queue = started_queue(&sim);

    let err = queue.account_summary(creds()).await.unwrap_err();
    assert!(matches!(err, GatewayError::AuthFailure(_)));

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn account_summary_reports_init_failure() {
    let sim = Arc::new(SimTerminal::new());
    sim.set_init_ok(false);
    let queue = started_queue(&sim);

    let err = queue.account_summary(creds()).await.unwrap_err();
    assert!(matches!(err, GatewayError::InitFailure(_)));
    // The session never got far enough to log in.
    assert_eq!(sim.login_calls(), 0);

    queue.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn trade_history_groups_deals_into_trades() {
    let sim = Arc::new(SimTerminal::new());
    sim.push_deal(entry_deal(20));
    sim.push_deal(exit_deal(20));
    // An open position's lone entry deal is not a complete trade.
    sim.push_deal(entry_deal(21));
    let queue = started_queue(&sim);

    let trades = queue.trade_history(creds(), Some(7)).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].position_id, 20);
    assert_eq!(trades[0].side, TradeSide::Buy);
    assert!((trades[0].profit - 20.0).abs() < 1e-9);
    assert!((trades[0].commission + 1.0).abs() < 1e-9);

    queue.stop();
}
