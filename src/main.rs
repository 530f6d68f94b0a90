// =============================================================================
// MT5 Gateway — main entry point
// =============================================================================
//
// Startup order: environment, logging, config, terminal backend, smart queue
// worker, trade-event subscriber, REST server. Shutdown stops the worker
// after its current request.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mt5_gateway::api::rest::{self, ApiContext};
use mt5_gateway::config::GatewayConfig;
use mt5_gateway::queue::SmartQueue;
use mt5_gateway::terminal::{RawAccountInfo, RawPosition, SimTerminal, Terminal};
use mt5_gateway::types::TradeSide;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MT5_GATEWAY_CONFIG").unwrap_or_else(|_| "gateway_config.json".into());
    let mut config = GatewayConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        GatewayConfig::default()
    });

    // Deployment override without touching the config file.
    if let Ok(addr) = std::env::var("MT5_GATEWAY_BIND_ADDR") {
        config.bind_addr = addr;
    }

    info!(
        bind_addr = %config.bind_addr,
        cache_ttl_ms = config.cache_ttl_ms,
        queue_capacity = config.queue_capacity,
        "MT5 Gateway starting"
    );

    // ── 3. Terminal backend ──────────────────────────────────────────────
    // No terminal SDK is linked into this build; the simulated backend keeps
    // the full pipeline exercisable end to end.
    warn!("no native terminal attached, using the simulated backend");
    let terminal: Arc<dyn Terminal> = Arc::new(demo_terminal());

    // ── 4. Smart queue worker ────────────────────────────────────────────
    let queue = Arc::new(SmartQueue::new(config.clone()));
    queue.start(Arc::clone(&terminal));

    // ── 5. Trade-closed event subscriber ─────────────────────────────────
    // Downstream journaling would subscribe exactly like this.
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(trade) => info!(
                    external_id = %trade.external_id,
                    user_id = %trade.user_id,
                    symbol = %trade.symbol,
                    net_pnl = trade.net_pnl,
                    accuracy = trade.accuracy,
                    "trade closed event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "trade event subscriber lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── 6. REST server ───────────────────────────────────────────────────
    let ctx = Arc::new(ApiContext::new(Arc::clone(&queue)));
    let app = rest::router(ctx);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    warn!("shutdown signal received, stopping worker");
    queue.stop();
    info!("MT5 Gateway shut down complete");
    Ok(())
}

/// A simulated terminal seeded with one demo account so the API has something
/// to serve out of the box.
fn demo_terminal() -> SimTerminal {
    let sim = SimTerminal::new();

    sim.set_account(RawAccountInfo {
        login: 10_000_001,
        server: "Demo-Server".into(),
        balance: 10_000.0,
        equity: 10_012.5,
        margin: 220.0,
        margin_free: 9_792.5,
        margin_level: 4_551.1,
        currency: "USD".into(),
        leverage: 100,
        profit: 12.5,
        company: "Demo Broker Ltd".into(),
    });

    sim.set_positions(vec![RawPosition {
        ticket: 84_001_001,
        symbol: "EURUSD".into(),
        side: TradeSide::Buy,
        volume: 0.10,
        price_open: 1.0850,
        price_current: 1.0862,
        sl: 1.0820,
        tp: 1.0910,
        profit: 12.0,
        swap: -0.3,
        time: Utc::now().timestamp(),
        comment: "demo".into(),
    }]);

    sim
}
