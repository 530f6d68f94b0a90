// =============================================================================
// Accurate history fetcher — reconstructs closed trades from terminal history
// =============================================================================
//
// The terminal's history cache is eventually consistent: a position closed
// seconds ago may not appear in deal history until the cache refreshes. The
// fetcher works around that with three mechanisms, in order:
//
//   1. Cache warming: a wide-range deals query forces the terminal to reload
//      its history, throttled to once per warmup interval.
//   2. Source preference: deals carry the realized financials (profit,
//      commission, swap per leg) and are authoritative; orders carry the
//      trader's intent (sl/tp) and the final price/time, and serve as the
//      fallback when the closing deal has not surfaced yet.
//   3. Progressive backoff: attempts are spaced 3 s, 6 s apart inside one
//      call. A miss after the final attempt returns None and the caller keeps
//      the ticket for the next poll cycle, which is the second retry tier.
//
// Commission values are summed raw across legs; sign conventions differ
// between brokers and are passed through untouched.
// =============================================================================

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::terminal::{Deal, DealEntry, DriverError, Terminal};
use crate::types::{TradeSide, TradeSource};

/// Everything the history sources could recover about one closed position.
///
/// Exit-side fields are always present (a source without them is a miss);
/// entry-side fields stay `None` when only the exit surfaced, and the caller
/// falls back to the last open-position snapshot for them.
#[derive(Debug, Clone)]
pub struct FetchedTrade {
    pub source: TradeSource,
    pub symbol: Option<String>,
    pub side: Option<TradeSide>,
    pub volume: Option<f64>,
    pub entry_price: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
}

/// Retrying, cache-warming reader of terminal history.
pub struct HistoryFetcher {
    config: GatewayConfig,
    last_warmup: Option<Instant>,
}

impl HistoryFetcher {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            last_warmup: None,
        }
    }

    // -------------------------------------------------------------------------
    // Cache warming
    // -------------------------------------------------------------------------

    /// Force the terminal to refresh its history cache with a wide-range
    /// query, then give it a moment to settle. Throttled; errors are logged
    /// and swallowed because warming is best-effort.
    pub fn warm_history_cache(&mut self, terminal: &dyn Terminal) {
        if let Some(last) = self.last_warmup {
            if last.elapsed() < self.config.warmup_interval() {
                return;
            }
        }

        let now = Utc::now();
        let from = now - Duration::days(self.config.warmup_range_days);

        match terminal.history_deals_get(from, now) {
            Ok(deals) => {
                if deals.is_empty() {
                    warn!("history warmup returned no deals");
                } else {
                    debug!(count = deals.len(), "history cache warmed");
                }
                self.last_warmup = Some(Instant::now());
                std::thread::sleep(self.config.warmup_settle());
            }
            Err(error) => {
                warn!(error = %error, "history cache warmup failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Closed-position lookup
    // -------------------------------------------------------------------------

    /// Reconstruct the closed position `ticket` from history.
    ///
    /// Tries the deals source first, then the orders fallback, retrying with
    /// progressive backoff. Returns `None` once every attempt is exhausted;
    /// the caller must keep the ticket in its snapshot so the next poll cycle
    /// retries.
    pub fn get_closed_position_data(
        &mut self,
        terminal: &dyn Terminal,
        ticket: u64,
    ) -> Option<FetchedTrade> {
        let max_retries = self.config.max_retries;

        for attempt in 1..=max_retries {
            debug!(ticket, attempt, max_retries, "fetching closed position history");

            self.warm_history_cache(terminal);

            match self.fetch_from_deals(terminal, ticket) {
                Ok(Some(trade)) => {
                    info!(ticket, source = %trade.source, "closed position found in deal history");
                    return Some(trade);
                }
                Ok(None) => {}
                Err(error) => warn!(ticket, error = %error, "deal history query failed"),
            }

            match self.fetch_from_orders(terminal, ticket) {
                Ok(Some(trade)) => {
                    info!(ticket, source = %trade.source, "closed position found in order history");
                    return Some(trade);
                }
                Ok(None) => {}
                Err(error) => warn!(ticket, error = %error, "order history query failed"),
            }

            if attempt < max_retries {
                let backoff = self.config.retry_backoff(attempt);
                debug!(ticket, backoff_ms = backoff.as_millis() as u64, "history not synced yet, backing off");
                std::thread::sleep(backoff);
            }
        }

        error!(ticket, max_retries, "no history found for closed position");
        None
    }

    /// Preferred source: the closing deal plus, when available, the opening
    /// deal. Requires the exit deal; without it the trade has not surfaced
    /// yet and the source reports a miss.
    fn fetch_from_deals(
        &self,
        terminal: &dyn Terminal,
        ticket: u64,
    ) -> Result<Option<FetchedTrade>, DriverError> {
        let now = Utc::now();
        let window_start = now - Duration::minutes(self.config.deals_window_mins);

        let deals = terminal.history_deals_get(window_start, now)?;

        let mut entry_deal: Option<Deal> = None;
        let mut exit_deal: Option<Deal> = None;
        for deal in deals {
            if deal.position_id != ticket {
                continue;
            }
            match deal.entry {
                DealEntry::In => entry_deal = Some(deal),
                DealEntry::Out => exit_deal = Some(deal),
                _ => {}
            }
        }

        let Some(exit_deal) = exit_deal else {
            return Ok(None);
        };

        // The position may have been opened well before the recent window;
        // look for its entry deal further back.
        if entry_deal.is_none() {
            let older_from = now - Duration::days(self.config.entry_backfill_days);
            entry_deal = terminal
                .history_deals_get(older_from, window_start)?
                .into_iter()
                .find(|d| d.position_id == ticket && d.entry == DealEntry::In);
        }

        let mut trade = FetchedTrade {
            source: TradeSource::HistoryDeals,
            symbol: Some(exit_deal.symbol.clone()),
            side: None,
            volume: Some(exit_deal.volume),
            entry_price: None,
            entry_time: None,
            exit_price: exit_deal.price,
            exit_time: timestamp(exit_deal.time),
            profit: exit_deal.profit,
            commission: exit_deal.commission,
            swap: exit_deal.swap,
            sl: None,
            tp: None,
        };

        if let Some(entry) = entry_deal {
            trade.entry_price = Some(entry.price);
            trade.entry_time = Some(timestamp(entry.time));
            trade.commission += entry.commission;
            trade.side = entry.kind.side();
        }

        let (sl, tp) = self.sl_tp_from_orders(terminal, ticket);
        trade.sl = sl;
        trade.tp = tp;

        Ok(Some(trade))
    }

    /// Fallback source: the order that closed the position. Exit price/time
    /// and sl/tp come from the order; the financials still come from whatever
    /// deals are visible, because deals are authoritative when present.
    fn fetch_from_orders(
        &self,
        terminal: &dyn Terminal,
        ticket: u64,
    ) -> Result<Option<FetchedTrade>, DriverError> {
        let now = Utc::now();
        let window_start = now - Duration::minutes(self.config.deals_window_mins);

        let orders = terminal.history_orders_get(window_start, now)?;
        let Some(order) = orders.into_iter().find(|o| o.position_id == ticket) else {
            return Ok(None);
        };

        let mut profit = 0.0;
        let mut commission = 0.0;
        let mut swap = 0.0;
        for deal in terminal.history_deals_get(window_start, now)? {
            if deal.position_id == ticket {
                profit += deal.profit;
                commission += deal.commission;
                swap += deal.swap;
            }
        }

        Ok(Some(FetchedTrade {
            source: TradeSource::HistoryOrders,
            symbol: Some(order.symbol.clone()),
            side: None,
            volume: None,
            entry_price: None,
            entry_time: None,
            exit_price: order.price_current,
            exit_time: timestamp(order.time_done),
            profit,
            commission,
            swap,
            sl: (order.sl > 0.0).then_some(order.sl),
            tp: (order.tp > 0.0).then_some(order.tp),
        }))
    }

    /// Recover sl/tp intent from recent order history. Best-effort; errors
    /// and misses both yield unset values.
    fn sl_tp_from_orders(&self, terminal: &dyn Terminal, ticket: u64) -> (Option<f64>, Option<f64>) {
        let now = Utc::now();
        let from = now - Duration::hours(self.config.sltp_scan_hours);

        match terminal.history_orders_get(from, now) {
            Ok(orders) => orders
                .iter()
                .find(|o| o.position_id == ticket)
                .map(|o| ((o.sl > 0.0).then_some(o.sl), (o.tp > 0.0).then_some(o.tp)))
                .unwrap_or((None, None)),
            Err(error) => {
                warn!(ticket, error = %error, "sl/tp order scan failed");
                (None, None)
            }
        }
    }
}

fn timestamp(unix_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(unix_secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{DealKind, HistoryOrder, SimTerminal};

    /// Millisecond-scale timings so retry paths run fast.
    fn fast_config() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.warmup_settle_ms = 1;
        cfg.retry_backoff_ms = 1;
        // Long enough that one test never warms twice.
        cfg.warmup_interval_secs = 300;
        cfg
    }

    fn deal(
        position_id: u64,
        entry: DealEntry,
        kind: DealKind,
        price: f64,
        age_mins: i64,
        profit: f64,
        commission: f64,
        swap: f64,
    ) -> Deal {
        Deal {
            ticket: position_id * 100 + if entry == DealEntry::In { 1 } else { 2 },
            order: position_id * 10,
            position_id,
            symbol: "EURUSD".into(),
            kind,
            entry,
            volume: 0.1,
            price,
            time: (Utc::now() - Duration::minutes(age_mins)).timestamp(),
            profit,
            commission,
            swap,
            comment: String::new(),
        }
    }

    fn order(position_id: u64, sl: f64, tp: f64, price_current: f64, age_mins: i64) -> HistoryOrder {
        HistoryOrder {
            ticket: position_id * 1000,
            position_id,
            symbol: "EURUSD".into(),
            sl,
            tp,
            price_current,
            time_done: (Utc::now() - Duration::minutes(age_mins)).timestamp(),
        }
    }

    #[test]
    fn deals_source_preferred_with_full_detail() {
        let sim = SimTerminal::new();
        sim.push_deal(deal(1, DealEntry::In, DealKind::Buy, 1.1000, 10, 0.0, -0.5, 0.0));
        sim.push_deal(deal(1, DealEntry::Out, DealKind::Sell, 1.1020, 2, 20.0, -0.5, -0.1));
        sim.push_order(order(1, 1.0980, 1.1050, 1.1020, 2));

        let mut fetcher = HistoryFetcher::new(fast_config());
        let trade = fetcher.get_closed_position_data(&sim, 1).unwrap();

        assert_eq!(trade.source, TradeSource::HistoryDeals);
        assert_eq!(trade.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(trade.side, Some(TradeSide::Buy));
        assert_eq!(trade.entry_price, Some(1.1000));
        assert_eq!(trade.exit_price, 1.1020);
        assert_eq!(trade.profit, 20.0);
        // Entry commission added to the exit deal's.
        assert!((trade.commission + 1.0).abs() < 1e-9);
        assert_eq!(trade.swap, -0.1);
        assert_eq!(trade.sl, Some(1.0980));
        assert_eq!(trade.tp, Some(1.1050));
    }

    #[test]
    fn entry_deal_found_via_backfill_window() {
        let sim = SimTerminal::new();
        // Entry two days old, outside the 30-minute window.
        sim.push_deal(deal(2, DealEntry::In, DealKind::Sell, 1.2000, 60 * 48, 0.0, -0.7, 0.0));
        sim.push_deal(deal(2, DealEntry::Out, DealKind::Buy, 1.1950, 5, 50.0, -0.7, -0.2));

        let mut fetcher = HistoryFetcher::new(fast_config());
        let trade = fetcher.get_closed_position_data(&sim, 2).unwrap();

        assert_eq!(trade.side, Some(TradeSide::Sell));
        assert_eq!(trade.entry_price, Some(1.2000));
        assert!((trade.commission + 1.4).abs() < 1e-9);
    }

    #[test]
    fn exit_without_entry_still_returns_exit_data() {
        let sim = SimTerminal::new();
        sim.push_deal(deal(3, DealEntry::Out, DealKind::Sell, 1.3000, 1, -5.0, -0.3, 0.0));

        let mut fetcher = HistoryFetcher::new(fast_config());
        let trade = fetcher.get_closed_position_data(&sim, 3).unwrap();

        assert_eq!(trade.source, TradeSource::HistoryDeals);
        assert!(trade.entry_price.is_none());
        assert!(trade.side.is_none());
        assert_eq!(trade.exit_price, 1.3000);
    }

    #[test]
    fn orders_fallback_sums_financials_from_deals() {
        let sim = SimTerminal::new();
        // No OUT deal visible, but the closing order and an IN deal are.
        sim.push_deal(deal(4, DealEntry::In, DealKind::Buy, 1.1000, 10, 0.0, -0.5, 0.0));
        sim.push_order(order(4, 1.0900, 0.0, 1.1100, 1));

        let mut fetcher = HistoryFetcher::new(fast_config());
        let trade = fetcher.get_closed_position_data(&sim, 4).unwrap();

        assert_eq!(trade.source, TradeSource::HistoryOrders);
        assert_eq!(trade.exit_price, 1.1100);
        assert_eq!(trade.commission, -0.5);
        assert_eq!(trade.sl, Some(1.0900));
        assert_eq!(trade.tp, None);
        assert!(trade.volume.is_none());
    }

    #[test]
    fn succeeds_on_second_attempt_after_history_sync() {
        let sim = SimTerminal::new();
        sim.push_deal(deal(5, DealEntry::In, DealKind::Buy, 1.1000, 10, 0.0, -0.5, 0.0));
        sim.push_deal(deal(5, DealEntry::Out, DealKind::Sell, 1.1010, 1, 10.0, -0.5, 0.0));
        // Attempt 1 sees nothing (warmup query + recent window query), the
        // retry's recent query is the third and succeeds.
        sim.hide_deals_for(2);

        let mut fetcher = HistoryFetcher::new(fast_config());
        let trade = fetcher.get_closed_position_data(&sim, 5).unwrap();
        assert_eq!(trade.source, TradeSource::HistoryDeals);
        assert_eq!(trade.profit, 10.0);
    }

    #[test]
    fn returns_none_after_exhausting_retries() {
        let sim = SimTerminal::new();
        // History never contains the position at all.
        let mut fetcher = HistoryFetcher::new(fast_config());
        assert!(fetcher.get_closed_position_data(&sim, 99).is_none());
    }

    #[test]
    fn warmup_is_throttled_within_interval() {
        let sim = SimTerminal::new();
        sim.push_deal(deal(6, DealEntry::In, DealKind::Buy, 1.0, 10, 0.0, 0.0, 0.0));
        sim.push_deal(deal(6, DealEntry::Out, DealKind::Sell, 1.0, 1, 0.0, 0.0, 0.0));

        let mut fetcher = HistoryFetcher::new(fast_config());
        fetcher.get_closed_position_data(&sim, 6).unwrap();
        let after_first = sim.deals_calls();

        // Second lookup inside the warmup interval: no second warmup query,
        // only the recent-window query runs.
        fetcher.get_closed_position_data(&sim, 6).unwrap();
        assert_eq!(sim.deals_calls(), after_first + 1);
    }
}
