// =============================================================================
// Simulated terminal — in-memory MT5 session for tests and detached runs
// =============================================================================
//
// Stands in for the real terminal when none is attached. The account book
// (positions, deals, orders) is scripted by the caller; history visibility can
// be deferred for a number of queries to reproduce the terminal's lazy
// history cache, which is the behaviour the fetcher's warmup/retry machinery
// exists for.
//
// Counters are plain reads of the scripted state; tests use them to assert
// how many sessions and history queries a scenario actually cost.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::terminal::driver::{
    Deal, DriverError, HistoryOrder, RawAccountInfo, RawPosition, Terminal,
};
use crate::types::Credentials;

#[derive(Debug, Default)]
struct SimState {
    positions: Vec<RawPosition>,
    deals: Vec<Deal>,
    orders: Vec<HistoryOrder>,
    account: Option<RawAccountInfo>,

    /// When false, `login` fails with an authorization error.
    login_ok: bool,
    /// When false, `initialize` fails.
    init_ok: bool,
    /// Number of upcoming deal-history queries that will come back empty,
    /// simulating a history cache that has not synced yet.
    deals_hidden_for: u32,

    login_calls: u64,
    deals_calls: u64,
    orders_calls: u64,
    shutdown_calls: u64,
}

/// Scriptable in-memory terminal.
pub struct SimTerminal {
    state: Mutex<SimState>,
}

impl SimTerminal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                login_ok: true,
                init_ok: true,
                ..SimState::default()
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Scripting surface
    // -------------------------------------------------------------------------

    /// Replace the set of currently open positions.
    pub fn set_positions(&self, positions: Vec<RawPosition>) {
        self.state.lock().positions = positions;
    }

    /// Append a deal to the account history.
    pub fn push_deal(&self, deal: Deal) {
        self.state.lock().deals.push(deal);
    }

    /// Append a historical order.
    pub fn push_order(&self, order: HistoryOrder) {
        self.state.lock().orders.push(order);
    }

    pub fn set_account(&self, account: RawAccountInfo) {
        self.state.lock().account = Some(account);
    }

    pub fn set_login_ok(&self, ok: bool) {
        self.state.lock().login_ok = ok;
    }

    pub fn set_init_ok(&self, ok: bool) {
        self.state.lock().init_ok = ok;
    }

    /// Make the next `n` deal-history queries return nothing, regardless of
    /// what the scripted history contains.
    pub fn hide_deals_for(&self, n: u32) {
        self.state.lock().deals_hidden_for = n;
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    pub fn login_calls(&self) -> u64 {
        self.state.lock().login_calls
    }

    pub fn deals_calls(&self) -> u64 {
        self.state.lock().deals_calls
    }

    pub fn orders_calls(&self) -> u64 {
        self.state.lock().orders_calls
    }

    pub fn shutdown_calls(&self) -> u64 {
        self.state.lock().shutdown_calls
    }
}

impl Default for SimTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal for SimTerminal {
    fn initialize(&self) -> Result<(), DriverError> {
        let state = self.state.lock();
        if state.init_ok {
            Ok(())
        } else {
            Err(DriverError::new(-10003, "IPC initialize failed"))
        }
    }

    fn login(&self, credentials: &Credentials) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.login_calls += 1;
        if state.login_ok {
            Ok(())
        } else {
            Err(DriverError::new(
                -6,
                format!("authorization failed for {}", credentials.login),
            ))
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown_calls += 1;
    }

    fn positions_get(&self) -> Result<Vec<RawPosition>, DriverError> {
        Ok(self.state.lock().positions.clone())
    }

    fn history_deals_get(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DriverError> {
        let mut state = self.state.lock();
        state.deals_calls += 1;

        if state.deals_hidden_for > 0 {
            state.deals_hidden_for -= 1;
            return Ok(Vec::new());
        }

        let (from_ts, to_ts) = (from.timestamp(), to.timestamp());
        Ok(state
            .deals
            .iter()
            .filter(|d| d.time >= from_ts && d.time <= to_ts)
            .cloned()
            .collect())
    }

    fn history_orders_get(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryOrder>, DriverError> {
        let mut state = self.state.lock();
        state.orders_calls += 1;

        let (from_ts, to_ts) = (from.timestamp(), to.timestamp());
        Ok(state
            .orders
            .iter()
            .filter(|o| o.time_done >= from_ts && o.time_done <= to_ts)
            .cloned()
            .collect())
    }

    fn account_info(&self) -> Result<RawAccountInfo, DriverError> {
        let state = self.state.lock();
        state
            .account
            .clone()
            .ok_or_else(|| DriverError::new(-2, "account info not available"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;
    use chrono::Duration;

    fn deal_at(time: DateTime<Utc>) -> Deal {
        Deal {
            ticket: 900,
            order: 10,
            position_id: 1,
            symbol: "EURUSD".into(),
            kind: crate::terminal::driver::DealKind::Buy,
            entry: crate::terminal::driver::DealEntry::In,
            volume: 0.1,
            price: 1.1,
            time: time.timestamp(),
            profit: 0.0,
            commission: -0.5,
            swap: 0.0,
            comment: String::new(),
        }
    }

    #[test]
    fn deals_filtered_by_window() {
        let sim = SimTerminal::new();
        let now = Utc::now();
        sim.push_deal(deal_at(now - Duration::minutes(5)));
        sim.push_deal(deal_at(now - Duration::days(2)));

        let recent = sim
            .history_deals_get(now - Duration::minutes(30), now)
            .unwrap();
        assert_eq!(recent.len(), 1);

        let all = sim.history_deals_get(now - Duration::days(7), now).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn hidden_deals_surface_after_n_queries() {
        let sim = SimTerminal::new();
        let now = Utc::now();
        sim.push_deal(deal_at(now));
        sim.hide_deals_for(2);

        let window = (now - Duration::minutes(30), now);
        assert!(sim.history_deals_get(window.0, window.1).unwrap().is_empty());
        assert!(sim.history_deals_get(window.0, window.1).unwrap().is_empty());
        assert_eq!(sim.history_deals_get(window.0, window.1).unwrap().len(), 1);
    }

    #[test]
    fn login_failure_reports_code_and_login() {
        let sim = SimTerminal::new();
        sim.set_login_ok(false);
        let creds = Credentials {
            login: 42,
            password: "pw".into(),
            server: "S".into(),
        };
        let err = sim.login(&creds).unwrap_err();
        assert_eq!(err.code, -6);
        assert!(err.message.contains("42"));
        assert_eq!(sim.login_calls(), 1);
    }

    #[test]
    fn positions_side_is_preserved() {
        let sim = SimTerminal::new();
        sim.set_positions(vec![RawPosition {
            ticket: 5,
            symbol: "USDJPY".into(),
            side: TradeSide::Sell,
            volume: 1.0,
            price_open: 110.0,
            price_current: 109.8,
            sl: 0.0,
            tp: 0.0,
            profit: 20.0,
            swap: -0.1,
            time: Utc::now().timestamp(),
            comment: String::new(),
        }]);
        let positions = sim.positions_get().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, TradeSide::Sell);
    }
}
