// =============================================================================
// Position snapshots — per-user basis for closure detection
// =============================================================================
//
// The worker records what it saw open for each user; a ticket present in the
// previous snapshot but absent from the current one has closed since the last
// poll. Only the worker mutates the store, so no locking lives here.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::terminal::RawPosition;
use crate::types::{PositionInfo, TradeSide};

/// Last-observed state of one open position.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub price_open: f64,
    pub price_current: f64,
    /// Zero means unset.
    pub sl: f64,
    /// Zero means unset.
    pub tp: f64,
    pub profit: f64,
    pub swap: f64,
    pub open_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn from_raw(position: &RawPosition) -> Self {
        Self {
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            side: position.side,
            volume: position.volume,
            price_open: position.price_open,
            price_current: position.price_current,
            sl: position.sl,
            tp: position.tp,
            profit: position.profit,
            swap: position.swap,
            open_time: DateTime::from_timestamp(position.time, 0).unwrap_or(DateTime::UNIX_EPOCH),
            last_seen: Utc::now(),
        }
    }

    /// Wire representation: zero sl/tp become null, time becomes ISO-8601.
    pub fn to_info(&self) -> PositionInfo {
        PositionInfo {
            ticket: self.ticket,
            symbol: self.symbol.clone(),
            side: self.side,
            volume: self.volume,
            price_open: self.price_open,
            price_current: self.price_current,
            sl: (self.sl > 0.0).then_some(self.sl),
            tp: (self.tp > 0.0).then_some(self.tp),
            profit: self.profit,
            swap: self.swap,
            time: self.open_time.to_rfc3339(),
        }
    }
}

/// Per-user map from open position ticket to its last-observed snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    users: HashMap<String, HashMap<u64, PositionSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The previous snapshot map for a user; empty if never polled.
    pub fn previous(&self, user_id: &str) -> HashMap<u64, PositionSnapshot> {
        self.users.get(user_id).cloned().unwrap_or_default()
    }

    /// Tickets present in `previous` but missing from `current`: the
    /// positions that closed since the last poll.
    pub fn closed_tickets(
        previous: &HashMap<u64, PositionSnapshot>,
        current: &HashMap<u64, PositionSnapshot>,
    ) -> Vec<u64> {
        let current_keys: HashSet<u64> = current.keys().copied().collect();
        previous
            .keys()
            .copied()
            .filter(|ticket| !current_keys.contains(ticket))
            .collect()
    }

    /// Install the freshly observed map for a user, carrying over snapshots
    /// for `retained` tickets (closures whose history fetch failed this
    /// cycle; keeping them means they are re-detected and retried next poll).
    pub fn install(
        &mut self,
        user_id: &str,
        mut current: HashMap<u64, PositionSnapshot>,
        retained: &[u64],
        previous: &HashMap<u64, PositionSnapshot>,
    ) {
        for ticket in retained {
            if let Some(snapshot) = previous.get(ticket) {
                current.insert(*ticket, snapshot.clone());
            }
        }
        self.users.insert(user_id.to_string(), current);
    }

    /// Number of tickets currently tracked for a user.
    pub fn tracked(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, HashMap::len)
    }
}

// =============================================================================
// Tests
// =============================================================================
