// =============================================================================
// Shared types used across the MT5 gateway
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Which history source a closed trade was reconstructed from.
///
/// Deals carry the realized financials and are preferred; orders are the
/// fallback when the closing deal has not surfaced in the terminal cache yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSource {
    HistoryDeals,
    HistoryOrders,
}

impl TradeSource {
    /// Data accuracy grade reported downstream for this source.
    pub fn accuracy(&self) -> &'static str {
        match self {
            Self::HistoryDeals => "100%",
            Self::HistoryOrders => "95-100%",
        }
    }
}

impl std::fmt::Display for TradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HistoryDeals => write!(f, "history_deals"),
            Self::HistoryOrders => write!(f, "history_orders"),
        }
    }
}

/// Terminal login credentials. Supplied per request and never persisted.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub login: i64,
    pub password: String,
    pub server: String,
}

impl Credentials {
    /// Connection identifier in `login@server` form, used as the default
    /// per-user key for caching and snapshot tracking.
    pub fn connection_id(&self) -> String {
        format!("{}@{}", self.login, self.server)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

/// An open position as served to API consumers.
///
/// `sl` and `tp` are `None` when the terminal reports them as zero (unset).
/// `time` is the position open time in ISO-8601.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: f64,
    pub price_open: f64,
    pub price_current: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub profit: f64,
    pub swap: f64,
    pub time: String,
}

/// Account state as reported by the terminal after a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub login: i64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub currency: String,
    pub leverage: i64,
    pub profit: f64,
    pub company: String,
}

/// A completed trade reconstructed by grouping history deals, as returned by
/// the trade-history endpoint. Entry deal first, exit deal last; financials
/// are summed across every deal in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Ticket of the entry deal, used as the trade identifier.
    pub ticket: u64,
    /// Position id the deals were grouped by.
    pub position_id: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: f64,
    pub entry_price: f64,
    pub entry_time: String,
    pub exit_price: f64,
    pub exit_time: String,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub comment: String,
}

/// A closed trade with quantitatively accurate financial fields, emitted on
/// the trade-closed event channel exactly once per detected closure.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    /// Stable external identifier derived from the position ticket
    /// (`mt5_<ticket>`). Consumers are expected to be idempotent on it.
    pub external_id: String,
    pub user_id: String,
    pub account_id: Option<String>,

    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,

    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,

    pub gross_pnl: f64,
    pub commission: f64,
    pub swap: f64,
    /// Always `gross_pnl + commission + swap`, unrounded.
    pub net_pnl: f64,

    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub status: &'static str,
    pub source: TradeSource,
    pub accuracy: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_multiple: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_reward: Option<f64>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TradeSide::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&TradeSide::Sell).unwrap(), "\"sell\"");
    }

    #[test]
    fn source_accuracy_grades() {
        assert_eq!(TradeSource::HistoryDeals.accuracy(), "100%");
        assert_eq!(TradeSource::HistoryOrders.accuracy(), "95-100%");
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            login: 12345,
            password: "hunter2".into(),
            server: "Demo-Server".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn connection_id_format() {
        let creds = Credentials {
            login: 777,
            password: String::new(),
            server: "Broker-Live".into(),
        };
        assert_eq!(creds.connection_id(), "777@Broker-Live");
    }

    #[test]
    fn position_info_serializes_type_field() {
        let info = PositionInfo {
            ticket: 1,
            symbol: "EURUSD".into(),
            side: TradeSide::Buy,
            volume: 0.1,
            price_open: 1.1,
            price_current: 1.101,
            sl: None,
            tp: Some(1.105),
            profit: 1.0,
            swap: 0.0,
            time: "2026-01-01T00:00:00+00:00".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "buy");
        assert!(json["sl"].is_null());
        assert_eq!(json["tp"], 1.105);
    }
}
