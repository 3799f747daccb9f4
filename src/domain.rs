// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side { pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } } }

/// Order size: share count or dollar amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sizing { Qty(f64), Notional(f64) }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrderType {
    Market,
    Limit { limit_price: f64 },
    TrailingStop { trail_percent: f64 },
}
impl OrderType {
    pub fn label(&self) -> &'static str {
        match self { OrderType::Market => "market", OrderType::Limit { .. } => "limit", OrderType::TrailingStop { .. } => "trailing_stop" }
    }
}

/// Value object handed to the broker, one per submission. Symbol is in broker notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest { pub symbol: String, pub side: Side, pub sizing: Sizing, pub order_type: OrderType }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { New, Accepted, PartiallyFilled, Filled, Canceled, Expired, Rejected, Pending }
impl OrderStatus {
    /// Final broker states; nothing else happens to the order after these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected)
    }

    pub fn parse(s: &str) -> OrderStatus {
        match s.to_ascii_lowercase().as_str() {
            "new" => OrderStatus::New,
            "accepted" => OrderStatus::Accepted,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            // pending_new, pending_cancel, held, calculated, ...
            _ => OrderStatus::Pending,
        }
    }
}

/// One order from the broker's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub filled_avg_price: f64,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
impl HistoricalOrder {
    pub fn is_fill(&self) -> bool { self.status == OrderStatus::Filled && self.filled_qty > 0.0 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
}
impl Position {
    /// Unrealized gain in percent of the entry price.
    pub fn gain_pct(&self) -> f64 {
        if self.avg_entry_price <= 0.0 { return 0.0; }
        (self.current_price - self.avg_entry_price) / self.avg_entry_price * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountSnapshot { pub portfolio_value: f64, pub cash: f64 }

/// Screener output, read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSymbol {
    pub symbol: String,
    pub core_score: f64,
    pub quality_score: f64,
    pub growth_score: f64,
    #[serde(default)]
    pub sector: Option<String>,
}
impl ScoredSymbol {
    pub fn has_positive_fundamentals(&self) -> bool { self.quality_score > 0.0 && self.growth_score > 0.0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot { pub symbol: String, pub qty: f64, pub price: f64, pub acquired_at: DateTime<Utc> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedTrade {
    pub symbol: String,
    pub qty_sold: f64,
    pub sell_price: f64,
    pub cost_basis_per_share: f64,
    pub gain_loss: f64,
    pub sold_at: DateTime<Utc>,
}

/// Idempotency key for one submission; reused on every retry of that submission.
pub fn new_client_order_id() -> String {
    format!("RB-{}-{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>())
}

/// Journal entries written by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Realized(RealizedTrade),
    State(String),
    Submitted { order_id: String, client_order_id: String, request: OrderRequest },
    Planned(OrderRequest),
    Failed { symbol: String, reason: String },
    Note(String),
}
