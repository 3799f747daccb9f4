// ===============================
// src/alpaca.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{OrderRequest, OrderType, Side, Sizing};
use crate::gateway::BrokerError;

// Alpaca sends most numbers as JSON strings.
pub fn num(field: &'static str, v: &Option<String>) -> Result<f64, BrokerError> {
    let raw = v.as_deref().ok_or_else(|| BrokerError::Decode(format!("{field}: missing")))?;
    match raw.trim().parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => Err(BrokerError::Decode(format!("{field}: not a number: {raw:?}"))),
    }
}

/// Like `num`, but an absent field is zero (e.g. fill fields of an unfilled order).
pub fn num_or_zero(field: &'static str, v: &Option<String>) -> Result<f64, BrokerError> {
    match v {
        None => Ok(0.0),
        Some(_) => num(field, v),
    }
}

/// Round to cents for price / notional fields.
pub fn cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---- Requests ----
#[derive(Debug, Serialize)]
pub struct NewOrder {
    pub symbol: String,
    pub side: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub time_in_force: &'static str,
    pub client_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_percent: Option<String>,
}

impl NewOrder {
    pub fn from_request(req: &OrderRequest, client_order_id: &str) -> Self {
        let (qty, notional) = match req.sizing {
            // whole shares on limit / trailing orders, fractional allowed on market
            Sizing::Qty(q) => match req.order_type {
                OrderType::Market => (Some(format!("{q}")), None),
                _ => (Some(format!("{}", q.trunc() as i64)), None),
            },
            Sizing::Notional(n) => (None, Some(format!("{:.2}", cents(n)))),
        };
        let (limit_price, trail_percent) = match req.order_type {
            OrderType::Market => (None, None),
            OrderType::Limit { limit_price } => (Some(format!("{:.2}", cents(limit_price))), None),
            OrderType::TrailingStop { trail_percent } => (None, Some(format!("{:.2}", cents(trail_percent)))),
        };
        NewOrder {
            symbol: req.symbol.clone(),
            side: match req.side { Side::Buy => "buy", Side::Sell => "sell" },
            kind: req.order_type.label(),
            time_in_force: "day",
            client_order_id: client_order_id.to_string(),
            qty,
            notional,
            limit_price,
            trail_percent,
        }
    }
}

// ---- Responses ----
#[derive(Debug, Deserialize)]
pub struct OrderResp {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    #[serde(default)]
    pub filled_qty: Option<String>,
    #[serde(default)]
    pub filled_avg_price: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PositionResp {
    pub symbol: String,
    pub qty: Option<String>,
    pub avg_entry_price: Option<String>,
    pub current_price: Option<String>,
    pub market_value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountResp {
    pub portfolio_value: Option<String>,
    pub cash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LatestTradeResp {
    pub trade: TradeResp,
}

#[derive(Debug, Deserialize)]
pub struct TradeResp {
    #[serde(rename = "p")]
    pub price: f64,
}
