// ===============================
// src/gateway.rs (broker seam + paper broker)
// ===============================
//
// `Broker` is the only thing the orchestrator knows about execution.
// Adapters:
// - PaperBroker  : in-memory, orders ACK then fill after N status polls
// - AlpacaBroker : REST v2 (see gateway_alpaca.rs)
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::domain::{AccountSnapshot, HistoricalOrder, OrderRequest, OrderStatus, Position, Side, Sizing};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("http {code}: {body}")]
    Status { code: u16, body: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl BrokerError {
    /// Worth retrying: connection trouble, throttling, server side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Transport(_) => true,
            BrokerError::Status { code, .. } => *code == 429 || *code >= 500,
            BrokerError::Decode(_) | BrokerError::NotFound(_) => false,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Submitting the same `client_order_id` twice must not create a second order.
    async fn submit_order(&self, client_order_id: &str, req: &OrderRequest) -> Result<String, BrokerError>;
    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError>;
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;
    async fn account(&self) -> Result<AccountSnapshot, BrokerError>;
    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError>;
    /// Orders submitted after `after`, ascending, at most `limit`.
    async fn order_history(&self, after: DateTime<Utc>, limit: usize) -> Result<Vec<HistoricalOrder>, BrokerError>;
}

/// Seed state for the paper broker (`paper_state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperSnapshot {
    #[serde(default)]
    pub account: AccountSnapshot,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub prices: std::collections::HashMap<String, f64>,
    #[serde(default)]
    pub history: Vec<HistoricalOrder>,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    client_order_id: String,
    req: OrderRequest,
    status: OrderStatus,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct PaperState {
    account: AccountSnapshot,
    positions: Vec<Position>,
    prices: HashMap<String, f64>,
    history: Vec<HistoricalOrder>,
    orders: Vec<PaperOrder>,
    reject_symbols: Vec<String>,
    transient_failures: HashMap<&'static str, u32>,
    lost_acks: u32,
    buys_while_sells_open: u32,
    seq: u64,
}

impl PaperState {
    fn take_failure(&mut self, op: &'static str) -> Result<(), BrokerError> {
        if let Some(n) = self.transient_failures.get_mut(op) {
            if *n > 0 {
                *n -= 1;
                return Err(BrokerError::Transport(format!("injected {op} failure")));
            }
        }
        Ok(())
    }
}

pub struct PaperBroker {
    fill_after_polls: u32,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(snapshot: PaperSnapshot, fill_after_polls: u32) -> Self {
        let state = PaperState {
            account: snapshot.account,
            positions: snapshot.positions,
            prices: snapshot.prices.into_iter().collect(),
            history: snapshot.history,
            ..Default::default()
        };
        Self { fill_after_polls, state: Mutex::new(state) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // a panicked test thread must not hide the state from the rest of the run
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Orders for `symbol` are rejected with HTTP 422.
    pub fn reject_symbol(&self, symbol: &str) {
        self.lock().reject_symbols.push(symbol.to_string());
    }

    /// The next `n` accepted orders are booked but answered with a transport error,
    /// like a response lost to a timeout.
    pub fn lose_next_acks(&self, n: u32) {
        self.lock().lost_acks = n;
    }

    /// The next `n` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.lock().transient_failures.insert(op, n);
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.lock().orders.iter().map(|o| o.req.clone()).collect()
    }

    /// Buy submissions seen while at least one sell was still open.
    pub fn buys_while_sells_open(&self) -> u32 {
        self.lock().buys_while_sells_open
    }

    /// Force a status, e.g. to cancel an order from a test.
    pub fn set_status(&self, order_id: &str, status: OrderStatus) {
        let mut st = self.lock();
        if let Some(o) = st.orders.iter_mut().find(|o| o.id == order_id) {
            o.status = status;
        }
    }

    pub fn order_ids(&self, side: Side) -> Vec<String> {
        self.lock().orders.iter().filter(|o| o.req.side == side).map(|o| o.id.clone()).collect()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_order(&self, client_order_id: &str, req: &OrderRequest) -> Result<String, BrokerError> {
        let mut st = self.lock();
        st.take_failure("submit_order")?;
        if let Some(o) = st.orders.iter().find(|o| o.client_order_id == client_order_id) {
            debug!(id = %o.id, %client_order_id, "duplicate client order id, returning existing order");
            return Ok(o.id.clone());
        }
        if st.reject_symbols.contains(&req.symbol) {
            return Err(BrokerError::Status { code: 422, body: format!("{} not tradable", req.symbol) });
        }
        if req.side == Side::Buy && st.orders.iter().any(|o| o.req.side == Side::Sell && !o.status.is_terminal()) {
            st.buys_while_sells_open += 1;
        }
        st.seq += 1;
        let id = format!("PAPER-{}", st.seq);
        let fill_after = self.fill_after_polls;
        let status = if fill_after == 0 { OrderStatus::Filled } else { OrderStatus::Accepted };
        st.orders.push(PaperOrder {
            id: id.clone(),
            client_order_id: client_order_id.to_string(),
            req: req.clone(),
            status,
            polls_left: fill_after,
        });
        debug!(%id, symbol = %req.symbol, side = req.side.as_str(), "paper order accepted");
        if st.lost_acks > 0 {
            st.lost_acks -= 1;
            return Err(BrokerError::Transport("timeout waiting for order ack".into()));
        }
        Ok(id)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let mut st = self.lock();
        st.take_failure("order_status")?;
        let price_of = |sym: &str, prices: &HashMap<String, f64>| prices.get(sym).copied().unwrap_or(0.0);
        let prices = st.prices.clone();
        let now = Utc::now();

        let Some(o) = st.orders.iter_mut().find(|o| o.id == order_id) else {
            return Err(BrokerError::NotFound(order_id.to_string()));
        };
        if o.status.is_terminal() {
            return Ok(o.status);
        }
        o.polls_left = o.polls_left.saturating_sub(1);
        if o.polls_left > 0 {
            return Ok(o.status);
        }
        o.status = OrderStatus::Filled;
        let px = price_of(&o.req.symbol, &prices);
        let qty = match o.req.sizing {
            Sizing::Qty(q) => q,
            Sizing::Notional(n) if px > 0.0 => n / px,
            Sizing::Notional(_) => 0.0,
        };
        let fill = HistoricalOrder {
            id: o.id.clone(),
            symbol: o.req.symbol.clone(),
            side: o.req.side,
            status: OrderStatus::Filled,
            filled_qty: qty,
            filled_avg_price: px,
            submitted_at: now,
            created_at: now,
        };
        st.history.push(fill);
        Ok(OrderStatus::Filled)
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let mut st = self.lock();
        st.take_failure("positions")?;
        Ok(st.positions.clone())
    }

    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        let mut st = self.lock();
        st.take_failure("account")?;
        Ok(st.account)
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let mut st = self.lock();
        st.take_failure("latest_price")?;
        if let Some(px) = st.prices.get(symbol) {
            return Ok(*px);
        }
        st.positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.current_price)
            .ok_or_else(|| BrokerError::NotFound(format!("no price for {symbol}")))
    }

    async fn order_history(&self, after: DateTime<Utc>, limit: usize) -> Result<Vec<HistoricalOrder>, BrokerError> {
        let mut st = self.lock();
        st.take_failure("order_history")?;
        let mut out: Vec<HistoricalOrder> = st.history.iter().filter(|o| o.submitted_at > after).cloned().collect();
        out.sort_by_key(|o| o.submitted_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderType;

    fn sell(sym: &str) -> OrderRequest {
        OrderRequest { symbol: sym.into(), side: Side::Sell, sizing: Sizing::Qty(1.0), order_type: OrderType::Market }
    }

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Transport("reset".into()).is_transient());
        assert!(BrokerError::Status { code: 503, body: String::new() }.is_transient());
        assert!(BrokerError::Status { code: 429, body: String::new() }.is_transient());
        assert!(!BrokerError::Status { code: 422, body: String::new() }.is_transient());
        assert!(!BrokerError::Decode("x".into()).is_transient());
    }

    #[tokio::test]
    async fn paper_order_fills_after_polls() {
        let b = PaperBroker::new(PaperSnapshot::default(), 2);
        let id = b.submit_order("c1", &sell("AAPL")).await.unwrap();
        assert_eq!(b.order_status(&id).await.unwrap(), OrderStatus::Accepted);
        assert_eq!(b.order_status(&id).await.unwrap(), OrderStatus::Filled);
        assert_eq!(b.order_status(&id).await.unwrap(), OrderStatus::Filled);
    }

    #[tokio::test]
    async fn paper_rejects_and_injects_failures() {
        let b = PaperBroker::new(PaperSnapshot::default(), 1);
        b.reject_symbol("BAD");
        assert!(b.submit_order("c1", &sell("BAD")).await.is_err());
        b.fail_next("positions", 1);
        assert!(b.positions().await.is_err());
        assert!(b.positions().await.is_ok());
        assert!(matches!(b.order_status("nope").await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn same_client_order_id_books_once() {
        let b = PaperBroker::new(PaperSnapshot::default(), 1);
        b.lose_next_acks(1);
        assert!(matches!(b.submit_order("c1", &sell("AAPL")).await, Err(BrokerError::Transport(_))));
        let id = b.submit_order("c1", &sell("AAPL")).await.unwrap();
        assert_eq!(b.submitted().len(), 1);
        assert_eq!(b.order_ids(Side::Sell), vec![id]);

        b.submit_order("c2", &sell("AAPL")).await.unwrap();
        assert_eq!(b.submitted().len(), 2);
    }
}
