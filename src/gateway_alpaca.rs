// ===============================
// src/gateway_alpaca.rs
// ===============================
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;

use crate::alpaca::{num, num_or_zero, AccountResp, LatestTradeResp, NewOrder, OrderResp, PositionResp};
use crate::config::AlpacaCfg;
use crate::domain::{AccountSnapshot, HistoricalOrder, OrderRequest, OrderStatus, Position, Side};
use crate::gateway::{Broker, BrokerError};

/// Alpaca trading + market data (REST v2). Header auth, no request signing.
pub struct AlpacaBroker {
    http: reqwest::Client,
    cfg: AlpacaCfg,
}

impl AlpacaBroker {
    pub fn new(cfg: AlpacaCfg) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    fn auth(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("APCA-API-KEY-ID", &self.cfg.api_key)
            .header("APCA-API-SECRET-KEY", &self.cfg.api_secret)
    }

    async fn send<T: DeserializeOwned>(&self, rb: reqwest::RequestBuilder) -> Result<T, BrokerError> {
        let rsp = self.auth(rb).send().await.map_err(|e| BrokerError::Transport(e.to_string()))?;
        let code = rsp.status();
        if code.as_u16() == 404 {
            let body = rsp.text().await.unwrap_or_default();
            return Err(BrokerError::NotFound(body));
        }
        if !code.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            tracing::error!(%code, %body, "alpaca request failed");
            return Err(BrokerError::Status { code: code.as_u16(), body });
        }
        rsp.json::<T>().await.map_err(|e| BrokerError::Decode(e.to_string()))
    }

    fn trading(&self, path: &str) -> String {
        format!("{}{}", self.cfg.trading_url.trim_end_matches('/'), path)
    }
}

// Fill fields may be null on orders that never traded; a fill needs its price.
fn to_historical(o: OrderResp) -> Result<HistoricalOrder, BrokerError> {
    let filled_qty = num_or_zero("filled_qty", &o.filled_qty)?;
    let filled_avg_price = if filled_qty > 0.0 {
        num("filled_avg_price", &o.filled_avg_price)?
    } else {
        num_or_zero("filled_avg_price", &o.filled_avg_price)?
    };
    Ok(HistoricalOrder {
        side: if o.side.eq_ignore_ascii_case("sell") { Side::Sell } else { Side::Buy },
        status: OrderStatus::parse(&o.status),
        filled_qty,
        filled_avg_price,
        submitted_at: o.submitted_at.unwrap_or(o.created_at),
        created_at: o.created_at,
        id: o.id,
        symbol: o.symbol,
    })
}

fn to_position(p: PositionResp) -> Result<Position, BrokerError> {
    Ok(Position {
        qty: num("qty", &p.qty)?,
        avg_entry_price: num("avg_entry_price", &p.avg_entry_price)?,
        current_price: num("current_price", &p.current_price)?,
        market_value: num("market_value", &p.market_value)?,
        symbol: p.symbol,
    })
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn submit_order(&self, client_order_id: &str, req: &OrderRequest) -> Result<String, BrokerError> {
        let body = NewOrder::from_request(req, client_order_id);
        tracing::debug!(?body, "submitting order");
        match self.send::<OrderResp>(self.http.post(self.trading("/v2/orders")).json(&body)).await {
            Ok(o) => Ok(o.id),
            // 422 on a retry: the first attempt was booked but its ack was lost
            Err(BrokerError::Status { code: 422, body }) => {
                let url = self.trading(&format!(
                    "/v2/orders:by_client_order_id?client_order_id={}",
                    urlencoding::encode(client_order_id)
                ));
                match self.send::<OrderResp>(self.http.get(url)).await {
                    Ok(o) => {
                        tracing::warn!(client_order_id, order_id = %o.id, "order already booked, reusing it");
                        Ok(o.id)
                    }
                    Err(BrokerError::NotFound(_)) => Err(BrokerError::Status { code: 422, body }),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let url = self.trading(&format!("/v2/orders/{}", urlencoding::encode(order_id)));
        let o: OrderResp = self.send(self.http.get(url)).await?;
        Ok(OrderStatus::parse(&o.status))
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let rows: Vec<PositionResp> = self.send(self.http.get(self.trading("/v2/positions"))).await?;
        rows.into_iter().map(to_position).collect()
    }

    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        let a: AccountResp = self.send(self.http.get(self.trading("/v2/account"))).await?;
        Ok(AccountSnapshot {
            portfolio_value: num("portfolio_value", &a.portfolio_value)?,
            cash: num("cash", &a.cash)?,
        })
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let url = format!(
            "{}/v2/stocks/{}/trades/latest",
            self.cfg.data_url.trim_end_matches('/'),
            urlencoding::encode(symbol)
        );
        let t: LatestTradeResp = self.send(self.http.get(url)).await?;
        Ok(t.trade.price)
    }

    async fn order_history(&self, after: DateTime<Utc>, limit: usize) -> Result<Vec<HistoricalOrder>, BrokerError> {
        let after = after.to_rfc3339_opts(SecondsFormat::Micros, true);
        let url = self.trading(&format!(
            "/v2/orders?status=all&direction=asc&limit={}&after={}",
            limit,
            urlencoding::encode(&after)
        ));
        let rows: Vec<OrderResp> = self.send(self.http.get(url)).await?;
        rows.into_iter().map(to_historical).collect()
    }
}
