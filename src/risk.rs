// ===============================
// src/risk.rs (order sizing & exit policy)
// ===============================
use thiserror::Error;

use crate::alpaca::cents;
use crate::config::RiskCfg;
use crate::domain::{OrderRequest, OrderType, Position, Side, Sizing};

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },
    #[error("invalid quantity {qty} for {symbol}")]
    InvalidQty { symbol: String, qty: f64 },
    #[error("invalid investment amount {amount} for {symbol}")]
    InvalidAmount { symbol: String, amount: f64 },
}

/// How a held position gets closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitMode {
    Liquidate,
    TrailingStop { trail_percent: f64 },
}

/// Trail widens with the gain cushion and with beta, never past the cap.
pub fn trailing_stop_pct(cfg: &RiskCfg, gain_pct: f64, beta: f64) -> f64 {
    let adjusted = cfg.trail_base_pct + gain_pct * cfg.trail_gain_factor + beta * cfg.trail_beta_factor;
    adjusted.min(cfg.trail_cap_pct)
}

pub fn exit_mode(cfg: &RiskCfg, gain_pct: f64, beta: f64) -> ExitMode {
    if gain_pct < cfg.liquidate_below_gain_pct {
        ExitMode::Liquidate
    } else {
        ExitMode::TrailingStop { trail_percent: trailing_stop_pct(cfg, gain_pct, beta) }
    }
}

fn check_price(symbol: &str, price: f64) -> Result<(), RiskError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(RiskError::InvalidPrice { symbol: symbol.to_string(), price });
    }
    Ok(())
}

fn notional(symbol: &str, side: Side, value: f64) -> Option<OrderRequest> {
    let v = cents(value);
    (v > 0.0).then(|| OrderRequest {
        symbol: symbol.to_string(),
        side,
        sizing: Sizing::Notional(v),
        order_type: OrderType::Market,
    })
}

/// Orders that close the whole position: whole shares via limit or trailing
/// stop, the fractional rest as a notional market order.
pub fn exit_orders(cfg: &RiskCfg, pos: &Position, beta: Option<f64>) -> Result<Vec<OrderRequest>, RiskError> {
    check_price(&pos.symbol, pos.current_price)?;
    if !pos.qty.is_finite() || pos.qty <= 0.0 {
        return Err(RiskError::InvalidQty { symbol: pos.symbol.clone(), qty: pos.qty });
    }

    let whole = pos.qty.trunc();
    let frac = pos.qty - whole;
    let mut out = Vec::with_capacity(2);

    if whole >= 1.0 {
        let beta = beta.unwrap_or(cfg.default_beta);
        let order_type = match exit_mode(cfg, pos.gain_pct(), beta) {
            ExitMode::Liquidate => OrderType::Limit { limit_price: cents(pos.current_price * cfg.sell_limit_factor) },
            ExitMode::TrailingStop { trail_percent } => OrderType::TrailingStop { trail_percent: cents(trail_percent) },
        };
        out.push(OrderRequest { symbol: pos.symbol.clone(), side: Side::Sell, sizing: Sizing::Qty(whole), order_type });
    }
    if frac > 0.0 {
        out.extend(notional(&pos.symbol, Side::Sell, frac * pos.current_price * cfg.sell_notional_factor));
    }
    Ok(out)
}

/// Spend `investment` on `symbol`: whole shares as a buffered limit, the rest notional.
pub fn entry_orders(cfg: &RiskCfg, symbol: &str, investment: f64, price: f64) -> Result<Vec<OrderRequest>, RiskError> {
    check_price(symbol, price)?;
    if !investment.is_finite() || investment <= 0.0 {
        return Err(RiskError::InvalidAmount { symbol: symbol.to_string(), amount: investment });
    }

    let whole = (investment / price).floor();
    let rest = investment - whole * price;
    let mut out = Vec::with_capacity(2);

    if whole >= 1.0 {
        out.push(OrderRequest {
            symbol: symbol.to_string(),
            side: Side::Buy,
            sizing: Sizing::Qty(whole),
            order_type: OrderType::Limit { limit_price: cents(price * cfg.buy_limit_factor) },
        });
    }
    out.extend(notional(symbol, Side::Buy, rest));
    Ok(out)
}
