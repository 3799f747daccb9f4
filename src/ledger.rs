// ===============================
// src/ledger.rs (FIFO lots, realized P&L, wash-sale flags)
// ===============================
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};

use crate::domain::{HistoricalOrder, Lot, RealizedTrade, Side};
use crate::metrics::{PNL_REALIZED, UNMATCHED_SELLS, WASH_SALE_SYMBOLS};

/// Leftover quantities below this are float noise, not shares.
pub const QTY_EPSILON: f64 = 1e-9;

/// Lots consumed for one sell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill { pub qty: f64, pub cost: f64 }

/// Open purchase lots, one FIFO queue per symbol.
#[derive(Debug, Default, Clone)]
pub struct LotLedger {
    by_symbol: HashMap<String, VecDeque<Lot>>,
}

impl LotLedger {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, lot: Lot) {
        if lot.qty <= QTY_EPSILON { return; }
        self.by_symbol.entry(lot.symbol.clone()).or_default().push_back(lot);
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.by_symbol.get(symbol).map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub fn open_lots(&self, symbol: &str) -> Vec<Lot> {
        self.by_symbol.get(symbol).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn open_qty(&self, symbol: &str) -> f64 {
        self.by_symbol.get(symbol).map(|q| q.iter().map(|l| l.qty).sum()).unwrap_or(0.0)
    }

    /// Consume up to `qty` shares oldest-first. A partially used lot goes back
    /// to the front with its remainder, so it stays the oldest.
    pub fn consume(&mut self, symbol: &str, qty: f64) -> Fill {
        let mut fill = Fill { qty: 0.0, cost: 0.0 };
        let Some(queue) = self.by_symbol.get_mut(symbol) else { return fill };

        let mut remaining = qty;
        while remaining > QTY_EPSILON {
            let Some(mut lot) = queue.pop_front() else { break };
            let used = lot.qty.min(remaining);
            fill.qty += used;
            fill.cost += used * lot.price;
            remaining -= used;
            lot.qty -= used;
            if lot.qty > QTY_EPSILON {
                queue.push_front(lot);
            }
        }
        if queue.is_empty() {
            self.by_symbol.remove(symbol);
        }
        fill
    }
}

#[derive(Debug, Default)]
pub struct Classification {
    pub realized: Vec<RealizedTrade>,
    pub wash_sale: BTreeSet<String>,
    /// Sells with no open lot at all (short sale or history gap).
    pub unmatched_sells: usize,
    pub ledger: LotLedger,
}

impl Classification {
    pub fn total_gain_loss(&self) -> f64 { self.realized.iter().map(|t| t.gain_loss).sum() }
}

/// Replay a chronologically ascending order history through a fresh ledger.
/// Nothing is carried between calls.
pub fn classify(
    orders: &[HistoricalOrder],
    excluded: &HashSet<String>,
    now: DateTime<Utc>,
    window_days: i64,
) -> Classification {
    let window_start = now - Duration::days(window_days);
    let mut out = Classification::default();

    for o in orders {
        if !o.is_fill() || excluded.contains(&o.symbol) {
            continue;
        }
        match o.side {
            Side::Buy => out.ledger.push(Lot {
                symbol: o.symbol.clone(),
                qty: o.filled_qty,
                price: o.filled_avg_price,
                acquired_at: o.created_at,
            }),
            Side::Sell => {
                if !out.ledger.has_open(&o.symbol) {
                    warn!(symbol = %o.symbol, order_id = %o.id, qty = o.filled_qty, "sell without open lots, skipped");
                    out.unmatched_sells += 1;
                    continue;
                }
                let fill = out.ledger.consume(&o.symbol, o.filled_qty);
                let short = o.filled_qty - fill.qty;
                if short > QTY_EPSILON {
                    warn!(symbol = %o.symbol, order_id = %o.id, unmatched_qty = short, "sell exceeds open lots, realizing matched part only");
                }

                let basis = fill.cost / fill.qty;
                let gain_loss = (o.filled_avg_price - basis) * fill.qty;
                let trade = RealizedTrade {
                    symbol: o.symbol.clone(),
                    qty_sold: fill.qty,
                    sell_price: o.filled_avg_price,
                    cost_basis_per_share: basis,
                    gain_loss,
                    sold_at: o.created_at,
                };
                debug!(symbol = %trade.symbol, qty = trade.qty_sold, basis, gain_loss, "realized");

                if gain_loss < 0.0 && o.created_at >= window_start && out.wash_sale.insert(o.symbol.clone()) {
                    info!(symbol = %o.symbol, gain_loss, sold_at = %o.created_at, "wash sale flagged");
                }
                out.realized.push(trade);
            }
        }
    }

    PNL_REALIZED.set(out.total_gain_loss());
    WASH_SALE_SYMBOLS.set(out.wash_sale.len() as i64);
    UNMATCHED_SELLS.inc_by(out.unmatched_sells as u64);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 15, 0, 0).unwrap() + Duration::days(day)
    }

    fn fill(id: &str, symbol: &str, side: Side, qty: f64, px: f64, day: i64) -> HistoricalOrder {
        HistoricalOrder {
            id: id.into(),
            symbol: symbol.into(),
            side,
            status: crate::domain::OrderStatus::Filled,
            filled_qty: qty,
            filled_avg_price: px,
            submitted_at: t(day),
            created_at: t(day),
        }
    }

    #[test]
    fn loss_inside_window_flags_wash_sale() {
        let orders = vec![
            fill("1", "AAPL", Side::Buy, 10.0, 100.0, 0),
            fill("2", "AAPL", Side::Sell, 4.0, 90.0, 10),
        ];
        let c = classify(&orders, &HashSet::new(), t(20), 30);

        assert_eq!(c.realized.len(), 1);
        let r = &c.realized[0];
        assert_relative_eq!(r.qty_sold, 4.0);
        assert_relative_eq!(r.cost_basis_per_share, 100.0);
        assert_relative_eq!(r.sell_price, 90.0);
        assert_relative_eq!(r.gain_loss, -40.0);
        assert!(c.wash_sale.contains("AAPL"));

        let left = c.ledger.open_lots("AAPL");
        assert_eq!(left.len(), 1);
        assert_relative_eq!(left[0].qty, 6.0);
        assert_relative_eq!(left[0].price, 100.0);
    }

    #[test]
    fn loss_outside_window_not_flagged() {
        let orders = vec![
            fill("1", "AAPL", Side::Buy, 10.0, 100.0, 0),
            fill("2", "AAPL", Side::Sell, 4.0, 90.0, 10),
        ];
        let c = classify(&orders, &HashSet::new(), t(60), 30);
        assert_eq!(c.realized.len(), 1);
        assert!(c.wash_sale.is_empty());
    }

    #[test]
    fn gain_not_flagged() {
        let orders = vec![
            fill("1", "MSFT", Side::Buy, 5.0, 300.0, 0),
            fill("2", "MSFT", Side::Sell, 5.0, 310.0, 5),
        ];
        let c = classify(&orders, &HashSet::new(), t(6), 30);
        assert_relative_eq!(c.realized[0].gain_loss, 50.0);
        assert!(c.wash_sale.is_empty());
        assert!(!c.ledger.has_open("MSFT"));
    }

    #[test]
    fn sell_spanning_lots_uses_weighted_basis() {
        let orders = vec![
            fill("1", "NVDA", Side::Buy, 2.0, 100.0, 0),
            fill("2", "NVDA", Side::Buy, 3.0, 200.0, 1),
            fill("3", "NVDA", Side::Buy, 5.0, 300.0, 2),
            fill("4", "NVDA", Side::Sell, 4.0, 250.0, 3),
        ];
        let c = classify(&orders, &HashSet::new(), t(3), 30);
        let r = &c.realized[0];
        // 2 @ 100 + 2 @ 200
        assert_relative_eq!(r.cost_basis_per_share, 150.0);
        assert_relative_eq!(r.gain_loss, 400.0);

        let left = c.ledger.open_lots("NVDA");
        assert_eq!(left.len(), 2);
        assert_relative_eq!(left[0].qty, 1.0);
        assert_relative_eq!(left[0].price, 200.0);
        assert_relative_eq!(left[1].qty, 5.0);
    }

    #[test]
    fn unmatched_sell_is_skipped() {
        let orders = vec![fill("1", "TSLA", Side::Sell, 3.0, 50.0, 0)];
        let c = classify(&orders, &HashSet::new(), t(1), 30);
        assert!(c.realized.is_empty());
        assert_eq!(c.unmatched_sells, 1);
        assert!(c.wash_sale.is_empty());
    }

    #[test]
    fn oversized_sell_realizes_matched_part() {
        let orders = vec![
            fill("1", "DE", Side::Buy, 2.0, 400.0, 0),
            fill("2", "DE", Side::Sell, 5.0, 380.0, 1),
        ];
        let c = classify(&orders, &HashSet::new(), t(2), 30);
        assert_relative_eq!(c.realized[0].qty_sold, 2.0);
        assert_relative_eq!(c.realized[0].gain_loss, -40.0);
        assert!(!c.ledger.has_open("DE"));
    }

    #[test]
    fn excluded_symbols_and_unfilled_orders_ignored() {
        let mut cancelled = fill("3", "META", Side::Buy, 1.0, 10.0, 0);
        cancelled.status = crate::domain::OrderStatus::Canceled;
        let orders = vec![
            fill("1", "BTCUSD", Side::Buy, 1.0, 60000.0, 0),
            fill("2", "BTCUSD", Side::Sell, 1.0, 50000.0, 1),
            cancelled,
        ];
        let excluded: HashSet<String> = ["BTCUSD".to_string()].into_iter().collect();
        let c = classify(&orders, &excluded, t(2), 30);
        assert!(c.realized.is_empty());
        assert!(c.wash_sale.is_empty());
        assert!(!c.ledger.has_open("META"));
    }

    #[test]
    fn symbol_flagged_once() {
        let orders = vec![
            fill("1", "AMZN", Side::Buy, 10.0, 100.0, 0),
            fill("2", "AMZN", Side::Sell, 2.0, 90.0, 1),
            fill("3", "AMZN", Side::Sell, 2.0, 80.0, 2),
        ];
        let c = classify(&orders, &HashSet::new(), t(3), 30);
        assert_eq!(c.realized.len(), 2);
        assert_eq!(c.wash_sale.len(), 1);
    }

    #[test]
    fn float_dust_does_not_leave_zero_lots() {
        let orders = vec![
            fill("1", "X", Side::Buy, 0.1, 10.0, 0),
            fill("2", "X", Side::Buy, 0.2, 10.0, 1),
            fill("3", "X", Side::Sell, 0.3, 10.0, 2),
        ];
        let c = classify(&orders, &HashSet::new(), t(3), 30);
        assert!(!c.ledger.has_open("X"));
    }

    #[test]
    fn classification_is_repeatable() {
        let orders = vec![
            fill("1", "AAPL", Side::Buy, 10.0, 100.0, 0),
            fill("2", "AAPL", Side::Sell, 4.0, 90.0, 10),
            fill("3", "GOOGL", Side::Buy, 1.0, 100.0, 0),
            fill("4", "GOOGL", Side::Sell, 1.0, 95.0, 12),
        ];
        let a = classify(&orders, &HashSet::new(), t(20), 30);
        let b = classify(&orders, &HashSet::new(), t(20), 30);
        assert_eq!(a.wash_sale, b.wash_sale);
        assert_eq!(a.realized, b.realized);
    }

    proptest! {
        #[test]
        fn consumed_never_exceeds_bought(events in prop::collection::vec((any::<bool>(), 1u32..50, 1u32..500), 1..40)) {
            let orders: Vec<HistoricalOrder> = events.iter().enumerate().map(|(i, (is_buy, qty, px))| {
                let side = if *is_buy { Side::Buy } else { Side::Sell };
                fill(&i.to_string(), "P", side, *qty as f64, *px as f64, i as i64)
            }).collect();
            let c = classify(&orders, &HashSet::new(), t(100), 30);

            let bought: f64 = events.iter().filter(|e| e.0).map(|e| e.1 as f64).sum();
            let sold: f64 = c.realized.iter().map(|r| r.qty_sold).sum();
            prop_assert!(sold <= bought + 1e-6);
            prop_assert!((bought - sold - c.ledger.open_qty("P")).abs() < 1e-6);
            for lot in c.ledger.open_lots("P") {
                prop_assert!(lot.qty > 0.0);
            }
        }

        #[test]
        fn basis_is_weighted_mean_of_consumed_lots(lots in prop::collection::vec((1u32..20, 1u32..300), 1..8), take in 1u32..100) {
            let mut orders: Vec<HistoricalOrder> = lots.iter().enumerate()
                .map(|(i, (q, p))| fill(&i.to_string(), "Q", Side::Buy, *q as f64, *p as f64, i as i64))
                .collect();
            orders.push(fill("s", "Q", Side::Sell, take as f64, 1.0, 99));
            let c = classify(&orders, &HashSet::new(), t(100), 30);

            // walk the lots by hand
            let mut need = take as f64;
            let (mut q_sum, mut cost) = (0.0, 0.0);
            for (q, p) in &lots {
                if need <= 0.0 { break; }
                let used = (*q as f64).min(need);
                q_sum += used;
                cost += used * *p as f64;
                need -= used;
            }
            let r = &c.realized[0];
            prop_assert!((r.qty_sold - q_sum).abs() < 1e-9);
            prop_assert!((r.cost_basis_per_share - cost / q_sum).abs() < 1e-6);
        }
    }
}
