// ===============================
// src/washsale.rs (history -> FIFO -> wash-sale set)
// ===============================
//
// 1) page through filled orders since now - lookback (500 per page)
// 2) replay them through the lot ledger, minus excluded symbols
// 3) report realized trades, persist the flagged set
//
use ahash::AHashSet as HashSet;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{RetryCfg, WashSaleCfg};
use crate::domain::{Event, HistoricalOrder};
use crate::gateway::{Broker, BrokerError};
use crate::ledger::{classify, Classification};
use crate::recorder::Journal;
use crate::retry::with_retry;
use crate::store::{FileStore, StoreError};

pub const HISTORY_PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum WashSaleError {
    #[error("order history: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// All orders submitted after `since`, ascending. Stops on a short page.
///
/// The cursor steps back 1µs from the last timestamp of a full page, so orders
/// sharing that timestamp across the page boundary are fetched again and
/// dropped by id.
pub async fn fetch_order_history(
    broker: &dyn Broker,
    retry: &RetryCfg,
    since: DateTime<Utc>,
) -> Result<Vec<HistoricalOrder>, BrokerError> {
    let mut out: Vec<HistoricalOrder> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut after = since;
    loop {
        let page = with_retry(retry, "order_history", || broker.order_history(after, HISTORY_PAGE_SIZE)).await?;
        let n = page.len();
        let last = page.last().map(|o| o.submitted_at);
        let before = out.len();
        out.extend(page.into_iter().filter(|o| seen.insert(o.id.clone())));
        let added = out.len() - before;
        info!(page = n, added, total = out.len(), "order history page");

        if n < HISTORY_PAGE_SIZE {
            break;
        }
        match last.map(|ts| ts - Duration::microseconds(1)) {
            Some(next) if added > 0 && next > after => after = next,
            _ => {
                warn!(%after, page = n, "order history cursor did not advance, stopping");
                break;
            }
        }
    }
    out.sort_by_key(|o| o.submitted_at);
    Ok(out)
}

pub async fn run(
    broker: &dyn Broker,
    store: &FileStore,
    cfg: &WashSaleCfg,
    retry: &RetryCfg,
    journal: &Journal,
    now: DateTime<Utc>,
) -> Result<Classification, WashSaleError> {
    let since = now - Duration::days(cfg.lookback_days);
    let orders = fetch_order_history(broker, retry, since).await?;
    info!(orders = orders.len(), %since, "order history loaded");

    let excluded: HashSet<String> = cfg.exclusions.iter().cloned().collect();
    let result = classify(&orders, &excluded, now, cfg.window_days);

    if result.realized.is_empty() {
        info!("no sales transactions were processed");
    }
    for t in &result.realized {
        info!(
            symbol = %t.symbol,
            qty = t.qty_sold,
            sell_price = t.sell_price,
            cost_basis = t.cost_basis_per_share,
            gain_loss = t.gain_loss,
            sold_at = %t.sold_at,
            "realized trade"
        );
        journal.record(Event::Realized(t.clone()));
    }
    info!(
        trades = result.realized.len(),
        total_gain_loss = result.total_gain_loss(),
        unmatched_sells = result.unmatched_sells,
        wash_sale = ?result.wash_sale,
        "wash sale classification done"
    );

    store.save_wash_sale(&result.wash_sale).await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderStatus, Side};
    use crate::gateway::{PaperBroker, PaperSnapshot};
    use chrono::TimeZone;

    fn fill(i: usize, sym: &str, side: Side, qty: f64, px: f64, at: DateTime<Utc>) -> HistoricalOrder {
        HistoricalOrder {
            id: format!("o{i}"),
            symbol: sym.into(),
            side,
            status: OrderStatus::Filled,
            filled_qty: qty,
            filled_avg_price: px,
            submitted_at: at,
            created_at: at,
        }
    }

    fn fast() -> RetryCfg { RetryCfg { max_tries: 3, base_ms: 1, max_delay_ms: 2 } }

    #[tokio::test]
    async fn pages_until_short_page() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let history: Vec<HistoricalOrder> =
            (0..1_203).map(|i| fill(i, "AAPL", Side::Buy, 1.0, 10.0, start + Duration::minutes(i as i64 + 1))).collect();
        let broker = PaperBroker::new(PaperSnapshot { history, ..Default::default() }, 1);

        let got = fetch_order_history(&broker, &fast(), start).await.unwrap();
        assert_eq!(got.len(), 1_203);
        assert!(got.windows(2).all(|w| w[0].submitted_at < w[1].submitted_at));
    }

    #[tokio::test]
    async fn shared_timestamp_across_page_boundary_is_kept() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // 490..530 share one timestamp, straddling the 500-order page boundary
        let at = |i: usize| match i {
            0..=489 => start + Duration::minutes(i as i64 + 1),
            490..=529 => start + Duration::minutes(491),
            _ => start + Duration::minutes(i as i64 + 1),
        };
        let history: Vec<HistoricalOrder> = (0..600).map(|i| fill(i, "AAPL", Side::Buy, 1.0, 10.0, at(i))).collect();
        let broker = PaperBroker::new(PaperSnapshot { history, ..Default::default() }, 1);

        let got = fetch_order_history(&broker, &fast(), start).await.unwrap();
        assert_eq!(got.len(), 600);
        let ids: HashSet<&str> = got.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids.len(), 600);
    }

    #[tokio::test]
    async fn transient_history_failure_is_retried() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let history = vec![fill(0, "AAPL", Side::Buy, 1.0, 10.0, start + Duration::hours(1))];
        let broker = PaperBroker::new(PaperSnapshot { history, ..Default::default() }, 1);
        broker.fail_next("order_history", 2);
        assert_eq!(fetch_order_history(&broker, &fast(), start).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flags_recent_loss_and_persists_set() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let history = vec![
            fill(1, "AAPL", Side::Buy, 10.0, 150.0, now - Duration::days(60)),
            fill(2, "AAPL", Side::Sell, 10.0, 140.0, now - Duration::days(10)),
            fill(3, "BRK.B", Side::Buy, 1.0, 400.0, now - Duration::days(50)),
            fill(4, "BRK.B", Side::Sell, 1.0, 380.0, now - Duration::days(5)),
            fill(5, "MSFT", Side::Buy, 2.0, 300.0, now - Duration::days(40)),
            fill(6, "MSFT", Side::Sell, 2.0, 250.0, now - Duration::days(3)),
        ];
        let broker = PaperBroker::new(PaperSnapshot { history, ..Default::default() }, 1);
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let cfg = WashSaleCfg { window_days: 30, lookback_days: 365, exclusions: vec!["MSFT".into()] };

        let res = run(&broker, &store, &cfg, &fast(), &Journal::disabled(), now).await.unwrap();
        assert_eq!(res.realized.len(), 2);
        assert!(res.wash_sale.contains("AAPL"));
        assert!(res.wash_sale.contains("BRK.B"));
        assert!(!res.wash_sale.contains("MSFT"));

        let on_disk = std::fs::read_to_string(dir.path().join("wash_sale.json")).unwrap();
        assert!(on_disk.contains("BRK-B"));
        assert!(!on_disk.contains("MSFT"));
    }

    #[tokio::test]
    async fn empty_history_writes_empty_set() {
        let broker = PaperBroker::new(PaperSnapshot::default(), 1);
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let res = run(&broker, &store, &WashSaleCfg::default(), &fast(), &Journal::disabled(), Utc::now()).await.unwrap();
        assert!(res.realized.is_empty());
        assert!(store.load_wash_sale().await.unwrap().is_empty());
    }
}
