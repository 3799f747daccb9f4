// ===============================
// src/rebalance.rs (orchestrator)
// ===============================
//
// SELECTING -> VERIFYING -> SELLING -> BARRIER_WAIT -> BUYING -> DONE
//                  |                        |
//                  +--------> FAILED <------+  (missing scores, API down, cancel)
//
// No buy is submitted while any sell from this run is still open.
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{error, info, warn};

use crate::compliance::ComplianceSets;
use crate::config::{RebalanceCfg, RetryCfg, RiskCfg};
use crate::domain::{new_client_order_id, AccountSnapshot, Event, OrderRequest, Position, ScoredSymbol, Side};
use crate::gateway::{Broker, BrokerError};
use crate::metrics::{reset_state, BARRIER_POLLS, ORDERS, ORDER_FAILURES, REBALANCE_STATE, TARGET_COUNT};
use prometheus::IntGaugeVec;
use crate::recorder::Journal;
use crate::retry::with_retry;
use crate::risk::{entry_orders, exit_orders};
use crate::selector::{missing_scores, select, TargetEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    Selecting,
    Verifying,
    Selling,
    BarrierWait,
    Buying,
    Done,
    Failed,
}

impl RebalanceState {
    pub fn label(&self) -> &'static str {
        match self {
            RebalanceState::Selecting => "SELECTING",
            RebalanceState::Verifying => "VERIFYING",
            RebalanceState::Selling => "SELLING",
            RebalanceState::BarrierWait => "BARRIER_WAIT",
            RebalanceState::Buying => "BUYING",
            RebalanceState::Done => "DONE",
            RebalanceState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RebalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error("target symbols without score records: {0:?}")]
    MissingScores(Vec<String>),
    #[error("target list is empty")]
    EmptyTargetList,
    #[error("rebalance cancelled with {pending} sell order(s) still open")]
    Cancelled { pending: usize },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

// ---- cancellation ----

/// Held by the operator side. `cancel()` stops further submissions and aborts a waiting barrier.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) { let _ = self.0.send(true); }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool { *self.0.borrow() }

    pub async fn cancelled(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                // handle dropped without cancelling: never fires
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---- inputs / outputs ----

/// Everything the run reads besides the broker. Symbols in broker notation.
#[derive(Debug, Clone, Default)]
pub struct RebalanceInputs {
    pub scores: Vec<ScoredSymbol>,
    pub score_index: HashSet<String>,
    pub exclusions: Vec<String>,
    pub wash_sale: BTreeSet<String>,
    pub betas: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct RebalanceReport {
    pub targets: Vec<String>,
    pub target_value_per_symbol: f64,
    pub sells_submitted: usize,
    pub buys_submitted: usize,
    /// Dry run only: what would have been sent.
    pub planned: Vec<OrderRequest>,
    /// (symbol, reason) for every order that was decided but not placed.
    pub failures: Vec<(String, String)>,
}

pub struct Rebalancer {
    broker: Arc<dyn Broker>,
    cfg: RebalanceCfg,
    risk: RiskCfg,
    retry: RetryCfg,
    journal: Journal,
    state: RebalanceState,
    state_gauge: IntGaugeVec,
}

impl Rebalancer {
    pub fn new(broker: Arc<dyn Broker>, cfg: RebalanceCfg, risk: RiskCfg, retry: RetryCfg, journal: Journal) -> Self {
        Self { broker, cfg, risk, retry, journal, state: RebalanceState::Selecting, state_gauge: REBALANCE_STATE.clone() }
    }

    pub fn state(&self) -> RebalanceState { self.state }

    fn enter(&mut self, next: RebalanceState) {
        self.state_gauge.with_label_values(&[self.state.label()]).set(0);
        self.state_gauge.with_label_values(&[next.label()]).set(1);
        info!(from = %self.state, to = %next, "rebalance state");
        self.journal.record(Event::State(next.label().to_string()));
        self.state = next;
    }

    fn fail(&mut self, err: RebalanceError) -> RebalanceError {
        error!(state = %self.state, error = %err, "rebalance aborted");
        self.enter(RebalanceState::Failed);
        err
    }

    pub async fn run(&mut self, inputs: &RebalanceInputs, mut cancel: CancelToken) -> Result<RebalanceReport, RebalanceError> {
        // a reused rebalancer must not leave the last run's DONE/FAILED raised
        self.state = RebalanceState::Selecting;
        reset_state(&self.state_gauge, self.state.label());
        let mut report = RebalanceReport::default();

        // ---- SELECTING ----
        let broker = self.broker.clone();
        let fetched = with_retry(&self.retry, "positions", || broker.positions()).await;
        let positions = match fetched {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e.into())),
        };
        let held: HashMap<String, Position> = positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        let held_set: HashSet<String> = held.keys().cloned().collect();
        let sets = ComplianceSets::build(&inputs.exclusions, &inputs.wash_sale, &self.cfg.retention);
        let targets = select(self.cfg.target_count, &inputs.scores, &held_set, &sets);
        TARGET_COUNT.set(targets.len() as i64);
        report.targets = targets.iter().map(|t| t.symbol().to_string()).collect();
        info!(targets = ?report.targets, held = held.len(), excluded = sets.exclusion_len(), "targets selected");

        // ---- VERIFYING ----
        self.enter(RebalanceState::Verifying);
        if targets.is_empty() {
            return Err(self.fail(RebalanceError::EmptyTargetList));
        }
        let missing = missing_scores(&targets, &inputs.score_index);
        if !missing.is_empty() {
            for sym in &missing {
                error!(symbol = %sym, "no score record for target symbol");
            }
            return Err(self.fail(RebalanceError::MissingScores(missing)));
        }

        let fetched = with_retry(&self.retry, "account", || broker.account()).await;
        let account: AccountSnapshot = match fetched {
            Ok(a) => a,
            Err(e) => return Err(self.fail(e.into())),
        };
        let per_symbol = account.portfolio_value * self.cfg.investment_fraction / targets.len() as f64;
        report.target_value_per_symbol = per_symbol;
        info!(portfolio_value = account.portfolio_value, cash = account.cash, per_symbol, "allocation");

        // ---- SELLING ----
        self.enter(RebalanceState::Selling);
        let target_set: HashSet<&str> = targets.iter().map(|t| t.symbol()).collect();
        let mut exits: Vec<&Position> = held
            .values()
            .filter(|p| !target_set.contains(p.symbol.as_str()) && sets.may_exit(&p.symbol))
            .collect();
        exits.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut sell_ids: Vec<String> = Vec::new();
        for pos in exits {
            info!(symbol = %pos.symbol, qty = pos.qty, gain_pct = pos.gain_pct(), "exiting position");
            let beta = inputs.betas.get(&pos.symbol).copied();
            let orders = match exit_orders(&self.risk, pos, beta) {
                Ok(o) => o,
                Err(e) => {
                    warn!(symbol = %pos.symbol, error = %e, "exit skipped");
                    report.failures.push((pos.symbol.clone(), e.to_string()));
                    continue;
                }
            };
            for req in orders {
                if cancel.is_cancelled() {
                    return Err(self.fail(RebalanceError::Cancelled { pending: sell_ids.len() }));
                }
                if let Some(id) = self.place(&req, &mut report).await {
                    sell_ids.push(id);
                }
            }
        }

        // ---- BARRIER_WAIT ----
        self.enter(RebalanceState::BarrierWait);
        if let Err(e) = self.wait_for_sells(&sell_ids, &mut cancel).await {
            return Err(self.fail(e));
        }

        // ---- BUYING ----
        self.enter(RebalanceState::Buying);
        for t in &targets {
            if let Err(e) = self.buy_target(t, held.get(t.symbol()), per_symbol, &sets, &cancel, &mut report).await {
                return Err(self.fail(e));
            }
        }

        self.enter(RebalanceState::Done);
        info!(
            sells = report.sells_submitted,
            buys = report.buys_submitted,
            failures = report.failures.len(),
            "rebalance done"
        );
        Ok(report)
    }

    async fn buy_target(
        &mut self,
        t: &TargetEntry,
        held: Option<&Position>,
        per_symbol: f64,
        sets: &ComplianceSets,
        cancel: &CancelToken,
        report: &mut RebalanceReport,
    ) -> Result<(), RebalanceError> {
        let sym = t.symbol();
        if let Some(block) = sets.purchase_block(sym) {
            info!(symbol = %sym, reason = %block, "purchase blocked");
            return Ok(());
        }

        let amount = match held {
            Some(p) if p.market_value >= per_symbol => return Ok(()),
            Some(p) => {
                let shortfall = per_symbol - p.market_value;
                info!(symbol = %sym, current = p.market_value, target = per_symbol, shortfall, "topping up");
                shortfall
            }
            None if !t.score.has_positive_fundamentals() => {
                info!(symbol = %sym, quality = t.score.quality_score, growth = t.score.growth_score, "new buy needs positive quality and growth");
                return Ok(());
            }
            None => {
                info!(symbol = %sym, target = per_symbol, "opening position");
                per_symbol
            }
        };

        // held: the position's mark; new: last trade
        let price = match held {
            Some(p) => p.current_price,
            None => {
                let broker = self.broker.clone();
                match with_retry(&self.retry, "latest_price", || broker.latest_price(sym)).await {
                    Ok(px) => px,
                    Err(e) => {
                        warn!(symbol = %sym, error = %e, "no price, buy skipped");
                        report.failures.push((sym.to_string(), e.to_string()));
                        return Ok(());
                    }
                }
            }
        };

        match entry_orders(&self.risk, sym, amount, price) {
            Ok(orders) => {
                for req in orders {
                    if cancel.is_cancelled() {
                        return Err(RebalanceError::Cancelled { pending: 0 });
                    }
                    self.place(&req, report).await;
                }
            }
            Err(e) => {
                warn!(symbol = %sym, error = %e, "buy skipped");
                report.failures.push((sym.to_string(), e.to_string()));
            }
        }
        Ok(())
    }

    /// Submit one order. Failures are logged and counted, never propagated.
    /// Retries reuse one client order id so a lost ack cannot book the order twice.
    async fn place(&mut self, req: &OrderRequest, report: &mut RebalanceReport) -> Option<String> {
        if self.cfg.dry_run {
            info!(symbol = %req.symbol, side = req.side.as_str(), sizing = ?req.sizing, order_type = ?req.order_type, "dry run, not submitted");
            self.journal.record(Event::Planned(req.clone()));
            report.planned.push(req.clone());
            return None;
        }

        let broker = self.broker.clone();
        let client_order_id = new_client_order_id();
        let submitted = with_retry(&self.retry, "submit_order", || broker.submit_order(&client_order_id, req)).await;
        match submitted {
            Ok(id) => {
                info!(%id, %client_order_id, symbol = %req.symbol, side = req.side.as_str(), sizing = ?req.sizing, order_type = req.order_type.label(), "order submitted");
                ORDERS.with_label_values(&[req.side.as_str(), req.order_type.label()]).inc();
                self.journal.record(Event::Submitted { order_id: id.clone(), client_order_id, request: req.clone() });
                match req.side {
                    Side::Buy => report.buys_submitted += 1,
                    Side::Sell => report.sells_submitted += 1,
                }
                Some(id)
            }
            Err(e) => {
                error!(symbol = %req.symbol, side = req.side.as_str(), error = %e, "order submission failed");
                ORDER_FAILURES.with_label_values(&[req.side.as_str()]).inc();
                self.journal.record(Event::Failed { symbol: req.symbol.clone(), reason: e.to_string() });
                report.failures.push((req.symbol.clone(), e.to_string()));
                None
            }
        }
    }

    /// Block until every id is terminal. Poll errors count as "still open".
    async fn wait_for_sells(&self, ids: &[String], cancel: &mut CancelToken) -> Result<(), RebalanceError> {
        let mut pending: Vec<String> = ids.to_vec();
        let interval = Duration::from_secs(self.cfg.poll_interval_secs);
        let deadline = self.cfg.barrier_timeout_secs.map(|s| Instant::now() + Duration::from_secs(s));
        info!(orders = pending.len(), "waiting for sell orders to finish");

        loop {
            if cancel.is_cancelled() {
                return Err(RebalanceError::Cancelled { pending: pending.len() });
            }

            let mut still_open = Vec::with_capacity(pending.len());
            for id in pending {
                let broker = self.broker.clone();
                let polled = with_retry(&self.retry, "order_status", || broker.order_status(&id)).await;
                match polled {
                    Ok(status) if status.is_terminal() => {
                        info!(order_id = %id, ?status, "sell order finished");
                    }
                    Ok(status) => {
                        info!(order_id = %id, ?status, "waiting for sell order");
                        still_open.push(id);
                    }
                    Err(e) => {
                        warn!(order_id = %id, error = %e, "sell order status unknown, still waiting");
                        still_open.push(id);
                    }
                }
            }
            BARRIER_POLLS.inc();
            pending = still_open;
            if pending.is_empty() {
                info!("all sell orders finished");
                return Ok(());
            }

            let next_poll = Instant::now() + interval;
            let wake = deadline.map_or(next_poll, |d| d.min(next_poll));
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = cancel.cancelled() => {}
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    warn!(pending = pending.len(), "sell barrier deadline reached");
                    return Err(RebalanceError::Cancelled { pending: pending.len() });
                }
            }
        }
    }
}
