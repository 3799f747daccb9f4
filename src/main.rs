// ===============================
// src/main.rs
// ===============================
/*
 # dry run against the paper broker seeded from ./data/paper_state.json
 RUST_LOG=info cargo run -- --dry-run

 # only refresh the wash-sale set
 BROKER_MODE=alpaca cargo run -- wash-sale

 # what the last run did
 curl -s localhost:9898/metrics | egrep '^(rebalance_state|orders_submitted_total|order_failures_total)'
*/
/*
=============================================================================
Project : rebal_bot — factor-ranked equity rebalancer with wash-sale guard

Summary : Pulls order history, replays it FIFO to find recent loss sales
          (wash sales), then moves the account toward the top-N scored
          symbols: sells first, waits for every sell to finish, then buys
          equal-weight slices. Paper or Alpaca execution, Prometheus
          metrics, optional JSONL journal.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rebal_bot::config::{BrokerMode, ConfigError, Settings};
use rebal_bot::domain::Event;
use rebal_bot::gateway::{Broker, BrokerError, PaperBroker};
use rebal_bot::gateway_alpaca::AlpacaBroker;
use rebal_bot::rebalance::{cancel_pair, CancelToken, RebalanceError, RebalanceInputs, Rebalancer};
use rebal_bot::recorder::{self, Journal};
use rebal_bot::store::{FileStore, StoreError};
use rebal_bot::washsale::{self, WashSaleError};
use rebal_bot::metrics;

#[derive(Parser, Debug)]
#[command(name = "rebal_bot", version, about = "Wash-sale aware equity rebalancer")]
struct Cli {
    /// Size and log orders without submitting them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Classify order history and persist the wash-sale set
    WashSale,
    /// Rebalance using the persisted wash-sale set
    Rebalance,
    /// Wash-sale step, then rebalance
    Run,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    WashSale(#[from] WashSaleError),
    #[error(transparent)]
    Rebalance(#[from] RebalanceError),
    #[error("journal: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            AppError::Rebalance(RebalanceError::MissingScores(_) | RebalanceError::EmptyTargetList) => 2,
            AppError::Rebalance(RebalanceError::Cancelled { .. }) => 3,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    // ---- Config ----
    let mut settings = Settings::load()?;
    if cli.dry_run {
        settings.rebalance.dry_run = true;
    }
    let command = cli.command.unwrap_or(Command::Run);
    let mode_str = match settings.broker_mode {
        BrokerMode::Paper => "paper",
        BrokerMode::Alpaca => "alpaca",
    };
    info!(
        ?command,
        broker = mode_str,
        data_dir = %settings.data_dir.display(),
        target_count = settings.rebalance.target_count,
        investment_fraction = settings.rebalance.investment_fraction,
        retention = ?settings.rebalance.retention,
        dry_run = settings.rebalance.dry_run,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = settings.metrics_port {
        metrics::serve_metrics(port);
    }

    // ---- Recorder (optional) ----
    let (journal, writer) = match settings.record_file.clone() {
        Some(path) => {
            let (j, h) = recorder::spawn(path).await?;
            (j, Some(h))
        }
        None => (Journal::disabled(), None),
    };
    journal.record(Event::Note(format!("start {command:?} broker={mode_str}")));

    // ---- Broker ----
    let store = FileStore::new(&settings.data_dir);
    let broker: Arc<dyn Broker> = match settings.broker_mode {
        BrokerMode::Paper => {
            let snapshot = store.load_paper_snapshot().await?;
            Arc::new(PaperBroker::new(snapshot, 1))
        }
        BrokerMode::Alpaca => {
            let cfg = settings.alpaca.clone().ok_or(ConfigError::Missing("ALPACA_API_KEY"))?;
            Arc::new(AlpacaBroker::new(cfg)?)
        }
    };

    // ---- Ctrl-C: first stops new orders, second exits ----
    let (cancel, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling (again to exit now)");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt, exiting");
            std::process::exit(130);
        }
    });

    let result = pipeline(command, &settings, &store, broker, &journal, token).await;

    // ---- Flush journal ----
    drop(journal);
    if let Some(h) = writer {
        let _ = h.await;
    }
    result
}

async fn pipeline(
    command: Command,
    settings: &Settings,
    store: &FileStore,
    broker: Arc<dyn Broker>,
    journal: &Journal,
    token: CancelToken,
) -> Result<(), AppError> {
    let wash_sale = if command == Command::Rebalance {
        let set = store.load_wash_sale().await?;
        info!(count = set.len(), "wash sale set loaded");
        set
    } else {
        let res = washsale::run(broker.as_ref(), store, &settings.wash_sale, &settings.retry, journal, Utc::now()).await?;
        res.wash_sale
    };
    if command == Command::WashSale {
        return Ok(());
    }

    // ---- Inputs ----
    let scores = store.load_scores().await?;
    let inputs = RebalanceInputs {
        score_index: store.load_score_index(&scores).await?,
        exclusions: store.load_exclusions().await?,
        betas: store.load_betas().await?,
        scores,
        wash_sale,
    };
    info!(
        scored = inputs.scores.len(),
        indexed = inputs.score_index.len(),
        exclusions = inputs.exclusions.len(),
        wash_sale = inputs.wash_sale.len(),
        betas = inputs.betas.len(),
        "inputs loaded"
    );

    let mut rebalancer = Rebalancer::new(
        broker,
        settings.rebalance.clone(),
        settings.risk.clone(),
        settings.retry.clone(),
        journal.clone(),
    );
    let report = rebalancer.run(&inputs, token).await?;
    for (symbol, reason) in &report.failures {
        warn!(%symbol, %reason, "not placed");
    }
    info!(
        targets = ?report.targets,
        per_symbol = report.target_value_per_symbol,
        sells = report.sells_submitted,
        buys = report.buys_submitted,
        planned = report.planned.len(),
        failures = report.failures.len(),
        "rebalance summary"
    );
    Ok(())
}
