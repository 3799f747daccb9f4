// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : rebal_bot — factor-ranked equity rebalancer with wash-sale guard
Module  : config.rs

Summary : Every knob comes from the environment (after `.env`), parsed into
          plain structs that are handed to each component. Nothing here is
          global; main builds one `Settings` and passes pieces down.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use dotenvy::dotenv;
use thiserror::Error;

use crate::symbol;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("{0} is required in alpaca mode")]
    Missing(&'static str),
}

/// Which execution adapter to talk to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerMode {
    Paper,
    Alpaca,
}

impl BrokerMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock" => Some(BrokerMode::Paper),
            "alpaca" | "live" => Some(BrokerMode::Alpaca),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlpacaCfg {
    pub api_key: String,
    pub api_secret: String,
    pub trading_url: String,
    pub data_url: String,
}

#[derive(Clone, Debug)]
pub struct RetryCfg {
    pub max_tries: u32,
    pub base_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self { Self { max_tries: 5, base_ms: 1_000, max_delay_ms: 30_000 } }
}

/// Exit/entry sizing constants. Percentages are in percent units (2.0 = 2%).
#[derive(Clone, Debug)]
pub struct RiskCfg {
    pub liquidate_below_gain_pct: f64,
    pub sell_limit_factor: f64,
    pub sell_notional_factor: f64,
    pub buy_limit_factor: f64,
    pub trail_base_pct: f64,
    pub trail_gain_factor: f64,
    pub trail_beta_factor: f64,
    pub trail_cap_pct: f64,
    pub default_beta: f64,
}

impl Default for RiskCfg {
    fn default() -> Self {
        Self {
            liquidate_below_gain_pct: 2.0,
            sell_limit_factor: 0.97,
            sell_notional_factor: 0.99,
            buy_limit_factor: 1.03,
            trail_base_pct: 1.0,
            trail_gain_factor: 0.1,
            trail_beta_factor: 0.5,
            trail_cap_pct: 20.0,
            default_beta: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RebalanceCfg {
    pub target_count: usize,
    pub investment_fraction: f64,
    /// Broker notation, order preserved.
    pub retention: Vec<String>,
    pub poll_interval_secs: u64,
    pub barrier_timeout_secs: Option<u64>,
    pub dry_run: bool,
}

impl Default for RebalanceCfg {
    fn default() -> Self {
        Self {
            target_count: 10,
            investment_fraction: 0.812,
            retention: DEFAULT_RETENTION.iter().map(|s| symbol::to_broker(s)).collect(),
            poll_interval_secs: 5,
            barrier_timeout_secs: None,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WashSaleCfg {
    pub window_days: i64,
    pub lookback_days: i64,
    /// Symbols skipped before FIFO matching (broker notation).
    pub exclusions: Vec<String>,
}

impl Default for WashSaleCfg {
    fn default() -> Self { Self { window_days: 30, lookback_days: 365 * 5, exclusions: Vec::new() } }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub broker_mode: BrokerMode,
    pub alpaca: Option<AlpacaCfg>,
    pub data_dir: PathBuf,
    pub record_file: Option<String>,
    pub metrics_port: Option<u16>,
    pub retry: RetryCfg,
    pub risk: RiskCfg,
    pub rebalance: RebalanceCfg,
    pub wash_sale: WashSaleCfg,
}

pub const DEFAULT_RETENTION: [&str; 9] = ["NVDA", "BRK.B", "AMZN", "NVR", "AAPL", "MSFT", "META", "GOOGL", "DE"];

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key: key.to_string(), value: v }),
    }
}

fn symbol_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in raw.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
        let s = symbol::to_broker(s);
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

impl Settings {
    /// Read `.env` then the process environment.
    pub fn load() -> Result<Settings, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
        let mode_raw = get("BROKER_MODE").unwrap_or_else(|| "paper".to_string());
        let broker_mode = BrokerMode::parse(&mode_raw)
            .ok_or_else(|| ConfigError::Invalid { key: "BROKER_MODE".into(), value: mode_raw.clone() })?;

        let alpaca = match broker_mode {
            BrokerMode::Paper => None,
            BrokerMode::Alpaca => Some(AlpacaCfg {
                api_key: get("ALPACA_API_KEY").ok_or(ConfigError::Missing("ALPACA_API_KEY"))?,
                api_secret: get("ALPACA_API_SECRET").ok_or(ConfigError::Missing("ALPACA_API_SECRET"))?,
                trading_url: get("ALPACA_TRADING_URL").unwrap_or_else(|| "https://paper-api.alpaca.markets".into()),
                data_url: get("ALPACA_DATA_URL").unwrap_or_else(|| "https://data.alpaca.markets".into()),
            }),
        };

        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into()));
        let record_file = get("RECORD_FILE").filter(|s| !s.trim().is_empty());
        let metrics_port = match get("METRICS_PORT") {
            Some(p) if !p.trim().is_empty() => Some(
                p.trim().parse().map_err(|_| ConfigError::Invalid { key: "METRICS_PORT".into(), value: p })?,
            ),
            _ => None,
        };

        // ===== Retry =====
        let d = RetryCfg::default();
        let retry = RetryCfg {
            max_tries: parse_or(&get, "RETRY_MAX_TRIES", d.max_tries)?.max(1),
            base_ms: parse_or(&get, "RETRY_BASE_MS", d.base_ms)?,
            max_delay_ms: parse_or(&get, "RETRY_MAX_DELAY_MS", d.max_delay_ms)?,
        };

        // ===== Rebalance =====
        let d = RebalanceCfg::default();
        let retention = match get("RETENTION_LIST") {
            Some(raw) => symbol_list(&raw),
            None => d.retention,
        };
        let investment_fraction: f64 = parse_or(&get, "TARGET_INVESTMENT_FRACTION", d.investment_fraction)?;
        if !(investment_fraction > 0.0 && investment_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "TARGET_INVESTMENT_FRACTION".into(),
                value: investment_fraction.to_string(),
            });
        }
        let barrier_timeout_secs = match get("BARRIER_TIMEOUT_SECS") {
            Some(v) if !v.trim().is_empty() => Some(
                v.trim().parse().map_err(|_| ConfigError::Invalid { key: "BARRIER_TIMEOUT_SECS".into(), value: v })?,
            ),
            _ => None,
        };
        let rebalance = RebalanceCfg {
            target_count: parse_or(&get, "TARGET_COUNT", d.target_count)?,
            investment_fraction,
            retention,
            poll_interval_secs: parse_or(&get, "BARRIER_POLL_SECS", d.poll_interval_secs)?.max(1),
            barrier_timeout_secs,
            dry_run: parse_or(&get, "DRY_RUN", false)?,
        };

        // ===== Wash sale =====
        let d = WashSaleCfg::default();
        let wash_sale = WashSaleCfg {
            window_days: parse_or(&get, "WASH_SALE_WINDOW_DAYS", d.window_days)?,
            lookback_days: parse_or(&get, "HISTORY_LOOKBACK_DAYS", d.lookback_days)?,
            exclusions: get("WASH_SALE_EXCLUSIONS").map(|s| symbol_list(&s)).unwrap_or_default(),
        };

        Ok(Settings {
            broker_mode,
            alpaca,
            data_dir,
            record_file,
            metrics_port,
            retry,
            risk: RiskCfg::default(),
            rebalance,
            wash_sale,
        })
    }
}
