// ===============================
// src/lib.rs
// ===============================
pub mod alpaca;
pub mod compliance;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod gateway_alpaca;
pub mod ledger;
pub mod metrics;
pub mod rebalance;
pub mod recorder;
pub mod retry;
pub mod risk;
pub mod selector;
pub mod store;
pub mod symbol;
pub mod washsale;
