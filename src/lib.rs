// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use api::{CoinbaseClient, ExchangeClient, PaperExchange};
pub use config::BotConfig;
pub use error::{BotError, Result};
pub use models::*;
pub use strategy::{Strategy, StrategyEngine};
