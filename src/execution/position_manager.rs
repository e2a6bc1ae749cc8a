use chrono::{DateTime, Utc};

use crate::error::{BotError, Result};
use crate::models::{PositionState, TradeRecord};

/// One executed leg (or part of a leg) of a trade
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    /// Quote currency paid in fees
    pub fee: f64,
    pub order_id: Option<String>,
}

/// The entry leg of a round trip that has not been exited yet
#[derive(Debug, Clone, PartialEq)]
pub struct OpenEntry {
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    /// Size bought on entry
    pub entry_size: f64,
    /// Size still held
    pub size: f64,
    pub entry_order_id: Option<String>,
    /// Capital before the entry
    pub start_capital: f64,
    sold_size: f64,
    sold_value: f64,
}

/// Capital, position state and trade ledger for a single instrument
///
/// Transitions strictly alternate: `enter` only from FLAT, `exit` only from
/// ENTERED. Both the backtest simulator and the live order loop book their
/// fills here.
#[derive(Debug, Clone)]
pub struct PositionManager {
    product_id: String,
    capital: f64,
    entry: Option<OpenEntry>,
    ledger: Vec<TradeRecord>,
}

impl PositionManager {
    pub fn new(product_id: impl Into<String>, capital: f64) -> Self {
        Self {
            product_id: product_id.into(),
            capital,
            entry: None,
            ledger: Vec::new(),
        }
    }

    /// Start ENTERED with a position that was opened before this process started
    pub fn with_open_position(
        product_id: impl Into<String>,
        capital: f64,
        entry_price: f64,
        size: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let mut manager = Self::new(product_id, capital);
        manager.entry = Some(OpenEntry {
            entry_time,
            entry_price,
            entry_size: size,
            size,
            entry_order_id: None,
            start_capital: capital + entry_price * size,
            sold_size: 0.0,
            sold_value: 0.0,
        });
        manager
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Available quote currency
    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn position_state(&self) -> PositionState {
        match &self.entry {
            None => PositionState::Flat,
            Some(entry) => PositionState::Entered {
                last_entry_price: entry.entry_price,
            },
        }
    }

    pub fn is_entered(&self) -> bool {
        self.entry.is_some()
    }

    /// Asset quantity currently held
    pub fn held_size(&self) -> f64 {
        self.entry.as_ref().map(|e| e.size).unwrap_or(0.0)
    }

    pub fn open_entry(&self) -> Option<&OpenEntry> {
        self.entry.as_ref()
    }

    /// Completed round trips, oldest first
    pub fn ledger(&self) -> &[TradeRecord] {
        &self.ledger
    }

    /// Book a BUY fill: FLAT -> ENTERED
    pub fn enter(&mut self, fill: Fill) -> Result<()> {
        if self.entry.is_some() {
            return Err(BotError::Position(format!(
                "Already entered {}, refusing second entry",
                self.product_id
            )));
        }
        validate_fill(&fill)?;

        let start_capital = self.capital;
        self.capital -= fill.price * fill.size + fill.fee;

        tracing::info!(
            product = %self.product_id,
            price = fill.price,
            size = fill.size,
            fee = fill.fee,
            capital = self.capital,
            "Entered position"
        );

        self.entry = Some(OpenEntry {
            entry_time: fill.timestamp,
            entry_price: fill.price,
            entry_size: fill.size,
            size: fill.size,
            entry_order_id: fill.order_id,
            start_capital,
            sold_size: 0.0,
            sold_value: 0.0,
        });

        Ok(())
    }

    /// Book a partial SELL fill; the position stays ENTERED with the remaining size
    pub fn reduce(&mut self, fill: Fill) -> Result<()> {
        validate_fill(&fill)?;
        let entry = self.entry.as_mut().ok_or_else(|| {
            BotError::Position("Cannot reduce a flat position".to_string())
        })?;

        if fill.size >= entry.size {
            return Err(BotError::Position(format!(
                "Partial fill of {} would close the remaining {}",
                fill.size, entry.size
            )));
        }

        entry.size -= fill.size;
        entry.sold_size += fill.size;
        entry.sold_value += fill.price * fill.size;
        self.capital += fill.price * fill.size - fill.fee;

        tracing::info!(
            product = %self.product_id,
            price = fill.price,
            size = fill.size,
            remaining = entry.size,
            "Reduced position"
        );

        Ok(())
    }

    /// Book the closing SELL fill: ENTERED -> FLAT, appends a trade record
    pub fn exit(&mut self, fill: Fill) -> Result<&TradeRecord> {
        validate_fill(&fill)?;
        let entry = self.entry.take().ok_or_else(|| {
            BotError::Position(format!("Not entered {}, nothing to exit", self.product_id))
        })?;

        if fill.size + 1e-9 < entry.size {
            tracing::warn!(
                product = %self.product_id,
                sold = fill.size,
                held = entry.size,
                "Closing fill smaller than held size, residual left unaccounted"
            );
        }

        self.capital += fill.price * fill.size - fill.fee;

        let exit_size = entry.sold_size + fill.size;
        let exit_price = (entry.sold_value + fill.price * fill.size) / exit_size;

        let record = TradeRecord {
            product_id: self.product_id.clone(),
            entry_time: entry.entry_time,
            entry_price: entry.entry_price,
            entry_size: entry.entry_size,
            entry_order_id: entry.entry_order_id,
            exit_time: fill.timestamp,
            exit_price,
            exit_size,
            exit_order_id: fill.order_id,
            start_capital: entry.start_capital,
            end_capital: self.capital,
            profit: self.capital - entry.start_capital,
            return_pct: (exit_price - entry.entry_price) / entry.entry_price,
        };

        tracing::info!(
            product = %self.product_id,
            entry = record.entry_price,
            exit = record.exit_price,
            return_pct = record.return_pct * 100.0,
            profit = record.profit,
            "Closed round trip"
        );

        self.ledger.push(record);
        // Just pushed
        Ok(&self.ledger[self.ledger.len() - 1])
    }

    /// Drop an entry that never got an exit, rolling capital back to its
    /// value before the entry
    pub fn discard_open_entry(&mut self) -> Option<OpenEntry> {
        let entry = self.entry.take()?;
        self.capital = entry.start_capital;
        Some(entry)
    }
}

fn validate_fill(fill: &Fill) -> Result<()> {
    if !(fill.price.is_finite() && fill.price > 0.0) {
        return Err(BotError::Position(format!("Invalid fill price {}", fill.price)));
    }
    if !(fill.size.is_finite() && fill.size > 0.0) {
        return Err(BotError::Position(format!("Invalid fill size {}", fill.size)));
    }
    Ok(())
}
