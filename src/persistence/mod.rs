use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{BotError, Result};
use crate::models::TradeRecord;

pub const LEDGER_COLUMNS: [&str; 13] = [
    "entry_date",
    "entry_price",
    "entry_size",
    "entry_id",
    "exit_date",
    "exit_price",
    "exit_size",
    "exit_id",
    "start_capital",
    "end_capital",
    "return",
    "profit",
    "product_id",
];

/// One CSV row; field order is the column order of `LEDGER_COLUMNS`
#[derive(Debug, Serialize, Deserialize)]
struct LedgerRow {
    entry_date: DateTime<Utc>,
    entry_price: f64,
    entry_size: f64,
    entry_id: Option<String>,
    exit_date: DateTime<Utc>,
    exit_price: f64,
    exit_size: f64,
    exit_id: Option<String>,
    start_capital: f64,
    end_capital: f64,
    #[serde(rename = "return")]
    return_pct: f64,
    profit: f64,
    product_id: String,
}

impl From<&TradeRecord> for LedgerRow {
    fn from(trade: &TradeRecord) -> Self {
        Self {
            entry_date: trade.entry_time,
            entry_price: trade.entry_price,
            entry_size: trade.entry_size,
            entry_id: trade.entry_order_id.clone(),
            exit_date: trade.exit_time,
            exit_price: trade.exit_price,
            exit_size: trade.exit_size,
            exit_id: trade.exit_order_id.clone(),
            start_capital: trade.start_capital,
            end_capital: trade.end_capital,
            return_pct: trade.return_pct,
            profit: trade.profit,
            product_id: trade.product_id.clone(),
        }
    }
}

impl From<LedgerRow> for TradeRecord {
    fn from(row: LedgerRow) -> Self {
        Self {
            product_id: row.product_id,
            entry_time: row.entry_date,
            entry_price: row.entry_price,
            entry_size: row.entry_size,
            entry_order_id: row.entry_id.filter(|id| !id.is_empty()),
            exit_time: row.exit_date,
            exit_price: row.exit_price,
            exit_size: row.exit_size,
            exit_order_id: row.exit_id.filter(|id| !id.is_empty()),
            start_capital: row.start_capital,
            end_capital: row.end_capital,
            profit: row.profit,
            return_pct: row.return_pct,
        }
    }
}

/// Append-only CSV file of completed round trips
///
/// Tracks how many records of the caller's ledger have been written, so a
/// failed append can be retried later with `flush_pending`.
#[derive(Debug)]
pub struct TradeLedger {
    path: PathBuf,
    persisted: usize,
}

impl TradeLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persisted: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written by this ledger
    pub fn persisted(&self) -> usize {
        self.persisted
    }

    /// Append one record, writing the header first if the file is new
    pub fn append(&mut self, trade: &TradeRecord) -> Result<()> {
        write_rows(&self.path, std::slice::from_ref(trade))?;
        self.persisted += 1;

        tracing::debug!(
            path = %self.path.display(),
            persisted = self.persisted,
            "Trade appended to ledger"
        );
        Ok(())
    }

    /// Append the records of `trades` that were not persisted yet
    ///
    /// Returns how many rows were written.
    pub fn flush_pending(&mut self, trades: &[TradeRecord]) -> Result<usize> {
        let pending = trades.get(self.persisted..).unwrap_or_default();
        if pending.is_empty() {
            return Ok(0);
        }

        write_rows(&self.path, pending)?;
        self.persisted += pending.len();

        tracing::info!(
            path = %self.path.display(),
            written = pending.len(),
            total = self.persisted,
            "Flushed pending trades to ledger"
        );
        Ok(pending.len())
    }

    /// Write a complete ledger, replacing any existing file
    pub fn write_all(path: impl AsRef<Path>, trades: &[TradeRecord]) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        write_rows(path, trades)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Vec<TradeRecord>> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;

        let header = reader.headers()?;
        if header.is_empty() {
            return Ok(Vec::new());
        }
        if !header.iter().eq(LEDGER_COLUMNS) {
            return Err(BotError::Ledger(format!(
                "Unexpected ledger header in {}: {}",
                path.display(),
                header.iter().collect::<Vec<_>>().join(",")
            )));
        }

        reader
            .deserialize::<LedgerRow>()
            .map(|row| {
                row.map(TradeRecord::from)
                    .map_err(|e| BotError::Ledger(format!("{}: {}", path.display(), e)))
            })
            .collect()
    }
}

fn write_rows(path: &Path, trades: &[TradeRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if is_new {
        writer.write_record(LEDGER_COLUMNS)?;
    }
    for trade in trades {
        writer.serialize(LedgerRow::from(trade))?;
    }
    writer.flush()?;
    Ok(())
}
