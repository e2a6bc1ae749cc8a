use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::api::ExchangeClient;
use crate::error::{BotError, FetchRange, Result};
use crate::indicators::{IndicatorRow, IndicatorSeries};
use crate::models::{Candle, HistoricRate};

/// Candle history for one product, kept current from the exchange
///
/// Only closed buckets are stored, so a stored candle never changes. The
/// indicator series grows by appending the new rows of each update.
pub struct MarketDataFeed {
    client: Arc<dyn ExchangeClient>,
    product_id: String,
    granularity: Duration,
    max_rows_per_request: usize,
    series: IndicatorSeries,
}

impl MarketDataFeed {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        product_id: impl Into<String>,
        granularity_secs: u32,
        max_rows_per_request: usize,
    ) -> Self {
        Self {
            client,
            product_id: product_id.into(),
            granularity: Duration::seconds(i64::from(granularity_secs)),
            max_rows_per_request: max_rows_per_request.max(1),
            series: IndicatorSeries::new(),
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn history(&self) -> &IndicatorSeries {
        &self.series
    }

    pub fn latest(&self) -> Option<&IndicatorRow> {
        self.series.latest()
    }

    async fn server_time(&self, lookback: Duration) -> Result<DateTime<Utc>> {
        self.client.get_time().await.map_err(|e| {
            let now = Utc::now();
            BotError::Fetch {
                range: FetchRange {
                    start: now - lookback,
                    end: now,
                },
                reason: format!("Server time unavailable: {}", e),
            }
        })
    }

    /// Closed candles of the last `lookback`, oldest first
    pub async fn fetch_history(&self, lookback: Duration) -> Result<Vec<Candle>> {
        let end = self.server_time(lookback).await?;
        self.fetch_range(end - lookback, end, end).await
    }

    /// Closed candles in `[start, end)`, oldest first; does not touch the stored history
    pub async fn fetch_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let now = self.server_time(end - start).await?;
        self.fetch_range(start, end.min(now), now).await
    }

    /// Replace the stored history with the last `lookback` and compute indicators
    pub async fn initialize(&mut self, lookback: Duration) -> Result<usize> {
        let candles = self.fetch_history(lookback).await?;
        self.series = IndicatorSeries::from_candles(candles);

        tracing::info!(
            product = %self.product_id,
            rows = self.series.len(),
            first = ?self.series.rows().first().map(|r| r.timestamp()),
            last = ?self.series.last_timestamp(),
            "Loaded candle history"
        );

        Ok(self.series.len())
    }

    /// Fetch the candles closed since the last stored one and append them
    ///
    /// Returns how many rows were added; 0 when no new bucket has closed.
    pub async fn update(&mut self) -> Result<usize> {
        let Some(last) = self.series.last_timestamp() else {
            return Err(BotError::Fetch {
                range: FetchRange {
                    start: Utc::now(),
                    end: Utc::now(),
                },
                reason: "No history loaded, call initialize first".to_string(),
            });
        };

        let now = self.server_time(self.granularity).await?;
        let start = last + self.granularity;
        if now < start + self.granularity {
            return Ok(0);
        }

        let candles = self.fetch_range(start, now, now).await?;
        let added = self.series.extend(candles);

        tracing::debug!(
            product = %self.product_id,
            added,
            rows = self.series.len(),
            "Updated candle history"
        );

        Ok(added)
    }

    /// Fetch `[start, end)` in chronological chunks of at most `max_rows_per_request` rows
    ///
    /// Any failed chunk fails the whole call; nothing fetched so far is kept.
    async fn fetch_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        server_time: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let chunk = self.granularity * self.max_rows_per_request as i32;
        let granularity_secs = self.granularity.num_seconds() as u32;

        let mut candles = Vec::new();
        let mut chunk_start = start;

        while chunk_start < end {
            let chunk_end = (chunk_start + chunk).min(end);
            let range = FetchRange {
                start: chunk_start,
                end: chunk_end,
            };

            let rows = self
                .client
                .get_historic_rates(&self.product_id, chunk_start, chunk_end, granularity_secs)
                .await
                .map_err(|e| match e {
                    BotError::Fetch { .. } => e,
                    other => BotError::Fetch {
                        range,
                        reason: other.to_string(),
                    },
                })?;

            tracing::debug!(
                product = %self.product_id,
                rows = rows.len(),
                %range,
                "Fetched candle chunk"
            );

            // Rows arrive newest first
            for row in rows.into_iter().rev() {
                candles.push(to_candle(&row, range)?);
            }

            chunk_start = chunk_end;
        }

        Ok(self.normalize(candles, server_time))
    }

    /// Drop the still-forming bucket, sort, and keep the first-seen row per timestamp
    fn normalize(&self, mut candles: Vec<Candle>, server_time: DateTime<Utc>) -> Vec<Candle> {
        candles.retain(|c| c.timestamp + self.granularity <= server_time);
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        candles
    }
}

fn to_candle(row: &HistoricRate, range: FetchRange) -> Result<Candle> {
    let malformed = |reason: String| BotError::Fetch { range, reason };

    let timestamp = DateTime::from_timestamp(row.time, 0)
        .ok_or_else(|| malformed(format!("Invalid candle time {}", row.time)))?;

    let prices = [row.open, row.high, row.low, row.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(malformed(format!("Invalid prices in candle at {}", timestamp)));
    }
    if row.high < row.low || !row.volume.is_finite() || row.volume < 0.0 {
        return Err(malformed(format!("Inconsistent candle at {}", timestamp)));
    }

    Ok(Candle {
        timestamp,
        open: row.open,
        high: row.high,
        low: row.low,
        close: row.close,
        volume: row.volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperOperation};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn tape(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let price = 100.0 + i as f64;
                Candle {
                    timestamp: start() + Duration::minutes(i as i64),
                    open: price,
                    high: price + 1.0,
                    low: price - 1.0,
                    close: price + 0.5,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn setup(n: usize, max_rows: usize) -> (Arc<PaperExchange>, MarketDataFeed) {
        let exchange = Arc::new(
            PaperExchange::new("BTC-EUR", tape(n), Duration::minutes(1), 1000.0, 0.0)
                .with_max_rows_per_request(max_rows),
        );
        let feed = MarketDataFeed::new(exchange.clone(), "BTC-EUR", 60, max_rows);
        (exchange, feed)
    }

    #[tokio::test]
    async fn test_fetch_history_in_chunks() {
        let (exchange, feed) = setup(50, 7);
        exchange.set_time(start() + Duration::minutes(50)).await;

        let candles = feed.fetch_history(Duration::minutes(50)).await.unwrap();

        assert_eq!(candles.len(), 50);
        for (i, pair) in candles.windows(2).enumerate() {
            assert!(pair[1].timestamp > pair[0].timestamp, "unsorted at {}", i);
        }
        assert_eq!(candles[0].timestamp, start());
    }

    #[tokio::test]
    async fn test_forming_bucket_is_dropped() {
        let (exchange, feed) = setup(50, 300);
        // Candle 40 opened 30s ago and is still forming
        exchange
            .set_time(start() + Duration::minutes(40) + Duration::seconds(30))
            .await;

        let candles = feed.fetch_history(Duration::minutes(60)).await.unwrap();
        assert_eq!(candles.len(), 40);
        assert_eq!(candles.last().unwrap().timestamp, start() + Duration::minutes(39));
    }

    #[tokio::test]
    async fn test_update_appends_only_new_rows() {
        let (exchange, mut feed) = setup(100, 30);
        exchange.set_time(start() + Duration::minutes(60)).await;
        assert_eq!(feed.initialize(Duration::minutes(60)).await.unwrap(), 60);
        let before: Vec<IndicatorRow> = feed.history().rows().to_vec();

        // Nothing new closed yet
        exchange.set_time(start() + Duration::minutes(60) + Duration::seconds(59)).await;
        assert_eq!(feed.update().await.unwrap(), 0);

        exchange.set_time(start() + Duration::minutes(75)).await;
        assert_eq!(feed.update().await.unwrap(), 15);
        assert_eq!(feed.history().len(), 75);
        assert_eq!(&feed.history().rows()[..60], &before[..]);
        assert_eq!(
            feed.latest().unwrap().timestamp(),
            start() + Duration::minutes(74)
        );
    }

    #[tokio::test]
    async fn test_update_matches_full_recompute() {
        let (exchange, mut feed) = setup(300, 50);
        exchange.set_time(start() + Duration::minutes(220)).await;
        feed.initialize(Duration::minutes(220)).await.unwrap();

        exchange.set_time(start() + Duration::minutes(300)).await;
        feed.update().await.unwrap();

        let full = crate::indicators::compute_indicators(&tape(300));
        assert_eq!(feed.history().rows(), &full[..]);
    }

    #[tokio::test]
    async fn test_fetch_error_carries_range() {
        let (exchange, feed) = setup(50, 10);
        exchange.set_time(start() + Duration::minutes(50)).await;
        exchange.fail_next(PaperOperation::GetHistoricRates, 1).await;

        match feed.fetch_history(Duration::minutes(50)).await {
            Err(BotError::Fetch { range, .. }) => {
                assert_eq!(range.start, start());
                assert_eq!(range.end, start() + Duration::minutes(10));
            }
            other => panic!("expected fetch error, got {:?}", other.map(|c| c.len())),
        }
    }

    #[tokio::test]
    async fn test_update_failure_keeps_history() {
        let (exchange, mut feed) = setup(100, 300);
        exchange.set_time(start() + Duration::minutes(60)).await;
        feed.initialize(Duration::minutes(60)).await.unwrap();

        exchange.set_time(start() + Duration::minutes(70)).await;
        exchange.fail_next(PaperOperation::GetHistoricRates, 1).await;
        assert!(feed.update().await.is_err());
        assert_eq!(feed.history().len(), 60);

        assert_eq!(feed.update().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_rejected() {
        let mut candles = tape(10);
        candles[4].high = candles[4].low - 1.0;
        let exchange = Arc::new(PaperExchange::new(
            "BTC-EUR",
            candles,
            Duration::minutes(1),
            1000.0,
            0.0,
        ));
        let feed = MarketDataFeed::new(exchange, "BTC-EUR", 60, 300);

        let result = feed.fetch_history(Duration::minutes(10)).await;
        assert!(matches!(result, Err(BotError::Fetch { reason, .. }) if reason.contains("Inconsistent")));
    }

    #[tokio::test]
    async fn test_fetch_window_is_clamped_to_server_time() {
        let (exchange, feed) = setup(100, 25);
        exchange.set_time(start() + Duration::minutes(60)).await;

        let candles = feed
            .fetch_window(start() + Duration::minutes(10), start() + Duration::minutes(90))
            .await
            .unwrap();
        assert_eq!(candles.len(), 50);
        assert_eq!(candles[0].timestamp, start() + Duration::minutes(10));
        assert!(feed.history().is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_history() {
        let (_exchange, mut feed) = setup(10, 300);
        assert!(feed.update().await.is_err());
    }

    #[test]
    fn test_normalize_keeps_first_seen_duplicate() {
        let (_exchange, feed) = setup(0, 300);
        let mut candles = tape(3);
        let mut revised = candles[1].clone();
        revised.close = 999.0;
        candles.push(revised);
        candles.reverse();

        let normalized = feed.normalize(candles, start() + Duration::minutes(10));
        assert_eq!(normalized.len(), 3);
        // The revised copy was seen first after the reverse
        assert_eq!(normalized[1].close, 999.0);
    }
}
