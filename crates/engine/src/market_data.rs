//! In-memory kline cache feeding the bar simulator

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::api::BinanceClient;
use crate::backtest::{BacktestWindow, Timeframe};
use crate::types::Kline;

const MS_PER_DAY: i64 = 86_400_000;

/// First millisecond of `date` (UTC)
pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Last millisecond of `date` (UTC)
pub fn day_end_ms(date: NaiveDate) -> i64 {
    day_start_ms(date) + MS_PER_DAY - 1
}

/// Klines keyed by (symbol, timeframe), each series sorted by open time
#[derive(Debug, Default)]
pub struct MarketDataStore {
    series: HashMap<(String, Timeframe), Vec<Kline>>,
}

impl MarketDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge klines into a series; later bars with the same open time win
    pub fn insert(&mut self, symbol: &str, timeframe: Timeframe, klines: Vec<Kline>) {
        let series = self
            .series
            .entry((symbol.to_uppercase(), timeframe))
            .or_default();
        series.extend(klines);
        series.sort_by_key(|k| k.open_time);
        // keep the last of each run of equal open times
        series.reverse();
        series.dedup_by_key(|k| k.open_time);
        series.reverse();
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<&[Kline]> {
        self.series
            .get(&(symbol.to_uppercase(), timeframe))
            .map(Vec::as_slice)
    }

    /// Bars whose open time falls inside the window's inclusive date range
    pub fn slice(&self, window: &BacktestWindow) -> &[Kline] {
        let Some(series) = self.get(&window.symbol, window.timeframe) else {
            return &[];
        };
        let start = day_start_ms(window.start_date);
        let end = day_end_ms(window.end_date);

        let lo = series.partition_point(|k| k.open_time < start);
        let hi = series.partition_point(|k| k.open_time <= end);
        if lo >= hi {
            &[]
        } else {
            &series[lo..hi]
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Load a JSON array of klines from disk into the window's series
    pub async fn load_json(&mut self, path: impl AsRef<Path>, window: &BacktestWindow) -> Result<usize> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read klines from {}", path.display()))?;
        let klines: Vec<Kline> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid kline JSON in {}", path.display()))?;
        let count = klines.len();

        info!(path = %path.display(), symbol = %window.symbol, count, "Loaded klines from file");
        self.insert(&window.symbol, window.timeframe, klines);
        Ok(count)
    }

    /// Download the window's klines from Binance
    pub async fn fetch_from_binance(
        &mut self,
        client: &BinanceClient,
        window: &BacktestWindow,
    ) -> Result<usize> {
        let klines = client
            .get_klines_paginated(
                &window.symbol.to_uppercase(),
                window.timeframe.interval(),
                day_start_ms(window.start_date),
                day_end_ms(window.end_date),
            )
            .await?;
        let count = klines.len();
        self.insert(&window.symbol, window.timeframe, klines);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn kline_on(date: NaiveDate, close: i64) -> Kline {
        let open_time = day_start_ms(date);
        Kline {
            open_time,
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            close_time: open_time + MS_PER_DAY - 1,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn window(start: NaiveDate, end: NaiveDate) -> BacktestWindow {
        BacktestWindow {
            symbol: "BTCUSDT".to_string(),
            start_date: start,
            end_date: end,
            timeframe: Timeframe::Daily,
        }
    }

    fn january() -> MarketDataStore {
        let mut store = MarketDataStore::new();
        let klines = (1..=31).map(|d| kline_on(date(2024, 1, d), d as i64)).collect();
        store.insert("btcusdt", Timeframe::Daily, klines);
        store
    }

    #[test]
    fn test_slice_is_inclusive_on_both_ends() {
        let store = january();
        let bars = store.slice(&window(date(2024, 1, 10), date(2024, 1, 12)));
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, Decimal::from(10));
        assert_eq!(bars[2].close, Decimal::from(12));
    }

    #[test]
    fn test_slice_outside_range_is_empty() {
        let store = january();
        assert!(store.slice(&window(date(2024, 3, 1), date(2024, 3, 5))).is_empty());
        assert!(store.slice(&window(date(2024, 1, 12), date(2024, 1, 10))).is_empty());
    }

    #[test]
    fn test_unknown_series_is_empty() {
        let store = january();
        let mut w = window(date(2024, 1, 1), date(2024, 1, 31));
        w.timeframe = Timeframe::Weekly;
        assert!(store.slice(&w).is_empty());
    }

    #[test]
    fn test_insert_sorts_and_dedups() {
        let mut store = MarketDataStore::new();
        store.insert(
            "ETHUSDT",
            Timeframe::Daily,
            vec![kline_on(date(2024, 1, 3), 3), kline_on(date(2024, 1, 1), 1)],
        );
        store.insert("ETHUSDT", Timeframe::Daily, vec![kline_on(date(2024, 1, 3), 30)]);

        let series = store.get("ethusdt", Timeframe::Daily).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].close, Decimal::from(1));
        assert_eq!(series[1].close, Decimal::from(30));
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let path = std::env::temp_dir().join(format!("evolver-klines-{}.json", std::process::id()));
        let klines: Vec<Kline> = (1..=5).map(|d| kline_on(date(2024, 2, d), d as i64)).collect();
        std::fs::write(&path, serde_json::to_string(&klines).unwrap()).unwrap();

        let mut store = MarketDataStore::new();
        let w = window(date(2024, 2, 1), date(2024, 2, 29));
        let count = store.load_json(&path, &w).await.unwrap();

        assert_eq!(count, 5);
        assert_eq!(store.slice(&w).len(), 5);
        let _ = std::fs::remove_file(&path);
    }
}
