//! Historical bar loading for backtesting and warm-up.

use crate::exchange::{Bar, HistoryProvider, Resolution};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// All bars sharing one timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSnapshot {
    pub timestamp: DateTime<Utc>,
    pub bars: Vec<Bar>,
}

impl BarSnapshot {
    /// Closes by symbol, for pushing into the paper broker.
    pub fn prices(&self) -> HashMap<String, Decimal> {
        self.bars
            .iter()
            .map(|b| (b.symbol.clone(), b.close))
            .collect()
    }
}

/// Trait for loading historical market data.
pub trait DataLoader: Send + Sync {
    /// Load all snapshots in the given time range (inclusive).
    fn load_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<BarSnapshot>>;

    /// Get the available date range in the data.
    fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;

    /// Get all available symbols.
    fn available_symbols(&self) -> Vec<String>;
}

/// CSV bar loader.
///
/// Expected CSV format:
/// ```csv
/// timestamp,symbol,open,high,low,close,volume
/// 2024-01-02T21:00:00Z,AAPL,187.15,188.44,183.89,185.64,82488700
/// ```
#[derive(Debug, Clone)]
pub struct CsvBarLoader {
    /// Snapshots sorted by timestamp
    snapshots: Vec<BarSnapshot>,
    /// Bars per symbol sorted by timestamp
    by_symbol: HashMap<String, Vec<Bar>>,
    symbols: Vec<String>,
}

impl CsvBarLoader {
    /// Load data from a CSV file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        Self::from_csv_content(&content)
    }

    /// Load data from CSV content string.
    pub fn from_csv_content(content: &str) -> Result<Self> {
        let mut bars = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.starts_with("timestamp") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let bar = parse_row(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            bars.push(bar);
        }

        if bars.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        Ok(Self::from_bars(bars))
    }

    /// Create a loader from in-memory bars.
    pub fn from_bars(bars: Vec<Bar>) -> Self {
        let mut by_timestamp: BTreeMap<DateTime<Utc>, Vec<Bar>> = BTreeMap::new();
        let mut by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
        let mut symbols: HashSet<String> = HashSet::new();

        for bar in bars {
            symbols.insert(bar.symbol.clone());
            by_symbol
                .entry(bar.symbol.clone())
                .or_default()
                .push(bar.clone());
            by_timestamp.entry(bar.timestamp).or_default().push(bar);
        }

        for series in by_symbol.values_mut() {
            series.sort_by_key(|b| b.timestamp);
            series.dedup_by_key(|b| b.timestamp);
        }

        let snapshots = by_timestamp
            .into_iter()
            .map(|(timestamp, bars)| BarSnapshot { timestamp, bars })
            .collect();

        let mut symbols: Vec<String> = symbols.into_iter().collect();
        symbols.sort();

        Self {
            snapshots,
            by_symbol,
            symbols,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Bars of `symbol` strictly before `end`, consolidated per UTC day.
    pub fn daily_bars(&self, symbol: &str, end: DateTime<Utc>) -> Vec<Bar> {
        let Some(series) = self.by_symbol.get(symbol) else {
            return Vec::new();
        };
        consolidate_daily(series.iter().take_while(|b| b.timestamp < end))
    }
}

impl DataLoader for CsvBarLoader {
    fn load_snapshots(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BarSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect())
    }

    fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.snapshots.first()?.timestamp, self.snapshots.last()?.timestamp))
    }

    fn available_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }
}

impl HistoryProvider for CsvBarLoader {
    fn history(
        &self,
        symbols: &[String],
        lookback: usize,
        resolution: Resolution,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let mut result = Vec::new();

        for symbol in symbols {
            let series: Vec<Bar> = match resolution {
                Resolution::Daily => self.daily_bars(symbol, end),
                // Stored bars are returned as-is for intraday resolutions
                Resolution::Minute | Resolution::Hour => self
                    .by_symbol
                    .get(symbol)
                    .map(|s| s.iter().take_while(|b| b.timestamp < end).cloned().collect())
                    .unwrap_or_default(),
            };

            let start = series.len().saturating_sub(lookback);
            result.extend(series.into_iter().skip(start));
        }

        Ok(result)
    }
}

/// Merge bars into one bar per UTC date: first open, max high, min low, last close.
fn consolidate_daily<'a>(bars: impl Iterator<Item = &'a Bar>) -> Vec<Bar> {
    let mut days: BTreeMap<NaiveDate, Bar> = BTreeMap::new();

    for bar in bars {
        days.entry(bar.timestamp.date_naive())
            .and_modify(|day| {
                day.high = day.high.max(bar.high);
                day.low = day.low.min(bar.low);
                day.close = bar.close;
                day.volume += bar.volume;
                day.timestamp = bar.timestamp;
            })
            .or_insert_with(|| bar.clone());
    }

    days.into_values().collect()
}

fn parse_row(line: &str) -> Result<Bar> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 7 {
        anyhow::bail!(
            "Expected 7 columns (timestamp,symbol,open,high,low,close,volume), got {}",
            parts.len()
        );
    }

    let decimal = |idx: usize, name: &str| -> Result<Decimal> {
        parts[idx]
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, parts[idx]))
    };

    Ok(Bar {
        timestamp: parts[0]
            .trim()
            .parse()
            .with_context(|| format!("Invalid timestamp: {}", parts[0]))?,
        symbol: parts[1].trim().to_string(),
        open: decimal(2, "open")?,
        high: decimal(3, "high")?,
        low: decimal(4, "low")?,
        close: decimal(5, "close")?,
        volume: decimal(6, "volume")?,
    })
}
