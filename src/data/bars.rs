//! In-memory OHLCV bars, loadable from CSV.

use super::{DataProvider, HistoryWindow, PriceField, PriceRange, Series};
use crate::error::DataError;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One bar covering `[start, end)`.
///
/// The open is known from `start`; high, low, close and volume only once
/// the bar has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    fn value(&self, field: PriceField) -> Decimal {
        match field {
            PriceField::Open => self.open,
            PriceField::High => self.high,
            PriceField::Low => self.low,
            PriceField::Close => self.close,
            PriceField::Volume => self.volume,
        }
    }

    /// When `field` becomes known.
    fn known_at(&self, field: PriceField) -> NaiveDateTime {
        match field {
            PriceField::Open => self.start,
            _ => self.end,
        }
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.start >= self.end {
            return Err(format!("bar start {} is not before end {}", self.start, self.end));
        }
        if self.low > self.high {
            return Err(format!("low {} above high {}", self.low, self.high));
        }
        for (name, price) in [("open", self.open), ("close", self.close)] {
            if price < self.low || price > self.high {
                return Err(format!("{} {} outside low/high", name, price));
            }
        }
        Ok(())
    }
}

/// Bar-backed data provider.
///
/// Expected CSV format:
/// ```csv
/// start,end,symbol,open,high,low,close,volume
/// 2024-01-02T09:30:00,2024-01-02T16:00:00,SPY,472.16,473.67,470.49,472.65,123623700
/// ```
#[derive(Debug, Clone, Default)]
pub struct BarDataProvider {
    /// Bars per symbol, sorted by start, non-overlapping
    bars: BTreeMap<String, Vec<Bar>>,
}

impl BarDataProvider {
    /// Load bars from a CSV file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        Self::from_csv_content(&content)
            .with_context(|| format!("Failed to load bars from {}", path.display()))
    }

    /// Parse bars from CSV content.
    pub fn from_csv_content(content: &str) -> std::result::Result<Self, DataError> {
        let mut rows: Vec<(String, Bar)> = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line_num = idx + 1;
            if line.trim().is_empty() || (idx == 0 && line.starts_with("start")) {
                continue;
            }

            let row = parse_row(line).map_err(|reason| DataError::Malformed {
                line: line_num,
                reason,
            })?;
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(DataError::Malformed {
                line: 0,
                reason: "CSV contains no data rows".to_string(),
            });
        }

        let mut by_symbol: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
        for (symbol, bar) in rows {
            by_symbol.entry(symbol).or_default().push(bar);
        }

        Self::from_bars(by_symbol)
    }

    /// Build from in-memory bars. Bars are sorted and must not overlap.
    pub fn from_bars(
        bars: impl IntoIterator<Item = (String, Vec<Bar>)>,
    ) -> std::result::Result<Self, DataError> {
        let mut by_symbol: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
        for (symbol, series) in bars {
            by_symbol.entry(symbol).or_default().extend(series);
        }

        for (symbol, series) in by_symbol.iter_mut() {
            series.sort_by_key(|b| b.start);
            for (i, bar) in series.iter().enumerate() {
                bar.check().map_err(|reason| DataError::Malformed {
                    line: 0,
                    reason: format!("{} bar {}: {}", symbol, i, reason),
                })?;
            }
            if let Some(pair) = series.windows(2).find(|w| w[1].start < w[0].end) {
                return Err(DataError::Malformed {
                    line: 0,
                    reason: format!("{} bars overlap at {}", symbol, pair[1].start),
                });
            }
        }

        Ok(Self { bars: by_symbol })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.bars.keys().cloned().collect()
    }

    /// First bar start and last bar end for `symbol`.
    pub fn coverage(&self, symbol: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let bars = self.bars.get(symbol)?;
        Some((bars.first()?.start, bars.last()?.end))
    }

    pub fn len(&self) -> usize {
        self.bars.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn series(&self, symbol: &str) -> std::result::Result<&[Bar], DataError> {
        self.bars
            .get(symbol)
            .map(Vec::as_slice)
            .ok_or_else(|| DataError::UnknownSymbol(symbol.to_string()))
    }
}

impl DataProvider for BarDataProvider {
    fn quote(&self, symbol: &str, at: NaiveDateTime) -> std::result::Result<Decimal, DataError> {
        let bars = self.series(symbol)?;
        let idx = bars.partition_point(|b| b.start <= at);
        if idx == 0 {
            return Err(DataError::OutOfCoverage {
                symbol: symbol.to_string(),
                at,
            });
        }

        let bar = &bars[idx - 1];
        Ok(if bar.end <= at { bar.close } else { bar.open })
    }

    fn history(
        &self,
        symbol: &str,
        field: PriceField,
        window: HistoryWindow,
        end: NaiveDateTime,
    ) -> std::result::Result<Series, DataError> {
        let bars = self.series(symbol)?;
        let known: Vec<(NaiveDateTime, Decimal)> = bars
            .iter()
            .filter(|b| b.known_at(field) <= end)
            .map(|b| (b.known_at(field), b.value(field)))
            .collect();

        if known.is_empty() {
            return Err(DataError::OutOfCoverage {
                symbol: symbol.to_string(),
                at: end,
            });
        }

        Ok(match window {
            HistoryWindow::Length(n) => {
                let skip = known.len().saturating_sub(n);
                known.into_iter().skip(skip).collect()
            }
            HistoryWindow::Since(start) => known.into_iter().filter(|(t, _)| *t >= start).collect(),
        })
    }

    fn price_range(
        &self,
        symbol: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> std::result::Result<Option<PriceRange>, DataError> {
        let bars = self.series(symbol)?;
        let mut range: Option<PriceRange> = None;

        for bar in bars.iter().take_while(|b| b.start <= to) {
            let observed = if bar.end <= to {
                if bar.start >= from {
                    Some(PriceRange {
                        low: bar.low,
                        high: bar.high,
                    })
                } else {
                    // straddles placement: its low and high may predate the order
                    (bar.end > from).then(|| PriceRange::point(bar.close))
                }
            } else {
                // still forming: only its open is known
                (bar.start > from).then(|| PriceRange::point(bar.open))
            };

            if let Some(observed) = observed {
                range = Some(match range {
                    Some(r) => r.merge(observed),
                    None => observed,
                });
            }
        }

        Ok(range)
    }
}

fn parse_row(line: &str) -> std::result::Result<(String, Bar), String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 8 {
        return Err(format!(
            "Expected 8 columns (start,end,symbol,open,high,low,close,volume), got {}",
            parts.len()
        ));
    }

    let time = |s: &str| {
        s.parse::<NaiveDateTime>()
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
            .map_err(|_| format!("Invalid timestamp: {}", s))
    };
    let num = |name: &str, s: &str| {
        s.parse::<Decimal>()
            .map_err(|_| format!("Invalid {}: {}", name, s))
    };

    let symbol = parts[2].to_string();
    if symbol.is_empty() {
        return Err("Empty symbol".to_string());
    }

    Ok((
        symbol,
        Bar {
            start: time(parts[0])?,
            end: time(parts[1])?,
            open: num("open", parts[3])?,
            high: num("high", parts[4])?,
            low: num("low", parts[5])?,
            close: num("close", parts[6])?,
            volume: num("volume", parts[7])?,
        },
    ))
}
