// =============================================================================
// Bar data — OHLCV bars and the per-instrument pre-warm cache
// =============================================================================

pub mod client;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use client::BarClient;

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Highest high over a slice of bars.
pub fn range_high(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.high).fold(None, |acc, h| {
        Some(acc.map_or(h, |a: f64| a.max(h)))
    })
}

/// Lowest low over a slice of bars.
pub fn range_low(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.low).fold(None, |acc, l| {
        Some(acc.map_or(l, |a: f64| a.min(l)))
    })
}

/// Close of the last bar in a slice.
pub fn last_close(bars: &[Bar]) -> Option<f64> {
    bars.last().map(|b| b.close)
}

/// Bars whose timestamp falls within `[start, end]` inclusive.
pub fn in_range(bars: &[Bar], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bar> {
    bars.iter()
        .copied()
        .filter(|b| b.timestamp >= start && b.timestamp <= end)
        .collect()
}

// ---------------------------------------------------------------------------
// BarCache — single-writer pre-warm cache keyed by pair
// ---------------------------------------------------------------------------

/// Thread-safe cache of pre-warmed bar series, filled at T-120s and cleared
/// at the end of the execute handler.
#[derive(Default)]
pub struct BarCache {
    series: RwLock<HashMap<String, Vec<Bar>>>,
}

impl BarCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pair: &str, bars: Vec<Bar>) {
        self.series.write().insert(pair.to_string(), bars);
    }

    pub fn get(&self, pair: &str) -> Option<Vec<Bar>> {
        self.series.read().get(pair).cloned()
    }

    pub fn contains(&self, pair: &str) -> bool {
        self.series.read().contains_key(pair)
    }

    /// Close of the most recent cached bar for a pair.
    pub fn last_close(&self, pair: &str) -> Option<f64> {
        self.series.read().get(pair).and_then(|bars| last_close(bars))
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    pub fn clear(&self) {
        self.series.write().clear();
    }

    /// Pairs currently cached, for the input pre-warm fan-out.
    pub fn pairs(&self) -> Vec<String> {
        self.series.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(ts_min: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 7, 15, 8, 0, 0).unwrap()
                + chrono::Duration::minutes(ts_min),
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn range_extremes_and_last_close() {
        let bars = vec![
            bar(0, 1.10, 1.12, 1.09, 1.11),
            bar(15, 1.11, 1.15, 1.10, 1.14),
            bar(30, 1.14, 1.14, 1.08, 1.09),
        ];
        assert_eq!(range_high(&bars), Some(1.15));
        assert_eq!(range_low(&bars), Some(1.08));
        assert_eq!(last_close(&bars), Some(1.09));
        assert_eq!(range_high(&[]), None);
    }

    #[test]
    fn in_range_is_inclusive() {
        let bars = vec![bar(0, 1.0, 1.0, 1.0, 1.0), bar(15, 1.0, 1.0, 1.0, 1.0)];
        let start = bars[0].timestamp;
        let end = bars[1].timestamp;
        assert_eq!(in_range(&bars, start, end).len(), 2);
        assert_eq!(in_range(&bars, start, end - chrono::Duration::seconds(1)).len(), 1);
    }

    #[test]
    fn cache_insert_get_clear() {
        let cache = BarCache::new();
        assert!(cache.is_empty());
        cache.insert("EURUSD", vec![bar(0, 1.0, 1.1, 0.9, 1.05)]);
        assert!(cache.contains("EURUSD"));
        assert_eq!(cache.last_close("EURUSD"), Some(1.05));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.get("EURUSD").is_none());
    }
}
