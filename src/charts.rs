// =============================================================================
// Chart Packs — per-instrument analysis artifacts for the predictor
// =============================================================================
//
// The renderer distills a bar series into the analytical content the
// predictor consumes: the 15-minute OHLC window, session high/low levels,
// the previous day's high/low, and numbered fair value gaps. The artifact
// is JSON on disk; rendering is CPU-bound-ish and synchronous, so the
// pre-warm pipeline runs it on the blocking pool under a width-4 semaphore.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Days, Duration};
use serde::Serialize;
use tracing::debug;

use crate::bars::{self, Bar};
use crate::types::Session;

/// Renders the analysis input for one instrument. Implementations must be
/// callable from the blocking pool.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, pair: &str, session: Session, bars: &[Bar], out_dir: &Path)
        -> Result<PathBuf>;
}

/// A detected fair value gap: a three-bar imbalance leaving untraded space.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FairValueGap {
    pub number: usize,
    /// "bullish" gaps open upward, "bearish" downward.
    pub kind: &'static str,
    pub lower: f64,
    pub upper: f64,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct ChartPack<'a> {
    pair: &'a str,
    session: &'static str,
    session_open: chrono::DateTime<chrono::Utc>,
    bars: Vec<PackBar>,
    prev_day_high: Option<f64>,
    prev_day_low: Option<f64>,
    window_high: Option<f64>,
    window_low: Option<f64>,
    fair_value_gaps: Vec<FairValueGap>,
}

#[derive(Debug, Serialize)]
struct PackBar {
    t: chrono::DateTime<chrono::Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
}

/// Maximum FVGs carried into the pack; older gaps fall off first.
const MAX_FVGS: usize = 8;

/// Default renderer writing JSON chart packs.
#[derive(Debug, Default)]
pub struct ChartPackRenderer;

impl ChartRenderer for ChartPackRenderer {
    fn render(
        &self,
        pair: &str,
        session: Session,
        bars: &[Bar],
        out_dir: &Path,
    ) -> Result<PathBuf> {
        anyhow::ensure!(!bars.is_empty(), "no bars to render for {pair}");

        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        // Previous-day high/low: the full UTC day before the session date.
        let day_start = session
            .open
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .context("invalid session date")?;
        let prev_day = bars::in_range(
            bars,
            day_start - Days::new(1),
            day_start - Duration::seconds(1),
        );

        let pack = ChartPack {
            pair,
            session: session.id.as_str(),
            session_open: session.open,
            bars: bars
                .iter()
                .map(|b| PackBar {
                    t: b.timestamp,
                    o: b.open,
                    h: b.high,
                    l: b.low,
                    c: b.close,
                })
                .collect(),
            prev_day_high: bars::range_high(&prev_day),
            prev_day_low: bars::range_low(&prev_day),
            window_high: bars::range_high(bars),
            window_low: bars::range_low(bars),
            fair_value_gaps: detect_fvgs(bars),
        };

        let filename = format!(
            "{pair}_{}_{}.json",
            session.open.format("%Y%m%d_%H%M"),
            session.id.as_str(),
        );
        let path = out_dir.join(filename);
        let json = serde_json::to_string(&pack).context("failed to serialize chart pack")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write chart pack {}", path.display()))?;

        debug!(pair, path = %path.display(), fvgs = pack.fair_value_gaps.len(), "chart pack rendered");
        Ok(path)
    }
}

/// Three-bar fair value gaps, numbered in creation order (higher = newer).
///
/// Bullish: bar N-2's high sits below bar N's low. Bearish: bar N-2's low
/// sits above bar N's high. Only the most recent MAX_FVGS are kept, with
/// numbering preserved.
pub fn detect_fvgs(bars: &[Bar]) -> Vec<FairValueGap> {
    let mut gaps = Vec::new();

    for (i, window) in bars.windows(3).enumerate() {
        let (first, last) = (&window[0], &window[2]);

        if first.high < last.low {
            gaps.push(FairValueGap {
                number: i + 1,
                kind: "bullish",
                lower: first.high,
                upper: last.low,
                at: last.timestamp,
            });
        } else if first.low > last.high {
            gaps.push(FairValueGap {
                number: i + 1,
                kind: "bearish",
                lower: last.high,
                upper: first.low,
                at: last.timestamp,
            });
        }
    }

    // Renumber densely after windowing so the predictor sees 1..=n.
    let start = gaps.len().saturating_sub(MAX_FVGS);
    gaps.drain(..start);
    for (n, gap) in gaps.iter_mut().enumerate() {
        gap.number = n + 1;
    }
    gaps
}
