// =============================================================================
// Baseline Importer — seed the rolling window from a JSON-lines export
// =============================================================================
//
// One-shot tool: reads excursion records from a .jsonl file, clears the
// rolling window, bulk-inserts the baseline, and refreshes the percentile
// materialization so the engine can size positions from day one.
//
// Line format:
//   {"pair":"EURUSD","session_name":"London_Open",
//    "session_datetime":"2024-05-02T07:00:00Z","model":"claude_haiku_45",
//    "prediction":"BULLISH","correct":true,"mfe_pips":23.4,"mae_pips":8.1}
//
// Usage:
//   import_baseline data/baseline.jsonl
// =============================================================================

use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian_fx::config::Settings;
use meridian_fx::store::rolling::ExcursionRecord;
use meridian_fx::store::Database;
use meridian_fx::types::{Direction, SessionId};

#[derive(Debug, Deserialize)]
struct BaselineRow {
    pair: String,
    session_name: String,
    session_datetime: DateTime<Utc>,
    #[serde(default = "default_model")]
    model: String,
    prediction: String,
    correct: bool,
    mfe_pips: f64,
    mae_pips: f64,
}

fn default_model() -> String {
    "claude_haiku_45".to_string()
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: import_baseline <baseline.jsonl>")?;

    let settings = Settings::from_env();
    let db = Database::open(&settings.database_url, &settings)?;

    info!(source = %path, db = %settings.database_url, "importing baseline");

    let file = std::fs::File::open(&path).with_context(|| format!("failed to open {path}"))?;
    let reader = BufReader::new(file);

    // Replace, not append: the baseline defines the window.
    let cleared = db.clear_rolling_window()?;
    info!(cleared, "cleared existing rolling window");

    let mut imported = 0usize;
    let mut skipped = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        let row: BaselineRow = match serde_json::from_str(&line) {
            Ok(row) => row,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping malformed row");
                skipped += 1;
                continue;
            }
        };

        let session: SessionId = match row.session_name.parse() {
            Ok(session) => session,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping row with unknown session");
                skipped += 1;
                continue;
            }
        };
        let prediction: Direction = match row.prediction.parse() {
            Ok(direction) => direction,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping row with unknown prediction");
                skipped += 1;
                continue;
            }
        };

        db.append_excursion(&ExcursionRecord {
            pair: row.pair,
            session,
            session_datetime: row.session_datetime,
            model: row.model,
            prediction,
            correct: row.correct,
            mfe_pips: row.mfe_pips,
            mae_pips: row.mae_pips,
        })?;
        imported += 1;
    }

    // Rows older than the window are flagged out before materializing.
    let expired = db.expire_old(Utc::now())?;
    let groups = db.refresh_stats()?;

    info!(imported, skipped, expired, groups, "baseline import complete");

    for stats in db.all_percentiles()?.iter().take(10) {
        info!(
            pair = %stats.pair,
            session = %stats.session_name,
            n = stats.sample_count,
            accuracy = format!("{:.1}%", stats.accuracy_pct),
            mfe_p50 = format!("{:.1}", stats.mfe_p50),
            mae_p50 = format!("{:.1}", stats.mae_p50),
            "percentile target"
        );
    }

    Ok(())
}
