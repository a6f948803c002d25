// =============================================================================
// Rolling Window & Percentile Materialization
// =============================================================================
//
// The rolling window is an append-only table of verified excursions keyed
// by (pair, session, session instant, model); re-appending the same key
// overwrites the excursion fields. Rows older than the window are flagged
// out with `in_window = 0` rather than deleted, which permits later
// re-materialization under a different window without data loss.
//
// `refresh_stats` rebuilds the percentile_targets table in one transaction
// from in-window rows only, so readers observe either the pre-refresh or
// post-refresh snapshot. Percentiles use linear interpolation between
// closest ranks (PERCENTILE_CONT semantics).
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::types::{Direction, SessionId};

use super::{round1, ts_from_sql, Database};

/// One verified prediction's excursion data.
#[derive(Debug, Clone)]
pub struct ExcursionRecord {
    pub pair: String,
    pub session: SessionId,
    pub session_datetime: DateTime<Utc>,
    pub model: String,
    pub prediction: Direction,
    pub correct: bool,
    pub mfe_pips: f64,
    pub mae_pips: f64,
}

/// Materialized percentile row consumed by the risk engine.
#[derive(Debug, Clone, Serialize)]
pub struct PercentileTargets {
    pub pair: String,
    pub session_name: String,
    pub model: String,
    pub sample_count: u32,
    pub accuracy_pct: f64,
    pub mfe_p25: f64,
    pub mfe_p50: f64,
    pub mfe_p75: f64,
    pub mae_p25: f64,
    pub mae_p50: f64,
    pub mae_p75: f64,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    // -------------------------------------------------------------------------
    // Rolling window
    // -------------------------------------------------------------------------

    /// Upsert an excursion record by its natural key.
    pub fn append_excursion(&self, record: &ExcursionRecord) -> Result<()> {
        let conn = self.connection().lock();
        conn.execute(
            "INSERT INTO rolling_window (
                pair, session_name, session_datetime, model,
                prediction, correct, mfe_pips, mae_pips, in_window, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
            ON CONFLICT (pair, session_name, session_datetime, model)
            DO UPDATE SET
                correct = excluded.correct,
                mfe_pips = excluded.mfe_pips,
                mae_pips = excluded.mae_pips",
            params![
                record.pair,
                record.session.as_str(),
                record.session_datetime.to_rfc3339(),
                record.model,
                record.prediction.as_str(),
                record.correct,
                round1(record.mfe_pips),
                round1(record.mae_pips),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("failed to upsert rolling window record")?;

        debug!(
            pair = %record.pair,
            session = %record.session,
            correct = record.correct,
            mfe = record.mfe_pips,
            mae = record.mae_pips,
            "excursion appended"
        );
        Ok(())
    }

    /// Delete every rolling-window row. Only the baseline importer calls
    /// this: a baseline replaces the window wholesale.
    pub fn clear_rolling_window(&self) -> Result<usize> {
        let conn = self.connection().lock();
        conn.execute("DELETE FROM rolling_window", [])
            .context("failed to clear rolling window")
    }

    /// Flag rows older than the configured window as out-of-window.
    /// Returns how many rows were flagged. Nothing is deleted.
    pub fn expire_old(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            .checked_sub_months(Months::new(self.rolling_window_months()))
            .context("window cutoff out of range")?;

        let conn = self.connection().lock();
        let flagged = conn
            .execute(
                "UPDATE rolling_window
                 SET in_window = 0
                 WHERE in_window = 1 AND session_datetime < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("failed to expire rolling window rows")?;

        if flagged > 0 {
            info!(flagged, cutoff = %cutoff, "rolling window rows expired");
        }
        Ok(flagged)
    }

    // -------------------------------------------------------------------------
    // Percentile materialization
    // -------------------------------------------------------------------------

    /// Rebuild percentile_targets from in-window rows. Returns the number of
    /// (pair, session, model) groups materialized.
    pub fn refresh_stats(&self) -> Result<usize> {
        let mut conn = self.connection().lock();
        let tx = conn.transaction().context("failed to begin refresh")?;

        // Group in-window excursions by (pair, session, model).
        let mut groups: BTreeMap<(String, String, String), Vec<(bool, f64, f64)>> =
            BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT pair, session_name, model, correct, mfe_pips, mae_pips
                 FROM rolling_window WHERE in_window = 1",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, bool>(3)?,
                    r.get::<_, f64>(4)?,
                    r.get::<_, f64>(5)?,
                ))
            })?;
            for row in rows {
                let (pair, session, model, correct, mfe, mae) = row?;
                groups
                    .entry((pair, session, model))
                    .or_default()
                    .push((correct, mfe, mae));
            }
        }

        tx.execute("DELETE FROM percentile_targets", [])?;

        let now = Utc::now().to_rfc3339();
        let group_count = groups.len();

        for ((pair, session, model), samples) in groups {
            let mut mfe: Vec<f64> = samples.iter().map(|s| s.1).collect();
            let mut mae: Vec<f64> = samples.iter().map(|s| s.2).collect();
            mfe.sort_by(|a, b| a.total_cmp(b));
            mae.sort_by(|a, b| a.total_cmp(b));

            let hits = samples.iter().filter(|s| s.0).count();
            let accuracy_pct = hits as f64 / samples.len() as f64 * 100.0;

            tx.execute(
                "INSERT INTO percentile_targets (
                    pair, session_name, model, sample_count, accuracy_pct,
                    mfe_p25, mfe_p50, mfe_p75, mae_p25, mae_p50, mae_p75,
                    updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    pair,
                    session,
                    model,
                    samples.len() as u32,
                    accuracy_pct,
                    percentile_cont(&mfe, 0.25),
                    percentile_cont(&mfe, 0.50),
                    percentile_cont(&mfe, 0.75),
                    percentile_cont(&mae, 0.25),
                    percentile_cont(&mae, 0.50),
                    percentile_cont(&mae, 0.75),
                    now,
                ],
            )?;
        }

        tx.commit().context("failed to commit refresh")?;
        info!(groups = group_count, "percentile targets refreshed");
        Ok(group_count)
    }

    /// Read one materialized percentile row.
    pub fn percentiles(
        &self,
        pair: &str,
        session: SessionId,
        model: &str,
    ) -> Result<Option<PercentileTargets>> {
        let conn = self.connection().lock();
        conn.query_row(
            &format!("{PERCENTILE_SELECT} WHERE pair = ?1 AND session_name = ?2 AND model = ?3"),
            params![pair, session.as_str(), model],
            percentile_from_row,
        )
        .optional()
        .context("failed to load percentiles")
    }

    /// All materialized rows, for the dashboard.
    pub fn all_percentiles(&self) -> Result<Vec<PercentileTargets>> {
        let conn = self.connection().lock();
        let mut stmt =
            conn.prepare(&format!("{PERCENTILE_SELECT} ORDER BY pair, session_name, model"))?;
        let rows = stmt
            .query_map([], percentile_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const PERCENTILE_SELECT: &str = "SELECT pair, session_name, model, sample_count, accuracy_pct,
        mfe_p25, mfe_p50, mfe_p75, mae_p25, mae_p50, mae_p75, updated_at
 FROM percentile_targets";

fn percentile_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PercentileTargets> {
    let updated_at: String = r.get(11)?;
    Ok(PercentileTargets {
        pair: r.get(0)?,
        session_name: r.get(1)?,
        model: r.get(2)?,
        sample_count: r.get(3)?,
        accuracy_pct: r.get(4)?,
        mfe_p25: r.get(5)?,
        mfe_p50: r.get(6)?,
        mfe_p75: r.get(7)?,
        mae_p25: r.get(8)?,
        mae_p50: r.get(9)?,
        mae_p75: r.get(10)?,
        updated_at: ts_from_sql(&updated_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

/// Continuous percentile of a sorted slice: linear interpolation between the
/// two closest ranks, matching SQL PERCENTILE_CONT.
fn percentile_cont(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let frac = rank - lower as f64;
            if lower + 1 < n {
                sorted[lower] + frac * (sorted[lower + 1] - sorted[lower])
            } else {
                sorted[n - 1]
            }
        }
    }
}
