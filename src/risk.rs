// =============================================================================
// Risk Engine — TP/SL distances and position sizing from rolling percentiles
// =============================================================================
//
// TP distance comes from the configured MFE percentile and SL distance from
// the configured MAE percentile (defaults P75/P50), both floored at 5 pips
// so that thin windows cannot emit sub-spread targets.
//
// Lot sizing: risk_cash = balance * risk% / 100,
//             lots = risk_cash / (sl_pips * pip_cash_per_lot),
// rounded to 0.01 and clamped to [min_lot, max_lot].
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::debug;

use crate::config::{Percentile, Settings};
use crate::instruments;
use crate::store::rolling::PercentileTargets;
use crate::store::Database;
use crate::types::{Direction, SessionId};

/// Minimum TP/SL distance in pips.
const MIN_TARGET_PIPS: f64 = 5.0;
/// Samples required before the window is trusted.
const MIN_SAMPLE_COUNT: u32 = 30;

/// Full parameter set for opening a position.
#[derive(Debug, Clone, Serialize)]
pub struct RiskParameters {
    pub pair: String,
    pub session: SessionId,
    pub direction: Direction,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub lot_size: f64,
    pub risk_cash: Decimal,
    pub spread_pips: f64,
    pub tp_percentile: Percentile,
    pub sl_percentile: Percentile,
}

/// Outcome of a risk computation. Insufficient data is an expected state,
/// not an error: the instrument is skipped for this session.
#[derive(Debug, Clone)]
pub enum RiskDecision {
    Parameters(RiskParameters),
    InsufficientData { reason: String },
}

pub struct RiskEngine {
    db: Arc<Database>,
    settings: Settings,
}

impl RiskEngine {
    pub fn new(db: Arc<Database>, settings: Settings) -> Self {
        Self { db, settings }
    }

    /// Derive entry/TP/SL/size for a prospective position.
    pub fn compute(
        &self,
        pair: &str,
        session: SessionId,
        model: &str,
        direction: Direction,
        entry_price: f64,
        balance: Decimal,
    ) -> Result<RiskDecision> {
        let Some(targets) = self.db.percentiles(pair, session, model)? else {
            return Ok(RiskDecision::InsufficientData {
                reason: format!("no percentile data for {pair}/{session}"),
            });
        };

        if targets.sample_count < MIN_SAMPLE_COUNT {
            return Ok(RiskDecision::InsufficientData {
                reason: format!(
                    "{} samples for {pair}/{session} (need {MIN_SAMPLE_COUNT})",
                    targets.sample_count
                ),
            });
        }

        let tp_pips = percentile_value(&targets, Stat::Mfe, self.settings.tp_percentile)
            .max(MIN_TARGET_PIPS);
        let sl_pips = percentile_value(&targets, Stat::Mae, self.settings.sl_percentile)
            .max(MIN_TARGET_PIPS);

        // Long has TP above and SL below; short is mirrored.
        let tp_diff = instruments::pips_to_price_diff(pair, tp_pips);
        let sl_diff = instruments::pips_to_price_diff(pair, sl_pips);
        let (take_profit, stop_loss) = match direction {
            Direction::Bullish => (entry_price + tp_diff, entry_price - sl_diff),
            Direction::Bearish => (entry_price - tp_diff, entry_price + sl_diff),
        };

        let (lot_size, risk_cash) = self.position_size(pair, sl_pips, balance);

        let spread_pips = crate::config::typical_spread_pips(pair)
            .unwrap_or(self.settings.default_spread_pips);

        debug!(
            pair,
            session = %session,
            direction = %direction,
            tp_pips,
            sl_pips,
            lot_size,
            risk_cash = %risk_cash,
            "risk parameters computed"
        );

        Ok(RiskDecision::Parameters(RiskParameters {
            pair: pair.to_string(),
            session,
            direction,
            entry_price,
            take_profit,
            stop_loss,
            tp_pips,
            sl_pips,
            lot_size,
            risk_cash,
            spread_pips,
            tp_percentile: self.settings.tp_percentile,
            sl_percentile: self.settings.sl_percentile,
        }))
    }

    /// Lot size from the risk budget, rounded to 0.01 and clamped.
    fn position_size(&self, pair: &str, sl_pips: f64, balance: Decimal) -> (f64, Decimal) {
        let risk_cash = (balance * self.settings.risk_percent / dec!(100)).round_dp(2);

        let pip_cash = instruments::pip_cash_per_lot(pair).to_f64().unwrap_or(10.0);
        let raw = risk_cash.to_f64().unwrap_or(0.0) / (sl_pips * pip_cash);

        let stepped = (raw * 100.0).round() / 100.0;
        let lot_size = stepped.clamp(self.settings.min_lot_size, self.settings.max_lot_size);

        (lot_size, risk_cash)
    }
}

enum Stat {
    Mfe,
    Mae,
}

fn percentile_value(targets: &PercentileTargets, stat: Stat, pct: Percentile) -> f64 {
    match (stat, pct) {
        (Stat::Mfe, Percentile::P25) => targets.mfe_p25,
        (Stat::Mfe, Percentile::P50) => targets.mfe_p50,
        (Stat::Mfe, Percentile::P75) => targets.mfe_p75,
        (Stat::Mae, Percentile::P25) => targets.mae_p25,
        (Stat::Mae, Percentile::P50) => targets.mae_p50,
        (Stat::Mae, Percentile::P75) => targets.mae_p75,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rolling::ExcursionRecord;
    use chrono::{TimeZone, Utc};

    /// Seed `n` window rows with fixed excursions and materialize.
    fn seed(db: &Database, pair: &str, n: usize, mfe: f64, mae: f64) {
        for i in 0..n {
            db.append_excursion(&ExcursionRecord {
                pair: pair.to_string(),
                session: SessionId::London,
                session_datetime: Utc.with_ymd_and_hms(2024, 7, 1, 7, 0, 0).unwrap()
                    + chrono::Duration::days(i as i64),
                model: "claude_haiku_45".to_string(),
                prediction: Direction::Bullish,
                correct: i % 2 == 0,
                mfe_pips: mfe,
                mae_pips: mae,
            })
            .unwrap();
        }
        db.refresh_stats().unwrap();
    }

    fn engine() -> (Arc<Database>, RiskEngine) {
        let db = Arc::new(Database::open_in_memory(&Settings::default()).unwrap());
        let engine = RiskEngine::new(Arc::clone(&db), Settings::default());
        (db, engine)
    }

    #[test]
    fn no_data_is_insufficient() {
        let (_db, engine) = engine();
        let decision = engine
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(10000),
            )
            .unwrap();
        assert!(matches!(decision, RiskDecision::InsufficientData { .. }));
    }

    #[test]
    fn twenty_nine_samples_is_insufficient() {
        let (db, engine) = engine();
        seed(&db, "EURUSD", 29, 30.0, 15.0);
        let decision = engine
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(10000),
            )
            .unwrap();
        assert!(matches!(decision, RiskDecision::InsufficientData { .. }));
    }

    #[test]
    fn thirty_samples_produces_parameters() {
        let (db, engine) = engine();
        seed(&db, "EURUSD", 30, 30.0, 15.0);
        let decision = engine
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(10000),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };

        // All samples identical, so every percentile is the sample value.
        assert!((p.tp_pips - 30.0).abs() < 1e-9);
        assert!((p.sl_pips - 15.0).abs() < 1e-9);

        // Long: TP above entry, SL below.
        assert!(p.take_profit > p.entry_price);
        assert!(p.stop_loss < p.entry_price);
        assert!((p.take_profit - 1.1030).abs() < 1e-9);
        assert!((p.stop_loss - 1.0985).abs() < 1e-9);

        // risk_cash = 10000 * 1.55% = 155; lots = 155 / (15 * 10) = 1.03.
        assert_eq!(p.risk_cash, dec!(155.00));
        assert!((p.lot_size - 1.03).abs() < 1e-9);
    }

    #[test]
    fn short_levels_are_mirrored() {
        let (db, engine) = engine();
        seed(&db, "EURUSD", 30, 30.0, 15.0);
        let decision = engine
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bearish,
                1.1000,
                dec!(10000),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };
        assert!(p.take_profit < p.entry_price);
        assert!(p.stop_loss > p.entry_price);
    }

    #[test]
    fn sub_pip_targets_are_floored_at_five_pips() {
        let (db, engine) = engine();
        seed(&db, "EURUSD", 30, 0.4, 0.2);
        let decision = engine
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(10000),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };
        assert_eq!(p.tp_pips, 5.0);
        assert_eq!(p.sl_pips, 5.0);
    }

    #[test]
    fn lot_size_respects_bounds() {
        let (db, engine1) = engine();
        // Huge SL keeps the raw lot below the minimum.
        seed(&db, "EURUSD", 30, 400.0, 900.0);
        let decision = engine1
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(100),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };
        assert_eq!(p.lot_size, 0.01);

        // Tiny SL on a huge balance clamps at the max.
        let (db2, engine2) = engine();
        seed(&db2, "EURUSD", 30, 40.0, 1.0);
        let decision = engine2
            .compute(
                "EURUSD",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                1.1000,
                dec!(1000000),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };
        assert_eq!(p.lot_size, 5.0);
    }

    #[test]
    fn jpy_sizing_uses_its_pip_cash_value() {
        let (db, engine) = engine();
        seed(&db, "USDJPY", 30, 30.0, 15.0);
        let decision = engine
            .compute(
                "USDJPY",
                SessionId::London,
                "claude_haiku_45",
                Direction::Bullish,
                150.00,
                dec!(10000),
            )
            .unwrap();
        let RiskDecision::Parameters(p) = decision else {
            panic!("expected parameters");
        };
        // lots = 155 / (15 * 9) = 1.148 -> 1.15
        assert!((p.lot_size - 1.15).abs() < 1e-9);
        // JPY tick is 0.01: 30 pips above 150.00 is 150.30.
        assert!((p.take_profit - 150.30).abs() < 1e-9);
    }
}
