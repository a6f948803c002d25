// =============================================================================
// TP/SL Alert Book — per-position trigger detection on live quotes
// =============================================================================
//
// One alert per open position, keyed by trade id. On every quote for an
// instrument the book evaluates its untriggered alerts against the mid
// price. Take-profit is checked before stop-loss; a single quote whose mid
// straddles both levels therefore resolves as TP. Comparisons are
// inclusive-or-equal on both sides.
//
// Alerts are single-shot: the first trigger stamps the alert and it is
// skipped by all later quotes until the orchestrator removes it.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::instruments;
use crate::types::{Direction, TriggerKind};

/// Real-time quote from the price feed.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub pair: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Arithmetic mid price.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread in pips for this pair.
    pub fn spread_pips(&self) -> f64 {
        instruments::price_diff_to_pips(&self.pair, self.ask - self.bid)
    }
}

/// TP/SL alert for one open position.
#[derive(Debug, Clone, Serialize)]
pub struct PriceAlert {
    pub trade_id: Uuid,
    pub pair: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub triggered: bool,
    pub trigger_kind: Option<TriggerKind>,
    pub trigger_price: Option<f64>,
    pub trigger_time: Option<DateTime<Utc>>,
}

impl PriceAlert {
    pub fn new(
        trade_id: Uuid,
        pair: impl Into<String>,
        direction: Direction,
        entry_price: f64,
        take_profit: f64,
        stop_loss: f64,
    ) -> Self {
        Self {
            trade_id,
            pair: pair.into(),
            direction,
            entry_price,
            take_profit,
            stop_loss,
            triggered: false,
            trigger_kind: None,
            trigger_price: None,
            trigger_time: None,
        }
    }

    /// Which level, if any, a mid price crosses. TP first, then SL.
    fn crossed(&self, mid: f64) -> Option<TriggerKind> {
        match self.direction {
            Direction::Bullish => {
                if mid >= self.take_profit {
                    Some(TriggerKind::TakeProfit)
                } else if mid <= self.stop_loss {
                    Some(TriggerKind::StopLoss)
                } else {
                    None
                }
            }
            Direction::Bearish => {
                if mid <= self.take_profit {
                    Some(TriggerKind::TakeProfit)
                } else if mid >= self.stop_loss {
                    Some(TriggerKind::StopLoss)
                } else {
                    None
                }
            }
        }
    }
}

/// Thread-safe registry of live alerts. BTreeMap keeps evaluation order
/// deterministic when several alerts trigger on one quote.
#[derive(Default)]
pub struct AlertBook {
    alerts: RwLock<BTreeMap<Uuid, PriceAlert>>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, alert: PriceAlert) {
        info!(
            trade_id = %alert.trade_id,
            pair = %alert.pair,
            tp = alert.take_profit,
            sl = alert.stop_loss,
            "alert registered"
        );
        self.alerts.write().insert(alert.trade_id, alert);
    }

    pub fn remove(&self, trade_id: Uuid) -> Option<PriceAlert> {
        self.alerts.write().remove(&trade_id)
    }

    pub fn get(&self, trade_id: Uuid) -> Option<PriceAlert> {
        self.alerts.read().get(&trade_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    pub fn clear(&self) {
        self.alerts.write().clear();
    }

    /// Evaluate all live alerts for `quote.pair` against its mid. Triggered
    /// alerts are stamped in place and returned in evaluation order.
    pub fn evaluate(&self, quote: &Quote) -> Vec<PriceAlert> {
        let mid = quote.mid();
        let mut fired = Vec::new();

        let mut alerts = self.alerts.write();
        for alert in alerts.values_mut() {
            if alert.pair != quote.pair || alert.triggered {
                continue;
            }
            if let Some(kind) = alert.crossed(mid) {
                alert.triggered = true;
                alert.trigger_kind = Some(kind);
                alert.trigger_price = Some(mid);
                alert.trigger_time = Some(quote.timestamp);

                info!(
                    trade_id = %alert.trade_id,
                    pair = %alert.pair,
                    kind = %kind,
                    price = mid,
                    "alert triggered"
                );
                fired.push(alert.clone());
            }
        }

        fired
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote(pair: &str, mid: f64) -> Quote {
        // Symmetric half-pip spread around the target mid.
        let half = instruments::tick_size(pair) * 0.5;
        Quote {
            pair: pair.to_string(),
            bid: mid - half,
            ask: mid + half,
            timestamp: Utc.with_ymd_and_hms(2024, 7, 15, 8, 30, 0).unwrap(),
        }
    }

    fn long_alert() -> PriceAlert {
        PriceAlert::new(
            Uuid::new_v4(),
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        )
    }

    #[test]
    fn quote_mid_and_spread() {
        let q = Quote {
            pair: "EURUSD".to_string(),
            bid: 1.1000,
            ask: 1.1002,
            timestamp: Utc::now(),
        };
        assert!((q.mid() - 1.1001).abs() < 1e-9);
        assert!((q.spread_pips() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn long_tp_triggers_once_and_only_once() {
        // Mids 1.1000, 1.1030, 1.1051, 1.1020: the third quote triggers TP
        // at exactly its mid; the fourth must not retrigger.
        let book = AlertBook::new();
        let alert = long_alert();
        let id = alert.trade_id;
        book.add(alert);

        assert!(book.evaluate(&quote("EURUSD", 1.1000)).is_empty());
        assert!(book.evaluate(&quote("EURUSD", 1.1030)).is_empty());

        let fired = book.evaluate(&quote("EURUSD", 1.1051));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger_kind, Some(TriggerKind::TakeProfit));
        assert!((fired[0].trigger_price.unwrap() - 1.1051).abs() < 1e-9);
        assert!(fired[0].trigger_time.is_some());

        assert!(book.evaluate(&quote("EURUSD", 1.1020)).is_empty());
        assert!(book.get(id).unwrap().triggered);
    }

    #[test]
    fn long_sl_triggers_at_or_below_stop() {
        let book = AlertBook::new();
        book.add(long_alert());

        let fired = book.evaluate(&quote("EURUSD", 1.0950));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger_kind, Some(TriggerKind::StopLoss));
    }

    #[test]
    fn short_levels_are_mirrored() {
        let book = AlertBook::new();
        book.add(PriceAlert::new(
            Uuid::new_v4(),
            "USDJPY",
            Direction::Bearish,
            150.00,
            149.40,
            150.60,
        ));

        assert!(book.evaluate(&quote("USDJPY", 150.00)).is_empty());

        let fired = book.evaluate(&quote("USDJPY", 149.40));
        assert_eq!(fired[0].trigger_kind, Some(TriggerKind::TakeProfit));
    }

    #[test]
    fn short_sl_above_entry() {
        let book = AlertBook::new();
        book.add(PriceAlert::new(
            Uuid::new_v4(),
            "USDJPY",
            Direction::Bearish,
            150.00,
            149.40,
            150.60,
        ));

        let fired = book.evaluate(&quote("USDJPY", 150.65));
        assert_eq!(fired[0].trigger_kind, Some(TriggerKind::StopLoss));
    }

    #[test]
    fn straddling_quote_resolves_as_tp() {
        // A gap quote past both levels at once: TP wins by evaluation order.
        let book = AlertBook::new();
        book.add(PriceAlert::new(
            Uuid::new_v4(),
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1010,
            1.0990,
        ));

        // Absurdly wide quote whose mid sits above TP; the mid is what is
        // evaluated, so TP fires.
        let q = Quote {
            pair: "EURUSD".to_string(),
            bid: 1.1012,
            ask: 1.1020,
            timestamp: Utc::now(),
        };
        let fired = book.evaluate(&q);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger_kind, Some(TriggerKind::TakeProfit));
    }

    #[test]
    fn other_pairs_are_untouched() {
        let book = AlertBook::new();
        book.add(long_alert());
        assert!(book.evaluate(&quote("GBPUSD", 1.2000)).is_empty());
        assert!(!book.get_any_triggered());
    }

    #[test]
    fn removed_alert_never_fires() {
        let book = AlertBook::new();
        let alert = long_alert();
        let id = alert.trade_id;
        book.add(alert);
        book.remove(id);
        assert!(book.evaluate(&quote("EURUSD", 1.2000)).is_empty());
        assert!(book.is_empty());
    }

    impl AlertBook {
        fn get_any_triggered(&self) -> bool {
            self.alerts.read().values().any(|a| a.triggered)
        }
    }
}
