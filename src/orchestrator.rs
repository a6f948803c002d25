// =============================================================================
// Session Orchestrator — pre-warm, execute, alert handling, reconciliation
// =============================================================================
//
// Drives one trading cycle around each session open:
//
//   T-120s  fill the bar cache (all pairs in parallel; upstream rate-limits)
//   T-60s   render chart packs (width-4 worker pool) + connect the stream
//   T+0s    sequential predictions -> risk -> open -> arm alert
//   T+0..4h alerts close positions in real time
//   T+4h    close stragglers as TIMEOUT, append excursions, refresh stats
//
// Per-instrument failures never abort the batch. Store failures on the
// alert path retry once; a second failure is parked for manual
// reconciliation rather than dropped.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::bars::{self, BarCache, BarClient};
use crate::charts::ChartRenderer;
use crate::config::{Settings, RENDER_POOL_WIDTH, TRADING_PAIRS};
use crate::instruments;
use crate::predictor::Predictor;
use crate::risk::{RiskDecision, RiskEngine};
use crate::scheduler::{SchedulerCommand, SessionHandlers};
use crate::session_clock;
use crate::store::{AccountSnapshot, CloseResult, Database, TradeEntry, TradeRecord};
use crate::store::rolling::ExcursionRecord;
use crate::stream::{PriceAlert, PriceStream};
use crate::types::{Direction, Outcome, Session, TriggerKind};
use uuid::Uuid;

/// Window between session open and reconciliation.
const SESSION_WINDOW_HOURS: i64 = 4;
/// How close the next session must be for the stream to stay up after
/// reconcile.
const IMMINENT_SESSION_SECS: i64 = 600;

/// An opened position the orchestrator is tracking until close.
#[derive(Debug, Clone, Serialize)]
pub struct ActivePosition {
    pub trade_id: Uuid,
    pub pair: String,
    pub session: Session,
    pub direction: Direction,
    pub model: String,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// A realtime-closed position awaiting its excursion append at T+4h.
#[derive(Debug, Clone)]
struct PendingExcursion {
    position: ActivePosition,
    outcome: Outcome,
}

/// A store failure parked for manual reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct ParkedFailure {
    pub trade_id: Uuid,
    pub context: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Push events consumed by the dashboard WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Account(AccountSnapshot),
    Trade(TradeRecord),
}

/// Scheduler/orchestrator status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub market: session_clock::MarketStatus,
    pub next_session: &'static str,
    pub next_session_time: DateTime<Utc>,
    pub active_trades: usize,
    pub cached_bars: usize,
    pub cached_inputs: usize,
    pub websocket_connected: bool,
    pub live_prices: HashMap<String, LivePrice>,
    pub parked_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivePrice {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub spread_pips: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct SessionOrchestrator {
    settings: Settings,
    db: Arc<Database>,
    risk: Arc<RiskEngine>,
    stream: Arc<PriceStream>,
    bar_client: Arc<BarClient>,
    predictor: Arc<dyn Predictor>,
    renderer: Arc<dyn ChartRenderer>,

    bar_cache: Arc<BarCache>,
    input_cache: RwLock<HashMap<String, PathBuf>>,
    render_pool: Arc<Semaphore>,

    active: RwLock<HashMap<Uuid, ActivePosition>>,
    pending: RwLock<Vec<PendingExcursion>>,
    parked: RwLock<Vec<ParkedFailure>>,

    /// Serializes execute/reconcile state writes across overlapping sessions.
    cycle_lock: tokio::sync::Mutex<()>,

    schedule_tx: RwLock<Option<mpsc::UnboundedSender<SchedulerCommand>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        db: Arc<Database>,
        risk: Arc<RiskEngine>,
        stream: Arc<PriceStream>,
        bar_client: Arc<BarClient>,
        predictor: Arc<dyn Predictor>,
        renderer: Arc<dyn ChartRenderer>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            settings,
            db,
            risk,
            stream,
            bar_client,
            predictor,
            renderer,
            bar_cache: Arc::new(BarCache::new()),
            input_cache: RwLock::new(HashMap::new()),
            render_pool: Arc::new(Semaphore::new(RENDER_POOL_WIDTH)),
            active: RwLock::new(HashMap::new()),
            pending: RwLock::new(Vec::new()),
            parked: RwLock::new(Vec::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            schedule_tx: RwLock::new(None),
            events,
        }
    }

    /// Wire the scheduler's command channel; called once at composition.
    pub fn set_schedule_sender(&self, tx: mpsc::UnboundedSender<SchedulerCommand>) {
        *self.schedule_tx.write() = Some(tx);
    }

    /// Consume triggered alerts from the price stream, in trigger order.
    /// Spawned once at engine start.
    pub async fn run_alert_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PriceAlert>) {
        info!("alert loop started");
        while let Some(alert) = rx.recv().await {
            self.handle_alert(alert).await;
        }
        info!("alert loop ended");
    }

    pub fn status(&self) -> OrchestratorStatus {
        let next = session_clock::next_session(Utc::now());
        let active = self.active.read();

        // Live quotes for the pairs with open positions.
        let mut live_prices = HashMap::new();
        if self.stream.is_connected() {
            for position in active.values() {
                if let Some(quote) = self.stream.quote(&position.pair) {
                    live_prices.insert(
                        position.pair.clone(),
                        LivePrice {
                            bid: quote.bid,
                            ask: quote.ask,
                            mid: quote.mid(),
                            spread_pips: quote.spread_pips(),
                            timestamp: quote.timestamp,
                        },
                    );
                }
            }
        }

        OrchestratorStatus {
            market: session_clock::market_status(Utc::now()),
            next_session: next.id.as_str(),
            next_session_time: next.open,
            active_trades: active.len(),
            cached_bars: self.bar_cache.len(),
            cached_inputs: self.input_cache.read().len(),
            websocket_connected: self.stream.is_connected(),
            live_prices,
            parked_failures: self.parked.read().len(),
        }
    }

    pub fn parked_failures(&self) -> Vec<ParkedFailure> {
        self.parked.read().clone()
    }

    // -------------------------------------------------------------------------
    // Alert path (T+0 .. T+4h)
    // -------------------------------------------------------------------------

    async fn handle_alert(&self, alert: PriceAlert) {
        let trade_id = alert.trade_id;

        let Some(position) = self.active.read().get(&trade_id).cloned() else {
            // Already reconciled through the other path.
            warn!(trade_id = %trade_id, "alert for unknown position ignored");
            return;
        };

        let (Some(kind), Some(trigger_price)) = (alert.trigger_kind, alert.trigger_price) else {
            error!(trade_id = %trade_id, "alert delivered without trigger stamp");
            return;
        };

        let outcome = match kind {
            TriggerKind::TakeProfit => Outcome::Win,
            TriggerKind::StopLoss => Outcome::Loss,
        };
        let was_stop = kind == TriggerKind::StopLoss;

        info!(
            trade_id = %trade_id,
            pair = %position.pair,
            outcome = %outcome,
            price = trigger_price,
            "realtime trigger — closing position"
        );

        let close = retry_once(
            || self.db.close_position(trade_id, trigger_price, outcome, was_stop),
            "close on alert",
        );

        match close {
            Ok(result) => {
                if let CloseResult::Closed(exit) = &result {
                    info!(trade_id = %trade_id, pnl = %exit.pnl_cash, "position closed in realtime");
                }
                self.active.write().remove(&trade_id);
                self.pending.write().push(PendingExcursion {
                    position,
                    outcome,
                });
                self.stream.alerts.remove(trade_id);
                self.publish_trade(trade_id);
                self.publish_account();
            }
            Err(e) => {
                // Never drop the alert: park it and leave the position
                // active so reconcile can settle it.
                error!(trade_id = %trade_id, error = %e, "close failed twice — parking for manual reconciliation");
                self.parked.write().push(ParkedFailure {
                    trade_id,
                    context: format!("close({}, {outcome})", position.pair),
                    error: format!("{e:#}"),
                    at: Utc::now(),
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Event publication
    // -------------------------------------------------------------------------

    fn publish_account(&self) {
        if let Ok(snapshot) = self.db.account_snapshot() {
            let _ = self.events.send(EngineEvent::Account(snapshot));
        }
    }

    fn publish_trade(&self, trade_id: Uuid) {
        if let Ok(Some(record)) = self.db.get_trade(trade_id) {
            let _ = self.events.send(EngineEvent::Trade(record));
        }
    }

    // -------------------------------------------------------------------------
    // Per-instrument execute step
    // -------------------------------------------------------------------------

    /// Run the prediction/open pipeline for one instrument. Returns true
    /// when a position was opened.
    async fn execute_instrument(
        &self,
        pair: &str,
        session: Session,
        balance: rust_decimal::Decimal,
    ) -> Result<bool> {
        let Some(artifact) = self.input_cache.read().get(pair).cloned() else {
            info!(pair, "no chart pack — skipping");
            return Ok(false);
        };

        let prediction = self
            .predictor
            .predict(&artifact, pair, session.id)
            .await
            .context("prediction failed")?;

        let Some((direction, conviction)) = prediction.bias.direction() else {
            info!(pair, "neutral — skipping");
            return Ok(false);
        };
        info!(pair, direction = %direction, conviction, "directional prediction");

        // Entry price: live quote preferred (ask to buy, bid to sell), bar
        // close as fallback.
        let (entry_price, spread_pips) = match self.stream.quote(pair) {
            Some(quote) => {
                let price = match direction {
                    Direction::Bullish => quote.ask,
                    Direction::Bearish => quote.bid,
                };
                (price, quote.spread_pips())
            }
            None => {
                let Some(close) = self.bar_cache.last_close(pair) else {
                    info!(pair, "no live quote and no cached bars — skipping");
                    return Ok(false);
                };
                let spread = crate::config::typical_spread_pips(pair)
                    .unwrap_or(self.settings.default_spread_pips);
                (close, spread)
            }
        };

        let decision = self.risk.compute(
            pair,
            session.id,
            self.predictor.model_key(),
            direction,
            entry_price,
            balance,
        )?;
        let params = match decision {
            RiskDecision::Parameters(p) => p,
            RiskDecision::InsufficientData { reason } => {
                info!(pair, reason, "insufficient data — skipping");
                return Ok(false);
            }
        };

        // Entry pays half the spread on the way in.
        let half_spread = instruments::pips_to_price_diff(pair, spread_pips / 2.0);
        let adjusted_entry = match direction {
            Direction::Bullish => entry_price + half_spread,
            Direction::Bearish => entry_price - half_spread,
        };

        let entry = TradeEntry {
            pair: pair.to_string(),
            session: session.id,
            session_datetime: session.open,
            prediction: direction,
            conviction,
            rationale: Some(prediction.rationale),
            model: prediction.model_key.clone(),
            entry_price: adjusted_entry,
            spread_pips,
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            sl_pips: params.sl_pips,
            tp_pips: params.tp_pips,
            lot_size: params.lot_size,
            risk_pct: self.settings.risk_percent,
            tp_percentile: params.tp_percentile,
            sl_percentile: params.sl_percentile,
        };
        let trade_id = self.db.open_position(&entry)?;

        self.stream.alerts.add(PriceAlert::new(
            trade_id,
            pair,
            direction,
            adjusted_entry,
            params.take_profit,
            params.stop_loss,
        ));

        self.active.write().insert(
            trade_id,
            ActivePosition {
                trade_id,
                pair: pair.to_string(),
                session,
                direction,
                model: prediction.model_key,
                entry_price: adjusted_entry,
                take_profit: params.take_profit,
                stop_loss: params.stop_loss,
            },
        );

        info!(
            trade_id = %trade_id,
            pair,
            tp_pips = params.tp_pips,
            sl_pips = params.sl_pips,
            lots = params.lot_size,
            "trade opened with live monitoring"
        );
        self.publish_trade(trade_id);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Reconcile helpers
    // -------------------------------------------------------------------------

    async fn session_bars(&self, pair: &str, session: Session) -> Option<Vec<bars::Bar>> {
        let end = session.open + Duration::hours(SESSION_WINDOW_HOURS);
        match self.bar_client.fetch_bars(pair, session.open, end).await {
            Ok(bars) if !bars.is_empty() => Some(bars),
            Ok(_) => {
                warn!(pair, "no bars in session range");
                None
            }
            Err(e) => {
                warn!(pair, error = %e, "session bar fetch failed");
                None
            }
        }
    }

    fn append_with_retry(&self, record: &ExcursionRecord) -> bool {
        match retry_once(|| self.db.append_excursion(record), "rolling window append") {
            Ok(()) => true,
            Err(e) => {
                error!(pair = %record.pair, error = %e, "append failed twice — parked");
                self.parked.write().push(ParkedFailure {
                    trade_id: Uuid::nil(),
                    context: format!("append({}, {})", record.pair, record.session),
                    error: format!("{e:#}"),
                    at: Utc::now(),
                });
                false
            }
        }
    }
}

// =============================================================================
// Scheduler handlers
// =============================================================================

#[async_trait]
impl SessionHandlers for SessionOrchestrator {
    /// T-120s: fetch the last 7 days of 15-minute bars for every pair, all
    /// in parallel. A failed pair degrades to a skipped prediction.
    async fn prewarm_bars(&self, session: Session) -> Result<()> {
        info!(session = %session, "pre-warming bar data");
        self.bar_cache.clear();

        let start = session.open - Days::new(7);
        let fetches = TRADING_PAIRS.iter().map(|pair| {
            let client = Arc::clone(&self.bar_client);
            async move {
                match client.fetch_bars(pair, start, session.open).await {
                    Ok(bars) if !bars.is_empty() => Some((*pair, bars)),
                    Ok(_) => {
                        warn!(pair, "no bars returned");
                        None
                    }
                    Err(e) => {
                        warn!(pair, error = %e, "bar pre-warm failed");
                        None
                    }
                }
            }
        });

        let mut warmed = 0;
        for result in join_all(fetches).await {
            if let Some((pair, bars)) = result {
                self.bar_cache.insert(pair, bars);
                warmed += 1;
            }
        }

        info!(warmed, total = TRADING_PAIRS.len(), "bar pre-warm complete");
        Ok(())
    }

    /// T-60s: render chart packs for every cached pair on the worker pool,
    /// and bring the price stream up in parallel.
    async fn prewarm_inputs(&self, session: Session) -> Result<()> {
        info!(session = %session, "pre-rendering inputs");
        self.input_cache.write().clear();

        let connect = async {
            if !self.stream.is_connected() {
                match self.stream.reopen().await {
                    Ok(()) => {
                        let pairs: Vec<String> =
                            TRADING_PAIRS.iter().map(|p| p.to_string()).collect();
                        if let Err(e) = self.stream.subscribe(&pairs).await {
                            warn!(error = %e, "stream subscribe failed");
                        } else {
                            info!(count = pairs.len(), "stream connected and subscribed");
                        }
                    }
                    Err(e) => warn!(error = %e, "stream connect failed"),
                }
            }
        };

        let renders = async {
            let out_dir = PathBuf::from(&self.settings.charts_dir);
            let jobs = self.bar_cache.pairs().into_iter().map(|pair| {
                let pool = Arc::clone(&self.render_pool);
                let renderer = Arc::clone(&self.renderer);
                let bars = self.bar_cache.get(&pair).unwrap_or_default();
                let out_dir = out_dir.clone();
                async move {
                    // Render concurrency is capped at the pool width.
                    let _permit = pool.acquire().await.ok()?;
                    let rendered = tokio::task::spawn_blocking(move || {
                        renderer.render(&pair, session, &bars, &out_dir).map(|p| (pair, p))
                    })
                    .await;
                    match rendered {
                        Ok(Ok((pair, path))) => Some((pair, path)),
                        Ok(Err(e)) => {
                            warn!(error = %e, "chart render failed");
                            None
                        }
                        Err(e) => {
                            warn!(error = %e, "render task panicked");
                            None
                        }
                    }
                }
            });

            let mut rendered = 0;
            for result in join_all(jobs).await {
                if let Some((pair, path)) = result {
                    self.input_cache.write().insert(pair, path);
                    rendered += 1;
                }
            }
            info!(rendered, "input pre-warm complete");
        };

        tokio::join!(connect, renders);
        Ok(())
    }

    /// T+0: sequential per-instrument predictions and opens.
    async fn execute(&self, session: Session) -> Result<()> {
        let _cycle = self.cycle_lock.lock().await;
        info!(session = %session, "executing session");

        let balance = self.db.account_snapshot()?.balance;
        let mut opened = 0;

        // Sequential on purpose: the predictor enforces rate limits.
        for pair in TRADING_PAIRS {
            match self.execute_instrument(pair, session, balance).await {
                Ok(true) => opened += 1,
                Ok(false) => {}
                Err(e) => error!(pair, error = %e, "instrument failed — continuing"),
            }
        }

        info!(opened, session = %session, "session execution complete");

        // Feeds go stale fast; drop them now rather than at reconcile.
        self.bar_cache.clear();
        self.input_cache.write().clear();

        match self.schedule_tx.read().as_ref() {
            Some(tx) => {
                let _ = tx.send(SchedulerCommand::ScheduleNext);
            }
            None => warn!("no scheduler attached — next session not chained"),
        }
        Ok(())
    }

    /// T+4h: settle realtime closes' excursions, close stragglers as
    /// TIMEOUT, refresh the percentile materialization.
    async fn reconcile(&self, session: Session) -> Result<()> {
        let _cycle = self.cycle_lock.lock().await;
        info!(session = %session, "reconciling session");

        let mut appended = 0;

        // 1. Excursions for positions closed in realtime by alerts.
        let realtime: Vec<PendingExcursion> = {
            let mut pending = self.pending.write();
            let (ours, rest): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|p| p.position.session == session);
            *pending = rest;
            ours
        };

        for entry in &realtime {
            let position = &entry.position;
            let Some(session_bars) = self.session_bars(&position.pair, session).await else {
                continue;
            };
            let (mfe, mae) = compute_excursions(
                position.direction,
                position.entry_price,
                bars::range_high(&session_bars).unwrap_or(position.entry_price),
                bars::range_low(&session_bars).unwrap_or(position.entry_price),
                &position.pair,
            );

            if self.append_with_retry(&ExcursionRecord {
                pair: position.pair.clone(),
                session: session.id,
                session_datetime: session.open,
                model: position.model.clone(),
                prediction: position.direction,
                correct: entry.outcome == Outcome::Win,
                mfe_pips: mfe,
                mae_pips: mae,
            }) {
                appended += 1;
                info!(pair = %position.pair, outcome = %entry.outcome, "realtime close added to window");
            }
        }

        // 2. Still-active positions timed out: close at the last in-range
        // close and append their excursions.
        let stragglers: Vec<ActivePosition> = self
            .active
            .read()
            .values()
            .filter(|p| p.session == session)
            .cloned()
            .collect();

        for position in stragglers {
            let Some(session_bars) = self.session_bars(&position.pair, session).await else {
                // No verification data; leave the position for a later pass.
                continue;
            };
            let Some(exit_price) = bars::last_close(&session_bars) else {
                continue;
            };

            let close = retry_once(
                || {
                    self.db
                        .close_position(position.trade_id, exit_price, Outcome::Timeout, false)
                },
                "timeout close",
            );
            let result = match close {
                Ok(result) => result,
                Err(e) => {
                    error!(trade_id = %position.trade_id, error = %e, "timeout close failed twice — parked");
                    self.parked.write().push(ParkedFailure {
                        trade_id: position.trade_id,
                        context: format!("timeout close({})", position.pair),
                        error: format!("{e:#}"),
                        at: Utc::now(),
                    });
                    continue;
                }
            };

            let exit = result.exit();
            info!(
                trade_id = %position.trade_id,
                pair = %position.pair,
                pnl = %exit.pnl_cash,
                "position timed out"
            );

            let (mfe, mae) = compute_excursions(
                position.direction,
                position.entry_price,
                bars::range_high(&session_bars).unwrap_or(position.entry_price),
                bars::range_low(&session_bars).unwrap_or(position.entry_price),
                &position.pair,
            );

            // A timeout is counted correct when it still made money.
            if self.append_with_retry(&ExcursionRecord {
                pair: position.pair.clone(),
                session: session.id,
                session_datetime: session.open,
                model: position.model.clone(),
                prediction: position.direction,
                correct: exit.pnl_cash > rust_decimal::Decimal::ZERO,
                mfe_pips: mfe,
                mae_pips: mae,
            }) {
                appended += 1;
            }

            self.active.write().remove(&position.trade_id);
            self.stream.alerts.remove(position.trade_id);
            self.publish_trade(position.trade_id);
        }

        // 3. Stats only move when the window did.
        if appended > 0 {
            info!(appended, "refreshing percentile targets");
            self.db.refresh_stats()?;
        }
        self.publish_account();

        // 4. Tear the stream down when idle and nothing is imminent.
        let next = session_clock::next_session(Utc::now());
        let imminent = next.open - Utc::now() < Duration::seconds(IMMINENT_SESSION_SECS);
        if self.active.read().is_empty() && self.stream.is_connected() && !imminent {
            info!("no active positions — disconnecting stream");
            self.stream.disconnect().await;
        }

        info!(appended, session = %session, "reconciliation complete");
        Ok(())
    }

    /// 00:00 UTC: expire out-of-window rows, then refresh stats if anything
    /// changed.
    async fn daily_cleanup(&self) -> Result<()> {
        let flagged = self.db.expire_old(Utc::now())?;
        if flagged > 0 {
            self.db.refresh_stats()?;
        }
        Ok(())
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// MFE/MAE in pips for a position over the session's high/low range.
/// Both are floored at zero.
pub fn compute_excursions(
    direction: Direction,
    entry: f64,
    session_high: f64,
    session_low: f64,
    pair: &str,
) -> (f64, f64) {
    let (favorable, adverse) = match direction {
        Direction::Bullish => (session_high - entry, entry - session_low),
        Direction::Bearish => (entry - session_low, session_high - entry),
    };
    let mfe = instruments::price_diff_to_pips(pair, favorable).max(0.0);
    let mae = instruments::price_diff_to_pips(pair, adverse).max(0.0);
    (mfe, mae)
}

/// Run a store operation, retrying exactly once on failure.
fn retry_once<T>(op: impl Fn() -> Result<T>, what: &str) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, what, "store operation failed — retrying once");
            op()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::charts::ChartPackRenderer;
    use crate::predictor::{Bias, Prediction};
    use crate::types::SessionId;
    use chrono::TimeZone;
    use std::path::Path;

    struct FixedPredictor(Bias);

    #[async_trait]
    impl Predictor for FixedPredictor {
        fn model_key(&self) -> &str {
            "claude_haiku_45"
        }
        async fn predict(
            &self,
            _artifact: &Path,
            _pair: &str,
            _session: SessionId,
        ) -> Result<Prediction> {
            Ok(Prediction {
                bias: self.0,
                rationale: "fixed".to_string(),
                model_key: "claude_haiku_45".to_string(),
                cost: 0.0,
                latency_ms: 1,
            })
        }
    }

    fn orchestrator(bias: Bias) -> (Arc<SessionOrchestrator>, mpsc::UnboundedReceiver<PriceAlert>) {
        let settings = Settings::default();
        let db = Arc::new(Database::open_in_memory(&settings).unwrap());
        let risk = Arc::new(RiskEngine::new(Arc::clone(&db), settings.clone()));
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(PriceStream::new("key", alert_tx));
        let bar_client = Arc::new(BarClient::new("key"));
        let (events, _) = broadcast::channel(16);

        let orch = Arc::new(SessionOrchestrator::new(
            settings,
            db,
            risk,
            stream,
            bar_client,
            Arc::new(FixedPredictor(bias)),
            Arc::new(ChartPackRenderer),
            events,
        ));
        (orch, alert_rx)
    }

    fn session() -> Session {
        Session::new(
            SessionId::London,
            Utc.with_ymd_and_hms(2024, 7, 15, 7, 0, 0).unwrap(),
        )
    }

    #[test]
    fn excursions_long() {
        // Long from 1.1000, high 1.1040, low 1.0980: MFE 40, MAE 20.
        let (mfe, mae) =
            compute_excursions(Direction::Bullish, 1.1000, 1.1040, 1.0980, "EURUSD");
        assert!((mfe - 40.0).abs() < 1e-6);
        assert!((mae - 20.0).abs() < 1e-6);
    }

    #[test]
    fn excursions_short() {
        // Short from 150.00, high 150.30, low 149.40: MFE 60, MAE 30.
        let (mfe, mae) =
            compute_excursions(Direction::Bearish, 150.00, 150.30, 149.40, "USDJPY");
        assert!((mfe - 60.0).abs() < 1e-6);
        assert!((mae - 30.0).abs() < 1e-6);
    }

    #[test]
    fn excursions_never_negative() {
        // Entry above the session high: favorable move never happened.
        let (mfe, mae) =
            compute_excursions(Direction::Bullish, 1.1100, 1.1040, 1.0980, "EURUSD");
        assert_eq!(mfe, 0.0);
        assert!(mae > 0.0);
    }

    #[test]
    fn retry_once_retries_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_once(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("transient")
            },
            "test",
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicUsize::new(0);
        let result = retry_once(
            || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first fails")
                }
                Ok(7)
            },
            "test",
        );
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn execute_without_inputs_opens_nothing() {
        let (orch, _rx) = orchestrator(Bias::Bullish { conviction: 8 });
        orch.execute(session()).await.unwrap();
        assert!(orch.active.read().is_empty());
        assert_eq!(orch.db.account_snapshot().unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn alert_for_unknown_position_is_ignored() {
        let (orch, _rx) = orchestrator(Bias::Neutral);
        let mut alert = PriceAlert::new(
            Uuid::new_v4(),
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        );
        alert.triggered = true;
        alert.trigger_kind = Some(TriggerKind::TakeProfit);
        alert.trigger_price = Some(1.1051);
        alert.trigger_time = Some(Utc::now());

        orch.handle_alert(alert).await;
        assert_eq!(orch.db.account_snapshot().unwrap().total_trades, 0);
        assert!(orch.parked.read().is_empty());
    }

    #[tokio::test]
    async fn alert_closes_active_position_exactly_once() {
        let (orch, _rx) = orchestrator(Bias::Neutral);
        let sess = session();

        // Open a position directly through the store and register it.
        let entry = TradeEntry {
            pair: "EURUSD".to_string(),
            session: sess.id,
            session_datetime: sess.open,
            prediction: Direction::Bullish,
            conviction: 8,
            rationale: None,
            model: "claude_haiku_45".to_string(),
            entry_price: 1.1000,
            spread_pips: 0.1,
            stop_loss: 1.0950,
            take_profit: 1.1050,
            sl_pips: 50.0,
            tp_pips: 50.0,
            lot_size: 1.0,
            risk_pct: rust_decimal_macros::dec!(1.55),
            tp_percentile: crate::config::Percentile::P75,
            sl_percentile: crate::config::Percentile::P50,
        };
        let trade_id = orch.db.open_position(&entry).unwrap();
        orch.active.write().insert(
            trade_id,
            ActivePosition {
                trade_id,
                pair: "EURUSD".to_string(),
                session: sess,
                direction: Direction::Bullish,
                model: "claude_haiku_45".to_string(),
                entry_price: 1.1000,
                take_profit: 1.1050,
                stop_loss: 1.0950,
            },
        );
        orch.stream.alerts.add(PriceAlert::new(
            trade_id,
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        ));

        let mut alert = PriceAlert::new(
            trade_id,
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        );
        alert.triggered = true;
        alert.trigger_kind = Some(TriggerKind::TakeProfit);
        alert.trigger_price = Some(1.1051);
        alert.trigger_time = Some(Utc::now());

        orch.handle_alert(alert.clone()).await;

        let snap = orch.db.account_snapshot().unwrap();
        assert_eq!(snap.total_trades, 1);
        assert_eq!(snap.winning_trades, 1);
        assert!(orch.active.read().is_empty());
        assert!(orch.stream.alerts.is_empty());
        assert_eq!(orch.pending.read().len(), 1);

        // Redelivery hits the unknown-position path and changes nothing.
        orch.handle_alert(alert).await;
        assert_eq!(orch.db.account_snapshot().unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn sl_alert_closes_as_loss_with_stop_slippage() {
        let (orch, _rx) = orchestrator(Bias::Neutral);
        let sess = session();
        let entry = TradeEntry {
            pair: "EURUSD".to_string(),
            session: sess.id,
            session_datetime: sess.open,
            prediction: Direction::Bullish,
            conviction: 5,
            rationale: None,
            model: "claude_haiku_45".to_string(),
            entry_price: 1.1000,
            spread_pips: 0.1,
            stop_loss: 1.0950,
            take_profit: 1.1050,
            sl_pips: 50.0,
            tp_pips: 50.0,
            lot_size: 1.0,
            risk_pct: rust_decimal_macros::dec!(1.55),
            tp_percentile: crate::config::Percentile::P75,
            sl_percentile: crate::config::Percentile::P50,
        };
        let trade_id = orch.db.open_position(&entry).unwrap();
        orch.active.write().insert(
            trade_id,
            ActivePosition {
                trade_id,
                pair: "EURUSD".to_string(),
                session: sess,
                direction: Direction::Bullish,
                model: "claude_haiku_45".to_string(),
                entry_price: 1.1000,
                take_profit: 1.1050,
                stop_loss: 1.0950,
            },
        );

        let mut alert = PriceAlert::new(
            trade_id,
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        );
        alert.triggered = true;
        alert.trigger_kind = Some(TriggerKind::StopLoss);
        alert.trigger_price = Some(1.0949);
        alert.trigger_time = Some(Utc::now());

        orch.handle_alert(alert).await;

        let record = orch.db.get_trade(trade_id).unwrap().unwrap();
        assert_eq!(record.outcome, Some(Outcome::Loss));
        // -51 raw pips minus 0.5 stop slippage.
        assert_eq!(record.pnl_pips, Some(-51.5));
        assert_eq!(orch.db.account_snapshot().unwrap().losing_trades, 1);
    }
}
