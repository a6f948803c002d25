// =============================================================================
// Price Stream — persistent quote feed with reconnection and TP/SL alerts
// =============================================================================
//
// State machine:
//
//   Disconnected -> Connecting -> Authenticating -> Ready -> (Disconnected | Closed)
//
// Protocol (WebSocket-framed JSON):
//   on connect:  <- [{"status":"connected", ...}]
//                -> {"action":"auth","params":"<key>"}
//                <- [{"status":"auth_success", ...}]
//   subscribe:   -> {"action":"subscribe","params":"C.EUR/USD,C.GBP/USD"}
//   ticks:       <- [{"ev":"C","p":"C.EUR/USD","b":1.0891,"a":1.0893,"t":...}]
//
// A transport error in Ready schedules a reconnect after 5 seconds and
// re-subscribes the previously subscribed set. Alerts live in the in-process
// AlertBook, not on the wire, so nothing is lost across reconnects.
// =============================================================================

pub mod alerts;

pub use alerts::{AlertBook, PriceAlert, Quote};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{
    STREAM_CONNECT_TIMEOUT, STREAM_PING_INTERVAL, STREAM_PING_TIMEOUT, STREAM_RECONNECT_DELAY,
};
use crate::instruments;

const FEED_WS_URL: &str = "wss://socket.polygon.io/forex";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

pub struct PriceStream {
    api_key: String,
    url: String,
    state: RwLock<StreamState>,
    /// Latest quote per pair; each tick overwrites the prior.
    quotes: RwLock<HashMap<String, Quote>>,
    /// Live TP/SL alerts.
    pub alerts: AlertBook,
    /// Engine-side pair names currently subscribed.
    subscribed: RwLock<BTreeSet<String>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    alert_tx: mpsc::UnboundedSender<PriceAlert>,
}

impl PriceStream {
    /// Build a stream. Triggered alerts are delivered, in trigger order,
    /// through `alert_tx`; the orchestrator owns the receiving end, which
    /// keeps the stream/orchestrator reference graph acyclic.
    pub fn new(api_key: impl Into<String>, alert_tx: mpsc::UnboundedSender<PriceAlert>) -> Self {
        Self {
            api_key: api_key.into(),
            url: FEED_WS_URL.to_string(),
            state: RwLock::new(StreamState::Disconnected),
            quotes: RwLock::new(HashMap::new()),
            alerts: AlertBook::new(),
            subscribed: RwLock::new(BTreeSet::new()),
            writer: tokio::sync::Mutex::new(None),
            recv_task: parking_lot::Mutex::new(None),
            alert_tx,
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Ready
    }

    /// Latest quote for a pair, if any tick has arrived.
    pub fn quote(&self, pair: &str) -> Option<Quote> {
        self.quotes.read().get(pair).cloned()
    }

    /// Latest mid price for a pair.
    pub fn mid(&self, pair: &str) -> Option<f64> {
        self.quotes.read().get(pair).map(|q| q.mid())
    }

    pub fn subscribed_pairs(&self) -> Vec<String> {
        self.subscribed.read().iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Connect / disconnect
    // -------------------------------------------------------------------------

    /// Open the feed connection, authenticate, and start the receive loop.
    /// No-op when already Ready.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        *self.state.write() = StreamState::Connecting;
        info!(url = %self.url, "connecting to quote feed");

        let connect_result =
            tokio::time::timeout(STREAM_CONNECT_TIMEOUT, connect_async(&self.url)).await;

        let (ws, _response) = match connect_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                *self.state.write() = StreamState::Disconnected;
                return Err(e).context("quote feed connection failed");
            }
            Err(_) => {
                *self.state.write() = StreamState::Disconnected;
                anyhow::bail!("quote feed connect timed out");
            }
        };

        let (mut write, mut read) = ws.split();

        // Server hello.
        match self.expect_status(&mut read).await {
            Ok(status) if status == "connected" => {}
            Ok(status) => {
                *self.state.write() = StreamState::Disconnected;
                anyhow::bail!("unexpected hello status '{status}'");
            }
            Err(e) => {
                *self.state.write() = StreamState::Disconnected;
                return Err(e.context("no hello frame from quote feed"));
            }
        }

        // Authenticate.
        *self.state.write() = StreamState::Authenticating;
        let auth = serde_json::json!({ "action": "auth", "params": self.api_key });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .context("failed to send auth frame")?;

        match self.expect_status(&mut read).await {
            Ok(status) if status == "auth_success" => {}
            Ok(status) => {
                *self.state.write() = StreamState::Disconnected;
                anyhow::bail!("authentication rejected: '{status}'");
            }
            Err(e) => {
                *self.state.write() = StreamState::Disconnected;
                return Err(e.context("no auth response from quote feed"));
            }
        }

        *self.writer.lock().await = Some(write);
        *self.state.write() = StreamState::Ready;
        info!("quote feed connected and authenticated");

        // Receive loop.
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.receive_loop(read).await;
        });
        if let Some(old) = self.recv_task.lock().replace(task) {
            old.abort();
        }

        Ok(())
    }

    /// Read frames until one carries a `status` field; returns its value.
    async fn expect_status(&self, read: &mut WsSource) -> Result<String> {
        loop {
            let msg = read
                .next()
                .await
                .context("quote feed closed during handshake")?
                .context("quote feed transport error during handshake")?;
            if let Message::Text(text) = msg {
                for frame in parse_frames(&text) {
                    if let Some(status) = frame.get("status").and_then(|v| v.as_str()) {
                        return Ok(status.to_string());
                    }
                }
            }
        }
    }

    /// Tear the stream down permanently: cancels the receive loop, drops all
    /// alerts, and clears quotes and subscriptions.
    pub async fn disconnect(&self) {
        *self.state.write() = StreamState::Closed;

        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if let Some(mut write) = self.writer.lock().await.take() {
            let _ = write.send(Message::Close(None)).await;
        }

        self.quotes.write().clear();
        self.subscribed.write().clear();
        self.alerts.clear();
        info!("quote feed disconnected");
    }

    /// Reopen the stream after `disconnect()`; Closed is otherwise terminal.
    pub async fn reopen(self: &Arc<Self>) -> Result<()> {
        if self.state() == StreamState::Closed {
            *self.state.write() = StreamState::Disconnected;
        }
        self.connect().await
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe to pairs. Idempotent: only genuinely new pairs are sent to
    /// the feed; pairs subscribe while disconnected and are flushed on the
    /// next (re)connect.
    pub async fn subscribe(&self, pairs: &[String]) -> Result<()> {
        let fresh: Vec<String> = {
            let mut set = self.subscribed.write();
            pairs
                .iter()
                .filter(|p| set.insert((*p).clone()))
                .cloned()
                .collect()
        };

        if fresh.is_empty() || !self.is_connected() {
            return Ok(());
        }
        self.send_action("subscribe", &fresh).await
    }

    /// Unsubscribe from pairs; unknown pairs are ignored.
    pub async fn unsubscribe(&self, pairs: &[String]) -> Result<()> {
        let removed: Vec<String> = {
            let mut set = self.subscribed.write();
            pairs
                .iter()
                .filter(|p| set.remove(p.as_str()))
                .cloned()
                .collect()
        };

        if removed.is_empty() || !self.is_connected() {
            return Ok(());
        }
        self.send_action("unsubscribe", &removed).await
    }

    async fn send_action(&self, action: &str, pairs: &[String]) -> Result<()> {
        let params = pairs
            .iter()
            .map(|p| instruments::to_feed_symbol(p))
            .collect::<Vec<_>>()
            .join(",");
        let frame = serde_json::json!({ "action": action, "params": params });

        let mut writer = self.writer.lock().await;
        let write = writer
            .as_mut()
            .context("cannot send subscription frame: not connected")?;
        write
            .send(Message::Text(frame.to_string()))
            .await
            .with_context(|| format!("failed to send {action} frame"))?;

        info!(action, count = pairs.len(), "subscription frame sent");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Receive loop
    // -------------------------------------------------------------------------

    async fn receive_loop(self: Arc<Self>, mut read: WsSource) {
        let mut ping = tokio::time::interval(STREAM_PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; consume it.
        ping.tick().await;

        let mut last_rx = tokio::time::Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_rx = tokio::time::Instant::now();
                            self.handle_text(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_rx = tokio::time::Instant::now();
                            let mut writer = self.writer.lock().await;
                            if let Some(write) = writer.as_mut() {
                                if write.send(Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_rx = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("quote feed sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "quote feed transport error");
                            break;
                        }
                        None => {
                            warn!("quote feed stream ended");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if last_rx.elapsed() > STREAM_PING_INTERVAL + STREAM_PING_TIMEOUT {
                        warn!("quote feed idle beyond ping timeout — dropping link");
                        break;
                    }
                    let mut writer = self.writer.lock().await;
                    if let Some(write) = writer.as_mut() {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            if self.state() == StreamState::Closed {
                return;
            }
        }

        // Transport gone. Unless the stream was closed deliberately, go
        // Disconnected and schedule a reconnect.
        if self.state() != StreamState::Closed {
            *self.state.write() = StreamState::Disconnected;
            self.writer.lock().await.take();
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
                if this.state() == StreamState::Closed {
                    return;
                }
                info!("attempting quote feed reconnect");
                match this.connect().await {
                    Ok(()) => {
                        // Re-announce the full subscription set.
                        let pairs = this.subscribed_pairs();
                        if !pairs.is_empty() {
                            if let Err(e) = this.send_action("subscribe", &pairs).await {
                                warn!(error = %e, "re-subscribe after reconnect failed");
                            } else {
                                info!(count = pairs.len(), "re-subscribed after reconnect");
                            }
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Frame handling
    // -------------------------------------------------------------------------

    /// Handle one inbound text payload (an array of frames, or one frame).
    fn handle_text(&self, text: &str) {
        for frame in parse_frames(text) {
            match frame.get("ev").and_then(|v| v.as_str()) {
                Some("C") => match parse_quote_frame(&frame) {
                    Some(quote) => self.apply_quote(quote),
                    None => warn!(frame = %frame, "malformed tick frame dropped"),
                },
                Some(_) => {}
                None => {
                    if let Some(status) = frame.get("status").and_then(|v| v.as_str()) {
                        debug!(
                            status,
                            message = frame.get("message").and_then(|v| v.as_str()).unwrap_or(""),
                            "feed status frame"
                        );
                    }
                }
            }
        }
    }

    /// Publish a quote and evaluate alerts; triggered alerts are forwarded
    /// to the orchestrator in trigger order.
    fn apply_quote(&self, quote: Quote) {
        let fired = self.alerts.evaluate(&quote);
        self.quotes.write().insert(quote.pair.clone(), quote);

        for alert in fired {
            if self.alert_tx.send(alert).is_err() {
                warn!("alert receiver dropped — alert discarded");
            }
        }
    }
}

/// Split a payload into individual JSON frames. The feed batches frames into
/// arrays; single objects are accepted too. Unparseable payloads yield
/// nothing.
fn parse_frames(text: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(frames)) => frames,
        Ok(frame @ serde_json::Value::Object(_)) => vec![frame],
        Ok(_) | Err(_) => {
            warn!("unparseable feed payload dropped");
            Vec::new()
        }
    }
}

/// Parse a tick frame into a Quote:
/// `{"ev":"C","p":"C.EUR/USD","b":1.0891,"a":1.0893,"t":1721030400000}`.
fn parse_quote_frame(frame: &serde_json::Value) -> Option<Quote> {
    let pair = instruments::from_feed_symbol(frame.get("p")?.as_str()?)?;
    let bid = frame.get("b")?.as_f64()?;
    let ask = frame.get("a")?.as_f64()?;
    let ts_ms = frame.get("t")?.as_i64()?;
    let timestamp = Utc.timestamp_millis_opt(ts_ms).single()?;

    Some(Quote {
        pair,
        bid,
        ask,
        timestamp,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use uuid::Uuid;

    fn test_stream() -> (Arc<PriceStream>, mpsc::UnboundedReceiver<PriceAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(PriceStream::new("key", tx)), rx)
    }

    #[test]
    fn starts_disconnected() {
        let (stream, _rx) = test_stream();
        assert_eq!(stream.state(), StreamState::Disconnected);
        assert!(!stream.is_connected());
    }

    #[test]
    fn parse_quote_frame_happy_path() {
        let frame = serde_json::json!({
            "ev": "C", "p": "C.EUR/USD", "b": 1.0891, "a": 1.0893, "t": 1721030400000_i64
        });
        let quote = parse_quote_frame(&frame).unwrap();
        assert_eq!(quote.pair, "EURUSD");
        assert_eq!(quote.bid, 1.0891);
        assert_eq!(quote.ask, 1.0893);
    }

    #[test]
    fn parse_quote_frame_rejects_garbage() {
        assert!(parse_quote_frame(&serde_json::json!({ "ev": "C" })).is_none());
        assert!(parse_quote_frame(&serde_json::json!({
            "ev": "C", "p": "T.AAPL", "b": 1.0, "a": 1.0, "t": 0
        }))
        .is_none());
    }

    #[test]
    fn parse_frames_accepts_arrays_and_objects() {
        assert_eq!(parse_frames(r#"[{"a":1},{"b":2}]"#).len(), 2);
        assert_eq!(parse_frames(r#"{"a":1}"#).len(), 1);
        assert!(parse_frames("not json").is_empty());
        assert!(parse_frames("42").is_empty());
    }

    #[test]
    fn inbound_ticks_update_latest_quote() {
        let (stream, _rx) = test_stream();
        stream.handle_text(
            r#"[{"ev":"C","p":"C.EUR/USD","b":1.1000,"a":1.1002,"t":1721030400000}]"#,
        );
        stream.handle_text(
            r#"[{"ev":"C","p":"C.EUR/USD","b":1.1004,"a":1.1006,"t":1721030401000}]"#,
        );
        let quote = stream.quote("EURUSD").unwrap();
        assert_eq!(quote.bid, 1.1004);
        assert!((stream.mid("EURUSD").unwrap() - 1.1005).abs() < 1e-9);
    }

    #[test]
    fn triggered_alert_is_delivered_through_channel() {
        let (stream, mut rx) = test_stream();
        let id = Uuid::new_v4();
        stream.alerts.add(PriceAlert::new(
            id,
            "EURUSD",
            Direction::Bullish,
            1.1000,
            1.1050,
            1.0950,
        ));

        stream.handle_text(
            r#"[{"ev":"C","p":"C.EUR/USD","b":1.1050,"a":1.1052,"t":1721030400000}]"#,
        );

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.trade_id, id);
        assert!(alert.triggered);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_and_unknown_frames_are_ignored() {
        let (stream, mut rx) = test_stream();
        stream.handle_text(r#"[{"status":"success","message":"subscribed"}]"#);
        stream.handle_text(r#"[{"ev":"XQ","pair":"BTC-USD"}]"#);
        assert!(stream.quote("EURUSD").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_while_disconnected() {
        let (stream, _rx) = test_stream();
        let pairs = vec!["EURUSD".to_string(), "GBPUSD".to_string()];
        stream.subscribe(&pairs).await.unwrap();
        stream.subscribe(&pairs).await.unwrap();
        assert_eq!(stream.subscribed_pairs(), vec!["EURUSD", "GBPUSD"]);

        stream.unsubscribe(&["EURUSD".to_string()]).await.unwrap();
        assert_eq!(stream.subscribed_pairs(), vec!["GBPUSD"]);
        // Unsubscribing an unknown pair is a no-op.
        stream.unsubscribe(&["AUDJPY".to_string()]).await.unwrap();
        assert_eq!(stream.subscribed_pairs(), vec!["GBPUSD"]);
    }

    #[tokio::test]
    async fn disconnect_clears_state_and_alerts() {
        let (stream, _rx) = test_stream();
        stream
            .subscribe(&["EURUSD".to_string()])
            .await
            .unwrap();
        stream.alerts.add(PriceAlert::new(
            Uuid::new_v4(),
            "EURUSD",
            Direction::Bullish,
            1.1,
            1.2,
            1.0,
        ));
        stream.handle_text(
            r#"[{"ev":"C","p":"C.GBP/USD","b":1.2000,"a":1.2002,"t":1721030400000}]"#,
        );

        stream.disconnect().await;
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.subscribed_pairs().is_empty());
        assert!(stream.alerts.is_empty());
        assert!(stream.quote("GBPUSD").is_none());
    }
}
