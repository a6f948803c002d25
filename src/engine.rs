// =============================================================================
// Engine — composition root owning C1..C8
// =============================================================================
//
// One Engine is built at process start and shared by reference; there are
// no process-scoped singletons. The cyclic shapes are broken with channels:
// the stream delivers alerts into a channel the orchestrator consumes, and
// the orchestrator chains sessions through the scheduler's command channel.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::bars::BarClient;
use crate::charts::ChartPackRenderer;
use crate::config::Settings;
use crate::orchestrator::{EngineEvent, OrchestratorStatus, SessionOrchestrator};
use crate::predictor::ClaudePredictor;
use crate::risk::RiskEngine;
use crate::scheduler::{DeadlineScheduler, PrewarmOffsets};
use crate::store::{AccountSnapshot, Database, TradeRecord};
use crate::store::rolling::PercentileTargets;
use crate::stream::{PriceAlert, PriceStream};

/// Engine status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub orchestrator: OrchestratorStatus,
}

pub struct Engine {
    settings: Settings,
    db: Arc<Database>,
    stream: Arc<PriceStream>,
    orchestrator: Arc<SessionOrchestrator>,
    scheduler: Arc<DeadlineScheduler<SessionOrchestrator>>,
    events: broadcast::Sender<EngineEvent>,
    alert_rx: Mutex<Option<mpsc::UnboundedReceiver<PriceAlert>>>,
    started_at: Instant,
}

impl Engine {
    /// Build and wire every subsystem. Nothing runs until `start`.
    pub fn new(settings: Settings) -> Result<Self> {
        let db = Arc::new(Database::open(&settings.database_url, &settings)?);
        let risk = Arc::new(RiskEngine::new(Arc::clone(&db), settings.clone()));

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(PriceStream::new(settings.polygon_api_key.clone(), alert_tx));

        let bar_client = Arc::new(BarClient::new(settings.polygon_api_key.clone()));
        let predictor = Arc::new(ClaudePredictor::new(settings.anthropic_api_key.clone()));
        let (events, _) = broadcast::channel(64);

        let orchestrator = Arc::new(SessionOrchestrator::new(
            settings.clone(),
            Arc::clone(&db),
            risk,
            Arc::clone(&stream),
            bar_client,
            predictor,
            Arc::new(ChartPackRenderer),
            events.clone(),
        ));

        let scheduler = Arc::new(DeadlineScheduler::new(
            Arc::clone(&orchestrator),
            PrewarmOffsets {
                bars_secs: settings.ohlc_prewarm_seconds,
                inputs_secs: settings.input_prewarm_seconds,
            },
        ));
        orchestrator.set_schedule_sender(scheduler.command_sender());

        Ok(Self {
            settings,
            db,
            stream,
            orchestrator,
            scheduler,
            events,
            alert_rx: Mutex::new(Some(alert_rx)),
            started_at: Instant::now(),
        })
    }

    /// Start the alert loop and the scheduler. Idempotent for the
    /// scheduler; the alert loop is spawned only once.
    pub fn start(&self) {
        if let Some(rx) = self.alert_rx.lock().take() {
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(orchestrator.run_alert_loop(rx));
        }
        self.scheduler.start();
        info!("engine started");
    }

    /// Cancel scheduled work and close the stream.
    pub async fn stop(&self) {
        self.scheduler.stop();
        self.stream.disconnect().await;
        info!("engine stopped");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.scheduler.is_running(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            orchestrator: self.orchestrator.status(),
        }
    }

    // ── Read-only store access for the admin surface ─────────────────────

    pub fn account_snapshot(&self) -> Result<AccountSnapshot> {
        self.db.account_snapshot()
    }

    pub fn recent_trades(&self, limit: u32, offset: u32) -> Result<Vec<TradeRecord>> {
        self.db.recent_trades(limit, offset)
    }

    pub fn all_percentiles(&self) -> Result<Vec<PercentileTargets>> {
        self.db.all_percentiles()
    }

    pub fn parked_failures(&self) -> Vec<crate::orchestrator::ParkedFailure> {
        self.orchestrator.parked_failures()
    }
}
