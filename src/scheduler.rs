// =============================================================================
// Deadline Scheduler — four one-shot timers per session + daily cleanup
// =============================================================================
//
// For a session opening at T the scheduler arms:
//   T-120s  prewarm_bars     (bar cache fill)
//   T-60s   prewarm_inputs   (chart packs + stream connect)
//   T+0s    execute          (predictions + position opens)
//   T+4h    reconcile        (timeouts, excursions, stats refresh)
//
// Deadlines already in the past at arm time are skipped, never back-fired.
// A recurring 00:00 UTC trigger runs the rolling-window cleanup.
//
// The orchestrator chains cycles by sending ScheduleNext over the command
// channel when execute finishes; the scheduler owns the channel, which keeps
// the scheduler/orchestrator reference graph acyclic.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::session_clock;
use crate::types::Session;

/// Callbacks the scheduler fires around each session. Errors are logged by
/// the scheduler and never cancel sibling deadlines.
#[async_trait]
pub trait SessionHandlers: Send + Sync + 'static {
    async fn prewarm_bars(&self, session: Session) -> anyhow::Result<()>;
    async fn prewarm_inputs(&self, session: Session) -> anyhow::Result<()>;
    async fn execute(&self, session: Session) -> anyhow::Result<()>;
    async fn reconcile(&self, session: Session) -> anyhow::Result<()>;
    async fn daily_cleanup(&self) -> anyhow::Result<()>;
}

/// Commands accepted by the scheduler's command loop.
#[derive(Debug, Clone, Copy)]
pub enum SchedulerCommand {
    /// Compute the next qualifying session and arm its four deadlines.
    ScheduleNext,
}

/// The four per-session deadlines.
#[derive(Debug, Clone, Copy)]
enum DeadlineKind {
    PrewarmBars,
    PrewarmInputs,
    Execute,
    Reconcile,
}

impl DeadlineKind {
    fn name(&self) -> &'static str {
        match self {
            Self::PrewarmBars => "prewarm_bars",
            Self::PrewarmInputs => "prewarm_inputs",
            Self::Execute => "execute",
            Self::Reconcile => "reconcile",
        }
    }
}

/// Offsets (seconds before open) for the two pre-warm phases.
#[derive(Debug, Clone, Copy)]
pub struct PrewarmOffsets {
    pub bars_secs: u64,
    pub inputs_secs: u64,
}

pub struct DeadlineScheduler<H: SessionHandlers> {
    handlers: Arc<H>,
    offsets: PrewarmOffsets,
    running: Arc<AtomicBool>,
    /// Session currently armed, for the status endpoint.
    armed: Arc<RwLock<Option<Session>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cmd_tx: mpsc::UnboundedSender<SchedulerCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerCommand>>>,
}

impl<H: SessionHandlers> DeadlineScheduler<H> {
    pub fn new(handlers: Arc<H>, offsets: PrewarmOffsets) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            handlers,
            offsets,
            running: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(RwLock::new(None)),
            tasks: Mutex::new(Vec::new()),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }
    }

    /// Sender the orchestrator uses to chain the next cycle.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<SchedulerCommand> {
        self.cmd_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn armed_session(&self) -> Option<Session> {
        *self.armed.read()
    }

    /// Start the command loop and the daily cleanup trigger, then arm the
    /// next session. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(mut cmd_rx) = self.cmd_rx.lock().take() else {
            warn!("scheduler started twice — command loop already consumed");
            return;
        };

        // Command loop: arm deadlines on demand.
        let this = Arc::clone(self);
        let cmd_task = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if !this.is_running() {
                    break;
                }
                match cmd {
                    SchedulerCommand::ScheduleNext => {
                        let session = session_clock::next_session(Utc::now());
                        this.schedule(session);
                    }
                }
            }
        });
        self.tasks.lock().push(cmd_task);

        // Daily cleanup at 00:00 UTC.
        let this = Arc::clone(self);
        let cleanup_task = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next_midnight = (now + Days::new(1))
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|naive| naive.and_utc())
                    .unwrap_or(now + ChronoDuration::days(1));
                sleep_until_instant(next_midnight).await;

                if !this.is_running() {
                    break;
                }
                info!("daily cleanup trigger fired");
                if let Err(e) = this.handlers.daily_cleanup().await {
                    error!(error = %e, "daily cleanup failed");
                }
            }
        });
        self.tasks.lock().push(cleanup_task);

        info!("deadline scheduler started");
        let _ = self.cmd_tx.send(SchedulerCommand::ScheduleNext);
    }

    /// Arm the four deadlines for `session`. Deadlines already in the past
    /// are skipped.
    pub fn schedule(self: &Arc<Self>, session: Session) {
        *self.armed.write() = Some(session);
        info!(session = %session, "scheduling session deadlines");

        let bars_at = session.open - ChronoDuration::seconds(self.offsets.bars_secs as i64);
        let inputs_at = session.open - ChronoDuration::seconds(self.offsets.inputs_secs as i64);
        let reconcile_at = session.open + ChronoDuration::hours(4);

        self.arm(session, bars_at, DeadlineKind::PrewarmBars);
        self.arm(session, inputs_at, DeadlineKind::PrewarmInputs);
        self.arm(session, session.open, DeadlineKind::Execute);
        self.arm(session, reconcile_at, DeadlineKind::Reconcile);

        // Drop finished handles so the list stays bounded.
        self.tasks.lock().retain(|t| !t.is_finished());
    }

    fn arm(self: &Arc<Self>, session: Session, at: DateTime<Utc>, kind: DeadlineKind) {
        if at <= Utc::now() {
            warn!(deadline = kind.name(), at = %at, "deadline already past — skipping");
            return;
        }

        let handlers = Arc::clone(&self.handlers);
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            sleep_until_instant(at).await;
            if !running.load(Ordering::SeqCst) {
                return;
            }
            info!(deadline = kind.name(), session = %session, "deadline fired");
            let result = match kind {
                DeadlineKind::PrewarmBars => handlers.prewarm_bars(session).await,
                DeadlineKind::PrewarmInputs => handlers.prewarm_inputs(session).await,
                DeadlineKind::Execute => handlers.execute(session).await,
                DeadlineKind::Reconcile => handlers.reconcile(session).await,
            };
            if let Err(e) = result {
                error!(deadline = kind.name(), session = %session, error = %e, "handler failed");
            }
        });
        self.tasks.lock().push(task);
    }

    /// Cancel every pending deadline. Already-running handlers finish their
    /// current await and then observe the cleared running flag.
    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.armed.write() = None;
        info!("all scheduled deadlines cancelled");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_all();
        info!("deadline scheduler stopped");
    }
}

/// Sleep until a wall-clock instant; returns immediately when it has passed.
async fn sleep_until_instant(at: DateTime<Utc>) {
    let now = Utc::now();
    if at <= now {
        return;
    }
    match (at - now).to_std() {
        Ok(delta) => tokio::time::sleep(delta).await,
        Err(_) => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandlers {
        bars: AtomicUsize,
        inputs: AtomicUsize,
        executes: AtomicUsize,
        reconciles: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl CountingHandlers {
        fn new() -> Self {
            Self {
                bars: AtomicUsize::new(0),
                inputs: AtomicUsize::new(0),
                executes: AtomicUsize::new(0),
                reconciles: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionHandlers for CountingHandlers {
        async fn prewarm_bars(&self, _s: Session) -> anyhow::Result<()> {
            self.bars.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn prewarm_inputs(&self, _s: Session) -> anyhow::Result<()> {
            self.inputs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn execute(&self, _s: Session) -> anyhow::Result<()> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn reconcile(&self, _s: Session) -> anyhow::Result<()> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn daily_cleanup(&self) -> anyhow::Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn near_future_session(secs: i64) -> Session {
        Session::new(SessionId::London, Utc::now() + ChronoDuration::seconds(secs))
    }

    #[tokio::test]
    async fn past_deadlines_are_skipped_not_backfired() {
        let handlers = Arc::new(CountingHandlers::new());
        let sched = Arc::new(DeadlineScheduler::new(
            Arc::clone(&handlers),
            PrewarmOffsets { bars_secs: 120, inputs_secs: 60 },
        ));
        sched.running.store(true, Ordering::SeqCst);

        // Session opened an hour ago: prewarms and execute are all past and
        // must not fire; only the T+4h reconcile remains armed.
        let session = near_future_session(-3600);
        sched.schedule(session);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(handlers.bars.load(Ordering::SeqCst), 0);
        assert_eq!(handlers.inputs.load(Ordering::SeqCst), 0);
        assert_eq!(handlers.executes.load(Ordering::SeqCst), 0);
        assert_eq!(handlers.reconciles.load(Ordering::SeqCst), 0);
        sched.cancel_all();
    }

    #[tokio::test]
    async fn imminent_execute_fires_exactly_once() {
        let handlers = Arc::new(CountingHandlers::new());
        let sched = Arc::new(DeadlineScheduler::new(
            Arc::clone(&handlers),
            PrewarmOffsets { bars_secs: 120, inputs_secs: 60 },
        ));
        sched.running.store(true, Ordering::SeqCst);

        // Open is 1s out; both prewarm deadlines are already past.
        let session = near_future_session(1);
        sched.schedule(session);

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(handlers.executes.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.bars.load(Ordering::SeqCst), 0);
        sched.cancel_all();
    }

    #[tokio::test]
    async fn cancel_all_prevents_pending_deadlines() {
        let handlers = Arc::new(CountingHandlers::new());
        let sched = Arc::new(DeadlineScheduler::new(
            Arc::clone(&handlers),
            PrewarmOffsets { bars_secs: 120, inputs_secs: 60 },
        ));
        sched.running.store(true, Ordering::SeqCst);

        let session = near_future_session(2);
        sched.schedule(session);
        assert!(sched.armed_session().is_some());

        sched.cancel_all();
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert_eq!(handlers.executes.load(Ordering::SeqCst), 0);
        assert!(sched.armed_session().is_none());
    }
}
