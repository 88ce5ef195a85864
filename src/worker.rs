use std::fmt;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, Timelike, Utc};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::db::LeadDb;
use crate::driver::{BrowserDriver, RelationshipState};
use crate::events::ServerEvent;
use crate::lock::{BrowserLock, BrowserLockGuard};
use crate::models::{QueueItem, WorkerState};
use crate::pacing::{PacingGate, PacingPolicy, PacingSettings, PacingUpdate};

pub const WORKER_LOCK_OWNER: &str = "connect-worker";

const PAUSED_POLL: Duration = Duration::from_secs(5);
const EMPTY_QUEUE_POLL: Duration = Duration::from_secs(30);
const OUTSIDE_HOURS_POLL: Duration = Duration::from_secs(60);
const DAILY_LIMIT_POLL: Duration = Duration::from_secs(300);
const LOCK_RETRY_POLL: Duration = Duration::from_secs(15);
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Result of driving the send flow for one claimed item. Expected
/// failures are values here, not errors, so the loop can match on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    AlreadyConnected,
    ActionNotFound,
    SubmitUnverified,
    Error(String),
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::ActionNotFound => write!(f, "connect action not found"),
            Self::SubmitUnverified => write!(f, "submit unverified"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// What a single scheduling iteration did.
#[derive(Debug)]
pub enum IterationOutcome {
    QueueEmpty,
    Blocked(PacingGate),
    /// Browser lock unavailable within the timeout; the claimed item
    /// went back to pending.
    LockBusy,
    Attempted { item_id: i64, outcome: SendOutcome },
}

#[derive(Debug)]
pub enum WorkerStartError {
    /// Configuration rejected; the worker refuses to transition to
    /// running.
    InvalidSettings(String),
    Internal(anyhow::Error),
}

impl fmt::Display for WorkerStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSettings(message) => write!(f, "invalid connect settings: {message}"),
            Self::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for WorkerStartError {}

/// Background loop that drains the connect queue at a human-plausible
/// pace: one item at a time, behind the browser lock, under the daily
/// cap and business-hours gate, with randomized spacing between
/// attempts.
pub struct ConnectWorker {
    db: Arc<LeadDb>,
    lock: Arc<BrowserLock>,
    driver: Arc<dyn BrowserDriver>,
    config: Arc<AppConfig>,
    events: broadcast::Sender<ServerEvent>,
    running: AtomicBool,
    paused: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    last_sent: StdMutex<Option<DateTime<Utc>>>,
}

impl ConnectWorker {
    pub fn new(
        db: Arc<LeadDb>,
        lock: Arc<BrowserLock>,
        driver: Arc<dyn BrowserDriver>,
        config: Arc<AppConfig>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            lock,
            driver,
            config,
            events,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
            last_sent: StdMutex::new(None),
        })
    }

    /// Effective pacing settings: the stored blob when present,
    /// otherwise the configured defaults.
    pub async fn configured_settings(&self) -> Result<PacingSettings> {
        let stored = self.db.get_pacing_settings_raw().await?;
        let defaults = self.config.pacing_defaults();
        Ok(match stored {
            Some(value) => PacingSettings::from_stored(Some(value), &defaults),
            None => defaults,
        })
    }

    /// Merge, clamp, persist, and pick up a settings update.
    pub async fn update_settings(&self, update: PacingUpdate) -> Result<PacingSettings> {
        let merged = self.configured_settings().await?.apply(update).normalized();
        self.db
            .save_pacing_settings(&serde_json::to_value(&merged)?)
            .await?;
        self.wake.notify_one();
        Ok(merged)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Start the loop. Idempotent: starting a running worker returns
    /// the current snapshot without spawning a second loop. Refuses to
    /// run on invalid settings.
    pub async fn start(self: &Arc<Self>) -> Result<WorkerState, WorkerStartError> {
        let settings = self
            .configured_settings()
            .await
            .map_err(WorkerStartError::Internal)?;
        settings.validate().map_err(WorkerStartError::InvalidSettings)?;

        {
            let mut task = self.task.lock().await;
            let alive = task.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false);

            if alive && self.running.load(Ordering::SeqCst) {
                debug!("connect worker already running");
            } else {
                // A previous loop may still be winding down after
                // stop(); let it finish so two loops never overlap.
                if let Some(old) = task.take() {
                    if !old.is_finished() {
                        info!("waiting for previous worker loop to exit");
                    }
                    let _ = old.await;
                }

                self.running.store(true, Ordering::SeqCst);
                self.paused.store(false, Ordering::SeqCst);
                let worker = Arc::clone(self);
                *task = Some(tokio::spawn(async move {
                    worker.run_loop().await;
                }));
                info!("connect worker started");
            }
        }

        self.status().await.map_err(WorkerStartError::Internal)
    }

    /// Request the loop to exit at its next safe point. Never interrupts
    /// a browser operation already in flight.
    pub async fn stop(&self) -> Result<WorkerState> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("connect worker stopping");
        }
        self.wake.notify_one();
        self.status().await
    }

    pub async fn pause(&self) -> Result<WorkerState> {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("connect worker paused");
        }
        self.status().await
    }

    pub async fn resume(&self) -> Result<WorkerState> {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("connect worker resumed");
        }
        self.wake.notify_one();
        self.status().await
    }

    /// Wake the loop early so queue changes are picked up immediately.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Wait for the loop task to finish. Used on shutdown.
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn status(&self) -> Result<WorkerState> {
        let settings = self.configured_settings().await?;
        let stats = self.db.queue_stats().await?;
        let sends_today = self
            .db
            .sent_count_for_local_day(Local::now().date_naive())
            .await?;
        let last_sent = *self.last_sent.lock().expect("last_sent lock poisoned");

        Ok(WorkerState {
            running: self.is_running(),
            paused: self.is_paused(),
            last_sent,
            sends_today,
            daily_limit: settings.daily_limit,
            pending: stats.pending,
            sent: stats.sent,
            failed: stats.failed,
        })
    }

    async fn run_loop(&self) {
        info!("connect worker loop running");
        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                self.sleep_with_wake(PAUSED_POLL).await;
                continue;
            }

            match self.run_once().await {
                Ok(IterationOutcome::Attempted { item_id, outcome }) => {
                    let settings = match self.configured_settings().await {
                        Ok(settings) => settings,
                        Err(_) => self.config.pacing_defaults(),
                    };
                    let delay = PacingPolicy::jitter_delay(&settings);
                    info!(
                        item = item_id,
                        "attempt finished ({outcome}); next check in {:.0}s",
                        delay.as_secs_f64()
                    );
                    self.sleep_with_wake(delay).await;
                }
                Ok(IterationOutcome::QueueEmpty) => {
                    debug!("connect queue empty");
                    self.sleep_with_wake(EMPTY_QUEUE_POLL).await;
                }
                Ok(IterationOutcome::Blocked(PacingGate::DailyLimitReached { sent, limit })) => {
                    info!("daily limit reached ({sent}/{limit}); waiting for rollover");
                    self.sleep_with_wake(DAILY_LIMIT_POLL).await;
                }
                Ok(IterationOutcome::Blocked(PacingGate::OutsideBusinessHours { start, end })) => {
                    debug!("outside business hours ({start:02}:00-{end:02}:00)");
                    self.sleep_with_wake(OUTSIDE_HOURS_POLL).await;
                }
                Ok(IterationOutcome::LockBusy) => {
                    debug!("browser busy; item left pending");
                    self.sleep_with_wake(LOCK_RETRY_POLL).await;
                }
                Err(err) => {
                    error!("connect worker iteration failed: {err:#}");
                    self.sleep_with_wake(ERROR_BACKOFF).await;
                }
            }
        }
        info!("connect worker loop exited");
    }

    /// One scheduling iteration: consult pacing, claim the oldest
    /// pending item, take the browser lock, drive the send flow, and
    /// reconcile the result into the queue. Public so a single
    /// iteration can be exercised deterministically.
    pub async fn run_once(&self) -> Result<IterationOutcome> {
        let settings = self.configured_settings().await?;
        let now = Local::now();
        let sends_today = self.db.sent_count_for_local_day(now.date_naive()).await?;

        if let Some(gate) = PacingPolicy::gate(&settings, sends_today, now.hour()) {
            return Ok(IterationOutcome::Blocked(gate));
        }

        let claim_stale = Duration::from_secs(self.config.claim_stale_seconds);
        let Some(item) = self.db.claim_next_pending(claim_stale).await? else {
            return Ok(IterationOutcome::QueueEmpty);
        };

        let acquire_timeout = Duration::from_secs(self.config.lock_acquire_timeout_seconds);
        let guard = match self.lock.acquire(WORKER_LOCK_OWNER, acquire_timeout).await {
            Ok(guard) => guard,
            Err(busy) => {
                // Resource contention is not an item failure.
                debug!(item = item.id, "{busy}; releasing claim");
                self.db.release_claim(item.id).await?;
                return Ok(IterationOutcome::LockBusy);
            }
        };

        info!(item = item.id, url = %item.linkedin_url, "sending connect request to {}", item.full_name);
        let outcome = self.execute_send(&item, &guard).await;
        drop(guard);

        match &outcome {
            SendOutcome::Sent => {
                self.db.mark_sent(item.id).await?;
                self.record_sent();
                info!(item = item.id, "connect request verified sent to {}", item.full_name);
            }
            SendOutcome::AlreadyConnected => {
                // Idempotent success: nothing was sent, but the goal
                // state holds.
                self.db.mark_sent(item.id).await?;
                self.record_sent();
                info!(item = item.id, "already connected or pending; marked sent");
            }
            SendOutcome::ActionNotFound => {
                self.db
                    .mark_failed(item.id, "connect action not found on profile")
                    .await?;
                warn!(item = item.id, "no connect action for {}", item.full_name);
            }
            SendOutcome::SubmitUnverified => {
                self.db
                    .mark_failed(item.id, "invite submitted but could not be verified")
                    .await?;
                warn!(item = item.id, "could not verify send to {}", item.full_name);
            }
            SendOutcome::Error(reason) => {
                self.db.mark_failed(item.id, reason).await?;
                warn!(item = item.id, "send flow failed for {}: {reason}", item.full_name);
            }
        }

        self.publish_state().await;
        Ok(IterationOutcome::Attempted {
            item_id: item.id,
            outcome,
        })
    }

    /// Run the multi-step send flow, converting any error into a
    /// `SendOutcome::Error` so the loop itself never propagates one.
    async fn execute_send(&self, item: &QueueItem, guard: &BrowserLockGuard) -> SendOutcome {
        match self.drive_send_flow(item, guard).await {
            Ok(outcome) => outcome,
            Err(err) => SendOutcome::Error(format!("{err:#}")),
        }
    }

    async fn drive_send_flow(
        &self,
        item: &QueueItem,
        guard: &BrowserLockGuard,
    ) -> Result<SendOutcome> {
        self.driver.open_profile(&item.linkedin_url).await?;
        let flow = self.send_flow_steps(item, guard).await;
        if let Err(err) = self.driver.close_visit().await {
            debug!("failed closing browser visit: {err:#}");
        }
        flow
    }

    async fn send_flow_steps(
        &self,
        item: &QueueItem,
        guard: &BrowserLockGuard,
    ) -> Result<SendOutcome> {
        guard.touch();
        if self.driver.relationship_state().await? == RelationshipState::PendingOrConnected {
            return Ok(SendOutcome::AlreadyConnected);
        }

        guard.touch();
        if !self.driver.locate_connect_action().await? {
            return Ok(SendOutcome::ActionNotFound);
        }

        self.driver.open_invite().await?;
        guard.touch();
        self.driver.submit_invite(item.note.as_deref()).await?;

        guard.touch();
        if self.driver.verify_sent().await? {
            Ok(SendOutcome::Sent)
        } else {
            Ok(SendOutcome::SubmitUnverified)
        }
    }

    fn record_sent(&self) {
        *self.last_sent.lock().expect("last_sent lock poisoned") = Some(Utc::now());
    }

    async fn publish_state(&self) {
        if let Ok(state) = self.status().await {
            let _ = self.events.send(ServerEvent::Worker(state));
        }
    }

    async fn sleep_with_wake(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
