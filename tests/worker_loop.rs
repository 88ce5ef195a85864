use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use prospector_rs::config::AppConfig;
use prospector_rs::db::LeadDb;
use prospector_rs::driver::{BrowserDriver, RelationshipState, SessionStatus};
use prospector_rs::events::ServerEvent;
use prospector_rs::lock::BrowserLock;
use prospector_rs::models::{ConnectStatus, Lead, LeadSource};
use prospector_rs::pacing::PacingGate;
use prospector_rs::worker::{ConnectWorker, IterationOutcome, SendOutcome};

/// Plays back one canned page state per profile visit.
#[derive(Debug, Clone)]
struct VisitScript {
    relationship: RelationshipState,
    action_found: bool,
    submit_error: Option<String>,
    verified: bool,
}

impl VisitScript {
    fn clean_send() -> Self {
        Self {
            relationship: RelationshipState::Connectable,
            action_found: true,
            submit_error: None,
            verified: true,
        }
    }
}

#[derive(Default)]
struct ScriptedDriver {
    visits: Mutex<VecDeque<VisitScript>>,
    current: Mutex<Option<VisitScript>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    fn with_visits(visits: impl IntoIterator<Item = VisitScript>) -> Arc<Self> {
        Arc::new(Self {
            visits: Mutex::new(visits.into_iter().collect()),
            current: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        })
    }

    fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }

    fn current(&self) -> VisitScript {
        self.current
            .lock()
            .expect("current lock")
            .clone()
            .expect("a visit is open")
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn open_profile(&self, url: &str) -> Result<()> {
        self.opened.lock().expect("opened lock").push(url.to_string());
        let script = self
            .visits
            .lock()
            .expect("visits lock")
            .pop_front()
            .unwrap_or_else(VisitScript::clean_send);
        *self.current.lock().expect("current lock") = Some(script);
        Ok(())
    }

    async fn relationship_state(&self) -> Result<RelationshipState> {
        Ok(self.current().relationship)
    }

    async fn locate_connect_action(&self) -> Result<bool> {
        Ok(self.current().action_found)
    }

    async fn open_invite(&self) -> Result<()> {
        Ok(())
    }

    async fn submit_invite(&self, _note: Option<&str>) -> Result<()> {
        if let Some(message) = self.current().submit_error {
            bail!("{message}");
        }
        Ok(())
    }

    async fn verify_sent(&self) -> Result<bool> {
        Ok(self.current().verified)
    }

    async fn close_visit(&self) -> Result<()> {
        *self.current.lock().expect("current lock") = None;
        Ok(())
    }

    async fn session_status(&self) -> Result<SessionStatus> {
        Ok(SessionStatus::Connected)
    }
}

struct Harness {
    _dir: TempDir,
    db: Arc<LeadDb>,
    lock: Arc<BrowserLock>,
    driver: Arc<ScriptedDriver>,
    worker: Arc<ConnectWorker>,
}

async fn harness(daily_limit: u32, driver: Arc<ScriptedDriver>) -> Harness {
    let dir = TempDir::new().expect("tempdir");

    let mut config = AppConfig::default();
    config.database_path = dir.path().join("leads.db").display().to_string();
    config.connect_daily_limit = daily_limit;
    config.lock_acquire_timeout_seconds = 1;
    let config = Arc::new(config);

    let db = Arc::new(LeadDb::new(&config.database_path()).await.expect("open db"));
    let lock = Arc::new(BrowserLock::new("browser-profile", Duration::from_secs(600)));
    let (events_tx, _events_rx) = broadcast::channel::<ServerEvent>(64);

    let worker = ConnectWorker::new(
        db.clone(),
        lock.clone(),
        driver.clone(),
        config,
        events_tx,
    );

    Harness {
        _dir: dir,
        db,
        lock,
        driver,
        worker,
    }
}

async fn enqueue_leads(db: &LeadDb, names: &[(&str, &str)]) {
    let mut ids = Vec::new();
    for (name, slug) in names {
        let lead = Lead::new(
            Some(&format!("https://www.linkedin.com/in/{slug}")),
            *name,
            None,
            LeadSource::LinkedinSearch,
        );
        db.upsert_lead(&lead).await.expect("upsert");
        let id = db
            .list_leads(100, 0)
            .await
            .expect("list")
            .into_iter()
            .find(|row| row.full_name == *name)
            .expect("lead present")
            .id;
        ids.push(id);
    }
    db.enqueue_connects(&ids, None).await.expect("enqueue");
}

#[tokio::test]
async fn oldest_lead_sends_first_and_daily_cap_blocks_the_rest() {
    let h = harness(1, ScriptedDriver::with_visits([VisitScript::clean_send()])).await;
    enqueue_leads(&h.db, &[("Alice", "alice"), ("Bob", "bob"), ("Carol", "carol")]).await;

    let outcome = h.worker.run_once().await.expect("iteration");
    let IterationOutcome::Attempted { outcome, .. } = outcome else {
        panic!("expected an attempt, got {outcome:?}");
    };
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(
        h.driver.opened_urls(),
        vec!["https://www.linkedin.com/in/alice".to_string()]
    );

    let sent = h
        .db
        .list_queue(Some(ConnectStatus::Sent), 100)
        .await
        .expect("sent rows");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].full_name, "Alice");
    assert!(sent[0].sent_at.is_some());

    let pending = h
        .db
        .list_queue(Some(ConnectStatus::Pending), 100)
        .await
        .expect("pending rows");
    assert_eq!(pending.len(), 2);

    // Second immediate iteration is blocked by the cap; nothing else is
    // attempted or claimed.
    let blocked = h.worker.run_once().await.expect("iteration");
    assert!(matches!(
        blocked,
        IterationOutcome::Blocked(PacingGate::DailyLimitReached { sent: 1, limit: 1 })
    ));
    assert_eq!(h.driver.opened_urls().len(), 1);
}

#[tokio::test]
async fn missing_connect_action_fails_item_and_worker_moves_on() {
    let script = VisitScript {
        action_found: false,
        ..VisitScript::clean_send()
    };
    let h = harness(10, ScriptedDriver::with_visits([script, VisitScript::clean_send()])).await;
    enqueue_leads(&h.db, &[("Alice", "alice"), ("Bob", "bob")]).await;

    let first = h.worker.run_once().await.expect("iteration");
    let IterationOutcome::Attempted { outcome, .. } = first else {
        panic!("expected an attempt, got {first:?}");
    };
    assert_eq!(outcome, SendOutcome::ActionNotFound);

    let failed = h
        .db
        .list_queue(Some(ConnectStatus::Failed), 100)
        .await
        .expect("failed rows");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].full_name, "Alice");
    assert_eq!(
        failed[0].error.as_deref(),
        Some("connect action not found on profile")
    );

    // The failed item takes no further automatic attempts.
    let second = h.worker.run_once().await.expect("iteration");
    let IterationOutcome::Attempted { outcome, .. } = second else {
        panic!("expected an attempt, got {second:?}");
    };
    assert_eq!(outcome, SendOutcome::Sent);

    let third = h.worker.run_once().await.expect("iteration");
    assert!(matches!(third, IterationOutcome::QueueEmpty));
}

#[tokio::test]
async fn driver_errors_are_converted_to_failed_items() {
    let script = VisitScript {
        submit_error: Some("navigation lost".to_string()),
        ..VisitScript::clean_send()
    };
    let h = harness(10, ScriptedDriver::with_visits([script])).await;
    enqueue_leads(&h.db, &[("Alice", "alice")]).await;

    let outcome = h.worker.run_once().await.expect("iteration must not error");
    let IterationOutcome::Attempted { outcome, .. } = outcome else {
        panic!("expected an attempt, got {outcome:?}");
    };
    let SendOutcome::Error(reason) = outcome else {
        panic!("expected an error outcome, got {outcome:?}");
    };
    assert!(reason.contains("navigation lost"));

    let failed = h
        .db
        .list_queue(Some(ConnectStatus::Failed), 100)
        .await
        .expect("failed rows");
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap_or("").contains("navigation lost"));
}

#[tokio::test]
async fn unverified_submit_is_a_retryable_failure() {
    let script = VisitScript {
        verified: false,
        ..VisitScript::clean_send()
    };
    let h = harness(10, ScriptedDriver::with_visits([script])).await;
    enqueue_leads(&h.db, &[("Alice", "alice")]).await;

    let outcome = h.worker.run_once().await.expect("iteration");
    let IterationOutcome::Attempted { outcome, .. } = outcome else {
        panic!("expected an attempt, got {outcome:?}");
    };
    assert_eq!(outcome, SendOutcome::SubmitUnverified);

    let failed = h
        .db
        .list_queue(Some(ConnectStatus::Failed), 100)
        .await
        .expect("failed rows");
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn already_connected_profile_is_an_idempotent_success() {
    let script = VisitScript {
        relationship: RelationshipState::PendingOrConnected,
        ..VisitScript::clean_send()
    };
    let h = harness(1, ScriptedDriver::with_visits([script])).await;
    enqueue_leads(&h.db, &[("Alice", "alice")]).await;

    let outcome = h.worker.run_once().await.expect("iteration");
    let IterationOutcome::Attempted { outcome, .. } = outcome else {
        panic!("expected an attempt, got {outcome:?}");
    };
    assert_eq!(outcome, SendOutcome::AlreadyConnected);

    let sent = h
        .db
        .list_queue(Some(ConnectStatus::Sent), 100)
        .await
        .expect("sent rows");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].sent_at.is_some());

    // The idempotent outcome still consumes the daily budget.
    let blocked = h.worker.run_once().await.expect("iteration");
    assert!(matches!(
        blocked,
        IterationOutcome::Blocked(PacingGate::DailyLimitReached { .. })
    ));
}

#[tokio::test]
async fn busy_browser_leaves_item_pending() {
    let h = harness(10, ScriptedDriver::with_visits([VisitScript::clean_send()])).await;
    enqueue_leads(&h.db, &[("Alice", "alice")]).await;

    let scrape_guard = h
        .lock
        .acquire("scrape-run-1", Duration::from_millis(50))
        .await
        .expect("scrape holds the browser");

    let outcome = h.worker.run_once().await.expect("iteration");
    assert!(matches!(outcome, IterationOutcome::LockBusy));
    assert!(h.driver.opened_urls().is_empty());

    // Not failed, merely deferred.
    let pending = h
        .db
        .list_queue(Some(ConnectStatus::Pending), 100)
        .await
        .expect("pending rows");
    assert_eq!(pending.len(), 1);

    drop(scrape_guard);
    let outcome = h.worker.run_once().await.expect("iteration");
    assert!(matches!(
        outcome,
        IterationOutcome::Attempted {
            outcome: SendOutcome::Sent,
            ..
        }
    ));
}

#[tokio::test]
async fn start_is_idempotent_and_stop_ends_the_loop() {
    let h = harness(10, ScriptedDriver::with_visits([])).await;

    let first = h.worker.start().await.expect("start");
    assert!(first.running);
    assert!(!first.paused);

    let second = h.worker.start().await.expect("second start is a no-op");
    assert!(second.running);
    assert_eq!(first.pending, second.pending);
    assert_eq!(first.sent, second.sent);
    assert_eq!(first.failed, second.failed);

    let stopped = h.worker.stop().await.expect("stop");
    assert!(!stopped.running);

    tokio::time::timeout(Duration::from_secs(5), h.worker.join())
        .await
        .expect("loop exits promptly after stop");
    assert!(!h.worker.is_running());

    // A fresh start spawns a fresh loop.
    let restarted = h.worker.start().await.expect("restart");
    assert!(restarted.running);
    h.worker.stop().await.expect("stop again");
    tokio::time::timeout(Duration::from_secs(5), h.worker.join())
        .await
        .expect("loop exits again");
}

#[tokio::test]
async fn pause_and_resume_toggle_without_stopping() {
    let h = harness(10, ScriptedDriver::with_visits([])).await;

    h.worker.start().await.expect("start");
    let paused = h.worker.pause().await.expect("pause");
    assert!(paused.running);
    assert!(paused.paused);

    let resumed = h.worker.resume().await.expect("resume");
    assert!(resumed.running);
    assert!(!resumed.paused);

    h.worker.stop().await.expect("stop");
    tokio::time::timeout(Duration::from_secs(5), h.worker.join())
        .await
        .expect("loop exits");
}

#[tokio::test]
async fn start_refuses_nonsensical_daily_limit() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = AppConfig::default();
    config.database_path = dir.path().join("leads.db").display().to_string();
    config.connect_daily_limit = 0;
    let config = Arc::new(config);

    let db = Arc::new(LeadDb::new(&config.database_path()).await.expect("db"));
    let lock = Arc::new(BrowserLock::new("browser-profile", Duration::from_secs(600)));
    let (events_tx, _events_rx) = broadcast::channel::<ServerEvent>(8);
    let worker = ConnectWorker::new(
        db,
        lock,
        ScriptedDriver::with_visits([]),
        config,
        events_tx,
    );

    let err = worker.start().await.expect_err("start must refuse");
    assert!(err.to_string().contains("daily_limit"));
    assert!(!worker.is_running());
}
