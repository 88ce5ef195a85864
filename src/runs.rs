use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::LeadDb;
use crate::events::ServerEvent;
use crate::models::{LeadSource, RunRecord, RunStatus};
use crate::state::AppState;

/// Durable record-keeping for extraction invocations. Callers `begin`
/// before touching the browser and `complete` exactly once.
#[derive(Clone)]
pub struct RunRegistry {
    db: Arc<LeadDb>,
}

impl RunRegistry {
    pub fn new(db: Arc<LeadDb>) -> Self {
        Self { db }
    }

    pub async fn begin(&self, source: LeadSource, input: &str) -> Result<i64> {
        let run_id = self.db.create_run(source, input).await?;
        info!(run = run_id, source = source.as_str(), "extraction run started");
        Ok(run_id)
    }

    /// Terminal transition; completing a run that is not `running` is an
    /// error so history stays auditable.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        run_id: i64,
        status: RunStatus,
        leads_found: i64,
        leads_enriched: i64,
        error: Option<&str>,
        output_paths: &[String],
    ) -> Result<()> {
        self.db
            .complete_run(run_id, status, leads_found, leads_enriched, error, output_paths)
            .await
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.db.get_run(run_id).await
    }

    pub async fn list(
        &self,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>> {
        self.db.list_runs(status, limit, offset).await
    }

    pub async fn count(&self, status: Option<RunStatus>) -> Result<i64> {
        self.db.count_runs(status).await
    }
}

/// Live progress of the one in-flight search, also the SSE payload.
#[derive(Debug, Clone, Serialize)]
pub struct SearchProgress {
    pub run_id: Option<i64>,
    pub found: u64,
    pub page: u32,
    pub done: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchAlreadyRunning;

impl fmt::Display for SearchAlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a search is already running")
    }
}

impl std::error::Error for SearchAlreadyRunning {}

/// At most one extraction run may be active per process, across the
/// API and any other caller. Distinct from the browser lock: this
/// guard rejects overlapping run *starts* outright, while the lock
/// serializes actual browser use among whoever is running.
#[derive(Default)]
pub struct ActiveSearchGuard {
    inner: StdMutex<Option<SearchProgress>>,
}

impl ActiveSearchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the single search slot, failing fast when one is active.
    pub fn try_begin(&self) -> Result<(), SearchAlreadyRunning> {
        let mut inner = self.inner.lock().expect("search guard poisoned");
        if let Some(active) = inner.as_ref() {
            if !active.done {
                return Err(SearchAlreadyRunning);
            }
        }
        *inner = Some(SearchProgress {
            run_id: None,
            found: 0,
            page: 0,
            done: false,
            error: None,
        });
        Ok(())
    }

    /// Attach the run id once the registry row exists.
    pub fn activate(&self, run_id: i64) {
        let mut inner = self.inner.lock().expect("search guard poisoned");
        if let Some(active) = inner.as_mut() {
            active.run_id = Some(run_id);
        }
    }

    /// Roll back a reservation that never became a run.
    pub fn clear(&self) {
        *self.inner.lock().expect("search guard poisoned") = None;
    }

    pub fn progress(&self, found: u64, page: u32) {
        let mut inner = self.inner.lock().expect("search guard poisoned");
        if let Some(active) = inner.as_mut() {
            if !active.done {
                active.found = found;
                active.page = page;
            }
        }
    }

    /// Mark the active search finished. The snapshot is kept for
    /// late-arriving progress readers until the next `try_begin`.
    pub fn finish(&self, found: u64, error: Option<String>) {
        let mut inner = self.inner.lock().expect("search guard poisoned");
        if let Some(active) = inner.as_mut() {
            active.found = found;
            active.done = true;
            active.error = error;
        }
    }

    pub fn snapshot(&self) -> Option<SearchProgress> {
        self.inner.lock().expect("search guard poisoned").clone()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub source: LeadSource,
    pub input: String,
    pub max_pages: u32,
}

#[derive(Debug)]
pub enum ExtractionStartError {
    AlreadyRunning,
    Internal(anyhow::Error),
}

impl fmt::Display for ExtractionStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "a search is already running"),
            Self::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for ExtractionStartError {}

/// Begin an extraction run: reserve the search slot, register the run,
/// and spawn the crawl in the background. Returns the run id
/// immediately; progress flows through the guard and the event channel.
pub async fn start_extraction(
    state: &AppState,
    request: ExtractionRequest,
) -> Result<i64, ExtractionStartError> {
    state
        .active_search
        .try_begin()
        .map_err(|_| ExtractionStartError::AlreadyRunning)?;

    let run_id = match state.registry.begin(request.source, &request.input).await {
        Ok(run_id) => run_id,
        Err(err) => {
            state.active_search.clear();
            return Err(ExtractionStartError::Internal(err));
        }
    };
    state.active_search.activate(run_id);
    publish_progress(state);

    let state = state.clone();
    tokio::spawn(async move {
        run_extraction(state, run_id, request).await;
    });

    Ok(run_id)
}

async fn run_extraction(state: AppState, run_id: i64, request: ExtractionRequest) {
    match drive_extraction(&state, run_id, &request).await {
        Ok(found) => {
            if let Err(err) = state
                .registry
                .complete(run_id, RunStatus::Done, found as i64, 0, None, &[])
                .await
            {
                error!(run = run_id, "failed recording run completion: {err:#}");
            }
            state.active_search.finish(found, None);
            info!(run = run_id, "extraction run complete ({found} leads)");
        }
        Err(err) => {
            let message = format!("{err:#}");
            if let Err(err) = state
                .registry
                .complete(run_id, RunStatus::Error, 0, 0, Some(&message), &[])
                .await
            {
                error!(run = run_id, "failed recording run failure: {err:#}");
            }
            state.active_search.finish(0, Some(message.clone()));
            warn!(run = run_id, "extraction run failed: {message}");
        }
    }

    publish_progress(&state);
    if let Ok(Some(run)) = state.registry.get(run_id).await {
        let _ = state.events.send(ServerEvent::Run(run));
    }
}

async fn drive_extraction(
    state: &AppState,
    run_id: i64,
    request: &ExtractionRequest,
) -> Result<u64> {
    let timeout = Duration::from_secs(state.config.lock_acquire_timeout_seconds);
    let owner = format!("scrape-run-{run_id}");
    let guard = state
        .lock
        .acquire(&owner, timeout)
        .await
        .map_err(|busy| anyhow!("browser unavailable: {busy}"))?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let spider = Arc::clone(&state.spider);
    let source = request.source;
    let input = request.input.clone();
    let max_pages = request.max_pages;
    let crawl = tokio::spawn(async move {
        spider.collect(source, input, max_pages, progress_tx).await
    });

    while let Some(progress) = progress_rx.recv().await {
        guard.touch();
        state.active_search.progress(progress.found, progress.page);
        publish_progress(state);
    }

    let leads = crawl
        .await
        .map_err(|err| anyhow!("extraction task crashed: {err}"))??;
    state.db.upsert_leads(&leads).await?;

    drop(guard);
    Ok(leads.len() as u64)
}

fn publish_progress(state: &AppState) {
    if let Some(progress) = state.active_search.snapshot() {
        let _ = state.events.send(ServerEvent::SearchProgress(progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_overlapping_searches() {
        let guard = ActiveSearchGuard::new();
        guard.try_begin().expect("first begin");
        assert_eq!(guard.try_begin(), Err(SearchAlreadyRunning));

        guard.finish(3, None);
        guard.try_begin().expect("begin after finish");
    }

    #[test]
    fn guard_clear_rolls_back_reservation() {
        let guard = ActiveSearchGuard::new();
        guard.try_begin().expect("begin");
        guard.clear();
        assert!(guard.snapshot().is_none());
        guard.try_begin().expect("begin after clear");
    }

    #[test]
    fn guard_tracks_progress_until_done() {
        let guard = ActiveSearchGuard::new();
        guard.try_begin().expect("begin");
        guard.activate(7);
        guard.progress(12, 2);

        let snap = guard.snapshot().expect("active snapshot");
        assert_eq!(snap.run_id, Some(7));
        assert_eq!(snap.found, 12);
        assert_eq!(snap.page, 2);
        assert!(!snap.done);

        guard.finish(15, None);
        guard.progress(99, 9);
        let snap = guard.snapshot().expect("finished snapshot");
        assert_eq!(snap.found, 15);
        assert!(snap.done);
    }
}
