use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Mutual exclusion over the shared browser profile. Only one logical
/// actor (scrape run, connect worker, session check) may drive the
/// browser at a time; a second Chromium on the same profile directory
/// corrupts it.
///
/// Acquisition is bounded, re-entrant for the same owner, and
/// recoverable: a holder that stops heartbeating past the staleness
/// window is treated as abandoned and the lock is reclaimed.
pub struct BrowserLock {
    name: String,
    stale_after: Duration,
    state: Mutex<LockState>,
    notify: Notify,
}

#[derive(Default)]
struct LockState {
    owner: Option<String>,
    depth: u32,
    epoch: u64,
    last_heartbeat: Option<Instant>,
}

/// Returned when the lock could not be acquired within the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimedOut {
    pub name: String,
    pub held_by: Option<String>,
}

impl fmt::Display for LockTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.held_by {
            Some(owner) => write!(f, "lock '{}' busy (held by {})", self.name, owner),
            None => write!(f, "lock '{}' busy", self.name),
        }
    }
}

impl std::error::Error for LockTimedOut {}

/// Releases its hold on drop, so the lock is freed even when the
/// holding operation bails out early.
pub struct BrowserLockGuard {
    lock: Arc<BrowserLock>,
    owner: String,
    epoch: u64,
}

impl BrowserLockGuard {
    /// Signal liveness mid-operation so a long-running hold is not
    /// mistaken for an abandoned one.
    pub fn touch(&self) {
        self.lock.heartbeat(&self.owner, self.epoch);
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for BrowserLockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.owner, self.epoch);
    }
}

impl fmt::Debug for BrowserLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserLockGuard")
            .field("owner", &self.owner)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl BrowserLock {
    pub fn new(name: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            name: name.into(),
            stale_after,
            state: Mutex::new(LockState::default()),
            notify: Notify::new(),
        }
    }

    /// Acquire the lock for `owner`, waiting at most `timeout`. The same
    /// owner may acquire again while already holding (depth counted);
    /// a stale hold by another owner is reclaimed rather than waited on
    /// forever.
    pub async fn acquire(
        self: &Arc<Self>,
        owner: &str,
        timeout: Duration,
    ) -> Result<BrowserLockGuard, LockTimedOut> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.state.lock().expect("browser lock state poisoned");
                match &state.owner {
                    None => {
                        state.owner = Some(owner.to_string());
                        state.depth = 1;
                        state.epoch += 1;
                        state.last_heartbeat = Some(Instant::now());
                        debug!(lock = %self.name, %owner, "lock acquired");
                        return Ok(BrowserLockGuard {
                            lock: Arc::clone(self),
                            owner: owner.to_string(),
                            epoch: state.epoch,
                        });
                    }
                    Some(current) if current == owner => {
                        state.depth += 1;
                        return Ok(BrowserLockGuard {
                            lock: Arc::clone(self),
                            owner: owner.to_string(),
                            epoch: state.epoch,
                        });
                    }
                    Some(current) => {
                        let stale = state
                            .last_heartbeat
                            .map(|hb| hb.elapsed() >= self.stale_after)
                            .unwrap_or(true);
                        if stale {
                            warn!(
                                lock = %self.name,
                                abandoned_by = %current,
                                reclaimed_by = %owner,
                                "reclaiming stale lock (no heartbeat for {:?})",
                                self.stale_after
                            );
                            state.owner = Some(owner.to_string());
                            state.depth = 1;
                            state.epoch += 1;
                            state.last_heartbeat = Some(Instant::now());
                            return Ok(BrowserLockGuard {
                                lock: Arc::clone(self),
                                owner: owner.to_string(),
                                epoch: state.epoch,
                            });
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockTimedOut {
                    name: self.name.clone(),
                    held_by: self.holder(),
                });
            }

            // Wake on release, or re-check periodically so a hold going
            // stale while we wait is eventually reclaimed.
            let wait = (deadline - now).min(Duration::from_millis(500));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.state
            .lock()
            .expect("browser lock state poisoned")
            .owner
            .clone()
    }

    fn heartbeat(&self, owner: &str, epoch: u64) {
        let mut state = self.state.lock().expect("browser lock state poisoned");
        if state.owner.as_deref() == Some(owner) && state.epoch == epoch {
            state.last_heartbeat = Some(Instant::now());
        }
    }

    fn release(&self, owner: &str, epoch: u64) {
        let mut state = self.state.lock().expect("browser lock state poisoned");
        if state.owner.as_deref() != Some(owner) || state.epoch != epoch {
            // Guard outlived a staleness reclamation; its hold is gone.
            debug!(lock = %self.name, %owner, "ignoring release from superseded guard");
            return;
        }
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            state.last_heartbeat = None;
            self.notify.notify_waiters();
        }
    }
}
