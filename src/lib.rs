pub mod api;
pub mod config;
pub mod db;
pub mod driver;
pub mod events;
pub mod lock;
pub mod models;
pub mod pacing;
pub mod runs;
pub mod spider;
pub mod state;
pub mod worker;

// Exporting the core types for convenience
pub use config::AppConfig;
pub use db::LeadDb;
pub use driver::{BrowserDriver, RelationshipState, SessionStatus};
pub use lock::{BrowserLock, BrowserLockGuard, LockTimedOut};
pub use models::{ConnectStatus, Lead, LeadSource, QueueItem, RunRecord, RunStatus, WorkerState};
pub use pacing::{PacingGate, PacingPolicy, PacingSettings};
pub use runs::{ActiveSearchGuard, RunRegistry};
pub use spider::{LeadSpider, SpiderProgress};
pub use worker::{ConnectWorker, IterationOutcome, SendOutcome};
