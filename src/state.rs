use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::db::LeadDb;
use crate::driver::BrowserDriver;
use crate::events::ServerEvent;
use crate::lock::BrowserLock;
use crate::runs::{ActiveSearchGuard, RunRegistry};
use crate::spider::LeadSpider;
use crate::worker::ConnectWorker;

/// Everything the API handlers share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<LeadDb>,
    pub lock: Arc<BrowserLock>,
    pub driver: Arc<dyn BrowserDriver>,
    pub spider: Arc<dyn LeadSpider>,
    pub worker: Arc<ConnectWorker>,
    pub registry: RunRegistry,
    pub active_search: Arc<ActiveSearchGuard>,
    pub events: broadcast::Sender<ServerEvent>,
}
