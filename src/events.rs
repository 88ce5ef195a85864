use serde_json::{Value, json};

use crate::models::{QueueStats, RunRecord, WorkerState};
use crate::runs::SearchProgress;

/// Server-push payloads for dashboards, so clients can subscribe to
/// worker/run progress instead of polling.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Worker(WorkerState),
    Queue(QueueStats),
    Run(RunRecord),
    SearchProgress(SearchProgress),
}

impl ServerEvent {
    pub fn as_json_value(&self) -> Value {
        match self {
            Self::Worker(state) => json!({
                "type": "worker",
                "running": state.running,
                "paused": state.paused,
                "last_sent": state.last_sent,
                "sends_today": state.sends_today,
                "daily_limit": state.daily_limit,
                "pending": state.pending,
                "sent": state.sent,
                "failed": state.failed,
            }),
            Self::Queue(stats) => json!({
                "type": "queue",
                "pending": stats.pending,
                "sent": stats.sent,
                "failed": stats.failed,
            }),
            Self::Run(run) => json!({
                "type": "run",
                "run_id": run.id,
                "source": run.source,
                "status": run.status,
                "leads_found": run.leads_found,
                "error": run.error,
                "finished_at": run.finished_at,
            }),
            Self::SearchProgress(progress) => json!({
                "type": "search_progress",
                "run_id": progress.run_id,
                "found": progress.found,
                "page": progress.page,
                "done": progress.done,
                "error": progress.error,
            }),
        }
    }
}
