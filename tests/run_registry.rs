use std::sync::Arc;

use tempfile::TempDir;

use prospector_rs::db::LeadDb;
use prospector_rs::models::{LeadSource, RunStatus};
use prospector_rs::runs::RunRegistry;

async fn registry() -> (TempDir, RunRegistry) {
    let dir = TempDir::new().expect("tempdir");
    let db = Arc::new(LeadDb::new(&dir.path().join("leads.db")).await.expect("open db"));
    (dir, RunRegistry::new(db))
}

#[tokio::test]
async fn begin_then_complete_records_a_done_run() {
    let (_dir, registry) = registry().await;

    let run_id = registry
        .begin(LeadSource::LinkedinSearch, "fintech, title:CTO")
        .await
        .expect("begin");

    let running = registry.get(run_id).await.expect("get").expect("record");
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.input, "fintech, title:CTO");
    assert!(running.finished_at.is_none());

    registry
        .complete(run_id, RunStatus::Done, 42, 7, None, &["/tmp/out.json".to_string()])
        .await
        .expect("complete");

    let done = registry.get(run_id).await.expect("get").expect("record");
    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.leads_found, 42);
    assert_eq!(done.leads_enriched, 7);
    assert_eq!(done.error, None);
    assert_eq!(done.output_paths, vec!["/tmp/out.json".to_string()]);
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn failed_runs_keep_their_error() {
    let (_dir, registry) = registry().await;

    let run_id = registry
        .begin(LeadSource::SalesNavigator, "vp sales")
        .await
        .expect("begin");
    registry
        .complete(run_id, RunStatus::Error, 0, 0, Some("session expired"), &[])
        .await
        .expect("complete");

    let record = registry.get(run_id).await.expect("get").expect("record");
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error.as_deref(), Some("session expired"));
}

#[tokio::test]
async fn completing_twice_is_rejected_and_leaves_history_intact() {
    let (_dir, registry) = registry().await;

    let run_id = registry
        .begin(LeadSource::LinkedinSearch, "query")
        .await
        .expect("begin");
    registry
        .complete(run_id, RunStatus::Done, 5, 0, None, &[])
        .await
        .expect("first completion");

    let err = registry
        .complete(run_id, RunStatus::Error, 0, 0, Some("late failure"), &[])
        .await
        .expect_err("second completion must be rejected");
    assert!(err.to_string().contains("not running"));

    let record = registry.get(run_id).await.expect("get").expect("record");
    assert_eq!(record.status, RunStatus::Done);
    assert_eq!(record.leads_found, 5);
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn completion_requires_a_terminal_status() {
    let (_dir, registry) = registry().await;

    let run_id = registry
        .begin(LeadSource::LinkedinSearch, "query")
        .await
        .expect("begin");
    let err = registry
        .complete(run_id, RunStatus::Running, 0, 0, None, &[])
        .await
        .expect_err("running is not terminal");
    assert!(err.to_string().contains("terminal"));
}

#[tokio::test]
async fn listing_is_ordered_by_recency_and_filterable() {
    let (_dir, registry) = registry().await;

    let first = registry
        .begin(LeadSource::LinkedinSearch, "one")
        .await
        .expect("begin");
    let second = registry
        .begin(LeadSource::CompanyEmployees, "two")
        .await
        .expect("begin");
    let third = registry
        .begin(LeadSource::SalesNavigator, "three")
        .await
        .expect("begin");

    registry
        .complete(first, RunStatus::Done, 1, 0, None, &[])
        .await
        .expect("complete");

    let all = registry.list(None, 50, 0).await.expect("list");
    let ids: Vec<i64> = all.iter().map(|run| run.id).collect();
    assert_eq!(ids, vec![third, second, first]);

    let running = registry
        .list(Some(RunStatus::Running), 50, 0)
        .await
        .expect("list running");
    assert_eq!(running.len(), 2);
    assert_eq!(registry.count(Some(RunStatus::Done)).await.expect("count"), 1);
    assert_eq!(registry.count(None).await.expect("count"), 3);
}
