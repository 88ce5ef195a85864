use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::{
    ConnectStatus, EnqueueOutcome, Lead, LeadRow, LeadSource, QueueItem, QueueStats, RunRecord,
    RunStatus,
};
use crate::pacing::local_day_utc_bounds;

const PACING_SETTINGS_KEY: &str = "connect_settings";
const WORKER_INTERRUPTED_ERROR: &str = "worker interrupted";

#[derive(Clone)]
pub struct LeadDb {
    pool: SqlitePool,
}

impl LeadDb {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating database directory {parent:?}"))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .context("failed to connect to sqlite")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dedup_key TEXT UNIQUE NOT NULL,
                linkedin_url TEXT,
                full_name TEXT NOT NULL,
                headline TEXT,
                source TEXT NOT NULL,
                scraped_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating leads table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connect_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                linkedin_url TEXT NOT NULL UNIQUE,
                full_name TEXT NOT NULL,
                note TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                claimed_at TEXT,
                sent_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating connect_queue table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scrape_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                leads_found INTEGER NOT NULL DEFAULT 0,
                leads_enriched INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                output_paths_json TEXT NOT NULL DEFAULT '[]',
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating scrape_runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating app_settings table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_leads_scraped ON leads(scraped_at DESC)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_leads_scraped")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_connect_status ON connect_queue(status)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_connect_status")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_connect_sent_at ON connect_queue(sent_at)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_connect_sent_at")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON scrape_runs(status)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_runs_status")?;

        Ok(())
    }

    // ── Leads ────────────────────────────────────────────────────────

    pub async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leads (dedup_key, linkedin_url, full_name, headline, source, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO UPDATE SET
                headline = COALESCE(excluded.headline, leads.headline),
                scraped_at = excluded.scraped_at
            "#,
        )
        .bind(lead.dedup_key())
        .bind(lead.linkedin_url.clone())
        .bind(&lead.full_name)
        .bind(lead.headline.clone())
        .bind(lead.source.as_str())
        .bind(lead.scraped_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed upserting lead")?;
        Ok(())
    }

    pub async fn upsert_leads(&self, leads: &[Lead]) -> Result<u64> {
        let mut count = 0;
        for lead in leads {
            self.upsert_lead(lead).await?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn get_lead(&self, lead_id: i64) -> Result<Option<LeadRow>> {
        let row = sqlx::query("SELECT * FROM leads WHERE id = ?")
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading lead")?;
        row.map(row_to_lead).transpose()
    }

    pub async fn list_leads(&self, limit: i64, offset: i64) -> Result<Vec<LeadRow>> {
        let rows = sqlx::query("SELECT * FROM leads ORDER BY scraped_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("failed listing leads")?;
        rows.into_iter().map(row_to_lead).collect()
    }

    pub async fn count_leads(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM leads")
            .fetch_one(&self.pool)
            .await
            .context("failed counting leads")?;
        row.try_get::<i64, _>("count").context("missing count column")
    }

    // ── Connect queue ────────────────────────────────────────────────

    /// Queue connect requests for the given leads. A URL already queued
    /// as `pending`, `in_progress`, or `sent` is a no-op; a `failed` row
    /// is reset to `pending` with its error cleared, which is the sole
    /// retry path.
    pub async fn enqueue_connects(
        &self,
        lead_ids: &[i64],
        note: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now().to_rfc3339();
        let mut outcome = EnqueueOutcome::default();

        for &lead_id in lead_ids {
            let Some(lead) = self.get_lead(lead_id).await? else {
                continue;
            };
            let Some(url) = lead.linkedin_url else {
                continue;
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO connect_queue (lead_id, linkedin_url, full_name, note, status, created_at)
                VALUES (?, ?, ?, ?, 'pending', ?)
                ON CONFLICT(linkedin_url) DO NOTHING
                "#,
            )
            .bind(lead_id)
            .bind(&url)
            .bind(&lead.full_name)
            .bind(note)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("failed inserting queue item")?
            .rows_affected();

            if inserted == 1 {
                outcome.inserted += 1;
                continue;
            }

            // Duplicate URL. Only a failed row may be revived; the
            // status guard keeps a concurrent state change from being
            // clobbered.
            let retried = sqlx::query(
                r#"
                UPDATE connect_queue
                SET lead_id = ?, full_name = ?, note = ?, status = 'pending',
                    claimed_at = NULL, sent_at = NULL, error = NULL, created_at = ?
                WHERE linkedin_url = ? AND status = 'failed'
                "#,
            )
            .bind(lead_id)
            .bind(&lead.full_name)
            .bind(note)
            .bind(&now)
            .bind(&url)
            .execute(&self.pool)
            .await
            .context("failed reviving failed queue item")?
            .rows_affected();

            if retried == 1 {
                outcome.retried += 1;
            }
        }

        Ok(outcome)
    }

    /// Claim the oldest pending item for exclusive processing. The
    /// transition to `in_progress` is a conditional update so two
    /// concurrent claimants can never take the same row; stale claims
    /// left by an interrupted worker are swept first.
    pub async fn claim_next_pending(&self, claim_stale: Duration) -> Result<Option<QueueItem>> {
        self.expire_stale_claims(claim_stale).await?;

        loop {
            let Some(row) = sqlx::query(
                "SELECT id FROM connect_queue WHERE status = 'pending' ORDER BY id LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await
            .context("failed selecting next pending item")?
            else {
                return Ok(None);
            };
            let id = row.try_get::<i64, _>("id").context("missing queue id")?;

            let claimed = sqlx::query(
                "UPDATE connect_queue SET status = 'in_progress', claimed_at = ? WHERE id = ? AND status = 'pending'",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed claiming queue item")?
            .rows_affected();

            if claimed == 1 {
                return self.get_queue_item(id).await;
            }
            // Lost the race for this row; try the next oldest.
        }
    }

    /// Return a claimed item to `pending` untouched, e.g. when the
    /// browser lock could not be acquired in time.
    pub async fn release_claim(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE connect_queue SET status = 'pending', claimed_at = NULL WHERE id = ? AND status = 'in_progress'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed releasing claim")?;
        Ok(())
    }

    /// Convert claims older than the staleness window into `failed`
    /// rows with a distinguishing error, making an interrupted worker's
    /// half-done items visible and manually retryable.
    pub async fn expire_stale_claims(&self, claim_stale: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(claim_stale).unwrap_or(chrono::Duration::zero());
        let result = sqlx::query(
            r#"
            UPDATE connect_queue
            SET status = 'failed', error = ?, claimed_at = NULL
            WHERE status = 'in_progress' AND claimed_at IS NOT NULL AND claimed_at < ?
            "#,
        )
        .bind(WORKER_INTERRUPTED_ERROR)
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed expiring stale claims")?;
        Ok(result.rows_affected())
    }

    pub async fn mark_sent(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE connect_queue SET status = 'sent', sent_at = ?, claimed_at = NULL WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed marking item sent")?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE connect_queue SET status = 'failed', error = ?, sent_at = NULL, claimed_at = NULL WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed marking item failed")?;
        Ok(())
    }

    pub async fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>> {
        let row = sqlx::query("SELECT * FROM connect_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading queue item")?;
        row.map(row_to_queue_item).transpose()
    }

    pub async fn list_queue(
        &self,
        status: Option<ConnectStatus>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT * FROM connect_queue WHERE status = ? ORDER BY id LIMIT ?")
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("failed listing queue by status")?
        } else {
            sqlx::query("SELECT * FROM connect_queue ORDER BY id LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("failed listing queue")?
        };
        rows.into_iter().map(row_to_queue_item).collect()
    }

    /// Pending/sent/failed counts. An in-flight claim still counts as
    /// pending: it is not terminal and will resolve one way or the
    /// other.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status IN ('pending', 'in_progress') THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END) AS sent,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
            FROM connect_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed computing queue stats")?;

        Ok(QueueStats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            sent: row.try_get::<Option<i64>, _>("sent")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }

    /// Count of sends whose `sent_at` falls within the given local
    /// calendar day. Computed from timestamps at query time, never from
    /// a counter that could drift across restarts or midnight.
    pub async fn sent_count_for_local_day(&self, day: NaiveDate) -> Result<i64> {
        let (start, end) = local_day_utc_bounds(day);
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM connect_queue WHERE status = 'sent' AND sent_at >= ? AND sent_at < ?",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("failed counting sends for day")?;
        row.try_get::<i64, _>("count").context("missing count column")
    }

    // ── Scrape runs ──────────────────────────────────────────────────

    pub async fn create_run(&self, source: LeadSource, input: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scrape_runs (source, input, status, started_at) VALUES (?, ?, 'running', ?)",
        )
        .bind(source.as_str())
        .bind(input)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed creating run")?;
        Ok(result.last_insert_rowid())
    }

    /// Exactly-once terminal transition. A second completion attempt is
    /// an error, not a silent overwrite, so run history stays auditable.
    pub async fn complete_run(
        &self,
        run_id: i64,
        status: RunStatus,
        leads_found: i64,
        leads_enriched: i64,
        error: Option<&str>,
        output_paths: &[String],
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("run {run_id} completion requires a terminal status, got {}", status.as_str());
        }

        let paths_json = serde_json::to_string(output_paths).unwrap_or_else(|_| "[]".to_string());
        let updated = sqlx::query(
            r#"
            UPDATE scrape_runs
            SET status = ?, leads_found = ?, leads_enriched = ?, error = ?,
                output_paths_json = ?, finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(leads_found)
        .bind(leads_enriched)
        .bind(error)
        .bind(paths_json)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("failed completing run")?
        .rows_affected();

        if updated == 0 {
            bail!("run {run_id} is not running; completion ignored");
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM scrape_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading run")?;
        row.map(row_to_run).transpose()
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT * FROM scrape_runs WHERE status = ? ORDER BY id DESC LIMIT ? OFFSET ?")
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .context("failed listing runs by status")?
        } else {
            sqlx::query("SELECT * FROM scrape_runs ORDER BY id DESC LIMIT ? OFFSET ?")
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .context("failed listing runs")?
        };
        rows.into_iter().map(row_to_run).collect()
    }

    pub async fn count_runs(&self, status: Option<RunStatus>) -> Result<i64> {
        let row = if let Some(status) = status {
            sqlx::query("SELECT COUNT(*) AS count FROM scrape_runs WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .context("failed counting runs by status")?
        } else {
            sqlx::query("SELECT COUNT(*) AS count FROM scrape_runs")
                .fetch_one(&self.pool)
                .await
                .context("failed counting runs")?
        };
        row.try_get::<i64, _>("count").context("missing count column")
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub async fn get_pacing_settings_raw(&self) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM app_settings WHERE key = ?")
            .bind(PACING_SETTINGS_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading pacing settings")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw = row.try_get::<String, _>("value").context("missing value column")?;
        Ok(serde_json::from_str(&raw).ok())
    }

    pub async fn save_pacing_settings(&self, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(PACING_SETTINGS_KEY)
        .bind(value.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed saving pacing settings")?;
        Ok(())
    }
}

fn row_to_lead(row: sqlx::sqlite::SqliteRow) -> Result<LeadRow> {
    Ok(LeadRow {
        id: row.try_get("id")?,
        linkedin_url: row.try_get("linkedin_url")?,
        full_name: row.try_get("full_name")?,
        headline: row.try_get("headline")?,
        source: parse_enum::<LeadSource>(row.try_get("source")?, "lead source")?,
        scraped_at: parse_timestamp(row.try_get("scraped_at")?)?,
    })
}

fn row_to_queue_item(row: sqlx::sqlite::SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        linkedin_url: row.try_get("linkedin_url")?,
        full_name: row.try_get("full_name")?,
        note: row.try_get("note")?,
        status: parse_enum::<ConnectStatus>(row.try_get("status")?, "queue status")?,
        claimed_at: parse_opt_timestamp(row.try_get("claimed_at")?)?,
        sent_at: parse_opt_timestamp(row.try_get("sent_at")?)?,
        error: row.try_get("error")?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
    })
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> Result<RunRecord> {
    let paths_raw: String = row.try_get("output_paths_json")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        source: parse_enum::<LeadSource>(row.try_get("source")?, "run source")?,
        input: row.try_get("input")?,
        status: parse_enum::<RunStatus>(row.try_get("status")?, "run status")?,
        leads_found: row.try_get("leads_found")?,
        leads_enriched: row.try_get("leads_enriched")?,
        error: row.try_get("error")?,
        output_paths: serde_json::from_str(&paths_raw).unwrap_or_default(),
        started_at: parse_timestamp(row.try_get("started_at")?)?,
        finished_at: parse_opt_timestamp(row.try_get("finished_at")?)?,
    })
}

fn parse_enum<T>(raw: String, what: &str) -> Result<T>
where
    T: FromStr,
{
    raw.parse::<T>()
        .map_err(|_| anyhow::anyhow!("unrecognized {what}: {raw}"))
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {raw}"))
}

fn parse_opt_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}
