use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AppConfig;

/// Login-session health as reported by the automation helper.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Expired,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

/// What the profile page says about our relationship with the lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipState {
    /// Invite already pending, or already connected. Nothing to send.
    PendingOrConnected,
    /// A connect action should exist.
    Connectable,
}

/// Browser-automation primitives the connect worker drives, one visit
/// at a time. Implementations own the actual browser; the worker owns
/// the flow and its outcome interpretation.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open the profile page, starting a visit. Any previous visit is
    /// discarded.
    async fn open_profile(&self, url: &str) -> Result<()>;

    async fn relationship_state(&self) -> Result<RelationshipState>;

    /// Locate a connect action, checking the primary placement first
    /// and the overflow menu as fallback. `false` means no action
    /// anywhere on the page.
    async fn locate_connect_action(&self) -> Result<bool>;

    async fn open_invite(&self) -> Result<()>;

    async fn submit_invite(&self, note: Option<&str>) -> Result<()>;

    /// Check post-submit page state for evidence the invite went out.
    async fn verify_sent(&self) -> Result<bool>;

    /// Tear down the current visit. Always called after a flow, even a
    /// failed one.
    async fn close_visit(&self) -> Result<()>;

    async fn session_status(&self) -> Result<SessionStatus>;
}

/// Drives the browser through an external helper process speaking
/// JSON lines over stdio. One helper process per profile visit; each
/// primitive is a request/response pair with a bounded wait.
pub struct HelperDriver {
    cmd: String,
    base_args: Vec<String>,
    session_dir: PathBuf,
    headless: bool,
    op_timeout: Duration,
    visit: Mutex<Option<VisitProcess>>,
}

struct VisitProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl HelperDriver {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cmd: config.browser_helper_cmd.clone(),
            base_args: config.helper_args(),
            session_dir: config.session_dir(),
            headless: config.browser_headless,
            op_timeout: Duration::from_secs(config.browser_timeout_seconds),
            visit: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.base_args);
        cmd
    }

    async fn spawn_visit(&self, url: &str) -> Result<VisitProcess> {
        let mut cmd = self.command();
        cmd.arg("visit")
            .arg("--profile-dir")
            .arg(&self.session_dir)
            .arg("--url")
            .arg(url);
        if self.headless {
            cmd.arg("--headless");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed spawning browser helper '{}'", self.cmd))?;

        let stdin = child.stdin.take().context("helper stdin unavailable")?;
        let stdout = child.stdout.take().context("helper stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = "browser-helper", "{line}");
                }
            });
        }

        let mut visit = VisitProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        // The helper reports once the page is loaded.
        let ready = self.read_response(&mut visit).await?;
        if ready.get("event").and_then(Value::as_str) != Some("ready") {
            bail!("helper did not report ready, got: {ready}");
        }
        Ok(visit)
    }

    async fn read_response(&self, visit: &mut VisitProcess) -> Result<Value> {
        let line = tokio::time::timeout(self.op_timeout, visit.stdout.next_line())
            .await
            .map_err(|_| anyhow!("browser helper timed out after {:?}", self.op_timeout))?
            .context("failed reading from browser helper")?
            .ok_or_else(|| anyhow!("browser helper closed its output"))?;

        let value: Value = serde_json::from_str(line.trim())
            .with_context(|| format!("unparseable helper response: {line}"))?;

        if value.get("ok").and_then(Value::as_bool) == Some(false) {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("helper reported failure");
            bail!("{message}");
        }
        Ok(value)
    }

    async fn request(&self, payload: Value) -> Result<Value> {
        let mut slot = self.visit.lock().await;
        let visit = slot
            .as_mut()
            .ok_or_else(|| anyhow!("no browser visit in progress"))?;

        let mut line = payload.to_string();
        line.push('\n');
        visit
            .stdin
            .write_all(line.as_bytes())
            .await
            .context("failed writing to browser helper")?;

        self.read_response(visit).await
    }
}

#[async_trait]
impl BrowserDriver for HelperDriver {
    async fn open_profile(&self, url: &str) -> Result<()> {
        let mut slot = self.visit.lock().await;
        if let Some(mut stale) = slot.take() {
            warn!("discarding unfinished browser visit");
            let _ = stale.child.start_kill();
        }
        *slot = Some(self.spawn_visit(url).await?);
        Ok(())
    }

    async fn relationship_state(&self) -> Result<RelationshipState> {
        let resp = self.request(json!({"op": "relationship-state"})).await?;
        match resp.get("state").and_then(Value::as_str) {
            Some("pending_or_connected") => Ok(RelationshipState::PendingOrConnected),
            Some("connectable") => Ok(RelationshipState::Connectable),
            other => bail!("unexpected relationship state: {other:?}"),
        }
    }

    async fn locate_connect_action(&self) -> Result<bool> {
        let resp = self.request(json!({"op": "locate-connect"})).await?;
        Ok(resp.get("found").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn open_invite(&self) -> Result<()> {
        self.request(json!({"op": "open-invite"})).await?;
        Ok(())
    }

    async fn submit_invite(&self, note: Option<&str>) -> Result<()> {
        self.request(json!({"op": "submit-invite", "note": note})).await?;
        Ok(())
    }

    async fn verify_sent(&self) -> Result<bool> {
        let resp = self.request(json!({"op": "verify-sent"})).await?;
        Ok(resp.get("sent").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn close_visit(&self) -> Result<()> {
        let mut slot = self.visit.lock().await;
        let Some(mut visit) = slot.take() else {
            return Ok(());
        };

        let mut line = json!({"op": "close"}).to_string();
        line.push('\n');
        let _ = visit.stdin.write_all(line.as_bytes()).await;

        match tokio::time::timeout(Duration::from_secs(10), visit.child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                debug!("browser helper exited with {status}");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("failed waiting for browser helper: {err:#}"),
            Err(_) => {
                warn!("browser helper did not exit; killing it");
                let _ = visit.child.start_kill();
            }
        }
        Ok(())
    }

    async fn session_status(&self) -> Result<SessionStatus> {
        let mut cmd = self.command();
        cmd.arg("session-status")
            .arg("--profile-dir")
            .arg(&self.session_dir);
        if self.headless {
            cmd.arg("--headless");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.op_timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("session check timed out after {:?}", self.op_timeout))?
            .context("failed running session check")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let status = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .and_then(|value| {
                value
                    .get("status")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        Ok(match status.as_deref() {
            Some("connected") => SessionStatus::Connected,
            Some("expired") => SessionStatus::Expired,
            _ => SessionStatus::Unknown,
        })
    }
}
