use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::AppConfig;
use crate::models::{Lead, LeadSource};

#[derive(Debug, Clone, Copy)]
pub struct SpiderProgress {
    pub found: u64,
    pub page: u32,
}

/// Lead extraction collaborator. Page navigation, pagination, and DOM
/// parsing all live behind this seam; the run coordinator only sees
/// progress ticks and the final batch.
#[async_trait]
pub trait LeadSpider: Send + Sync {
    async fn collect(
        &self,
        source: LeadSource,
        input: String,
        max_pages: u32,
        progress: mpsc::UnboundedSender<SpiderProgress>,
    ) -> Result<Vec<Lead>>;
}

/// Collects leads by running the external helper's `collect` mode and
/// consuming its JSON-lines output: progress ticks while paging, one
/// line per extracted lead.
pub struct HelperSpider {
    cmd: String,
    base_args: Vec<String>,
    session_dir: PathBuf,
    headless: bool,
    idle_timeout: Duration,
}

impl HelperSpider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cmd: config.browser_helper_cmd.clone(),
            base_args: config.helper_args(),
            session_dir: config.session_dir(),
            headless: config.browser_headless,
            idle_timeout: Duration::from_secs(config.browser_timeout_seconds),
        }
    }
}

#[async_trait]
impl LeadSpider for HelperSpider {
    async fn collect(
        &self,
        source: LeadSource,
        input: String,
        max_pages: u32,
        progress: mpsc::UnboundedSender<SpiderProgress>,
    ) -> Result<Vec<Lead>> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.base_args)
            .arg("collect")
            .arg("--profile-dir")
            .arg(&self.session_dir)
            .arg("--source")
            .arg(source.as_str())
            .arg("--input")
            .arg(&input)
            .arg("--max-pages")
            .arg(max_pages.to_string());
        if self.headless {
            cmd.arg("--headless");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed spawning browser helper '{}'", self.cmd))?;

        let stdout = child.stdout.take().context("helper stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = "browser-helper", "{line}");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut leads = Vec::new();

        loop {
            let line = match tokio::time::timeout(self.idle_timeout, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    let _ = child.start_kill();
                    return Err(err).context("failed reading from browser helper");
                }
                Err(_) => {
                    let _ = child.start_kill();
                    bail!("browser helper went silent for {:?}", self.idle_timeout);
                }
            };

            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                debug!(source = "browser-helper", "{line}");
                continue;
            };

            match value.get("type").and_then(Value::as_str) {
                Some("progress") => {
                    let _ = progress.send(SpiderProgress {
                        found: value.get("found").and_then(Value::as_u64).unwrap_or(0),
                        page: value.get("page").and_then(Value::as_u64).unwrap_or(0) as u32,
                    });
                }
                Some("lead") => {
                    let Some(name) = value.get("full_name").and_then(Value::as_str) else {
                        continue;
                    };
                    leads.push(Lead::new(
                        value.get("linkedin_url").and_then(Value::as_str),
                        name,
                        value.get("headline").and_then(Value::as_str),
                        source,
                    ));
                }
                Some("error") => {
                    let message = value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("helper reported failure");
                    let _ = child.start_kill();
                    bail!("{message}");
                }
                _ => debug!(source = "browser-helper", "{line}"),
            }
        }

        let status = child.wait().await.context("failed waiting for helper")?;
        if !status.success() {
            bail!("browser helper exited with {status}");
        }

        Ok(leads)
    }
}
