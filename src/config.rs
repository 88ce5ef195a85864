use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pacing::PacingSettings;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    database_path: Option<String>,
    session_dir: Option<String>,
    browser_helper_cmd: Option<String>,
    browser_helper_args: Option<String>,
    #[serde(alias = "headless")]
    browser_headless: Option<bool>,
    browser_timeout_seconds: Option<u64>,
    lock_stale_seconds: Option<u64>,
    lock_acquire_timeout_seconds: Option<u64>,
    claim_stale_seconds: Option<u64>,
    connect_daily_limit: Option<u32>,
    connect_min_delay_seconds: Option<f64>,
    connect_max_delay_seconds: Option<f64>,
    connect_business_hours_only: Option<bool>,
    connect_biz_start_hour: Option<u32>,
    connect_biz_end_hour: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RootConfig {
    #[serde(default, flatten)]
    top: FileConfig,
    prospector: Option<FileConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub session_dir: String,
    pub browser_helper_cmd: String,
    pub browser_helper_args: String,
    pub browser_headless: bool,
    pub browser_timeout_seconds: u64,
    pub lock_stale_seconds: u64,
    pub lock_acquire_timeout_seconds: u64,
    pub claim_stale_seconds: u64,
    pub connect_daily_limit: u32,
    pub connect_min_delay_seconds: f64,
    pub connect_max_delay_seconds: f64,
    pub connect_business_hours_only: bool,
    pub connect_biz_start_hour: u32,
    pub connect_biz_end_hour: u32,
    pub config_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            database_path: "./prospector-data/leads.db".to_string(),
            session_dir: "./prospector-data/session".to_string(),
            browser_helper_cmd: "prospector-helper".to_string(),
            browser_helper_args: String::new(),
            browser_headless: true,
            browser_timeout_seconds: 120,
            lock_stale_seconds: 600,
            lock_acquire_timeout_seconds: 30,
            claim_stale_seconds: 900,
            connect_daily_limit: 10,
            connect_min_delay_seconds: 90.0,
            connect_max_delay_seconds: 300.0,
            connect_business_hours_only: false,
            connect_biz_start_hour: 9,
            connect_biz_end_hour: 17,
            config_path: PathBuf::from("config.toml"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        let config_path = find_config_file().unwrap_or_else(|| config_search_paths()[0].clone());
        cfg.config_path = config_path.clone();

        let root = load_root_config(&config_path).unwrap_or_default();
        let RootConfig { top, prospector } = root;

        cfg.apply_file(top);
        if let Some(section) = prospector {
            cfg.apply_file(section);
        }

        cfg.apply_env();
        cfg
    }

    fn apply_file(&mut self, file_cfg: FileConfig) {
        set_opt(&mut self.bind_addr, file_cfg.bind_addr);
        set_opt(&mut self.database_path, file_cfg.database_path);
        set_opt(&mut self.session_dir, file_cfg.session_dir);
        set_opt(&mut self.browser_helper_cmd, file_cfg.browser_helper_cmd);
        set_opt(&mut self.browser_helper_args, file_cfg.browser_helper_args);
        set_opt(&mut self.browser_headless, file_cfg.browser_headless);
        set_opt_u64_min(
            &mut self.browser_timeout_seconds,
            file_cfg.browser_timeout_seconds,
            10,
        );
        set_opt_u64_min(&mut self.lock_stale_seconds, file_cfg.lock_stale_seconds, 30);
        set_opt_u64_min(
            &mut self.lock_acquire_timeout_seconds,
            file_cfg.lock_acquire_timeout_seconds,
            1,
        );
        set_opt_u64_min(&mut self.claim_stale_seconds, file_cfg.claim_stale_seconds, 60);
        set_opt(&mut self.connect_daily_limit, file_cfg.connect_daily_limit);
        set_opt_f64_min(
            &mut self.connect_min_delay_seconds,
            file_cfg.connect_min_delay_seconds,
            0.0,
        );
        set_opt_f64_min(
            &mut self.connect_max_delay_seconds,
            file_cfg.connect_max_delay_seconds,
            0.0,
        );
        set_opt(
            &mut self.connect_business_hours_only,
            file_cfg.connect_business_hours_only,
        );
        set_opt_hour(&mut self.connect_biz_start_hour, file_cfg.connect_biz_start_hour);
        set_opt_hour(&mut self.connect_biz_end_hour, file_cfg.connect_biz_end_hour);
    }

    fn apply_env(&mut self) {
        let env_cfg = FileConfig {
            bind_addr: env_string("PROSPECTOR_RS_BIND_ADDR"),
            database_path: env_string("PROSPECTOR_RS_DATABASE_PATH"),
            session_dir: env_string("PROSPECTOR_RS_SESSION_DIR"),
            browser_helper_cmd: env_string("PROSPECTOR_RS_BROWSER_HELPER_CMD"),
            browser_helper_args: env_string("PROSPECTOR_RS_BROWSER_HELPER_ARGS"),
            browser_headless: env_parse("PROSPECTOR_RS_BROWSER_HEADLESS"),
            browser_timeout_seconds: env_parse("PROSPECTOR_RS_BROWSER_TIMEOUT_SECONDS"),
            lock_stale_seconds: env_parse("PROSPECTOR_RS_LOCK_STALE_SECONDS"),
            lock_acquire_timeout_seconds: env_parse("PROSPECTOR_RS_LOCK_ACQUIRE_TIMEOUT_SECONDS"),
            claim_stale_seconds: env_parse("PROSPECTOR_RS_CLAIM_STALE_SECONDS"),
            connect_daily_limit: env_parse("PROSPECTOR_RS_CONNECT_DAILY_LIMIT"),
            connect_min_delay_seconds: env_parse("PROSPECTOR_RS_CONNECT_MIN_DELAY_SECONDS"),
            connect_max_delay_seconds: env_parse("PROSPECTOR_RS_CONNECT_MAX_DELAY_SECONDS"),
            connect_business_hours_only: env_parse("PROSPECTOR_RS_CONNECT_BUSINESS_HOURS_ONLY"),
            connect_biz_start_hour: env_parse("PROSPECTOR_RS_CONNECT_BIZ_START_HOUR"),
            connect_biz_end_hour: env_parse("PROSPECTOR_RS_CONNECT_BIZ_END_HOUR"),
        };
        self.apply_file(env_cfg);
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }

    pub fn session_dir(&self) -> PathBuf {
        PathBuf::from(&self.session_dir)
    }

    pub fn helper_args(&self) -> Vec<String> {
        self.browser_helper_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Fallback pacing bounds used when nothing is stored yet.
    pub fn pacing_defaults(&self) -> PacingSettings {
        PacingSettings {
            daily_limit: self.connect_daily_limit,
            min_delay_seconds: self.connect_min_delay_seconds,
            max_delay_seconds: self.connect_max_delay_seconds,
            business_hours_only: self.connect_business_hours_only,
            biz_start_hour: self.connect_biz_start_hour,
            biz_end_hour: self.connect_biz_end_hour,
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.toml"), PathBuf::from("prospector.toml")];
    if let Some(home) = dirs_home() {
        paths.push(home.join(".config").join("prospector").join("config.toml"));
    }
    paths
}

pub fn find_config_file() -> Option<PathBuf> {
    config_search_paths().into_iter().find(|path| path.exists())
}

fn load_root_config(path: &Path) -> Result<RootConfig> {
    if !path.exists() {
        return Ok(RootConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {path:?}"))?;
    toml::from_str::<RootConfig>(&raw).context("failed parsing config as root structure")
}

fn dirs_home() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn set_opt<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

fn set_opt_u64_min(dst: &mut u64, value: Option<u64>, min: u64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_f64_min(dst: &mut f64, value: Option<f64>, min: f64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_hour(dst: &mut u32, value: Option<u32>) {
    if let Some(v) = value {
        *dst = v.min(23);
    }
}
