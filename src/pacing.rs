use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounds governing how fast the connect worker may act. Stored as a
/// JSON blob in `app_settings` and merged over configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacingSettings {
    pub daily_limit: u32,
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub business_hours_only: bool,
    pub biz_start_hour: u32,
    pub biz_end_hour: u32,
}

/// Partial update from the settings API; absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PacingUpdate {
    pub daily_limit: Option<u32>,
    pub min_delay_seconds: Option<f64>,
    pub max_delay_seconds: Option<f64>,
    pub business_hours_only: Option<bool>,
    pub biz_start_hour: Option<u32>,
    pub biz_end_hour: Option<u32>,
}

impl PacingSettings {
    /// Clamp to sane bounds. Applied to every API-submitted update so a
    /// stored blob is always usable.
    pub fn normalized(mut self) -> Self {
        self.daily_limit = self.daily_limit.max(1);
        self.min_delay_seconds = self.min_delay_seconds.max(5.0);
        self.max_delay_seconds = self.max_delay_seconds.max(self.min_delay_seconds);
        self.biz_start_hour = self.biz_start_hour.min(23);
        self.biz_end_hour = self.biz_end_hour.min(23);
        self
    }

    /// Strict check used at worker start. Configured values are not
    /// clamped silently there; a nonsensical configuration refuses to
    /// run.
    pub fn validate(&self) -> Result<(), String> {
        if self.daily_limit == 0 {
            return Err("daily_limit must be at least 1".to_string());
        }
        if !self.min_delay_seconds.is_finite() || self.min_delay_seconds < 0.0 {
            return Err("min_delay_seconds must be a non-negative number".to_string());
        }
        if !self.max_delay_seconds.is_finite() || self.max_delay_seconds < self.min_delay_seconds {
            return Err("max_delay_seconds must be >= min_delay_seconds".to_string());
        }
        if self.biz_start_hour > 23 || self.biz_end_hour > 23 {
            return Err("business hours must fall within 0-23".to_string());
        }
        Ok(())
    }

    pub fn apply(mut self, update: PacingUpdate) -> Self {
        if let Some(v) = update.daily_limit {
            self.daily_limit = v;
        }
        if let Some(v) = update.min_delay_seconds {
            self.min_delay_seconds = v;
        }
        if let Some(v) = update.max_delay_seconds {
            self.max_delay_seconds = v;
        }
        if let Some(v) = update.business_hours_only {
            self.business_hours_only = v;
        }
        if let Some(v) = update.biz_start_hour {
            self.biz_start_hour = v;
        }
        if let Some(v) = update.biz_end_hour {
            self.biz_end_hour = v;
        }
        self
    }

    /// Parse a stored settings blob, falling back to `defaults` when the
    /// blob is missing or unreadable.
    pub fn from_stored(stored: Option<serde_json::Value>, defaults: &PacingSettings) -> Self {
        stored
            .and_then(|value| serde_json::from_value::<PacingSettings>(value).ok())
            .unwrap_or_else(|| defaults.clone())
            .normalized()
    }
}

/// Why the worker may not act right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingGate {
    DailyLimitReached { sent: i64, limit: u32 },
    OutsideBusinessHours { start: u32, end: u32 },
}

pub struct PacingPolicy;

impl PacingPolicy {
    /// Decide whether a send is currently permitted. `None` means clear
    /// to proceed.
    pub fn gate(settings: &PacingSettings, sends_today: i64, local_hour: u32) -> Option<PacingGate> {
        if settings.business_hours_only && !Self::in_business_hours(settings, local_hour) {
            return Some(PacingGate::OutsideBusinessHours {
                start: settings.biz_start_hour,
                end: settings.biz_end_hour,
            });
        }
        if sends_today >= i64::from(settings.daily_limit) {
            return Some(PacingGate::DailyLimitReached {
                sent: sends_today,
                limit: settings.daily_limit,
            });
        }
        None
    }

    /// Half-open window `[start, end)`. A start past the end wraps
    /// around midnight, e.g. 22 -> 6.
    pub fn in_business_hours(settings: &PacingSettings, hour: u32) -> bool {
        let (start, end) = (settings.biz_start_hour, settings.biz_end_hour);
        if start <= end {
            start <= hour && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Randomized wait applied after every attempt, success or not.
    /// Fixed intervals are a detection signature; the spread is the
    /// point.
    pub fn jitter_delay(settings: &PacingSettings) -> Duration {
        let min = settings.min_delay_seconds.max(0.0);
        let max = settings.max_delay_seconds.max(min);
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }
}

/// UTC instant at which the given local calendar day starts. Falls back
/// across DST gaps where local midnight does not exist.
pub fn local_midnight_utc(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// UTC range covering the local calendar day, for filtering `sent_at`.
pub fn local_day_utc_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = day.checked_add_days(Days::new(1)).unwrap_or(day);
    (local_midnight_utc(day), local_midnight_utc(next))
}
