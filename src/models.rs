use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Pending,
    InProgress,
    Sent,
    Failed,
}

impl ConnectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl FromStr for ConnectStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl FromStr for RunStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => return Err(()),
        })
    }
}

/// Where a batch of leads came from. Doubles as the `source` of the
/// extraction run that produced them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    LinkedinSearch,
    SalesNavigator,
    CompanyEmployees,
}

impl LeadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkedinSearch => "linkedin_search",
            Self::SalesNavigator => "sales_navigator",
            Self::CompanyEmployees => "company_employees",
        }
    }

    /// Classify a pasted LinkedIn URL by its path.
    pub fn from_url(url: &str) -> Self {
        if url.contains("/sales/") {
            Self::SalesNavigator
        } else if url.contains("/company/") {
            Self::CompanyEmployees
        } else {
            Self::LinkedinSearch
        }
    }
}

impl FromStr for LeadSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "linkedin_search" => Self::LinkedinSearch,
            "sales_navigator" => Self::SalesNavigator,
            "company_employees" => Self::CompanyEmployees,
            _ => return Err(()),
        })
    }
}

/// Minimal lead identity as the scheduler needs it. Full profile
/// attributes live with the enrichment collaborator, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub linkedin_url: Option<String>,
    pub full_name: String,
    pub headline: Option<String>,
    pub source: LeadSource,
    pub scraped_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        linkedin_url: Option<&str>,
        full_name: impl Into<String>,
        headline: Option<&str>,
        source: LeadSource,
    ) -> Self {
        Self {
            linkedin_url: linkedin_url.and_then(normalize_linkedin_url),
            full_name: full_name.into(),
            headline: headline.map(str::to_string),
            source,
            scraped_at: Utc::now(),
        }
    }

    /// Stable identity for upserts: the normalized profile URL when we
    /// have one, otherwise the bare name.
    pub fn dedup_key(&self) -> String {
        match &self.linkedin_url {
            Some(url) => url.clone(),
            None => format!("{}|", self.full_name),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadRow {
    pub id: i64,
    pub linkedin_url: Option<String>,
    pub full_name: String,
    pub headline: Option<String>,
    pub source: LeadSource,
    pub scraped_at: DateTime<Utc>,
}

/// One connect-request task. Never deleted by the scheduler; `failed`
/// rows are revived only through re-enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub lead_id: i64,
    pub linkedin_url: String,
    pub full_name: String,
    pub note: Option<String>,
    pub status: ConnectStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
}

/// Result of an enqueue call. Fresh inserts and failed-row retries are
/// tracked separately; the wire payload reports their sum as `added`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOutcome {
    pub inserted: u64,
    pub retried: u64,
}

impl EnqueueOutcome {
    pub fn added(self) -> u64 {
        self.inserted + self.retried
    }
}

/// One extraction invocation, from start to terminal completion.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub source: LeadSource,
    pub input: String,
    pub status: RunStatus,
    pub leads_found: i64,
    pub leads_enriched: i64,
    pub error: Option<String>,
    pub output_paths: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by every worker control call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerState {
    pub running: bool,
    pub paused: bool,
    pub last_sent: Option<DateTime<Utc>>,
    pub sends_today: i64,
    pub daily_limit: u32,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub company: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_max_pages() -> u32 {
    5
}

impl SearchRequest {
    /// Concise query text for the run record.
    pub fn describe(&self) -> String {
        let mut bits = Vec::new();
        if !self.keywords.trim().is_empty() {
            bits.push(self.keywords.trim().to_string());
        }
        if !self.title.trim().is_empty() {
            bits.push(format!("title:{}", self.title.trim()));
        }
        if !self.location.trim().is_empty() {
            bits.push(format!("location:{}", self.location.trim()));
        }
        if !self.company.trim().is_empty() {
            bits.push(format!("company:{}", self.company.trim()));
        }
        if !self.industry.trim().is_empty() {
            bits.push(format!("industry:{}", self.industry.trim()));
        }
        if bits.is_empty() {
            "search".to_string()
        } else {
            bits.join(", ")
        }
    }
}

/// Normalize a LinkedIn profile/search URL to its canonical absolute
/// form. Queue dedup relies on this being stable across input styles.
pub fn normalize_linkedin_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else if trimmed.starts_with('/') {
        format!("https://www.linkedin.com{trimmed}")
    } else if trimmed.starts_with("linkedin.com") || trimmed.starts_with("www.linkedin.com") {
        format!("https://{trimmed}")
    } else {
        trimmed.to_string()
    };

    if let Some(idx) = url.find('?') {
        url.truncate(idx);
    }
    while url.ends_with('/') {
        url.pop();
    }

    for prefix in [
        "http://www.linkedin.com",
        "http://linkedin.com",
        "https://linkedin.com",
    ] {
        if let Some(rest) = url.strip_prefix(prefix) {
            url = format!("https://www.linkedin.com{rest}");
            break;
        }
    }

    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_relative_and_bare_urls() {
        let cases = [
            ("/in/jane-doe/", "https://www.linkedin.com/in/jane-doe"),
            (
                "//www.linkedin.com/in/jane-doe",
                "https://www.linkedin.com/in/jane-doe",
            ),
            ("linkedin.com/in/jane-doe", "https://www.linkedin.com/in/jane-doe"),
            (
                "www.linkedin.com/in/jane-doe",
                "https://www.linkedin.com/in/jane-doe",
            ),
            (
                "http://linkedin.com/in/jane-doe",
                "https://www.linkedin.com/in/jane-doe",
            ),
            (
                "https://www.linkedin.com/in/jane-doe?miniProfileUrn=urn%3Ali",
                "https://www.linkedin.com/in/jane-doe",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(
                normalize_linkedin_url(input).as_deref(),
                Some(expected),
                "input {input}"
            );
        }
    }

    #[test]
    fn normalize_rejects_empty() {
        assert_eq!(normalize_linkedin_url(""), None);
        assert_eq!(normalize_linkedin_url("   "), None);
    }

    #[test]
    fn dedup_key_prefers_url() {
        let lead = Lead::new(
            Some("/in/jane-doe"),
            "Jane Doe",
            None,
            LeadSource::LinkedinSearch,
        );
        assert_eq!(lead.dedup_key(), "https://www.linkedin.com/in/jane-doe");

        let no_url = Lead::new(None, "Jane Doe", None, LeadSource::LinkedinSearch);
        assert_eq!(no_url.dedup_key(), "Jane Doe|");
    }

    #[test]
    fn source_from_url() {
        assert_eq!(
            LeadSource::from_url("https://www.linkedin.com/sales/search/people?query=x"),
            LeadSource::SalesNavigator
        );
        assert_eq!(
            LeadSource::from_url("https://www.linkedin.com/company/acme/people/"),
            LeadSource::CompanyEmployees
        );
        assert_eq!(
            LeadSource::from_url("https://www.linkedin.com/search/results/people/?keywords=x"),
            LeadSource::LinkedinSearch
        );
    }

    #[test]
    fn search_request_describe_joins_fields() {
        let req = SearchRequest {
            keywords: "fintech".into(),
            title: "CTO".into(),
            location: String::new(),
            industry: String::new(),
            company: String::new(),
            max_pages: 5,
        };
        assert_eq!(req.describe(), "fintech, title:CTO");
    }

    #[test]
    fn statuses_round_trip() {
        for status in [
            ConnectStatus::Pending,
            ConnectStatus::InProgress,
            ConnectStatus::Sent,
            ConnectStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ConnectStatus>(), Ok(status));
        }
        for status in [RunStatus::Running, RunStatus::Done, RunStatus::Error] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
    }
}
