//! Shared type definitions for the storage layer.
//!
//! Rows are stored with RFC 3339 timestamps and `YYYY-MM-DD` dates as TEXT.
//! List- and map-shaped columns hold JSON; the accessors on each type decode
//! them lazily so store code stays on plain strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to storage operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

// ---------------------------------------------------------------------------
// Closed vocabularies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Landing,
    Site,
    Blog,
    Pillar,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landing => "landing",
            Self::Site => "site",
            Self::Blog => "blog",
            Self::Pillar => "pillar",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "landing" => Self::Landing,
            "blog" => Self::Blog,
            "pillar" => Self::Pillar,
            _ => Self::Site,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }

    /// Review-queue priority derived from severity.
    pub fn queue_priority(&self) -> i32 {
        match self {
            Self::Critical => 10,
            Self::High => 8,
            Self::Medium => 5,
            Self::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingStatus {
    New,
    RecommendationDrafted,
    Approved,
    Completed,
    Expired,
    Skipped,
    Resolved,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::RecommendationDrafted => "recommendation_drafted",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Skipped => "skipped",
            Self::Resolved => "resolved",
        }
    }
}

/// Finding statuses that block a fresh investigation of the same page.
pub const OPEN_FINDING_STATUSES: &[&str] = &["new", "recommendation_drafted", "approved"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationAction {
    Warn,
    Block,
    Alert,
}

impl ViolationAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "block" => Self::Block,
            "alert" => Self::Alert,
            _ => Self::Warn,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A row from `thyme_pages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub url: String,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub page_type: PageType,
    pub cms_page_id: Option<String>,
    pub has_form: bool,
    /// JSON array of CMS form ids.
    pub form_ids: String,
    pub has_cta: bool,
    /// JSON array of CMS CTA ids.
    pub cta_ids: String,
    pub published_at: Option<String>,
    pub last_updated_at: Option<String>,
    pub content_age_days: Option<i64>,
    pub is_indexed: bool,
    pub is_active: bool,
    pub title_length: Option<i64>,
    pub meta_description_length: Option<i64>,
    /// JSON array of meta issue tags.
    pub meta_issues: String,
    pub has_broken_links: bool,
    pub broken_link_count: i64,
    pub health_score: Option<i64>,
    /// JSON object with the six-dimension breakdown.
    pub health_breakdown: Option<String>,
    pub last_health_check_at: Option<String>,
}

impl Page {
    pub fn meta_issue_list(&self) -> Vec<String> {
        serde_json::from_str(&self.meta_issues).unwrap_or_default()
    }

    pub fn form_id_list(&self) -> Vec<String> {
        serde_json::from_str(&self.form_ids).unwrap_or_default()
    }
}

/// A row from `thyme_analytics_snapshots`. `page_url` is a page *path*
/// (analytics keys by path, not absolute URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub page_url: String,
    pub snapshot_date: String,
    pub active_users: i64,
    pub sessions: i64,
    pub page_views: i64,
    pub bounce_rate: Option<f64>,
    pub avg_session_duration: Option<f64>,
    pub users_previous_period: i64,
    pub sessions_previous_period: i64,
    pub traffic_change_pct: f64,
}

impl AnalyticsSnapshot {
    /// Percent change vs the previous window; 0 when there is no baseline.
    pub fn compute_change_pct(current: i64, previous: i64) -> f64 {
        if previous > 0 {
            100.0 * (current - previous) as f64 / previous as f64
        } else {
            0.0
        }
    }
}

/// A row from `thyme_search_snapshots`, keyed by absolute page URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSnapshot {
    pub page_url: String,
    pub snapshot_date: String,
    pub total_clicks: i64,
    pub total_impressions: i64,
    pub avg_ctr: f64,
    pub avg_position: Option<f64>,
    pub previous_clicks: i64,
    pub previous_impressions: i64,
    pub previous_ctr: f64,
    pub previous_position: Option<f64>,
    /// Positive = the page moved up (position numbers shrink as rank improves).
    pub position_change: f64,
}

/// A row from `thyme_speed_scores` (append-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedScore {
    pub id: String,
    pub page_url: String,
    pub test_date: String,
    pub strategy: String,
    pub performance_score: Option<i64>,
    pub accessibility_score: Option<i64>,
    pub seo_score: Option<i64>,
    pub best_practices_score: Option<i64>,
    pub lcp_ms: Option<f64>,
    pub fid_ms: Option<f64>,
    pub cls: Option<f64>,
    pub inp_ms: Option<f64>,
    /// JSON array of ranked improvement opportunities.
    pub opportunities: String,
}

/// A row from `thyme_link_health`, keyed by (source, target).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHealthRecord {
    pub source_page_url: String,
    pub target_url: String,
    pub link_type: String,
    pub http_status: Option<i64>,
    pub is_broken: bool,
    pub is_redirect: bool,
    /// JSON array of hop URLs.
    pub redirect_chain: String,
    pub redirect_count: i64,
    pub error_message: Option<String>,
    pub first_detected_at: String,
    pub last_checked_at: String,
    pub is_resolved: bool,
    pub resolved_at: Option<String>,
}

/// A row from `thyme_findings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub page_url: Option<String>,
    pub finding_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub business_impact: Option<String>,
    pub agent_loop_iterations: i64,
    /// JSON array of tool names the investigation used.
    pub tools_used: String,
    pub investigation_summary: Option<String>,
    pub status: String,
    pub skip_reason: Option<String>,
    pub expires_at: Option<String>,
    pub health_score_at_detection: Option<i64>,
    pub health_score_at_resolution: Option<i64>,
    pub created_at: String,
}

/// A row from `thyme_decision_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionQueueItem {
    pub id: String,
    pub finding_id: Option<String>,
    pub action_type: String,
    pub action_summary: String,
    /// JSON object with the structured action payload.
    pub action_detail: String,
    pub severity: Severity,
    pub confidence: f64,
    pub risk_level: String,
    pub priority: i64,
    pub status: String,
    pub reviewer: Option<String>,
    pub reviewed_at: Option<String>,
    pub review_notes: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

/// A row from `thyme_guardrails`.
#[derive(Debug, Clone)]
pub struct Guardrail {
    pub id: String,
    pub name: String,
    pub rule_category: String,
    pub threshold: Option<f64>,
    /// JSON configuration object, shape depends on rule_category.
    pub config: Option<String>,
    pub violation_action: ViolationAction,
}

/// A row from the shared `thyme_signals` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub source_agent: String,
    pub event_type: String,
    /// JSON payload, free-form per event type.
    pub payload: String,
    pub created_at: String,
}

impl Signal {
    pub fn payload_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// A row from `thyme_trend_snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSnapshot {
    pub id: String,
    pub period_type: String,
    pub snapshot_date: String,
    pub total_traffic: i64,
    pub traffic_change_pct: f64,
    pub avg_health_score: Option<f64>,
    /// JSON object: five score buckets → page counts.
    pub health_distribution: String,
    /// JSON arrays of {url, changePct} entries.
    pub top_declining: String,
    pub top_improving: String,
    pub broken_links_count: i64,
    pub new_broken_links: i64,
    pub meta_issues_count: i64,
}

// ---------------------------------------------------------------------------
// JSON column helpers
// ---------------------------------------------------------------------------

pub fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub fn from_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
