//! GA4 Data API adapter: page-level metrics with period comparison.
//!
//! Analytics keys rows by page *path*. The comparison runs as two
//! independent report queries (current window, previous window) merged by
//! path, so a partial failure degrades to missing-previous rather than
//! losing the whole pull.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::{bounded, expect_success, send_with_retry, RetryPolicy, SourceError};
use crate::util::Deadline;

const DATA_API: &str = "https://analyticsdata.googleapis.com/v1beta";
const ADMIN_API: &str = "https://analyticsadmin.googleapis.com/v1beta";

/// Per-call cap; the orchestrator deadline clamps it further.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// One merged page row: current window plus previous-window counterparts.
#[derive(Debug, Clone, Default)]
pub struct PageMetrics {
    pub page_path: String,
    pub active_users: i64,
    pub sessions: i64,
    pub page_views: i64,
    pub bounce_rate: Option<f64>,
    pub avg_session_duration: Option<f64>,
    pub previous_users: i64,
    pub previous_sessions: i64,
}

/// Session share for one acquisition channel.
#[derive(Debug, Clone)]
pub struct ChannelTraffic {
    pub channel: &'static str,
    pub sessions: i64,
    pub active_users: i64,
}

// ---------------------------------------------------------------------------
// Report response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    #[serde(default)]
    dimension_values: Vec<ReportValue>,
    #[serde(default)]
    metric_values: Vec<ReportValue>,
}

#[derive(Debug, Deserialize)]
struct ReportValue {
    #[serde(default)]
    value: String,
}

impl ReportRow {
    fn dimension(&self, index: usize) -> &str {
        self.dimension_values
            .get(index)
            .map(|v| v.value.as_str())
            .unwrap_or("")
    }

    fn metric_i64(&self, index: usize) -> i64 {
        self.metric_values
            .get(index)
            .and_then(|v| v.value.parse::<f64>().ok())
            .map(|v| v.round() as i64)
            .unwrap_or(0)
    }

    fn metric_f64(&self, index: usize) -> Option<f64> {
        self.metric_values.get(index).and_then(|v| v.value.parse().ok())
    }
}

pub struct AnalyticsClient {
    http: reqwest::Client,
    property_id: String,
}

impl AnalyticsClient {
    pub fn new(property_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            property_id: property_id.to_string(),
        }
    }

    async fn run_report(
        &self,
        access_token: &str,
        body: serde_json::Value,
        deadline: &Deadline,
    ) -> Result<RunReportResponse, SourceError> {
        let url = format!("{}/properties/{}:runReport", DATA_API, self.property_id);
        let cap = deadline.timeout_capped(CALL_TIMEOUT);
        bounded(cap, async {
            let resp = send_with_retry(
                self.http.post(&url).bearer_auth(access_token).json(&body),
                &RetryPolicy::default(),
            )
            .await?;
            let resp = expect_success(resp).await?;
            resp.json::<RunReportResponse>()
                .await
                .map_err(|e| SourceError::Data(format!("runReport response: {}", e)))
        })
        .await
    }

    /// Page metrics for the current window merged with the previous window.
    pub async fn page_metrics(
        &self,
        access_token: &str,
        current: (&str, &str),
        previous: (&str, &str),
        deadline: &Deadline,
    ) -> Result<Vec<PageMetrics>, SourceError> {
        let current_rows = self
            .run_report(access_token, page_report_body(current.0, current.1), deadline)
            .await?;

        // A failed previous-window query degrades to zero baselines.
        let previous_rows = match self
            .run_report(access_token, page_report_body(previous.0, previous.1), deadline)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Previous-window analytics query failed: {}", e);
                RunReportResponse { rows: Vec::new() }
            }
        };

        Ok(merge_windows(&current_rows.rows, &previous_rows.rows))
    }

    /// Metrics for a single page path over the trailing `days`.
    pub async fn page_detail(
        &self,
        access_token: &str,
        page_path: &str,
        days: u32,
        deadline: &Deadline,
    ) -> Result<Option<PageMetrics>, SourceError> {
        let body = serde_json::json!({
            "dateRanges": [{"startDate": format!("{}daysAgo", days), "endDate": "today"}],
            "dimensions": [{"name": "pagePath"}],
            "metrics": [
                {"name": "activeUsers"},
                {"name": "sessions"},
                {"name": "screenPageViews"},
                {"name": "bounceRate"},
                {"name": "averageSessionDuration"}
            ],
            "dimensionFilter": {
                "filter": {
                    "fieldName": "pagePath",
                    "stringFilter": {"matchType": "EXACT", "value": page_path}
                }
            }
        });
        let resp = self.run_report(access_token, body, deadline).await?;
        Ok(resp.rows.first().map(|row| PageMetrics {
            page_path: row.dimension(0).to_string(),
            active_users: row.metric_i64(0),
            sessions: row.metric_i64(1),
            page_views: row.metric_i64(2),
            bounce_rate: row.metric_f64(3),
            avg_session_duration: row.metric_f64(4),
            previous_users: 0,
            previous_sessions: 0,
        }))
    }

    /// Session breakdown over the five acquisition channels.
    pub async fn traffic_sources(
        &self,
        access_token: &str,
        window: (&str, &str),
        deadline: &Deadline,
    ) -> Result<Vec<ChannelTraffic>, SourceError> {
        let body = serde_json::json!({
            "dateRanges": [{"startDate": window.0, "endDate": window.1}],
            "dimensions": [{"name": "sessionDefaultChannelGroup"}],
            "metrics": [{"name": "sessions"}, {"name": "activeUsers"}]
        });
        let resp = self.run_report(access_token, body, deadline).await?;

        let mut by_channel: HashMap<&'static str, (i64, i64)> = HashMap::new();
        for row in &resp.rows {
            if let Some(channel) = classify_channel(row.dimension(0)) {
                let entry = by_channel.entry(channel).or_insert((0, 0));
                entry.0 += row.metric_i64(0);
                entry.1 += row.metric_i64(1);
            }
        }

        let mut out: Vec<ChannelTraffic> = by_channel
            .into_iter()
            .map(|(channel, (sessions, active_users))| ChannelTraffic {
                channel,
                sessions,
                active_users,
            })
            .collect();
        out.sort_by(|a, b| b.sessions.cmp(&a.sessions));
        Ok(out)
    }

    /// Names of the configured key events (conversions).
    pub async fn key_events(
        &self,
        access_token: &str,
        deadline: &Deadline,
    ) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/properties/{}/keyEvents", ADMIN_API, self.property_id);
        let cap = deadline.timeout_capped(CALL_TIMEOUT);
        bounded(cap, async {
            let resp = send_with_retry(
                self.http.get(&url).bearer_auth(access_token),
                &RetryPolicy::default(),
            )
            .await?;
            let resp = expect_success(resp).await?;
            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| SourceError::Data(format!("keyEvents response: {}", e)))?;
            let names = body["keyEvents"]
                .as_array()
                .map(|events| {
                    events
                        .iter()
                        .filter_map(|e| e["eventName"].as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(names)
        })
        .await
    }
}

fn page_report_body(start: &str, end: &str) -> serde_json::Value {
    serde_json::json!({
        "dateRanges": [{"startDate": start, "endDate": end}],
        "dimensions": [{"name": "pagePath"}],
        "metrics": [
            {"name": "activeUsers"},
            {"name": "sessions"},
            {"name": "screenPageViews"},
            {"name": "bounceRate"},
            {"name": "averageSessionDuration"}
        ],
        "limit": "10000"
    })
}

/// Merge current and previous report rows by page path.
fn merge_windows(current: &[ReportRow], previous: &[ReportRow]) -> Vec<PageMetrics> {
    let previous_by_path: HashMap<&str, &ReportRow> = previous
        .iter()
        .map(|row| (row.dimension(0), row))
        .collect();

    current
        .iter()
        .map(|row| {
            let path = row.dimension(0);
            let prior = previous_by_path.get(path);
            PageMetrics {
                page_path: path.to_string(),
                active_users: row.metric_i64(0),
                sessions: row.metric_i64(1),
                page_views: row.metric_i64(2),
                bounce_rate: row.metric_f64(3),
                avg_session_duration: row.metric_f64(4),
                previous_users: prior.map(|p| p.metric_i64(0)).unwrap_or(0),
                previous_sessions: prior.map(|p| p.metric_i64(1)).unwrap_or(0),
            }
        })
        .collect()
}

/// Map a GA channel-group label onto the closed channel set. Labels outside
/// the five buckets (Email, Display, Unassigned, ...) are dropped.
fn classify_channel(label: &str) -> Option<&'static str> {
    let lower = label.to_lowercase();
    if lower.contains("paid") {
        Some("paid")
    } else if lower.contains("organic search") {
        Some("organic")
    } else if lower.contains("social") {
        Some("social")
    } else if lower == "direct" {
        Some("direct")
    } else if lower.contains("referral") {
        Some("referral")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, metrics: &[&str]) -> ReportRow {
        ReportRow {
            dimension_values: vec![ReportValue {
                value: path.to_string(),
            }],
            metric_values: metrics
                .iter()
                .map(|m| ReportValue {
                    value: m.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_merge_windows_joins_by_path() {
        let current = vec![
            row("/pricing", &["110", "120", "240", "0.41", "62.5"]),
            row("/blog/launch", &["40", "44", "70", "0.6", "31.0"]),
        ];
        let previous = vec![row("/pricing", &["120", "130", "250", "0.39", "60.1"])];

        let merged = merge_windows(&current, &previous);
        assert_eq!(merged.len(), 2);

        let pricing = &merged[0];
        assert_eq!(pricing.page_path, "/pricing");
        assert_eq!(pricing.active_users, 110);
        assert_eq!(pricing.previous_users, 120);
        assert_eq!(pricing.bounce_rate, Some(0.41));

        let launch = &merged[1];
        assert_eq!(launch.previous_users, 0, "unmatched path has no baseline");
    }

    #[test]
    fn test_metric_parsing_tolerates_junk() {
        let bad = row("/a", &["not-a-number"]);
        assert_eq!(bad.metric_i64(0), 0);
        assert_eq!(bad.metric_f64(0), None);
        assert_eq!(bad.metric_i64(7), 0, "out-of-range index is zero");
    }

    #[test]
    fn test_classify_channel() {
        assert_eq!(classify_channel("Organic Search"), Some("organic"));
        assert_eq!(classify_channel("Paid Search"), Some("paid"));
        assert_eq!(classify_channel("Paid Social"), Some("paid"));
        assert_eq!(classify_channel("Direct"), Some("direct"));
        assert_eq!(classify_channel("Referral"), Some("referral"));
        assert_eq!(classify_channel("Organic Social"), Some("social"));
        assert_eq!(classify_channel("Email"), None);
    }

    #[test]
    fn test_report_response_deserializes() {
        let json = r#"{
            "rows": [
                {
                    "dimensionValues": [{"value": "/pricing"}],
                    "metricValues": [{"value": "110"}, {"value": "120"}]
                }
            ],
            "rowCount": 1
        }"#;
        let parsed: RunReportResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].dimension(0), "/pricing");
        assert_eq!(parsed.rows[0].metric_i64(0), 110);
    }
}
