//! Search Console adapter: per-page clicks, impressions, CTR, and position.
//!
//! Position semantics: lower is better. The comparison flips the sign so a
//! positive `position_change` always means the page moved up.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::{bounded, expect_success, send_with_retry, RetryPolicy, SourceError};
use crate::util::Deadline;

const API_BASE: &str = "https://www.googleapis.com/webmasters/v3/sites";

const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Row cap for the per-page top-queries pull.
const TOP_QUERY_LIMIT: u32 = 10;

/// One page's search performance with previous-window comparison.
#[derive(Debug, Clone, Default)]
pub struct PagePerformance {
    pub page_url: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: Option<f64>,
    pub previous_clicks: i64,
    pub previous_impressions: i64,
    pub previous_ctr: f64,
    pub previous_position: Option<f64>,
    /// Positive = improved (prev − current).
    pub position_change: f64,
}

/// One query's stats for a page.
#[derive(Debug, Clone)]
pub struct QueryStat {
    pub query: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

/// One (page, query) coverage row for the keyword-gap analysis.
#[derive(Debug, Clone)]
pub struct CoverageRow {
    pub page_url: String,
    pub query: String,
    pub impressions: i64,
    pub position: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<ApiRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRow {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    clicks: f64,
    #[serde(default)]
    impressions: f64,
    #[serde(default)]
    ctr: f64,
    #[serde(default)]
    position: f64,
}

pub struct SearchClient {
    http: reqwest::Client,
    site_url: String,
}

impl SearchClient {
    pub fn new(site_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            site_url: site_url.to_string(),
        }
    }

    async fn query_api(
        &self,
        access_token: &str,
        body: serde_json::Value,
        deadline: &Deadline,
    ) -> Result<QueryResponse, SourceError> {
        let url = format!(
            "{}/{}/searchAnalytics/query",
            API_BASE,
            urlencode(&self.site_url)
        );
        let cap = deadline.timeout_capped(CALL_TIMEOUT);
        bounded(cap, async {
            let resp = send_with_retry(
                self.http.post(&url).bearer_auth(access_token).json(&body),
                &RetryPolicy::default(),
            )
            .await?;
            let resp = expect_success(resp).await?;
            resp.json::<QueryResponse>()
                .await
                .map_err(|e| SourceError::Data(format!("searchAnalytics response: {}", e)))
        })
        .await
    }

    /// Per-page performance for the current window, merged with the previous
    /// window; a failed previous query degrades to empty baselines.
    pub async fn page_performance(
        &self,
        access_token: &str,
        current: (&str, &str),
        previous: (&str, &str),
        deadline: &Deadline,
    ) -> Result<Vec<PagePerformance>, SourceError> {
        let current_rows = self
            .query_api(access_token, window_body(current.0, current.1), deadline)
            .await?;

        let previous_rows = match self
            .query_api(access_token, window_body(previous.0, previous.1), deadline)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Previous-window search query failed: {}", e);
                QueryResponse { rows: Vec::new() }
            }
        };

        Ok(merge_windows(&current_rows.rows, &previous_rows.rows))
    }

    /// Top queries driving one page, bounded to [`TOP_QUERY_LIMIT`].
    pub async fn top_queries(
        &self,
        access_token: &str,
        page_url: &str,
        days: u32,
        deadline: &Deadline,
    ) -> Result<Vec<QueryStat>, SourceError> {
        let body = serde_json::json!({
            "startDate": days_ago(days),
            "endDate": today(),
            "dimensions": ["query"],
            "dimensionFilterGroups": [{
                "filters": [{"dimension": "page", "operator": "equals", "expression": page_url}]
            }],
            "rowLimit": TOP_QUERY_LIMIT
        });
        let resp = self.query_api(access_token, body, deadline).await?;
        Ok(resp
            .rows
            .into_iter()
            .map(|row| QueryStat {
                query: row.keys.first().cloned().unwrap_or_default(),
                clicks: row.clicks.round() as i64,
                impressions: row.impressions.round() as i64,
                ctr: row.ctr,
                position: row.position,
            })
            .collect())
    }

    /// Performance for a single page over the trailing `days`.
    pub async fn page_detail(
        &self,
        access_token: &str,
        page_url: &str,
        days: u32,
        deadline: &Deadline,
    ) -> Result<Option<PagePerformance>, SourceError> {
        let body = serde_json::json!({
            "startDate": days_ago(days),
            "endDate": today(),
            "dimensions": ["page"],
            "dimensionFilterGroups": [{
                "filters": [{"dimension": "page", "operator": "equals", "expression": page_url}]
            }],
            "rowLimit": 1
        });
        let resp = self.query_api(access_token, body, deadline).await?;
        Ok(resp.rows.first().map(|row| PagePerformance {
            page_url: row.keys.first().cloned().unwrap_or_default(),
            clicks: row.clicks.round() as i64,
            impressions: row.impressions.round() as i64,
            ctr: row.ctr,
            position: Some(row.position),
            ..Default::default()
        }))
    }

    /// Pages ranking for queries containing `keyword`, for coverage checks.
    pub async fn pages_for_keyword(
        &self,
        access_token: &str,
        keyword: &str,
        days: u32,
        deadline: &Deadline,
    ) -> Result<Vec<CoverageRow>, SourceError> {
        let body = serde_json::json!({
            "startDate": days_ago(days),
            "endDate": today(),
            "dimensions": ["page", "query"],
            "dimensionFilterGroups": [{
                "filters": [{"dimension": "query", "operator": "contains", "expression": keyword}]
            }],
            "rowLimit": 25
        });
        let resp = self.query_api(access_token, body, deadline).await?;
        Ok(resp
            .rows
            .into_iter()
            .map(|row| CoverageRow {
                page_url: row.keys.first().cloned().unwrap_or_default(),
                query: row.keys.get(1).cloned().unwrap_or_default(),
                impressions: row.impressions.round() as i64,
                position: row.position,
            })
            .collect())
    }
}

fn window_body(start: &str, end: &str) -> serde_json::Value {
    serde_json::json!({
        "startDate": start,
        "endDate": end,
        "dimensions": ["page"],
        "rowLimit": 5000
    })
}

fn merge_windows(current: &[ApiRow], previous: &[ApiRow]) -> Vec<PagePerformance> {
    let previous_by_page: HashMap<&str, &ApiRow> = previous
        .iter()
        .filter_map(|row| row.keys.first().map(|k| (k.as_str(), row)))
        .collect();

    current
        .iter()
        .filter_map(|row| {
            let page = row.keys.first()?;
            let prior = previous_by_page.get(page.as_str());
            let previous_position = prior.map(|p| p.position);
            let position_change = match previous_position {
                Some(prev) => prev - row.position,
                None => 0.0,
            };
            Some(PagePerformance {
                page_url: page.clone(),
                clicks: row.clicks.round() as i64,
                impressions: row.impressions.round() as i64,
                ctr: row.ctr,
                position: Some(row.position),
                previous_clicks: prior.map(|p| p.clicks.round() as i64).unwrap_or(0),
                previous_impressions: prior.map(|p| p.impressions.round() as i64).unwrap_or(0),
                previous_ctr: prior.map(|p| p.ctr).unwrap_or(0.0),
                previous_position,
                position_change,
            })
        })
        .collect()
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn today() -> String {
    chrono::Utc::now().date_naive().to_string()
}

fn days_ago(days: u32) -> String {
    (chrono::Utc::now().date_naive() - chrono::Duration::days(days as i64)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_row(page: &str, clicks: f64, position: f64) -> ApiRow {
        ApiRow {
            keys: vec![page.to_string()],
            clicks,
            impressions: clicks * 20.0,
            ctr: 0.05,
            position,
        }
    }

    #[test]
    fn test_position_change_sign_flips() {
        let current = vec![api_row("https://x.com/a", 30.0, 8.0)];
        let previous = vec![api_row("https://x.com/a", 25.0, 12.0)];

        let merged = merge_windows(&current, &previous);
        // Moved from 12 to 8: improved by 4.
        assert!((merged[0].position_change - 4.0).abs() < f64::EPSILON);

        let worsened = merge_windows(
            &[api_row("https://x.com/a", 30.0, 15.0)],
            &[api_row("https://x.com/a", 25.0, 10.0)],
        );
        assert!((worsened[0].position_change - (-5.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_without_baseline() {
        let merged = merge_windows(&[api_row("https://x.com/new", 5.0, 40.0)], &[]);
        assert_eq!(merged[0].previous_clicks, 0);
        assert_eq!(merged[0].previous_position, None);
        assert_eq!(merged[0].position_change, 0.0);
    }

    #[test]
    fn test_query_response_deserializes() {
        let json = r#"{
            "rows": [
                {"keys": ["https://x.com/pricing"], "clicks": 31.0,
                 "impressions": 820.0, "ctr": 0.0378, "position": 8.2}
            ],
            "responseAggregationType": "byPage"
        }"#;
        let parsed: QueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].keys[0], "https://x.com/pricing");
    }

    #[test]
    fn test_site_url_is_encoded() {
        assert_eq!(
            urlencode("sc-domain:example.com"),
            "sc-domain%3Aexample.com"
        );
        assert_eq!(
            urlencode("https://www.example.com/"),
            "https%3A%2F%2Fwww.example.com%2F"
        );
    }
}
