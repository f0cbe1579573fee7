//! PageSpeed Insights adapter.
//!
//! A full audit takes 15–25 s of remote work, so runs are serialized through
//! the client and the orchestrator only spot-checks a couple of pages per
//! scan. Response parsing is lenient: a missing category or audit block
//! degrades to `None` fields, never a dropped run.

use std::time::Duration;

use tokio::sync::Mutex;

use super::{bounded, expect_success, send_with_retry, RetryPolicy, SourceError};
use crate::util::Deadline;

const API_URL: &str = "https://www.googleapis.com/pagespeedonline/v5/runPagespeed";

/// Generous cap; the audit itself routinely takes 20 s.
const CALL_TIMEOUT: Duration = Duration::from_secs(35);

/// Max ranked improvement opportunities carried per audit.
const MAX_OPPORTUNITIES: usize = 10;

/// A completed audit for one (url, strategy).
#[derive(Debug, Clone, Default)]
pub struct SpeedAudit {
    pub page_url: String,
    pub strategy: String,
    pub performance_score: Option<i64>,
    pub accessibility_score: Option<i64>,
    pub seo_score: Option<i64>,
    pub best_practices_score: Option<i64>,
    pub lcp_ms: Option<f64>,
    pub fid_ms: Option<f64>,
    pub cls: Option<f64>,
    pub inp_ms: Option<f64>,
    /// Ranked by estimated savings, largest first.
    pub opportunities: Vec<Opportunity>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub savings_ms: f64,
}

pub struct SpeedClient {
    http: reqwest::Client,
    api_key: String,
    /// Audits are expensive; one in flight at a time.
    run_lock: Mutex<()>,
}

impl SpeedClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            run_lock: Mutex::new(()),
        }
    }

    /// Run a full audit for one (url, strategy).
    pub async fn run_audit(
        &self,
        page_url: &str,
        strategy: &str,
        deadline: &Deadline,
    ) -> Result<SpeedAudit, SourceError> {
        let _guard = self.run_lock.lock().await;

        let cap = deadline.timeout_capped(CALL_TIMEOUT);
        let body = bounded(cap, async {
            let resp = send_with_retry(
                self.http.get(API_URL).query(&[
                    ("url", page_url),
                    ("strategy", strategy),
                    ("key", self.api_key.as_str()),
                    ("category", "performance"),
                    ("category", "accessibility"),
                    ("category", "seo"),
                    ("category", "best-practices"),
                ]),
                &RetryPolicy::default(),
            )
            .await?;
            let resp = expect_success(resp).await?;
            resp.json::<serde_json::Value>()
                .await
                .map_err(|e| SourceError::Data(format!("runPagespeed response: {}", e)))
        })
        .await?;

        Ok(parse_audit(page_url, strategy, &body))
    }
}

/// Extract scores, Core Web Vitals, and ranked opportunities from a raw
/// Lighthouse payload. Every field is optional by construction.
fn parse_audit(page_url: &str, strategy: &str, body: &serde_json::Value) -> SpeedAudit {
    let lighthouse = &body["lighthouseResult"];
    let categories = &lighthouse["categories"];
    let audits = &lighthouse["audits"];

    let category_score = |name: &str| -> Option<i64> {
        categories[name]["score"]
            .as_f64()
            .map(|s| (s * 100.0).round() as i64)
    };
    let audit_value = |name: &str| -> Option<f64> { audits[name]["numericValue"].as_f64() };

    let mut opportunities: Vec<Opportunity> = audits
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(_, audit)| audit["details"]["type"].as_str() == Some("opportunity"))
                .filter_map(|(id, audit)| {
                    let savings = audit["details"]["overallSavingsMs"].as_f64().unwrap_or(0.0);
                    if savings <= 0.0 {
                        return None;
                    }
                    Some(Opportunity {
                        id: id.clone(),
                        title: audit["title"].as_str().unwrap_or(id).to_string(),
                        savings_ms: savings,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    opportunities.sort_by(|a, b| {
        b.savings_ms
            .partial_cmp(&a.savings_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    opportunities.truncate(MAX_OPPORTUNITIES);

    SpeedAudit {
        page_url: page_url.to_string(),
        strategy: strategy.to_string(),
        performance_score: category_score("performance"),
        accessibility_score: category_score("accessibility"),
        seo_score: category_score("seo"),
        best_practices_score: category_score("best-practices"),
        lcp_ms: audit_value("largest-contentful-paint"),
        fid_ms: audit_value("max-potential-fid"),
        cls: audit_value("cumulative-layout-shift"),
        inp_ms: audit_value("interaction-to-next-paint"),
        opportunities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> serde_json::Value {
        serde_json::json!({
            "lighthouseResult": {
                "categories": {
                    "performance": {"score": 0.91},
                    "accessibility": {"score": 0.88},
                    "seo": {"score": 1.0},
                    "best-practices": {"score": 0.95}
                },
                "audits": {
                    "largest-contentful-paint": {"numericValue": 1912.4},
                    "max-potential-fid": {"numericValue": 18.0},
                    "cumulative-layout-shift": {"numericValue": 0.021},
                    "interaction-to-next-paint": {"numericValue": 141.0},
                    "render-blocking-resources": {
                        "title": "Eliminate render-blocking resources",
                        "details": {"type": "opportunity", "overallSavingsMs": 640.0}
                    },
                    "unused-css-rules": {
                        "title": "Reduce unused CSS",
                        "details": {"type": "opportunity", "overallSavingsMs": 1210.0}
                    },
                    "uses-text-compression": {
                        "title": "Enable text compression",
                        "details": {"type": "opportunity", "overallSavingsMs": 0.0}
                    },
                    "color-contrast": {
                        "title": "Background and foreground colors",
                        "details": {"type": "table"}
                    }
                }
            }
        })
    }

    #[test]
    fn test_parse_audit_extracts_scores_and_vitals() {
        let audit = parse_audit("https://x.com/a", "mobile", &fixture());
        assert_eq!(audit.performance_score, Some(91));
        assert_eq!(audit.accessibility_score, Some(88));
        assert_eq!(audit.seo_score, Some(100));
        assert_eq!(audit.best_practices_score, Some(95));
        assert_eq!(audit.lcp_ms, Some(1912.4));
        assert_eq!(audit.cls, Some(0.021));
        assert_eq!(audit.inp_ms, Some(141.0));
    }

    #[test]
    fn test_opportunities_ranked_and_filtered() {
        let audit = parse_audit("https://x.com/a", "mobile", &fixture());
        assert_eq!(audit.opportunities.len(), 2, "zero-savings and non-opportunity audits drop");
        assert_eq!(audit.opportunities[0].id, "unused-css-rules");
        assert!(audit.opportunities[0].savings_ms > audit.opportunities[1].savings_ms);
    }

    #[test]
    fn test_missing_audit_block_degrades_to_empty() {
        let audit = parse_audit("https://x.com/a", "desktop", &serde_json::json!({}));
        assert_eq!(audit.performance_score, None);
        assert_eq!(audit.lcp_ms, None);
        assert!(audit.opportunities.is_empty());
        assert_eq!(audit.strategy, "desktop");
    }
}
