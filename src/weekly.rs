//! Weekly site-wide audit: conversion cross-reference, full link sweep,
//! keyword coverage, trend snapshot, narrative digest.
//!
//! Same deadline discipline as the scan: stage failures become step-error
//! strings, not aborts. The digest is the only model call; when it fails, a
//! deterministic one-liner stands in.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::agent::llm::LlmClient;
use crate::audit;
use crate::config::Config;
use crate::db::{HealthDb, TrendSnapshot};
use crate::signals::{self, SignalQuery};
use crate::sources::analytics::AnalyticsClient;
use crate::sources::cms::{CmsClient, CmsForm};
use crate::sources::links::LinkChecker;
use crate::sources::search::SearchClient;
use crate::token::TokenBroker;
use crate::util::{self, Deadline};

/// Global wall-clock budget for the weekly audit.
pub const WEEKLY_BUDGET: Duration = Duration::from_secs(120);

/// Pages older than this are stale.
const STALE_AGE_DAYS: i64 = 180;

/// Token ceiling for the digest completion.
const DIGEST_MAX_TOKENS: u32 = 1500;

/// Site-wide traffic decline that warrants a signal.
const TRAFFIC_ALERT_PCT: f64 = -15.0;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyReport {
    pub success: bool,
    pub pages_audited: usize,
    pub broken_links_found: usize,
    pub links_resolved: usize,
    pub keyword_gaps: usize,
    pub stale_pages: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub step_errors: Vec<String>,
}

/// One keyword's organic-coverage verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordCoverage {
    pub keyword: String,
    pub has_organic_page: bool,
    pub position: Option<f64>,
}

/// Run the weekly audit.
pub async fn run_weekly(config: &Config, db: &HealthDb) -> WeeklyReport {
    let deadline = Deadline::new(WEEKLY_BUDGET);
    let mut report = WeeklyReport::default();

    let broker = TokenBroker::new(config);
    let analytics_client = AnalyticsClient::new(&config.analytics_property_id);
    let search_client = SearchClient::new(&config.search_site_url);
    let cms_client = CmsClient::new(&config.hubspot_token);
    let link_checker = LinkChecker::new();

    // Stage 1: token and window.
    let access_token = match broker.access_token(db).await {
        Ok(token) => token,
        Err(e) => {
            log::error!("Weekly audit aborted, token acquisition failed: {}", e);
            report.step_errors.push(format!("token: {}", e));
            report.duration_ms = deadline.elapsed_ms();
            return report;
        }
    };
    let today = Utc::now().date_naive();
    let week_ago = today - ChronoDuration::days(7);
    let window = (week_ago.to_string(), today.to_string());

    // Stage 2: search and analytics pulled in parallel, then upserted on
    // their natural keys.
    let two_weeks_ago = (today - ChronoDuration::days(14)).to_string();
    let (search_result, analytics_result) = tokio::join!(
        search_client.page_performance(
            &access_token,
            (&window.0, &window.1),
            (&two_weeks_ago, &window.0),
            &deadline,
        ),
        analytics_client.page_metrics(
            &access_token,
            (&window.0, &window.1),
            (&two_weeks_ago, &window.0),
            &deadline,
        ),
    );
    match search_result {
        Ok(rows) => {
            let snapshots: Vec<crate::db::SearchSnapshot> = rows
                .into_iter()
                .map(|perf| crate::db::SearchSnapshot {
                    page_url: perf.page_url,
                    snapshot_date: today.to_string(),
                    total_clicks: perf.clicks,
                    total_impressions: perf.impressions,
                    avg_ctr: perf.ctr,
                    avg_position: perf.position,
                    previous_clicks: perf.previous_clicks,
                    previous_impressions: perf.previous_impressions,
                    previous_ctr: perf.previous_ctr,
                    previous_position: perf.previous_position,
                    position_change: perf.position_change,
                })
                .collect();
            if let Err(e) = db.upsert_search_snapshots(&snapshots) {
                report.step_errors.push(format!("search upsert: {}", e));
            }
        }
        Err(e) => report.step_errors.push(format!("search: {}", e)),
    }
    match analytics_result {
        Ok(rows) => {
            let snapshots: Vec<crate::db::AnalyticsSnapshot> = rows
                .into_iter()
                .map(|metrics| crate::db::AnalyticsSnapshot {
                    page_url: metrics.page_path,
                    snapshot_date: today.to_string(),
                    active_users: metrics.active_users,
                    sessions: metrics.sessions,
                    page_views: metrics.page_views,
                    bounce_rate: metrics.bounce_rate,
                    avg_session_duration: metrics.avg_session_duration,
                    users_previous_period: metrics.previous_users,
                    sessions_previous_period: metrics.previous_sessions,
                    traffic_change_pct: crate::db::AnalyticsSnapshot::compute_change_pct(
                        metrics.active_users,
                        metrics.previous_users,
                    ),
                })
                .collect();
            if let Err(e) = db.upsert_analytics_snapshots(&snapshots) {
                report.step_errors.push(format!("analytics upsert: {}", e));
            }
        }
        Err(e) => report.step_errors.push(format!("analytics: {}", e)),
    }

    // Stage 3: conversion audit.
    let key_events = analytics_client
        .key_events(&access_token, &deadline)
        .await
        .unwrap_or_else(|e| {
            report.step_errors.push(format!("key events: {}", e));
            Vec::new()
        });
    let forms = cms_client
        .forms_with_submission_counts(&deadline)
        .await
        .unwrap_or_else(|e| {
            report.step_errors.push(format!("forms: {}", e));
            Vec::new()
        });
    let conversion = audit_conversions(&key_events, &forms);
    if let Err(e) = db.insert_conversion_audit(
        &today.to_string(),
        conversion.tracking_health,
        key_events.len() as i64,
        forms.len() as i64,
        conversion.total_submissions,
        &serde_json::json!(conversion.gaps),
        &conversion.recommendations,
    ) {
        report.step_errors.push(format!("conversion persist: {}", e));
    }

    // Stage 4: full sitemap link sweep with auto-resolution.
    match link_checker.sitemap_urls(&config.site_origin, &deadline).await {
        Ok(sitemap) => {
            let previously_broken: Vec<String> = db.broken_link_targets().unwrap_or_default();
            let results = link_checker.check_urls(&sitemap, &deadline).await;
            for check in &results {
                if check.is_broken {
                    report.broken_links_found += 1;
                } else if previously_broken.contains(&check.target_url) {
                    match db.resolve_link(&check.target_url) {
                        Ok(resolved) => report.links_resolved += resolved,
                        Err(e) => report.step_errors.push(format!("resolve: {}", e)),
                    }
                }
            }
        }
        Err(e) => report.step_errors.push(format!("links: {}", e)),
    }

    // Stage 5: full meta audit.
    let inventory_pages = db.active_pages().unwrap_or_default();
    report.pages_audited = inventory_pages.len();
    let issue_sets = audit::audit_pages(&inventory_pages);
    let meta_issue_count: usize = issue_sets.iter().map(|(_, issues)| issues.len()).sum();
    if let Err(e) = db.update_meta_issues(&issue_sets) {
        report.step_errors.push(format!("meta audit: {}", e));
    }

    // Stage 6: keyword coverage from cross-agent signals.
    let coverage = keyword_coverage(db, &search_client, &access_token, &deadline).await;
    report.keyword_gaps = coverage.iter().filter(|c| !c.has_organic_page).count();

    // Stage 7: stale-page sweep.
    let stale: Vec<&crate::db::Page> = inventory_pages
        .iter()
        .filter(|p| p.last_updated_at.is_none() || p.content_age_days.unwrap_or(0) > STALE_AGE_DAYS)
        .collect();
    report.stale_pages = stale.len();

    // Stage 8: trend snapshot and threshold signals.
    let trend = build_trend_snapshot(db, &today.to_string(), meta_issue_count as i64);
    match &trend {
        Ok(snapshot) => {
            if let Err(e) = db.insert_trend_snapshot(snapshot) {
                report.step_errors.push(format!("trend persist: {}", e));
            }
            if snapshot.new_broken_links > 0 {
                signals::emit(
                    db,
                    "new_broken_links",
                    serde_json::json!({"count": snapshot.new_broken_links}),
                );
            }
            if snapshot.traffic_change_pct < TRAFFIC_ALERT_PCT {
                signals::emit(
                    db,
                    "site_traffic_drop",
                    serde_json::json!({"changePct": snapshot.traffic_change_pct}),
                );
            }
        }
        Err(e) => report.step_errors.push(format!("trend: {}", e)),
    }

    // Stage 9: narrative digest, with a deterministic fallback.
    let traffic_mix = analytics_client
        .traffic_sources(&access_token, (&window.0, &window.1), &deadline)
        .await
        .map(|channels| {
            channels
                .iter()
                .map(|c| serde_json::json!({"channel": c.channel, "sessions": c.sessions}))
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|e| {
            report.step_errors.push(format!("traffic mix: {}", e));
            Vec::new()
        });

    let figures = serde_json::json!({
        "weekStart": week_ago.to_string(),
        "pagesAudited": report.pages_audited,
        "brokenLinksFound": report.broken_links_found,
        "linksResolved": report.links_resolved,
        "metaIssues": meta_issue_count,
        "stalePages": report.stale_pages,
        "trackingHealth": conversion.tracking_health,
        "trafficMix": traffic_mix,
        "keywordCoverage": coverage,
        "trend": trend.as_ref().ok().map(|t| serde_json::json!({
            "totalTraffic": t.total_traffic,
            "trafficChangePct": t.traffic_change_pct,
            "avgHealthScore": t.avg_health_score,
        })),
    });

    let model = LlmClient::new(&config.anthropic_api_key, &config.model);
    let summary = match model
        .complete(
            "You write the weekly website-health digest for the marketing team. \
             Summarize the figures you are given in plain prose, lead with what \
             changed, and keep it short.",
            &format!("This week's figures:\n{}", figures),
            DIGEST_MAX_TOKENS,
        )
        .await
    {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Digest generation failed, using fallback: {}", e);
            fallback_summary(&report, meta_issue_count)
        }
    };
    if let Err(e) = db.insert_weekly_digest(&week_ago.to_string(), &summary, &figures) {
        report.step_errors.push(format!("digest persist: {}", e));
    }

    report.duration_ms = deadline.elapsed_ms();
    report.success = true;

    if let Err(e) = db.append_change_log(
        "weekly_audit",
        &serde_json::json!({
            "pagesAudited": report.pages_audited,
            "brokenLinksFound": report.broken_links_found,
            "linksResolved": report.links_resolved,
            "keywordGaps": report.keyword_gaps,
            "stalePages": report.stale_pages,
            "durationMs": report.duration_ms,
            "stepErrors": report.step_errors,
        }),
        "executed",
        Some(signals::SOURCE_AGENT),
    ) {
        report.step_errors.push(format!("change log: {}", e));
    }
    signals::emit(
        db,
        "weekly_audit_complete",
        serde_json::json!({"pagesAudited": report.pages_audited}),
    );

    log::info!(
        "Weekly audit complete: {} pages, {} broken links, {} resolved, {} ms",
        report.pages_audited,
        report.broken_links_found,
        report.links_resolved,
        report.duration_ms
    );
    report
}

// ---------------------------------------------------------------------------
// Conversion audit
// ---------------------------------------------------------------------------

pub struct ConversionOutcome {
    pub tracking_health: &'static str,
    pub total_submissions: i64,
    pub gaps: Vec<String>,
    pub recommendations: serde_json::Value,
}

/// Cross-reference configured key events against CMS forms.
///
/// Matching is deliberately fuzzy: a form is covered by an event named
/// `form_submit_<normalized form name>`, or by the generic `form_submit` /
/// `generate_lead` events (which cover every form). This both over- and
/// under-matches; see DESIGN.md.
pub fn audit_conversions(key_events: &[String], forms: &[CmsForm]) -> ConversionOutcome {
    let total_submissions: i64 = forms.iter().map(|f| f.submission_count).sum();

    if key_events.is_empty() {
        let recommendations = serde_json::json!([{
            "priority": "critical",
            "title": "No conversion events configured",
            "description": format!(
                "{} form(s) collected {} submission(s) this period but analytics has no \
                 key events configured, so conversions are invisible to reporting.",
                forms.len(), total_submissions
            ),
        }]);
        return ConversionOutcome {
            tracking_health: "not_configured",
            total_submissions,
            gaps: forms.iter().map(|f| f.name.clone()).collect(),
            recommendations,
        };
    }

    let has_generic = key_events
        .iter()
        .any(|e| e == "form_submit" || e == "generate_lead");

    let gaps: Vec<String> = forms
        .iter()
        .filter(|form| {
            if has_generic {
                return false;
            }
            let expected = format!("form_submit_{}", util::normalize_name(&form.name));
            !key_events.iter().any(|e| *e == expected)
        })
        .map(|form| form.name.clone())
        .collect();

    let tracking_health = if gaps.is_empty() {
        "healthy"
    } else if gaps.len() < forms.len() {
        "degraded"
    } else {
        "broken"
    };

    let recommendations = if gaps.is_empty() {
        serde_json::json!([])
    } else {
        serde_json::json!([{
            "priority": "high",
            "title": "Forms without conversion tracking",
            "description": format!(
                "{} of {} form(s) have no matching key event: {}",
                gaps.len(), forms.len(), gaps.join(", ")
            ),
        }])
    };

    ConversionOutcome {
        tracking_health,
        total_submissions,
        gaps,
        recommendations,
    }
}

// ---------------------------------------------------------------------------
// Keyword coverage
// ---------------------------------------------------------------------------

/// Consume keyword signals from other producers and check each distinct
/// keyword for organic coverage (any ranking row at position <= 20).
async fn keyword_coverage(
    db: &HealthDb,
    search_client: &SearchClient,
    access_token: &str,
    deadline: &Deadline,
) -> Vec<KeywordCoverage> {
    let found = signals::query(
        db,
        &SignalQuery {
            source_agent: None,
            event_types: &["trending_search_term", "high_cpc_alert"],
            within_days: Some(30),
            limit: 50,
        },
    )
    .unwrap_or_default();

    let mut keywords: Vec<String> = Vec::new();
    for signal in &found {
        if let Some(keyword) = signal.payload_value()["keyword"].as_str() {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
    }

    let mut coverage = Vec::new();
    for keyword in keywords {
        match search_client
            .pages_for_keyword(access_token, &keyword, 30, deadline)
            .await
        {
            Ok(rows) => {
                let best = rows
                    .iter()
                    .min_by(|a, b| a.position.total_cmp(&b.position))
                    .map(|row| row.position);
                coverage.push(KeywordCoverage {
                    keyword,
                    has_organic_page: best.map(|p| p <= 20.0).unwrap_or(false),
                    position: best,
                });
            }
            Err(e) => {
                log::warn!("Keyword coverage query failed for '{}': {}", keyword, e);
                coverage.push(KeywordCoverage {
                    keyword,
                    has_organic_page: false,
                    position: None,
                });
            }
        }
    }
    coverage
}

// ---------------------------------------------------------------------------
// Trend snapshot
// ---------------------------------------------------------------------------

fn build_trend_snapshot(
    db: &HealthDb,
    snapshot_date: &str,
    meta_issues_count: i64,
) -> Result<TrendSnapshot, crate::db::DbError> {
    let analytics = db.latest_analytics_by_path()?;
    let pages = db.active_pages()?;
    let (broken_links_count, new_broken_links) = db.broken_link_counters()?;

    let total_traffic: i64 = analytics.iter().map(|a| a.active_users).sum();
    let prior = db.latest_trend_snapshot("weekly")?;
    let traffic_change_pct = match &prior {
        Some(prev) if prev.total_traffic > 0 => {
            100.0 * (total_traffic - prev.total_traffic) as f64 / prev.total_traffic as f64
        }
        _ => 0.0,
    };

    let scores: Vec<i64> = pages.iter().filter_map(|p| p.health_score).collect();
    let avg_health_score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<i64>() as f64 / scores.len() as f64)
    };

    // Movers ranked by per-page traffic change, joined through the path.
    let by_path: HashMap<String, f64> = analytics
        .iter()
        .map(|a| (a.page_url.clone(), a.traffic_change_pct))
        .collect();
    let mut movers: Vec<(String, f64)> = pages
        .iter()
        .filter_map(|p| {
            by_path
                .get(&util::url_path(&p.url))
                .map(|change| (p.url.clone(), *change))
        })
        .collect();
    movers.sort_by(|a, b| a.1.total_cmp(&b.1));
    let declining: Vec<serde_json::Value> = movers
        .iter()
        .take(5)
        .filter(|(_, change)| *change < 0.0)
        .map(|(url, change)| serde_json::json!({"url": url, "changePct": change}))
        .collect();
    let improving: Vec<serde_json::Value> = movers
        .iter()
        .rev()
        .take(5)
        .filter(|(_, change)| *change > 0.0)
        .map(|(url, change)| serde_json::json!({"url": url, "changePct": change}))
        .collect();

    Ok(TrendSnapshot {
        id: String::new(),
        period_type: "weekly".to_string(),
        snapshot_date: snapshot_date.to_string(),
        total_traffic,
        traffic_change_pct,
        avg_health_score,
        health_distribution: serde_json::json!(score_distribution(&scores)).to_string(),
        top_declining: serde_json::Value::Array(declining).to_string(),
        top_improving: serde_json::Value::Array(improving).to_string(),
        broken_links_count,
        new_broken_links,
        meta_issues_count,
    })
}

/// Five fixed buckets over the 0–100 score range.
fn score_distribution(scores: &[i64]) -> HashMap<&'static str, usize> {
    let mut buckets: HashMap<&'static str, usize> = HashMap::from([
        ("0-19", 0),
        ("20-39", 0),
        ("40-59", 0),
        ("60-79", 0),
        ("80-100", 0),
    ]);
    for score in scores {
        let bucket = match score {
            0..=19 => "0-19",
            20..=39 => "20-39",
            40..=59 => "40-59",
            60..=79 => "60-79",
            _ => "80-100",
        };
        *buckets.entry(bucket).or_insert(0) += 1;
    }
    buckets
}

fn fallback_summary(report: &WeeklyReport, meta_issues: usize) -> String {
    format!(
        "Weekly audit: {} pages audited, {} broken links found ({} resolved), \
         {} meta issues, {} stale pages, {} keyword gaps.",
        report.pages_audited,
        report.broken_links_found,
        report.links_resolved,
        meta_issues,
        report.stale_pages,
        report.keyword_gaps
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(name: &str, submissions: i64) -> CmsForm {
        CmsForm {
            id: format!("f-{}", name),
            name: name.to_string(),
            submission_count: submissions,
        }
    }

    #[test]
    fn test_no_key_events_is_not_configured() {
        let forms = vec![
            form("Contact Us", 12),
            form("Demo Request", 9),
            form("Newsletter", 7),
            form("Whitepaper", 5),
            form("Careers", 4),
        ];
        let outcome = audit_conversions(&[], &forms);
        assert_eq!(outcome.tracking_health, "not_configured");
        assert_eq!(outcome.total_submissions, 37);
        assert_eq!(outcome.gaps.len(), 5);

        let description = outcome.recommendations[0]["description"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(description.contains("37"), "recommendation cites the submission total");
        assert_eq!(outcome.recommendations[0]["priority"], "critical");
    }

    #[test]
    fn test_generic_event_covers_all_forms() {
        let forms = vec![form("Contact Us", 3), form("Demo Request", 8)];
        let events = vec!["generate_lead".to_string()];
        let outcome = audit_conversions(&events, &forms);
        assert_eq!(outcome.tracking_health, "healthy");
        assert!(outcome.gaps.is_empty());
    }

    #[test]
    fn test_partial_coverage_is_degraded() {
        let forms = vec![form("Contact Us", 3), form("Demo Request", 8)];
        let events = vec!["form_submit_contact_us".to_string()];
        let outcome = audit_conversions(&events, &forms);
        assert_eq!(outcome.tracking_health, "degraded");
        assert_eq!(outcome.gaps, vec!["Demo Request"]);
    }

    #[test]
    fn test_no_coverage_is_broken() {
        let forms = vec![form("Contact Us", 3)];
        let events = vec!["page_view".to_string()];
        let outcome = audit_conversions(&events, &forms);
        assert_eq!(outcome.tracking_health, "broken");
    }

    #[test]
    fn test_score_distribution_buckets() {
        let distribution = score_distribution(&[5, 25, 45, 65, 85, 100, 19, 20]);
        assert_eq!(distribution["0-19"], 2);
        assert_eq!(distribution["20-39"], 2);
        assert_eq!(distribution["40-59"], 1);
        assert_eq!(distribution["60-79"], 1);
        assert_eq!(distribution["80-100"], 2);
    }

    #[test]
    fn test_fallback_summary_is_one_line() {
        let report = WeeklyReport {
            pages_audited: 40,
            broken_links_found: 3,
            links_resolved: 1,
            stale_pages: 6,
            keyword_gaps: 2,
            ..Default::default()
        };
        let summary = fallback_summary(&report, 9);
        assert!(!summary.contains('\n'));
        assert!(summary.contains("40 pages"));
        assert!(summary.contains("3 broken links"));
    }
}
