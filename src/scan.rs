//! The scheduled scan: refresh signals, score pages, escalate the worst.
//!
//! Twelve stages run against a 120 s wall-clock budget. A stage that fails
//! records a step-error string and the run moves on; only losing the access
//! token up front aborts, because most of the pipeline is unusable without
//! it. Stage order is fixed (later stages consume earlier outputs); inside a
//! stage, network fan-out is bounded by the adapter caps.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::agent::llm::LlmClient;
use crate::agent::tools::ToolContext;
use crate::agent::{self, FlaggedPage, InvestigationOutcome};
use crate::audit;
use crate::config::Config;
use crate::db::{
    AnalyticsSnapshot, HealthDb, LinkHealthRecord, Page, PageType, SearchSnapshot, SpeedScore,
};
use crate::inventory;
use crate::scoring::{self, HealthBreakdown};
use crate::signals;
use crate::sources::analytics::AnalyticsClient;
use crate::sources::cms::CmsClient;
use crate::sources::links::LinkChecker;
use crate::sources::search::SearchClient;
use crate::sources::speed::SpeedClient;
use crate::token::TokenBroker;
use crate::util::{self, Deadline};

/// Global wall-clock budget for one scan.
pub const SCAN_BUDGET: Duration = Duration::from_secs(120);

/// Speed spot-checks stop starting once this much of the budget is gone.
const SPEED_CUTOFF_MS: u64 = 50_000;

/// The agent loop only starts while under this elapsed bound.
const AGENT_CUTOFF_MS: u64 = 80_000;

/// Pages speed-tested per scan.
const SPEED_SPOT_CHECKS: usize = 2;

/// URLs link-checked per scan.
const LINK_CHECK_URLS: usize = 15;

/// What one scan did, returned to the trigger caller and logged.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub success: bool,
    pub pages_scanned: usize,
    pub pages_flagged: usize,
    pub findings_created: usize,
    pub skipped: usize,
    pub broken_links_found: usize,
    pub meta_issues_found: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub step_errors: Vec<String>,
}

/// Run the full scan pipeline.
pub async fn run_scan(config: &Config, db: &HealthDb) -> ScanReport {
    let deadline = Deadline::new(SCAN_BUDGET);
    let mut report = ScanReport::default();

    let broker = TokenBroker::new(config);
    let analytics_client = AnalyticsClient::new(&config.analytics_property_id);
    let search_client = SearchClient::new(&config.search_site_url);
    let speed_client = SpeedClient::new(&config.pagespeed_api_key);
    let cms_client = CmsClient::new(&config.hubspot_token);
    let link_checker = LinkChecker::new();

    // Stage 1: token + inventory. Token loss is the one fatal stage.
    let access_token = match broker.access_token(db).await {
        Ok(token) => token,
        Err(e) => {
            log::error!("Scan aborted, token acquisition failed: {}", e);
            report.step_errors.push(format!("token: {}", e));
            report.duration_ms = deadline.elapsed_ms();
            return report;
        }
    };
    let mut inventory_pages = match db.active_pages() {
        Ok(pages) => pages,
        Err(e) => {
            report.step_errors.push(format!("inventory: {}", e));
            Vec::new()
        }
    };

    // Stage 2: comparison windows.
    let today = Utc::now().date_naive();
    let week_ago = today - ChronoDuration::days(7);
    let two_weeks_ago = today - ChronoDuration::days(14);
    let current = (week_ago.to_string(), today.to_string());
    let previous = (two_weeks_ago.to_string(), week_ago.to_string());
    let snapshot_date = today.to_string();

    // Stage 3: search snapshots.
    match search_client
        .page_performance(
            &access_token,
            (&current.0, &current.1),
            (&previous.0, &previous.1),
            &deadline,
        )
        .await
    {
        Ok(rows) => {
            let snapshots: Vec<SearchSnapshot> = rows
                .into_iter()
                .map(|perf| SearchSnapshot {
                    page_url: perf.page_url,
                    snapshot_date: snapshot_date.clone(),
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
            match db.upsert_search_snapshots(&snapshots) {
                Ok(written) => log::info!("Search snapshots: {} rows", written),
                Err(e) => report.step_errors.push(format!("search upsert: {}", e)),
            }
        }
        Err(e) => report.step_errors.push(format!("search: {}", e)),
    }

    // Stage 4: analytics snapshots.
    match analytics_client
        .page_metrics(
            &access_token,
            (&current.0, &current.1),
            (&previous.0, &previous.1),
            &deadline,
        )
        .await
    {
        Ok(rows) => {
            let snapshots: Vec<AnalyticsSnapshot> = rows
                .into_iter()
                .map(|metrics| AnalyticsSnapshot {
                    page_url: metrics.page_path,
                    snapshot_date: snapshot_date.clone(),
                    active_users: metrics.active_users,
                    sessions: metrics.sessions,
                    page_views: metrics.page_views,
                    bounce_rate: metrics.bounce_rate,
                    avg_session_duration: metrics.avg_session_duration,
                    users_previous_period: metrics.previous_users,
                    sessions_previous_period: metrics.previous_sessions,
                    traffic_change_pct: AnalyticsSnapshot::compute_change_pct(
                        metrics.active_users,
                        metrics.previous_users,
                    ),
                })
                .collect();
            match db.upsert_analytics_snapshots(&snapshots) {
                Ok(written) => log::info!("Analytics snapshots: {} rows", written),
                Err(e) => report.step_errors.push(format!("analytics upsert: {}", e)),
            }
        }
        Err(e) => report.step_errors.push(format!("analytics: {}", e)),
    }

    // Stage 5: speed spot checks, cut short past the 50 s mark.
    let mut speed_this_run: HashMap<String, SpeedScore> = HashMap::new();
    for candidate in speed_candidates(db, &inventory_pages, SPEED_SPOT_CHECKS) {
        if deadline.elapsed_ms() > SPEED_CUTOFF_MS {
            log::warn!("Speed spot checks cut short at {} ms", deadline.elapsed_ms());
            break;
        }
        match speed_client.run_audit(&candidate, "mobile", &deadline).await {
            Ok(audit_result) => {
                let score = SpeedScore {
                    id: String::new(),
                    page_url: audit_result.page_url.clone(),
                    test_date: snapshot_date.clone(),
                    strategy: audit_result.strategy.clone(),
                    performance_score: audit_result.performance_score,
                    accessibility_score: audit_result.accessibility_score,
                    seo_score: audit_result.seo_score,
                    best_practices_score: audit_result.best_practices_score,
                    lcp_ms: audit_result.lcp_ms,
                    fid_ms: audit_result.fid_ms,
                    cls: audit_result.cls,
                    inp_ms: audit_result.inp_ms,
                    opportunities: serde_json::to_string(&audit_result.opportunities)
                        .unwrap_or_else(|_| "[]".into()),
                };
                if let Err(e) = db.insert_speed_score(&score) {
                    report.step_errors.push(format!("speed persist: {}", e));
                }
                speed_this_run.insert(candidate.clone(), score);
            }
            Err(e) => report.step_errors.push(format!("speed {}: {}", candidate, e)),
        }
    }

    // Stage 6: CMS sync + reload + form supplement.
    match inventory::sync_pages(db, &cms_client, &link_checker, &deadline).await {
        Ok((outcome, reloaded)) => {
            log::info!(
                "Inventory: {} pages active after sync ({} new)",
                reloaded.len(),
                outcome.inserted
            );
            inventory_pages = reloaded;
        }
        Err(e) => report.step_errors.push(format!("cms sync: {}", e)),
    }

    // Stage 7: broken-link spot check.
    match link_checker.sitemap_urls(&config.site_origin, &deadline).await {
        Ok(sitemap) => {
            let targets = link_targets(db, &inventory_pages, &sitemap, LINK_CHECK_URLS);
            let results = link_checker.check_urls(&targets, &deadline).await;
            let now = Utc::now().to_rfc3339();
            let mut broken_by_page: HashMap<String, i64> = HashMap::new();

            for check in &results {
                if check.is_broken {
                    report.broken_links_found += 1;
                }
                // Sitemap-driven sweeps record the URL's own health: source
                // and target are the same URL.
                let record = LinkHealthRecord {
                    source_page_url: check.target_url.clone(),
                    target_url: check.target_url.clone(),
                    link_type: if check.target_url.starts_with(&config.site_origin) {
                        "internal".to_string()
                    } else {
                        "external".to_string()
                    },
                    http_status: check.http_status,
                    is_broken: check.is_broken,
                    is_redirect: check.is_redirect,
                    redirect_chain: serde_json::to_string(&check.redirect_chain)
                        .unwrap_or_else(|_| "[]".into()),
                    redirect_count: check.redirect_chain.len().saturating_sub(1) as i64,
                    error_message: check.error_message.clone(),
                    first_detected_at: now.clone(),
                    last_checked_at: now.clone(),
                    is_resolved: false,
                    resolved_at: None,
                };
                if let Err(e) = db.upsert_link_health(&record) {
                    report.step_errors.push(format!("link persist: {}", e));
                }

                *broken_by_page.entry(check.target_url.clone()).or_insert(0) +=
                    check.is_broken as i64;
            }

            let page_counts: Vec<(String, i64)> = inventory_pages
                .iter()
                .filter_map(|p| broken_by_page.get(&p.url).map(|c| (p.url.clone(), *c)))
                .collect();
            if let Err(e) = db.update_broken_link_counts(&page_counts) {
                report.step_errors.push(format!("broken-link counts: {}", e));
            }
        }
        Err(e) => report.step_errors.push(format!("links: {}", e)),
    }

    // Stage 8: meta audit over the post-sync inventory.
    let issue_sets = audit::audit_pages(&inventory_pages);
    report.meta_issues_found = issue_sets.iter().map(|(_, issues)| issues.len()).sum();
    if let Err(e) = db.update_meta_issues(&issue_sets) {
        report.step_errors.push(format!("meta audit: {}", e));
    }

    // Stage 9: score everything. Reload so stages 7–8 are reflected.
    let scored_inventory = db.active_pages().unwrap_or(inventory_pages);
    report.pages_scanned = scored_inventory.len();

    let mut flagged = score_inventory(db, &scored_inventory, &speed_this_run, &mut report);

    // Stage 10: worst first.
    flagged.sort_by_key(|f| f.breakdown.total());
    report.pages_flagged = flagged.len();

    // Stage 11: investigations, only while there is budget to do them well.
    if deadline.elapsed_ms() < AGENT_CUTOFF_MS {
        let model = LlmClient::new(&config.anthropic_api_key, &config.model);
        let tool_ctx = ToolContext {
            db,
            access_token: &access_token,
            analytics: &analytics_client,
            search: &search_client,
            speed: &speed_client,
            cms: &cms_client,
            deadline: &deadline,
        };
        for page in flagged.iter().take(config.max_investigations) {
            match agent::investigate(db, page, &tool_ctx, &model).await {
                Ok(InvestigationOutcome::Submitted { finding_id, .. }) => {
                    log::info!("Finding drafted for {}: {}", page.page.url, finding_id);
                    report.findings_created += 1;
                }
                Ok(InvestigationOutcome::Skipped { .. })
                | Ok(InvestigationOutcome::Deduped) => report.skipped += 1,
                Err(e) => report.step_errors.push(format!("agent {}: {}", page.page.url, e)),
            }
        }
    } else if !flagged.is_empty() {
        log::warn!(
            "Agent loop skipped, {} ms elapsed at entry",
            deadline.elapsed_ms()
        );
        report.skipped += flagged.len().min(config.max_investigations);
    }

    // Stage 12: bookkeeping, change log, completion signal.
    match db.resolve_recovered_findings(scoring::FLAG_THRESHOLD) {
        Ok(resolved) if resolved > 0 => {
            log::info!("Auto-resolved {} finding(s) on recovered pages", resolved);
        }
        Ok(_) => {}
        Err(e) => report.step_errors.push(format!("auto-resolution: {}", e)),
    }
    match db.expire_stale_reviews() {
        Ok((findings, queue)) if findings + queue > 0 => {
            log::info!("Expired {} findings, {} queue items", findings, queue);
        }
        Ok(_) => {}
        Err(e) => report.step_errors.push(format!("expiry sweep: {}", e)),
    }

    report.duration_ms = deadline.elapsed_ms();
    report.success = true;

    if let Err(e) = db.append_change_log(
        "health_scan",
        &serde_json::json!({
            "pagesScanned": report.pages_scanned,
            "pagesFlagged": report.pages_flagged,
            "findingsCreated": report.findings_created,
            "skipped": report.skipped,
            "brokenLinksFound": report.broken_links_found,
            "metaIssuesFound": report.meta_issues_found,
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
        "health_scan_complete",
        serde_json::json!({
            "pagesScanned": report.pages_scanned,
            "pagesFlagged": report.pages_flagged,
            "findingsCreated": report.findings_created,
        }),
    );

    log::info!(
        "Scan complete: {} pages, {} flagged, {} findings, {} ms",
        report.pages_scanned,
        report.pages_flagged,
        report.findings_created,
        report.duration_ms
    );
    report
}

/// Spot-check candidates by priority: never tested, then lowest-scored, then
/// landing pages, then anything active. Deduped, first `limit` kept.
fn speed_candidates(db: &HealthDb, inventory_pages: &[Page], limit: usize) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let push = |url: &str, candidates: &mut Vec<String>| {
        if candidates.len() < limit && !candidates.iter().any(|c| c == url) {
            candidates.push(url.to_string());
        }
    };

    if let Ok(never_tested) = db.pages_never_speed_tested(limit) {
        for page in never_tested {
            push(&page.url, &mut candidates);
        }
    }
    if let Ok(lowest) = db.lowest_scored_pages(limit) {
        for page in lowest {
            push(&page.url, &mut candidates);
        }
    }
    for page in inventory_pages.iter().filter(|p| p.page_type == PageType::Landing) {
        push(&page.url, &mut candidates);
    }
    for page in inventory_pages {
        push(&page.url, &mut candidates);
    }

    candidates.truncate(limit);
    candidates
}

/// Link-check targets by priority: previously broken, then landing pages,
/// then sitemap order. Deduped, first `limit` kept.
fn link_targets(
    db: &HealthDb,
    inventory_pages: &[Page],
    sitemap: &[String],
    limit: usize,
) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    let push = |url: &str, targets: &mut Vec<String>| {
        if targets.len() < limit && !targets.iter().any(|t| t == url) {
            targets.push(url.to_string());
        }
    };

    if let Ok(previously_broken) = db.broken_link_targets() {
        for url in previously_broken {
            push(&url, &mut targets);
        }
    }
    for page in inventory_pages.iter().filter(|p| p.page_type == PageType::Landing) {
        push(&page.url, &mut targets);
    }
    for url in sitemap {
        push(url, &mut targets);
    }

    targets.truncate(limit);
    targets
}

/// Score every page, persist, and collect the flagged set with its context.
fn score_inventory(
    db: &HealthDb,
    pages: &[Page],
    speed_this_run: &HashMap<String, SpeedScore>,
    report: &mut ScanReport,
) -> Vec<FlaggedPage> {
    // Analytics keys by path; search by trailing-slash-normalized URL; speed
    // prefers this run's audits over history.
    let analytics_by_path: HashMap<String, AnalyticsSnapshot> = db
        .latest_analytics_by_path()
        .unwrap_or_default()
        .into_iter()
        .map(|snap| (snap.page_url.clone(), snap))
        .collect();
    let search_by_url: HashMap<String, SearchSnapshot> = db
        .latest_search_by_url()
        .unwrap_or_default()
        .into_iter()
        .map(|snap| (util::strip_trailing_slash(&snap.page_url).to_string(), snap))
        .collect();
    let speed_by_url: HashMap<String, SpeedScore> = db
        .latest_speed_by_url()
        .unwrap_or_default()
        .into_iter()
        .map(|score| (score.page_url.clone(), score))
        .collect();

    let mut unparseable_urls = 0usize;
    let mut persisted: Vec<(String, i64, String)> = Vec::new();
    let mut flagged = Vec::new();

    for page in pages {
        if url::Url::parse(&page.url).is_err() {
            // The raw-string fallback never matches an analytics path.
            unparseable_urls += 1;
        }
        let path = util::url_path(&page.url);
        let analytics = analytics_by_path.get(&path);
        let search = search_by_url.get(util::strip_trailing_slash(&page.url));
        let speed = speed_this_run
            .get(&page.url)
            .or_else(|| speed_by_url.get(&page.url));

        let breakdown = scoring::score_page(page, analytics, search, speed);
        persisted.push((
            page.url.clone(),
            breakdown.total(),
            serde_json::to_string(&breakdown).unwrap_or_else(|_| "{}".into()),
        ));

        if breakdown.is_flagged() {
            flagged.push(FlaggedPage {
                page: page.clone(),
                breakdown,
                flag_reasons: flag_reasons(&breakdown, analytics),
                analytics: analytics.cloned(),
                search: search.cloned(),
                speed: speed.cloned(),
            });
        }
    }

    if unparseable_urls > 0 {
        log::warn!(
            "{} page URL(s) failed to parse; their analytics join uses the raw string",
            unparseable_urls
        );
    }

    if let Err(e) = db.update_health_scores(&persisted) {
        report.step_errors.push(format!("score persist: {}", e));
    }

    flagged
}

/// Human-readable reasons shown in the investigation prompt.
fn flag_reasons(
    breakdown: &HealthBreakdown,
    analytics: Option<&AnalyticsSnapshot>,
) -> Vec<String> {
    let mut reasons = Vec::new();
    if breakdown.traffic_trend <= 8 {
        match analytics {
            Some(snap) => reasons.push(format!(
                "traffic down {:.1}% week over week",
                -snap.traffic_change_pct
            )),
            None => reasons.push("traffic trend weak or unknown".to_string()),
        }
    }
    if breakdown.seo_ranking == 0 {
        reasons.push("no meaningful search ranking".to_string());
    }
    if breakdown.page_speed == 0 {
        reasons.push("page speed critically low".to_string());
    }
    if breakdown.content_freshness == 0 {
        reasons.push("content stale for a year or more".to_string());
    }
    if breakdown.technical_health <= 5 {
        reasons.push("multiple technical issues".to_string());
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pages::PageUpsert;
    use crate::db::testing::scratch_db;

    fn seed_page(db: &HealthDb, url: &str, page_type: PageType) {
        db.insert_pages(&[PageUpsert {
            url: url.to_string(),
            slug: None,
            title: Some("A perfectly reasonable page title here".to_string()),
            meta_description: Some(
                "A meta description comfortably long enough to pass the lower bound check."
                    .to_string(),
            ),
            page_type,
            cms_page_id: None,
            has_form: true,
            form_ids: vec!["f-1".to_string()],
            has_cta: false,
            cta_ids: vec![],
            published_at: None,
            last_updated_at: Some(Utc::now().to_rfc3339()),
            content_age_days: Some(10),
        }])
        .expect("seed");
    }

    #[test]
    fn test_speed_candidates_prefer_untested_and_dedupe() {
        let db = scratch_db();
        seed_page(&db, "https://x.com/a", PageType::Site);
        seed_page(&db, "https://x.com/demo", PageType::Landing);

        let pages = db.active_pages().expect("pages");
        let candidates = speed_candidates(&db, &pages, 2);
        assert_eq!(candidates.len(), 2);
        let mut sorted = candidates.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), 2, "no duplicates");
    }

    #[test]
    fn test_link_targets_put_previously_broken_first() {
        let db = scratch_db();
        seed_page(&db, "https://x.com/demo", PageType::Landing);
        let now = Utc::now().to_rfc3339();
        db.upsert_link_health(&LinkHealthRecord {
            source_page_url: "https://x.com/gone".to_string(),
            target_url: "https://x.com/gone".to_string(),
            link_type: "internal".to_string(),
            http_status: Some(404),
            is_broken: true,
            is_redirect: false,
            redirect_chain: "[]".to_string(),
            redirect_count: 0,
            error_message: None,
            first_detected_at: now.clone(),
            last_checked_at: now,
            is_resolved: false,
            resolved_at: None,
        })
        .expect("seed link");

        let pages = db.active_pages().expect("pages");
        let sitemap = vec![
            "https://x.com/".to_string(),
            "https://x.com/demo".to_string(),
        ];
        let targets = link_targets(&db, &pages, &sitemap, 15);
        assert_eq!(targets[0], "https://x.com/gone");
        assert_eq!(targets[1], "https://x.com/demo", "landing page before sitemap order");
        assert_eq!(targets.iter().filter(|t| *t == "https://x.com/demo").count(), 1);
    }

    #[test]
    fn test_score_inventory_joins_analytics_by_path() {
        let db = scratch_db();
        seed_page(&db, "https://x.com/pricing", PageType::Site);
        db.upsert_analytics_snapshots(&[AnalyticsSnapshot {
            page_url: "/pricing".to_string(),
            snapshot_date: "2026-07-27".to_string(),
            active_users: 50,
            sessions: 52,
            page_views: 90,
            bounce_rate: None,
            avg_session_duration: None,
            users_previous_period: 120,
            sessions_previous_period: 125,
            traffic_change_pct: AnalyticsSnapshot::compute_change_pct(50, 120),
        }])
        .expect("analytics");

        let pages = db.active_pages().expect("pages");
        let mut report = ScanReport::default();
        let flagged = score_inventory(&db, &pages, &HashMap::new(), &mut report);

        // Traffic 0 + seo 0 + speed 10 + freshness 15 + conversion 5 + technical 10 = 40.
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].breakdown.total(), 40);
        assert_eq!(flagged[0].breakdown.traffic_trend, 0, "analytics joined by path");
        assert!(flagged[0]
            .flag_reasons
            .iter()
            .any(|r| r.contains("58.3")));

        let stored = db
            .get_page_by_url("https://x.com/pricing")
            .expect("get")
            .expect("present");
        assert_eq!(stored.health_score, Some(40));
        assert!(stored.last_health_check_at.is_some());
    }

    #[test]
    fn test_search_join_normalizes_trailing_slash() {
        let db = scratch_db();
        seed_page(&db, "https://x.com/pricing", PageType::Site);
        db.upsert_search_snapshots(&[SearchSnapshot {
            page_url: "https://x.com/pricing/".to_string(),
            snapshot_date: "2026-07-27".to_string(),
            total_clicks: 40,
            total_impressions: 900,
            avg_ctr: 0.044,
            avg_position: Some(6.0),
            previous_clicks: 35,
            previous_impressions: 850,
            previous_ctr: 0.041,
            previous_position: Some(7.0),
            position_change: 1.0,
        }])
        .expect("search");

        let pages = db.active_pages().expect("pages");
        let mut report = ScanReport::default();
        score_inventory(&db, &pages, &HashMap::new(), &mut report);

        let stored = db
            .get_page_by_url("https://x.com/pricing")
            .expect("get")
            .expect("present");
        // seo 20 proves the slash-normalized join landed:
        // 10 + 20 + 10 + 15 + 5 + 10 = 70.
        assert_eq!(stored.health_score, Some(70));
    }
}
