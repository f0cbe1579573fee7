//! Prompt construction for the investigation loop.

use super::FlaggedPage;

/// System prompt framing the investigation contract.
pub const SYSTEM_PROMPT: &str = "You are the website-health investigator for a single marketing \
site. You are given one flagged page and a closed set of tools. Investigate why the page's \
health score dropped, then end the investigation by calling exactly one terminal tool: \
submit_finding when you can recommend a concrete, reviewable action, or skip_finding with a \
reason when you cannot. Ground every claim in tool output; do not speculate beyond the data. \
Before submit_finding, pre-flight your recommendation with evaluate_recommendation and respect \
a blocking result. You have a budget of 6 tool calls; spend them on the dimensions that \
actually lost points.";

/// Render the flagged-page context into the opening user message.
pub fn initial_prompt(flagged: &FlaggedPage) -> String {
    let page = &flagged.page;
    let breakdown = &flagged.breakdown;

    let mut prompt = String::with_capacity(2048);
    prompt.push_str(&format!(
        "Investigate this flagged page.\n\n\
         URL: {}\n\
         Type: {}\n\
         Title: {}\n",
        page.url,
        page.page_type.as_str(),
        page.title.as_deref().unwrap_or("(none)"),
    ));

    prompt.push_str(&format!(
        "\nHealth score: {} / 100 (flagged below 50)\n\
         - traffic trend: {} / 20\n\
         - seo ranking: {} / 20\n\
         - page speed: {} / 20\n\
         - content freshness: {} / 15\n\
         - conversion health: {} / 15\n\
         - technical health: {} / 10\n",
        breakdown.total(),
        breakdown.traffic_trend,
        breakdown.seo_ranking,
        breakdown.page_speed,
        breakdown.content_freshness,
        breakdown.conversion_health,
        breakdown.technical_health,
    ));

    if !flagged.flag_reasons.is_empty() {
        prompt.push_str("\nFlag reasons:\n");
        for reason in &flagged.flag_reasons {
            prompt.push_str(&format!("- {}\n", reason));
        }
    }

    prompt.push_str(&format!(
        "\nPage facts:\n\
         - last updated: {}\n\
         - has form: {}\n\
         - meta issues: {}\n\
         - broken links: {}\n",
        page.last_updated_at.as_deref().unwrap_or("unknown"),
        page.has_form,
        if page.meta_issue_list().is_empty() {
            "none".to_string()
        } else {
            page.meta_issue_list().join(", ")
        },
        if page.has_broken_links {
            format!("yes ({})", page.broken_link_count)
        } else {
            "none".to_string()
        },
    ));

    if let Some(analytics) = &flagged.analytics {
        prompt.push_str(&format!(
            "\nAnalytics (last 7d vs prior 7d): active users {} vs {} ({:+.1}%), \
             sessions {}, page views {}\n",
            analytics.active_users,
            analytics.users_previous_period,
            analytics.traffic_change_pct,
            analytics.sessions,
            analytics.page_views,
        ));
    } else {
        prompt.push_str("\nAnalytics: no data for this page\n");
    }

    if let Some(search) = &flagged.search {
        prompt.push_str(&format!(
            "Search: {} clicks, {} impressions, avg position {} (change {:+.1}, positive = improved)\n",
            search.total_clicks,
            search.total_impressions,
            search
                .avg_position
                .map(|p| format!("{:.1}", p))
                .unwrap_or_else(|| "n/a".to_string()),
            search.position_change,
        ));
    } else {
        prompt.push_str("Search: no data for this page\n");
    }

    if let Some(speed) = &flagged.speed {
        prompt.push_str(&format!(
            "Speed ({}): performance {}, LCP {} ms\n",
            speed.strategy,
            speed
                .performance_score
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            speed
                .lcp_ms
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|| "n/a".to_string()),
        ));
    } else {
        prompt.push_str("Speed: no recent audit\n");
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AnalyticsSnapshot, Page, PageType};
    use crate::scoring::HealthBreakdown;

    fn flagged() -> FlaggedPage {
        FlaggedPage {
            page: Page {
                id: "p1".to_string(),
                url: "https://x.com/pricing".to_string(),
                slug: None,
                title: Some("Pricing".to_string()),
                meta_description: None,
                page_type: PageType::Site,
                cms_page_id: None,
                has_form: true,
                form_ids: "[]".to_string(),
                has_cta: false,
                cta_ids: "[]".to_string(),
                published_at: None,
                last_updated_at: Some("2025-06-01T00:00:00Z".to_string()),
                content_age_days: Some(420),
                is_indexed: true,
                is_active: true,
                title_length: Some(7),
                meta_description_length: None,
                meta_issues: r#"["missing_meta"]"#.to_string(),
                has_broken_links: false,
                broken_link_count: 0,
                health_score: Some(42),
                health_breakdown: None,
                last_health_check_at: None,
            },
            breakdown: HealthBreakdown {
                traffic_trend: 8,
                seo_ranking: 8,
                page_speed: 10,
                content_freshness: 0,
                conversion_health: 5,
                technical_health: 8,
            },
            flag_reasons: vec!["traffic down 22% week over week".to_string()],
            analytics: Some(AnalyticsSnapshot {
                page_url: "/pricing".to_string(),
                snapshot_date: "2026-07-27".to_string(),
                active_users: 78,
                sessions: 81,
                page_views: 140,
                bounce_rate: None,
                avg_session_duration: None,
                users_previous_period: 100,
                sessions_previous_period: 104,
                traffic_change_pct: -22.0,
            }),
            search: None,
            speed: None,
        }
    }

    #[test]
    fn test_initial_prompt_includes_context() {
        let prompt = initial_prompt(&flagged());
        assert!(prompt.contains("https://x.com/pricing"));
        assert!(prompt.contains("Health score: 39 / 100"));
        assert!(prompt.contains("traffic down 22%"));
        assert!(prompt.contains("missing_meta"));
        assert!(prompt.contains("78 vs 100"));
        assert!(prompt.contains("Search: no data"));
        assert!(prompt.contains("Speed: no recent audit"));
    }
}
