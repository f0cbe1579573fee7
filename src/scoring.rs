//! Composite health scorer.
//!
//! Six independent dimensions sum to a 0–100 total. Each dimension buckets
//! its input; missing data scores a defined midpoint (or zero) rather than
//! poisoning the total. Pages under 50 are flagged for investigation; under
//! 30 they are critical.

use serde::{Deserialize, Serialize};

use crate::db::{AnalyticsSnapshot, Page, PageType, SearchSnapshot, SpeedScore};

/// Total below this flags the page for investigation.
pub const FLAG_THRESHOLD: i64 = 50;

/// Total below this marks the page critical.
pub const CRITICAL_THRESHOLD: i64 = 30;

/// Per-dimension scores. The persisted breakdown is exactly this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBreakdown {
    /// 0–20, from week-over-week active-user change.
    pub traffic_trend: i64,
    /// 0–20, from average search position.
    pub seo_ranking: i64,
    /// 0–20, from the Lighthouse performance score.
    pub page_speed: i64,
    /// 0–15, from content age.
    pub content_freshness: i64,
    /// 0–15, from form presence and page type.
    pub conversion_health: i64,
    /// 0–10, deductions from meta issues, broken links, and indexability.
    pub technical_health: i64,
}

impl HealthBreakdown {
    pub fn total(&self) -> i64 {
        self.traffic_trend
            + self.seo_ranking
            + self.page_speed
            + self.content_freshness
            + self.conversion_health
            + self.technical_health
    }

    pub fn is_flagged(&self) -> bool {
        self.total() < FLAG_THRESHOLD
    }

    pub fn is_critical(&self) -> bool {
        self.total() < CRITICAL_THRESHOLD
    }
}

/// Score one page from whatever source data is available.
pub fn score_page(
    page: &Page,
    analytics: Option<&AnalyticsSnapshot>,
    search: Option<&SearchSnapshot>,
    speed: Option<&SpeedScore>,
) -> HealthBreakdown {
    HealthBreakdown {
        traffic_trend: traffic_trend(analytics),
        seo_ranking: seo_ranking(search),
        page_speed: page_speed(speed),
        content_freshness: content_freshness(page.content_age_days),
        conversion_health: conversion_health(page),
        technical_health: technical_health(page),
    }
}

fn traffic_trend(analytics: Option<&AnalyticsSnapshot>) -> i64 {
    let Some(snap) = analytics else {
        return 10;
    };
    let change = snap.traffic_change_pct;
    if change >= 0.0 {
        20
    } else if change > -10.0 {
        15
    } else if change > -30.0 {
        8
    } else {
        0
    }
}

fn seo_ranking(search: Option<&SearchSnapshot>) -> i64 {
    let Some(position) = search.and_then(|s| s.avg_position) else {
        return 0;
    };
    if position <= 10.0 {
        20
    } else if position <= 20.0 {
        15
    } else if position <= 50.0 {
        8
    } else {
        0
    }
}

fn page_speed(speed: Option<&SpeedScore>) -> i64 {
    let Some(performance) = speed.and_then(|s| s.performance_score) else {
        return 10;
    };
    if performance >= 90 {
        20
    } else if performance >= 70 {
        15
    } else if performance >= 50 {
        8
    } else {
        0
    }
}

fn content_freshness(age_days: Option<i64>) -> i64 {
    let Some(age) = age_days else {
        return 0;
    };
    if age < 90 {
        15
    } else if age < 180 {
        10
    } else if age < 365 {
        5
    } else {
        0
    }
}

fn conversion_health(page: &Page) -> i64 {
    if page.has_form {
        5
    } else {
        match page.page_type {
            PageType::Blog => 10,
            PageType::Landing => 0,
            _ => 8,
        }
    }
}

fn technical_health(page: &Page) -> i64 {
    let issues = page.meta_issue_list();
    let mut score: i64 = 10;

    if issues.iter().any(|i| i == "missing_meta") {
        score -= 2;
    }
    if issues.iter().any(|i| i == "missing_title") {
        score -= 2;
    }
    if issues.iter().any(|i| i.starts_with("title_too_")) {
        score -= 1;
    }
    if issues.iter().any(|i| i.starts_with("duplicate_")) {
        score -= 1;
    }
    if page.has_broken_links {
        score -= 2;
    }
    if !page.is_indexed {
        score -= 2;
    }

    score.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        Page {
            id: "p1".to_string(),
            url: "https://x.com/pricing".to_string(),
            slug: Some("pricing".to_string()),
            title: Some("Pricing".to_string()),
            meta_description: Some("Plans.".to_string()),
            page_type: PageType::Site,
            cms_page_id: None,
            has_form: true,
            form_ids: r#"["f-1"]"#.to_string(),
            has_cta: false,
            cta_ids: "[]".to_string(),
            published_at: None,
            last_updated_at: None,
            content_age_days: Some(45),
            is_indexed: true,
            is_active: true,
            title_length: Some(7),
            meta_description_length: Some(6),
            meta_issues: "[]".to_string(),
            has_broken_links: false,
            broken_link_count: 0,
            health_score: None,
            health_breakdown: None,
            last_health_check_at: None,
        }
    }

    fn analytics(users: i64, previous: i64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            page_url: "/pricing".to_string(),
            snapshot_date: "2026-07-27".to_string(),
            active_users: users,
            sessions: users,
            page_views: users,
            bounce_rate: None,
            avg_session_duration: None,
            users_previous_period: previous,
            sessions_previous_period: previous,
            traffic_change_pct: AnalyticsSnapshot::compute_change_pct(users, previous),
        }
    }

    fn search(position: f64) -> SearchSnapshot {
        SearchSnapshot {
            page_url: "https://x.com/pricing".to_string(),
            snapshot_date: "2026-07-27".to_string(),
            total_clicks: 30,
            total_impressions: 800,
            avg_ctr: 0.0375,
            avg_position: Some(position),
            previous_clicks: 28,
            previous_impressions: 760,
            previous_ctr: 0.036,
            previous_position: Some(position + 1.0),
            position_change: 1.0,
        }
    }

    fn speed(performance: i64) -> SpeedScore {
        SpeedScore {
            id: "s1".to_string(),
            page_url: "https://x.com/pricing".to_string(),
            test_date: "2026-07-27".to_string(),
            strategy: "mobile".to_string(),
            performance_score: Some(performance),
            accessibility_score: Some(90),
            seo_score: Some(100),
            best_practices_score: Some(95),
            lcp_ms: None,
            fid_ms: None,
            cls: None,
            inp_ms: None,
            opportunities: "[]".to_string(),
        }
    }

    #[test]
    fn test_minor_decline_is_stable() {
        // active_users 110 vs 120 (−8.33%), position 8, performance 95,
        // updated 45 days ago, has a form, clean meta, indexed.
        let breakdown = score_page(
            &page(),
            Some(&analytics(110, 120)),
            Some(&search(8.0)),
            Some(&speed(95)),
        );
        assert_eq!(breakdown.traffic_trend, 15);
        assert_eq!(breakdown.seo_ranking, 20);
        assert_eq!(breakdown.page_speed, 20);
        assert_eq!(breakdown.content_freshness, 15);
        assert_eq!(breakdown.conversion_health, 5);
        assert_eq!(breakdown.technical_health, 10);
        assert_eq!(breakdown.total(), 85);
        assert!(!breakdown.is_flagged());
    }

    #[test]
    fn test_severe_decline_is_critical() {
        // active_users 50 vs 120 (−58.3%), position 25, performance 45,
        // 400 days stale, missing_meta + title_too_long.
        let mut stale = page();
        stale.content_age_days = Some(400);
        stale.meta_issues = r#"["missing_meta", "title_too_long"]"#.to_string();

        let breakdown = score_page(
            &stale,
            Some(&analytics(50, 120)),
            Some(&search(25.0)),
            Some(&speed(45)),
        );
        assert_eq!(breakdown.traffic_trend, 0);
        assert_eq!(breakdown.seo_ranking, 8);
        assert_eq!(breakdown.page_speed, 0);
        assert_eq!(breakdown.content_freshness, 0);
        assert_eq!(breakdown.conversion_health, 5);
        assert_eq!(breakdown.technical_health, 7);
        assert_eq!(breakdown.total(), 20);
        assert!(breakdown.is_flagged());
        assert!(breakdown.is_critical());
    }

    #[test]
    fn test_missing_data_defaults() {
        let mut bare = page();
        bare.content_age_days = None;
        bare.has_form = false;

        let breakdown = score_page(&bare, None, None, None);
        assert_eq!(breakdown.traffic_trend, 10);
        assert_eq!(breakdown.seo_ranking, 0);
        assert_eq!(breakdown.page_speed, 10);
        assert_eq!(breakdown.content_freshness, 0);
    }

    #[test]
    fn test_freshness_boundary_at_90_days() {
        assert_eq!(content_freshness(Some(89)), 15);
        assert_eq!(content_freshness(Some(90)), 10, "exactly 90 falls to the next bucket");
        assert_eq!(content_freshness(Some(180)), 5);
        assert_eq!(content_freshness(Some(365)), 0);
    }

    #[test]
    fn test_conversion_health_by_page_type() {
        let mut p = page();
        p.has_form = false;

        p.page_type = PageType::Blog;
        assert_eq!(conversion_health(&p), 10);
        p.page_type = PageType::Landing;
        assert_eq!(conversion_health(&p), 0);
        p.page_type = PageType::Site;
        assert_eq!(conversion_health(&p), 8);
        p.page_type = PageType::Pillar;
        assert_eq!(conversion_health(&p), 8);

        p.has_form = true;
        assert_eq!(conversion_health(&p), 5);
    }

    #[test]
    fn test_technical_health_floors_at_zero() {
        let mut wrecked = page();
        wrecked.meta_issues = r#"["missing_meta", "missing_title", "title_too_short",
            "duplicate_title", "duplicate_meta"]"#
            .to_string();
        wrecked.has_broken_links = true;
        wrecked.is_indexed = false;
        // 10 − 2 − 2 − 1 − 1 − 2 − 2 = 0; further deductions must not go negative.
        assert_eq!(technical_health(&wrecked), 0);
    }

    #[test]
    fn test_total_equals_sum_of_dimensions() {
        let breakdown = score_page(&page(), Some(&analytics(100, 90)), None, None);
        let sum = breakdown.traffic_trend
            + breakdown.seo_ranking
            + breakdown.page_speed
            + breakdown.content_freshness
            + breakdown.conversion_health
            + breakdown.technical_health;
        assert_eq!(breakdown.total(), sum);
    }

    #[test]
    fn test_traffic_trend_boundaries() {
        let at_zero = analytics(100, 100);
        assert_eq!(traffic_trend(Some(&at_zero)), 20);
        let down_ten = analytics(90, 100);
        assert_eq!(traffic_trend(Some(&down_ten)), 8, "exactly −10% falls through");
        let down_thirty = analytics(70, 100);
        assert_eq!(traffic_trend(Some(&down_thirty)), 0, "exactly −30% scores zero");
    }
}
