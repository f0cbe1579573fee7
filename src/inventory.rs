//! Page inventory reconciliation against the CMS.
//!
//! Sync protocol: fetch the union of page families, diff against the active
//! inventory by URL, write updates and inserts in bounded batches, reload,
//! then supplement form detection by fetching live landing pages that the
//! widget parse left with `has_form = false`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::pages::PageUpsert;
use crate::db::{DbError, HealthDb, Page};
use crate::sources::cms::{CmsClient, CmsPage};
use crate::sources::links::LinkChecker;
use crate::sources::SourceError;
use crate::util::Deadline;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("CMS: {0}")]
    Source(#[from] SourceError),

    #[error("Storage: {0}")]
    Db(#[from] DbError),
}

/// What one reconciliation run did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub forms_detected: usize,
}

/// Run the full CMS reconciliation. Returns the outcome and the reloaded
/// active inventory (with form supplements already reflected).
pub async fn sync_pages(
    db: &HealthDb,
    cms: &CmsClient,
    checker: &LinkChecker,
    deadline: &Deadline,
) -> Result<(SyncOutcome, Vec<Page>), SyncError> {
    let cms_pages = cms.all_pages(deadline).await?;
    let mut outcome = SyncOutcome {
        fetched: cms_pages.len(),
        ..Default::default()
    };

    let existing: HashMap<String, Page> = db
        .active_pages()?
        .into_iter()
        .map(|p| (p.url.clone(), p))
        .collect();

    let now = Utc::now();
    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    for cms_page in &cms_pages {
        let upsert = to_upsert(cms_page, now);
        if existing.contains_key(&cms_page.url) {
            updates.push(upsert);
        } else {
            inserts.push(upsert);
        }
    }

    outcome.updated = db.update_pages(&updates)?;
    outcome.inserted = db.insert_pages(&inserts)?;
    log::info!(
        "CMS sync: {} fetched, {} updated, {} inserted",
        outcome.fetched,
        outcome.updated,
        outcome.inserted
    );

    let mut inventory = db.active_pages()?;

    // Form-detection supplement: widget parsing misses forms embedded via
    // raw HTML modules, so landing pages still marked formless get a live
    // fetch.
    let candidates: Vec<String> = inventory
        .iter()
        .filter(|p| p.page_type == crate::db::PageType::Landing && !p.has_form)
        .map(|p| p.url.clone())
        .collect();

    if !candidates.is_empty() {
        let detections = checker.detect_html_forms(&candidates, deadline).await;
        for (url, found) in detections {
            if found {
                db.set_page_has_form(&url, true)?;
                if let Some(page) = inventory.iter_mut().find(|p| p.url == url) {
                    page.has_form = true;
                }
                outcome.forms_detected += 1;
            }
        }
        if outcome.forms_detected > 0 {
            log::info!(
                "Form supplement: detected forms on {} landing page(s)",
                outcome.forms_detected
            );
        }
    }

    Ok((outcome, inventory))
}

fn to_upsert(cms_page: &CmsPage, now: DateTime<Utc>) -> PageUpsert {
    PageUpsert {
        url: cms_page.url.clone(),
        slug: cms_page.slug.clone(),
        title: cms_page.title.clone(),
        meta_description: cms_page.meta_description.clone(),
        page_type: cms_page.page_type,
        cms_page_id: Some(cms_page.cms_id.clone()),
        has_form: !cms_page.form_ids.is_empty(),
        form_ids: cms_page.form_ids.clone(),
        has_cta: !cms_page.cta_ids.is_empty(),
        cta_ids: cms_page.cta_ids.clone(),
        published_at: cms_page.published_at.clone(),
        last_updated_at: cms_page.updated_at.clone(),
        content_age_days: content_age_days(cms_page.updated_at.as_deref(), now),
    }
}

/// Whole days since the last content update; `None` when the CMS never
/// reported one.
pub fn content_age_days(last_updated_at: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    let updated = DateTime::parse_from_rfc3339(last_updated_at?).ok()?;
    let age = now.signed_duration_since(updated.with_timezone(&Utc));
    Some(age.num_days().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_content_age_days() {
        let now = Utc::now();
        let forty_five = (now - Duration::days(45) - Duration::hours(3)).to_rfc3339();
        assert_eq!(content_age_days(Some(&forty_five), now), Some(45));
        assert_eq!(content_age_days(None, now), None);
        assert_eq!(content_age_days(Some("garbage"), now), None);
    }

    #[test]
    fn test_content_age_never_negative() {
        let now = Utc::now();
        let future = (now + Duration::days(2)).to_rfc3339();
        assert_eq!(content_age_days(Some(&future), now), Some(0));
    }

    #[test]
    fn test_to_upsert_derives_form_flags() {
        let cms_page = CmsPage {
            cms_id: "1".to_string(),
            url: "https://x.com/demo".to_string(),
            slug: Some("demo".to_string()),
            title: Some("Demo".to_string()),
            meta_description: None,
            page_type: crate::db::PageType::Landing,
            published_at: None,
            updated_at: None,
            form_ids: vec!["f-1".to_string()],
            cta_ids: vec![],
        };
        let upsert = to_upsert(&cms_page, Utc::now());
        assert!(upsert.has_form);
        assert!(!upsert.has_cta);
        assert_eq!(upsert.content_age_days, None);
    }
}
