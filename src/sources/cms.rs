//! HubSpot CMS adapter: page inventory across three families, plus forms.
//!
//! Pages arrive as dynamic-shape JSON; only the fields the inventory needs
//! are lifted out, and embedded form/CTA ids are mined from the widget tree
//! wherever they appear. Each page family paginates with 100-row cursors.

use std::time::Duration;

use futures::stream::{self, StreamExt};

use super::{bounded, expect_success, send_with_retry, RetryPolicy, SourceError};
use crate::db::PageType;
use crate::util::Deadline;

const API_BASE: &str = "https://api.hubapi.com";

const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Rows per pagination cursor.
const PAGE_SIZE: u32 = 100;

/// Concurrent submission-count lookups.
const SUBMISSION_FANOUT: usize = 5;

/// One CMS page record, normalized across families.
#[derive(Debug, Clone)]
pub struct CmsPage {
    pub cms_id: String,
    pub url: String,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub page_type: PageType,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub form_ids: Vec<String>,
    pub cta_ids: Vec<String>,
}

/// One marketing form with its recent submission count.
#[derive(Debug, Clone)]
pub struct CmsForm {
    pub id: String,
    pub name: String,
    pub submission_count: i64,
}

pub struct CmsClient {
    http: reqwest::Client,
    token: String,
}

impl CmsClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
        }
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        deadline: &Deadline,
    ) -> Result<serde_json::Value, SourceError> {
        let cap = deadline.timeout_capped(CALL_TIMEOUT);
        bounded(cap, async {
            let resp = send_with_retry(
                self.http.get(url).bearer_auth(&self.token).query(query),
                &RetryPolicy::default(),
            )
            .await?;
            let resp = expect_success(resp).await?;
            resp.json::<serde_json::Value>()
                .await
                .map_err(|e| SourceError::Data(format!("CMS response: {}", e)))
        })
        .await
    }

    /// Walk one family's cursor pagination to exhaustion.
    async fn list_family(
        &self,
        endpoint: &str,
        page_type: PageType,
        deadline: &Deadline,
    ) -> Result<Vec<CmsPage>, SourceError> {
        let url = format!("{}{}", API_BASE, endpoint);
        let mut pages = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("limit", PAGE_SIZE.to_string())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }
            let body = self.get_json(&url, &query, deadline).await?;

            if let Some(results) = body["results"].as_array() {
                pages.extend(results.iter().filter_map(|raw| map_page(page_type, raw)));
            }

            after = body["paging"]["next"]["after"].as_str().map(|s| s.to_string());
            if after.is_none() {
                break;
            }
            if deadline.expired() {
                log::warn!("CMS pagination cut short by deadline ({} rows)", pages.len());
                break;
            }
        }
        Ok(pages)
    }

    /// The union of site pages, landing pages, and blog posts. A family that
    /// fails is logged and skipped so the others still land.
    pub async fn all_pages(&self, deadline: &Deadline) -> Result<Vec<CmsPage>, SourceError> {
        let families = [
            ("/cms/v3/pages/site-pages", PageType::Site),
            ("/cms/v3/pages/landing-pages", PageType::Landing),
            ("/cms/v3/blogs/posts", PageType::Blog),
        ];

        let mut all = Vec::new();
        let mut failures = 0usize;
        let mut last_error: Option<SourceError> = None;
        for (endpoint, page_type) in families {
            match self.list_family(endpoint, page_type, deadline).await {
                Ok(mut pages) => all.append(&mut pages),
                Err(e) => {
                    log::warn!("CMS family {} failed: {}", endpoint, e);
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        // All three down means the adapter itself is down.
        if failures == 3 {
            return Err(last_error.unwrap_or(SourceError::Data("no CMS families".into())));
        }
        Ok(all)
    }

    /// Full record for one page id within a family.
    pub async fn page_detail(
        &self,
        cms_id: &str,
        page_type: PageType,
        deadline: &Deadline,
    ) -> Result<Option<CmsPage>, SourceError> {
        let endpoint = match page_type {
            PageType::Landing => format!("/cms/v3/pages/landing-pages/{}", cms_id),
            PageType::Blog => format!("/cms/v3/blogs/posts/{}", cms_id),
            _ => format!("/cms/v3/pages/site-pages/{}", cms_id),
        };
        let body = self
            .get_json(&format!("{}{}", API_BASE, endpoint), &[], deadline)
            .await?;
        Ok(map_page(page_type, &body))
    }

    /// All marketing forms with their submission counts, count lookups
    /// fanned out [`SUBMISSION_FANOUT`] at a time.
    pub async fn forms_with_submission_counts(
        &self,
        deadline: &Deadline,
    ) -> Result<Vec<CmsForm>, SourceError> {
        let body = self
            .get_json(
                &format!("{}/marketing/v3/forms", API_BASE),
                &[("limit", PAGE_SIZE.to_string())],
                deadline,
            )
            .await?;

        let stubs: Vec<(String, String)> = body["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter_map(|f| {
                        let id = f["id"].as_str()?.to_string();
                        let name = f["name"].as_str().unwrap_or(&id).to_string();
                        Some((id, name))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let forms: Vec<CmsForm> = stream::iter(stubs)
            .map(|(id, name)| async move {
                let count = self.submission_count(&id, deadline).await.unwrap_or_else(|e| {
                    log::debug!("Submission count for form {} failed: {}", id, e);
                    0
                });
                CmsForm {
                    id,
                    name,
                    submission_count: count,
                }
            })
            .buffer_unordered(SUBMISSION_FANOUT)
            .collect()
            .await;

        Ok(forms)
    }

    async fn submission_count(
        &self,
        form_id: &str,
        deadline: &Deadline,
    ) -> Result<i64, SourceError> {
        let body = self
            .get_json(
                &format!(
                    "{}/form-integrations/v1/submissions/forms/{}",
                    API_BASE, form_id
                ),
                &[("limit", "50".to_string())],
                deadline,
            )
            .await?;
        // The endpoint reports a total when it can; otherwise count the page.
        Ok(body["total"].as_i64().unwrap_or_else(|| {
            body["results"].as_array().map(|r| r.len() as i64).unwrap_or(0)
        }))
    }
}

/// Lift the inventory fields out of a raw CMS record. Rows without a URL are
/// unreachable pages and are dropped.
fn map_page(page_type: PageType, raw: &serde_json::Value) -> Option<CmsPage> {
    let url = raw["url"].as_str()?.to_string();
    let cms_id = match &raw["id"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    Some(CmsPage {
        cms_id,
        url,
        slug: raw["slug"].as_str().map(|s| s.to_string()),
        title: raw["htmlTitle"]
            .as_str()
            .or_else(|| raw["name"].as_str())
            .map(|s| s.to_string()),
        meta_description: raw["metaDescription"].as_str().map(|s| s.to_string()),
        page_type,
        published_at: raw["publishDate"].as_str().map(|s| s.to_string()),
        updated_at: raw["updatedAt"]
            .as_str()
            .or_else(|| raw["updated"].as_str())
            .map(|s| s.to_string()),
        form_ids: extract_ids(raw, &["form_id", "formId"]),
        cta_ids: extract_ids(raw, &["cta_guid", "ctaGuid"]),
    })
}

/// Recursively collect string values under any of `keys` from a widget tree.
/// CMS widget payloads nest arbitrarily, so this walks everything.
fn extract_ids(value: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    let mut found = Vec::new();
    walk_for_ids(value, keys, &mut found);
    found.sort();
    found.dedup();
    found
}

fn walk_for_ids(value: &serde_json::Value, keys: &[&str], found: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                if keys.contains(&key.as_str()) {
                    if let Some(id) = child.as_str() {
                        if !id.is_empty() {
                            found.push(id.to_string());
                        }
                    }
                }
                walk_for_ids(child, keys, found);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_for_ids(item, keys, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landing_fixture() -> serde_json::Value {
        serde_json::json!({
            "id": 4711,
            "url": "https://www.example.com/demo",
            "slug": "demo",
            "htmlTitle": "Book a demo",
            "metaDescription": "See the product in action.",
            "publishDate": "2024-03-01T10:00:00Z",
            "updatedAt": "2026-06-12T08:30:00Z",
            "widgets": {
                "module_1": {
                    "body": {"form_id": "f-123", "other": 1}
                },
                "module_2": {
                    "body": {"nested": [{"cta_guid": "cta-77"}, {"form_id": "f-456"}]}
                }
            }
        })
    }

    #[test]
    fn test_map_page_lifts_fields() {
        let page = map_page(PageType::Landing, &landing_fixture()).expect("mapped");
        assert_eq!(page.cms_id, "4711");
        assert_eq!(page.url, "https://www.example.com/demo");
        assert_eq!(page.title.as_deref(), Some("Book a demo"));
        assert_eq!(page.form_ids, vec!["f-123", "f-456"]);
        assert_eq!(page.cta_ids, vec!["cta-77"]);
    }

    #[test]
    fn test_map_page_drops_rows_without_url() {
        let raw = serde_json::json!({"id": 1, "name": "draft"});
        assert!(map_page(PageType::Site, &raw).is_none());
    }

    #[test]
    fn test_extract_ids_dedupes() {
        let raw = serde_json::json!({
            "a": {"formId": "f-1"},
            "b": [{"form_id": "f-1"}, {"form_id": "f-2"}]
        });
        assert_eq!(extract_ids(&raw, &["form_id", "formId"]), vec!["f-1", "f-2"]);
    }

    #[test]
    fn test_blog_updated_field_alias() {
        let raw = serde_json::json!({
            "id": "99",
            "url": "https://www.example.com/blog/post",
            "name": "Post",
            "updated": "2026-01-05T00:00:00Z"
        });
        let page = map_page(PageType::Blog, &raw).expect("mapped");
        assert_eq!(page.updated_at.as_deref(), Some("2026-01-05T00:00:00Z"));
        assert_eq!(page.title.as_deref(), Some("Post"));
    }
}
