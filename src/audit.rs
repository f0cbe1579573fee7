//! Meta auditor: pure function over the page inventory.
//!
//! Issues are a closed set; duplicates are computed by case-insensitive
//! trimmed equality across the whole inventory, so the function must see
//! every active page at once.

use std::collections::HashMap;

use crate::db::Page;

/// Title length bounds (characters).
const TITLE_MAX: usize = 60;
const TITLE_MIN: usize = 30;

/// Meta description length bounds (characters).
const META_MAX: usize = 160;
const META_MIN: usize = 70;

/// The closed issue vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaIssue {
    MissingTitle,
    MissingMeta,
    TitleTooLong,
    TitleTooShort,
    MetaTooLong,
    MetaTooShort,
    DuplicateTitle,
    DuplicateMeta,
}

impl MetaIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingTitle => "missing_title",
            Self::MissingMeta => "missing_meta",
            Self::TitleTooLong => "title_too_long",
            Self::TitleTooShort => "title_too_short",
            Self::MetaTooLong => "meta_too_long",
            Self::MetaTooShort => "meta_too_short",
            Self::DuplicateTitle => "duplicate_title",
            Self::DuplicateMeta => "duplicate_meta",
        }
    }
}

/// Audit every page. Returns url → issue list; pages with no issues map to
/// an empty list so callers can clear stale issue sets.
pub fn audit_pages(inventory: &[Page]) -> Vec<(String, Vec<String>)> {
    let title_counts = duplicate_counts(inventory.iter().map(|p| p.title.as_deref()));
    let meta_counts = duplicate_counts(inventory.iter().map(|p| p.meta_description.as_deref()));

    inventory
        .iter()
        .map(|page| {
            let mut issues = Vec::new();

            match normalized(page.title.as_deref()) {
                None => issues.push(MetaIssue::MissingTitle),
                Some(title) => {
                    let len = page.title.as_deref().unwrap_or("").chars().count();
                    if len > TITLE_MAX {
                        issues.push(MetaIssue::TitleTooLong);
                    } else if len < TITLE_MIN {
                        issues.push(MetaIssue::TitleTooShort);
                    }
                    if title_counts.get(&title).copied().unwrap_or(0) > 1 {
                        issues.push(MetaIssue::DuplicateTitle);
                    }
                }
            }

            match normalized(page.meta_description.as_deref()) {
                None => issues.push(MetaIssue::MissingMeta),
                Some(meta) => {
                    let len = page.meta_description.as_deref().unwrap_or("").chars().count();
                    if len > META_MAX {
                        issues.push(MetaIssue::MetaTooLong);
                    } else if len < META_MIN {
                        issues.push(MetaIssue::MetaTooShort);
                    }
                    if meta_counts.get(&meta).copied().unwrap_or(0) > 1 {
                        issues.push(MetaIssue::DuplicateMeta);
                    }
                }
            }

            (
                page.url.clone(),
                issues.iter().map(|i| i.as_str().to_string()).collect(),
            )
        })
        .collect()
}

/// Count of pages sharing each normalized value.
fn duplicate_counts<'a>(values: impl Iterator<Item = Option<&'a str>>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for value in values.flatten() {
        if let Some(norm) = normalized(Some(value)) {
            *counts.entry(norm).or_insert(0) += 1;
        }
    }
    counts
}

/// Trimmed, lowercased; `None` for absent or whitespace-only values.
fn normalized(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PageType;

    fn page(url: &str, title: Option<&str>, meta: Option<&str>) -> Page {
        Page {
            id: url.to_string(),
            url: url.to_string(),
            slug: None,
            title: title.map(|s| s.to_string()),
            meta_description: meta.map(|s| s.to_string()),
            page_type: PageType::Site,
            cms_page_id: None,
            has_form: false,
            form_ids: "[]".to_string(),
            has_cta: false,
            cta_ids: "[]".to_string(),
            published_at: None,
            last_updated_at: None,
            content_age_days: None,
            is_indexed: true,
            is_active: true,
            title_length: None,
            meta_description_length: None,
            meta_issues: "[]".to_string(),
            has_broken_links: false,
            broken_link_count: 0,
            health_score: None,
            health_breakdown: None,
            last_health_check_at: None,
        }
    }

    const GOOD_TITLE: &str = "A perfectly reasonable page title here";
    const GOOD_META: &str =
        "A meta description that is comfortably long enough to satisfy the lower bound check.";

    #[test]
    fn test_clean_page_has_no_issues() {
        let pages = vec![page("https://x.com/a", Some(GOOD_TITLE), Some(GOOD_META))];
        let issues = audit_pages(&pages);
        assert_eq!(issues[0].1, Vec::<String>::new());
    }

    #[test]
    fn test_missing_fields() {
        let pages = vec![page("https://x.com/a", None, Some("   "))];
        let issues = audit_pages(&pages);
        assert_eq!(issues[0].1, vec!["missing_title", "missing_meta"]);
    }

    #[test]
    fn test_length_bounds() {
        let long_title = "x".repeat(61);
        let short_meta = "too short to be useful";
        let pages = vec![page("https://x.com/a", Some(&long_title), Some(short_meta))];
        let issues = audit_pages(&pages);
        assert!(issues[0].1.contains(&"title_too_long".to_string()));
        assert!(issues[0].1.contains(&"meta_too_short".to_string()));

        // Exactly at the bound is not an issue.
        let exact_title = "x".repeat(60);
        let pages = vec![page("https://x.com/a", Some(&exact_title), Some(GOOD_META))];
        let issues = audit_pages(&pages);
        assert!(!issues[0].1.contains(&"title_too_long".to_string()));
    }

    #[test]
    fn test_duplicates_are_case_insensitive() {
        let pages = vec![
            page("https://x.com/a", Some("Shared Title Across These Pages"), Some(GOOD_META)),
            page("https://x.com/b", Some("  shared title across these pages "), Some(GOOD_META)),
            page("https://x.com/c", Some("A Different Title For This Page"), Some(GOOD_META)),
        ];
        let issues = audit_pages(&pages);
        assert!(issues[0].1.contains(&"duplicate_title".to_string()));
        assert!(issues[1].1.contains(&"duplicate_title".to_string()));
        assert!(!issues[2].1.contains(&"duplicate_title".to_string()));
        // The shared meta is also a duplicate, on all three.
        assert!(issues[2].1.contains(&"duplicate_meta".to_string()));
    }

    #[test]
    fn test_audit_is_deterministic() {
        let pages = vec![
            page("https://x.com/a", Some(GOOD_TITLE), None),
            page("https://x.com/b", None, Some(GOOD_META)),
        ];
        assert_eq!(audit_pages(&pages), audit_pages(&pages));
    }
}
