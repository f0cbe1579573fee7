//! Sitemap-driven link checker and HTML form detection.
//!
//! Redirects are followed manually (bounded chain) so each hop lands in the
//! recorded chain; a URL that still redirects after the bound is reported
//! with its last 3xx status. Network failures surface as a broken result
//! with no status, never an adapter error.

use std::sync::OnceLock;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use regex::Regex;

use super::SourceError;
use crate::util::Deadline;

/// Per-request timeout for link checks.
const LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for HTML form-detection fetches.
const HTML_TIMEOUT: Duration = Duration::from_secs(5);

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Concurrent link checks.
pub const LINK_FANOUT: usize = 5;

/// Concurrent form-detection fetches per batch.
pub const FORM_FANOUT: usize = 20;

const USER_AGENT: &str = "thyme-healthbot/0.4 (+site-health-check)";

/// Outcome of checking one URL.
#[derive(Debug, Clone)]
pub struct LinkCheck {
    pub target_url: String,
    /// None when the request never produced an HTTP response.
    pub http_status: Option<i64>,
    pub is_broken: bool,
    pub is_redirect: bool,
    /// Every URL visited, starting with the target itself.
    pub redirect_chain: Vec<String>,
    pub error_message: Option<String>,
}

fn form_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)<form[\s>]").expect("static regex"))
}

fn loc_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("static regex"))
}

pub struct LinkChecker {
    /// Redirects disabled; hops are followed by hand.
    http: reqwest::Client,
    /// Separate client for HTML fetches, redirects enabled.
    html: reqwest::Client,
}

impl Default for LinkChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkChecker {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .user_agent(USER_AGENT)
                .timeout(LINK_TIMEOUT)
                .build()
                .unwrap_or_default(),
            html: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(HTML_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch and parse the sitemap. Best-effort: an unparseable body yields
    /// whatever `<loc>` elements the pattern can find (possibly none).
    pub async fn sitemap_urls(
        &self,
        site_origin: &str,
        deadline: &Deadline,
    ) -> Result<Vec<String>, SourceError> {
        let sitemap_url = format!("{}/sitemap.xml", site_origin.trim_end_matches('/'));
        let cap = deadline.timeout_capped(LINK_TIMEOUT);

        let body = match tokio::time::timeout(cap, self.html.get(&sitemap_url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(Ok(resp)) => {
                return Err(SourceError::Api {
                    status: resp.status().as_u16(),
                    message: format!("sitemap fetch failed for {}", sitemap_url),
                })
            }
            Ok(Err(e)) => return Err(SourceError::Http(e)),
            Err(_) => return Err(SourceError::Timeout(cap)),
        };

        Ok(parse_sitemap(&body))
    }

    /// Check one URL with a manually-followed redirect chain.
    pub async fn check_url(&self, target_url: &str) -> LinkCheck {
        let mut chain = vec![target_url.to_string()];
        let mut current = target_url.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let resp = match self.http.head(&current).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    return LinkCheck {
                        target_url: target_url.to_string(),
                        http_status: None,
                        is_broken: true,
                        is_redirect: chain.len() > 1,
                        redirect_chain: chain,
                        error_message: Some(e.to_string()),
                    }
                }
            };

            let status = resp.status();
            if status.is_redirection() {
                let next = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|loc| loc.to_str().ok())
                    .map(|loc| resolve_location(&current, loc));

                match next {
                    Some(next_url) if chain.len() <= MAX_REDIRECTS => {
                        chain.push(next_url.clone());
                        current = next_url;
                        continue;
                    }
                    _ => {
                        // Chain bound hit or Location missing; report as-is.
                        return LinkCheck {
                            target_url: target_url.to_string(),
                            http_status: Some(status.as_u16() as i64),
                            is_broken: false,
                            is_redirect: true,
                            redirect_chain: chain,
                            error_message: None,
                        };
                    }
                }
            }

            let code = status.as_u16() as i64;
            return LinkCheck {
                target_url: target_url.to_string(),
                http_status: Some(code),
                is_broken: code >= 400 || code == 0,
                is_redirect: chain.len() > 1,
                redirect_chain: chain,
                error_message: None,
            };
        }

        // Unreachable: the loop always returns. Kept for totality.
        LinkCheck {
            target_url: target_url.to_string(),
            http_status: None,
            is_broken: true,
            is_redirect: true,
            redirect_chain: chain,
            error_message: Some("redirect chain exhausted".to_string()),
        }
    }

    /// Check a set of URLs, [`LINK_FANOUT`] at a time, stopping early when
    /// the deadline runs out.
    pub async fn check_urls(&self, urls: &[String], deadline: &Deadline) -> Vec<LinkCheck> {
        let mut results = Vec::with_capacity(urls.len());
        for batch in urls.chunks(LINK_FANOUT) {
            if deadline.expired() {
                log::warn!(
                    "Link check cut short by deadline ({}/{} checked)",
                    results.len(),
                    urls.len()
                );
                break;
            }
            let mut batch_results: Vec<LinkCheck> = stream::iter(batch)
                .map(|url| self.check_url(url))
                .buffer_unordered(LINK_FANOUT)
                .collect()
                .await;
            results.append(&mut batch_results);
        }
        results
    }

    /// GET a live page and look for an HTML form element. Supplements CMS
    /// widget parsing for pages built with raw HTML modules.
    pub async fn detect_html_form(&self, page_url: &str) -> Result<bool, SourceError> {
        let resp = self.html.get(page_url).send().await?;
        if !resp.status().is_success() {
            return Err(SourceError::Api {
                status: resp.status().as_u16(),
                message: format!("form detection fetch failed for {}", page_url),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Ok(form_pattern().is_match(&body))
    }

    /// Form detection over many pages, [`FORM_FANOUT`] per batch. Returns
    /// (url, detected) pairs; fetch failures drop out of the result.
    pub async fn detect_html_forms(
        &self,
        urls: &[String],
        deadline: &Deadline,
    ) -> Vec<(String, bool)> {
        let mut results = Vec::new();
        for batch in urls.chunks(FORM_FANOUT) {
            if deadline.expired() {
                break;
            }
            let mut batch_results: Vec<(String, bool)> = stream::iter(batch)
                .map(|url| async move {
                    match self.detect_html_form(url).await {
                        Ok(found) => Some((url.clone(), found)),
                        Err(e) => {
                            log::debug!("Form detection failed for {}: {}", url, e);
                            None
                        }
                    }
                })
                .buffer_unordered(FORM_FANOUT)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .flatten()
                .collect();
            results.append(&mut batch_results);
        }
        results
    }
}

/// Best-effort `<loc>` extraction; tolerates nested sitemap indexes by
/// simply returning whatever locations appear.
fn parse_sitemap(xml: &str) -> Vec<String> {
    loc_pattern()
        .captures_iter(xml)
        .map(|cap| cap[1].trim().to_string())
        .filter(|loc| !loc.is_empty())
        .collect()
}

/// Resolve a Location header against the current URL (handles relative).
fn resolve_location(current: &str, location: &str) -> String {
    match url::Url::parse(current).and_then(|base| base.join(location)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sitemap_extracts_locations() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://www.example.com/</loc></url>
              <url><loc> https://www.example.com/pricing </loc><lastmod>2026-05-01</lastmod></url>
            </urlset>"#;
        let urls = parse_sitemap(xml);
        assert_eq!(
            urls,
            vec!["https://www.example.com/", "https://www.example.com/pricing"]
        );
    }

    #[test]
    fn test_parse_sitemap_tolerates_garbage() {
        assert!(parse_sitemap("<html>definitely not a sitemap</html>").is_empty());
        assert!(parse_sitemap("").is_empty());
    }

    #[test]
    fn test_form_pattern_matches_real_forms_only() {
        assert!(form_pattern().is_match(r#"<form action="/submit">"#));
        assert!(form_pattern().is_match("<FORM\n  method=\"post\">"));
        assert!(form_pattern().is_match("<form>"));
        assert!(!form_pattern().is_match("<formatted-output>"));
        assert!(!form_pattern().is_match("performance matters"));
    }

    #[test]
    fn test_resolve_location_relative_and_absolute() {
        assert_eq!(
            resolve_location("https://x.com/a/b", "/c"),
            "https://x.com/c"
        );
        assert_eq!(
            resolve_location("https://x.com/a", "https://y.com/z"),
            "https://y.com/z"
        );
    }
}
