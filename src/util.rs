//! Small shared helpers: deadlines, URL normalization, string utilities.

use std::time::Duration;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Wall-clock budget shared by every stage of an orchestrator run.
///
/// Stages check `elapsed_ms()` against their own cut-offs; remote calls clamp
/// their per-call timeout with `timeout_capped()` so that nothing outlives
/// the run itself.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Time left before the global budget is exhausted (zero when overdue).
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// A per-call timeout: the smaller of `cap` and the remaining budget.
    pub fn timeout_capped(&self, cap: Duration) -> Duration {
        self.remaining().min(cap)
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Extract the path component of an absolute URL.
///
/// Analytics rows key by path while pages key by absolute URL; this is the
/// join bridge. A URL that fails to parse falls back to the raw string,
/// which never matches an analytics path; callers count and log those.
pub fn url_path(page_url: &str) -> String {
    match url::Url::parse(page_url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => page_url.to_string(),
    }
}

/// Normalize trailing slashes for URL-keyed joins ("/pricing/" == "/pricing").
/// The root path is left alone.
pub fn strip_trailing_slash(url: &str) -> &str {
    if url.len() > 1 {
        url.trim_end_matches('/')
    } else {
        url
    }
}

// ---------------------------------------------------------------------------
// String helpers
// ---------------------------------------------------------------------------

/// Truncate to a character budget, appending an ellipsis when cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Lowercase, trim, and collapse a display name to `[a-z0-9_]` for the
/// fuzzy conversion-event ↔ form matching.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_path_extraction() {
        assert_eq!(url_path("https://www.example.com/pricing"), "/pricing");
        assert_eq!(url_path("https://example.com/blog/post?utm=1"), "/blog/post");
        assert_eq!(url_path("https://example.com"), "/");
    }

    #[test]
    fn test_url_path_unparseable_falls_back_to_raw() {
        assert_eq!(url_path("not a url"), "not a url");
    }

    #[test]
    fn test_strip_trailing_slash() {
        assert_eq!(strip_trailing_slash("https://x.com/a/"), "https://x.com/a");
        assert_eq!(strip_trailing_slash("/pricing/"), "/pricing");
        assert_eq!(strip_trailing_slash("/"), "/");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789abc", 10), "0123456789...");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Contact Us Form"), "contact_us_form");
        assert_eq!(normalize_name("  Demo-Request!  "), "demo_request");
        assert_eq!(normalize_name("form_submit"), "form_submit");
    }

    #[test]
    fn test_deadline_caps_timeouts() {
        let deadline = Deadline::new(Duration::from_secs(120));
        let capped = deadline.timeout_capped(Duration::from_secs(10));
        assert!(capped <= Duration::from_secs(10));
        assert!(!deadline.expired());
    }
}
