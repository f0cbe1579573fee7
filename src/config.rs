//! Process configuration loaded once from the environment.
//!
//! Every external input the daemon needs is resolved here at startup and
//! carried in an immutable `Config` that is passed explicitly to the
//! components that need it. Adapters never read the environment themselves,
//! which keeps tests deterministic.

use std::path::PathBuf;

use thiserror::Error;

/// Default Anthropic model for investigations and digests.
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default bind address for the trigger/review HTTP surface.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

/// Cron schedule for the Monday/Wednesday/Friday scan (UTC).
pub const SCAN_SCHEDULE: &str = "0 14 * * 1,3,5";

/// Cron schedule for the Sunday site-wide audit (UTC).
pub const WEEKLY_SCHEDULE: &str = "0 14 * * 0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Google OAuth client for the Analytics / Search Console APIs.
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_redirect_uri: String,

    /// GA4 property id (numeric string).
    pub analytics_property_id: String,
    /// Search Console site URL (e.g. `sc-domain:example.com` or a URL prefix).
    pub search_site_url: String,
    /// PageSpeed Insights API key.
    pub pagespeed_api_key: String,
    /// HubSpot private-app token for the CMS inventory.
    pub hubspot_token: String,
    /// Anthropic API key for the investigation loop and weekly digest.
    pub anthropic_api_key: String,
    /// Model id for LLM calls.
    pub model: String,

    /// The site origin the link checker sweeps (e.g. `https://www.example.com`).
    pub site_origin: String,

    /// Shared secret for the manual trigger and review endpoints.
    pub trigger_secret: String,
    /// Bind address for the HTTP surface.
    pub bind_addr: String,

    /// How many flagged pages a single scan escalates to the agent loop.
    pub max_investigations: usize,
}

impl Config {
    /// Load configuration from the environment. Missing required variables
    /// are fatal; the daemon refuses to start half-configured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: PathBuf::from(required("THYME_DATABASE_PATH")?),
            oauth_client_id: required("THYME_OAUTH_CLIENT_ID")?,
            oauth_client_secret: required("THYME_OAUTH_CLIENT_SECRET")?,
            oauth_redirect_uri: required("THYME_OAUTH_REDIRECT_URI")?,
            analytics_property_id: required("THYME_ANALYTICS_PROPERTY_ID")?,
            search_site_url: required("THYME_SEARCH_SITE_URL")?,
            pagespeed_api_key: required("THYME_PAGESPEED_API_KEY")?,
            hubspot_token: required("THYME_HUBSPOT_TOKEN")?,
            anthropic_api_key: required("THYME_ANTHROPIC_API_KEY")?,
            model: optional("THYME_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            site_origin: required("THYME_SITE_ORIGIN")?.trim_end_matches('/').to_string(),
            trigger_secret: required("THYME_TRIGGER_SECRET")?,
            bind_addr: optional("THYME_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            max_investigations: match optional("THYME_MAX_INVESTIGATIONS") {
                None => 1,
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                    var: "THYME_MAX_INVESTIGATIONS",
                    reason: format!("expected a positive integer, got '{}'", raw),
                })?,
            },
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn optional(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_var_is_fatal() {
        std::env::remove_var("THYME_DATABASE_PATH");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));
    }
}
