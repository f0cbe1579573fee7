//! OAuth2 token broker for the Google data APIs.
//!
//! Keeps at most one live credential pair in the `thyme_credentials` row.
//! Readers may race freely; refreshes are serialized through a process-wide
//! mutex so concurrent callers never issue more than one refresh request.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::{DbError, HealthDb};

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Refresh this far ahead of expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No credential row; run the OAuth bootstrap first")]
    NoCredentials,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage: {0}")]
    Db(#[from] DbError),
}

/// The persisted credential pair.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: String,
    pub scopes: Vec<String>,
}

impl StoredCredentials {
    /// Expired (or unparseable) within the skew window?
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(expires) => expires <= now + Duration::seconds(EXPIRY_SKEW_SECS),
            Err(_) => true,
        }
    }
}

/// Serializes token refreshes across every adapter in the process.
static REFRESH_MUTEX: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();

fn refresh_mutex() -> &'static Mutex<()> {
    REFRESH_MUTEX.get_or_init(|| Mutex::new(()))
}

pub struct TokenBroker {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl TokenBroker {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: config.oauth_client_id.clone(),
            client_secret: config.oauth_client_secret.clone(),
        }
    }

    /// Return a non-expired access token, refreshing first when the stored
    /// one is inside the expiry skew window.
    pub async fn access_token(&self, db: &HealthDb) -> Result<String, AuthError> {
        let creds = load_credentials(db)?.ok_or(AuthError::NoCredentials)?;
        if !creds.needs_refresh(Utc::now()) {
            return Ok(creds.access_token);
        }

        let _guard = refresh_mutex().lock().await;

        // Another caller may have refreshed while we waited on the lock.
        let creds = load_credentials(db)?.ok_or(AuthError::NoCredentials)?;
        if !creds.needs_refresh(Utc::now()) {
            return Ok(creds.access_token);
        }

        let refreshed = self.refresh(db, &creds).await?;
        Ok(refreshed.access_token)
    }

    async fn refresh(
        &self,
        db: &HealthDb,
        current: &StoredCredentials,
    ) -> Result<StoredCredentials, AuthError> {
        log::info!("Refreshing OAuth access token");

        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", current.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed(format!("HTTP {}: {}", status, body)));
        }

        let body: serde_json::Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| AuthError::RefreshFailed("No access_token in response".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
        let expires_at = (Utc::now() + Duration::seconds(expires_in as i64)).to_rfc3339();

        // The endpoint usually omits the refresh token on refresh; keep the
        // prior one in that case.
        let refresh_token = body["refresh_token"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| current.refresh_token.clone());

        let scopes = body["scope"]
            .as_str()
            .map(|s| s.split(' ').map(|p| p.to_string()).collect())
            .unwrap_or_else(|| current.scopes.clone());

        let refreshed = StoredCredentials {
            access_token,
            refresh_token,
            expires_at,
            scopes,
        };
        save_credentials(db, &refreshed)?;
        Ok(refreshed)
    }
}

/// Read the single credential row, if one exists.
pub fn load_credentials(db: &HealthDb) -> Result<Option<StoredCredentials>, DbError> {
    match db.conn_ref().query_row(
        "SELECT access_token, refresh_token, expires_at, scopes
         FROM thyme_credentials WHERE id = 1",
        [],
        |row| {
            Ok(StoredCredentials {
                access_token: row.get(0)?,
                refresh_token: row.get(1)?,
                expires_at: row.get(2)?,
                scopes: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
            })
        },
    ) {
        Ok(creds) => Ok(Some(creds)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Write (or overwrite) the single credential row.
pub fn save_credentials(db: &HealthDb, creds: &StoredCredentials) -> Result<(), DbError> {
    db.conn_ref().execute(
        "INSERT INTO thyme_credentials (id, access_token, refresh_token, expires_at, scopes, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            expires_at = excluded.expires_at,
            scopes = excluded.scopes,
            updated_at = excluded.updated_at",
        params![
            creds.access_token,
            creds.refresh_token,
            creds.expires_at,
            serde_json::to_string(&creds.scopes).unwrap_or_else(|_| "[]".into()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch_db;

    fn creds(expires_at: DateTime<Utc>) -> StoredCredentials {
        StoredCredentials {
            access_token: "ya29.current".to_string(),
            refresh_token: "1//refresh".to_string(),
            expires_at: expires_at.to_rfc3339(),
            scopes: vec!["https://www.googleapis.com/auth/analytics.readonly".to_string()],
        }
    }

    #[test]
    fn test_needs_refresh_inside_skew_window() {
        let fresh = creds(Utc::now() + Duration::hours(1));
        assert!(!fresh.needs_refresh(Utc::now()));

        let nearly_expired = creds(Utc::now() + Duration::seconds(30));
        assert!(nearly_expired.needs_refresh(Utc::now()));

        let expired = creds(Utc::now() - Duration::hours(1));
        assert!(expired.needs_refresh(Utc::now()));
    }

    #[test]
    fn test_unparseable_expiry_forces_refresh() {
        let mut broken = creds(Utc::now());
        broken.expires_at = "not a timestamp".to_string();
        assert!(broken.needs_refresh(Utc::now()));
    }

    #[test]
    fn test_credentials_roundtrip_single_row() {
        let db = scratch_db();
        assert!(load_credentials(&db).expect("load").is_none());

        save_credentials(&db, &creds(Utc::now() + Duration::hours(1))).expect("save");
        save_credentials(
            &db,
            &StoredCredentials {
                access_token: "ya29.newer".to_string(),
                ..creds(Utc::now() + Duration::hours(2))
            },
        )
        .expect("overwrite");

        let loaded = load_credentials(&db).expect("load").expect("present");
        assert_eq!(loaded.access_token, "ya29.newer");

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM thyme_credentials", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1, "at most one credential row");
    }
}
