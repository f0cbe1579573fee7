//! HTTP surface: manual triggers and the review decision endpoint.
//!
//! Three authenticated routes. Triggers are fire-and-forget: the job lands
//! on the executor channel and the response returns immediately. The review
//! endpoint is transactional and maps a non-pending target to 404. Dashboard
//! read APIs live elsewhere and are not served here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db::HealthDb;
use crate::scheduler::{JobId, JobRequest, JobTrigger};
use crate::writer::{self, ReviewError, ReviewRequest};

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub jobs: mpsc::Sender<JobRequest>,
}

/// Serve the trigger/review API until the process exits.
pub async fn run(config: Arc<Config>, jobs: mpsc::Sender<JobRequest>) -> std::io::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let ctx = AppContext { config, jobs };

    let app = Router::new()
        .route("/health", get(health))
        .route("/trigger/scan", post(trigger_scan))
        .route("/trigger/weekly", post(trigger_weekly))
        .route("/review", post(review))
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!("HTTP surface listening on {}", bind_addr);
    axum::serve(listener, app).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Reject unless the caller carries the shared secret as a bearer token.
fn authorize(ctx: &AppContext, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(secret) if secret == ctx.config.trigger_secret => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid or missing bearer token"})),
        )
            .into_response()),
    }
}

async fn trigger_scan(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    dispatch(ctx, headers, JobId::Scan).await
}

async fn trigger_weekly(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    dispatch(ctx, headers, JobId::Weekly).await
}

async fn dispatch(ctx: AppContext, headers: HeaderMap, job: JobId) -> Response {
    if let Err(rejection) = authorize(&ctx, &headers) {
        return rejection;
    }

    // try_send keeps the response inside the 1 s contract even when the
    // executor is mid-run; a full channel means a run is already queued.
    match ctx.jobs.try_send(JobRequest {
        job,
        trigger: JobTrigger::Manual,
    }) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"dispatched": true, "job": job.name()})),
        )
            .into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"dispatched": false, "reason": "a run is already queued"})),
        )
            .into_response(),
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "executor unavailable"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    id: String,
    /// "approve" or "reject".
    action: String,
    notes: Option<String>,
    reviewer: Option<String>,
}

async fn review(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(body): Json<ReviewBody>,
) -> Response {
    if let Err(rejection) = authorize(&ctx, &headers) {
        return rejection;
    }

    let database_path = ctx.config.database_path.clone();
    let request = ReviewRequest {
        queue_id: body.id,
        action: body.action,
        reviewer: body.reviewer.unwrap_or_else(|| "human-review".to_string()),
        notes: body.notes,
    };

    // rusqlite is synchronous; keep it off the async worker threads.
    let result = tokio::task::spawn_blocking(move || {
        let db = HealthDb::open(&database_path)?;
        writer::review_decision(&db, &request)
    })
    .await;

    match result {
        Ok(Ok(())) => Json(serde_json::json!({"success": true})).into_response(),
        Ok(Err(ReviewError::NotFound(id))) | Ok(Err(ReviewError::NotPending(id))) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no pending queue item: {}", id)})),
        )
            .into_response(),
        Ok(Err(ReviewError::UnknownAction(action))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown action: {}", action)})),
        )
            .into_response(),
        Ok(Err(ReviewError::Db(e))) => {
            log::error!("Review failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "storage failure"})),
            )
                .into_response()
        }
        Err(e) => {
            log::error!("Review task panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal failure"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(secret: &str) -> AppContext {
        let (sender, _receiver) = mpsc::channel(1);
        AppContext {
            config: Arc::new(test_config(secret)),
            jobs: sender,
        }
    }

    fn test_config(secret: &str) -> Config {
        Config {
            database_path: "/tmp/thyme-test.db".into(),
            oauth_client_id: "cid".into(),
            oauth_client_secret: "csecret".into(),
            oauth_redirect_uri: "http://localhost".into(),
            analytics_property_id: "123".into(),
            search_site_url: "sc-domain:example.com".into(),
            pagespeed_api_key: "psi".into(),
            hubspot_token: "hs".into(),
            anthropic_api_key: "sk-ant".into(),
            model: "test-model".into(),
            site_origin: "https://www.example.com".into(),
            trigger_secret: secret.into(),
            bind_addr: "127.0.0.1:0".into(),
            max_investigations: 1,
        }
    }

    #[test]
    fn test_authorize_accepts_matching_bearer() {
        let ctx = ctx("s3cret");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_ok());
    }

    #[test]
    fn test_authorize_rejects_bad_or_missing_token() {
        let ctx = ctx("s3cret");

        let empty = HeaderMap::new();
        assert!(authorize(&ctx, &empty).is_err());

        let mut wrong = HeaderMap::new();
        wrong.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(authorize(&ctx, &wrong).is_err());

        let mut malformed = HeaderMap::new();
        malformed.insert(header::AUTHORIZATION, "s3cret".parse().unwrap());
        assert!(authorize(&ctx, &malformed).is_err());
    }
}
