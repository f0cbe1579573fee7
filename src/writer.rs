//! Materializes investigation outcomes and review decisions.
//!
//! A submitted finding and its decision-queue item land together in one
//! transaction, with a change-log row and a reviewer notification; signals
//! go out after commit (the bus is best-effort). The review operation is the
//! only path that moves a queue item out of pending.

use thiserror::Error;

use crate::agent::FlaggedPage;
use crate::db::findings::{FindingDraft, QueueDraft};
use crate::db::{DbError, FindingStatus, HealthDb, QueueStatus, Severity};
use crate::scoring::CRITICAL_THRESHOLD;
use crate::signals;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Queue item {0} is not pending")]
    NotPending(String),

    #[error("Unknown review action: {0}")]
    UnknownAction(String),

    #[error("Storage: {0}")]
    Db(#[from] DbError),
}

/// Ids produced by a submitted finding.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub finding_id: String,
    pub queue_id: String,
}

/// Materialize a `submit_finding` terminal call.
pub fn submit_finding(
    db: &HealthDb,
    flagged: &FlaggedPage,
    input: &serde_json::Value,
    iterations: i64,
    tools_used: &[String],
) -> Result<SubmitOutcome, DbError> {
    let severity = Severity::parse(input["severity"].as_str().unwrap_or("medium"));
    let finding_type = input["finding_type"].as_str().unwrap_or("technical_issue");
    let score = flagged.breakdown.total();

    let finding_draft = FindingDraft {
        page_url: Some(flagged.page.url.clone()),
        finding_type: finding_type.to_string(),
        severity,
        title: input["title"].as_str().unwrap_or("Untitled finding").to_string(),
        description: input["description"].as_str().map(|s| s.to_string()),
        business_impact: input["business_impact"].as_str().map(|s| s.to_string()),
        agent_loop_iterations: iterations,
        tools_used: tools_used.to_vec(),
        investigation_summary: input["investigation_summary"].as_str().map(|s| s.to_string()),
        status: FindingStatus::RecommendationDrafted,
        skip_reason: None,
        health_score_at_detection: Some(score),
    };

    let outcome = db.with_transaction(|tx| {
        let finding_id = tx.insert_finding(&finding_draft)?;

        let queue_id = tx.insert_queue_item(&QueueDraft {
            finding_id: Some(finding_id.clone()),
            action_type: input["action_type"].as_str().unwrap_or("manual_review").to_string(),
            action_summary: input["action_summary"]
                .as_str()
                .unwrap_or("Review this finding")
                .to_string(),
            action_detail: if input["action_detail"].is_object() {
                input["action_detail"].clone()
            } else {
                serde_json::json!({})
            },
            severity,
            confidence: input["confidence"].as_f64().unwrap_or(0.7),
            risk_level: input["risk_level"].as_str().unwrap_or("low").to_string(),
        })?;

        tx.append_change_log(
            "finding_drafted",
            &serde_json::json!({
                "findingId": finding_id,
                "queueId": queue_id,
                "pageUrl": flagged.page.url,
                "findingType": finding_type,
                "severity": severity.as_str(),
            }),
            "pending",
            None,
        )?;

        tx.insert_notification(
            &format!("Recommendation ready: {}", finding_draft.title),
            &format!(
                "{}: {}",
                flagged.page.url,
                input["action_summary"].as_str().unwrap_or("review required")
            ),
            severity.as_str(),
        )?;

        Ok(SubmitOutcome {
            finding_id,
            queue_id,
        })
    })?;

    if let Some(event_type) = finding_signal(finding_type) {
        signals::emit(
            db,
            event_type,
            serde_json::json!({
                "pageUrl": flagged.page.url,
                "findingId": outcome.finding_id,
                "severity": severity.as_str(),
                "healthScore": score,
            }),
        );
    }
    if score < CRITICAL_THRESHOLD {
        signals::emit(
            db,
            "page_health_critical",
            serde_json::json!({
                "pageUrl": flagged.page.url,
                "healthScore": score,
            }),
        );
    }

    Ok(outcome)
}

/// Materialize a `skip_finding` terminal call (or a forced skip). Strictly
/// an audit record; nothing enters the review queue.
pub fn skip_finding(
    db: &HealthDb,
    page_url: &str,
    health_score: i64,
    reason: &str,
    investigation_summary: Option<&str>,
    iterations: i64,
    tools_used: &[String],
) -> Result<String, DbError> {
    let finding_id = db.insert_finding(&FindingDraft {
        page_url: Some(page_url.to_string()),
        finding_type: "investigation_skipped".to_string(),
        severity: Severity::Low,
        title: format!("Investigation skipped: {}", crate::util::truncate(reason, 80)),
        description: None,
        business_impact: None,
        agent_loop_iterations: iterations,
        tools_used: tools_used.to_vec(),
        investigation_summary: investigation_summary.map(|s| s.to_string()),
        status: FindingStatus::Skipped,
        skip_reason: Some(reason.to_string()),
        health_score_at_detection: Some(health_score),
    })?;

    db.append_change_log(
        "investigation_skipped",
        &serde_json::json!({
            "findingId": finding_id,
            "pageUrl": page_url,
            "reason": reason,
        }),
        "pending",
        None,
    )?;

    Ok(finding_id)
}

/// A reviewer's decision on a pending queue item.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub queue_id: String,
    /// "approve" or "reject".
    pub action: String,
    pub reviewer: String,
    pub notes: Option<String>,
}

/// Apply a review decision atomically: queue transition, finding mirror,
/// change-log append, reviewer notification. Conflicts roll everything back.
pub fn review_decision(db: &HealthDb, request: &ReviewRequest) -> Result<(), ReviewError> {
    let (queue_status, finding_status, outcome) = match request.action.as_str() {
        "approve" => (QueueStatus::Approved, FindingStatus::Approved, "executed"),
        "reject" => (QueueStatus::Rejected, FindingStatus::Expired, "rejected"),
        other => return Err(ReviewError::UnknownAction(other.to_string())),
    };

    let item = db
        .get_queue_item(&request.queue_id)?
        .ok_or_else(|| ReviewError::NotFound(request.queue_id.clone()))?;

    db.conn_ref()
        .execute_batch("BEGIN IMMEDIATE")
        .map_err(DbError::Sqlite)?;

    let applied = (|| -> Result<(), ReviewError> {
        let transitioned = db.transition_queue_item(
            &request.queue_id,
            queue_status,
            &request.reviewer,
            request.notes.as_deref(),
        )?;
        if !transitioned {
            return Err(ReviewError::NotPending(request.queue_id.clone()));
        }

        if let Some(finding_id) = &item.finding_id {
            db.set_finding_status(finding_id, finding_status)?;
        }

        db.append_change_log(
            "review_decision",
            &serde_json::json!({
                "queueId": request.queue_id,
                "findingId": item.finding_id,
                "action": request.action,
                "notes": request.notes,
            }),
            outcome,
            Some(&request.reviewer),
        )?;

        db.insert_notification(
            &format!("Recommendation {}", if outcome == "executed" { "approved" } else { "rejected" }),
            &item.action_summary,
            item.severity.as_str(),
        )?;

        Ok(())
    })();

    match applied {
        Ok(()) => {
            db.conn_ref()
                .execute_batch("COMMIT")
                .map_err(DbError::Sqlite)?;
            Ok(())
        }
        Err(e) => {
            let _ = db.conn_ref().execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn finding_signal(finding_type: &str) -> Option<&'static str> {
    match finding_type {
        "traffic_drop" => Some("page_traffic_drop"),
        "ranking_loss" => Some("page_ranking_loss"),
        "speed_regression" => Some("page_speed_alert"),
        _ => None,
    }
}
