//! Findings, decision queue, change log, notifications, and guardrails.

use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{
    to_json_list, DbError, DecisionQueueItem, Finding, FindingStatus, Guardrail, HealthDb,
    QueueStatus, Severity, ViolationAction, OPEN_FINDING_STATUSES,
};

/// Hours until a drafted recommendation expires unreviewed.
pub const REVIEW_WINDOW_HOURS: i64 = 48;

/// Field set for a new finding row.
#[derive(Debug, Clone)]
pub struct FindingDraft {
    pub page_url: Option<String>,
    pub finding_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub business_impact: Option<String>,
    pub agent_loop_iterations: i64,
    pub tools_used: Vec<String>,
    pub investigation_summary: Option<String>,
    pub status: FindingStatus,
    pub skip_reason: Option<String>,
    pub health_score_at_detection: Option<i64>,
}

/// Field set for a new decision-queue row.
#[derive(Debug, Clone)]
pub struct QueueDraft {
    pub finding_id: Option<String>,
    pub action_type: String,
    pub action_summary: String,
    pub action_detail: serde_json::Value,
    pub severity: Severity,
    pub confidence: f64,
    pub risk_level: String,
}

fn map_finding(row: &Row<'_>) -> rusqlite::Result<Finding> {
    Ok(Finding {
        id: row.get(0)?,
        page_url: row.get(1)?,
        finding_type: row.get(2)?,
        severity: Severity::parse(&row.get::<_, String>(3)?),
        title: row.get(4)?,
        description: row.get(5)?,
        business_impact: row.get(6)?,
        agent_loop_iterations: row.get(7)?,
        tools_used: row.get(8)?,
        investigation_summary: row.get(9)?,
        status: row.get(10)?,
        skip_reason: row.get(11)?,
        expires_at: row.get(12)?,
        health_score_at_detection: row.get(13)?,
        health_score_at_resolution: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn map_queue_item(row: &Row<'_>) -> rusqlite::Result<DecisionQueueItem> {
    Ok(DecisionQueueItem {
        id: row.get(0)?,
        finding_id: row.get(1)?,
        action_type: row.get(2)?,
        action_summary: row.get(3)?,
        action_detail: row.get(4)?,
        severity: Severity::parse(&row.get::<_, String>(5)?),
        confidence: row.get(6)?,
        risk_level: row.get(7)?,
        priority: row.get(8)?,
        status: row.get(9)?,
        reviewer: row.get(10)?,
        reviewed_at: row.get(11)?,
        review_notes: row.get(12)?,
        expires_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

const FINDING_COLUMNS: &str = "id, page_url, finding_type, severity, title, description,
    business_impact, agent_loop_iterations, tools_used, investigation_summary, status,
    skip_reason, expires_at, health_score_at_detection, health_score_at_resolution, created_at";

const QUEUE_COLUMNS: &str = "id, finding_id, action_type, action_summary, action_detail,
    severity, confidence, risk_level, priority, status, reviewer, reviewed_at, review_notes,
    expires_at, created_at";

impl HealthDb {
    // -----------------------------------------------------------------------
    // Findings
    // -----------------------------------------------------------------------

    /// Insert a finding. Drafted recommendations get a review expiry window;
    /// audit-only skips do not.
    pub fn insert_finding(&self, draft: &FindingDraft) -> Result<String, DbError> {
        let id = format!("find-{}", Uuid::new_v4());
        let expires_at = match draft.status {
            FindingStatus::RecommendationDrafted => {
                Some((Utc::now() + Duration::hours(REVIEW_WINDOW_HOURS)).to_rfc3339())
            }
            _ => None,
        };
        self.conn_ref().execute(
            "INSERT INTO thyme_findings
                (id, page_url, finding_type, severity, title, description, business_impact,
                 agent_loop_iterations, tools_used, investigation_summary, status, skip_reason,
                 expires_at, health_score_at_detection)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                draft.page_url,
                draft.finding_type,
                draft.severity.as_str(),
                draft.title,
                draft.description,
                draft.business_impact,
                draft.agent_loop_iterations,
                to_json_list(&draft.tools_used),
                draft.investigation_summary,
                draft.status.as_str(),
                draft.skip_reason,
                expires_at,
                draft.health_score_at_detection,
            ],
        )?;
        Ok(id)
    }

    /// Dedup pre-check: does this page already have an open investigation?
    pub fn has_open_finding_for(&self, page_url: &str) -> Result<bool, DbError> {
        let placeholders = OPEN_FINDING_STATUSES
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT 1 FROM thyme_findings WHERE page_url = ?1 AND status IN ({}) LIMIT 1",
            placeholders
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let mut query_params: Vec<&dyn rusqlite::types::ToSql> = vec![&page_url];
        for status in OPEN_FINDING_STATUSES {
            query_params.push(status);
        }
        Ok(stmt.exists(query_params.as_slice())?)
    }

    pub fn get_finding(&self, id: &str) -> Result<Option<Finding>, DbError> {
        let sql = format!("SELECT {} FROM thyme_findings WHERE id = ?1", FINDING_COLUMNS);
        match self.conn_ref().query_row(&sql, params![id], map_finding) {
            Ok(finding) => Ok(Some(finding)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    pub fn set_finding_status(&self, id: &str, status: FindingStatus) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE thyme_findings SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Auto-resolution sweep: close open findings whose page has recovered
    /// past `threshold`, recording the score at resolution time.
    pub fn resolve_recovered_findings(&self, threshold: i64) -> Result<usize, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE thyme_findings
             SET status = 'resolved',
                 health_score_at_resolution = (
                     SELECT p.health_score FROM thyme_pages p
                     WHERE p.url = thyme_findings.page_url),
                 updated_at = datetime('now')
             WHERE status IN ('new', 'recommendation_drafted', 'approved')
               AND page_url IN (
                   SELECT url FROM thyme_pages
                   WHERE health_score IS NOT NULL AND health_score >= ?1)",
            params![threshold],
        )?;
        Ok(changed)
    }

    /// Expire drafted findings and pending queue items past their window.
    /// Returns (findings expired, queue items expired).
    pub fn expire_stale_reviews(&self) -> Result<(usize, usize), DbError> {
        let now = Utc::now().to_rfc3339();
        let findings = self.conn_ref().execute(
            "UPDATE thyme_findings SET status = 'expired', updated_at = datetime('now')
             WHERE status = 'recommendation_drafted' AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        let queue = self.conn_ref().execute(
            "UPDATE thyme_decision_queue SET status = 'expired'
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        Ok((findings, queue))
    }

    // -----------------------------------------------------------------------
    // Decision queue
    // -----------------------------------------------------------------------

    /// Insert a pending review item. Priority derives from severity; the
    /// review window matches the finding's 48 h expiry.
    pub fn insert_queue_item(&self, draft: &QueueDraft) -> Result<String, DbError> {
        let id = format!("dq-{}", Uuid::new_v4());
        let expires_at = (Utc::now() + Duration::hours(REVIEW_WINDOW_HOURS)).to_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO thyme_decision_queue
                (id, finding_id, action_type, action_summary, action_detail, severity,
                 confidence, risk_level, priority, status, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
            params![
                id,
                draft.finding_id,
                draft.action_type,
                draft.action_summary,
                draft.action_detail.to_string(),
                draft.severity.as_str(),
                draft.confidence,
                draft.risk_level,
                draft.severity.queue_priority(),
                expires_at,
            ],
        )?;
        Ok(id)
    }

    pub fn get_queue_item(&self, id: &str) -> Result<Option<DecisionQueueItem>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_decision_queue WHERE id = ?1",
            QUEUE_COLUMNS
        );
        match self.conn_ref().query_row(&sql, params![id], map_queue_item) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Transition a queue item out of pending. Returns false when the item
    /// was not pending (already reviewed or expired); the caller treats
    /// that as a conflict.
    pub fn transition_queue_item(
        &self,
        id: &str,
        status: QueueStatus,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE thyme_decision_queue
             SET status = ?2, reviewer = ?3, reviewed_at = datetime('now'), review_notes = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![id, status.as_str(), reviewer, notes],
        )?;
        Ok(changed == 1)
    }

    // -----------------------------------------------------------------------
    // Change log & notifications
    // -----------------------------------------------------------------------

    pub fn append_change_log(
        &self,
        action: &str,
        detail: &serde_json::Value,
        outcome: &str,
        executed_by: Option<&str>,
    ) -> Result<String, DbError> {
        let id = format!("log-{}", Uuid::new_v4());
        let executed_at = if outcome == "executed" {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        self.conn_ref().execute(
            "INSERT INTO thyme_change_log (id, action, detail, outcome, executed_at, executed_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, action, detail.to_string(), outcome, executed_at, executed_by],
        )?;
        Ok(id)
    }

    pub fn insert_notification(
        &self,
        title: &str,
        body: &str,
        severity: &str,
    ) -> Result<String, DbError> {
        let id = format!("ntf-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO thyme_notifications (id, title, body, severity)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, title, body, severity],
        )?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Guardrails
    // -----------------------------------------------------------------------

    pub fn active_guardrails(&self) -> Result<Vec<Guardrail>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, name, rule_category, threshold, config, violation_action
             FROM thyme_guardrails WHERE is_active = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Guardrail {
                id: row.get(0)?,
                name: row.get(1)?,
                rule_category: row.get(2)?,
                threshold: row.get(3)?,
                config: row.get(4)?,
                violation_action: ViolationAction::parse(&row.get::<_, String>(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch_db;

    fn draft(url: &str, status: FindingStatus) -> FindingDraft {
        FindingDraft {
            page_url: Some(url.to_string()),
            finding_type: "traffic_drop".to_string(),
            severity: Severity::High,
            title: "Traffic fell 58% week over week".to_string(),
            description: Some("Organic sessions collapsed after the June refresh.".to_string()),
            business_impact: Some("Lead volume at risk.".to_string()),
            agent_loop_iterations: 3,
            tools_used: vec!["get_page_analytics".to_string()],
            investigation_summary: Some("Ranking loss on the head term.".to_string()),
            status,
            skip_reason: None,
            health_score_at_detection: Some(24),
        }
    }

    #[test]
    fn test_open_finding_dedup() {
        let db = scratch_db();
        assert!(!db.has_open_finding_for("https://x.com/a").expect("check"));

        db.insert_finding(&draft("https://x.com/a", FindingStatus::RecommendationDrafted))
            .expect("insert");
        assert!(db.has_open_finding_for("https://x.com/a").expect("check"));

        // Skipped findings do not block a fresh investigation.
        db.insert_finding(&FindingDraft {
            skip_reason: Some("No concrete angle".to_string()),
            status: FindingStatus::Skipped,
            ..draft("https://x.com/b", FindingStatus::Skipped)
        })
        .expect("insert skip");
        assert!(!db.has_open_finding_for("https://x.com/b").expect("check"));
    }

    #[test]
    fn test_drafted_finding_gets_expiry() {
        let db = scratch_db();
        let id = db
            .insert_finding(&draft("https://x.com/a", FindingStatus::RecommendationDrafted))
            .expect("insert");
        let finding = db.get_finding(&id).expect("get").expect("present");
        assert!(finding.expires_at.is_some());

        let skip_id = db
            .insert_finding(&FindingDraft {
                status: FindingStatus::Skipped,
                skip_reason: Some("dup".to_string()),
                ..draft("https://x.com/a", FindingStatus::Skipped)
            })
            .expect("insert");
        let skip = db.get_finding(&skip_id).expect("get").expect("present");
        assert!(skip.expires_at.is_none());
    }

    #[test]
    fn test_queue_transition_requires_pending() {
        let db = scratch_db();
        let queue_id = db
            .insert_queue_item(&QueueDraft {
                finding_id: None,
                action_type: "content_refresh".to_string(),
                action_summary: "Refresh the pricing page copy".to_string(),
                action_detail: serde_json::json!({"pageUrl": "https://x.com/pricing"}),
                severity: Severity::Critical,
                confidence: 0.8,
                risk_level: "low".to_string(),
            })
            .expect("insert");

        let item = db.get_queue_item(&queue_id).expect("get").expect("present");
        assert_eq!(item.priority, 10);
        assert_eq!(item.status, "pending");

        assert!(db
            .transition_queue_item(&queue_id, QueueStatus::Approved, "reviewer@x.com", None)
            .expect("first transition"));
        assert!(
            !db.transition_queue_item(&queue_id, QueueStatus::Rejected, "reviewer@x.com", None)
                .expect("second transition"),
            "non-pending item must not transition again"
        );
    }

    #[test]
    fn test_executed_log_rows_carry_actor_and_timestamp() {
        let db = scratch_db();
        db.append_change_log(
            "review_decision",
            &serde_json::json!({"id": "dq-1"}),
            "executed",
            Some("reviewer@x.com"),
        )
        .expect("log");

        let (executed_at, executed_by): (Option<String>, Option<String>) = db
            .conn_ref()
            .query_row(
                "SELECT executed_at, executed_by FROM thyme_change_log LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("read");
        assert!(executed_at.is_some());
        assert_eq!(executed_by.as_deref(), Some("reviewer@x.com"));
    }

    #[test]
    fn test_resolve_recovered_findings() {
        let db = scratch_db();
        db.conn_ref()
            .execute(
                "INSERT INTO thyme_pages (id, url, health_score) VALUES
                    ('p1', 'https://x.com/a', 72),
                    ('p2', 'https://x.com/b', 31)",
                [],
            )
            .expect("seed pages");
        let id = db
            .insert_finding(&draft("https://x.com/a", FindingStatus::RecommendationDrafted))
            .expect("insert a");
        db.insert_finding(&draft("https://x.com/b", FindingStatus::RecommendationDrafted))
            .expect("insert b");

        let resolved = db.resolve_recovered_findings(50).expect("sweep");
        assert_eq!(resolved, 1, "only the recovered page's finding closes");
        assert!(!db.has_open_finding_for("https://x.com/a").expect("check"));
        assert!(db.has_open_finding_for("https://x.com/b").expect("check"));

        let finding = db.get_finding(&id).expect("get").expect("present");
        assert_eq!(finding.status, "resolved");
        assert_eq!(finding.health_score_at_resolution, Some(72));
    }
}
