//! Trend snapshots, conversion audits, and weekly digests.

use rusqlite::{params, Row};
use uuid::Uuid;

use super::{DbError, HealthDb, TrendSnapshot};

fn map_trend(row: &Row<'_>) -> rusqlite::Result<TrendSnapshot> {
    Ok(TrendSnapshot {
        id: row.get(0)?,
        period_type: row.get(1)?,
        snapshot_date: row.get(2)?,
        total_traffic: row.get(3)?,
        traffic_change_pct: row.get(4)?,
        avg_health_score: row.get(5)?,
        health_distribution: row.get(6)?,
        top_declining: row.get(7)?,
        top_improving: row.get(8)?,
        broken_links_count: row.get(9)?,
        new_broken_links: row.get(10)?,
        meta_issues_count: row.get(11)?,
    })
}

const TREND_COLUMNS: &str = "id, period_type, snapshot_date, total_traffic, traffic_change_pct,
    avg_health_score, health_distribution, top_declining, top_improving, broken_links_count,
    new_broken_links, meta_issues_count";

impl HealthDb {
    pub fn insert_trend_snapshot(&self, snap: &TrendSnapshot) -> Result<String, DbError> {
        let id = format!("trend-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO thyme_trend_snapshots
                (id, period_type, snapshot_date, total_traffic, traffic_change_pct,
                 avg_health_score, health_distribution, top_declining, top_improving,
                 broken_links_count, new_broken_links, meta_issues_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                snap.period_type,
                snap.snapshot_date,
                snap.total_traffic,
                snap.traffic_change_pct,
                snap.avg_health_score,
                snap.health_distribution,
                snap.top_declining,
                snap.top_improving,
                snap.broken_links_count,
                snap.new_broken_links,
                snap.meta_issues_count,
            ],
        )?;
        Ok(id)
    }

    /// Most recent snapshot for a period type, if any.
    pub fn latest_trend_snapshot(
        &self,
        period_type: &str,
    ) -> Result<Option<TrendSnapshot>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_trend_snapshots
             WHERE period_type = ?1 ORDER BY created_at DESC LIMIT 1",
            TREND_COLUMNS
        );
        match self
            .conn_ref()
            .query_row(&sql, params![period_type], map_trend)
        {
            Ok(snap) => Ok(Some(snap)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    pub fn insert_conversion_audit(
        &self,
        audit_date: &str,
        tracking_health: &str,
        key_event_count: i64,
        form_count: i64,
        total_submissions: i64,
        gaps: &serde_json::Value,
        recommendations: &serde_json::Value,
    ) -> Result<String, DbError> {
        let id = format!("conv-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO thyme_conversion_audits
                (id, audit_date, tracking_health, key_event_count, form_count,
                 total_submissions, gaps, recommendations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                audit_date,
                tracking_health,
                key_event_count,
                form_count,
                total_submissions,
                gaps.to_string(),
                recommendations.to_string(),
            ],
        )?;
        Ok(id)
    }

    pub fn insert_weekly_digest(
        &self,
        week_start: &str,
        summary: &str,
        metrics: &serde_json::Value,
    ) -> Result<String, DbError> {
        let id = format!("digest-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO thyme_weekly_digests (id, week_start, summary, metrics)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, week_start, summary, metrics.to_string()],
        )?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch_db;

    #[test]
    fn test_trend_snapshot_roundtrip() {
        let db = scratch_db();
        let snap = TrendSnapshot {
            id: String::new(),
            period_type: "weekly".to_string(),
            snapshot_date: "2026-07-26".to_string(),
            total_traffic: 4200,
            traffic_change_pct: -4.5,
            avg_health_score: Some(68.2),
            health_distribution: r#"{"0-19":1,"20-39":2,"40-59":5,"60-79":12,"80-100":20}"#
                .to_string(),
            top_declining: "[]".to_string(),
            top_improving: "[]".to_string(),
            broken_links_count: 3,
            new_broken_links: 1,
            meta_issues_count: 9,
        };
        db.insert_trend_snapshot(&snap).expect("insert");

        let latest = db
            .latest_trend_snapshot("weekly")
            .expect("query")
            .expect("present");
        assert_eq!(latest.total_traffic, 4200);
        assert!(db.latest_trend_snapshot("daily").expect("query").is_none());
    }

    #[test]
    fn test_conversion_audit_insert() {
        let db = scratch_db();
        db.insert_conversion_audit(
            "2026-07-26",
            "not_configured",
            0,
            5,
            37,
            &serde_json::json!([]),
            &serde_json::json!([{"priority": "critical"}]),
        )
        .expect("insert");

        let health: String = db
            .conn_ref()
            .query_row(
                "SELECT tracking_health FROM thyme_conversion_audits LIMIT 1",
                [],
                |row| row.get(0),
            )
            .expect("read");
        assert_eq!(health, "not_configured");
    }
}
