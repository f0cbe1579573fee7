//! Snapshot store: per-day per-page records from each external data source.
//!
//! Analytics and search rows upsert on their natural key (page_url, date) in
//! chunks of 100, so a re-run within the same day rewrites rather than
//! duplicates. Speed scores are append-only; link health upserts by
//! (source, target).

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{AnalyticsSnapshot, DbError, HealthDb, LinkHealthRecord, SearchSnapshot, SpeedScore};

/// Max snapshot rows per committed upsert chunk.
pub const UPSERT_CHUNK: usize = 100;

fn map_analytics(row: &Row<'_>) -> rusqlite::Result<AnalyticsSnapshot> {
    Ok(AnalyticsSnapshot {
        page_url: row.get(0)?,
        snapshot_date: row.get(1)?,
        active_users: row.get(2)?,
        sessions: row.get(3)?,
        page_views: row.get(4)?,
        bounce_rate: row.get(5)?,
        avg_session_duration: row.get(6)?,
        users_previous_period: row.get(7)?,
        sessions_previous_period: row.get(8)?,
        traffic_change_pct: row.get(9)?,
    })
}

fn map_search(row: &Row<'_>) -> rusqlite::Result<SearchSnapshot> {
    Ok(SearchSnapshot {
        page_url: row.get(0)?,
        snapshot_date: row.get(1)?,
        total_clicks: row.get(2)?,
        total_impressions: row.get(3)?,
        avg_ctr: row.get(4)?,
        avg_position: row.get(5)?,
        previous_clicks: row.get(6)?,
        previous_impressions: row.get(7)?,
        previous_ctr: row.get(8)?,
        previous_position: row.get(9)?,
        position_change: row.get(10)?,
    })
}

fn map_speed(row: &Row<'_>) -> rusqlite::Result<SpeedScore> {
    Ok(SpeedScore {
        id: row.get(0)?,
        page_url: row.get(1)?,
        test_date: row.get(2)?,
        strategy: row.get(3)?,
        performance_score: row.get(4)?,
        accessibility_score: row.get(5)?,
        seo_score: row.get(6)?,
        best_practices_score: row.get(7)?,
        lcp_ms: row.get(8)?,
        fid_ms: row.get(9)?,
        cls: row.get(10)?,
        inp_ms: row.get(11)?,
        opportunities: row.get(12)?,
    })
}

const ANALYTICS_COLUMNS: &str = "page_url, snapshot_date, active_users, sessions, page_views,
    bounce_rate, avg_session_duration, users_previous_period, sessions_previous_period,
    traffic_change_pct";

const SEARCH_COLUMNS: &str = "page_url, snapshot_date, total_clicks, total_impressions, avg_ctr,
    avg_position, previous_clicks, previous_impressions, previous_ctr, previous_position,
    position_change";

const SPEED_COLUMNS: &str = "id, page_url, test_date, strategy, performance_score,
    accessibility_score, seo_score, best_practices_score, lcp_ms, fid_ms, cls, inp_ms,
    opportunities";

impl HealthDb {
    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    pub fn upsert_analytics_snapshots(
        &self,
        snapshots: &[AnalyticsSnapshot],
    ) -> Result<usize, DbError> {
        let mut written = 0usize;
        for chunk in snapshots.chunks(UPSERT_CHUNK) {
            self.with_transaction(|tx| {
                for snap in chunk {
                    tx.conn_ref().execute(
                        "INSERT INTO thyme_analytics_snapshots
                            (id, page_url, snapshot_date, active_users, sessions, page_views,
                             bounce_rate, avg_session_duration, users_previous_period,
                             sessions_previous_period, traffic_change_pct)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                         ON CONFLICT(page_url, snapshot_date) DO UPDATE SET
                            active_users = excluded.active_users,
                            sessions = excluded.sessions,
                            page_views = excluded.page_views,
                            bounce_rate = excluded.bounce_rate,
                            avg_session_duration = excluded.avg_session_duration,
                            users_previous_period = excluded.users_previous_period,
                            sessions_previous_period = excluded.sessions_previous_period,
                            traffic_change_pct = excluded.traffic_change_pct",
                        params![
                            format!("ga-{}", Uuid::new_v4()),
                            snap.page_url,
                            snap.snapshot_date,
                            snap.active_users,
                            snap.sessions,
                            snap.page_views,
                            snap.bounce_rate,
                            snap.avg_session_duration,
                            snap.users_previous_period,
                            snap.sessions_previous_period,
                            snap.traffic_change_pct,
                        ],
                    )?;
                }
                Ok(())
            })?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Latest analytics row per page path.
    pub fn latest_analytics_by_path(&self) -> Result<Vec<AnalyticsSnapshot>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_analytics_snapshots a
             WHERE a.snapshot_date = (
                 SELECT MAX(b.snapshot_date) FROM thyme_analytics_snapshots b
                 WHERE b.page_url = a.page_url)",
            ANALYTICS_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], map_analytics)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent analytics rows for one page path, newest first.
    pub fn analytics_for_path(
        &self,
        page_path: &str,
        limit: usize,
    ) -> Result<Vec<AnalyticsSnapshot>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_analytics_snapshots
             WHERE page_url = ?1 ORDER BY snapshot_date DESC LIMIT ?2",
            ANALYTICS_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![page_path, limit as i64], map_analytics)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub fn upsert_search_snapshots(&self, snapshots: &[SearchSnapshot]) -> Result<usize, DbError> {
        let mut written = 0usize;
        for chunk in snapshots.chunks(UPSERT_CHUNK) {
            self.with_transaction(|tx| {
                for snap in chunk {
                    tx.conn_ref().execute(
                        "INSERT INTO thyme_search_snapshots
                            (id, page_url, snapshot_date, total_clicks, total_impressions,
                             avg_ctr, avg_position, previous_clicks, previous_impressions,
                             previous_ctr, previous_position, position_change)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                         ON CONFLICT(page_url, snapshot_date) DO UPDATE SET
                            total_clicks = excluded.total_clicks,
                            total_impressions = excluded.total_impressions,
                            avg_ctr = excluded.avg_ctr,
                            avg_position = excluded.avg_position,
                            previous_clicks = excluded.previous_clicks,
                            previous_impressions = excluded.previous_impressions,
                            previous_ctr = excluded.previous_ctr,
                            previous_position = excluded.previous_position,
                            position_change = excluded.position_change",
                        params![
                            format!("gsc-{}", Uuid::new_v4()),
                            snap.page_url,
                            snap.snapshot_date,
                            snap.total_clicks,
                            snap.total_impressions,
                            snap.avg_ctr,
                            snap.avg_position,
                            snap.previous_clicks,
                            snap.previous_impressions,
                            snap.previous_ctr,
                            snap.previous_position,
                            snap.position_change,
                        ],
                    )?;
                }
                Ok(())
            })?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Latest search row per page URL.
    pub fn latest_search_by_url(&self) -> Result<Vec<SearchSnapshot>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_search_snapshots a
             WHERE a.snapshot_date = (
                 SELECT MAX(b.snapshot_date) FROM thyme_search_snapshots b
                 WHERE b.page_url = a.page_url)",
            SEARCH_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], map_search)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn search_for_url(
        &self,
        page_url: &str,
        limit: usize,
    ) -> Result<Vec<SearchSnapshot>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_search_snapshots
             WHERE page_url = ?1 ORDER BY snapshot_date DESC LIMIT ?2",
            SEARCH_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![page_url, limit as i64], map_search)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Speed scores
    // -----------------------------------------------------------------------

    /// Append a completed speed test. Returns the generated row id.
    pub fn insert_speed_score(&self, score: &SpeedScore) -> Result<String, DbError> {
        let id = format!("psi-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO thyme_speed_scores
                (id, page_url, test_date, strategy, performance_score, accessibility_score,
                 seo_score, best_practices_score, lcp_ms, fid_ms, cls, inp_ms, opportunities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                score.page_url,
                score.test_date,
                score.strategy,
                score.performance_score,
                score.accessibility_score,
                score.seo_score,
                score.best_practices_score,
                score.lcp_ms,
                score.fid_ms,
                score.cls,
                score.inp_ms,
                score.opportunities,
            ],
        )?;
        Ok(id)
    }

    /// Most recent speed score per page URL, across strategies.
    pub fn latest_speed_by_url(&self) -> Result<Vec<SpeedScore>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_speed_scores a
             WHERE a.created_at = (
                 SELECT MAX(b.created_at) FROM thyme_speed_scores b
                 WHERE b.page_url = a.page_url)
             GROUP BY a.page_url",
            SPEED_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], map_speed)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent speed score for one URL and strategy.
    pub fn latest_speed_for(
        &self,
        page_url: &str,
        strategy: &str,
    ) -> Result<Option<SpeedScore>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_speed_scores
             WHERE page_url = ?1 AND strategy = ?2
             ORDER BY created_at DESC LIMIT 1",
            SPEED_COLUMNS
        );
        match self
            .conn_ref()
            .query_row(&sql, params![page_url, strategy], map_speed)
        {
            Ok(score) => Ok(Some(score)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Link health
    // -----------------------------------------------------------------------

    /// Upsert a link-check result by (source, target). `first_detected_at`
    /// is preserved on conflict; a freshly-healthy row clears resolution.
    pub fn upsert_link_health(&self, record: &LinkHealthRecord) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO thyme_link_health
                (id, source_page_url, target_url, link_type, http_status, is_broken,
                 is_redirect, redirect_chain, redirect_count, error_message,
                 first_detected_at, last_checked_at, is_resolved, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(source_page_url, target_url) DO UPDATE SET
                link_type = excluded.link_type,
                http_status = excluded.http_status,
                is_broken = excluded.is_broken,
                is_redirect = excluded.is_redirect,
                redirect_chain = excluded.redirect_chain,
                redirect_count = excluded.redirect_count,
                error_message = excluded.error_message,
                last_checked_at = excluded.last_checked_at,
                is_resolved = excluded.is_resolved,
                resolved_at = excluded.resolved_at",
            params![
                format!("link-{}", Uuid::new_v4()),
                record.source_page_url,
                record.target_url,
                record.link_type,
                record.http_status,
                record.is_broken as i64,
                record.is_redirect as i64,
                record.redirect_chain,
                record.redirect_count,
                record.error_message,
                record.first_detected_at,
                record.last_checked_at,
                record.is_resolved as i64,
                record.resolved_at,
            ],
        )?;
        Ok(())
    }

    /// Target URLs currently recorded broken and unresolved.
    pub fn broken_link_targets(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT DISTINCT target_url FROM thyme_link_health
             WHERE is_broken = 1 AND is_resolved = 0
             ORDER BY target_url",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark a previously-broken target resolved.
    pub fn resolve_link(&self, target_url: &str) -> Result<usize, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn_ref().execute(
            "UPDATE thyme_link_health
             SET is_broken = 0, is_resolved = 1, resolved_at = ?2, last_checked_at = ?2
             WHERE target_url = ?1 AND is_broken = 1 AND is_resolved = 0",
            params![target_url, now],
        )?;
        Ok(changed)
    }

    /// (total broken, broken first detected within the last 24 h).
    pub fn broken_link_counters(&self) -> Result<(i64, i64), DbError> {
        let total: i64 = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM thyme_link_health WHERE is_broken = 1 AND is_resolved = 0",
            [],
            |row| row.get(0),
        )?;
        let new_24h: i64 = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM thyme_link_health
             WHERE is_broken = 1 AND is_resolved = 0
               AND first_detected_at >= datetime('now', '-1 day')",
            [],
            |row| row.get(0),
        )?;
        Ok((total, new_24h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch_db;

    fn analytics(path: &str, date: &str, users: i64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            page_url: path.to_string(),
            snapshot_date: date.to_string(),
            active_users: users,
            sessions: users + 5,
            page_views: users * 2,
            bounce_rate: Some(0.4),
            avg_session_duration: Some(62.0),
            users_previous_period: 120,
            sessions_previous_period: 130,
            traffic_change_pct: AnalyticsSnapshot::compute_change_pct(users, 120),
        }
    }

    #[test]
    fn test_analytics_upsert_is_idempotent() {
        let db = scratch_db();
        db.upsert_analytics_snapshots(&[analytics("/pricing", "2026-07-27", 110)])
            .expect("first");
        db.upsert_analytics_snapshots(&[analytics("/pricing", "2026-07-27", 95)])
            .expect("second");

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM thyme_analytics_snapshots", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1, "same natural key must not duplicate");

        let rows = db.latest_analytics_by_path().expect("latest");
        assert_eq!(rows[0].active_users, 95, "second write wins");
    }

    #[test]
    fn test_latest_analytics_picks_newest_date() {
        let db = scratch_db();
        db.upsert_analytics_snapshots(&[
            analytics("/a", "2026-07-20", 50),
            analytics("/a", "2026-07-27", 80),
        ])
        .expect("upsert");

        let rows = db.latest_analytics_by_path().expect("latest");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].snapshot_date, "2026-07-27");
    }

    #[test]
    fn test_speed_scores_append_only() {
        let db = scratch_db();
        let score = SpeedScore {
            id: String::new(),
            page_url: "https://x.com/a".to_string(),
            test_date: "2026-07-27".to_string(),
            strategy: "mobile".to_string(),
            performance_score: Some(91),
            accessibility_score: Some(88),
            seo_score: Some(100),
            best_practices_score: Some(95),
            lcp_ms: Some(1900.0),
            fid_ms: Some(12.0),
            cls: Some(0.02),
            inp_ms: Some(140.0),
            opportunities: "[]".to_string(),
        };
        db.insert_speed_score(&score).expect("first");
        db.insert_speed_score(&score).expect("second");

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM thyme_speed_scores", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 2);

        let latest = db.latest_speed_by_url().expect("latest");
        assert_eq!(latest.len(), 1, "grouped by url");
    }

    #[test]
    fn test_link_health_upsert_and_resolution() {
        let db = scratch_db();
        let now = Utc::now().to_rfc3339();
        let record = LinkHealthRecord {
            source_page_url: "https://x.com/old".to_string(),
            target_url: "https://x.com/old".to_string(),
            link_type: "internal".to_string(),
            http_status: Some(404),
            is_broken: true,
            is_redirect: false,
            redirect_chain: "[]".to_string(),
            redirect_count: 0,
            error_message: None,
            first_detected_at: now.clone(),
            last_checked_at: now,
            is_resolved: false,
            resolved_at: None,
        };
        db.upsert_link_health(&record).expect("upsert");
        db.upsert_link_health(&record).expect("re-upsert");

        assert_eq!(db.broken_link_targets().expect("targets").len(), 1);

        let resolved = db.resolve_link("https://x.com/old").expect("resolve");
        assert_eq!(resolved, 1);
        assert!(db.broken_link_targets().expect("targets").is_empty());

        let (total, _) = db.broken_link_counters().expect("counters");
        assert_eq!(total, 0);
    }
}
