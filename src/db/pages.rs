//! Page inventory store operations.
//!
//! The inventory is rewritten only by the CMS sync; every other stage reads
//! it. Updates land in transaction batches and inserts in multi-row chunks
//! so a large site syncs in a handful of statements.

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{DbError, HealthDb, Page, PageType};

/// Max rows per multi-row INSERT statement.
pub const INSERT_CHUNK: usize = 100;

/// Max page updates per committed batch.
pub const UPDATE_BATCH: usize = 50;

/// Field set the CMS sync writes for an existing page.
#[derive(Debug, Clone)]
pub struct PageUpsert {
    pub url: String,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub page_type: PageType,
    pub cms_page_id: Option<String>,
    pub has_form: bool,
    pub form_ids: Vec<String>,
    pub has_cta: bool,
    pub cta_ids: Vec<String>,
    pub published_at: Option<String>,
    pub last_updated_at: Option<String>,
    pub content_age_days: Option<i64>,
}

fn map_page(row: &Row<'_>) -> rusqlite::Result<Page> {
    Ok(Page {
        id: row.get(0)?,
        url: row.get(1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        meta_description: row.get(4)?,
        page_type: PageType::parse(&row.get::<_, String>(5)?),
        cms_page_id: row.get(6)?,
        has_form: row.get::<_, i64>(7)? != 0,
        form_ids: row.get(8)?,
        has_cta: row.get::<_, i64>(9)? != 0,
        cta_ids: row.get(10)?,
        published_at: row.get(11)?,
        last_updated_at: row.get(12)?,
        content_age_days: row.get(13)?,
        is_indexed: row.get::<_, i64>(14)? != 0,
        is_active: row.get::<_, i64>(15)? != 0,
        title_length: row.get(16)?,
        meta_description_length: row.get(17)?,
        meta_issues: row.get(18)?,
        has_broken_links: row.get::<_, i64>(19)? != 0,
        broken_link_count: row.get(20)?,
        health_score: row.get(21)?,
        health_breakdown: row.get(22)?,
        last_health_check_at: row.get(23)?,
    })
}

const PAGE_COLUMNS: &str = "id, url, slug, title, meta_description, page_type, cms_page_id,
    has_form, form_ids, has_cta, cta_ids, published_at, last_updated_at, content_age_days,
    is_indexed, is_active, title_length, meta_description_length, meta_issues,
    has_broken_links, broken_link_count, health_score, health_breakdown, last_health_check_at";

impl HealthDb {
    /// All active pages, ordered by URL for deterministic iteration.
    pub fn active_pages(&self) -> Result<Vec<Page>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_pages WHERE is_active = 1 ORDER BY url",
            PAGE_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], map_page)?;

        let mut pages = Vec::new();
        for row in rows {
            pages.push(row?);
        }
        Ok(pages)
    }

    pub fn get_page_by_url(&self, url: &str) -> Result<Option<Page>, DbError> {
        let sql = format!("SELECT {} FROM thyme_pages WHERE url = ?1", PAGE_COLUMNS);
        match self.conn_ref().query_row(&sql, params![url], map_page) {
            Ok(page) => Ok(Some(page)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Insert new pages in multi-row chunks of [`INSERT_CHUNK`].
    pub fn insert_pages(&self, pages: &[PageUpsert]) -> Result<usize, DbError> {
        let mut inserted = 0usize;
        for chunk in pages.chunks(INSERT_CHUNK) {
            self.with_transaction(|tx| {
                for page in chunk {
                    tx.conn_ref().execute(
                        "INSERT INTO thyme_pages
                            (id, url, slug, title, meta_description, page_type, cms_page_id,
                             has_form, form_ids, has_cta, cta_ids, published_at,
                             last_updated_at, content_age_days, title_length,
                             meta_description_length)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                         ON CONFLICT(url) DO NOTHING",
                        params![
                            format!("page-{}", Uuid::new_v4()),
                            page.url,
                            page.slug,
                            page.title,
                            page.meta_description,
                            page.page_type.as_str(),
                            page.cms_page_id,
                            page.has_form as i64,
                            serde_json::to_string(&page.form_ids).unwrap_or_else(|_| "[]".into()),
                            page.has_cta as i64,
                            serde_json::to_string(&page.cta_ids).unwrap_or_else(|_| "[]".into()),
                            page.published_at,
                            page.last_updated_at,
                            page.content_age_days,
                            page.title.as_deref().map(|t| t.chars().count() as i64),
                            page.meta_description.as_deref().map(|m| m.chars().count() as i64),
                        ],
                    )?;
                }
                Ok(())
            })?;
            inserted += chunk.len();
        }
        Ok(inserted)
    }

    /// Apply CMS-derived updates in committed batches of [`UPDATE_BATCH`].
    /// Returns how many rows actually changed.
    pub fn update_pages(&self, updates: &[PageUpsert]) -> Result<usize, DbError> {
        let mut changed = 0usize;
        for batch in updates.chunks(UPDATE_BATCH) {
            changed += self.with_transaction(|tx| {
                let mut batch_changed = 0usize;
                for page in batch {
                    batch_changed += tx.conn_ref().execute(
                        "UPDATE thyme_pages SET
                            slug = ?2, title = ?3, meta_description = ?4, page_type = ?5,
                            cms_page_id = ?6, has_form = ?7, form_ids = ?8, has_cta = ?9,
                            cta_ids = ?10, published_at = ?11, last_updated_at = ?12,
                            content_age_days = ?13, title_length = ?14,
                            meta_description_length = ?15, is_active = 1,
                            updated_at = datetime('now')
                         WHERE url = ?1",
                        params![
                            page.url,
                            page.slug,
                            page.title,
                            page.meta_description,
                            page.page_type.as_str(),
                            page.cms_page_id,
                            page.has_form as i64,
                            serde_json::to_string(&page.form_ids).unwrap_or_else(|_| "[]".into()),
                            page.has_cta as i64,
                            serde_json::to_string(&page.cta_ids).unwrap_or_else(|_| "[]".into()),
                            page.published_at,
                            page.last_updated_at,
                            page.content_age_days,
                            page.title.as_deref().map(|t| t.chars().count() as i64),
                            page.meta_description.as_deref().map(|m| m.chars().count() as i64),
                        ],
                    )?;
                }
                Ok(batch_changed)
            })?;
        }
        Ok(changed)
    }

    /// Record live-fetch form detection for a landing page.
    pub fn set_page_has_form(&self, url: &str, has_form: bool) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE thyme_pages SET has_form = ?2, updated_at = datetime('now') WHERE url = ?1",
            params![url, has_form as i64],
        )?;
        Ok(())
    }

    /// Batch-update meta issue sets, [`UPDATE_BATCH`] rows per transaction.
    pub fn update_meta_issues(&self, issues: &[(String, Vec<String>)]) -> Result<(), DbError> {
        for batch in issues.chunks(UPDATE_BATCH) {
            self.with_transaction(|tx| {
                for (url, issue_list) in batch {
                    tx.conn_ref().execute(
                        "UPDATE thyme_pages SET meta_issues = ?2, updated_at = datetime('now')
                         WHERE url = ?1",
                        params![
                            url,
                            serde_json::to_string(issue_list).unwrap_or_else(|_| "[]".into())
                        ],
                    )?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Persist a computed health score with its breakdown.
    pub fn update_health_scores(
        &self,
        scores: &[(String, i64, String)],
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        for batch in scores.chunks(UPDATE_BATCH) {
            self.with_transaction(|tx| {
                for (url, score, breakdown_json) in batch {
                    tx.conn_ref().execute(
                        "UPDATE thyme_pages SET health_score = ?2, health_breakdown = ?3,
                            last_health_check_at = ?4, updated_at = datetime('now')
                         WHERE url = ?1",
                        params![url, score, breakdown_json, now],
                    )?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Reflect link-checker results onto the page rows.
    pub fn update_broken_link_counts(
        &self,
        counts: &[(String, i64)],
    ) -> Result<(), DbError> {
        self.with_transaction(|tx| {
            for (url, broken) in counts {
                tx.conn_ref().execute(
                    "UPDATE thyme_pages SET has_broken_links = ?2, broken_link_count = ?3,
                        updated_at = datetime('now')
                     WHERE url = ?1",
                    params![url, (*broken > 0) as i64, broken],
                )?;
            }
            Ok(())
        })
    }

    /// Pages that have never had a speed test, for spot-check priority.
    pub fn pages_never_speed_tested(&self, limit: usize) -> Result<Vec<Page>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_pages p
             WHERE p.is_active = 1
               AND NOT EXISTS (SELECT 1 FROM thyme_speed_scores s WHERE s.page_url = p.url)
             ORDER BY p.url LIMIT ?1",
            PAGE_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], map_page)?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row?);
        }
        Ok(pages)
    }

    /// Active pages ordered by ascending health score (worst first).
    pub fn lowest_scored_pages(&self, limit: usize) -> Result<Vec<Page>, DbError> {
        let sql = format!(
            "SELECT {} FROM thyme_pages
             WHERE is_active = 1 AND health_score IS NOT NULL
             ORDER BY health_score ASC LIMIT ?1",
            PAGE_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], map_page)?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row?);
        }
        Ok(pages)
    }
}
