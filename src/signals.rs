//! Cross-agent signal bus over the shared `thyme_signals` log.
//!
//! Emission is best-effort coordination, never control flow: a failed insert
//! is logged and swallowed so no pipeline stage can be taken down by the bus.
//! Consumption filters by producer, event-type membership, and recency.

use rusqlite::params;
use uuid::Uuid;

use crate::db::{DbError, HealthDb, Signal};

/// The producer name this daemon writes into every emitted signal.
pub const SOURCE_AGENT: &str = "thyme";

/// Emit a signal. Returns the signal id when the write landed, `None` when
/// it did not; callers never branch on the outcome.
pub fn emit(db: &HealthDb, event_type: &str, payload: serde_json::Value) -> Option<String> {
    let id = format!("sig-{}", Uuid::new_v4());
    let result = db.conn_ref().execute(
        "INSERT INTO thyme_signals (id, source_agent, event_type, payload)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, SOURCE_AGENT, event_type, payload.to_string()],
    );
    match result {
        Ok(_) => {
            log::debug!("Signal emitted: {}", event_type);
            Some(id)
        }
        Err(e) => {
            log::warn!("Failed to emit signal {}: {}", event_type, e);
            None
        }
    }
}

/// Filter for [`query`].
#[derive(Debug, Clone, Default)]
pub struct SignalQuery<'a> {
    /// Only signals from this producer; `None` matches all producers.
    pub source_agent: Option<&'a str>,
    /// Event-type membership; empty matches all types.
    pub event_types: &'a [&'a str],
    /// Only signals newer than this many days.
    pub within_days: Option<i64>,
    pub limit: usize,
}

/// Query the shared log, newest first.
pub fn query(db: &HealthDb, filter: &SignalQuery<'_>) -> Result<Vec<Signal>, DbError> {
    let mut sql = String::from(
        "SELECT id, source_agent, event_type, payload, created_at
         FROM thyme_signals WHERE 1=1",
    );
    let mut bound: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(agent) = filter.source_agent {
        bound.push(Box::new(agent.to_string()));
        sql.push_str(&format!(" AND source_agent = ?{}", bound.len()));
    }

    if !filter.event_types.is_empty() {
        let mut placeholders = Vec::new();
        for event_type in filter.event_types {
            bound.push(Box::new(event_type.to_string()));
            placeholders.push(format!("?{}", bound.len()));
        }
        sql.push_str(&format!(" AND event_type IN ({})", placeholders.join(", ")));
    }

    if let Some(days) = filter.within_days {
        bound.push(Box::new(format!("-{} days", days)));
        sql.push_str(&format!(" AND created_at >= datetime('now', ?{})", bound.len()));
    }

    sql.push_str(" ORDER BY created_at DESC");
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    bound.push(Box::new(limit as i64));
    sql.push_str(&format!(" LIMIT ?{}", bound.len()));

    let mut stmt = db.conn_ref().prepare(&sql)?;
    let bound_refs: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(bound_refs.as_slice(), |row| {
        Ok(Signal {
            id: row.get(0)?,
            source_agent: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;

    let mut signals = Vec::new();
    for row in rows {
        signals.push(row?);
    }
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch_db;

    #[test]
    fn test_emit_and_query() {
        let db = scratch_db();
        emit(&db, "health_scan_complete", serde_json::json!({"pagesScanned": 42}));

        let signals = query(
            &db,
            &SignalQuery {
                source_agent: Some(SOURCE_AGENT),
                event_types: &["health_scan_complete"],
                within_days: Some(1),
                limit: 10,
            },
        )
        .expect("query");

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].event_type, "health_scan_complete");
        assert_eq!(signals[0].payload_value()["pagesScanned"], 42);
    }

    #[test]
    fn test_query_filters_by_type_membership() {
        let db = scratch_db();
        emit(&db, "page_traffic_drop", serde_json::json!({}));
        emit(&db, "page_speed_alert", serde_json::json!({}));
        emit(&db, "health_scan_complete", serde_json::json!({}));

        let signals = query(
            &db,
            &SignalQuery {
                source_agent: None,
                event_types: &["page_traffic_drop", "page_speed_alert"],
                within_days: None,
                limit: 10,
            },
        )
        .expect("query");
        assert_eq!(signals.len(), 2);
    }

    #[test]
    fn test_query_respects_limit() {
        let db = scratch_db();
        for i in 0..5 {
            emit(&db, "trending_search_term", serde_json::json!({"keyword": i}));
        }
        let signals = query(
            &db,
            &SignalQuery {
                limit: 3,
                ..Default::default()
            },
        )
        .expect("query");
        assert_eq!(signals.len(), 3);
    }
}
