//! Relational document store.
//!
//! One SQLite table holds every memory row; a companion FTS5 virtual table
//! mirrors `(id, text)` and is kept in sync by triggers, so the sparse index
//! can never drift from the document table (invariant: every dense-index id
//! has a row here, and the FTS mirror reflects every row).
//!
//! `AUTOINCREMENT` gives monotonically issued, never-reused ids - the join
//! key shared with the dense index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;

use crate::error::Result;

// ============================================================================
// SCHEMA
// ============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);

-- Full-text mirror of (id, text). doc_id is UNINDEXED so phrase queries
-- only ever match content.
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    content,
    doc_id UNINDEXED,
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(doc_id, content) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
    DELETE FROM documents_fts WHERE doc_id = old.id;
END;

CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
    DELETE FROM documents_fts WHERE doc_id = old.id;
    INSERT INTO documents_fts(doc_id, content) VALUES (new.id, new.text);
END;
"#;

// ============================================================================
// ROWS AND FILTERS
// ============================================================================

/// One raw row from the documents table
#[derive(Debug, Clone)]
pub struct DocumentRow {
    /// Primary key
    pub id: i64,
    /// Memory content
    pub text: String,
    /// Metadata JSON blob as stored
    pub metadata: String,
    /// Seconds since epoch
    pub created_at: f64,
    /// Seconds since epoch
    pub updated_at: f64,
}

/// Equality predicates over metadata keys, compiled to `json_extract` clauses
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    /// Match `metadata.session_id`
    pub session_id: Option<String>,
    /// Match `metadata.persona_id`
    pub persona_id: Option<String>,
    /// Arbitrary additional `metadata.<key> = value` predicates
    pub extra: Vec<(String, Value)>,
}

impl MetadataFilter {
    /// Filter that matches everything
    pub fn any() -> Self {
        Self::default()
    }

    /// Whether no predicate is set
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.persona_id.is_none() && self.extra.is_empty()
    }

    /// Apply the predicates to an already-parsed metadata object.
    pub fn matches(&self, metadata: &Value) -> bool {
        let check = |key: &str, expected: &Value| metadata.get(key) == Some(expected);
        if let Some(sid) = &self.session_id {
            if !check("session_id", &Value::String(sid.clone())) {
                return false;
            }
        }
        if let Some(pid) = &self.persona_id {
            if !check("persona_id", &Value::String(pid.clone())) {
                return false;
            }
        }
        self.extra.iter().all(|(key, value)| check(key, value))
    }

    /// Compile to SQL `WHERE` clauses plus bound parameters. Both the JSON
    /// path and the expected value are bound, never interpolated.
    fn to_sql(&self) -> (Vec<String>, Vec<rusqlite::types::Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        let mut push = |key: &str, value: rusqlite::types::Value| {
            clauses.push("json_extract(metadata, ?) = ?".to_string());
            values.push(rusqlite::types::Value::Text(format!("$.{key}")));
            values.push(value);
        };

        if let Some(sid) = &self.session_id {
            push("session_id", rusqlite::types::Value::Text(sid.clone()));
        }
        if let Some(pid) = &self.persona_id {
            push("persona_id", rusqlite::types::Value::Text(pid.clone()));
        }
        for (key, value) in &self.extra {
            let sql_value = match value {
                Value::String(s) => rusqlite::types::Value::Text(s.clone()),
                Value::Number(n) if n.is_i64() => {
                    rusqlite::types::Value::Integer(n.as_i64().unwrap_or_default())
                }
                Value::Number(n) => {
                    rusqlite::types::Value::Real(n.as_f64().unwrap_or_default())
                }
                Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
                other => rusqlite::types::Value::Text(other.to_string()),
            };
            push(key, sql_value);
        }

        (clauses, values)
    }
}

// ============================================================================
// DOCUMENT STORE
// ============================================================================

/// SQLite-backed document table plus its FTS5 mirror
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    /// Exclusive access to the connection.
    ///
    /// A poisoned lock is recovered: any in-flight transaction was already
    /// rolled back when its guard unwound, so the connection itself is sound.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Row helpers usable inside an open transaction (`Transaction` derefs
    // to `Connection`).
    // ------------------------------------------------------------------

    /// Insert a row, returning the new id.
    pub(crate) fn insert_in(
        conn: &Connection,
        text: &str,
        metadata_json: &str,
        now: f64,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO documents (text, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![text, metadata_json, now, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update the text column (the FTS trigger re-mirrors it).
    pub(crate) fn update_text_in(conn: &Connection, id: i64, text: &str, now: f64) -> Result<()> {
        conn.execute(
            "UPDATE documents SET text = ?1, updated_at = ?2 WHERE id = ?3",
            params![text, now, id],
        )?;
        Ok(())
    }

    /// Update the metadata column.
    pub(crate) fn update_metadata_in(
        conn: &Connection,
        id: i64,
        metadata_json: &str,
        now: f64,
    ) -> Result<()> {
        conn.execute(
            "UPDATE documents SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![metadata_json, now, id],
        )?;
        Ok(())
    }

    /// Delete rows by id, returning how many existed.
    pub(crate) fn delete_in(conn: &Connection, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM documents WHERE id IN ({placeholders})");
        let deleted = conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(deleted)
    }

    fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
        Ok(DocumentRow {
            id: row.get(0)?,
            text: row.get(1)?,
            metadata: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Insert a single row outside any larger transaction.
    pub fn insert(&self, text: &str, metadata_json: &str, now: f64) -> Result<i64> {
        Self::insert_in(&self.lock(), text, metadata_json, now)
    }

    /// Fetch rows by id. Missing ids are simply absent from the result.
    pub fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<DocumentRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, text, metadata, created_at, updated_at
             FROM documents WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), Self::row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fetch one row by id.
    pub fn get_by_id(&self, id: i64) -> Result<Option<DocumentRow>> {
        Ok(self.get_by_ids(&[id])?.into_iter().next())
    }

    /// Stable pagination ordered by `id ASC`.
    pub fn get_paginated(
        &self,
        limit: usize,
        offset: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<DocumentRow>> {
        let conn = self.lock();
        let (clauses, mut values) = filter.to_sql();
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, text, metadata, created_at, updated_at
             FROM documents {where_sql} ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        values.push(rusqlite::types::Value::Integer(limit as i64));
        values.push(rusqlite::types::Value::Integer(offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Update text and/or metadata of one row. At least one of the two must
    /// be provided.
    pub fn update(
        &self,
        id: i64,
        text: Option<&str>,
        metadata_json: Option<&str>,
        now: f64,
    ) -> Result<()> {
        if text.is_none() && metadata_json.is_none() {
            return Err(crate::error::MemoryError::Validation(
                "update requires at least one of text or metadata".to_string(),
            ));
        }
        let conn = self.lock();
        if let Some(text) = text {
            Self::update_text_in(&conn, id, text, now)?;
        }
        if let Some(metadata) = metadata_json {
            Self::update_metadata_in(&conn, id, metadata, now)?;
        }
        Ok(())
    }

    /// Delete rows by id.
    pub fn delete(&self, ids: &[i64]) -> Result<usize> {
        Self::delete_in(&self.lock(), ids)
    }

    /// Row count under a filter.
    pub fn count(&self, filter: &MetadataFilter) -> Result<i64> {
        let conn = self.lock();
        let (clauses, values) = filter.to_sql();
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT COUNT(*) FROM documents {where_sql}");
        let count = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count)
    }

    /// Row counts grouped by `metadata.status`; rows without a status count
    /// as `active`.
    pub fn count_by_status(&self) -> Result<HashMap<String, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(json_extract(metadata, '$.status'), 'active') AS status, COUNT(*)
             FROM documents GROUP BY status",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    /// Every id in the table, ascending.
    pub fn all_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// BM25-ranked full-text search over the mirror. Returns raw
    /// `bm25()` ranks (lower = better) in best-first order.
    pub fn fts_search(&self, match_query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT doc_id, bm25(documents_fts) AS score
             FROM documents_fts
             WHERE documents_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![match_query, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rebuild the FTS mirror from the documents table. Returns the number
    /// of mirrored rows.
    pub fn rebuild_fts(&self) -> Result<usize> {
        let conn = self.lock();
        conn.execute("DELETE FROM documents_fts", [])?;
        let inserted = conn.execute(
            "INSERT INTO documents_fts(doc_id, content) SELECT id, text FROM documents",
            [],
        )?;
        tracing::info!("rebuilt FTS mirror with {inserted} rows");
        Ok(inserted)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session: &str) -> String {
        format!(r#"{{"importance":0.5,"session_id":"{session}","status":"active"}}"#)
    }

    #[test]
    fn test_insert_assigns_monotonic_ids() {
        let store = DocumentStore::open_in_memory().unwrap();
        let a = store.insert("first", &meta("s1"), 1.0).unwrap();
        let b = store.insert("second", &meta("s1"), 2.0).unwrap();
        assert!(b > a);

        // Deleting the newest row must not allow id reuse.
        store.delete(&[b]).unwrap();
        let c = store.insert("third", &meta("s1"), 3.0).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_roundtrip_and_pagination_order() {
        let store = DocumentStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.insert(&format!("memory {i}"), &meta("s1"), i as f64).unwrap();
        }

        let page = store.get_paginated(2, 2, &MetadataFilter::any()).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id < page[1].id);
        assert_eq!(page[0].text, "memory 2");
    }

    #[test]
    fn test_fts_mirror_tracks_insert_update_delete() {
        let store = DocumentStore::open_in_memory().unwrap();
        let id = store.insert("user works at Acme", &meta("s1"), 1.0).unwrap();

        let hits = store.fts_search("\"Acme\"", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id);

        store.update(id, Some("user works at Globex"), None, 2.0).unwrap();
        assert!(store.fts_search("\"Acme\"", 10).unwrap().is_empty());
        assert_eq!(store.fts_search("\"Globex\"", 10).unwrap().len(), 1);

        store.delete(&[id]).unwrap();
        assert!(store.fts_search("\"Globex\"", 10).unwrap().is_empty());
    }

    #[test]
    fn test_filters_compile_and_match() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert("a", &meta("s1"), 1.0).unwrap();
        store.insert("b", &meta("s2"), 1.0).unwrap();

        let filter = MetadataFilter {
            session_id: Some("s1".to_string()),
            ..Default::default()
        };
        assert_eq!(store.count(&filter).unwrap(), 1);
        assert_eq!(store.count(&MetadataFilter::any()).unwrap(), 2);

        let rows = store.get_paginated(10, 0, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "a");
    }

    #[test]
    fn test_count_by_status_defaults_missing_to_active() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert("a", "{}", 1.0).unwrap();
        store
            .insert("b", r#"{"status":"archived"}"#, 1.0)
            .unwrap();

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get("active"), Some(&1));
        assert_eq!(counts.get("archived"), Some(&1));
    }

    #[test]
    fn test_update_requires_some_change() {
        let store = DocumentStore::open_in_memory().unwrap();
        let id = store.insert("a", "{}", 1.0).unwrap();
        assert!(store.update(id, None, None, 2.0).is_err());
    }

    #[test]
    fn test_rebuild_fts() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert("alpha beta", "{}", 1.0).unwrap();
        store.insert("gamma delta", "{}", 1.0).unwrap();

        let rebuilt = store.rebuild_fts().unwrap();
        assert_eq!(rebuilt, 2);
        assert_eq!(store.fts_search("\"alpha\"", 10).unwrap().len(), 1);
    }
}
