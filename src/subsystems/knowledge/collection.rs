//! Persistent, named set of embedded chunks in SQLite.
//!
//! ```text
//! {db_dir}/
//! └── knowledge.db
//!     ├── collections (name, created_at)
//!     └── chunks      (collection, id, source, text, dimension, embedding, metadata, updated_at)
//! ```
//!
//! `(collection, id)` is the primary key; upserting an existing id replaces
//! the row in place, so storage order (rowid) is first-insertion order.
//! Embeddings are little-endian `f32` blobs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::error::AppError;

pub(crate) const DB_FILENAME: &str = "knowledge.db";

/// Schema version stored in `PRAGMA user_version`.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// A chunk ready to be written: text plus its embedding.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// `"{basename}_chunk_{index}"` for ingested files.
    pub id: String,
    pub source: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

/// A chunk as read back (embedding omitted).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredChunk {
    pub id: String,
    pub source: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeCollection {
    name: String,
    db_path: PathBuf,
}

impl KnowledgeCollection {
    /// Open (or create) collection `name` in `{db_dir}/knowledge.db`.
    ///
    /// Any failure here is a storage failure: the directory cannot be
    /// created, the database cannot be opened, or its schema is unknown.
    pub fn open(db_dir: &Path, name: &str) -> Result<Self, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidArgument("collection name must not be empty".into()));
        }
        fs::create_dir_all(db_dir).map_err(|e| {
            AppError::Storage(format!("knowledge: cannot create {}: {e}", db_dir.display()))
        })?;

        let collection = Self {
            name: name.to_string(),
            db_path: db_dir.join(DB_FILENAME),
        };
        collection.init_db()?;

        let conn = collection.open_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![collection.name, now_iso8601()],
        )
        .map_err(|e| AppError::Storage(format!("knowledge: register collection {name}: {e}")))?;

        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert or replace `records` in one transaction. Readers see either
    /// none or all of the batch.
    pub fn upsert(&self, records: &[ChunkRecord]) -> Result<usize, AppError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("knowledge: begin upsert tx: {e}")))?;

        let now = now_iso8601();
        for record in records {
            if record.embedding.is_empty() {
                return Err(AppError::InvalidArgument(format!(
                    "chunk {} has an empty embedding",
                    record.id
                )));
            }
            let metadata_json = serde_json::to_string(&record.metadata)
                .map_err(|e| AppError::Storage(format!("knowledge: serialize metadata: {e}")))?;
            tx.execute(
                "INSERT INTO chunks (collection, id, source, text, dimension, embedding, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    source = excluded.source,
                    text = excluded.text,
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at",
                params![
                    self.name,
                    record.id,
                    record.source,
                    record.text,
                    record.embedding.len() as i64,
                    encode_embedding(&record.embedding),
                    metadata_json,
                    now,
                ],
            )
            .map_err(|e| AppError::Storage(format!("knowledge: upsert chunk {}: {e}", record.id)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("knowledge: commit upsert tx: {e}")))?;
        Ok(records.len())
    }

    pub fn count(&self) -> Result<usize, AppError> {
        let conn = self.open_conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("knowledge: count chunks: {e}")))?;
        Ok(n as usize)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredChunk>, AppError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare("SELECT id, source, text, metadata FROM chunks WHERE collection = ?1 AND id = ?2")
            .map_err(|e| AppError::Storage(format!("knowledge: prepare get: {e}")))?;
        let mut rows = stmt
            .query_map(params![self.name, id], read_stored_chunk)
            .map_err(|e| AppError::Storage(format!("knowledge: query get {id}: {e}")))?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| AppError::Storage(format!("knowledge: map get row: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    /// Every chunk in storage order. No index, no cache: the cost grows with
    /// the collection.
    pub fn chunks(&self) -> Result<Vec<StoredChunk>, AppError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare("SELECT id, source, text, metadata FROM chunks WHERE collection = ?1 ORDER BY rowid")
            .map_err(|e| AppError::Storage(format!("knowledge: prepare scan: {e}")))?;
        let rows = stmt
            .query_map(params![self.name], read_stored_chunk)
            .map_err(|e| AppError::Storage(format!("knowledge: execute scan: {e}")))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|e| AppError::Storage(format!("knowledge: map scan row: {e}")))?);
        }
        Ok(chunks)
    }

    /// The `n` chunks most cosine-similar to `query`, best first.
    ///
    /// Only rows embedded with the same dimension as `query` are compared.
    /// Ties keep storage order. A zero query vector scores every row 0.
    pub fn nearest(&self, query: &[f32], n: usize) -> Result<Vec<(StoredChunk, f32)>, AppError> {
        if n == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, source, text, metadata, embedding FROM chunks
                 WHERE collection = ?1 AND dimension = ?2
                 ORDER BY rowid",
            )
            .map_err(|e| AppError::Storage(format!("knowledge: prepare nearest: {e}")))?;
        let rows = stmt
            .query_map(params![self.name, query.len() as i64], |row| {
                let chunk = read_stored_chunk(row)?;
                let blob: Vec<u8> = row.get(4)?;
                Ok((chunk, blob))
            })
            .map_err(|e| AppError::Storage(format!("knowledge: execute nearest: {e}")))?;

        let mut scored = Vec::new();
        for row in rows {
            let (chunk, blob) =
                row.map_err(|e| AppError::Storage(format!("knowledge: map nearest row: {e}")))?;
            let vector = decode_embedding(&blob)?;
            let score = cosine_similarity(query, &vector).unwrap_or(0.0);
            scored.push((chunk, score));
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            let total = self.count()?;
            if total > scored.len() {
                debug!(
                    collection = %self.name,
                    skipped = total - scored.len(),
                    dimension = query.len(),
                    "nearest: skipped chunks embedded with another dimension"
                );
            }
        }

        // `sort_by` is stable, so equal scores keep storage order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        Ok(scored)
    }

    fn init_db(&self) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("knowledge: read schema version: {e}")))?;

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS collections (
                    name TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chunks (
                    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
                    id TEXT NOT NULL,
                    source TEXT NOT NULL,
                    text TEXT NOT NULL,
                    dimension INTEGER NOT NULL,
                    embedding BLOB NOT NULL,
                    metadata TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );

                PRAGMA user_version = 1;
                ",
            )
            .map_err(|e| AppError::Storage(format!("knowledge: initialize schema: {e}")))?;
            return Ok(());
        }

        if version != SCHEMA_VERSION {
            return Err(AppError::Storage(format!(
                "knowledge: unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }

    /// Open a connection with WAL, foreign keys and a 5 s busy timeout.
    fn open_conn(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            AppError::Storage(format!("knowledge: open {}: {e}", self.db_path.display()))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Storage(format!("knowledge: set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AppError::Storage(format!("knowledge: set foreign_keys ON: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AppError::Storage(format!("knowledge: set busy_timeout: {e}")))?;

        Ok(conn)
    }
}

fn read_stored_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredChunk> {
    let metadata_json: String = row.get(3)?;
    let metadata = serde_json::from_str::<HashMap<String, String>>(&metadata_json).unwrap_or_default();
    Ok(StoredChunk {
        id: row.get(0)?,
        source: row.get(1)?,
        text: row.get(2)?,
        metadata,
    })
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, AppError> {
    if blob.len() % 4 != 0 {
        return Err(AppError::Storage(format!(
            "knowledge: embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((dot / denom) as f32)
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, text: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.into(),
            source: "unit.txt".into(),
            text: text.into(),
            embedding,
            metadata: HashMap::from([("source".to_string(), "unit.txt".to_string())]),
        }
    }

    fn open() -> (TempDir, KnowledgeCollection) {
        let tmp = TempDir::new().expect("tempdir");
        let col = KnowledgeCollection::open(&tmp.path().join("kb"), "unit").expect("open");
        (tmp, col)
    }

    #[test]
    fn open_creates_db_file() {
        let (_tmp, col) = open();
        assert!(col.db_path().exists());
        assert_eq!(col.count().unwrap(), 0);
    }

    #[test]
    fn upsert_same_id_overwrites() {
        let (_tmp, col) = open();
        col.upsert(&[record("a", "first", vec![1.0, 0.0])]).unwrap();
        col.upsert(&[record("a", "second", vec![0.0, 1.0])]).unwrap();
        assert_eq!(col.count().unwrap(), 1);
        assert_eq!(col.get("a").unwrap().unwrap().text, "second");
    }

    #[test]
    fn chunks_keep_insertion_order_after_overwrite() {
        let (_tmp, col) = open();
        col.upsert(&[
            record("a", "alpha", vec![1.0]),
            record("b", "beta", vec![1.0]),
        ])
        .unwrap();
        col.upsert(&[record("a", "alpha v2", vec![1.0])]).unwrap();
        let texts: Vec<_> = col.chunks().unwrap().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["alpha v2", "beta"]);
    }

    #[test]
    fn nearest_ranks_by_cosine() {
        let (_tmp, col) = open();
        col.upsert(&[
            record("x", "east", vec![1.0, 0.0]),
            record("y", "north", vec![0.0, 1.0]),
            record("z", "north-east", vec![0.7, 0.7]),
        ])
        .unwrap();
        let hits = col.nearest(&[0.0, 1.0], 2).unwrap();
        let texts: Vec<_> = hits.iter().map(|(c, _)| c.text.as_str()).collect();
        assert_eq!(texts, vec!["north", "north-east"]);
    }

    #[test]
    fn nearest_skips_other_dimensions() {
        let (_tmp, col) = open();
        col.upsert(&[
            record("short", "two dims", vec![1.0, 0.0]),
            record("long", "three dims", vec![1.0, 0.0, 0.0]),
        ])
        .unwrap();
        let hits = col.nearest(&[1.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "long");
    }

    #[test]
    fn nearest_on_empty_collection_is_empty() {
        let (_tmp, col) = open();
        assert!(col.nearest(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn collections_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let a = KnowledgeCollection::open(tmp.path(), "a").unwrap();
        let b = KnowledgeCollection::open(tmp.path(), "b").unwrap();
        a.upsert(&[record("1", "only in a", vec![1.0])]).unwrap();
        assert_eq!(a.count().unwrap(), 1);
        assert_eq!(b.count().unwrap(), 0);
    }

    #[test]
    fn reopen_sees_persisted_rows() {
        let tmp = TempDir::new().unwrap();
        {
            let col = KnowledgeCollection::open(tmp.path(), "kb").unwrap();
            col.upsert(&[record("1", "persisted", vec![0.5, 0.5])]).unwrap();
        }
        let col = KnowledgeCollection::open(tmp.path(), "kb").unwrap();
        assert_eq!(col.get("1").unwrap().unwrap().text, "persisted");
    }

    #[test]
    fn unwritable_location_is_storage_error() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();
        let err = KnowledgeCollection::open(&file.join("kb"), "kb").unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }

    #[test]
    fn cosine_of_zero_vector_is_none() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
    }
}
