//! Knowledge subsystem: chunked, embedded course material and the hybrid
//! retriever in front of it.
//!
//! [`KnowledgeBase`] owns one [`KnowledgeCollection`] and the [`Embedder`]
//! selected for it when it was opened. All operations are synchronous; run
//! them on a blocking thread from async code.

pub mod collection;
pub mod embedding;
pub mod retriever;
pub mod tokenize;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{EmbeddingConfig, KnowledgeConfig};
use crate::error::AppError;

pub use collection::{ChunkRecord, KnowledgeCollection, StoredChunk};
pub use embedding::{Embedder, EmbeddingMode, StrategyKind};
pub use retriever::{
    KeywordHit, NO_CONTEXT_SENTINEL, PASSAGE_SEPARATOR, RetrievedContext, Retriever, SearchMode,
};

use tokenize::token_set;

/// Outcome of a successful [`KnowledgeBase::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub chunks: usize,
}

pub struct KnowledgeBase {
    collection: KnowledgeCollection,
    embedder: Embedder,
}

impl KnowledgeBase {
    /// Open the configured collection and select its embedding strategy.
    ///
    /// May probe the network (auto mode); never call from an async context.
    pub fn open(knowledge: &KnowledgeConfig, embedding: &EmbeddingConfig) -> Result<Self, AppError> {
        let collection = KnowledgeCollection::open(&knowledge.db_dir, &knowledge.collection)?;
        let embedder = Embedder::from_config(embedding);
        Ok(Self::from_parts(collection, embedder))
    }

    pub fn from_parts(collection: KnowledgeCollection, embedder: Embedder) -> Self {
        info!(
            collection = %collection.name(),
            db = %collection.db_path().display(),
            strategy = %embedder.strategy(),
            dimension = embedder.dimension(),
            "knowledge base ready"
        );
        Self { collection, embedder }
    }

    pub fn collection(&self) -> &KnowledgeCollection {
        &self.collection
    }

    pub fn strategy(&self) -> StrategyKind {
        self.embedder.strategy()
    }

    /// Embed with this collection's active strategy.
    pub fn embed(&self, inputs: &[&str]) -> Vec<Vec<f32>> {
        self.embedder.embed(inputs)
    }

    /// Read `file_path`, hard-split it into `chunk_size`-character chunks and
    /// upsert them in one batch as `"{basename}_chunk_{i}"`.
    ///
    /// A missing file is `NotFound` and nothing is written.
    pub fn ingest(&self, file_path: &Path, chunk_size: usize) -> Result<IngestReport, AppError> {
        if chunk_size == 0 {
            return Err(AppError::InvalidArgument("chunk_size must be > 0".into()));
        }
        if !file_path.is_file() {
            return Err(AppError::NotFound(format!("file not found: {}", file_path.display())));
        }

        let text = fs::read_to_string(file_path)?;
        let chunks = chunk_text(&text, chunk_size);
        let source = file_path.display().to_string();
        let basename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.clone());

        info!(source = %source, chunks = chunks.len(), chunk_size, "ingesting file");

        let inputs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed(&inputs);

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, embedding))| ChunkRecord {
                id: format!("{basename}_chunk_{i}"),
                source: source.clone(),
                text: text.clone(),
                embedding,
                metadata: HashMap::from([("source".to_string(), source.clone())]),
            })
            .collect();

        let written = self.collection.upsert(&records)?;
        info!(source = %source, chunks = written, "ingestion complete");
        Ok(IngestReport { source, chunks: written })
    }

    /// Texts of the `n` chunks nearest to `query`, best first.
    pub fn vector_search(&self, query: &str, n: usize) -> Result<Vec<String>, AppError> {
        let query_vec = self.embedder.embed(&[query]).into_iter().next().unwrap_or_default();
        let hits = self.collection.nearest(&query_vec, n)?;
        Ok(hits.into_iter().map(|(chunk, _)| chunk.text).collect())
    }

    /// Every chunk sharing at least one token with `query`, by overlap
    /// descending. Scans the whole collection.
    pub fn keyword_search(&self, query: &str) -> Result<Vec<KeywordHit>, AppError> {
        let query_tokens = token_set(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<KeywordHit> = self
            .collection
            .chunks()?
            .into_iter()
            .filter_map(|chunk| {
                let overlap = token_set(&chunk.text).intersection(&query_tokens).count();
                (overlap > 0).then_some(KeywordHit { text: chunk.text, overlap })
            })
            .collect();
        hits.sort_by(|a, b| b.overlap.cmp(&a.overlap));
        Ok(hits)
    }

    /// Vector and keyword rankings fused into at most `n` passages.
    pub fn hybrid_search(&self, query: &str, n: usize) -> Result<RetrievedContext, AppError> {
        let vector_hits = self.vector_search(query, n.saturating_mul(2))?;
        let keyword_hits = self.keyword_search(query)?;
        let fused = retriever::fuse(&vector_hits, &keyword_hits, n);
        debug!(
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            fused = fused.len(),
            "hybrid search"
        );
        Ok(RetrievedContext::from_passages(fused))
    }

    /// External search surface: the sentinel, or passages joined by
    /// [`PASSAGE_SEPARATOR`].
    pub fn search(&self, query: &str, mode: SearchMode, n_results: usize) -> Result<String, AppError> {
        info!(query = %query, mode = ?mode, n_results, "knowledge search");
        let context = match mode {
            SearchMode::Vector => RetrievedContext::from_passages(self.vector_search(query, n_results)?),
            SearchMode::Hybrid => self.hybrid_search(query, n_results)?,
        };
        Ok(context.to_string())
    }
}

impl Retriever for KnowledgeBase {
    fn retrieve(&self, query: &str, n: usize) -> Result<RetrievedContext, AppError> {
        self.hybrid_search(query, n)
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("collection", &self.collection.name())
            .field("embedder", &self.embedder)
            .finish()
    }
}

/// Consecutive, non-overlapping `chunk_size`-character slices of `text`.
/// The last one may be shorter; nothing is padded or trimmed.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(chunk_size).map(|c| c.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn kb() -> (TempDir, KnowledgeBase) {
        let tmp = TempDir::new().expect("tempdir");
        let collection = KnowledgeCollection::open(&tmp.path().join("kb"), "unit").expect("open");
        (tmp, KnowledgeBase::from_parts(collection, Embedder::hash_only()))
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn chunk_text_hard_splits_by_chars() {
        assert_eq!(chunk_text("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(chunk_text("abcdef", 3), vec!["abc", "def"]);
        assert!(chunk_text("", 3).is_empty());
    }

    #[test]
    fn chunk_text_counts_characters_not_bytes() {
        let chunks = chunk_text("深度优先搜索", 4);
        assert_eq!(chunks, vec!["深度优先", "搜索"]);
    }

    #[test]
    fn ingest_assigns_ids_and_source_metadata() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "notes.txt", &"x".repeat(12));
        let report = kb.ingest(&path, 5).unwrap();
        assert_eq!(report.chunks, 3);

        let last = kb.collection().get("notes.txt_chunk_2").unwrap().unwrap();
        assert_eq!(last.text, "xx");
        assert_eq!(last.metadata.get("source"), Some(&path.display().to_string()));
    }

    #[test]
    fn ingest_missing_file_is_not_found_and_writes_nothing() {
        let (tmp, kb) = kb();
        let err = kb.ingest(&tmp.path().join("missing.txt"), 500).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(kb.collection().count().unwrap(), 0);
    }

    #[test]
    fn ingest_rejects_zero_chunk_size() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "a.txt", "abc");
        assert!(matches!(kb.ingest(&path, 0), Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn keyword_search_excludes_zero_overlap() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "two.txt", "DFS pushes onto a stack.|Hadoop stores in HDFS.....");
        kb.ingest(&path, 25).unwrap();
        let hits = kb.keyword_search("DFS stack").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].overlap, 2);
    }

    #[test]
    fn keyword_search_is_stable_for_ties() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "ties.txt", "graph aaaagraph bbbbgraph cccc");
        kb.ingest(&path, 10).unwrap();
        let hits = kb.keyword_search("graph").unwrap();
        let texts: Vec<_> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["graph aaaa", "graph bbbb", "graph cccc"]);
    }

    #[test]
    fn vector_mode_on_empty_collection_is_sentinel() {
        let (_tmp, kb) = kb();
        assert_eq!(kb.search("anything", SearchMode::Vector, 2).unwrap(), NO_CONTEXT_SENTINEL);
    }

    #[test]
    fn retriever_impl_is_hybrid_search() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "dfs.txt", "DFS uses a stack");
        kb.ingest(&path, 500).unwrap();
        let ctx = Retriever::retrieve(&kb, "what does dfs use", 2).unwrap();
        assert_eq!(ctx.passages(), &["DFS uses a stack".to_string()]);
    }

    #[test]
    fn hybrid_search_with_huge_n_still_finds_the_chunk() {
        let (tmp, kb) = kb();
        let path = write(&tmp, "dfs.txt", "DFS uses a stack");
        kb.ingest(&path, 500).unwrap();
        let rendered = kb.search("dfs stack", SearchMode::Hybrid, usize::MAX / 2 + 1).unwrap();
        assert_eq!(rendered, "DFS uses a stack");
    }
}
