//! Integration tests for the knowledge base: ingestion, vector, keyword and
//! hybrid search over a real SQLite collection with the hash embedding.
//!
//! Run with:
//!   cargo test --test test_knowledge

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use lite_tutor::config::Config;
use lite_tutor::error::AppError;
use lite_tutor::subsystems::knowledge::embedding::{HashEmbedding, HASH_DIMENSION};
use lite_tutor::subsystems::knowledge::{
    Embedder, KnowledgeBase, KnowledgeCollection, NO_CONTEXT_SENTINEL, PASSAGE_SEPARATOR,
    SearchMode, StrategyKind,
};

// ── helpers ──────────────────────────────────────────────────────────────────

fn offline_kb() -> (TempDir, KnowledgeBase) {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = Config::offline(tmp.path());
    let kb = KnowledgeBase::open(&cfg.knowledge, &cfg.embedding).expect("open knowledge base");
    (tmp, kb)
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).expect("write fixture");
    path
}

/// Two one-line chunks: only the first shares tokens with "DFS stack".
fn ingest_dfs_and_hadoop(tmp: &TempDir, kb: &KnowledgeBase) {
    let a = write_file(tmp, "dfs.txt", "DFS uses a stack to remember where to backtrack.");
    let b = write_file(tmp, "hadoop.txt", "Hadoop stores data in HDFS blocks.");
    kb.ingest(&a, 500).unwrap();
    kb.ingest(&b, 500).unwrap();
}

// ── Embedding ─────────────────────────────────────────────────────────────────

#[test]
fn hash_embedding_is_deterministic_across_instances() {
    let text = "Depth-first search pushes vertices onto a stack";
    let a = HashEmbedding::new().embed_one(text);
    let b = HashEmbedding::new().embed_one(text);
    assert_eq!(a.len(), HASH_DIMENSION);
    assert_eq!(
        a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
        b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
    );
    assert_eq!(Embedder::hash_only().embed(&[text]), vec![a]);
}

#[test]
fn offline_mode_selects_hash_strategy() {
    let (tmp, kb) = offline_kb();
    assert_eq!(kb.strategy(), StrategyKind::Hash);
    assert!(tmp.path().join("knowledge").join("knowledge.db").exists());
}

// ── Ingestion ─────────────────────────────────────────────────────────────────

#[test]
fn ingest_produces_ceil_chunks_that_reassemble_the_file() {
    let (tmp, kb) = offline_kb();
    let content: String = (0..1234).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let path = write_file(&tmp, "alphabet.txt", &content);

    let report = kb.ingest(&path, 500).unwrap();
    assert_eq!(report.chunks, 3);

    let chunks: Vec<String> = (0..3)
        .map(|i| kb.collection().get(&format!("alphabet.txt_chunk_{i}")).unwrap().unwrap().text)
        .collect();
    assert_eq!(chunks[0].chars().count(), 500);
    assert_eq!(chunks[1].chars().count(), 500);
    assert_eq!(chunks[2].chars().count(), 234);
    assert_eq!(chunks.concat(), content);
}

#[test]
fn reingesting_a_file_overwrites_instead_of_duplicating() {
    let (tmp, kb) = offline_kb();
    let path = write_file(&tmp, "notes.txt", "first version");
    kb.ingest(&path, 500).unwrap();

    fs::write(&path, "second version").unwrap();
    kb.ingest(&path, 500).unwrap();

    assert_eq!(kb.collection().count().unwrap(), 1);
    let chunk = kb.collection().get("notes.txt_chunk_0").unwrap().unwrap();
    assert_eq!(chunk.text, "second version");
}

#[test]
fn empty_file_ingests_zero_chunks() {
    let (tmp, kb) = offline_kb();
    let path = write_file(&tmp, "empty.txt", "");
    assert_eq!(kb.ingest(&path, 500).unwrap().chunks, 0);
    assert_eq!(kb.collection().count().unwrap(), 0);
}

#[test]
fn missing_file_is_not_found_and_collection_untouched() {
    let (tmp, kb) = offline_kb();
    ingest_dfs_and_hadoop(&tmp, &kb);

    let err = kb.ingest(&tmp.path().join("nope.txt"), 500).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(kb.collection().count().unwrap(), 2);
}

#[test]
fn chunks_persist_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::offline(tmp.path());
    {
        let kb = KnowledgeBase::open(&cfg.knowledge, &cfg.embedding).unwrap();
        let path = write_file(&tmp, "dfs.txt", "DFS uses a stack");
        kb.ingest(&path, 500).unwrap();
    }
    let kb = KnowledgeBase::open(&cfg.knowledge, &cfg.embedding).unwrap();
    assert_eq!(kb.collection().count().unwrap(), 1);
}

#[test]
fn collections_in_one_file_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let db_dir = tmp.path().join("kb");
    let a = KnowledgeBase::from_parts(
        KnowledgeCollection::open(&db_dir, "course_a").unwrap(),
        Embedder::hash_only(),
    );
    let b = KnowledgeBase::from_parts(
        KnowledgeCollection::open(&db_dir, "course_b").unwrap(),
        Embedder::hash_only(),
    );
    let path = write_file(&tmp, "dfs.txt", "DFS uses a stack");
    a.ingest(&path, 500).unwrap();

    assert_eq!(a.collection().count().unwrap(), 1);
    assert_eq!(b.collection().count().unwrap(), 0);
    assert_eq!(b.search("DFS stack", SearchMode::Hybrid, 2).unwrap(), NO_CONTEXT_SENTINEL);
}

// ── Search ────────────────────────────────────────────────────────────────────

#[test]
fn keyword_search_dfs_stack_has_single_hit() {
    let (tmp, kb) = offline_kb();
    ingest_dfs_and_hadoop(&tmp, &kb);

    let hits = kb.keyword_search("DFS stack").unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].text.starts_with("DFS uses a stack"));
    assert_eq!(hits[0].overlap, 2);
}

#[test]
fn vector_search_ranks_identical_text_first() {
    let (tmp, kb) = offline_kb();
    ingest_dfs_and_hadoop(&tmp, &kb);

    let hits = kb.vector_search("Hadoop stores data in HDFS blocks.", 2).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0], "Hadoop stores data in HDFS blocks.");
}

#[test]
fn hybrid_results_are_bounded_and_drawn_from_component_rankings() {
    let (tmp, kb) = offline_kb();
    let notes = "KMP builds a next array for the pattern. \
                 DFS uses a stack and backtracks. \
                 BFS uses a queue, level by level. \
                 Hadoop splits files into HDFS blocks. \
                 A stack is last in, first out. \
                 A queue is first in, first out.";
    let path = write_file(&tmp, "notes.txt", notes);
    kb.ingest(&path, 40).unwrap();

    let query = "which search uses a stack";
    for n in 1..=3 {
        let fused = kb.hybrid_search(query, n).unwrap();
        let passages = fused.passages();
        assert!(!passages.is_empty());
        assert!(passages.len() <= n);

        let vector = kb.vector_search(query, 2 * n).unwrap();
        let keyword: Vec<String> = kb
            .keyword_search(query)
            .unwrap()
            .into_iter()
            .take(4 * n)
            .map(|h| h.text)
            .collect();
        for p in passages {
            assert!(vector.contains(p) || keyword.contains(p), "unexpected passage {p:?}");
        }
    }
}

#[test]
fn hybrid_search_renders_passages_with_separator() {
    let (tmp, kb) = offline_kb();
    ingest_dfs_and_hadoop(&tmp, &kb);

    let rendered = kb.search("DFS stack Hadoop", SearchMode::Hybrid, 2).unwrap();
    let parts: Vec<&str> = rendered.split(PASSAGE_SEPARATOR).collect();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().any(|p| p.starts_with("DFS uses a stack")));
}

#[test]
fn empty_collection_renders_sentinel() {
    let (_tmp, kb) = offline_kb();
    assert_eq!(kb.search("what is KMP", SearchMode::Hybrid, 2).unwrap(), NO_CONTEXT_SENTINEL);
    assert_eq!(
        kb.search("what is KMP", SearchMode::Hybrid, 2).unwrap(),
        "No relevant context found in the local knowledge base."
    );
    assert!(kb.hybrid_search("what is KMP", 2).unwrap().is_empty());
}
