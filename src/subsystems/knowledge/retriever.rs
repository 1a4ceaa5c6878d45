//! Hybrid fusion of vector and keyword rankings, and the [`Retriever`]
//! capability handed to the tutor.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Rendered in place of passages when retrieval finds nothing.
pub const NO_CONTEXT_SENTINEL: &str = "No relevant context found in the local knowledge base.";

/// Separator between passages in a rendered context.
pub const PASSAGE_SEPARATOR: &str = "\n---\n";

/// A chunk that shares at least one token with the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordHit {
    pub text: String,
    /// Distinct tokens present in both the query and the chunk.
    pub overlap: usize,
}

/// Result of a retrieval. Never an empty `Passages`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievedContext {
    Passages(Vec<String>),
    NoneFound,
}

impl RetrievedContext {
    pub fn from_passages(passages: Vec<String>) -> Self {
        if passages.is_empty() {
            Self::NoneFound
        } else {
            Self::Passages(passages)
        }
    }

    pub fn passages(&self) -> &[String] {
        match self {
            Self::Passages(p) => p,
            Self::NoneFound => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoneFound)
    }
}

impl fmt::Display for RetrievedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passages(p) => f.write_str(&p.join(PASSAGE_SEPARATOR)),
            Self::NoneFound => f.write_str(NO_CONTEXT_SENTINEL),
        }
    }
}

/// Search mode of the external `search` operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown search mode '{other}' (expected vector or hybrid)")),
        }
    }
}

/// Submit a query, get ranked passages. What the tutor needs from the
/// knowledge layer.
pub trait Retriever: Send + Sync {
    fn retrieve(&self, query: &str, n: usize) -> Result<RetrievedContext, AppError>;
}

/// Fuse a vector ranking and a keyword ranking into the top `n` texts.
///
/// `vector_hits` should hold the top `2n` vector results; only the first `4n`
/// keyword hits are counted. Vector rank `i` adds `1 / (i + 1)`; keyword rank
/// `r` adds `overlap + 0.5 / (r + 1)`. Identical texts merge. Equal scores
/// keep first-seen order (vector list first).
pub fn fuse(vector_hits: &[String], keyword_hits: &[KeywordHit], n: usize) -> Vec<String> {
    let mut order: Vec<(String, f64)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut add = |text: &str, contribution: f64| match index.get(text) {
        Some(&i) => order[i].1 += contribution,
        None => {
            index.insert(text.to_string(), order.len());
            order.push((text.to_string(), contribution));
        }
    };

    for (i, text) in vector_hits.iter().enumerate() {
        add(text, 1.0 / (i as f64 + 1.0));
    }
    for (r, hit) in keyword_hits.iter().take(n.saturating_mul(4)).enumerate() {
        add(&hit.text, hit.overlap as f64 + 0.5 / (r as f64 + 1.0));
    }

    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    order.into_iter().take(n).map(|(text, _)| text).collect()
}
