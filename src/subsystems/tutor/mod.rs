//! Tutor subsystem: a staged, per-session conversation driver.
//!
//! Every session walks `diagnose → explain → quiz → validate → complete`
//! exactly once, one stage per call to [`TutorFsm::advance`]. The explain
//! stage is the only one that touches the knowledge base; validate grades the
//! learner's answer against keywords pulled from what explain retrieved.

pub mod session_store;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::subsystems::knowledge::tokenize::tokenize;
use crate::subsystems::knowledge::{PASSAGE_SEPARATOR, RetrievedContext, Retriever};

pub use session_store::{InMemorySessionStore, SessionStore, TutorSession};

/// Passages requested from the retriever in the explain stage.
pub const DEFAULT_N_RESULTS: usize = 2;

/// Quiz keywords kept per session.
pub const MAX_KEYWORDS: usize = 4;

/// Minimum answer length (characters) that passes when no keywords exist.
pub const MIN_FREE_ANSWER_CHARS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Diagnose,
    Explain,
    Quiz,
    Validate,
    Complete,
}

impl Stage {
    /// The stage after this one. `Complete` is terminal.
    pub fn next(self) -> Self {
        match self {
            Self::Diagnose => Self::Explain,
            Self::Explain => Self::Quiz,
            Self::Quiz => Self::Validate,
            Self::Validate | Self::Complete => Self::Complete,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Diagnose => "diagnose",
            Self::Explain => "explain",
            Self::Quiz => "quiz",
            Self::Validate => "validate",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one [`TutorFsm::advance`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorReply {
    pub session_id: String,
    /// Stage that handled this input.
    pub stage: Stage,
    /// Stage that will handle the next input.
    pub next_stage: Stage,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

/// Verdict of the validate stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grade {
    pub passed: bool,
    pub matched: Vec<String>,
}

pub struct TutorFsm {
    store: Arc<dyn SessionStore>,
    retriever: Arc<dyn Retriever>,
    n_results: usize,
}

impl TutorFsm {
    pub fn new(store: Arc<dyn SessionStore>, retriever: Arc<dyn Retriever>) -> Self {
        Self { store, retriever, n_results: DEFAULT_N_RESULTS }
    }

    pub fn with_n_results(mut self, n_results: usize) -> Self {
        self.n_results = n_results.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Feed one user input into a session and move it one stage forward.
    ///
    /// Without an id, or with an id the store does not know (never seen or
    /// expired), a new session starts at diagnose. A supplied id is kept;
    /// otherwise a UUID is generated. Turns on the same id are serialized.
    pub fn advance(&self, session_id: Option<&str>, input: &str) -> Result<TutorReply, AppError> {
        let session_id = match session_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let lock = self.store.session_lock(&session_id)?;
        let _turn = lock
            .lock()
            .map_err(|_| AppError::Session(format!("session {session_id} lock poisoned")))?;

        let mut session = match self.store.get(&session_id)? {
            Some(s) => s,
            None => self.store.create(&session_id)?,
        };

        let handled = session.stage;
        let mut matched_keywords = None;
        let mut passed = None;

        let response = match handled {
            Stage::Diagnose => {
                session.question = input.to_string();
                diagnose_prompt(&session.question)
            }
            Stage::Explain => {
                let context = self.retriever.retrieve(&session.question, self.n_results)?;
                session.keywords = match &context {
                    RetrievedContext::Passages(p) => {
                        extract_keywords(&p.join(PASSAGE_SEPARATOR), MAX_KEYWORDS)
                    }
                    RetrievedContext::NoneFound => Vec::new(),
                };
                session.context = context.to_string();
                debug!(
                    session_id = %session_id,
                    passages = context.passages().len(),
                    keywords = ?session.keywords,
                    "context retrieved"
                );
                explain_prompt(&session.context)
            }
            Stage::Quiz => quiz_prompt(&session.keywords),
            Stage::Validate => {
                let grade = grade(&session.keywords, input);
                let response = verdict(&grade, &session.keywords);
                passed = Some(grade.passed);
                matched_keywords = Some(grade.matched);
                response
            }
            Stage::Complete => closing_message(),
        };

        session.stage = handled.next();
        self.store.update(&session)?;

        info!(
            session_id = %session_id,
            stage = %handled,
            next = %session.stage,
            passed = ?passed,
            "tutor turn"
        );

        Ok(TutorReply {
            session_id,
            stage: handled,
            next_stage: session.stage,
            response,
            matched_keywords,
            passed,
        })
    }
}

/// Up to `limit` most frequent tokens longer than one character, most
/// frequent first; ties go to the token seen first.
pub fn extract_keywords(context: &str, limit: usize) -> Vec<String> {
    let mut stats: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, token) in tokenize(context).into_iter().enumerate() {
        if token.chars().count() <= 1 {
            continue;
        }
        stats.entry(token).or_insert((0, pos)).0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> =
        stats.into_iter().map(|(tok, (count, first))| (tok, count, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(limit).map(|(tok, _, _)| tok).collect()
}

/// Grade a free-text answer: keywords are matched as substrings of the
/// lower-cased answer, in keyword order.
pub fn grade(keywords: &[String], answer: &str) -> Grade {
    let lowered = answer.to_lowercase();
    let matched: Vec<String> = keywords
        .iter()
        .filter(|k| lowered.contains(k.as_str()))
        .cloned()
        .collect();
    let passed = !matched.is_empty()
        || (keywords.is_empty() && answer.chars().count() >= MIN_FREE_ANSWER_CHARS);
    Grade { passed, matched }
}

fn diagnose_prompt(question: &str) -> String {
    format!(
        "Let's work through \"{question}\" together. Before I explain anything, \
         tell me where you are: what have you tried so far, and where exactly are you stuck?"
    )
}

fn explain_prompt(context: &str) -> String {
    format!(
        "Here is what the knowledge base has on your question:\n\n{context}\n\n\
         Read it through, then say \"continue\" when you're ready for a quick check."
    )
}

fn quiz_prompt(keywords: &[String]) -> String {
    if keywords.is_empty() {
        "Quick check: summarise what you have just learned in a sentence or two.".to_string()
    } else {
        format!(
            "Quick check: explain the idea in your own words. A good answer mentions: {}.",
            keywords.join(", ")
        )
    }
}

fn verdict(grade: &Grade, keywords: &[String]) -> String {
    match (grade.passed, keywords.is_empty()) {
        (true, false) => format!("Well done! You covered: {}.", grade.matched.join(", ")),
        (true, true) => "Thanks, that's a fair summary.".to_string(),
        (false, false) => format!(
            "Not quite. Have another look at these ideas: {}.",
            keywords.join(", ")
        ),
        (false, true) => "That answer is too short to judge. Try explaining it more fully next time.".to_string(),
    }
}

fn closing_message() -> String {
    "This session is complete. Start a new session to ask another question.".to_string()
}
