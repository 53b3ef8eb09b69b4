//! Collaborator interfaces
//!
//! The engine's external dependencies live behind narrow async traits:
//! identity resolution (once per connection, before any command), the quiz
//! content snapshot (once per game start), and the final-result hand-off
//! (fire-and-forget on completion). The bundled implementations back the
//! demo binary and the test suites.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::types::{LeaderboardEntry, Question, QuizSetId, UserId};

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown credential")]
    UnknownCredential,

    #[error("quiz set {0} not found")]
    QuizSetNotFound(QuizSetId),
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Identity, ProviderError>;
}

#[async_trait]
pub trait QuestionProvider: Send + Sync {
    /// Read-only ordered snapshot; the engine never calls this per-submission.
    async fn get_questions(&self, quiz_set_id: &str) -> Result<Vec<Question>, ProviderError>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Hand-off on completion. The engine neither blocks on nor retries this.
    async fn record_final_result(&self, room_code: &str, summary: &[LeaderboardEntry]);
}

/// Accepts `user_id:display_name` credentials at face value. Stands in for a
/// real token verifier in the demo binary and tests.
#[derive(Default)]
pub struct TrustedIdentityResolver;

#[async_trait]
impl IdentityResolver for TrustedIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<Identity, ProviderError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(ProviderError::UnknownCredential);
        }
        let (user_id, display_name) = match credential.split_once(':') {
            Some((id, name)) if !id.is_empty() && !name.is_empty() => (id, name),
            _ => (credential, credential),
        };
        Ok(Identity {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
    }
}

/// Serves fixed question sets from memory.
#[derive(Default)]
pub struct StaticQuestionProvider {
    sets: HashMap<QuizSetId, Vec<Question>>,
}

impl StaticQuestionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, quiz_set_id: &str, questions: Vec<Question>) -> Self {
        self.sets.insert(quiz_set_id.to_string(), questions);
        self
    }
}

#[async_trait]
impl QuestionProvider for StaticQuestionProvider {
    async fn get_questions(&self, quiz_set_id: &str) -> Result<Vec<Question>, ProviderError> {
        self.sets
            .get(quiz_set_id)
            .cloned()
            .ok_or_else(|| ProviderError::QuizSetNotFound(quiz_set_id.to_string()))
    }
}

/// Logs the hand-off and drops it.
#[derive(Default)]
pub struct NoopResultSink;

#[async_trait]
impl ResultSink for NoopResultSink {
    async fn record_final_result(&self, room_code: &str, summary: &[LeaderboardEntry]) {
        tracing::info!(
            code = %room_code,
            players = summary.len(),
            "final result handed off"
        );
    }
}

/// A three-question general-knowledge set for the demo binary and tests.
pub fn sample_questions() -> Vec<Question> {
    use crate::types::AnswerOption;

    let question = |id: &str, text: &str, correct: usize, options: [&str; 4]| Question {
        id: id.to_string(),
        text: text.to_string(),
        options: options
            .iter()
            .enumerate()
            .map(|(i, opt)| AnswerOption {
                id: format!("{id}-{i}"),
                text: opt.to_string(),
                is_correct: i == correct,
            })
            .collect(),
        time_limit_secs: 30,
    };

    vec![
        question(
            "q1",
            "Which planet has the shortest year?",
            0,
            ["Mercury", "Venus", "Mars", "Jupiter"],
        ),
        question(
            "q2",
            "What is the chemical symbol for gold?",
            2,
            ["Go", "Gd", "Au", "Ag"],
        ),
        question(
            "q3",
            "Which ocean is the deepest?",
            1,
            ["Atlantic", "Pacific", "Indian", "Arctic"],
        ),
    ]
}
