use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ledger::AnswerLedger;

/// Opaque ID types for type safety
pub type RoomCode = String;
pub type RoomId = String;
pub type QuizSetId = String;
pub type UserId = String;
pub type PlayerId = String;
pub type ConnectionId = String;
pub type QuestionId = String;
pub type AnswerId = String;

/// Lifecycle of a 1v1 duel room. Transitions are monotonic forward;
/// Cancelled is the escape hatch from any non-terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuelStatus {
    Waiting,
    Ready,
    InProgress,
    ShowingResult,
    Completed,
    Cancelled,
}

impl DuelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DuelStatus::Completed | DuelStatus::Cancelled)
    }
}

/// Lifecycle of a multiplayer session. ShowingResult/ShowingLeaderboard
/// repeat per question before Completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Lobby,
    InProgress,
    ShowingResult,
    ShowingLeaderboard,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

/// A single answer option (exactly one per question carries `is_correct`).
/// The protocol layer strips the flag before anything reaches a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOption {
    pub id: AnswerId,
    pub text: String,
    pub is_correct: bool,
}

/// One question from the quiz content snapshot fetched at game start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    pub options: Vec<AnswerOption>,
    pub time_limit_secs: u32,
}

impl Question {
    pub fn option(&self, id: &str) -> Option<&AnswerOption> {
        self.options.iter().find(|o| o.id == id)
    }

    pub fn correct_option(&self) -> Option<&AnswerOption> {
        self.options.iter().find(|o| o.is_correct)
    }
}

/// One of the two participants in a duel room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelPlayer {
    pub user_id: UserId,
    pub display_name: String,
    pub connection_id: Option<ConnectionId>,
    pub joined_at: DateTime<Utc>,
    pub is_ready: bool,
    pub connected: bool,
}

/// A participant in a multiplayer session. The slot survives disconnects so
/// the player can reconnect with the same id, score, and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPlayer {
    pub id: PlayerId,
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub connection_id: ConnectionId,
    pub connected: bool,
    pub joined_at: DateTime<Utc>,
}

/// Duel-specific room state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelState {
    pub status: DuelStatus,
    pub creator: DuelPlayer,
    pub challenger: Option<DuelPlayer>,
    pub question_started_at: Option<DateTime<Utc>>,
    pub current_result: Option<RoundResult>,
}

/// Multiplayer-session room state, optionally extended into a boss fight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub host_user_id: UserId,
    pub host_connection_id: Option<ConnectionId>,
    pub config: GameConfig,
    pub players: HashMap<PlayerId, SessionPlayer>,
    /// Absolute deadline for the current question (shared pacing only).
    pub deadline: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub boss: Option<BossFight>,
}

/// Shared-HP boss fight extension with independent per-player pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BossFight {
    pub hp: u32,
    pub max_hp: u32,
    /// Optional fight-wide time budget; turned into a deadline at start.
    pub overall_limit_secs: Option<u32>,
    pub overall_deadline: Option<DateTime<Utc>>,
    pub per_question_secs: u32,
    pub auto_advance: bool,
    /// Each player's private position in the question list.
    pub player_index: HashMap<PlayerId, usize>,
    /// When each player's current question opened (per-player timing).
    pub question_started_at: HashMap<PlayerId, DateTime<Utc>>,
    pub outcome: Option<BossOutcome>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BossOutcome {
    Defeated,
    TimeExpired,
}

/// Snapshot of the boss pool returned by damage/expiry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BossStatus {
    pub hp: u32,
    pub max_hp: u32,
    pub outcome: Option<BossOutcome>,
}

/// The two structurally-similar-but-distinct game modes, as a tagged variant
/// sharing one answer ledger and question snapshot on the enclosing `Room`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomMode {
    Duel(DuelState),
    Session(SessionState),
}

/// An ephemeral game room, the unit of concurrency. All mutation goes through
/// the registry's versioned compare-and-swap, never a cross-room lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    pub id: RoomId,
    pub quiz_set_id: QuizSetId,
    /// Empty until the snapshot is fetched at game start.
    pub questions: Vec<Question>,
    pub current_index: usize,
    pub ledger: AnswerLedger,
    pub mode: RoomMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Room {
    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current_index)
    }

    pub fn is_terminal(&self) -> bool {
        match &self.mode {
            RoomMode::Duel(d) => d.status.is_terminal(),
            RoomMode::Session(s) => s.status.is_terminal(),
        }
    }

    pub fn duel(&self) -> Option<&DuelState> {
        match &self.mode {
            RoomMode::Duel(d) => Some(d),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&SessionState> {
        match &self.mode {
            RoomMode::Session(s) => Some(s),
            _ => None,
        }
    }
}

/// Per-game tunables, overridable at game creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub per_question_secs: u32,
    pub base_points: u32,
    pub max_time_bonus: u32,
    /// Clock-skew allowance before a submission counts as late.
    pub late_tolerance_secs: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            per_question_secs: 30,
            base_points: 100,
            max_time_bonus: 100,
            late_tolerance_secs: 2,
        }
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub code_length: usize,
    pub code_retries: u32,
    /// Idle rooms untouched this long are evicted by the sweeper.
    pub idle_ttl_secs: i64,
    /// Completed rooms linger this long before deferred cleanup.
    pub completed_grace_secs: i64,
    pub defaults: GameConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            code_retries: 8,
            idle_ttl_secs: 30 * 60,
            completed_grace_secs: 60,
            defaults: GameConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_i64("QUIZCLASH_IDLE_TTL_SECS") {
            config.idle_ttl_secs = v;
        }
        if let Some(v) = env_i64("QUIZCLASH_CLEANUP_GRACE_SECS") {
            config.completed_grace_secs = v;
        }
        if let Some(v) = env_i64("QUIZCLASH_QUESTION_SECS") {
            config.defaults.per_question_secs = v.max(1) as u32;
        }
        config
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Per-player outcome of one resolved duel round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerOutcome {
    pub user_id: UserId,
    pub display_name: String,
    pub answer_id: Option<AnswerId>,
    pub is_correct: bool,
    pub points: u32,
    pub total_score: u32,
}

/// Result of one duel round, computed exactly once per question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    pub question_id: QuestionId,
    pub correct_answer_id: AnswerId,
    pub correct_answer_text: String,
    pub outcomes: Vec<PlayerOutcome>,
    pub winner_user_id: Option<UserId>,
    pub winner_name: Option<String>,
}

/// One ranked row, recomputed from the answer ledger on every call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub player_key: String,
    pub display_name: String,
    pub score: u32,
    pub correct_count: u32,
    pub time_spent_secs: f64,
    pub rank: u32,
}

/// Final outcome of a duel: winner plus both ranked summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub winner_user_id: Option<UserId>,
    pub winner_name: Option<String>,
    pub entries: Vec<LeaderboardEntry>,
}

/// Aggregate view of answers to one multiplayer question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: QuestionId,
    pub correct_answer_id: AnswerId,
    pub answered: usize,
    pub correct: usize,
    /// How many players picked each option.
    pub distribution: HashMap<AnswerId, usize>,
}
