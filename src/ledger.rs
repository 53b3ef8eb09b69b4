//! Answer ledger and question timing
//!
//! The ledger is the at-most-once record of submitted answers underlying all
//! scoring. First write wins; a replayed submission gets the original record
//! back. Leaderboards and final results are always recomputed from here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AnswerId, GameConfig, QuestionId};

/// One recorded answer, keyed by (player, question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: String,
    /// UserId in duel rooms, PlayerId in session rooms.
    pub player_key: String,
    pub question_id: QuestionId,
    pub answer_id: AnswerId,
    pub is_correct: bool,
    pub points: u32,
    pub time_spent_secs: f64,
    pub submitted_at: DateTime<Utc>,
}

/// Whether a `record_once` call wrote a fresh record or hit an existing one.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Fresh(AnswerRecord),
    Replay(AnswerRecord),
}

impl Recorded {
    pub fn record(&self) -> &AnswerRecord {
        match self {
            Recorded::Fresh(r) | Recorded::Replay(r) => r,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Recorded::Fresh(_))
    }
}

/// Cumulative totals for one player, derived from their records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerTotals {
    pub score: u32,
    pub correct_count: u32,
    pub time_spent_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerLedger {
    records: Vec<AnswerRecord>,
}

impl AnswerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answer unless one already exists for (player, question).
    pub fn record_once(&mut self, record: AnswerRecord) -> Recorded {
        if let Some(existing) = self.get(&record.player_key, &record.question_id) {
            return Recorded::Replay(existing.clone());
        }
        self.records.push(record.clone());
        Recorded::Fresh(record)
    }

    pub fn get(&self, player_key: &str, question_id: &str) -> Option<&AnswerRecord> {
        self.records
            .iter()
            .find(|r| r.player_key == player_key && r.question_id == question_id)
    }

    pub fn has_answered(&self, player_key: &str, question_id: &str) -> bool {
        self.get(player_key, question_id).is_some()
    }

    pub fn for_question<'a>(
        &'a self,
        question_id: &'a str,
    ) -> impl Iterator<Item = &'a AnswerRecord> {
        self.records.iter().filter(move |r| r.question_id == question_id)
    }

    pub fn for_player<'a>(&'a self, player_key: &'a str) -> impl Iterator<Item = &'a AnswerRecord> {
        self.records.iter().filter(move |r| r.player_key == player_key)
    }

    /// Derive a player's cumulative score, correct count, and time spent.
    pub fn totals(&self, player_key: &str) -> PlayerTotals {
        let mut totals = PlayerTotals::default();
        for record in self.for_player(player_key) {
            totals.score += record.points;
            if record.is_correct {
                totals.correct_count += 1;
            }
            totals.time_spent_secs += record.time_spent_secs;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Seconds elapsed since `started_at`, never negative.
pub fn elapsed_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - started_at).num_milliseconds().max(0) as f64) / 1000.0
}

/// Whether `now` is past `deadline` plus the configured tolerance.
pub fn past_deadline(deadline: DateTime<Utc>, now: DateTime<Utc>, tolerance_secs: u32) -> bool {
    now > deadline + chrono::Duration::seconds(tolerance_secs as i64)
}

/// Points for one answer: base points plus a bonus proportional to how much
/// of the question window was left. Incorrect answers score zero.
pub fn points(is_correct: bool, time_spent_secs: f64, time_limit_secs: u32, config: &GameConfig) -> u32 {
    if !is_correct {
        return 0;
    }
    let limit = time_limit_secs.max(1) as f64;
    let remaining_fraction = (1.0 - time_spent_secs / limit).clamp(0.0, 1.0);
    config.base_points + (config.max_time_bonus as f64 * remaining_fraction).round() as u32
}
