//! Boss-fight extension of a multiplayer session
//!
//! The room shares one HP pool; every player works through the question
//! list at their own pace and their points land as damage. The HP
//! zero-crossing happens inside the registry's CAS critical section, so
//! Defeated is decided exactly once no matter how the final hits race.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{GameEngine, ServedQuestion};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, AnswerRecord};
use crate::types::*;

/// Host-chosen parameters when arming the boss fight in the lobby.
#[derive(Debug, Clone)]
pub struct BossOptions {
    pub boss_hp: u32,
    pub overall_limit_secs: Option<u32>,
    pub per_question_secs: u32,
    /// Serve the next question immediately after each recorded answer.
    pub auto_advance: bool,
}

impl Default for BossOptions {
    fn default() -> Self {
        Self {
            boss_hp: 1000,
            overall_limit_secs: None,
            per_question_secs: 30,
            auto_advance: true,
        }
    }
}

/// Where one player stands in their private run through the questions.
#[derive(Debug, Clone)]
pub enum BossProgress {
    Question(ServedQuestion),
    /// The player has answered every question.
    Exhausted,
    /// The fight is already decided.
    Over(BossStatus),
}

/// Outcome of one boss answer submission.
#[derive(Debug, Clone)]
pub enum BossSubmission {
    Recorded {
        record: AnswerRecord,
        damage: u32,
        boss: BossStatus,
        /// True only for the submission whose commit brought HP to zero.
        defeated_now: bool,
    },
    Duplicate(AnswerRecord),
    /// Per-question window missed; nothing recorded.
    Late,
    /// The fight was already decided before this submission.
    Terminal(BossStatus),
}

fn status_of(boss: &BossFight) -> BossStatus {
    BossStatus {
        hp: boss.hp,
        max_hp: boss.max_hp,
        outcome: boss.outcome,
    }
}

fn require_session_host<'a>(
    room: &'a mut Room,
    conn_id: &str,
) -> EngineResult<&'a mut SessionState> {
    let RoomMode::Session(session) = &mut room.mode else {
        return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
    };
    if session.host_connection_id.as_deref() != Some(conn_id) {
        return Err(EngineError::Unauthorized(
            "only the host can do this".to_string(),
        ));
    }
    Ok(session)
}

impl GameEngine {
    /// Arm the boss fight. Lobby-only and host-only; arming twice replaces
    /// the previous options.
    pub async fn enable_boss_fight(
        &self,
        code: &str,
        host_conn: &str,
        options: BossOptions,
    ) -> EngineResult<Room> {
        let room = self
            .registry
            .update(code, |room| {
                let session = require_session_host(room, host_conn)?;
                if session.status != SessionStatus::Lobby {
                    return Err(EngineError::InvalidState(
                        "boss fights are armed before the game starts".to_string(),
                    ));
                }
                session.boss = Some(BossFight {
                    hp: options.boss_hp,
                    max_hp: options.boss_hp,
                    overall_limit_secs: options.overall_limit_secs,
                    overall_deadline: None,
                    per_question_secs: options.per_question_secs,
                    auto_advance: options.auto_advance,
                    player_index: Default::default(),
                    question_started_at: Default::default(),
                    outcome: None,
                });
                Ok(room.clone())
            })
            .await?;

        tracing::info!(code = %code, hp = options.boss_hp, "boss fight armed");
        Ok(room)
    }

    /// The question a player is currently facing, with their private deadline.
    pub async fn boss_player_question(
        &self,
        code: &str,
        conn_id: &str,
    ) -> EngineResult<BossProgress> {
        let room = self.registry.get(code).await?;
        let session = room
            .session()
            .ok_or_else(|| EngineError::InvalidState("not a multiplayer game".to_string()))?;
        let boss = session
            .boss
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("no boss fight in this game".to_string()))?;

        if boss.outcome.is_some() || session.status.is_terminal() {
            return Ok(BossProgress::Over(status_of(boss)));
        }
        let player = session
            .players
            .values()
            .find(|p| p.connection_id == conn_id)
            .ok_or_else(|| {
                EngineError::Unauthorized("connection is not in this game".to_string())
            })?;

        let index = *boss
            .player_index
            .get(&player.id)
            .ok_or_else(|| EngineError::InvalidState("game not started".to_string()))?;
        let Some(question) = room.questions.get(index) else {
            return Ok(BossProgress::Exhausted);
        };
        let deadline = boss
            .question_started_at
            .get(&player.id)
            .map(|t| *t + chrono::Duration::seconds(boss.per_question_secs as i64));
        Ok(BossProgress::Question(ServedQuestion {
            index,
            total: room.questions.len(),
            question: question.clone(),
            deadline,
        }))
    }

    /// Record a player's answer against their current question and apply its
    /// points as damage. With auto-advance on, the player moves to their next
    /// question in the same commit.
    pub async fn submit_boss_answer(
        self: &Arc<Self>,
        code: &str,
        conn_id: &str,
        question_id: &str,
        answer_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<BossSubmission> {
        let (submission, ended_now) = self
            .registry
            .update(code, |room| {
                let questions = room.questions.clone();
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                let config = session.config.clone();
                let player = session
                    .players
                    .values()
                    .find(|p| p.connection_id == conn_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Unauthorized("connection is not in this game".to_string())
                    })?;
                let terminal = session.status.is_terminal();
                let boss = session
                    .boss
                    .as_mut()
                    .ok_or_else(|| {
                        EngineError::InvalidState("no boss fight in this game".to_string())
                    })?;

                if terminal || boss.outcome.is_some() {
                    return Ok((BossSubmission::Terminal(status_of(boss)), false));
                }

                // Fight-wide budget checked on the way in
                if let Some(deadline) = boss.overall_deadline {
                    if ledger::past_deadline(deadline, now, config.late_tolerance_secs) {
                        boss.outcome = Some(BossOutcome::TimeExpired);
                        session.status = SessionStatus::Completed;
                        session.end_reason = Some("boss fight timer expired".to_string());
                        room.completed_at = Some(now);
                        return Ok((BossSubmission::Terminal(status_of(boss)), true));
                    }
                }

                // Replay before the current-question guard: auto-advance
                // moves the index, so a retransmission no longer matches it
                if let Some(prior) = room.ledger.get(&player.id, question_id) {
                    return Ok((BossSubmission::Duplicate(prior.clone()), false));
                }

                let index = *boss
                    .player_index
                    .get(&player.id)
                    .ok_or_else(|| EngineError::InvalidState("game not started".to_string()))?;
                let question = questions.get(index).ok_or_else(|| {
                    EngineError::InvalidState("no questions left for this player".to_string())
                })?;
                // Wrong-question guard relative to this player's position
                if question_id != question.id {
                    return if questions.iter().any(|q| q.id == question_id) {
                        Err(EngineError::InvalidState(
                            "question is not this player's current one".to_string(),
                        ))
                    } else {
                        Err(EngineError::NotFound(format!("question {question_id}")))
                    };
                }

                let started = *boss.question_started_at.get(&player.id).ok_or_else(|| {
                    EngineError::InvalidState("question has no start time".to_string())
                })?;
                let window =
                    started + chrono::Duration::seconds(boss.per_question_secs as i64);
                if ledger::past_deadline(window, now, config.late_tolerance_secs) {
                    return Ok((BossSubmission::Late, false));
                }

                let option = question
                    .option(answer_id)
                    .ok_or_else(|| EngineError::NotFound(format!("answer {answer_id}")))?;
                let elapsed = ledger::elapsed_secs(started, now);
                let record = AnswerRecord {
                    id: ulid::Ulid::new().to_string(),
                    player_key: player.id.clone(),
                    question_id: question.id.clone(),
                    answer_id: option.id.clone(),
                    is_correct: option.is_correct,
                    points: ledger::points(
                        option.is_correct,
                        elapsed,
                        boss.per_question_secs,
                        &config,
                    ),
                    time_spent_secs: elapsed,
                    submitted_at: now,
                };

                let damage = record.points;
                let was_alive = boss.hp > 0;
                boss.hp = boss.hp.saturating_sub(damage);
                let defeated_now = was_alive && boss.hp == 0;
                if defeated_now {
                    boss.outcome = Some(BossOutcome::Defeated);
                    session.status = SessionStatus::Completed;
                    room.completed_at = Some(now);
                }

                if boss.auto_advance && !defeated_now {
                    boss.player_index.insert(player.id.clone(), index + 1);
                    boss.question_started_at.insert(player.id.clone(), now);
                }
                let status = status_of(boss);

                let record = room.ledger.record_once(record).record().clone();
                Ok((
                    BossSubmission::Recorded {
                        record,
                        damage,
                        boss: status,
                        defeated_now,
                    },
                    defeated_now,
                ))
            })
            .await?;

        if ended_now {
            tracing::info!(code = %code, "boss fight over");
            self.finish_boss_fight(code).await;
        }
        Ok(submission)
    }

    /// Move a player to their next question. Allowed once the current one is
    /// answered or its window has expired; never skips a live question.
    pub async fn advance_boss_player(
        &self,
        code: &str,
        conn_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<BossProgress> {
        self.registry
            .update(code, |room| {
                let questions = room.questions.clone();
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                let tolerance = session.config.late_tolerance_secs;
                let player = session
                    .players
                    .values()
                    .find(|p| p.connection_id == conn_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Unauthorized("connection is not in this game".to_string())
                    })?;
                let terminal = session.status.is_terminal();
                let boss = session
                    .boss
                    .as_mut()
                    .ok_or_else(|| {
                        EngineError::InvalidState("no boss fight in this game".to_string())
                    })?;
                if terminal || boss.outcome.is_some() {
                    return Ok(BossProgress::Over(status_of(boss)));
                }

                let index = *boss
                    .player_index
                    .get(&player.id)
                    .ok_or_else(|| EngineError::InvalidState("game not started".to_string()))?;
                let Some(current) = questions.get(index) else {
                    return Ok(BossProgress::Exhausted);
                };

                let answered = room.ledger.has_answered(&player.id, &current.id);
                let window_expired = boss
                    .question_started_at
                    .get(&player.id)
                    .map(|t| {
                        let window = *t
                            + chrono::Duration::seconds(boss.per_question_secs as i64);
                        ledger::past_deadline(window, now, tolerance)
                    })
                    .unwrap_or(false);
                if !answered && !window_expired {
                    return Err(EngineError::InvalidState(
                        "current question is still open".to_string(),
                    ));
                }

                let next = index + 1;
                boss.player_index.insert(player.id.clone(), next);
                boss.question_started_at.insert(player.id.clone(), now);
                let Some(question) = questions.get(next) else {
                    return Ok(BossProgress::Exhausted);
                };
                let deadline =
                    now + chrono::Duration::seconds(boss.per_question_secs as i64);
                Ok(BossProgress::Question(ServedQuestion {
                    index: next,
                    total: questions.len(),
                    question: question.clone(),
                    deadline: Some(deadline),
                }))
            })
            .await
    }

    /// Passive check of the fight-wide budget. Returns the status only when
    /// this call did the expiring.
    pub async fn check_boss_expiry(
        self: &Arc<Self>,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<BossStatus>> {
        // Read first: committing a no-op update would refresh last_activity
        // and keep idle rooms alive forever
        let room = self.registry.get(code).await?;
        let due = room.session().and_then(|session| {
            if session.status.is_terminal() {
                return None;
            }
            let boss = session.boss.as_ref()?;
            if boss.outcome.is_some() {
                return None;
            }
            boss.overall_deadline
                .map(|d| (d, session.config.late_tolerance_secs))
        });
        match due {
            Some((deadline, tolerance)) if ledger::past_deadline(deadline, now, tolerance) => {}
            _ => return Ok(None),
        }

        let expired = self
            .registry
            .update(code, |room| {
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                let terminal = session.status.is_terminal();
                let tolerance = session.config.late_tolerance_secs;
                let Some(boss) = session.boss.as_mut() else {
                    return Ok(None);
                };
                if terminal || boss.outcome.is_some() {
                    return Ok(None);
                }
                let Some(deadline) = boss.overall_deadline else {
                    return Ok(None);
                };
                if !ledger::past_deadline(deadline, now, tolerance) {
                    return Ok(None);
                }
                boss.outcome = Some(BossOutcome::TimeExpired);
                session.status = SessionStatus::Completed;
                session.end_reason = Some("boss fight timer expired".to_string());
                room.completed_at = Some(now);
                Ok(Some(status_of(boss)))
            })
            .await?;

        if expired.is_some() {
            tracing::info!(code = %code, "boss fight expired");
            self.finish_boss_fight(code).await;
        }
        Ok(expired)
    }

    /// Shared post-terminal hand-off: final standings to the sink, then
    /// deferred room cleanup.
    async fn finish_boss_fight(self: &Arc<Self>, code: &str) {
        if let Ok(room) = self.registry.get(code).await {
            self.hand_off_result(code, super::leaderboard::compute_leaderboard(&room));
        }
        self.schedule_cleanup(code);
    }
}
