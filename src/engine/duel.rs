//! 1-vs-1 duel state machine
//!
//! Waiting → Ready → InProgress → ShowingResult → Completed | Cancelled.
//! Round resolution — "has the opponent also answered" plus the transition
//! to ShowingResult — happens inside the registry's CAS critical section,
//! so it fires exactly once per question no matter how the two submissions
//! race.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{leaderboard, GameEngine, ServedQuestion};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, AnswerLedger, AnswerRecord};
use crate::providers::Identity;
use crate::types::*;

/// Outcome of one duel answer submission. `round` is set only by the call
/// that resolved the round (or by an idempotent replay after resolution).
#[derive(Debug, Clone)]
pub struct DuelSubmission {
    /// None when the submission was a late soft no-op.
    pub record: Option<AnswerRecord>,
    pub replayed: bool,
    pub late: bool,
    pub round: Option<RoundResult>,
}

#[derive(Debug, Clone)]
pub enum DuelAdvance {
    Question(ServedQuestion),
    Completed(FinalResult),
}

impl GameEngine {
    /// Create a duel room with the creator as first participant.
    pub async fn create_duel(&self, creator: &Identity, quiz_set_id: &str) -> EngineResult<Room> {
        let now = Utc::now();
        let creator = creator.clone();
        let quiz_set_id = quiz_set_id.to_string();

        let room = self
            .registry
            .create_with(move |code| Room {
                code,
                id: ulid::Ulid::new().to_string(),
                quiz_set_id: quiz_set_id.clone(),
                questions: Vec::new(),
                current_index: 0,
                ledger: AnswerLedger::new(),
                mode: RoomMode::Duel(DuelState {
                    status: DuelStatus::Waiting,
                    creator: DuelPlayer {
                        user_id: creator.user_id.clone(),
                        display_name: creator.display_name.clone(),
                        connection_id: None,
                        joined_at: now,
                        is_ready: false,
                        connected: false,
                    },
                    challenger: None,
                    question_started_at: None,
                    current_result: None,
                }),
                created_at: now,
                last_activity: now,
                completed_at: None,
            })
            .await?;

        // A reused code must not inherit a pending deferred cleanup
        self.cancel_cleanup(&room.code);
        Ok(room)
    }

    /// Bind the creator's live connection to their slot.
    pub async fn connect_creator(
        &self,
        code: &str,
        user_id: &str,
        conn_id: &str,
    ) -> EngineResult<Room> {
        let user_id = user_id.to_string();
        let conn = conn_id.to_string();

        let room = self
            .registry
            .update(code, |room| {
                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };
                if duel.status.is_terminal() {
                    return Err(EngineError::InvalidState("room already over".to_string()));
                }
                if duel.creator.user_id != user_id {
                    return Err(EngineError::Unauthorized(
                        "only the room creator can connect here".to_string(),
                    ));
                }
                duel.creator.connection_id = Some(conn.clone());
                duel.creator.connected = true;
                Ok(room.clone())
            })
            .await?;

        self.connections.add(conn_id, code, &user_id).await;
        Ok(room)
    }

    /// Second player joins a Waiting room; transitions it to Ready.
    pub async fn join_duel(
        &self,
        code: &str,
        joiner: &Identity,
        conn_id: &str,
    ) -> EngineResult<Room> {
        let joiner = joiner.clone();
        let conn = conn_id.to_string();
        let now = Utc::now();

        let room = self
            .registry
            .update(code, |room| {
                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };
                match duel.status {
                    DuelStatus::Waiting => {}
                    DuelStatus::Ready | DuelStatus::InProgress | DuelStatus::ShowingResult => {
                        if duel.challenger.is_some() {
                            return Err(EngineError::Full);
                        }
                        return Err(EngineError::InvalidState(
                            "game already started".to_string(),
                        ));
                    }
                    _ => {
                        return Err(EngineError::InvalidState("room already over".to_string()))
                    }
                }
                if duel.challenger.is_some() {
                    return Err(EngineError::Full);
                }
                if duel.creator.user_id == joiner.user_id {
                    return Err(EngineError::InvalidState(
                        "cannot join your own room".to_string(),
                    ));
                }

                duel.challenger = Some(DuelPlayer {
                    user_id: joiner.user_id.clone(),
                    display_name: joiner.display_name.clone(),
                    connection_id: Some(conn.clone()),
                    joined_at: now,
                    is_ready: true,
                    connected: true,
                });
                duel.creator.is_ready = true;
                duel.status = DuelStatus::Ready;
                Ok(room.clone())
            })
            .await?;

        self.connections.add(conn_id, code, &joiner.user_id).await;
        tracing::info!(code = %code, user = %joiner.user_id, "challenger joined, room ready");
        Ok(room)
    }

    /// Load the question snapshot and serve question 0.
    pub async fn start_duel(
        &self,
        code: &str,
        conn_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ServedQuestion> {
        // Snapshot fetch happens outside the critical section; the Ready
        // check inside it keeps a double start from committing twice.
        let room = self.registry.get(code).await?;
        let questions = self.snapshot(&room.quiz_set_id).await?;

        self.registry
            .update(code, |room| {
                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };
                if duel.status != DuelStatus::Ready {
                    return Err(EngineError::InvalidState(format!(
                        "cannot start from {:?}",
                        duel.status
                    )));
                }
                let is_participant = [Some(&duel.creator), duel.challenger.as_ref()]
                    .into_iter()
                    .flatten()
                    .any(|p| p.connection_id.as_deref() == Some(conn_id));
                if !is_participant {
                    return Err(EngineError::Unauthorized(
                        "connection is not in this room".to_string(),
                    ));
                }

                room.questions = questions.clone();
                room.current_index = 0;
                duel.status = DuelStatus::InProgress;
                duel.question_started_at = Some(now);
                duel.current_result = None;

                let question = room.questions[0].clone();
                let deadline = now + chrono::Duration::seconds(question.time_limit_secs as i64);
                Ok(ServedQuestion {
                    index: 0,
                    total: room.questions.len(),
                    question,
                    deadline: Some(deadline),
                })
            })
            .await
    }

    /// Record one player's answer; resolves the round exactly once when the
    /// opponent has already answered. Duplicates replay the original record,
    /// late submissions are soft no-ops that resolve the round by timeout.
    pub async fn submit_duel_answer(
        &self,
        code: &str,
        conn_id: &str,
        question_id: &str,
        answer_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DuelSubmission> {
        let config = self.config.defaults.clone();

        self.registry
            .update(code, |room| {
                let question = room
                    .current_question()
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidState("no current question".to_string()))?;

                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };

                // Resolve the submitting player from the connection
                let player = [Some(&duel.creator), duel.challenger.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|p| p.connection_id.as_deref() == Some(conn_id))
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Unauthorized("connection is not in this room".to_string())
                    })?;

                if question_id != question.id {
                    return if room.questions.iter().any(|q| q.id == question_id) {
                        Err(EngineError::InvalidState("question is not current".to_string()))
                    } else {
                        Err(EngineError::NotFound(format!("question {question_id}")))
                    };
                }

                // Idempotent replay, including after the round resolved
                if let Some(prior) = room.ledger.get(&player.user_id, &question.id) {
                    return Ok(DuelSubmission {
                        record: Some(prior.clone()),
                        replayed: true,
                        late: false,
                        round: duel.current_result.clone(),
                    });
                }

                if duel.status != DuelStatus::InProgress {
                    return Err(EngineError::InvalidState(format!(
                        "cannot answer in {:?}",
                        duel.status
                    )));
                }

                let started_at = duel.question_started_at.ok_or_else(|| {
                    EngineError::InvalidState("question has no start time".to_string())
                })?;
                let elapsed = ledger::elapsed_secs(started_at, now);
                let deadline =
                    started_at + chrono::Duration::seconds(question.time_limit_secs as i64);

                // Late: not recorded, but the expired round resolves now
                if ledger::past_deadline(deadline, now, config.late_tolerance_secs) {
                    let result = resolve_round(&question, &room.ledger, duel);
                    return Ok(DuelSubmission {
                        record: None,
                        replayed: false,
                        late: true,
                        round: Some(result),
                    });
                }

                let option = question
                    .option(answer_id)
                    .ok_or_else(|| EngineError::NotFound(format!("answer {answer_id}")))?;
                let record = AnswerRecord {
                    id: ulid::Ulid::new().to_string(),
                    player_key: player.user_id.clone(),
                    question_id: question.id.clone(),
                    answer_id: option.id.clone(),
                    is_correct: option.is_correct,
                    points: ledger::points(
                        option.is_correct,
                        elapsed,
                        question.time_limit_secs,
                        &config,
                    ),
                    time_spent_secs: elapsed,
                    submitted_at: now,
                };
                let record = room.ledger.record_once(record).record().clone();

                // Exactly-once resolution: this check and the transition
                // commit atomically with the CAS
                let opponent = if player.user_id == duel.creator.user_id {
                    duel.challenger.as_ref().map(|p| p.user_id.clone())
                } else {
                    Some(duel.creator.user_id.clone())
                };
                let both_answered = opponent
                    .map(|opp| room.ledger.has_answered(&opp, &question.id))
                    .unwrap_or(false);

                let round = both_answered.then(|| resolve_round(&question, &room.ledger, duel));
                Ok(DuelSubmission {
                    record: Some(record),
                    replayed: false,
                    late: false,
                    round,
                })
            })
            .await
    }

    /// Passive timeout check: resolves the current round if its window has
    /// expired. Returns the result only when this call did the resolving.
    pub async fn check_round_timeout(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<RoundResult>> {
        let config = self.config.defaults.clone();

        self.registry
            .update(code, |room| {
                let Some(question) = room.current_question().cloned() else {
                    return Ok(None);
                };
                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };
                if duel.status != DuelStatus::InProgress {
                    return Ok(None);
                }
                let Some(started_at) = duel.question_started_at else {
                    return Ok(None);
                };
                let deadline =
                    started_at + chrono::Duration::seconds(question.time_limit_secs as i64);
                if !ledger::past_deadline(deadline, now, config.late_tolerance_secs) {
                    return Ok(None);
                }
                Ok(Some(resolve_round(&question, &room.ledger, duel)))
            })
            .await
    }

    /// Advance past a resolved round; completes the duel after the last one.
    pub async fn next_duel_question(
        self: &Arc<Self>,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DuelAdvance> {
        let advance = self
            .registry
            .update(code, |room| {
                let total = room.questions.len();
                let RoomMode::Duel(duel) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a duel room".to_string()));
                };
                if duel.status != DuelStatus::ShowingResult {
                    return Err(EngineError::InvalidState(format!(
                        "cannot advance from {:?}",
                        duel.status
                    )));
                }

                if room.current_index + 1 < total {
                    room.current_index += 1;
                    duel.status = DuelStatus::InProgress;
                    duel.question_started_at = Some(now);
                    duel.current_result = None;

                    let question = room.questions[room.current_index].clone();
                    let deadline =
                        now + chrono::Duration::seconds(question.time_limit_secs as i64);
                    Ok(DuelAdvance::Question(ServedQuestion {
                        index: room.current_index,
                        total,
                        question,
                        deadline: Some(deadline),
                    }))
                } else {
                    duel.status = DuelStatus::Completed;
                    room.completed_at = Some(now);
                    Ok(DuelAdvance::Completed(leaderboard::compute_duel_result(room)))
                }
            })
            .await?;

        if let DuelAdvance::Completed(final_result) = &advance {
            tracing::info!(code = %code, winner = ?final_result.winner_name, "duel completed");
            self.hand_off_result(code, final_result.entries.clone());
            self.schedule_cleanup(code);
        }
        Ok(advance)
    }

    /// Final standings of a completed duel, recomputed from the ledger.
    pub async fn final_duel_result(&self, code: &str) -> EngineResult<FinalResult> {
        let room = self.registry.get(code).await?;
        let Some(duel) = room.duel() else {
            return Err(EngineError::InvalidState("not a duel room".to_string()));
        };
        if duel.status != DuelStatus::Completed {
            return Err(EngineError::InvalidState("duel not completed".to_string()));
        }
        Ok(leaderboard::compute_duel_result(&room))
    }
}

/// Compute the round result from recorded answers and move the duel to
/// ShowingResult. Round winner: correct answers only, fastest first.
fn resolve_round(
    question: &Question,
    ledger: &AnswerLedger,
    duel: &mut DuelState,
) -> RoundResult {
    let correct = question.correct_option();

    let mut outcomes = Vec::new();
    let mut winner: Option<(&DuelPlayer, f64)> = None;
    for player in [Some(&duel.creator), duel.challenger.as_ref()].into_iter().flatten() {
        let record = ledger.get(&player.user_id, &question.id);
        let totals = ledger.totals(&player.user_id);
        outcomes.push(PlayerOutcome {
            user_id: player.user_id.clone(),
            display_name: player.display_name.clone(),
            answer_id: record.map(|r| r.answer_id.clone()),
            is_correct: record.map(|r| r.is_correct).unwrap_or(false),
            points: record.map(|r| r.points).unwrap_or(0),
            total_score: totals.score,
        });
        if let Some(r) = record {
            if r.is_correct && winner.map(|(_, t)| r.time_spent_secs < t).unwrap_or(true) {
                winner = Some((player, r.time_spent_secs));
            }
        }
    }

    let result = RoundResult {
        question_id: question.id.clone(),
        correct_answer_id: correct.map(|o| o.id.clone()).unwrap_or_default(),
        correct_answer_text: correct.map(|o| o.text.clone()).unwrap_or_default(),
        outcomes,
        winner_user_id: winner.map(|(p, _)| p.user_id.clone()),
        winner_name: winner.map(|(p, _)| p.display_name.clone()),
    };

    duel.status = DuelStatus::ShowingResult;
    duel.current_result = Some(result.clone());
    result
}
