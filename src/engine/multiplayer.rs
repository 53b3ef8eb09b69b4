//! Multiplayer (host-led) session state machine
//!
//! Lobby → InProgress → ShowingResult → ShowingLeaderboard → Completed |
//! Cancelled, with the result/leaderboard phases repeating per question.
//! Timing is server-authoritative: every question carries an absolute
//! deadline and late submissions are rejected softly, never erased.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::{leaderboard, GameEngine, ServedQuestion};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, AnswerLedger, AnswerRecord};
use crate::providers::Identity;
use crate::types::*;

/// Outcome of one session answer submission. Duplicate and Late are the
/// soft failures: the prior record comes back, or nothing is recorded.
#[derive(Debug, Clone)]
pub enum SessionSubmission {
    Recorded(AnswerRecord),
    Duplicate(AnswerRecord),
    Late,
}

#[derive(Debug, Clone)]
pub enum SessionAdvance {
    Question(ServedQuestion),
    Completed(Vec<LeaderboardEntry>),
}

fn require_host(session: &SessionState, conn_id: &str) -> EngineResult<()> {
    if session.host_connection_id.as_deref() != Some(conn_id) {
        return Err(EngineError::Unauthorized(
            "only the host can do this".to_string(),
        ));
    }
    Ok(())
}

impl GameEngine {
    /// Create a multiplayer game in Lobby with the caller as host.
    pub async fn create_session(
        &self,
        host: &Identity,
        host_conn: &str,
        quiz_set_id: &str,
        config: GameConfig,
    ) -> EngineResult<Room> {
        let now = Utc::now();

        let room = self
            .registry
            .create_with(|code| Room {
                code,
                id: ulid::Ulid::new().to_string(),
                quiz_set_id: quiz_set_id.to_string(),
                questions: Vec::new(),
                current_index: 0,
                ledger: AnswerLedger::new(),
                mode: RoomMode::Session(SessionState {
                    status: SessionStatus::Lobby,
                    host_user_id: host.user_id.clone(),
                    host_connection_id: Some(host_conn.to_string()),
                    config: config.clone(),
                    players: HashMap::new(),
                    deadline: None,
                    end_reason: None,
                    boss: None,
                }),
                created_at: now,
                last_activity: now,
                completed_at: None,
            })
            .await?;

        self.cancel_cleanup(&room.code);
        self.connections.add(host_conn, &room.code, &host.user_id).await;
        Ok(room)
    }

    /// Join the lobby. Any number of players; each gets a stable PlayerId.
    pub async fn join_session(
        &self,
        code: &str,
        display_name: &str,
        conn_id: &str,
        user_id: Option<UserId>,
    ) -> EngineResult<(Room, SessionPlayer)> {
        let player = SessionPlayer {
            id: ulid::Ulid::new().to_string(),
            user_id,
            display_name: display_name.to_string(),
            connection_id: conn_id.to_string(),
            connected: true,
            joined_at: Utc::now(),
        };

        let room = self
            .registry
            .update(code, |room| {
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                if session.status != SessionStatus::Lobby {
                    return Err(EngineError::InvalidState(
                        "game already started".to_string(),
                    ));
                }
                session.players.insert(player.id.clone(), player.clone());
                Ok(room.clone())
            })
            .await?;

        self.connections.add(conn_id, code, &player.id).await;
        tracing::info!(code = %code, player = %player.display_name, "player joined lobby");
        Ok((room, player))
    }

    /// Host starts the game: snapshot fetched once, question 0 served with a
    /// server-computed absolute deadline.
    pub async fn start_session(
        &self,
        code: &str,
        host_conn: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ServedQuestion> {
        let room = self.registry.get(code).await?;
        let questions = self.snapshot(&room.quiz_set_id).await?;

        self.registry
            .update(code, |room| {
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                require_host(session, host_conn)?;
                if session.status != SessionStatus::Lobby {
                    return Err(EngineError::InvalidState(format!(
                        "cannot start from {:?}",
                        session.status
                    )));
                }
                if session.players.is_empty() {
                    return Err(EngineError::InvalidState(
                        "no players have joined".to_string(),
                    ));
                }

                room.questions = questions.clone();
                room.current_index = 0;
                session.status = SessionStatus::InProgress;

                if let Some(boss) = &mut session.boss {
                    // Independent pacing: everyone starts at their own index 0
                    boss.player_index =
                        session.players.keys().map(|id| (id.clone(), 0)).collect();
                    boss.question_started_at =
                        session.players.keys().map(|id| (id.clone(), now)).collect();
                    boss.overall_deadline = boss
                        .overall_limit_secs
                        .map(|secs| now + chrono::Duration::seconds(secs as i64));
                    session.deadline = None;
                } else {
                    session.deadline = Some(
                        now + chrono::Duration::seconds(session.config.per_question_secs as i64),
                    );
                }

                tracing::info!(code = %room.code, players = session.players.len(), "game started");
                Ok(ServedQuestion {
                    index: 0,
                    total: room.questions.len(),
                    question: room.questions[0].clone(),
                    deadline: session.deadline,
                })
            })
            .await
    }

    /// Record a player's answer to the current question. Points are base
    /// points plus a bonus for time left before the deadline.
    pub async fn submit_session_answer(
        &self,
        code: &str,
        conn_id: &str,
        question_id: &str,
        answer_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<SessionSubmission> {
        self.registry
            .update(code, |room| {
                let question = room
                    .current_question()
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidState("no current question".to_string()))?;

                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                if session.boss.is_some() {
                    return Err(EngineError::InvalidState(
                        "boss fights use their own submissions".to_string(),
                    ));
                }
                if session.status != SessionStatus::InProgress {
                    return Err(EngineError::InvalidState(format!(
                        "cannot answer in {:?}",
                        session.status
                    )));
                }

                let player = session
                    .players
                    .values()
                    .find(|p| p.connection_id == conn_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Unauthorized("connection is not in this game".to_string())
                    })?;

                if question_id != question.id {
                    return if room.questions.iter().any(|q| q.id == question_id) {
                        Err(EngineError::InvalidState("question is not current".to_string()))
                    } else {
                        Err(EngineError::NotFound(format!("question {question_id}")))
                    };
                }

                if let Some(prior) = room.ledger.get(&player.id, &question.id) {
                    return Ok(SessionSubmission::Duplicate(prior.clone()));
                }

                let deadline = session.deadline.ok_or_else(|| {
                    EngineError::InvalidState("question has no deadline".to_string())
                })?;
                if ledger::past_deadline(deadline, now, session.config.late_tolerance_secs) {
                    return Ok(SessionSubmission::Late);
                }

                let limit = session.config.per_question_secs;
                let started = deadline - chrono::Duration::seconds(limit as i64);
                let elapsed = ledger::elapsed_secs(started, now);

                let option = question
                    .option(answer_id)
                    .ok_or_else(|| EngineError::NotFound(format!("answer {answer_id}")))?;
                let record = AnswerRecord {
                    id: ulid::Ulid::new().to_string(),
                    player_key: player.id.clone(),
                    question_id: question.id.clone(),
                    answer_id: option.id.clone(),
                    is_correct: option.is_correct,
                    points: ledger::points(option.is_correct, elapsed, limit, &session.config),
                    time_spent_secs: elapsed,
                    submitted_at: now,
                };
                let record = room.ledger.record_once(record).record().clone();
                Ok(SessionSubmission::Recorded(record))
            })
            .await
    }

    /// Aggregate view of the current question: answered/correct counts and
    /// the per-option distribution. Read-only, callable any time after the
    /// question opened.
    pub async fn session_question_result(&self, code: &str) -> EngineResult<QuestionResult> {
        let room = self.registry.get(code).await?;
        room.session().ok_or_else(|| {
            EngineError::InvalidState("not a multiplayer game".to_string())
        })?;
        let question = room
            .current_question()
            .ok_or_else(|| EngineError::InvalidState("no current question".to_string()))?;
        Ok(aggregate_question(question, &room.ledger))
    }

    /// Host reveals the current question's result to the room.
    pub async fn reveal_question_result(
        &self,
        code: &str,
        host_conn: &str,
    ) -> EngineResult<QuestionResult> {
        self.registry
            .update(code, |room| {
                let question = room
                    .current_question()
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidState("no current question".to_string()))?;
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                require_host(session, host_conn)?;
                match session.status {
                    SessionStatus::InProgress | SessionStatus::ShowingResult => {
                        session.status = SessionStatus::ShowingResult;
                    }
                    _ => {
                        return Err(EngineError::InvalidState(format!(
                            "cannot show results in {:?}",
                            session.status
                        )))
                    }
                }
                Ok(aggregate_question(&question, &room.ledger))
            })
            .await
    }

    /// Host reveals the leaderboard between questions.
    pub async fn reveal_leaderboard(
        &self,
        code: &str,
        host_conn: &str,
    ) -> EngineResult<Vec<LeaderboardEntry>> {
        self.registry
            .update(code, |room| {
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                require_host(session, host_conn)?;
                match session.status {
                    SessionStatus::InProgress
                    | SessionStatus::ShowingResult
                    | SessionStatus::ShowingLeaderboard => {
                        session.status = SessionStatus::ShowingLeaderboard;
                    }
                    _ => {
                        return Err(EngineError::InvalidState(format!(
                            "cannot show leaderboard in {:?}",
                            session.status
                        )))
                    }
                }
                Ok(leaderboard::compute_leaderboard(room))
            })
            .await
    }

    /// Current standings, recomputed from the ledger. Read-only.
    pub async fn session_leaderboard(&self, code: &str) -> EngineResult<Vec<LeaderboardEntry>> {
        let room = self.registry.get(code).await?;
        room.session().ok_or_else(|| {
            EngineError::InvalidState("not a multiplayer game".to_string())
        })?;
        Ok(leaderboard::compute_leaderboard(&room))
    }

    /// Host advances to the next question, or completes the game after the
    /// last one.
    pub async fn next_session_question(
        self: &Arc<Self>,
        code: &str,
        host_conn: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<SessionAdvance> {
        let advance = self
            .registry
            .update(code, |room| {
                let total = room.questions.len();
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                require_host(session, host_conn)?;
                match session.status {
                    SessionStatus::InProgress
                    | SessionStatus::ShowingResult
                    | SessionStatus::ShowingLeaderboard => {}
                    _ => {
                        return Err(EngineError::InvalidState(format!(
                            "cannot advance from {:?}",
                            session.status
                        )))
                    }
                }

                if room.current_index + 1 < total {
                    room.current_index += 1;
                    session.status = SessionStatus::InProgress;
                    session.deadline = Some(
                        now + chrono::Duration::seconds(session.config.per_question_secs as i64),
                    );
                    Ok(SessionAdvance::Question(ServedQuestion {
                        index: room.current_index,
                        total,
                        question: room.questions[room.current_index].clone(),
                        deadline: session.deadline,
                    }))
                } else {
                    session.status = SessionStatus::Completed;
                    room.completed_at = Some(now);
                    Ok(SessionAdvance::Completed(leaderboard::compute_leaderboard(room)))
                }
            })
            .await?;

        if let SessionAdvance::Completed(entries) = &advance {
            tracing::info!(code = %code, "game completed");
            self.hand_off_result(code, entries.clone());
            self.schedule_cleanup(code);
        }
        Ok(advance)
    }

    /// Early termination with a recorded reason.
    pub async fn force_end_session(
        self: &Arc<Self>,
        code: &str,
        host_conn: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<LeaderboardEntry>> {
        let reason = reason.to_string();
        let entries = self
            .registry
            .update(code, |room| {
                let RoomMode::Session(session) = &mut room.mode else {
                    return Err(EngineError::InvalidState("not a multiplayer game".to_string()));
                };
                require_host(session, host_conn)?;
                if session.status.is_terminal() {
                    return Err(EngineError::InvalidState("game already over".to_string()));
                }
                session.status = SessionStatus::Completed;
                session.end_reason = Some(reason.clone());
                room.completed_at = Some(now);
                Ok(leaderboard::compute_leaderboard(room))
            })
            .await?;

        tracing::info!(code = %code, reason = %reason, "game force-ended");
        self.hand_off_result(code, entries.clone());
        self.schedule_cleanup(code);
        Ok(entries)
    }
}

fn aggregate_question(question: &Question, ledger: &AnswerLedger) -> QuestionResult {
    // Every option is present in the distribution, at zero if nobody chose it
    let mut distribution: HashMap<AnswerId, usize> =
        question.options.iter().map(|o| (o.id.clone(), 0)).collect();
    let mut answered = 0;
    let mut correct = 0;
    for record in ledger.for_question(&question.id) {
        answered += 1;
        if record.is_correct {
            correct += 1;
        }
        *distribution.entry(record.answer_id.clone()).or_default() += 1;
    }
    QuestionResult {
        question_id: question.id.clone(),
        correct_answer_id: question
            .correct_option()
            .map(|o| o.id.clone())
            .unwrap_or_default(),
        answered,
        correct,
        distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{session_setup, test_engine};

    #[tokio::test]
    async fn test_join_only_in_lobby() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        engine.start_session(&code, "h1", Utc::now()).await.unwrap();

        let result = engine.join_session(&code, "Carol", "c3", None).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_start_is_host_only() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;

        let result = engine.start_session(&code, "c1", Utc::now()).await;
        assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_start_requires_players() {
        let engine = test_engine();
        let host = crate::providers::Identity {
            user_id: "u0".to_string(),
            display_name: "Host".to_string(),
        };
        let room = engine
            .create_session(&host, "h1", "qs1", GameConfig::default())
            .await
            .unwrap();

        let result = engine.start_session(&room.code, "h1", Utc::now()).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_answer_scoring_includes_time_bonus() {
        let engine = test_engine();
        let (code, players) = session_setup(&engine).await;
        let served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();
        let start = served.deadline.unwrap() - chrono::Duration::seconds(30);

        // Alice instantly and correctly, Bob correct but at the wire
        let fast = engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", start)
            .await
            .unwrap();
        let slow = engine
            .submit_session_answer(
                &code,
                "c2",
                "q1",
                "q1-0",
                start + chrono::Duration::seconds(29),
            )
            .await
            .unwrap();

        let (fast, slow) = match (fast, slow) {
            (SessionSubmission::Recorded(a), SessionSubmission::Recorded(b)) => (a, b),
            other => panic!("expected recorded submissions, got {other:?}"),
        };
        assert!(fast.points > slow.points);
        assert_eq!(fast.player_key, players[0]);
        assert!(slow.points >= 100);
    }

    #[tokio::test]
    async fn test_late_submission_soft_rejected() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        let served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();
        let deadline = served.deadline.unwrap();

        let late = engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", deadline + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(matches!(late, SessionSubmission::Late));

        // Nothing recorded: the aggregate stays empty
        let result = engine.session_question_result(&code).await.unwrap();
        assert_eq!(result.answered, 0);
    }

    #[tokio::test]
    async fn test_duplicate_returns_prior_record() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        let served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();
        let start = served.deadline.unwrap() - chrono::Duration::seconds(30);

        engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", start + chrono::Duration::seconds(2))
            .await
            .unwrap();
        let replay = engine
            .submit_session_answer(&code, "c1", "q1", "q1-3", start + chrono::Duration::seconds(4))
            .await
            .unwrap();

        match replay {
            SessionSubmission::Duplicate(record) => {
                assert_eq!(record.answer_id, "q1-0");
                assert!(record.is_correct);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_question_result_distribution() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        let served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();
        let start = served.deadline.unwrap() - chrono::Duration::seconds(30);

        engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", start + chrono::Duration::seconds(1))
            .await
            .unwrap();
        engine
            .submit_session_answer(&code, "c2", "q1", "q1-2", start + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let result = engine.reveal_question_result(&code, "h1").await.unwrap();
        assert_eq!(result.answered, 2);
        assert_eq!(result.correct, 1);
        assert_eq!(result.distribution.get("q1-0"), Some(&1));
        assert_eq!(result.distribution.get("q1-2"), Some(&1));
        assert_eq!(result.correct_answer_id, "q1-0");

        let room = engine.registry.get(&code).await.unwrap();
        assert_eq!(room.session().unwrap().status, SessionStatus::ShowingResult);
    }

    #[tokio::test]
    async fn test_leaderboard_orders_and_breaks_ties() {
        let engine = test_engine();
        let (code, players) = session_setup(&engine).await;
        let served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();
        let start = served.deadline.unwrap() - chrono::Duration::seconds(30);

        engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", start + chrono::Duration::seconds(3))
            .await
            .unwrap();
        engine
            .submit_session_answer(&code, "c2", "q1", "q1-1", start + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let board = engine.session_leaderboard(&code).await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].player_key, players[0]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].rank, 2);
        assert_eq!(board[1].score, 0);

        // Pure function: recomputing yields the identical board
        assert_eq!(engine.session_leaderboard(&code).await.unwrap(), board);
    }

    #[tokio::test]
    async fn test_full_session_flow() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        let mut served = engine.start_session(&code, "h1", Utc::now()).await.unwrap();

        for i in 0..3 {
            assert_eq!(served.index, i);
            let start = served.deadline.unwrap() - chrono::Duration::seconds(30);
            let qid = served.question.id.clone();
            let correct = served.question.correct_option().unwrap().id.clone();

            engine
                .submit_session_answer(&code, "c1", &qid, &correct, start + chrono::Duration::seconds(2))
                .await
                .unwrap();

            engine.reveal_question_result(&code, "h1").await.unwrap();
            engine.reveal_leaderboard(&code, "h1").await.unwrap();

            match engine
                .next_session_question(&code, "h1", Utc::now())
                .await
                .unwrap()
            {
                SessionAdvance::Question(next) => {
                    assert!(i < 2);
                    served = next;
                }
                SessionAdvance::Completed(board) => {
                    assert_eq!(i, 2);
                    assert_eq!(board[0].correct_count, 3);
                    let room = engine.registry.get(&code).await.unwrap();
                    assert_eq!(room.session().unwrap().status, SessionStatus::Completed);
                    return;
                }
            }
        }
        panic!("session never completed");
    }

    #[tokio::test]
    async fn test_force_end_records_reason() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        engine.start_session(&code, "h1", Utc::now()).await.unwrap();

        let board = engine
            .force_end_session(&code, "h1", "abuse report", Utc::now())
            .await
            .unwrap();
        assert_eq!(board.len(), 2);

        let room = engine.registry.get(&code).await.unwrap();
        let session = room.session().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.end_reason.as_deref(), Some("abuse report"));

        // Terminal: further submissions are invalid-state, not recorded
        let result = engine
            .submit_session_answer(&code, "c1", "q1", "q1-0", Utc::now())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_host_reconnect_rebinds_host_connection() {
        let engine = test_engine();
        let (code, _) = session_setup(&engine).await;
        engine.start_session(&code, "h1", Utc::now()).await.unwrap();

        engine.handle_disconnect("h1").await.unwrap();
        let room = engine.registry.get(&code).await.unwrap();
        assert!(room.session().unwrap().host_connection_id.is_none());

        // The host has no player slot but reconnects by user id
        let room = engine.reconnect_player(&code, "u0", "h1b").await.unwrap();
        assert_eq!(
            room.session().unwrap().host_connection_id.as_deref(),
            Some("h1b")
        );

        // The rebound connection drives the game again
        let advanced = engine
            .next_session_question(&code, "h1b", Utc::now())
            .await
            .unwrap();
        assert!(matches!(advanced, SessionAdvance::Question(_)));
    }

    #[tokio::test]
    async fn test_host_disconnect_keeps_players() {
        let engine = test_engine();
        let (code, players) = session_setup(&engine).await;
        engine.start_session(&code, "h1", Utc::now()).await.unwrap();

        let notice = engine.handle_disconnect("c2").await.unwrap();
        assert_eq!(notice.player_key, players[1]);
        assert_eq!(notice.display_name.as_deref(), Some("Bob"));

        let room = engine.registry.get(&code).await.unwrap();
        let session = room.session().unwrap();
        assert_eq!(session.players.len(), 2, "slot survives disconnect");
        assert!(!session.players[&players[1]].connected);

        // Reconnect by user id restores the same slot
        let room = engine.reconnect_player(&code, "u2", "c2b").await.unwrap();
        let player = &room.session().unwrap().players[&players[1]];
        assert!(player.connected);
        assert_eq!(player.connection_id, "c2b");
    }
}
