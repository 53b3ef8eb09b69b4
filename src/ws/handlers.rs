//! WebSocket command dispatch
//!
//! Bridges the wire protocol to engine operations. Each command yields a
//! `Dispatch`: an optional direct reply to the sender, room broadcasts,
//! and (on room entry) the code to subscribe the connection to. Hard
//! engine errors become `Error` events; soft outcomes such as late or
//! duplicate submissions are ordinary replies, never errors.

use chrono::Utc;
use std::sync::Arc;

use crate::engine::{
    BossOptions, BossProgress, BossSubmission, DuelAdvance, GameEngine, ServedQuestion,
    SessionAdvance, SessionSubmission,
};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{participant_infos, ClientCommand, QuestionInfo, ServerEvent};
use crate::providers::Identity;
use crate::types::*;

pub struct Dispatch {
    pub reply: Option<ServerEvent>,
    pub broadcasts: Vec<(RoomCode, ServerEvent)>,
    /// Set when the command enters a room; the connection subscribes to it.
    pub join: Option<RoomCode>,
}

impl Dispatch {
    fn reply(event: ServerEvent) -> Self {
        Self {
            reply: Some(event),
            broadcasts: Vec::new(),
            join: None,
        }
    }

    fn error(e: EngineError) -> Self {
        Self::reply(ServerEvent::Error {
            code: e.code().to_string(),
            msg: e.to_string(),
        })
    }

    fn join(mut self, code: &str) -> Self {
        self.join = Some(code.to_string());
        self
    }

    fn broadcast(mut self, code: &str, event: ServerEvent) -> Self {
        self.broadcasts.push((code.to_string(), event));
        self
    }
}

fn show_question(served: &ServedQuestion) -> ServerEvent {
    ServerEvent::ShowQuestion {
        index: served.index,
        total: served.total,
        question: QuestionInfo::from(&served.question),
        server_now: Utc::now().to_rfc3339(),
        deadline: served.deadline.map(|d| d.to_rfc3339()),
    }
}

fn answer_ack(question_id: &str, accepted: bool, duplicate: bool, late: bool) -> ServerEvent {
    ServerEvent::AnswerAck {
        question_id: question_id.to_string(),
        accepted,
        duplicate: duplicate.then_some(true),
        late: late.then_some(true),
    }
}

pub async fn handle_command(
    command: ClientCommand,
    identity: &Identity,
    conn_id: &str,
    engine: &Arc<GameEngine>,
) -> Dispatch {
    match command {
        ClientCommand::CreateRoom { quiz_set_id } => {
            match engine.create_duel(identity, &quiz_set_id).await {
                Ok(room) => Dispatch::reply(ServerEvent::RoomCreated {
                    code: room.code.clone(),
                    room_id: room.id,
                })
                .join(&room.code),
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::CreateGame {
            quiz_set_id,
            config,
        } => {
            match engine
                .create_session(identity, conn_id, &quiz_set_id, config.unwrap_or_default())
                .await
            {
                Ok(room) => Dispatch::reply(ServerEvent::RoomCreated {
                    code: room.code.clone(),
                    room_id: room.id,
                })
                .join(&room.code),
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::ConnectRoom { code } => {
            match engine
                .connect_creator(&code, &identity.user_id, conn_id)
                .await
            {
                Ok(room) => Dispatch::reply(ServerEvent::PlayerJoined {
                    code: room.code.clone(),
                    player_key: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                })
                .join(&room.code),
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::JoinRoom { code, display_name } => {
            handle_join(engine, identity, conn_id, &code, display_name).await
        }

        ClientCommand::ReconnectRoom { code } => {
            match engine
                .reconnect_player(&code, &identity.user_id, conn_id)
                .await
            {
                Ok(room) => {
                    let player_key = player_key_in(&room, &identity.user_id);
                    let answered = room
                        .ledger
                        .for_player(&player_key)
                        .map(|r| r.question_id.clone())
                        .collect();
                    let score = room.ledger.totals(&player_key).score;
                    Dispatch::reply(ServerEvent::PlayerState {
                        code: room.code.clone(),
                        player_key,
                        answered,
                        score,
                    })
                    .join(&room.code)
                }
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::StartGame { code } => handle_start(engine, conn_id, &code).await,

        ClientCommand::SubmitAnswer {
            code,
            question_id,
            answer_id,
        } => handle_submit(engine, identity, conn_id, &code, &question_id, &answer_id).await,

        ClientCommand::NextQuestion { code } => handle_next(engine, conn_id, &code).await,

        ClientCommand::GetRoundResult { code } => handle_round_result(engine, &code).await,

        ClientCommand::GetQuestionResult { code } => {
            match engine.session_question_result(&code).await {
                Ok(result) => Dispatch::reply(ServerEvent::ShowQuestionResult { result }),
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::ShowQuestionResult { code } => {
            match engine.reveal_question_result(&code, conn_id).await {
                Ok(result) => Dispatch {
                    reply: None,
                    broadcasts: vec![(code, ServerEvent::ShowQuestionResult { result })],
                    join: None,
                },
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::ShowLeaderboard { code } => {
            match engine.reveal_leaderboard(&code, conn_id).await {
                Ok(entries) => Dispatch {
                    reply: None,
                    broadcasts: vec![(code, ServerEvent::ShowLeaderboard { entries })],
                    join: None,
                },
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::GetLeaderboard { code } => match engine.session_leaderboard(&code).await {
            Ok(entries) => Dispatch::reply(ServerEvent::ShowLeaderboard { entries }),
            Err(e) => Dispatch::error(e),
        },

        ClientCommand::GetFinalResult { code } => handle_final_result(engine, &code).await,

        ClientCommand::EnableBossFightMode {
            code,
            boss_hp,
            overall_limit_secs,
            per_question_secs,
            auto_advance,
        } => {
            let options = BossOptions {
                boss_hp,
                overall_limit_secs,
                per_question_secs,
                auto_advance,
            };
            match engine.enable_boss_fight(&code, conn_id, options).await {
                Ok(_) => Dispatch::reply(ServerEvent::BossFightEnabled {
                    hp: boss_hp,
                    max_hp: boss_hp,
                })
                .broadcast(
                    &code,
                    ServerEvent::BossFightEnabled {
                        hp: boss_hp,
                        max_hp: boss_hp,
                    },
                ),
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::GetNextBossQuestion { code } => {
            match engine.boss_player_question(&code, conn_id).await {
                Ok(progress) => boss_progress_reply(engine, &code, progress).await,
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::AdvanceBossPlayer { code } => {
            match engine.advance_boss_player(&code, conn_id, Utc::now()).await {
                Ok(progress) => boss_progress_reply(engine, &code, progress).await,
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::ForceEndGame { code, reason } => {
            let reason = reason.unwrap_or_else(|| "ended by host".to_string());
            match engine
                .force_end_session(&code, conn_id, &reason, Utc::now())
                .await
            {
                Ok(entries) => Dispatch {
                    reply: None,
                    broadcasts: vec![(
                        code,
                        ServerEvent::GameEnded {
                            winner_user_id: None,
                            winner_name: None,
                            entries,
                            reason: Some(reason),
                        },
                    )],
                    join: None,
                },
                Err(e) => Dispatch::error(e),
            }
        }

        ClientCommand::CancelRoom { code, reason } => {
            let reason = reason.unwrap_or_else(|| "cancelled".to_string());
            match authorize_cancel(engine, identity, conn_id, &code).await {
                Ok(()) => match engine.cancel_room(&code, &reason).await {
                    Ok(_) => Dispatch {
                        reply: None,
                        broadcasts: vec![(
                            code.clone(),
                            ServerEvent::RoomCancelled { code, reason },
                        )],
                        join: None,
                    },
                    Err(e) => Dispatch::error(e),
                },
                Err(e) => Dispatch::error(e),
            }
        }
    }
}

/// Joining is mode-dependent: duels take the challenger slot, multiplayer
/// lobbies add a player.
async fn handle_join(
    engine: &Arc<GameEngine>,
    identity: &Identity,
    conn_id: &str,
    code: &str,
    display_name: Option<String>,
) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };

    match room.mode {
        RoomMode::Duel(_) => match engine.join_duel(code, identity, conn_id).await {
            Ok(room) => {
                let joined = ServerEvent::PlayerJoined {
                    code: code.to_string(),
                    player_key: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                };
                let ready = ServerEvent::RoomReady {
                    code: code.to_string(),
                    players: participant_infos(&room),
                };
                Dispatch::reply(joined.clone())
                    .join(code)
                    .broadcast(code, joined)
                    .broadcast(code, ready)
            }
            Err(e) => Dispatch::error(e),
        },
        RoomMode::Session(_) => {
            let name = display_name.unwrap_or_else(|| identity.display_name.clone());
            match engine
                .join_session(code, &name, conn_id, Some(identity.user_id.clone()))
                .await
            {
                Ok((_, player)) => {
                    let joined = ServerEvent::PlayerJoined {
                        code: code.to_string(),
                        player_key: player.id.clone(),
                        display_name: player.display_name.clone(),
                    };
                    Dispatch::reply(joined.clone())
                        .join(code)
                        .broadcast(code, joined)
                }
                Err(e) => Dispatch::error(e),
            }
        }
    }
}

async fn handle_start(engine: &Arc<GameEngine>, conn_id: &str, code: &str) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };

    let started = match room.mode {
        RoomMode::Duel(_) => engine.start_duel(code, conn_id, Utc::now()).await,
        RoomMode::Session(_) => engine.start_session(code, conn_id, Utc::now()).await,
    };
    match started {
        Ok(served) => Dispatch {
            reply: None,
            broadcasts: vec![
                (
                    code.to_string(),
                    ServerEvent::GameStarted {
                        code: code.to_string(),
                    },
                ),
                (code.to_string(), show_question(&served)),
            ],
            join: None,
        },
        Err(e) => Dispatch::error(e),
    }
}

/// Answer submission fans out by mode: duel, boss fight, or shared-pacing
/// session.
async fn handle_submit(
    engine: &Arc<GameEngine>,
    identity: &Identity,
    conn_id: &str,
    code: &str,
    question_id: &str,
    answer_id: &str,
) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };
    let now = Utc::now();

    match &room.mode {
        RoomMode::Duel(_) => {
            match engine
                .submit_duel_answer(code, conn_id, question_id, answer_id, now)
                .await
            {
                Ok(submission) => {
                    // A replay carries the original record but was not
                    // accepted now; only a fresh write acks as accepted
                    let mut dispatch = Dispatch::reply(answer_ack(
                        question_id,
                        !submission.replayed && submission.record.is_some(),
                        submission.replayed,
                        submission.late,
                    ));
                    // Only the resolving submission carries the round; a
                    // replay must not re-broadcast it
                    if !submission.replayed {
                        if let Some(result) = submission.round {
                            dispatch =
                                dispatch.broadcast(code, ServerEvent::ShowRoundResult { result });
                        }
                    }
                    dispatch
                }
                Err(e) => Dispatch::error(e),
            }
        }
        RoomMode::Session(session) if session.boss.is_some() => {
            match engine
                .submit_boss_answer(code, conn_id, question_id, answer_id, now)
                .await
            {
                Ok(BossSubmission::Recorded {
                    record: _,
                    damage,
                    boss,
                    defeated_now,
                }) => {
                    let mut dispatch =
                        Dispatch::reply(answer_ack(question_id, true, false, false)).broadcast(
                            code,
                            ServerEvent::BossDamaged {
                                damage,
                                hp: boss.hp,
                                max_hp: boss.max_hp,
                                by: identity.display_name.clone(),
                            },
                        );
                    if defeated_now {
                        let entries = final_entries(engine, code).await;
                        dispatch = dispatch.broadcast(code, ServerEvent::BossDefeated { entries });
                    }
                    dispatch
                }
                Ok(BossSubmission::Duplicate(_)) => {
                    Dispatch::reply(answer_ack(question_id, false, true, false))
                }
                Ok(BossSubmission::Late) => {
                    Dispatch::reply(answer_ack(question_id, false, false, true))
                }
                Ok(BossSubmission::Terminal(status)) => {
                    let entries = final_entries(engine, code).await;
                    match status.outcome {
                        Some(BossOutcome::TimeExpired) => {
                            Dispatch::reply(answer_ack(question_id, false, false, true))
                                .broadcast(code, ServerEvent::BossFightExpired { entries })
                        }
                        _ => Dispatch::reply(ServerEvent::GameEnded {
                            winner_user_id: None,
                            winner_name: None,
                            entries,
                            reason: None,
                        }),
                    }
                }
                Err(e) => Dispatch::error(e),
            }
        }
        RoomMode::Session(_) => {
            match engine
                .submit_session_answer(code, conn_id, question_id, answer_id, now)
                .await
            {
                Ok(SessionSubmission::Recorded(_)) => {
                    Dispatch::reply(answer_ack(question_id, true, false, false))
                }
                Ok(SessionSubmission::Duplicate(_)) => {
                    Dispatch::reply(answer_ack(question_id, false, true, false))
                }
                Ok(SessionSubmission::Late) => {
                    Dispatch::reply(answer_ack(question_id, false, false, true))
                }
                Err(e) => Dispatch::error(e),
            }
        }
    }
}

async fn handle_next(engine: &Arc<GameEngine>, conn_id: &str, code: &str) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };
    let now = Utc::now();

    match room.mode {
        RoomMode::Duel(_) => match engine.next_duel_question(code, now).await {
            Ok(DuelAdvance::Question(served)) => Dispatch {
                reply: None,
                broadcasts: vec![(code.to_string(), show_question(&served))],
                join: None,
            },
            Ok(DuelAdvance::Completed(final_result)) => Dispatch {
                reply: None,
                broadcasts: vec![(
                    code.to_string(),
                    ServerEvent::GameEnded {
                        winner_user_id: final_result.winner_user_id,
                        winner_name: final_result.winner_name,
                        entries: final_result.entries,
                        reason: None,
                    },
                )],
                join: None,
            },
            Err(e) => Dispatch::error(e),
        },
        RoomMode::Session(_) => match engine.next_session_question(code, conn_id, now).await {
            Ok(SessionAdvance::Question(served)) => Dispatch {
                reply: None,
                broadcasts: vec![(code.to_string(), show_question(&served))],
                join: None,
            },
            Ok(SessionAdvance::Completed(entries)) => Dispatch {
                reply: None,
                broadcasts: vec![(
                    code.to_string(),
                    ServerEvent::GameEnded {
                        winner_user_id: None,
                        winner_name: None,
                        entries,
                        reason: None,
                    },
                )],
                join: None,
            },
            Err(e) => Dispatch::error(e),
        },
    }
}

/// Poll path for duel clients waiting on a round: replays an already
/// resolved result, or resolves an expired round right now. The resolving
/// call broadcasts; a replay only replies.
async fn handle_round_result(engine: &Arc<GameEngine>, code: &str) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };
    let Some(duel) = room.duel() else {
        return Dispatch::error(EngineError::InvalidState("not a duel room".to_string()));
    };

    if let Some(result) = duel.current_result.clone() {
        return Dispatch::reply(ServerEvent::ShowRoundResult { result });
    }
    match engine.check_round_timeout(code, Utc::now()).await {
        Ok(Some(result)) => Dispatch::reply(ServerEvent::ShowRoundResult {
            result: result.clone(),
        })
        .broadcast(code, ServerEvent::ShowRoundResult { result }),
        Ok(None) => Dispatch {
            reply: None,
            broadcasts: Vec::new(),
            join: None,
        },
        Err(e) => Dispatch::error(e),
    }
}

async fn handle_final_result(engine: &Arc<GameEngine>, code: &str) -> Dispatch {
    let room = match engine.registry.get(code).await {
        Ok(room) => room,
        Err(e) => return Dispatch::error(e),
    };

    match room.mode {
        RoomMode::Duel(_) => match engine.final_duel_result(code).await {
            Ok(final_result) => Dispatch::reply(ServerEvent::GameEnded {
                winner_user_id: final_result.winner_user_id,
                winner_name: final_result.winner_name,
                entries: final_result.entries,
                reason: None,
            }),
            Err(e) => Dispatch::error(e),
        },
        RoomMode::Session(session) => {
            if !session.status.is_terminal() {
                return Dispatch::error(EngineError::InvalidState(
                    "game not finished".to_string(),
                ));
            }
            match engine.session_leaderboard(code).await {
                Ok(entries) => Dispatch::reply(ServerEvent::GameEnded {
                    winner_user_id: None,
                    winner_name: None,
                    entries,
                    reason: session.end_reason.clone(),
                }),
                Err(e) => Dispatch::error(e),
            }
        }
    }
}

async fn boss_progress_reply(
    engine: &Arc<GameEngine>,
    code: &str,
    progress: BossProgress,
) -> Dispatch {
    match progress {
        BossProgress::Question(served) => Dispatch::reply(show_question(&served)),
        BossProgress::Exhausted => Dispatch::reply(ServerEvent::BossQuestionsExhausted),
        BossProgress::Over(_) => {
            let entries = final_entries(engine, code).await;
            Dispatch::reply(ServerEvent::GameEnded {
                winner_user_id: None,
                winner_name: None,
                entries,
                reason: None,
            })
        }
    }
}

/// Standings for a room that may already be gone; an empty board then.
async fn final_entries(engine: &Arc<GameEngine>, code: &str) -> Vec<LeaderboardEntry> {
    engine.session_leaderboard(code).await.unwrap_or_default()
}

/// Cancellation rights: the duel creator or any bound participant; the
/// session host.
async fn authorize_cancel(
    engine: &Arc<GameEngine>,
    identity: &Identity,
    conn_id: &str,
    code: &str,
) -> EngineResult<()> {
    let room = engine.registry.get(code).await?;
    let allowed = match &room.mode {
        RoomMode::Duel(duel) => {
            duel.creator.user_id == identity.user_id
                || [Some(&duel.creator), duel.challenger.as_ref()]
                    .into_iter()
                    .flatten()
                    .any(|p| p.connection_id.as_deref() == Some(conn_id))
        }
        RoomMode::Session(session) => session.host_connection_id.as_deref() == Some(conn_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "not allowed to cancel this room".to_string(),
        ))
    }
}

fn player_key_in(room: &Room, user_id: &str) -> String {
    match &room.mode {
        RoomMode::Duel(_) => user_id.to_string(),
        RoomMode::Session(session) => session
            .players
            .values()
            .find(|p| p.user_id.as_deref() == Some(user_id))
            .map(|p| p.id.clone())
            .unwrap_or_else(|| user_id.to_string()),
    }
}
