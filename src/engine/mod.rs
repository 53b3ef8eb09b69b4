//! Game session engine
//!
//! `GameEngine` owns the room registry, the connection map, and the
//! collaborator seams. The mode-specific state machines live in their own
//! modules as further `impl GameEngine` blocks; everything here is shared
//! across both game modes.
//!
//! All room mutation flows through `RoomRegistry::update`, whose versioned
//! compare-and-swap is the per-room critical section. Engine operations
//! return events/values to the caller; nothing is broadcast from inside a
//! mutation closure, so a lost CAS race can safely re-run it.

mod boss;
mod duel;
mod leaderboard;
mod multiplayer;

pub use boss::{BossOptions, BossProgress, BossSubmission};
pub use duel::{DuelAdvance, DuelSubmission};
pub use leaderboard::{compute_duel_result, compute_leaderboard};
pub use multiplayer::{SessionAdvance, SessionSubmission};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::connections::ConnectionMap;
use crate::error::{EngineError, EngineResult};
use crate::providers::{QuestionProvider, ResultSink};
use crate::registry::RoomRegistry;
use crate::store::RoomStore;
use crate::types::*;

/// A question as handed to the transport for display, with its deadline.
#[derive(Debug, Clone)]
pub struct ServedQuestion {
    pub index: usize,
    pub total: usize,
    pub question: Question,
    pub deadline: Option<DateTime<Utc>>,
}

/// What `handle_disconnect` found, for the transport to announce.
#[derive(Debug, Clone)]
pub struct DisconnectNotice {
    pub room_code: RoomCode,
    pub player_key: String,
    pub display_name: Option<String>,
}

pub struct GameEngine {
    pub registry: RoomRegistry,
    pub connections: ConnectionMap,
    questions: Arc<dyn QuestionProvider>,
    results: Arc<dyn ResultSink>,
    pub config: EngineConfig,
    /// Deferred post-completion cleanup tasks, cancellable on code reuse.
    cleanup_tasks: Mutex<HashMap<RoomCode, JoinHandle<()>>>,
}

impl GameEngine {
    pub fn new(
        store: Arc<dyn RoomStore>,
        questions: Arc<dyn QuestionProvider>,
        results: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(store, config.clone()),
            connections: ConnectionMap::new(),
            questions,
            results,
            config,
            cleanup_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the question snapshot once, at game start.
    pub(crate) async fn snapshot(&self, quiz_set_id: &str) -> EngineResult<Vec<Question>> {
        let questions = self
            .questions
            .get_questions(quiz_set_id)
            .await
            .map_err(|e| EngineError::NotFound(e.to_string()))?;
        if questions.is_empty() {
            return Err(EngineError::NotFound(format!(
                "questions for quiz set {quiz_set_id}"
            )));
        }
        Ok(questions)
    }

    /// Fire-and-forget hand-off of the final summary to the result sink.
    pub(crate) fn hand_off_result(self: &Arc<Self>, code: &str, summary: Vec<LeaderboardEntry>) {
        let sink = self.results.clone();
        let code = code.to_string();
        tokio::spawn(async move {
            sink.record_final_result(&code, &summary).await;
        });
    }

    /// Schedule room removal after the configured grace period. Re-scheduling
    /// replaces (and aborts) any pending task for the same code.
    pub(crate) fn schedule_cleanup(self: &Arc<Self>, code: &str) {
        let grace = std::time::Duration::from_secs(self.config.completed_grace_secs.max(0) as u64);
        let engine = Arc::clone(self);
        let task_code = code.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            engine.cleanup_room(&task_code).await;
            engine.cleanup_tasks.lock().unwrap().remove(&task_code);
        });

        let mut tasks = self.cleanup_tasks.lock().unwrap();
        if let Some(previous) = tasks.insert(code.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancel a pending deferred cleanup, e.g. when its code was reused.
    pub(crate) fn cancel_cleanup(&self, code: &str) {
        if let Some(handle) = self.cleanup_tasks.lock().unwrap().remove(code) {
            handle.abort();
        }
    }

    /// Remove room state and every connection bound to it. Safe to call
    /// twice; a second call is a no-op.
    pub async fn cleanup_room(&self, code: &str) {
        self.registry.remove(code).await;
        let dropped = self.connections.remove_room(code).await;
        if !dropped.is_empty() {
            tracing::debug!(code = %code, connections = dropped.len(), "room cleaned up");
        }
    }

    /// Explicit Cancelled escape from any non-terminal state. Cancelling an
    /// already-cancelled room is a no-op; a completed room cannot be.
    pub async fn cancel_room(self: &Arc<Self>, code: &str, reason: &str) -> EngineResult<Room> {
        let reason = reason.to_string();
        let room = self
            .registry
            .update(code, |room| {
                match &mut room.mode {
                    RoomMode::Duel(d) => match d.status {
                        DuelStatus::Completed => {
                            return Err(EngineError::InvalidState(
                                "room already completed".to_string(),
                            ))
                        }
                        DuelStatus::Cancelled => {}
                        _ => d.status = DuelStatus::Cancelled,
                    },
                    RoomMode::Session(s) => match s.status {
                        SessionStatus::Completed => {
                            return Err(EngineError::InvalidState(
                                "game already completed".to_string(),
                            ))
                        }
                        SessionStatus::Cancelled => {}
                        _ => {
                            s.status = SessionStatus::Cancelled;
                            s.end_reason = Some(reason.clone());
                        }
                    },
                }
                room.completed_at.get_or_insert(Utc::now());
                Ok(room.clone())
            })
            .await?;

        tracing::info!(code = %code, reason = %reason, "room cancelled");
        self.schedule_cleanup(code);
        Ok(room)
    }

    /// Rebind an existing player slot to a new connection. The user id must
    /// match a slot already in the room; no duplicate participant is created.
    pub async fn reconnect_player(
        &self,
        code: &str,
        user_id: &str,
        new_conn: &str,
    ) -> EngineResult<Room> {
        let user_id = user_id.to_string();
        let new_conn_id = new_conn.to_string();

        let (room, player_key, old_conn) = self
            .registry
            .update(code, |room| {
                if room.is_terminal() {
                    return Err(EngineError::InvalidState("room already over".to_string()));
                }
                let (player_key, old_conn) = match &mut room.mode {
                    RoomMode::Duel(d) => {
                        let slot = [Some(&mut d.creator), d.challenger.as_mut()]
                            .into_iter()
                            .flatten()
                            .find(|p| p.user_id == user_id)
                            .ok_or_else(|| {
                                EngineError::NotFound(format!("player {user_id} in room"))
                            })?;
                        let old = slot.connection_id.replace(new_conn_id.clone());
                        slot.connected = true;
                        (slot.user_id.clone(), old)
                    }
                    RoomMode::Session(s) => {
                        // The host has no player slot; rebind their connection
                        if s.host_user_id == user_id {
                            let old = s.host_connection_id.replace(new_conn_id.clone());
                            (user_id.clone(), old)
                        } else {
                            let slot = s
                                .players
                                .values_mut()
                                .find(|p| p.user_id.as_deref() == Some(user_id.as_str()))
                                .ok_or_else(|| {
                                    EngineError::NotFound(format!("player {user_id} in game"))
                                })?;
                            let old = Some(std::mem::replace(
                                &mut slot.connection_id,
                                new_conn_id.clone(),
                            ));
                            slot.connected = true;
                            (slot.id.clone(), old)
                        }
                    }
                };
                Ok((room.clone(), player_key, old_conn))
            })
            .await?;

        if let Some(old) = old_conn {
            self.connections.remove(&old).await;
        }
        self.connections.add(new_conn, code, &player_key).await;
        tracing::info!(code = %code, user = %user_id, "player reconnected");
        Ok(room)
    }

    /// Mark the player behind a lost connection offline. Never removes the
    /// slot (reconnection stays possible) and never cancels the room.
    pub async fn handle_disconnect(&self, conn_id: &str) -> Option<DisconnectNotice> {
        let entry = self.connections.remove(conn_id).await?;
        let player_key = entry.player_key.clone();

        let display_name = self
            .registry
            .update(&entry.room_code, |room| {
                let name = match &mut room.mode {
                    RoomMode::Duel(d) => [Some(&mut d.creator), d.challenger.as_mut()]
                        .into_iter()
                        .flatten()
                        .find(|p| p.user_id == player_key)
                        .map(|p| {
                            p.connected = false;
                            p.connection_id = None;
                            p.display_name.clone()
                        }),
                    RoomMode::Session(s) => {
                        if s.host_connection_id.as_deref() == Some(conn_id) {
                            s.host_connection_id = None;
                        }
                        s.players.get_mut(&player_key).map(|p| {
                            p.connected = false;
                            p.display_name.clone()
                        })
                    }
                };
                Ok(name)
            })
            .await
            .ok()
            .flatten();

        tracing::info!(code = %entry.room_code, player = %player_key, "connection lost");
        Some(DisconnectNotice {
            room_code: entry.room_code,
            player_key,
            display_name,
        })
    }

    /// Which room a connection belongs to, if any.
    pub async fn room_by_connection(&self, conn_id: &str) -> Option<RoomCode> {
        self.connections.lookup(conn_id).await.map(|e| e.room_code)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::providers::{
        sample_questions, Identity, NoopResultSink, StaticQuestionProvider,
    };
    use crate::store::InMemoryRoomStore;

    pub fn test_engine() -> Arc<GameEngine> {
        Arc::new(GameEngine::new(
            Arc::new(InMemoryRoomStore::new()),
            Arc::new(StaticQuestionProvider::new().with_set("qs1", sample_questions())),
            Arc::new(NoopResultSink),
            EngineConfig::default(),
        ))
    }

    /// Duel room "qs1" with Alice (u1/c1) vs Bob (u2/c2), already started.
    pub async fn duel_setup(engine: &Arc<GameEngine>) -> (RoomCode, ServedQuestion) {
        let alice = Identity {
            user_id: "u1".to_string(),
            display_name: "Alice".to_string(),
        };
        let bob = Identity {
            user_id: "u2".to_string(),
            display_name: "Bob".to_string(),
        };

        let room = engine.create_duel(&alice, "qs1").await.unwrap();
        engine.connect_creator(&room.code, "u1", "c1").await.unwrap();
        engine.join_duel(&room.code, &bob, "c2").await.unwrap();
        let served = engine
            .start_duel(&room.code, "c1", Utc::now())
            .await
            .unwrap();
        (room.code, served)
    }

    /// Session hosted by u0/h1 with players Alice (c1) and Bob (c2), in Lobby.
    pub async fn session_setup(engine: &Arc<GameEngine>) -> (RoomCode, Vec<PlayerId>) {
        let host = Identity {
            user_id: "u0".to_string(),
            display_name: "Host".to_string(),
        };
        let room = engine
            .create_session(&host, "h1", "qs1", GameConfig::default())
            .await
            .unwrap();

        let mut players = Vec::new();
        for (name, conn, user) in [("Alice", "c1", Some("u1")), ("Bob", "c2", Some("u2"))] {
            let (_, player) = engine
                .join_session(&room.code, name, conn, user.map(str::to_string))
                .await
                .unwrap();
            players.push(player.id);
        }
        (room.code, players)
    }
}
