//! Keyed room storage
//!
//! Room state lives behind a small key-value interface so a single-process
//! in-memory map and a distributed cache satisfy it identically. The
//! compare-and-swap on the stored version is what makes the registry's
//! update loop a per-room critical section.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{Room, RoomCode};

/// A room snapshot together with its store version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRoom {
    pub version: u64,
    pub room: Room,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SwapOutcome {
    Swapped,
    /// Someone else committed since the snapshot was read.
    VersionMismatch,
    Missing,
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get(&self, code: &str) -> Option<VersionedRoom>;

    /// Store a new room at version 1. Returns false if the code is taken.
    async fn insert(&self, room: Room) -> bool;

    /// Replace the room iff the stored version still equals `expected`.
    async fn swap(&self, code: &str, expected: u64, room: Room) -> SwapOutcome;

    /// Idempotent removal.
    async fn remove(&self, code: &str);

    async fn codes(&self) -> Vec<RoomCode>;
}

/// Single-process store on a `RwLock<HashMap>`.
#[derive(Default)]
pub struct InMemoryRoomStore {
    rooms: RwLock<HashMap<RoomCode, VersionedRoom>>,
}

impl InMemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn get(&self, code: &str) -> Option<VersionedRoom> {
        self.rooms.read().await.get(code).cloned()
    }

    async fn insert(&self, room: Room) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.code) {
            return false;
        }
        rooms.insert(room.code.clone(), VersionedRoom { version: 1, room });
        true
    }

    async fn swap(&self, code: &str, expected: u64, room: Room) -> SwapOutcome {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(code) {
            Some(stored) if stored.version == expected => {
                stored.version += 1;
                stored.room = room;
                SwapOutcome::Swapped
            }
            Some(_) => SwapOutcome::VersionMismatch,
            None => SwapOutcome::Missing,
        }
    }

    async fn remove(&self, code: &str) {
        self.rooms.write().await.remove(code);
    }

    async fn codes(&self) -> Vec<RoomCode> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;

    fn duel_room(code: &str) -> Room {
        let now = Utc::now();
        Room {
            code: code.to_string(),
            id: ulid::Ulid::new().to_string(),
            quiz_set_id: "qs1".to_string(),
            questions: Vec::new(),
            current_index: 0,
            ledger: Default::default(),
            mode: RoomMode::Duel(DuelState {
                status: DuelStatus::Waiting,
                creator: DuelPlayer {
                    user_id: "u1".to_string(),
                    display_name: "Alice".to_string(),
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
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_code() {
        let store = InMemoryRoomStore::new();
        assert!(store.insert(duel_room("AB12CD")).await);
        assert!(!store.insert(duel_room("AB12CD")).await);
        assert_eq!(store.codes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_swap_requires_matching_version() {
        let store = InMemoryRoomStore::new();
        store.insert(duel_room("AB12CD")).await;

        let snapshot = store.get("AB12CD").await.unwrap();
        assert_eq!(snapshot.version, 1);

        // First committer wins
        assert_eq!(
            store.swap("AB12CD", snapshot.version, snapshot.room.clone()).await,
            SwapOutcome::Swapped
        );
        // Stale version loses
        assert_eq!(
            store.swap("AB12CD", snapshot.version, snapshot.room.clone()).await,
            SwapOutcome::VersionMismatch
        );
        assert_eq!(store.get("AB12CD").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = InMemoryRoomStore::new();
        store.insert(duel_room("AB12CD")).await;
        store.remove("AB12CD").await;
        store.remove("AB12CD").await;
        assert!(store.get("AB12CD").await.is_none());
        assert_eq!(
            store.swap("AB12CD", 1, duel_room("AB12CD")).await,
            SwapOutcome::Missing
        );
    }
}
