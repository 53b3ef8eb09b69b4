//! Room registry
//!
//! Create/get/update/delete for active rooms, keyed by short human-shareable
//! code. `update` is the engine's per-room critical section: the mutation
//! closure runs against a snapshot and commits with compare-and-swap on the
//! stored version, retrying from a fresh snapshot when it loses a race.
//! Rooms are independent units of concurrency; nothing here locks two rooms.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::store::{RoomStore, SwapOutcome};
use crate::types::{EngineConfig, Room, RoomCode};

/// Code alphabet without lookalikes (0/O, 1/I/L).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub struct RoomRegistry {
    store: Arc<dyn RoomStore>,
    config: EngineConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RoomStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    fn generate_code(&self) -> RoomCode {
        let mut rng = rand::rng();
        (0..self.config.code_length)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }

    /// Create a room under a collision-free code, retrying generation against
    /// the store. `Conflict` only when retries are exhausted.
    pub async fn create_with<F>(&self, build: F) -> EngineResult<Room>
    where
        F: Fn(RoomCode) -> Room,
    {
        for _ in 0..self.config.code_retries {
            let code = self.generate_code();
            let room = build(code.clone());
            if self.store.insert(room.clone()).await {
                tracing::info!(code = %code, "room created");
                return Ok(room);
            }
            tracing::debug!(code = %code, "room code collision, retrying");
        }
        Err(EngineError::Conflict)
    }

    pub async fn get(&self, code: &str) -> EngineResult<Room> {
        self.store
            .get(code)
            .await
            .map(|v| v.room)
            .ok_or_else(|| EngineError::RoomNotFound(code.to_string()))
    }

    /// Run `f` against the current room state and commit atomically.
    ///
    /// The closure may run more than once: when the compare-and-swap loses to
    /// a concurrent commit, it is re-applied to the fresh snapshot. It must
    /// therefore be a pure state transition — side effects belong to the
    /// caller, after this returns. An `Err` from the closure aborts without
    /// writing.
    pub async fn update<T, F>(&self, code: &str, mut f: F) -> EngineResult<T>
    where
        F: FnMut(&mut Room) -> EngineResult<T>,
    {
        loop {
            let snapshot = self
                .store
                .get(code)
                .await
                .ok_or_else(|| EngineError::RoomNotFound(code.to_string()))?;

            let mut room = snapshot.room;
            let out = f(&mut room)?;
            room.last_activity = Utc::now();

            match self.store.swap(code, snapshot.version, room).await {
                SwapOutcome::Swapped => return Ok(out),
                SwapOutcome::VersionMismatch => continue,
                SwapOutcome::Missing => {
                    return Err(EngineError::RoomNotFound(code.to_string()))
                }
            }
        }
    }

    /// Idempotent removal.
    pub async fn remove(&self, code: &str) {
        self.store.remove(code).await;
    }

    pub async fn codes(&self) -> Vec<RoomCode> {
        self.store.codes().await
    }

    /// Remove rooms idle past the TTL, and terminal rooms past the grace
    /// period. Returns the evicted codes so callers can clean up channels
    /// and connection entries.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Vec<RoomCode> {
        let idle_ttl = chrono::Duration::seconds(self.config.idle_ttl_secs);
        let grace = chrono::Duration::seconds(self.config.completed_grace_secs);
        let mut evicted = Vec::new();

        for code in self.store.codes().await {
            let Some(snapshot) = self.store.get(&code).await else {
                continue;
            };
            let room = &snapshot.room;
            let expired = match room.completed_at {
                Some(done) if room.is_terminal() => now > done + grace,
                _ => now > room.last_activity + idle_ttl,
            };
            if expired {
                self.store.remove(&code).await;
                tracing::info!(code = %code, "evicted expired room");
                evicted.push(code);
            }
        }
        evicted
    }
}
