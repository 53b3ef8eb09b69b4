//! Connection map
//!
//! Reverse index from transport connection id to (room code, player key).
//! A connection maps to at most one slot at a time; re-adding replaces the
//! previous entry. Removal never touches the player's room slot, so a
//! dropped connection can reconnect into the same slot later.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{ConnectionId, RoomCode};

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEntry {
    pub room_code: RoomCode,
    /// UserId in duel rooms, PlayerId in session rooms.
    pub player_key: String,
}

#[derive(Default)]
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, conn_id: &str, room_code: &str, player_key: &str) {
        self.inner.write().await.insert(
            conn_id.to_string(),
            ConnectionEntry {
                room_code: room_code.to_string(),
                player_key: player_key.to_string(),
            },
        );
    }

    pub async fn remove(&self, conn_id: &str) -> Option<ConnectionEntry> {
        self.inner.write().await.remove(conn_id)
    }

    pub async fn lookup(&self, conn_id: &str) -> Option<ConnectionEntry> {
        self.inner.read().await.get(conn_id).cloned()
    }

    /// Drop every entry for a room, returning the affected connection ids.
    pub async fn remove_room(&self, room_code: &str) -> Vec<ConnectionId> {
        let mut inner = self.inner.write().await;
        let gone: Vec<ConnectionId> = inner
            .iter()
            .filter(|(_, e)| e.room_code == room_code)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            inner.remove(id);
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_maps_to_one_slot() {
        let map = ConnectionMap::new();
        map.add("c1", "AB12CD", "u1").await;
        map.add("c1", "XY34ZW", "u9").await;

        let entry = map.lookup("c1").await.unwrap();
        assert_eq!(entry.room_code, "XY34ZW");
        assert_eq!(entry.player_key, "u9");
    }

    #[tokio::test]
    async fn test_remove_returns_entry() {
        let map = ConnectionMap::new();
        map.add("c1", "AB12CD", "u1").await;

        let entry = map.remove("c1").await.unwrap();
        assert_eq!(entry.room_code, "AB12CD");
        assert!(map.remove("c1").await.is_none());
        assert!(map.lookup("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_room_clears_all_members() {
        let map = ConnectionMap::new();
        map.add("c1", "AB12CD", "u1").await;
        map.add("c2", "AB12CD", "u2").await;
        map.add("c3", "XY34ZW", "u3").await;

        let mut gone = map.remove_room("AB12CD").await;
        gone.sort();
        assert_eq!(gone, vec!["c1".to_string(), "c2".to_string()]);
        assert!(map.lookup("c3").await.is_some());
    }
}
