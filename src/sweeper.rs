//! Background room maintenance
//!
//! One loop per process: evicts rooms idle past the TTL (and terminal
//! rooms past their grace period), drops their broadcast channels, and
//! tells any remaining subscribers the room is gone. Deadline-driven
//! round timeouts stay passive; the sweeper only reclaims memory.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::GameEngine;
use crate::protocol::ServerEvent;
use crate::ws::RoomHub;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the eviction loop. Runs for the lifetime of the process.
pub fn spawn_room_sweeper(engine: Arc<GameEngine>, hub: Arc<RoomHub>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let now = Utc::now();

            // Fallback for boss fights nobody is submitting to anymore:
            // the overall timer still expires
            for code in engine.registry.codes().await {
                if let Ok(Some(_)) = engine.check_boss_expiry(&code, now).await {
                    let entries = engine.session_leaderboard(&code).await.unwrap_or_default();
                    hub.publish(&code, ServerEvent::BossFightExpired { entries })
                        .await;
                }
            }

            let evicted = engine.registry.evict_expired(now).await;
            for code in evicted {
                let dropped = engine.connections.remove_room(&code).await;
                hub.publish(
                    &code,
                    ServerEvent::RoomCancelled {
                        code: code.clone(),
                        reason: "room expired".to_string(),
                    },
                )
                .await;
                hub.remove(&code).await;
                tracing::info!(
                    code = %code,
                    connections = dropped.len(),
                    "swept expired room"
                );
            }
        }
    });
}
