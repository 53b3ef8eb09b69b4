//! Ranking, recomputed from the answer ledger
//!
//! Scores are never stored on player slots; every board is derived fresh
//! from the ledger so a replayed or raced submission can't drift a cached
//! total. Ordering: score descending, total answer time ascending, then
//! join order for stability. Ranks use competition numbering (1, 2, 2, 4).

use crate::types::*;

/// Participants of a room in join order, as (ledger key, display name).
fn participants(room: &Room) -> Vec<(String, String)> {
    match &room.mode {
        RoomMode::Duel(duel) => [Some(&duel.creator), duel.challenger.as_ref()]
            .into_iter()
            .flatten()
            .map(|p| (p.user_id.clone(), p.display_name.clone()))
            .collect(),
        RoomMode::Session(session) => {
            let mut players: Vec<_> = session.players.values().collect();
            players.sort_by_key(|p| (p.joined_at, p.id.clone()));
            players
                .into_iter()
                .map(|p| (p.id.clone(), p.display_name.clone()))
                .collect()
        }
    }
}

pub fn compute_leaderboard(room: &Room) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = participants(room)
        .into_iter()
        .map(|(key, name)| {
            let totals = room.ledger.totals(&key);
            LeaderboardEntry {
                player_key: key,
                display_name: name,
                score: totals.score,
                correct_count: totals.correct_count,
                time_spent_secs: totals.time_spent_secs,
                rank: 0,
            }
        })
        .collect();

    // Stable sort keeps join order among full ties
    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.time_spent_secs.total_cmp(&b.time_spent_secs))
    });

    let mut prev: Option<(u32, f64)> = None;
    let mut prev_rank = 0;
    for (i, entry) in entries.iter_mut().enumerate() {
        let key = (entry.score, entry.time_spent_secs);
        entry.rank = match prev {
            Some(p) if p == key => prev_rank,
            _ => (i + 1) as u32,
        };
        prev = Some(key);
        prev_rank = entry.rank;
    }
    entries
}

/// Final duel outcome. Winner tie-break: score, then correct count, then
/// total time; a dead tie yields no winner.
pub fn compute_duel_result(room: &Room) -> FinalResult {
    let entries = compute_leaderboard(room);

    let winner = match entries.as_slice() {
        [a, b, ..] => {
            let ordering = b
                .score
                .cmp(&a.score)
                .then(b.correct_count.cmp(&a.correct_count))
                .then(a.time_spent_secs.total_cmp(&b.time_spent_secs));
            match ordering {
                std::cmp::Ordering::Less => Some(a),
                std::cmp::Ordering::Greater => Some(b),
                std::cmp::Ordering::Equal => None,
            }
        }
        [only] => Some(only),
        [] => None,
    };

    let winner_user_id = winner.map(|w| w.player_key.clone());
    let winner_name = winner.map(|w| w.display_name.clone());
    FinalResult {
        winner_user_id,
        winner_name,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AnswerLedger, AnswerRecord};
    use chrono::Utc;
    use std::collections::HashMap;

    fn record(player: &str, question: &str, correct: bool, points: u32, time: f64) -> AnswerRecord {
        AnswerRecord {
            id: ulid::Ulid::new().to_string(),
            player_key: player.to_string(),
            question_id: question.to_string(),
            answer_id: format!("{question}-0"),
            is_correct: correct,
            points,
            time_spent_secs: time,
            submitted_at: Utc::now(),
        }
    }

    fn session_room(players: &[(&str, &str)]) -> Room {
        let now = Utc::now();
        let players: HashMap<_, _> = players
            .iter()
            .enumerate()
            .map(|(i, (id, name))| {
                (
                    id.to_string(),
                    SessionPlayer {
                        id: id.to_string(),
                        user_id: None,
                        display_name: name.to_string(),
                        connection_id: format!("conn-{i}"),
                        connected: true,
                        joined_at: now + chrono::Duration::milliseconds(i as i64),
                    },
                )
            })
            .collect();

        Room {
            code: "TEST00".to_string(),
            id: ulid::Ulid::new().to_string(),
            quiz_set_id: "qs1".to_string(),
            questions: Vec::new(),
            current_index: 0,
            ledger: AnswerLedger::new(),
            mode: RoomMode::Session(SessionState {
                status: SessionStatus::InProgress,
                host_user_id: "host".to_string(),
                host_connection_id: None,
                config: GameConfig::default(),
                players,
                deadline: None,
                end_reason: None,
                boss: None,
            }),
            created_at: now,
            last_activity: now,
            completed_at: None,
        }
    }

    fn duel_room() -> Room {
        let now = Utc::now();
        Room {
            code: "TEST00".to_string(),
            id: ulid::Ulid::new().to_string(),
            quiz_set_id: "qs1".to_string(),
            questions: Vec::new(),
            current_index: 0,
            ledger: AnswerLedger::new(),
            mode: RoomMode::Duel(DuelState {
                status: DuelStatus::InProgress,
                creator: DuelPlayer {
                    user_id: "u1".to_string(),
                    display_name: "Alice".to_string(),
                    connection_id: None,
                    joined_at: now,
                    is_ready: true,
                    connected: true,
                },
                challenger: Some(DuelPlayer {
                    user_id: "u2".to_string(),
                    display_name: "Bob".to_string(),
                    connection_id: None,
                    joined_at: now,
                    is_ready: true,
                    connected: true,
                }),
                question_started_at: None,
                current_result: None,
            }),
            created_at: now,
            last_activity: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_orders_by_score_then_time() {
        let mut room = session_room(&[("p1", "Ann"), ("p2", "Ben"), ("p3", "Cat")]);
        room.ledger.record_once(record("p1", "q1", true, 150, 10.0));
        room.ledger.record_once(record("p2", "q1", true, 150, 4.0));
        room.ledger.record_once(record("p3", "q1", true, 180, 2.0));

        let board = compute_leaderboard(&room);
        assert_eq!(board[0].player_key, "p3");
        assert_eq!(board[1].player_key, "p2", "tied score, faster first");
        assert_eq!(board[2].player_key, "p1");
        assert_eq!(
            board.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_full_ties_share_rank() {
        let mut room = session_room(&[("p1", "Ann"), ("p2", "Ben"), ("p3", "Cat")]);
        room.ledger.record_once(record("p1", "q1", true, 150, 5.0));
        room.ledger.record_once(record("p2", "q1", true, 150, 5.0));

        let board = compute_leaderboard(&room);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].rank, 1);
        assert_eq!(board[2].rank, 3, "competition ranking skips");
        // Join order among full ties
        assert_eq!(board[0].player_key, "p1");
    }

    #[test]
    fn test_players_without_answers_rank_last() {
        let mut room = session_room(&[("p1", "Ann"), ("p2", "Ben")]);
        room.ledger.record_once(record("p2", "q1", true, 120, 3.0));

        let board = compute_leaderboard(&room);
        assert_eq!(board[0].player_key, "p2");
        assert_eq!(board[1].score, 0);
        assert_eq!(board[1].correct_count, 0);
    }

    #[test]
    fn test_recompute_is_stable() {
        let mut room = session_room(&[("p1", "Ann"), ("p2", "Ben")]);
        room.ledger.record_once(record("p1", "q1", true, 140, 6.0));
        room.ledger.record_once(record("p2", "q1", false, 0, 2.0));

        assert_eq!(compute_leaderboard(&room), compute_leaderboard(&room));
    }

    #[test]
    fn test_duel_winner_by_score() {
        let mut room = duel_room();
        room.ledger.record_once(record("u1", "q1", true, 150, 5.0));
        room.ledger.record_once(record("u2", "q1", false, 0, 3.0));

        let result = compute_duel_result(&room);
        assert_eq!(result.winner_user_id.as_deref(), Some("u1"));
        assert_eq!(result.winner_name.as_deref(), Some("Alice"));
        assert_eq!(result.entries.len(), 2);
    }

    #[test]
    fn test_duel_dead_tie_has_no_winner() {
        let mut room = duel_room();
        room.ledger.record_once(record("u1", "q1", true, 150, 5.0));
        room.ledger.record_once(record("u2", "q1", true, 150, 5.0));

        let result = compute_duel_result(&room);
        assert!(result.winner_user_id.is_none());
        assert!(result.winner_name.is_none());
    }

    #[test]
    fn test_duel_tie_broken_by_time() {
        let mut room = duel_room();
        room.ledger.record_once(record("u1", "q1", true, 150, 8.0));
        room.ledger.record_once(record("u2", "q1", true, 150, 3.0));

        let result = compute_duel_result(&room);
        assert_eq!(result.winner_user_id.as_deref(), Some("u2"));
    }
}
