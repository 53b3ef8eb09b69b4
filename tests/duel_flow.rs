use std::sync::Arc;

use quizclash::engine::GameEngine;
use quizclash::protocol::{ClientCommand, ServerEvent};
use quizclash::providers::{
    sample_questions, Identity, NoopResultSink, StaticQuestionProvider,
};
use quizclash::store::InMemoryRoomStore;
use quizclash::types::EngineConfig;
use quizclash::ws::handlers::handle_command;

fn engine() -> Arc<GameEngine> {
    Arc::new(GameEngine::new(
        Arc::new(InMemoryRoomStore::new()),
        Arc::new(StaticQuestionProvider::new().with_set("sample", sample_questions())),
        Arc::new(NoopResultSink),
        EngineConfig::default(),
    ))
}

fn identity(user_id: &str, display_name: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
    }
}

/// End-to-end duel: create, connect, join, play all three questions,
/// and read the final result.
#[tokio::test]
async fn test_full_duel_flow() {
    let engine = engine();
    let alice = identity("u1", "Alice");
    let bob = identity("u2", "Bob");

    // 1. Alice creates the room
    let created = handle_command(
        ClientCommand::CreateRoom {
            quiz_set_id: "sample".to_string(),
        },
        &alice,
        "c1",
        &engine,
    )
    .await;

    let code = match created.reply {
        Some(ServerEvent::RoomCreated { code, .. }) => code,
        other => panic!("expected RoomCreated, got {other:?}"),
    };
    assert_eq!(created.join.as_deref(), Some(code.as_str()));

    // 2. Alice binds her connection to the creator slot
    let connected = handle_command(
        ClientCommand::ConnectRoom { code: code.clone() },
        &alice,
        "c1",
        &engine,
    )
    .await;
    assert!(matches!(
        connected.reply,
        Some(ServerEvent::PlayerJoined { .. })
    ));

    // 3. Bob joins as the challenger; the room becomes ready
    let joined = handle_command(
        ClientCommand::JoinRoom {
            code: code.clone(),
            display_name: None,
        },
        &bob,
        "c2",
        &engine,
    )
    .await;
    let ready = joined
        .broadcasts
        .iter()
        .find_map(|(_, e)| match e {
            ServerEvent::RoomReady { players, .. } => Some(players.clone()),
            _ => None,
        })
        .expect("join broadcasts RoomReady");
    assert_eq!(ready.len(), 2);

    // 4. Either participant can start; question 0 is broadcast without
    // the correct-answer flag
    let started = handle_command(
        ClientCommand::StartGame { code: code.clone() },
        &alice,
        "c1",
        &engine,
    )
    .await;
    let question = started
        .broadcasts
        .iter()
        .find_map(|(_, e)| match e {
            ServerEvent::ShowQuestion { question, index, .. } => {
                assert_eq!(*index, 0);
                Some(question.clone())
            }
            _ => None,
        })
        .expect("start broadcasts the first question");
    assert_eq!(question.id, "q1");
    assert_eq!(question.options.len(), 4);

    // 5. Play all three rounds: Alice correct, Bob wrong
    let correct = ["q1-0", "q2-2", "q3-1"];
    let wrong = ["q1-1", "q2-0", "q3-0"];
    for i in 0..3 {
        let qid = format!("q{}", i + 1);

        let first = handle_command(
            ClientCommand::SubmitAnswer {
                code: code.clone(),
                question_id: qid.clone(),
                answer_id: correct[i].to_string(),
            },
            &alice,
            "c1",
            &engine,
        )
        .await;
        assert!(matches!(
            first.reply,
            Some(ServerEvent::AnswerAck { accepted: true, .. })
        ));
        assert!(first.broadcasts.is_empty(), "first answer does not resolve");

        let second = handle_command(
            ClientCommand::SubmitAnswer {
                code: code.clone(),
                question_id: qid.clone(),
                answer_id: wrong[i].to_string(),
            },
            &bob,
            "c2",
            &engine,
        )
        .await;
        let round = second
            .broadcasts
            .iter()
            .find_map(|(_, e)| match e {
                ServerEvent::ShowRoundResult { result } => Some(result.clone()),
                _ => None,
            })
            .expect("second answer resolves the round");
        assert_eq!(round.winner_name.as_deref(), Some("Alice"));

        let advanced = handle_command(
            ClientCommand::NextQuestion { code: code.clone() },
            &alice,
            "c1",
            &engine,
        )
        .await;
        if i < 2 {
            assert!(advanced.broadcasts.iter().any(|(_, e)| matches!(
                e,
                ServerEvent::ShowQuestion { index, .. } if *index == i + 1
            )));
        } else {
            let ended = advanced
                .broadcasts
                .iter()
                .find_map(|(_, e)| match e {
                    ServerEvent::GameEnded {
                        winner_name,
                        entries,
                        ..
                    } => Some((winner_name.clone(), entries.clone())),
                    _ => None,
                })
                .expect("last advance ends the game");
            assert_eq!(ended.0.as_deref(), Some("Alice"));
            assert_eq!(ended.1[0].correct_count, 3);
        }
    }

    // 6. The final result stays readable after completion
    let final_result = handle_command(
        ClientCommand::GetFinalResult { code: code.clone() },
        &bob,
        "c2",
        &engine,
    )
    .await;
    match final_result.reply {
        Some(ServerEvent::GameEnded { winner_user_id, .. }) => {
            assert_eq!(winner_user_id.as_deref(), Some("u1"));
        }
        other => panic!("expected GameEnded, got {other:?}"),
    }
}

/// A dropped challenger reconnects mid-game and recovers their state.
#[tokio::test]
async fn test_duel_reconnect_flow() {
    let engine = engine();
    let alice = identity("u1", "Alice");
    let bob = identity("u2", "Bob");

    let created = handle_command(
        ClientCommand::CreateRoom {
            quiz_set_id: "sample".to_string(),
        },
        &alice,
        "c1",
        &engine,
    )
    .await;
    let code = match created.reply {
        Some(ServerEvent::RoomCreated { code, .. }) => code,
        other => panic!("expected RoomCreated, got {other:?}"),
    };

    handle_command(ClientCommand::ConnectRoom { code: code.clone() }, &alice, "c1", &engine).await;
    handle_command(
        ClientCommand::JoinRoom {
            code: code.clone(),
            display_name: None,
        },
        &bob,
        "c2",
        &engine,
    )
    .await;
    handle_command(ClientCommand::StartGame { code: code.clone() }, &bob, "c2", &engine).await;

    // Bob answers q1 correctly, then his connection dies
    handle_command(
        ClientCommand::SubmitAnswer {
            code: code.clone(),
            question_id: "q1".to_string(),
            answer_id: "q1-0".to_string(),
        },
        &bob,
        "c2",
        &engine,
    )
    .await;

    let notice = engine.handle_disconnect("c2").await.expect("known connection");
    assert_eq!(notice.player_key, "u2");

    // Reconnect on a fresh connection recovers the answer history
    let reconnected = handle_command(
        ClientCommand::ReconnectRoom { code: code.clone() },
        &bob,
        "c2b",
        &engine,
    )
    .await;
    match reconnected.reply {
        Some(ServerEvent::PlayerState {
            player_key,
            answered,
            score,
            ..
        }) => {
            assert_eq!(player_key, "u2");
            assert_eq!(answered, vec!["q1".to_string()]);
            assert!(score > 0);
        }
        other => panic!("expected PlayerState, got {other:?}"),
    }
    assert_eq!(reconnected.join.as_deref(), Some(code.as_str()));

    // The rebound connection keeps playing
    let replay = handle_command(
        ClientCommand::SubmitAnswer {
            code: code.clone(),
            question_id: "q1".to_string(),
            answer_id: "q1-3".to_string(),
        },
        &bob,
        "c2b",
        &engine,
    )
    .await;
    assert!(matches!(
        replay.reply,
        Some(ServerEvent::AnswerAck {
            accepted: false,
            duplicate: Some(true),
            ..
        })
    ));
}

/// Cancelling mid-game broadcasts RoomCancelled; unknown rooms error.
#[tokio::test]
async fn test_duel_cancel_and_unknown_room() {
    let engine = engine();
    let alice = identity("u1", "Alice");

    let created = handle_command(
        ClientCommand::CreateRoom {
            quiz_set_id: "sample".to_string(),
        },
        &alice,
        "c1",
        &engine,
    )
    .await;
    let code = match created.reply {
        Some(ServerEvent::RoomCreated { code, .. }) => code,
        other => panic!("expected RoomCreated, got {other:?}"),
    };
    handle_command(ClientCommand::ConnectRoom { code: code.clone() }, &alice, "c1", &engine).await;

    let cancelled = handle_command(
        ClientCommand::CancelRoom {
            code: code.clone(),
            reason: Some("changed my mind".to_string()),
        },
        &alice,
        "c1",
        &engine,
    )
    .await;
    assert!(cancelled
        .broadcasts
        .iter()
        .any(|(_, e)| matches!(e, ServerEvent::RoomCancelled { .. })));

    let missing = handle_command(
        ClientCommand::StartGame {
            code: "NOSUCH".to_string(),
        },
        &alice,
        "c1",
        &engine,
    )
    .await;
    match missing.reply {
        Some(ServerEvent::Error { code, .. }) => assert_eq!(code, "NOT_FOUND"),
        other => panic!("expected Error, got {other:?}"),
    }
}
