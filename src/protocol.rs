use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Create a 1v1 duel room.
    CreateRoom {
        quiz_set_id: QuizSetId,
    },
    /// Create a host-led multiplayer game.
    CreateGame {
        quiz_set_id: QuizSetId,
        #[serde(default)]
        config: Option<GameConfig>,
    },
    /// Creator binds this connection to their duel room.
    ConnectRoom {
        code: RoomCode,
    },
    /// Join a duel room as the challenger, or a multiplayer lobby as a
    /// player (display_name required for the latter).
    JoinRoom {
        code: RoomCode,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Rebind an existing player slot after a dropped connection.
    ReconnectRoom {
        code: RoomCode,
    },
    StartGame {
        code: RoomCode,
    },
    SubmitAnswer {
        code: RoomCode,
        question_id: QuestionId,
        answer_id: AnswerId,
    },
    NextQuestion {
        code: RoomCode,
    },
    /// Duel: poll the current round. Resolves it when its window expired.
    GetRoundResult {
        code: RoomCode,
    },
    GetQuestionResult {
        code: RoomCode,
    },
    // Host-only messages
    ShowQuestionResult {
        code: RoomCode,
    },
    ShowLeaderboard {
        code: RoomCode,
    },
    GetLeaderboard {
        code: RoomCode,
    },
    GetFinalResult {
        code: RoomCode,
    },
    EnableBossFightMode {
        code: RoomCode,
        boss_hp: u32,
        #[serde(default)]
        overall_limit_secs: Option<u32>,
        #[serde(default = "default_boss_question_secs")]
        per_question_secs: u32,
        #[serde(default = "default_true")]
        auto_advance: bool,
    },
    GetNextBossQuestion {
        code: RoomCode,
    },
    AdvanceBossPlayer {
        code: RoomCode,
    },
    ForceEndGame {
        code: RoomCode,
        #[serde(default)]
        reason: Option<String>,
    },
    CancelRoom {
        code: RoomCode,
        #[serde(default)]
        reason: Option<String>,
    },
}

fn default_boss_question_secs() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomCreated {
        code: RoomCode,
        room_id: RoomId,
    },
    PlayerJoined {
        code: RoomCode,
        player_key: String,
        display_name: String,
    },
    /// Duel only: both participants present, the game can start.
    RoomReady {
        code: RoomCode,
        players: Vec<ParticipantInfo>,
    },
    GameStarted {
        code: RoomCode,
    },
    ShowQuestion {
        index: usize,
        total: usize,
        question: QuestionInfo,
        server_now: String,
        deadline: Option<String>,
    },
    /// Confirms the sender's own submission (soft outcomes included).
    AnswerAck {
        question_id: QuestionId,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duplicate: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        late: Option<bool>,
    },
    /// Duel: the resolved round, broadcast exactly once per question.
    ShowRoundResult {
        result: RoundResult,
    },
    /// Multiplayer: aggregate answer stats for the current question.
    ShowQuestionResult {
        result: QuestionResult,
    },
    ShowLeaderboard {
        entries: Vec<LeaderboardEntry>,
    },
    BossFightEnabled {
        hp: u32,
        max_hp: u32,
    },
    BossDamaged {
        damage: u32,
        hp: u32,
        max_hp: u32,
        by: String,
    },
    /// Broadcast exactly once, by the commit that brought HP to zero.
    BossDefeated {
        entries: Vec<LeaderboardEntry>,
    },
    BossFightExpired {
        entries: Vec<LeaderboardEntry>,
    },
    /// The requesting player has answered every question of the fight.
    BossQuestionsExhausted,
    GameEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        winner_user_id: Option<UserId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        winner_name: Option<String>,
        entries: Vec<LeaderboardEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RoomCancelled {
        code: RoomCode,
        reason: String,
    },
    PlayerDisconnected {
        player_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// Sent to a player on reconnect with their recovered state.
    PlayerState {
        code: RoomCode,
        player_key: String,
        answered: Vec<QuestionId>,
        score: u32,
    },
    Error {
        code: String,
        msg: String,
    },
}

/// Public option info (no is_correct to prevent spoilers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionInfo {
    pub id: AnswerId,
    pub text: String,
}

/// Public question info sent to clients while the question is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionInfo {
    pub id: QuestionId,
    pub text: String,
    pub options: Vec<OptionInfo>,
    pub time_limit_secs: u32,
}

impl From<&Question> for QuestionInfo {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id.clone(),
            text: q.text.clone(),
            options: q
                .options
                .iter()
                .map(|o| OptionInfo {
                    id: o.id.clone(),
                    text: o.text.clone(),
                })
                .collect(),
            time_limit_secs: q.time_limit_secs,
        }
    }
}

/// One participant as shown to the rest of the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub player_key: String,
    pub display_name: String,
    pub connected: bool,
}

impl From<&DuelPlayer> for ParticipantInfo {
    fn from(p: &DuelPlayer) -> Self {
        Self {
            player_key: p.user_id.clone(),
            display_name: p.display_name.clone(),
            connected: p.connected,
        }
    }
}

impl From<&SessionPlayer> for ParticipantInfo {
    fn from(p: &SessionPlayer) -> Self {
        Self {
            player_key: p.id.clone(),
            display_name: p.display_name.clone(),
            connected: p.connected,
        }
    }
}

/// Room participants in a stable order for client display.
pub fn participant_infos(room: &Room) -> Vec<ParticipantInfo> {
    match &room.mode {
        RoomMode::Duel(duel) => [Some(&duel.creator), duel.challenger.as_ref()]
            .into_iter()
            .flatten()
            .map(ParticipantInfo::from)
            .collect(),
        RoomMode::Session(session) => {
            let mut players: Vec<_> = session.players.values().collect();
            players.sort_by_key(|p| (p.joined_at, p.id.clone()));
            players.into_iter().map(ParticipantInfo::from).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_info_strips_correct_flag() {
        let question = crate::providers::sample_questions().remove(0);
        let info = QuestionInfo::from(&question);

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("is_correct"));
        assert_eq!(info.options.len(), question.options.len());
    }

    #[test]
    fn test_command_wire_format() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"t":"submit_answer","code":"AB12CD","question_id":"q1","answer_id":"q1-0"}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::SubmitAnswer { ref code, .. } if code == "AB12CD"
        ));

        // Optional fields default
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"t":"enable_boss_fight_mode","code":"AB12CD","boss_hp":1000}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::EnableBossFightMode {
                per_question_secs,
                auto_advance,
                overall_limit_secs,
                ..
            } => {
                assert_eq!(per_question_secs, 30);
                assert!(auto_advance);
                assert!(overall_limit_secs.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_event_tag_is_snake_case() {
        let event = ServerEvent::RoomCreated {
            code: "AB12CD".to_string(),
            room_id: "r1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""t":"room_created""#));
    }
}
