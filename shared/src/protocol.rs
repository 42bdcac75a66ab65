//! Wire taxonomy between clients, the game engine and the orchestration server.
//!
//! Every datagram carries exactly one bincode-encoded message. Server events
//! are a closed enum so every consumer matches them exhaustively.

use crate::bracket::{Bracket, Slot};
use crate::model::{
    ClientId, Countdown, Match, MatchId, MatchState, Participant, PlayerSlot, RoomConfig,
    RoomSnapshot, RoomSummary, SessionId, TournamentId, TournamentSnapshot, UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
/// Large enough for a resync of a full 32-player bracket.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Publish/subscribe channel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    Room(String),
    Tournament(TournamentId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Room(code) => write!(f, "room:{}", code),
            Topic::Tournament(id) => write!(f, "tournament:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    // Connection management
    Connect { client_version: u32, token: String },
    Heartbeat { timestamp: u64 },
    Disconnect,

    // Room protocol
    CreateRoom { max_players: u32, config: RoomConfig },
    JoinRoom { code: String },
    LeaveRoom { code: String },
    SetConfig { code: String, config: RoomConfig },

    // Tournament protocol
    CreateTournament { name: String, capacity: u32 },
    JoinTournament { tournament_id: TournamentId },
    LeaveTournament { tournament_id: TournamentId },
    InviteBot { tournament_id: TournamentId },

    // Shared by rooms and tournaments
    ToggleReady { topic: Topic },
    Resync { topic: Topic },

    // Read endpoints
    ListRooms,
    GetTournament { tournament_id: TournamentId },

    // Game engine reports
    SessionStatus {
        session_id: SessionId,
        state: MatchState,
        scores: [u32; 2],
    },
    SessionFinished {
        session_id: SessionId,
        scores: [u32; 2],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    Conflict,
    NotFound,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// What the engine needs to host a session: its id and both sides in slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: SessionId,
    pub topic: Topic,
    pub match_id: MatchId,
    pub participants: [Participant; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Connected {
        client_id: ClientId,
        user_id: UserId,
        display_name: String,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    Disconnected {
        reason: String,
    },
    /// One live event on a subscribed topic.
    Event {
        topic: Topic,
        envelope: Envelope,
    },
    /// Ordered events that rebuild a topic's current state from scratch.
    Resync {
        topic: Topic,
        events: Vec<Envelope>,
    },
    Error(ErrorPayload),
    RoomList(Vec<RoomSummary>),
    TournamentInfo(Option<TournamentSnapshot>),
    /// Sent to engine connections only.
    SessionAssigned(SessionStart),
    /// The session's match was settled without it; the engine should stop it.
    SessionAbandoned {
        session_id: SessionId,
    },
}

/// A published event stamped with its per-topic sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub event: ServerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    RoomState(RoomSnapshot),
    TournamentState(TournamentSnapshot),

    PlayerJoined {
        slot: PlayerSlot,
    },
    PlayerLeft {
        user_id: UserId,
    },
    ReadyChanged {
        user_id: UserId,
        ready: bool,
    },
    HostChanged {
        user_id: UserId,
    },
    ConfigChanged {
        config: RoomConfig,
    },
    AllReady,

    CountdownStarted {
        countdown: Countdown,
    },
    CountdownCancelled {
        key: String,
    },

    SessionStarted {
        match_id: MatchId,
        session_id: SessionId,
        participants: [Participant; 2],
    },
    SessionProgress {
        match_id: MatchId,
        state: MatchState,
        scores: [u32; 2],
    },
    SessionFinished {
        match_id: MatchId,
        scores: [u32; 2],
        winner: Slot,
    },

    BracketGenerated {
        bracket: Bracket,
        matches: Vec<Match>,
    },
    BracketMatchCompleted {
        match_id: MatchId,
        scores: [u32; 2],
        winner: Slot,
    },
    BracketRoundAdvanced {
        round: u32,
        slots: Vec<Slot>,
        matches: Vec<Match>,
    },
    BracketTournamentFinished {
        winner: UserId,
    },
    ForfeitWin {
        match_id: MatchId,
        winner: Slot,
        forfeiter: UserId,
    },
}

impl ServerEvent {
    /// Full-state events; they supersede everything published before them.
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            ServerEvent::RoomState(_) | ServerEvent::TournamentState(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomState(_) => "RoomState",
            ServerEvent::TournamentState(_) => "TournamentState",
            ServerEvent::PlayerJoined { .. } => "PlayerJoined",
            ServerEvent::PlayerLeft { .. } => "PlayerLeft",
            ServerEvent::ReadyChanged { .. } => "ReadyChanged",
            ServerEvent::HostChanged { .. } => "HostChanged",
            ServerEvent::ConfigChanged { .. } => "ConfigChanged",
            ServerEvent::AllReady => "AllReady",
            ServerEvent::CountdownStarted { .. } => "CountdownStarted",
            ServerEvent::CountdownCancelled { .. } => "CountdownCancelled",
            ServerEvent::SessionStarted { .. } => "SessionStarted",
            ServerEvent::SessionProgress { .. } => "SessionProgress",
            ServerEvent::SessionFinished { .. } => "SessionFinished",
            ServerEvent::BracketGenerated { .. } => "BracketGenerated",
            ServerEvent::BracketMatchCompleted { .. } => "BracketMatchCompleted",
            ServerEvent::BracketRoundAdvanced { .. } => "BracketRoundAdvanced",
            ServerEvent::BracketTournamentFinished { .. } => "BracketTournamentFinished",
            ServerEvent::ForfeitWin { .. } => "ForfeitWin",
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlayerSlot, RoomStatus};

    #[test]
    fn test_client_message_round_trip() {
        let messages = vec![
            ClientMessage::Connect {
                client_version: PROTOCOL_VERSION,
                token: "alice".to_string(),
            },
            ClientMessage::ToggleReady {
                topic: Topic::Tournament(9),
            },
            ClientMessage::SessionFinished {
                session_id: 42,
                scores: [5, 3],
            },
        ];

        for message in messages {
            let bytes = encode(&message).unwrap();
            let decoded: ClientMessage = decode(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_resync_envelope_keeps_order() {
        let room = RoomSnapshot::new(
            "QWERTY".to_string(),
            PlayerSlot::new(1, "host"),
            2,
            RoomConfig::default(),
        );
        let message = ServerMessage::Resync {
            topic: Topic::Room("QWERTY".to_string()),
            events: vec![
                Envelope {
                    seq: 4,
                    event: ServerEvent::RoomState(room),
                },
                Envelope {
                    seq: 5,
                    event: ServerEvent::ReadyChanged {
                        user_id: 1,
                        ready: true,
                    },
                },
            ],
        };

        let decoded: ServerMessage = decode(&encode(&message).unwrap()).unwrap();
        match decoded {
            ServerMessage::Resync { events, .. } => {
                let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
                assert_eq!(seqs, vec![4, 5]);
                match &events[0].event {
                    ServerEvent::RoomState(room) => assert_eq!(room.status, RoomStatus::Open),
                    other => panic!("Unexpected event {}", other.name()),
                }
            }
            _ => panic!("Wrong message type after decoding"),
        }
    }

    #[test]
    fn test_malformed_bytes_fail_to_decode() {
        let result: Result<ClientMessage, _> = decode(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(result.is_err());
    }

    #[test]
    fn test_topic_display() {
        assert_eq!(Topic::Room("ABC".to_string()).to_string(), "room:ABC");
        assert_eq!(Topic::Tournament(3).to_string(), "tournament:3");
        assert!(ServerEvent::RoomState(RoomSnapshot::new(
            "A".to_string(),
            PlayerSlot::new(1, "h"),
            2,
            RoomConfig::default()
        ))
        .is_snapshot());
        assert!(!ServerEvent::AllReady.is_snapshot());
    }
}
