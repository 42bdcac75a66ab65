//! Connection and view state of the command-line client
//!
//! Everything here is synchronous. The network loop feeds it server messages
//! and parsed commands, and sends whatever client messages it hands back.

use crate::commands::Command;
use log::{debug, info, warn};
use shared::view::{Applied, TopicState};
use shared::{
    ClientId, ClientMessage, ClientView, RoomConfig, ServerMessage, Topic, TournamentId, UserId,
    PROTOCOL_VERSION,
};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("not in a room")]
    NoRoom,
    #[error("not in a tournament")]
    NoTournament,
    #[error("not in a room or tournament")]
    NothingToReady,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub struct ClientState {
    name: String,
    client_id: Option<ClientId>,
    user_id: Option<UserId>,
    /// Set after the first Connected; a later Connected is a reconnect.
    had_session: bool,
    ping_ms: u64,

    view: ClientView,
    followed: BTreeSet<Topic>,
    /// Topics with a Resync requested after a sequence gap.
    resyncing: BTreeSet<Topic>,
    room: Option<String>,
    tournament: Option<TournamentId>,
}

impl ClientState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: None,
            user_id: None,
            had_session: false,
            ping_ms: 0,
            view: ClientView::new(),
            followed: BTreeSet::new(),
            resyncing: BTreeSet::new(),
            room: None,
            tournament: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client_id.is_some()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn view(&self) -> &ClientView {
        &self.view
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn tournament(&self) -> Option<TournamentId> {
        self.tournament
    }

    pub fn followed(&self) -> impl Iterator<Item = &Topic> {
        self.followed.iter()
    }

    pub fn connect_message(&self) -> ClientMessage {
        ClientMessage::Connect {
            client_version: PROTOCOL_VERSION,
            token: self.name.clone(),
        }
    }

    /// Treats the connection as gone without a Disconnected from the server.
    pub fn connection_lost(&mut self) {
        if self.client_id.take().is_some() {
            warn!("Lost connection to server");
        }
    }

    fn resync_all(&self) -> Vec<ClientMessage> {
        self.followed
            .iter()
            .map(|topic| ClientMessage::Resync {
                topic: topic.clone(),
            })
            .collect()
    }

    fn follow(&mut self, topic: &Topic) {
        if self.followed.insert(topic.clone()) {
            match topic {
                Topic::Room(code) => self.room = Some(code.clone()),
                Topic::Tournament(id) => self.tournament = Some(*id),
            }
        }
    }

    fn unfollow(&mut self, topic: &Topic) {
        self.followed.remove(topic);
        self.view.forget(topic);
    }

    /// Applies one server message. Returns the messages to send in response.
    pub fn handle_message(&mut self, message: ServerMessage) -> Vec<ClientMessage> {
        match message {
            ServerMessage::Connected {
                client_id,
                user_id,
                display_name,
            } => {
                info!(
                    "Connected as {} (user {}, client {})",
                    display_name, user_id, client_id
                );
                self.client_id = Some(client_id);
                self.user_id = Some(user_id);
                let reconnect = self.had_session;
                self.had_session = true;
                self.resyncing.clear();
                if reconnect {
                    info!("Resyncing {} topic(s)", self.followed.len());
                    return self.resync_all();
                }
            }

            ServerMessage::HeartbeatAck { timestamp } => {
                self.ping_ms = now_ms().saturating_sub(timestamp);
                debug!("Ping {}ms", self.ping_ms);
            }

            ServerMessage::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.client_id = None;
            }

            ServerMessage::Event { topic, envelope } => {
                if !self.followed.contains(&topic) {
                    if !envelope.event.is_snapshot() {
                        debug!("[{}] ignoring #{} on an unfollowed topic", topic, envelope.seq);
                        return Vec::new();
                    }
                    self.follow(&topic);
                }
                match self.view.apply_envelope(&topic, &envelope) {
                    Applied::Changed => {
                        info!("[{}] #{} {}", topic, envelope.seq, envelope.event.name())
                    }
                    Applied::Gap => {
                        if self.resyncing.insert(topic.clone()) {
                            warn!("[{}] missed events before #{}, resyncing", topic, envelope.seq);
                            return vec![ClientMessage::Resync { topic }];
                        }
                    }
                    Applied::Unchanged | Applied::Stale => {
                        debug!("[{}] skipped #{}", topic, envelope.seq)
                    }
                }
            }

            ServerMessage::Resync { topic, events } => {
                self.follow(&topic);
                self.resyncing.remove(&topic);
                let applied = self.view.apply_resync(&topic, &events);
                info!(
                    "[{}] resync: {} of {} event(s) applied",
                    topic,
                    applied,
                    events.len()
                );
            }

            ServerMessage::Error(payload) => {
                warn!("Server error ({:?}): {}", payload.code, payload.message);
            }

            ServerMessage::RoomList(rooms) => {
                if rooms.is_empty() {
                    info!("No open rooms");
                }
                for room in rooms {
                    info!(
                        "Room {} hosted by {}: {}/{} ({:?})",
                        room.code, room.host_name, room.players, room.max_players, room.status
                    );
                }
            }

            ServerMessage::TournamentInfo(Some(t)) => {
                info!(
                    "Tournament {} '{}': {}/{} players, round {}, {:?}",
                    t.id,
                    t.name,
                    t.players.len(),
                    t.capacity,
                    t.current_round,
                    t.status
                );
            }

            ServerMessage::TournamentInfo(None) => info!("No such tournament"),

            ServerMessage::SessionAssigned(start) => {
                debug!("Ignoring session assignment {}", start.session_id);
            }

            ServerMessage::SessionAbandoned { session_id } => {
                debug!("Ignoring abandoned session {}", session_id);
            }
        }

        Vec::new()
    }

    /// Turns a parsed command into the messages it sends.
    /// `State` and `Quit` send nothing here; the caller handles them.
    pub fn handle_command(&mut self, command: Command) -> Result<Vec<ClientMessage>, ClientError> {
        if !self.is_connected() && !matches!(command, Command::State | Command::Quit) {
            return Err(ClientError::NotConnected);
        }

        let message = match command {
            Command::CreateRoom {
                max_players,
                score_limit,
            } => {
                let mut config = RoomConfig::default();
                if let Some(score_limit) = score_limit {
                    config.score_limit = score_limit;
                }
                ClientMessage::CreateRoom {
                    max_players,
                    config,
                }
            }
            Command::JoinRoom { code } => ClientMessage::JoinRoom { code },
            Command::LeaveRoom => {
                let code = self.room.take().ok_or(ClientError::NoRoom)?;
                self.unfollow(&Topic::Room(code.clone()));
                ClientMessage::LeaveRoom { code }
            }
            Command::Ready => {
                let topic = match (&self.room, self.tournament) {
                    (Some(code), _) => Topic::Room(code.clone()),
                    (None, Some(id)) => Topic::Tournament(id),
                    (None, None) => return Err(ClientError::NothingToReady),
                };
                ClientMessage::ToggleReady { topic }
            }
            Command::Config { score_limit } => {
                let code = self.room.clone().ok_or(ClientError::NoRoom)?;
                let mut config = self
                    .view
                    .room(&code)
                    .map(|room| room.config.clone())
                    .unwrap_or_default();
                config.score_limit = score_limit;
                ClientMessage::SetConfig { code, config }
            }
            Command::CreateTournament { name, capacity } => {
                ClientMessage::CreateTournament { name, capacity }
            }
            Command::JoinTournament { tournament_id } => {
                ClientMessage::JoinTournament { tournament_id }
            }
            Command::LeaveTournament => {
                let tournament_id = self.tournament.take().ok_or(ClientError::NoTournament)?;
                self.unfollow(&Topic::Tournament(tournament_id));
                ClientMessage::LeaveTournament { tournament_id }
            }
            Command::InviteBot => ClientMessage::InviteBot {
                tournament_id: self.tournament.ok_or(ClientError::NoTournament)?,
            },
            Command::ListRooms => ClientMessage::ListRooms,
            Command::TournamentInfo { tournament_id } => {
                ClientMessage::GetTournament { tournament_id }
            }
            Command::Resync => return Ok(self.resync_all()),
            Command::State => return Ok(Vec::new()),
            Command::Quit => {
                return Ok(if self.is_connected() {
                    vec![ClientMessage::Disconnect]
                } else {
                    Vec::new()
                })
            }
        };

        Ok(vec![message])
    }

    /// Human-readable dump of every followed topic.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} ({}), ping {}ms",
            self.name,
            if self.is_connected() {
                "connected"
            } else {
                "offline"
            },
            self.ping_ms
        )];

        for topic in self.view.topics() {
            let Some(view) = self.view.topic(topic) else {
                continue;
            };
            match &view.state {
                TopicState::Empty => lines.push(format!("{} (seq {}): no state", topic, view.last_seq)),
                TopicState::Room(room) => {
                    lines.push(format!(
                        "{} (seq {}): {:?}, {}/{} players, first to {}",
                        topic,
                        view.last_seq,
                        room.status,
                        room.players.len(),
                        room.max_players,
                        room.config.score_limit
                    ));
                    for p in &room.players {
                        lines.push(format!(
                            "  {}{}{}",
                            p.display_name,
                            if p.is_host { " [host]" } else { "" },
                            if p.ready { " ready" } else { "" }
                        ));
                    }
                    for m in &room.matches {
                        lines.push(format!(
                            "  match {}: {:?} {}-{} {:?}",
                            m.match_id, m.state, m.scores[0], m.scores[1], m.winner
                        ));
                    }
                }
                TopicState::Tournament(t) => {
                    lines.push(format!(
                        "{} (seq {}): '{}' {:?}, {}/{} players, round {}",
                        topic,
                        view.last_seq,
                        t.name,
                        t.status,
                        t.players.len(),
                        t.capacity,
                        t.current_round
                    ));
                    for m in &t.matches {
                        lines.push(format!(
                            "  match {}: {:?} vs {:?} {:?} winner {:?}",
                            m.match_id, m.player1, m.player2, m.state, m.winner
                        ));
                    }
                    if let Some(winner) = t.winner {
                        lines.push(format!("  champion: user {}", winner));
                    }
                }
            }
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Envelope, PlayerSlot, RoomSnapshot, ServerEvent};

    fn connected(state: &mut ClientState) -> Vec<ClientMessage> {
        state.handle_message(ServerMessage::Connected {
            client_id: 1,
            user_id: 7,
            display_name: "alice".to_string(),
        })
    }

    fn room_event(code: &str, seq: u64, event: ServerEvent) -> ServerMessage {
        ServerMessage::Event {
            topic: Topic::Room(code.to_string()),
            envelope: Envelope { seq, event },
        }
    }

    fn room_state(code: &str) -> ServerEvent {
        ServerEvent::RoomState(RoomSnapshot::new(
            code.to_string(),
            PlayerSlot::new(7, "alice"),
            2,
            RoomConfig::default(),
        ))
    }

    #[test]
    fn test_commands_require_connection() {
        let mut state = ClientState::new("alice");
        assert_eq!(
            state.handle_command(Command::ListRooms),
            Err(ClientError::NotConnected)
        );
        assert_eq!(state.handle_command(Command::Quit), Ok(Vec::new()));

        assert!(connected(&mut state).is_empty());
        assert_eq!(
            state.handle_command(Command::ListRooms),
            Ok(vec![ClientMessage::ListRooms])
        );
    }

    #[test]
    fn test_snapshot_event_follows_room() {
        let mut state = ClientState::new("alice");
        connected(&mut state);

        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));
        assert_eq!(state.room(), Some("ABC234"));
        assert!(state.view().room("ABC234").is_some());

        assert_eq!(
            state.handle_command(Command::Ready),
            Ok(vec![ClientMessage::ToggleReady {
                topic: Topic::Room("ABC234".to_string())
            }])
        );
    }

    #[test]
    fn test_stale_envelopes_are_skipped() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));
        state.handle_message(room_event(
            "ABC234",
            2,
            ServerEvent::ReadyChanged {
                user_id: 7,
                ready: true,
            },
        ));
        let before = state.view().clone();

        state.handle_message(room_event(
            "ABC234",
            2,
            ServerEvent::ReadyChanged {
                user_id: 7,
                ready: false,
            },
        ));
        assert_eq!(state.view(), &before);
    }

    #[test]
    fn test_gap_requests_one_resync() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        let topic = Topic::Room("ABC234".to_string());
        let ready = |user_id, ready| ServerEvent::ReadyChanged { user_id, ready };
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));

        // #2 is lost.
        assert_eq!(
            state.handle_message(room_event("ABC234", 3, ready(7, false))),
            vec![ClientMessage::Resync {
                topic: topic.clone()
            }]
        );
        assert!(state
            .handle_message(room_event("ABC234", 4, ready(7, true)))
            .is_empty());

        let replay = vec![
            Envelope {
                seq: 1,
                event: room_state("ABC234"),
            },
            Envelope {
                seq: 2,
                event: ready(7, true),
            },
            Envelope {
                seq: 3,
                event: ready(7, false),
            },
            Envelope {
                seq: 4,
                event: ready(7, true),
            },
        ];
        state.handle_message(ServerMessage::Resync {
            topic: topic.clone(),
            events: replay,
        });
        assert_eq!(state.view().topic(&topic).map(|t| t.last_seq), Some(4));
        assert!(state.view().room("ABC234").unwrap().players[0].ready);

        assert_eq!(
            state.handle_message(room_event("ABC234", 6, ready(7, false))),
            vec![ClientMessage::Resync { topic }]
        );
    }

    #[test]
    fn test_reconnect_resyncs_followed_topics() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));
        state.handle_message(ServerMessage::Resync {
            topic: Topic::Tournament(3),
            events: Vec::new(),
        });

        state.connection_lost();
        assert!(!state.is_connected());

        let resyncs = connected(&mut state);
        assert_eq!(
            resyncs,
            vec![
                ClientMessage::Resync {
                    topic: Topic::Room("ABC234".to_string())
                },
                ClientMessage::Resync {
                    topic: Topic::Tournament(3)
                },
            ]
        );
    }

    #[test]
    fn test_leave_forgets_room() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));

        assert_eq!(
            state.handle_command(Command::LeaveRoom),
            Ok(vec![ClientMessage::LeaveRoom {
                code: "ABC234".to_string()
            }])
        );
        assert_eq!(state.room(), None);
        assert!(state.view().room("ABC234").is_none());
        assert_eq!(
            state.handle_command(Command::LeaveRoom),
            Err(ClientError::NoRoom)
        );
        assert_eq!(
            state.handle_command(Command::Ready),
            Err(ClientError::NothingToReady)
        );
    }

    #[test]
    fn test_late_event_after_leave_is_ignored() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));
        state.handle_command(Command::LeaveRoom).unwrap();

        let late = room_event("ABC234", 5, ServerEvent::PlayerLeft { user_id: 7 });
        assert!(state.handle_message(late).is_empty());
        assert!(state.view().topic(&Topic::Room("ABC234".to_string())).is_none());
    }

    #[test]
    fn test_config_keeps_other_settings() {
        let mut state = ClientState::new("alice");
        connected(&mut state);
        state.handle_message(room_event("ABC234", 1, room_state("ABC234")));

        let sent = state.handle_command(Command::Config { score_limit: 9 });
        assert_eq!(
            sent,
            Ok(vec![ClientMessage::SetConfig {
                code: "ABC234".to_string(),
                config: RoomConfig {
                    score_limit: 9,
                    ..RoomConfig::default()
                }
            }])
        );
    }
}
