//! Entry point for decoded client messages.
//!
//! Creation requests build a new partition and spawn it; everything else is
//! routed into the mailbox of the room or tournament it names. Engine reports
//! are routed by session lease, so a report for a session that has already
//! been finished or abandoned is absorbed here.

use crate::config::ServerConfig;
use crate::engine::GameEngine;
use crate::error::{OrchestratorError, Result};
use crate::partition::{spawn_partition, Caller, PartitionMessage, Request, Services};
use crate::registry::PartitionHandle;
use crate::room::Room;
use crate::store::Store;
use crate::tournament::Tournament;
use crate::utils::generate_room_code;
use dashmap::mapref::entry::Entry;
use log::{debug, error, info, warn};
use shared::{
    ClientId, ClientMessage, MatchId, Role, RoomConfig, ServerMessage, SessionId, Topic,
    TournamentId, UserId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Orchestrator {
    services: Arc<Services>,
    next_tournament_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: ServerConfig, engine: Arc<dyn GameEngine>, store: Arc<dyn Store>) -> Self {
        Self {
            services: Arc::new(Services::new(config, engine, store)),
            next_tournament_id: AtomicU64::new(1),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Handles `message` and answers the caller with an error payload if it is rejected.
    pub fn dispatch(&self, caller: &Caller, message: ClientMessage) {
        if let Err(e) = self.handle(caller, message) {
            match e.payload() {
                Some(payload) => {
                    warn!("Rejected request from client {}: {}", caller.client_id, e);
                    caller.reply(ServerMessage::Error(payload));
                }
                None => debug!("Absorbed message from client {}: {}", caller.client_id, e),
            }
        }
    }

    pub fn handle(&self, caller: &Caller, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Connect { .. }
            | ClientMessage::Heartbeat { .. }
            | ClientMessage::Disconnect => Err(OrchestratorError::Validation(
                "connection messages are not orchestration requests".to_string(),
            )),

            ClientMessage::CreateRoom {
                max_players,
                config,
            } => self.create_room(caller, max_players, config).map(|_| ()),
            ClientMessage::JoinRoom { code } => self.route(&room_topic(&code), caller, Request::Join),
            ClientMessage::LeaveRoom { code } => {
                self.route(&room_topic(&code), caller, Request::Leave)
            }
            ClientMessage::SetConfig { code, config } => {
                self.route(&room_topic(&code), caller, Request::SetConfig(config))
            }

            ClientMessage::CreateTournament { name, capacity } => {
                self.create_tournament(caller, &name, capacity).map(|_| ())
            }
            ClientMessage::JoinTournament { tournament_id } => {
                self.route(&Topic::Tournament(tournament_id), caller, Request::Join)
            }
            ClientMessage::LeaveTournament { tournament_id } => {
                self.route(&Topic::Tournament(tournament_id), caller, Request::Leave)
            }
            ClientMessage::InviteBot { tournament_id } => {
                self.route(&Topic::Tournament(tournament_id), caller, Request::InviteBot)
            }

            ClientMessage::ToggleReady { topic } => self.route(&topic, caller, Request::ToggleReady),
            ClientMessage::Resync { topic } => self.route(&topic, caller, Request::Resync),

            ClientMessage::ListRooms => {
                let rooms = self.services.store.open_rooms().unwrap_or_else(|e| {
                    error!("Failed to list open rooms: {}", e);
                    Vec::new()
                });
                caller.reply(ServerMessage::RoomList(rooms));
                Ok(())
            }
            ClientMessage::GetTournament { tournament_id } => {
                let tournament = self
                    .services
                    .store
                    .tournament(tournament_id)
                    .unwrap_or_else(|e| {
                        error!("Failed to load tournament {}: {}", tournament_id, e);
                        None
                    });
                caller.reply(ServerMessage::TournamentInfo(tournament));
                Ok(())
            }

            ClientMessage::SessionStatus {
                session_id,
                state,
                scores,
            } => self.engine_report(caller, session_id, |match_id| {
                PartitionMessage::SessionStatus {
                    session_id,
                    match_id,
                    state,
                    scores,
                }
            }),
            ClientMessage::SessionFinished { session_id, scores } => {
                self.engine_report(caller, session_id, |match_id| {
                    PartitionMessage::SessionFinished {
                        session_id,
                        match_id,
                        scores,
                    }
                })
            }
        }
    }

    /// Opens a room hosted by `caller` under a fresh code.
    pub fn create_room(
        &self,
        caller: &Caller,
        max_players: u32,
        config: RoomConfig,
    ) -> Result<String> {
        Room::validate(max_players, &config)?;
        loop {
            let code = generate_room_code();
            if let Entry::Vacant(slot) = self.services.registry.rooms.entry(code.clone()) {
                let (mailbox, inbox) = mpsc::unbounded_channel();
                slot.insert(PartitionHandle::new(
                    Topic::Room(code.clone()),
                    mailbox.clone(),
                ));
                let mut room = Room::new(
                    code.clone(),
                    &caller.identity,
                    max_players,
                    config,
                    Arc::clone(&self.services),
                    mailbox,
                );
                room.open(caller);
                spawn_partition(room, inbox, Arc::clone(&self.services));
                return Ok(code);
            }
        }
    }

    pub fn create_tournament(
        &self,
        caller: &Caller,
        name: &str,
        capacity: u32,
    ) -> Result<TournamentId> {
        Tournament::validate(name, capacity)?;
        let id = self.next_tournament_id.fetch_add(1, Ordering::SeqCst);
        let (mailbox, inbox) = mpsc::unbounded_channel();
        self.services.registry.tournaments.insert(
            id,
            PartitionHandle::new(Topic::Tournament(id), mailbox.clone()),
        );
        let mut tournament = Tournament::new(
            id,
            name,
            &caller.identity,
            capacity,
            Arc::clone(&self.services),
            mailbox,
        );
        tournament.open(caller);
        spawn_partition(tournament, inbox, Arc::clone(&self.services));
        Ok(id)
    }

    fn route(&self, topic: &Topic, caller: &Caller, request: Request) -> Result<()> {
        self.services
            .registry
            .lookup(topic)?
            .send(PartitionMessage::Request {
                caller: caller.clone(),
                request,
            })
    }

    fn engine_report(
        &self,
        caller: &Caller,
        session_id: SessionId,
        message: impl FnOnce(MatchId) -> PartitionMessage,
    ) -> Result<()> {
        if caller.identity.role != Role::Engine {
            return Err(OrchestratorError::Unauthorized(
                "only the game engine reports sessions".to_string(),
            ));
        }
        let lease = self.services.bridge.lease(session_id).ok_or_else(|| {
            OrchestratorError::StateConflict(format!("session {} is not running", session_id))
        })?;
        self.services
            .registry
            .lookup(&lease.owner.topic())?
            .send(message(lease.match_id))
    }

    /// Drops the client's subscriptions and tells every partition the user
    /// belongs to that the user is gone.
    pub fn connection_lost(&self, client_id: ClientId, user_id: UserId) {
        self.services.hub.unsubscribe_all(client_id);
        for topic in self.services.registry.memberships_of(user_id) {
            if let Some(handle) = self.services.registry.get(&topic) {
                if handle.send(PartitionMessage::ConnectionLost { user_id }).is_err() {
                    debug!("{} stopped before user {} was removed", topic, user_id);
                }
            }
        }
        info!("Connection of user {} (client {}) lost", user_id, client_id);
    }

    /// The user reconnected elsewhere; only the old client's subscriptions go.
    pub fn replace_connection(&self, client_id: ClientId) {
        let topics = self.services.hub.unsubscribe_all(client_id);
        debug!(
            "Client {} replaced, dropped {} subscription(s)",
            client_id,
            topics.len()
        );
    }
}

fn room_topic(code: &str) -> Topic {
    Topic::Room(code.trim().to_ascii_uppercase())
}
