//! Room lifecycle: lobby membership, readiness, configuration, and the
//! one-off sessions a full, ready room turns into.
//!
//! Every mutation goes through the same snapshot helpers the client replica
//! uses, publishes its incremental events in the order they were applied, and
//! finishes with a fresh `RoomState`.

use crate::error::{ConflictKind, OrchestratorError, Result};
use crate::guard::GuardedEvent;
use crate::partition::{Caller, Mailbox, Partition, PartitionMessage, Request, Services};
use crate::session::LeaseOwner;
use crate::timer::TimerKey;
use crate::utils::get_timestamp;
use log::{error, info};
use shared::model::MAX_ROOM_PLAYERS;
use shared::{
    resolve_winner, Countdown, Identity, Match, MatchId, MatchState, Participant, PlayerSlot,
    RoomConfig, RoomSnapshot, RoomStatus, ServerEvent, SessionId, Topic, UserId,
};
use std::sync::Arc;

pub struct Room {
    snapshot: RoomSnapshot,
    services: Arc<Services>,
    mailbox: Mailbox,
    closed: bool,
}

impl Room {
    pub fn validate(max_players: u32, config: &RoomConfig) -> Result<()> {
        if !(2..=MAX_ROOM_PLAYERS).contains(&max_players) || max_players % 2 != 0 {
            return Err(OrchestratorError::Validation(format!(
                "max players must be an even number between 2 and {}",
                MAX_ROOM_PLAYERS
            )));
        }
        if !config.is_valid() {
            return Err(OrchestratorError::Validation(format!(
                "score limit must be between 1 and {}",
                shared::model::MAX_SCORE_LIMIT
            )));
        }
        Ok(())
    }

    pub fn new(
        code: String,
        host: &Identity,
        max_players: u32,
        config: RoomConfig,
        services: Arc<Services>,
        mailbox: Mailbox,
    ) -> Self {
        let host = PlayerSlot::new(host.user_id, host.display_name.clone());
        Self {
            snapshot: RoomSnapshot::new(code, host, max_players, config),
            services,
            mailbox,
            closed: false,
        }
    }

    pub fn snapshot(&self) -> &RoomSnapshot {
        &self.snapshot
    }

    fn code(&self) -> &str {
        &self.snapshot.code
    }

    fn countdown_key(&self) -> TimerKey {
        TimerKey::RoomCountdown(self.snapshot.code.clone())
    }

    /// Publishes the first snapshot and subscribes the creator.
    pub fn open(&mut self, caller: &Caller) {
        let topic = self.topic();
        self.publish(Vec::new());
        self.services.registry.add_member(caller.user_id(), &topic);
        self.services
            .hub
            .subscribe(&topic, caller.client_id, caller.outbox.clone());
        info!(
            "Room {} created by {} ({} players)",
            self.code(),
            caller.identity.display_name,
            self.snapshot.max_players
        );
    }

    fn publish(&mut self, events: Vec<ServerEvent>) {
        let topic = self.topic();
        for event in events {
            self.services.hub.publish(&topic, event);
        }
        self.services
            .hub
            .publish(&topic, ServerEvent::RoomState(self.snapshot.clone()));

        let persisted = if self.snapshot.status == RoomStatus::Closed {
            self.services.store.remove_room(self.code())
        } else {
            self.services.store.save_room(&self.snapshot)
        };
        if let Err(e) = persisted {
            error!("Failed to persist room {}: {}", self.code(), e);
        }

        if self.snapshot.status == RoomStatus::Closed {
            self.close();
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.services.timers.cancel_timer(&self.countdown_key());
        let owner = LeaseOwner::Room(self.snapshot.code.clone());
        for session_id in self.services.bridge.leases_of(&owner) {
            if self.services.bridge.abandon(session_id).is_some() {
                self.services.engine.abandon_session(session_id);
            }
        }
        info!("Room {} closed", self.code());
    }

    fn not_a_member(&self, user_id: UserId) -> OrchestratorError {
        OrchestratorError::NotFound(format!("player {} in room {}", user_id, self.code()))
    }

    fn join(&mut self, caller: &Caller) -> Result<()> {
        let user_id = caller.user_id();
        if self.snapshot.status == RoomStatus::Closed {
            return Err(OrchestratorError::NotFound(format!("room {}", self.code())));
        }
        if self.snapshot.player(user_id).is_some() {
            return Err(ConflictKind::AlreadyJoined.into());
        }
        if self.snapshot.status == RoomStatus::Starting {
            return Err(ConflictKind::RoomStarting.into());
        }
        if self.snapshot.is_full() {
            return Err(ConflictKind::RoomFull.into());
        }

        let slot = PlayerSlot::new(user_id, caller.identity.display_name.clone());
        self.snapshot.add_player(slot.clone());
        self.publish(vec![ServerEvent::PlayerJoined { slot }]);

        let topic = self.topic();
        self.services.registry.add_member(user_id, &topic);
        self.services
            .hub
            .subscribe(&topic, caller.client_id, caller.outbox.clone());
        info!("{} joined room {}", caller.identity.display_name, self.code());
        Ok(())
    }

    fn leave(&mut self, user_id: UserId) -> Result<()> {
        if self.snapshot.player(user_id).is_none() {
            return Err(self.not_a_member(user_id));
        }

        let mut events = Vec::new();
        if let Some(forfeit) = self.forfeit_active_match(user_id) {
            events.push(forfeit);
        }
        let (_, new_host) = self.snapshot.remove_player(user_id);
        events.push(ServerEvent::PlayerLeft { user_id });
        if let Some(host) = new_host {
            info!("Room {}: host passed to {}", self.code(), host);
            events.push(ServerEvent::HostChanged { user_id: host });
        }
        if let Some(cancelled) = self.cancel_countdown() {
            events.push(cancelled);
        }

        self.services
            .registry
            .remove_member(user_id, &self.topic());
        self.publish(events);
        Ok(())
    }

    fn toggle_ready(&mut self, user_id: UserId) -> Result<()> {
        let ready = match self.snapshot.player(user_id) {
            Some(player) => !player.ready,
            None => return Err(self.not_a_member(user_id)),
        };
        if self.snapshot.in_session() || self.snapshot.status == RoomStatus::Closed {
            return Err(ConflictKind::RoomStarting.into());
        }

        self.snapshot.set_ready(user_id, ready);
        let mut events = vec![ServerEvent::ReadyChanged { user_id, ready }];
        if ready && self.snapshot.all_ready() {
            self.snapshot.mark_starting();
            events.push(ServerEvent::AllReady);
            let countdown = self.start_countdown();
            events.push(ServerEvent::CountdownStarted { countdown });
            info!("Room {}: all ready, countdown started", self.code());
        } else if !ready {
            if let Some(cancelled) = self.cancel_countdown() {
                events.push(cancelled);
            }
        }
        self.publish(events);
        Ok(())
    }

    fn set_config(&mut self, user_id: UserId, config: RoomConfig) -> Result<()> {
        Self::validate(self.snapshot.max_players, &config)?;
        if self.snapshot.player(user_id).is_none() {
            return Err(self.not_a_member(user_id));
        }
        if self.snapshot.host_id != user_id {
            return Err(ConflictKind::NotHost.into());
        }
        if self.snapshot.status == RoomStatus::Starting || self.snapshot.in_session() {
            return Err(ConflictKind::ConfigLocked.into());
        }

        self.snapshot.config = config.clone();
        self.publish(vec![ServerEvent::ConfigChanged { config }]);
        Ok(())
    }

    fn start_countdown(&mut self) -> Countdown {
        let key = self.countdown_key();
        let started_at_ms = get_timestamp();
        let expires_at_ms = started_at_ms + self.services.config.countdown.as_millis() as u64;
        self.services
            .schedule(&self.mailbox, key.clone(), expires_at_ms);

        let countdown = Countdown {
            key: key.to_string(),
            started_at_ms,
            expires_at_ms,
        };
        self.snapshot.start_countdown(countdown.clone());
        countdown
    }

    fn cancel_countdown(&mut self) -> Option<ServerEvent> {
        let key = self.countdown_key();
        self.services.timers.cancel_timer(&key);
        let key = key.to_string();
        if self.snapshot.cancel_countdown(&key) {
            info!("Room {}: countdown cancelled", self.code());
            Some(ServerEvent::CountdownCancelled { key })
        } else {
            None
        }
    }

    /// Opens one session per slot pair `(2i, 2i + 1)`.
    fn countdown_elapsed(&mut self, key: &TimerKey) -> Result<()> {
        let key = key.to_string();
        if self.snapshot.countdown.as_ref().map(|c| c.key.as_str()) != Some(key.as_str()) {
            return Err(OrchestratorError::StateConflict(format!("stale timer {}", key)));
        }

        let pairs: Vec<[Participant; 2]> = self
            .snapshot
            .players
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| [pair[0].participant(), pair[1].participant()])
            .collect();
        let owner = LeaseOwner::Room(self.snapshot.code.clone());

        let mut events = Vec::new();
        for (index, participants) in pairs.into_iter().enumerate() {
            let match_id = MatchId::new(0, index as u32);
            let start = self
                .services
                .bridge
                .open_session(owner.clone(), match_id, participants.clone());
            self.snapshot
                .session_started(match_id, start.session_id, &participants);
            self.services.engine.start_session(&start);
            events.push(ServerEvent::SessionStarted {
                match_id,
                session_id: start.session_id,
                participants,
            });
        }
        info!("Room {}: {} session(s) started", self.code(), events.len());
        self.publish(events);
        Ok(())
    }

    fn owned_match(&self, session_id: SessionId, match_id: MatchId) -> Result<&Match> {
        self.snapshot
            .matches
            .iter()
            .find(|m| m.match_id == match_id && m.session_id == Some(session_id))
            .ok_or_else(|| {
                OrchestratorError::StateConflict(format!(
                    "session {} does not run {} in room {}",
                    session_id,
                    match_id,
                    self.code()
                ))
            })
    }

    fn session_status(
        &mut self,
        session_id: SessionId,
        match_id: MatchId,
        state: MatchState,
        scores: [u32; 2],
    ) -> Result<()> {
        self.owned_match(session_id, match_id)?;
        if state == MatchState::Finished {
            return self.session_finished(session_id, match_id, scores);
        }

        let event = GuardedEvent::match_progress(&self.topic(), match_id, state, scores);
        let snapshot = &mut self.snapshot;
        let applied = self
            .services
            .guard
            .apply(&event, || snapshot.session_progress(match_id, state, scores));
        if applied != Some(true) {
            return Err(OrchestratorError::StateConflict(event.event_id));
        }
        self.publish(vec![ServerEvent::SessionProgress {
            match_id,
            state,
            scores,
        }]);
        Ok(())
    }

    fn session_finished(
        &mut self,
        session_id: SessionId,
        match_id: MatchId,
        scores: [u32; 2],
    ) -> Result<()> {
        let mut decided = self.owned_match(session_id, match_id)?.clone();
        decided.scores = scores;
        let winner = resolve_winner(&decided);

        let event = GuardedEvent::match_result(&self.topic(), match_id);
        let snapshot = &mut self.snapshot;
        let applied = self
            .services
            .guard
            .apply(&event, || snapshot.complete_match(match_id, scores, winner));
        if applied != Some(true) {
            return Err(OrchestratorError::StateConflict(event.event_id));
        }

        self.services.bridge.finish(session_id);
        info!(
            "Room {}: {} finished {}-{}",
            self.code(),
            match_id,
            scores[0],
            scores[1]
        );
        self.publish(vec![ServerEvent::SessionFinished {
            match_id,
            scores,
            winner,
        }]);
        Ok(())
    }

    /// Resolves the leaver's running match in favour of the opponent.
    fn forfeit_active_match(&mut self, user_id: UserId) -> Option<ServerEvent> {
        let m = self
            .snapshot
            .matches
            .iter()
            .find(|m| !m.is_finished() && m.involves(user_id))?
            .clone();
        let side = m.side_of(user_id)?;
        let winner = m.slot(1 - side);

        let event = GuardedEvent::match_result(&self.topic(), m.match_id);
        let snapshot = &mut self.snapshot;
        let applied = self
            .services
            .guard
            .apply(&event, || snapshot.forfeit_match(m.match_id, user_id, winner));
        if applied != Some(true) {
            return None;
        }

        if let Some(session_id) = m.session_id {
            if self.services.bridge.abandon(session_id).is_some() {
                self.services.engine.abandon_session(session_id);
            }
        }
        info!(
            "Room {}: player {} forfeited {}",
            self.code(),
            user_id,
            m.match_id
        );
        Some(ServerEvent::ForfeitWin {
            match_id: m.match_id,
            winner,
            forfeiter: user_id,
        })
    }
}

impl Partition for Room {
    fn topic(&self) -> Topic {
        Topic::Room(self.snapshot.code.clone())
    }

    fn handle(&mut self, message: PartitionMessage) -> Result<()> {
        match message {
            PartitionMessage::Request { caller, request } => match request {
                Request::Join => self.join(&caller),
                Request::Leave => {
                    self.leave(caller.user_id())?;
                    self.services.hub.unsubscribe(&self.topic(), caller.client_id);
                    Ok(())
                }
                Request::ToggleReady => self.toggle_ready(caller.user_id()),
                Request::SetConfig(config) => self.set_config(caller.user_id(), config),
                Request::InviteBot => Err(OrchestratorError::Validation(
                    "bots can only be invited to tournaments".to_string(),
                )),
                Request::Resync => {
                    self.services
                        .hub
                        .subscribe(&self.topic(), caller.client_id, caller.outbox.clone());
                    Ok(())
                }
            },
            PartitionMessage::SessionStatus {
                session_id,
                match_id,
                state,
                scores,
            } => self.session_status(session_id, match_id, state, scores),
            PartitionMessage::SessionFinished {
                session_id,
                match_id,
                scores,
            } => self.session_finished(session_id, match_id, scores),
            PartitionMessage::ConnectionLost { user_id } => match self.leave(user_id) {
                Err(OrchestratorError::NotFound(_)) => Ok(()),
                other => other,
            },
            PartitionMessage::TimerElapsed(key) => self.countdown_elapsed(&key),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
