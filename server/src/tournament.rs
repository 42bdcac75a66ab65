//! Single-elimination tournaments.
//!
//! The lobby phase mirrors a room: players register, ready up (bots are always
//! ready) and a countdown seeds the bracket. From then on each round opens one
//! session per match with two real players, collects results through the
//! idempotency guard, and once every match of the round is finished either
//! crowns the champion or starts the countdown to the next round.
//!
//! Players who lose their connection mid-tournament keep their seat for a
//! grace window. If it runs out while they still owe a match, the opponent
//! wins by forfeit.
//!
//! A lobby with no human players left is dropped. A finished tournament
//! lingers for late resyncs, then its partition is released; its record stays
//! in the store.

use crate::error::{ConflictKind, OrchestratorError, Result};
use crate::guard::GuardedEvent;
use crate::partition::{Caller, Mailbox, Partition, PartitionMessage, Request, Services};
use crate::session::LeaseOwner;
use crate::timer::TimerKey;
use crate::utils::get_timestamp;
use log::{error, info, warn};
use shared::model::{BOT_ID_BASE, MAX_TOURNAMENT_PLAYERS};
use shared::{
    pair_slots, resolve_winner, Bracket, Countdown, Identity, MatchId, MatchState, Participant,
    PlayerSlot, ServerEvent, SessionId, Slot, Topic, TournamentId, TournamentSnapshot,
    TournamentStatus, UserId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_TOURNAMENT_NAME_LEN: usize = 32;

pub struct Tournament {
    snapshot: TournamentSnapshot,
    /// Participants whose connection dropped while the bracket is running.
    disconnected: HashSet<UserId>,
    /// Participants who left a running bracket; every match they owe is forfeited.
    withdrawn: HashSet<UserId>,
    next_bot: u64,
    closed: bool,
    services: Arc<Services>,
    mailbox: Mailbox,
}

impl Tournament {
    pub fn validate(name: &str, capacity: u32) -> Result<()> {
        if !(2..=MAX_TOURNAMENT_PLAYERS).contains(&capacity) {
            return Err(OrchestratorError::Validation(format!(
                "capacity must be between 2 and {}",
                MAX_TOURNAMENT_PLAYERS
            )));
        }
        let len = name.trim().chars().count();
        if len == 0 || len > MAX_TOURNAMENT_NAME_LEN {
            return Err(OrchestratorError::Validation(format!(
                "tournament name must be 1 to {} characters",
                MAX_TOURNAMENT_NAME_LEN
            )));
        }
        Ok(())
    }

    pub fn new(
        id: TournamentId,
        name: &str,
        host: &Identity,
        capacity: u32,
        services: Arc<Services>,
        mailbox: Mailbox,
    ) -> Self {
        let host = PlayerSlot::new(host.user_id, host.display_name.clone());
        Self {
            snapshot: TournamentSnapshot::new(id, name.trim().to_string(), host, capacity),
            disconnected: HashSet::new(),
            withdrawn: HashSet::new(),
            next_bot: 0,
            closed: false,
            services,
            mailbox,
        }
    }

    pub fn snapshot(&self) -> &TournamentSnapshot {
        &self.snapshot
    }

    fn id(&self) -> TournamentId {
        self.snapshot.id
    }

    pub fn open(&mut self, caller: &Caller) {
        let topic = self.topic();
        self.publish(Vec::new(), true);
        self.services.registry.add_member(caller.user_id(), &topic);
        self.services
            .hub
            .subscribe(&topic, caller.client_id, caller.outbox.clone());
        info!(
            "Tournament {} '{}' created by {} ({} seats)",
            self.id(),
            self.snapshot.name,
            caller.identity.display_name,
            self.snapshot.capacity
        );
    }

    /// Publishes `events` in order, optionally followed by a full snapshot.
    fn publish(&mut self, events: Vec<ServerEvent>, with_snapshot: bool) {
        if events.is_empty() && !with_snapshot {
            return;
        }
        let topic = self.topic();
        for event in events {
            self.services.hub.publish(&topic, event);
        }
        if with_snapshot {
            self.services
                .hub
                .publish(&topic, ServerEvent::TournamentState(self.snapshot.clone()));
        }
        if let Err(e) = self.services.store.save_tournament(&self.snapshot) {
            error!("Failed to persist tournament {}: {}", self.id(), e);
        }
    }

    fn not_a_participant(&self, user_id: UserId) -> OrchestratorError {
        OrchestratorError::NotFound(format!("player {} in tournament {}", user_id, self.id()))
    }

    fn subscribe(&self, caller: &Caller) {
        self.services
            .hub
            .subscribe(&self.topic(), caller.client_id, caller.outbox.clone());
    }

    fn join(&mut self, caller: &Caller) -> Result<()> {
        let user_id = caller.user_id();
        if self.snapshot.player(user_id).is_some() {
            if self.snapshot.is_open() {
                return Err(ConflictKind::AlreadyJoined.into());
            }
            self.reconnect(user_id);
            self.services.registry.add_member(user_id, &self.topic());
            self.subscribe(caller);
            return Ok(());
        }
        if !self.snapshot.is_open() {
            return Err(ConflictKind::TournamentStarted.into());
        }
        if self.snapshot.is_full() {
            return Err(ConflictKind::TournamentFull.into());
        }

        let slot = PlayerSlot::new(user_id, caller.identity.display_name.clone());
        self.snapshot.add_player(slot.clone());
        self.publish(vec![ServerEvent::PlayerJoined { slot }], true);
        self.services.registry.add_member(user_id, &self.topic());
        self.subscribe(caller);
        info!(
            "{} registered for tournament {} ({}/{})",
            caller.identity.display_name,
            self.id(),
            self.snapshot.players.len(),
            self.snapshot.capacity
        );
        Ok(())
    }

    fn reconnect(&mut self, user_id: UserId) {
        if self.disconnected.remove(&user_id) {
            self.services.timers.cancel_timer(&self.forfeit_key(user_id));
            info!("Player {} reconnected to tournament {}", user_id, self.id());
        }
    }

    fn leave(&mut self, user_id: UserId) -> Result<()> {
        if self.snapshot.player(user_id).is_none() {
            return Err(self.not_a_participant(user_id));
        }
        self.services
            .registry
            .remove_member(user_id, &self.topic());

        match self.snapshot.status {
            TournamentStatus::Idle | TournamentStatus::Waiting => {
                let (_, new_host) = self.snapshot.remove_player(user_id);
                let mut events = vec![ServerEvent::PlayerLeft { user_id }];
                if let Some(host) = new_host {
                    events.push(ServerEvent::HostChanged { user_id: host });
                }
                if let Some(cancelled) = self.cancel_countdown() {
                    events.push(cancelled);
                }
                self.publish(events, true);
                if self.snapshot.players.iter().all(|p| p.is_bot) {
                    self.abandon_lobby();
                }
            }
            TournamentStatus::InProgress => {
                self.withdrawn.insert(user_id);
                self.disconnected.remove(&user_id);
                info!("Player {} withdrew from tournament {}", user_id, self.id());
                if let Some(forfeit) = self.forfeit(user_id) {
                    self.publish(vec![forfeit], false);
                    self.check_round_complete();
                }
            }
            TournamentStatus::Finished => {}
        }
        Ok(())
    }

    fn abandon_lobby(&mut self) {
        info!("Tournament {}: lobby has no players left, closing", self.id());
        if let Err(e) = self.services.store.remove_tournament(self.id()) {
            error!("Failed to remove tournament {}: {}", self.id(), e);
        }
        self.closed = true;
    }

    fn toggle_ready(&mut self, user_id: UserId) -> Result<()> {
        let ready = match self.snapshot.player(user_id) {
            Some(player) => !player.ready,
            None => return Err(self.not_a_participant(user_id)),
        };
        if !self.snapshot.is_open() {
            return Err(ConflictKind::TournamentStarted.into());
        }

        self.snapshot.set_ready(user_id, ready);
        let mut events = vec![ServerEvent::ReadyChanged { user_id, ready }];
        if ready {
            events.extend(self.maybe_start_countdown());
        } else if let Some(cancelled) = self.cancel_countdown() {
            events.push(cancelled);
        }
        self.publish(events, true);
        Ok(())
    }

    fn invite_bot(&mut self, user_id: UserId) -> Result<()> {
        if !self.snapshot.is_open() {
            return Err(ConflictKind::TournamentStarted.into());
        }
        if self.snapshot.host_id != user_id {
            return Err(ConflictKind::NotHost.into());
        }
        if self.snapshot.is_full() {
            return Err(ConflictKind::TournamentFull.into());
        }

        self.next_bot += 1;
        let slot = PlayerSlot::bot(BOT_ID_BASE + self.next_bot, format!("Bot {}", self.next_bot));
        self.snapshot.add_player(slot.clone());
        let mut events = vec![ServerEvent::PlayerJoined { slot }];
        events.extend(self.maybe_start_countdown());
        self.publish(events, true);
        Ok(())
    }

    fn start_key(&self) -> TimerKey {
        TimerKey::TournamentStart(self.id())
    }

    fn forfeit_key(&self, user: UserId) -> TimerKey {
        TimerKey::Forfeit {
            tournament: self.id(),
            user,
        }
    }

    fn start_countdown(&mut self, key: TimerKey, duration: Duration) -> ServerEvent {
        let started_at_ms = get_timestamp();
        let expires_at_ms = started_at_ms + duration.as_millis() as u64;
        self.services
            .schedule(&self.mailbox, key.clone(), expires_at_ms);
        let countdown = Countdown {
            key: key.to_string(),
            started_at_ms,
            expires_at_ms,
        };
        self.snapshot.start_countdown(countdown.clone());
        ServerEvent::CountdownStarted { countdown }
    }

    fn maybe_start_countdown(&mut self) -> Option<ServerEvent> {
        if !self.snapshot.all_ready() || self.snapshot.countdown.is_some() {
            return None;
        }
        info!("Tournament {}: all ready, countdown started", self.id());
        Some(self.start_countdown(self.start_key(), self.services.config.countdown))
    }

    fn cancel_countdown(&mut self) -> Option<ServerEvent> {
        let key = self.start_key();
        self.services.timers.cancel_timer(&key);
        let key = key.to_string();
        self.snapshot
            .cancel_countdown(&key)
            .then_some(ServerEvent::CountdownCancelled { key })
    }

    fn owns_countdown(&self, key: &TimerKey) -> bool {
        let key = key.to_string();
        self.snapshot.countdown.as_ref().map(|c| c.key.as_str()) == Some(key.as_str())
    }

    /// Seeds the bracket from the lobby in arrival order and opens round 0.
    fn start(&mut self) -> Result<()> {
        if !self.snapshot.is_open() || !self.snapshot.all_ready() {
            return Err(OrchestratorError::StateConflict(format!(
                "tournament {} is not ready to start",
                self.id()
            )));
        }
        let players: Vec<UserId> = self.snapshot.players.iter().map(|p| p.user_id).collect();
        let bracket =
            Bracket::generate(&players).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        let matches = bracket.round_matches(0);
        info!(
            "Tournament {}: bracket of {} with {} bye(s), {} round(s)",
            self.id(),
            players.len(),
            bracket.bye_count(),
            bracket.match_rounds()
        );

        self.snapshot
            .bracket_generated(bracket.clone(), matches.clone());
        self.publish(vec![ServerEvent::BracketGenerated { bracket, matches }], true);
        self.open_round(0);
        Ok(())
    }

    /// Opens a session for every unresolved match of `round`, then settles the
    /// matches whose players are already gone.
    fn open_round(&mut self, round: u32) {
        let owner = LeaseOwner::Tournament(self.id());
        let pending: Vec<(MatchId, UserId, UserId)> = self
            .snapshot
            .round_matches(round)
            .filter(|m| !m.is_finished())
            .filter_map(|m| m.players().map(|(a, b)| (m.match_id, a, b)))
            .collect();

        let mut events = Vec::new();
        let mut seated = Vec::new();
        for (match_id, a, b) in pending {
            let (Some(p1), Some(p2)) = (self.participant(a), self.participant(b)) else {
                warn!("Tournament {}: {} has an unknown player", self.id(), match_id);
                continue;
            };
            let participants = [p1, p2];
            let start = self
                .services
                .bridge
                .open_session(owner.clone(), match_id, participants.clone());
            self.snapshot.session_started(match_id, start.session_id);
            self.services.engine.start_session(&start);
            events.push(ServerEvent::SessionStarted {
                match_id,
                session_id: start.session_id,
                participants,
            });
            seated.extend([a, b]);
        }
        self.publish(events, false);

        let mut forfeits = Vec::new();
        for user_id in seated {
            if self.withdrawn.contains(&user_id) {
                forfeits.extend(self.forfeit(user_id));
            } else if self.disconnected.contains(&user_id) {
                self.start_forfeit_timer(user_id);
            }
        }
        self.publish(forfeits, false);
        self.check_round_complete();
    }

    fn participant(&self, user_id: UserId) -> Option<Participant> {
        self.snapshot.player(user_id).map(PlayerSlot::participant)
    }

    /// Crowns the champion after the final round, otherwise counts down to the next one.
    fn check_round_complete(&mut self) {
        if self.snapshot.status != TournamentStatus::InProgress {
            return;
        }
        let round = self.snapshot.current_round;
        if !self.snapshot.round_complete(round) {
            return;
        }

        let is_final = self
            .snapshot
            .bracket
            .as_ref()
            .is_some_and(|b| b.is_final_round(round as usize));
        if is_final {
            let champion = self
                .snapshot
                .round_matches(round)
                .next()
                .and_then(|m| m.winner)
                .and_then(Slot::user);
            match champion {
                Some(winner) if self.snapshot.finish(winner) => {
                    info!("Tournament {} won by player {}", self.id(), winner);
                    self.disconnected.clear();
                    self.publish(vec![ServerEvent::BracketTournamentFinished { winner }], true);
                    let expires_at_ms = get_timestamp()
                        + self.services.config.finished_linger.as_millis() as u64;
                    self.services.schedule(
                        &self.mailbox,
                        TimerKey::TournamentLinger(self.id()),
                        expires_at_ms,
                    );
                }
                Some(_) => {}
                None => error!("Tournament {}: final has no winner", self.id()),
            }
            return;
        }

        let key = TimerKey::RoundCountdown {
            tournament: self.id(),
            round: round + 1,
        };
        if self.owns_countdown(&key) {
            return;
        }
        info!("Tournament {}: round {} complete", self.id(), round);
        let started = self.start_countdown(key, self.services.config.round_countdown);
        self.publish(vec![started], false);
    }

    /// Writes the winners of the previous round into `round` and opens it.
    fn advance_round(&mut self, round: u32) -> Result<()> {
        let previous = round.checked_sub(1).ok_or_else(|| {
            OrchestratorError::StateConflict(format!("round {} has no predecessor", round))
        })?;
        if self.snapshot.current_round != previous || !self.snapshot.round_complete(previous) {
            return Err(OrchestratorError::StateConflict(format!(
                "tournament {} cannot enter round {}",
                self.id(),
                round
            )));
        }

        let mut finished: Vec<_> = self.snapshot.round_matches(previous).collect();
        finished.sort_by_key(|m| m.match_id.index);
        let winners: Vec<Slot> = finished
            .iter()
            .map(|m| m.winner.unwrap_or(Slot::Bye))
            .collect();
        let slots = self
            .snapshot
            .bracket
            .as_ref()
            .and_then(|b| b.next_round_slots(previous as usize, &winners))
            .ok_or_else(|| {
                OrchestratorError::StateConflict(format!(
                    "tournament {} has no round {}",
                    self.id(),
                    round
                ))
            })?;
        let matches = pair_slots(round, &slots);

        let event = GuardedEvent::round_advance(self.id(), round, matches.len());
        let snapshot = &mut self.snapshot;
        let applied = self.services.guard.apply(&event, || {
            snapshot.round_advanced(round, slots.clone(), matches.clone())
        });
        if applied != Some(true) {
            return Err(OrchestratorError::StateConflict(event.event_id));
        }

        info!(
            "Tournament {}: advanced to round {} ({} match(es))",
            self.id(),
            round,
            matches.len()
        );
        self.publish(
            vec![ServerEvent::BracketRoundAdvanced {
                round,
                slots,
                matches,
            }],
            true,
        );
        self.open_round(round);
        Ok(())
    }

    fn session_match(&self, session_id: SessionId, match_id: MatchId) -> Result<&shared::Match> {
        self.snapshot
            .match_by_id(match_id)
            .filter(|m| m.session_id == Some(session_id))
            .ok_or_else(|| {
                OrchestratorError::StateConflict(format!(
                    "session {} does not run {} in tournament {}",
                    session_id,
                    match_id,
                    self.id()
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
        self.session_match(session_id, match_id)?;
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
        self.publish(
            vec![ServerEvent::SessionProgress {
                match_id,
                state,
                scores,
            }],
            false,
        );
        Ok(())
    }

    fn session_finished(
        &mut self,
        session_id: SessionId,
        match_id: MatchId,
        scores: [u32; 2],
    ) -> Result<()> {
        let mut decided = self.session_match(session_id, match_id)?.clone();
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
        if let Some((a, b)) = decided.players() {
            self.services.timers.cancel_timer(&self.forfeit_key(a));
            self.services.timers.cancel_timer(&self.forfeit_key(b));
        }
        info!(
            "Tournament {}: {} finished {}-{}",
            self.id(),
            match_id,
            scores[0],
            scores[1]
        );
        self.publish(
            vec![ServerEvent::BracketMatchCompleted {
                match_id,
                scores,
                winner,
            }],
            false,
        );
        self.check_round_complete();
        Ok(())
    }

    /// Awards `user_id`'s current match to the opponent.
    fn forfeit(&mut self, user_id: UserId) -> Option<ServerEvent> {
        let m = self.snapshot.active_match_of(user_id)?.clone();
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

        self.services.timers.cancel_timer(&self.forfeit_key(user_id));
        if let Some(session_id) = m.session_id {
            if self.services.bridge.abandon(session_id).is_some() {
                self.services.engine.abandon_session(session_id);
            }
        }
        info!(
            "Tournament {}: {}; {} goes to {:?}",
            self.id(),
            OrchestratorError::PartnerLost(user_id),
            m.match_id,
            winner
        );
        Some(ServerEvent::ForfeitWin {
            match_id: m.match_id,
            winner,
            forfeiter: user_id,
        })
    }

    fn start_forfeit_timer(&self, user_id: UserId) {
        let key = self.forfeit_key(user_id);
        if self.services.timers.is_active(&key) {
            return;
        }
        let expires_at_ms =
            get_timestamp() + self.services.config.forfeit_grace.as_millis() as u64;
        self.services.schedule(&self.mailbox, key, expires_at_ms);
    }

    fn connection_lost(&mut self, user_id: UserId) -> Result<()> {
        if self.snapshot.player(user_id).is_none() {
            return Ok(());
        }
        match self.snapshot.status {
            TournamentStatus::Idle | TournamentStatus::Waiting => self.leave(user_id),
            TournamentStatus::InProgress => {
                if self.disconnected.insert(user_id) {
                    info!("Player {} lost connection to tournament {}", user_id, self.id());
                }
                if self.snapshot.active_match_of(user_id).is_some() {
                    self.start_forfeit_timer(user_id);
                }
                Ok(())
            }
            TournamentStatus::Finished => Ok(()),
        }
    }

    fn forfeit_elapsed(&mut self, user_id: UserId) -> Result<()> {
        if !self.disconnected.contains(&user_id) {
            return Err(OrchestratorError::StateConflict(format!(
                "player {} is back in tournament {}",
                user_id,
                self.id()
            )));
        }
        match self.forfeit(user_id) {
            Some(forfeit) => {
                self.publish(vec![forfeit], false);
                self.check_round_complete();
                Ok(())
            }
            None => Err(OrchestratorError::StateConflict(format!(
                "player {} owes no match in tournament {}",
                user_id,
                self.id()
            ))),
        }
    }

    fn timer_elapsed(&mut self, key: TimerKey) -> Result<()> {
        match key {
            TimerKey::Forfeit { user, .. } => self.forfeit_elapsed(user),
            TimerKey::TournamentLinger(_) if self.snapshot.status == TournamentStatus::Finished => {
                info!("Tournament {}: releasing finished bracket", self.id());
                self.closed = true;
                Ok(())
            }
            ref countdown if !self.owns_countdown(countdown) => Err(
                OrchestratorError::StateConflict(format!("stale timer {}", countdown)),
            ),
            TimerKey::TournamentStart(_) => self.start(),
            TimerKey::RoundCountdown { round, .. } => self.advance_round(round),
            TimerKey::TournamentLinger(_) | TimerKey::RoomCountdown(_) => Err(
                OrchestratorError::StateConflict(format!(
                    "timer {} does not apply to tournament {}",
                    key,
                    self.id()
                )),
            ),
        }
    }
}

impl Partition for Tournament {
    fn topic(&self) -> Topic {
        Topic::Tournament(self.snapshot.id)
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
                Request::InviteBot => self.invite_bot(caller.user_id()),
                Request::SetConfig(_) => Err(OrchestratorError::Validation(
                    "tournaments have no room configuration".to_string(),
                )),
                Request::Resync => {
                    if self.snapshot.player(caller.user_id()).is_some() {
                        self.reconnect(caller.user_id());
                    }
                    self.subscribe(&caller);
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
            PartitionMessage::ConnectionLost { user_id } => self.connection_lost(user_id),
            PartitionMessage::TimerElapsed(key) => self.timer_elapsed(key),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::RecordingEngine;
    use crate::store::{MemoryStore, Store};
    use shared::{ClientView, ServerMessage};
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    struct Fixture {
        services: Arc<Services>,
        engine: Arc<RecordingEngine>,
        store: Arc<MemoryStore>,
        inbox: mpsc::UnboundedReceiver<PartitionMessage>,
        tournament: Tournament,
    }

    fn caller(user_id: UserId) -> (Caller, mpsc::Receiver<ServerMessage>) {
        let (outbox, rx) = mpsc::channel(256);
        let caller = Caller {
            client_id: user_id as u32,
            identity: Identity::player(user_id, format!("p{}", user_id)),
            outbox,
        };
        (caller, rx)
    }

    fn request(caller: &Caller, request: Request) -> PartitionMessage {
        PartitionMessage::Request {
            caller: caller.clone(),
            request,
        }
    }

    fn fixture(capacity: u32) -> Fixture {
        let engine = Arc::new(RecordingEngine::new());
        let store = Arc::new(MemoryStore::new());
        let config = ServerConfig {
            countdown: Duration::from_millis(100),
            round_countdown: Duration::from_millis(200),
            forfeit_grace: Duration::from_millis(500),
            finished_linger: Duration::from_millis(1000),
            ..ServerConfig::default()
        };
        let services = Arc::new(Services::new(config, engine.clone(), store.clone()));
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (host, _) = caller(1);
        let mut tournament = Tournament::new(
            7,
            "Friday cup",
            &host.identity,
            capacity,
            Arc::clone(&services),
            mailbox,
        );
        tournament.open(&host);
        Fixture {
            services,
            engine,
            store,
            inbox,
            tournament,
        }
    }

    impl Fixture {
        /// Lets `ms` of timers elapse and feeds whatever they posted.
        async fn elapse(&mut self, ms: u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            while let Ok(message) = self.inbox.try_recv() {
                let _ = self.tournament.handle(message);
            }
        }

        fn register_all_and_ready(&mut self) {
            for id in 2..=self.tournament.snapshot().capacity as u64 {
                let (c, _) = caller(id);
                self.tournament.handle(request(&c, Request::Join)).unwrap();
            }
            for id in 1..=self.tournament.snapshot().capacity as u64 {
                let (c, _) = caller(id);
                self.tournament
                    .handle(request(&c, Request::ToggleReady))
                    .unwrap();
            }
        }

        fn finish(&mut self, match_id: MatchId, scores: [u32; 2]) -> Result<()> {
            let session_id = self
                .tournament
                .snapshot()
                .match_by_id(match_id)
                .and_then(|m| m.session_id)
                .expect("match should have a session");
            self.tournament.handle(PartitionMessage::SessionFinished {
                session_id,
                match_id,
                scores,
            })
        }
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let mut f = fixture(2);
        let (guest, _) = caller(2);
        assert_ok!(f.tournament.handle(request(&guest, Request::Join)));
        assert_eq!(
            f.tournament.handle(request(&guest, Request::Join)),
            Err(OrchestratorError::Conflict(ConflictKind::AlreadyJoined))
        );
        let (late, _) = caller(3);
        assert_eq!(
            f.tournament.handle(request(&late, Request::Join)),
            Err(OrchestratorError::Conflict(ConflictKind::TournamentFull))
        );
        assert!(Tournament::validate("", 4).is_err());
        assert!(Tournament::validate("cup", 33).is_err());
        assert_eq!(f.store.tournament(7).unwrap().unwrap().players.len(), 2);
    }

    #[tokio::test]
    async fn test_host_invites_ready_bot() {
        let mut f = fixture(2);
        let (guest, _) = caller(2);
        f.tournament.handle(request(&guest, Request::Join)).unwrap();
        f.tournament.handle(request(&guest, Request::Leave)).unwrap();

        assert_eq!(
            f.tournament.handle(request(&guest, Request::InviteBot)),
            Err(OrchestratorError::Conflict(ConflictKind::NotHost))
        );
        let (host, _) = caller(1);
        f.tournament.handle(request(&host, Request::InviteBot)).unwrap();
        let bot = &f.tournament.snapshot().players[1];
        assert!(bot.is_bot && bot.ready);
        assert!(bot.user_id >= BOT_ID_BASE);

        f.tournament.handle(request(&host, Request::ToggleReady)).unwrap();
        assert!(f
            .services
            .timers
            .is_active(&TimerKey::TournamentStart(7)));
    }

    #[tokio::test]
    async fn test_lobby_without_humans_closes() {
        let mut f = fixture(4);
        let (host, _) = caller(1);
        f.tournament.handle(request(&host, Request::InviteBot)).unwrap();
        let (guest, _) = caller(2);
        f.tournament.handle(request(&guest, Request::Join)).unwrap();

        f.tournament.handle(request(&host, Request::Leave)).unwrap();
        assert!(!f.tournament.is_closed());
        assert_eq!(f.tournament.snapshot().host_id, 2);

        f.tournament
            .handle(PartitionMessage::ConnectionLost { user_id: 2 })
            .unwrap();
        assert!(f.tournament.is_closed());
        assert_eq!(f.store.tournament(7).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_bracket_lingers_then_closes() {
        let mut f = fixture(2);
        f.register_all_and_ready();
        f.elapse(150).await;
        f.finish(MatchId::new(0, 0), [5, 3]).unwrap();
        assert_eq!(f.tournament.snapshot().status, TournamentStatus::Finished);

        f.elapse(500).await;
        assert!(!f.tournament.is_closed());
        let (late, _) = caller(50);
        assert_ok!(f.tournament.handle(request(&late, Request::Resync)));

        f.elapse(600).await;
        assert!(f.tournament.is_closed());
        assert_eq!(
            f.store.tournament(7).unwrap().map(|t| t.winner),
            Some(Some(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_players_play_to_a_champion() {
        let mut f = fixture(4);
        f.register_all_and_ready();
        f.elapse(150).await;

        let snapshot = f.tournament.snapshot();
        assert_eq!(snapshot.status, TournamentStatus::InProgress);
        assert_eq!(snapshot.round_matches(0).count(), 2);
        assert_eq!(f.engine.started().len(), 2);

        f.finish(MatchId::new(0, 0), [5, 2]).unwrap();
        f.finish(MatchId::new(0, 1), [1, 5]).unwrap();
        assert!(f.tournament.snapshot().countdown.is_some());
        f.elapse(250).await;

        let snapshot = f.tournament.snapshot();
        assert_eq!(snapshot.current_round, 1);
        let last = snapshot.match_by_id(MatchId::new(1, 0)).unwrap();
        assert_eq!((last.player1, last.player2), (Slot::Player(1), Slot::Player(4)));

        f.finish(MatchId::new(1, 0), [3, 5]).unwrap();
        let snapshot = f.tournament.snapshot();
        assert_eq!(snapshot.status, TournamentStatus::Finished);
        assert_eq!(snapshot.winner, Some(4));
        assert_eq!(snapshot.bracket.as_ref().and_then(|b| b.champion()), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_grace_window_forfeits_and_advances_once() {
        let mut f = fixture(4);
        f.register_all_and_ready();
        f.elapse(150).await;

        f.tournament
            .handle(PartitionMessage::ConnectionLost { user_id: 2 })
            .unwrap();
        f.finish(MatchId::new(0, 1), [5, 4]).unwrap();
        f.elapse(600).await;

        let forfeited = f
            .tournament
            .snapshot()
            .match_by_id(MatchId::new(0, 0))
            .cloned()
            .unwrap();
        assert_eq!(forfeited.winner, Some(Slot::Player(1)));
        assert_eq!(forfeited.forfeited, [false, true]);
        assert_eq!(f.engine.abandoned().len(), 1);

        f.elapse(250).await;
        assert_eq!(f.tournament.snapshot().current_round, 1);

        let late_result = f.tournament.handle(PartitionMessage::SessionFinished {
            session_id: forfeited.session_id.unwrap(),
            match_id: MatchId::new(0, 0),
            scores: [0, 5],
        });
        assert!(matches!(late_result, Err(OrchestratorError::StateConflict(_))));
        let replayed_timer = f.tournament.handle(PartitionMessage::TimerElapsed(
            TimerKey::RoundCountdown {
                tournament: 7,
                round: 1,
            },
        ));
        assert!(matches!(replayed_timer, Err(OrchestratorError::StateConflict(_))));
        assert_eq!(f.tournament.snapshot().round_matches(1).count(), 1);
        assert_eq!(f.engine.started().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_inside_grace_window_keeps_the_match() {
        let mut f = fixture(2);
        f.register_all_and_ready();
        f.elapse(150).await;

        f.tournament
            .handle(PartitionMessage::ConnectionLost { user_id: 2 })
            .unwrap();
        let key = TimerKey::Forfeit {
            tournament: 7,
            user: 2,
        };
        assert!(f.services.timers.is_active(&key));

        let (back, _) = caller(2);
        f.tournament.handle(request(&back, Request::Join)).unwrap();
        assert!(!f.services.timers.is_active(&key));

        f.elapse(600).await;
        let m = f.tournament.snapshot().match_by_id(MatchId::new(0, 0)).unwrap();
        assert!(!m.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resynced_view_matches_live_view() {
        let mut f = fixture(4);
        let (spectator, mut live_rx) = caller(99);
        f.tournament
            .handle(request(&spectator, Request::Resync))
            .unwrap();

        f.register_all_and_ready();
        f.elapse(150).await;
        f.finish(MatchId::new(0, 0), [5, 0]).unwrap();
        f.tournament
            .handle(PartitionMessage::ConnectionLost { user_id: 4 })
            .unwrap();
        f.elapse(600).await;

        let mut live = ClientView::new();
        while let Ok(message) = live_rx.try_recv() {
            live.apply_message(&message);
        }
        let topic = f.tournament.topic();
        let mut rejoined = ClientView::new();
        rejoined.apply_resync(&topic, &f.services.hub.replay(&topic));

        assert_eq!(live.tournament(7), Some(f.tournament.snapshot()));
        assert_eq!(rejoined.tournament(7), live.tournament(7));
    }
}
