//! Domain records shared by the server and its clients.
//!
//! The server owns the authoritative copies of these records; clients hold
//! replicas rebuilt from the event stream. Mutation helpers live on the
//! records themselves so that both sides apply an event with the exact same
//! code, which is what keeps a resynchronized client identical to one that
//! never dropped.

use crate::bracket::{resolve_winner, Bracket, Slot};
use serde::{Deserialize, Serialize};

pub type ClientId = u32;
pub type UserId = u64;
pub type TournamentId = u64;
pub type SessionId = u64;

/// Largest score limit a room may be configured with.
pub const MAX_SCORE_LIMIT: u32 = 21;
/// Largest lobby a room may hold.
pub const MAX_ROOM_PLAYERS: u32 = 8;
/// Largest field a tournament may register.
pub const MAX_TOURNAMENT_PLAYERS: u32 = 32;
/// User ids at or above this value are reserved for bots.
pub const BOT_ID_BASE: UserId = u64::MAX - 1_000_000;

pub fn is_bot_id(user_id: UserId) -> bool {
    user_id >= BOT_ID_BASE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Player,
    /// The external game engine reporting session outcomes.
    Engine,
}

/// A resolved connection identity, as produced by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn player(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role: Role::Player,
        }
    }
}

/// A participant's seat inside a room or tournament lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub user_id: UserId,
    pub display_name: String,
    pub ready: bool,
    pub is_host: bool,
    pub is_bot: bool,
}

impl PlayerSlot {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            ready: false,
            is_host: false,
            is_bot: false,
        }
    }

    pub fn bot(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            ready: true,
            is_host: false,
            is_bot: true,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            is_bot: self.is_bot,
        }
    }
}

/// One side of a session. Index 0 of a participant pair plays the left side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub is_bot: bool,
}

/// A pending timed transition, stored as an absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub key: String,
    pub started_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Countdown {
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }

    /// Fraction of the countdown already elapsed, in `0.0..=1.0`.
    pub fn progress(&self, now_ms: u64) -> f32 {
        let total = self.expires_at_ms.saturating_sub(self.started_at_ms);
        if total == 0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(self.started_at_ms).min(total);
        elapsed as f32 / total as f32
    }
}

/// Ordered lifecycle of a match. Updates never move a match backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MatchState {
    Assigned,
    Waiting,
    Playing,
    Finished,
}

impl MatchState {
    pub fn rank(self) -> u32 {
        self as u32
    }
}

/// Position of a match in its owner: bracket round and index within the round.
/// Room matches use round 0 and the slot-pair index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchId {
    pub round: u32,
    pub index: u32,
}

impl MatchId {
    pub fn new(round: u32, index: u32) -> Self {
        Self { round, index }
    }
}

impl std::fmt::Display for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}m{}", self.round, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub session_id: Option<SessionId>,
    pub player1: Slot,
    pub player2: Slot,
    pub scores: [u32; 2],
    pub state: MatchState,
    pub winner: Option<Slot>,
    pub forfeited: [bool; 2],
}

impl Match {
    pub fn new(match_id: MatchId, player1: Slot, player2: Slot) -> Self {
        Self {
            match_id,
            session_id: None,
            player1,
            player2,
            scores: [0, 0],
            state: MatchState::Assigned,
            winner: None,
            forfeited: [false, false],
        }
    }

    /// Builds a match and, if either side is a bye, resolves it on the spot.
    pub fn paired(match_id: MatchId, player1: Slot, player2: Slot) -> Self {
        let mut m = Self::new(match_id, player1, player2);
        if m.is_bye() {
            let winner = resolve_winner(&m);
            m.state = MatchState::Finished;
            m.winner = Some(winner);
        }
        m
    }

    pub fn is_bye(&self) -> bool {
        self.player1 == Slot::Bye || self.player2 == Slot::Bye
    }

    pub fn is_finished(&self) -> bool {
        self.state == MatchState::Finished
    }

    /// Moves the match to `next` unless that would regress it.
    ///
    /// Returns false for a stale update and for any update of a finished match.
    pub fn advance(&mut self, next: MatchState) -> bool {
        if self.is_finished() || next < self.state {
            return false;
        }
        self.state = next;
        true
    }

    pub fn side_of(&self, user_id: UserId) -> Option<usize> {
        if self.player1 == Slot::Player(user_id) {
            Some(0)
        } else if self.player2 == Slot::Player(user_id) {
            Some(1)
        } else {
            None
        }
    }

    pub fn slot(&self, side: usize) -> Slot {
        if side == 0 {
            self.player1
        } else {
            self.player2
        }
    }

    pub fn players(&self) -> Option<(UserId, UserId)> {
        match (self.player1, self.player2) {
            (Slot::Player(a), Slot::Player(b)) => Some((a, b)),
            _ => None,
        }
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.side_of(user_id).is_some()
    }

    fn complete(&mut self, scores: [u32; 2], winner: Slot) -> bool {
        if self.is_finished() {
            return false;
        }
        self.scores = scores;
        self.state = MatchState::Finished;
        self.winner = Some(winner);
        true
    }

    fn forfeit(&mut self, forfeiter: UserId, winner: Slot) -> bool {
        if self.is_finished() {
            return false;
        }
        if let Some(side) = self.side_of(forfeiter) {
            self.forfeited[side] = true;
        }
        self.state = MatchState::Finished;
        self.winner = Some(winner);
        true
    }

    fn progress(&mut self, state: MatchState, scores: [u32; 2]) -> bool {
        if state == MatchState::Finished || !self.advance(state) {
            return false;
        }
        self.scores = scores;
        true
    }
}

fn find_match(matches: &mut [Match], match_id: MatchId) -> Option<&mut Match> {
    matches.iter_mut().find(|m| m.match_id == match_id)
}

/// Clears `is_host` on everyone but `host_id`. Returns false if nobody matched.
fn assign_host(players: &mut [PlayerSlot], host_id: UserId) -> bool {
    let mut found = false;
    for p in players.iter_mut() {
        p.is_host = p.user_id == host_id;
        found |= p.is_host;
    }
    found
}

/// Removes a slot, promoting the next-oldest human if the host left.
/// Bots only inherit the lobby when no human is left.
/// Returns `(removed, new_host)`.
fn remove_slot(players: &mut Vec<PlayerSlot>, host_id: &mut UserId, user_id: UserId) -> (bool, Option<UserId>) {
    let before = players.len();
    players.retain(|p| p.user_id != user_id);
    if players.len() == before {
        return (false, None);
    }
    if *host_id == user_id {
        if let Some(next) = players.iter().find(|p| !p.is_bot).or_else(|| players.first()) {
            *host_id = next.user_id;
            let new_host = next.user_id;
            assign_host(players, new_host);
            return (true, Some(new_host));
        }
    }
    (true, None)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub score_limit: u32,
    pub power_ups: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            score_limit: 5,
            power_ups: false,
        }
    }
}

impl RoomConfig {
    pub fn is_valid(&self) -> bool {
        (1..=MAX_SCORE_LIMIT).contains(&self.score_limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Open,
    Full,
    Starting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub code: String,
    pub host_id: UserId,
    pub max_players: u32,
    pub players: Vec<PlayerSlot>,
    pub config: RoomConfig,
    pub status: RoomStatus,
    pub countdown: Option<Countdown>,
    pub matches: Vec<Match>,
}

impl RoomSnapshot {
    pub fn new(code: String, host: PlayerSlot, max_players: u32, config: RoomConfig) -> Self {
        let host_id = host.user_id;
        let mut room = Self {
            code,
            host_id,
            max_players,
            players: vec![PlayerSlot { is_host: true, ..host }],
            config,
            status: RoomStatus::Open,
            countdown: None,
            matches: Vec::new(),
        };
        room.refresh_status();
        room
    }

    pub fn player(&self, user_id: UserId) -> Option<&PlayerSlot> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() as u32 >= self.max_players
    }

    /// Every slot is filled and every occupant is ready.
    pub fn all_ready(&self) -> bool {
        self.is_full() && self.players.iter().all(|p| p.ready)
    }

    pub fn in_session(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            host_name: self
                .player(self.host_id)
                .map(|p| p.display_name.clone())
                .unwrap_or_default(),
            players: self.players.len() as u32,
            max_players: self.max_players,
            status: self.status,
        }
    }

    /// Re-derives `Open`/`Full` unless the room is starting, in session, or closed.
    pub fn refresh_status(&mut self) {
        if self.status == RoomStatus::Closed {
            return;
        }
        if self.status == RoomStatus::Starting && (self.countdown.is_some() || self.in_session()) {
            return;
        }
        self.status = if self.is_full() {
            RoomStatus::Full
        } else {
            RoomStatus::Open
        };
    }

    pub fn add_player(&mut self, slot: PlayerSlot) -> bool {
        if self.player(slot.user_id).is_some() {
            return false;
        }
        self.players.push(slot);
        self.refresh_status();
        true
    }

    /// Returns `(removed, new_host)`; closes the room when the last player leaves.
    pub fn remove_player(&mut self, user_id: UserId) -> (bool, Option<UserId>) {
        let result = remove_slot(&mut self.players, &mut self.host_id, user_id);
        if result.0 {
            if self.players.is_empty() {
                self.status = RoomStatus::Closed;
                self.countdown = None;
            } else {
                self.refresh_status();
            }
        }
        result
    }

    pub fn set_ready(&mut self, user_id: UserId, ready: bool) -> bool {
        match self.players.iter_mut().find(|p| p.user_id == user_id) {
            Some(p) if p.ready != ready => {
                p.ready = ready;
                true
            }
            _ => false,
        }
    }

    pub fn set_host(&mut self, user_id: UserId) -> bool {
        if assign_host(&mut self.players, user_id) {
            self.host_id = user_id;
            true
        } else {
            false
        }
    }

    pub fn mark_starting(&mut self) {
        if self.status != RoomStatus::Closed {
            self.status = RoomStatus::Starting;
        }
    }

    pub fn start_countdown(&mut self, countdown: Countdown) {
        self.countdown = Some(countdown);
    }

    pub fn cancel_countdown(&mut self, key: &str) -> bool {
        if self.countdown.as_ref().map(|c| c.key.as_str()) != Some(key) {
            return false;
        }
        self.countdown = None;
        self.refresh_status();
        true
    }

    /// Records a freshly opened session, creating its match record.
    pub fn session_started(
        &mut self,
        match_id: MatchId,
        session_id: SessionId,
        participants: &[Participant; 2],
    ) -> bool {
        self.countdown = None;
        self.mark_starting();
        if find_match(&mut self.matches, match_id).is_none() {
            self.matches.push(Match::new(
                match_id,
                Slot::Player(participants[0].user_id),
                Slot::Player(participants[1].user_id),
            ));
        }
        match find_match(&mut self.matches, match_id) {
            Some(m) if m.session_id.is_none() => {
                m.session_id = Some(session_id);
                m.advance(MatchState::Waiting);
                true
            }
            _ => false,
        }
    }

    pub fn session_progress(&mut self, match_id: MatchId, state: MatchState, scores: [u32; 2]) -> bool {
        find_match(&mut self.matches, match_id).is_some_and(|m| m.progress(state, scores))
    }

    pub fn complete_match(&mut self, match_id: MatchId, scores: [u32; 2], winner: Slot) -> bool {
        let changed = find_match(&mut self.matches, match_id).is_some_and(|m| m.complete(scores, winner));
        if changed {
            self.close_if_done();
        }
        changed
    }

    pub fn forfeit_match(&mut self, match_id: MatchId, forfeiter: UserId, winner: Slot) -> bool {
        let changed =
            find_match(&mut self.matches, match_id).is_some_and(|m| m.forfeit(forfeiter, winner));
        if changed {
            self.close_if_done();
        }
        changed
    }

    pub fn all_matches_finished(&self) -> bool {
        self.in_session() && self.matches.iter().all(Match::is_finished)
    }

    fn close_if_done(&mut self) {
        if self.all_matches_finished() {
            self.status = RoomStatus::Closed;
        }
    }
}

/// Listing entry for the "open rooms" read endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub code: String,
    pub host_name: String,
    pub players: u32,
    pub max_players: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TournamentStatus {
    Idle,
    Waiting,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentSnapshot {
    pub id: TournamentId,
    pub name: String,
    pub host_id: UserId,
    pub capacity: u32,
    pub players: Vec<PlayerSlot>,
    pub bracket: Option<Bracket>,
    pub matches: Vec<Match>,
    pub current_round: u32,
    pub status: TournamentStatus,
    pub winner: Option<UserId>,
    pub countdown: Option<Countdown>,
}

impl TournamentSnapshot {
    pub fn new(id: TournamentId, name: String, host: PlayerSlot, capacity: u32) -> Self {
        let host_id = host.user_id;
        Self {
            id,
            name,
            host_id,
            capacity,
            players: vec![PlayerSlot { is_host: true, ..host }],
            bracket: None,
            matches: Vec::new(),
            current_round: 0,
            status: TournamentStatus::Waiting,
            winner: None,
            countdown: None,
        }
    }

    pub fn player(&self, user_id: UserId) -> Option<&PlayerSlot> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() as u32 >= self.capacity
    }

    pub fn all_ready(&self) -> bool {
        self.is_full() && self.players.iter().all(|p| p.ready)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, TournamentStatus::Idle | TournamentStatus::Waiting)
    }

    pub fn match_by_id(&self, match_id: MatchId) -> Option<&Match> {
        self.matches.iter().find(|m| m.match_id == match_id)
    }

    pub fn round_matches(&self, round: u32) -> impl Iterator<Item = &Match> {
        self.matches.iter().filter(move |m| m.match_id.round == round)
    }

    pub fn round_complete(&self, round: u32) -> bool {
        let mut any = false;
        for m in self.round_matches(round) {
            if !m.is_finished() {
                return false;
            }
            any = true;
        }
        any
    }

    /// The unfinished match of the current round `user_id` plays in, if any.
    pub fn active_match_of(&self, user_id: UserId) -> Option<&Match> {
        self.round_matches(self.current_round)
            .find(|m| !m.is_finished() && m.involves(user_id))
    }

    fn refresh_status(&mut self) {
        if self.is_open() {
            self.status = if self.players.is_empty() {
                TournamentStatus::Idle
            } else {
                TournamentStatus::Waiting
            };
        }
    }

    /// Registers a slot. The first player into an empty lobby becomes host.
    pub fn add_player(&mut self, mut slot: PlayerSlot) -> bool {
        if self.player(slot.user_id).is_some() {
            return false;
        }
        slot.is_host = self.players.is_empty();
        if slot.is_host {
            self.host_id = slot.user_id;
        }
        self.players.push(slot);
        self.refresh_status();
        true
    }

    pub fn remove_player(&mut self, user_id: UserId) -> (bool, Option<UserId>) {
        let result = remove_slot(&mut self.players, &mut self.host_id, user_id);
        if result.0 {
            self.refresh_status();
        }
        result
    }

    pub fn set_ready(&mut self, user_id: UserId, ready: bool) -> bool {
        match self.players.iter_mut().find(|p| p.user_id == user_id) {
            Some(p) if p.ready != ready => {
                p.ready = ready;
                true
            }
            _ => false,
        }
    }

    pub fn set_host(&mut self, user_id: UserId) -> bool {
        if assign_host(&mut self.players, user_id) {
            self.host_id = user_id;
            true
        } else {
            false
        }
    }

    pub fn start_countdown(&mut self, countdown: Countdown) {
        self.countdown = Some(countdown);
    }

    pub fn cancel_countdown(&mut self, key: &str) -> bool {
        if self.countdown.as_ref().map(|c| c.key.as_str()) == Some(key) {
            self.countdown = None;
            true
        } else {
            false
        }
    }

    pub fn bracket_generated(&mut self, bracket: Bracket, matches: Vec<Match>) {
        self.bracket = Some(bracket);
        self.matches = matches;
        self.current_round = 0;
        self.countdown = None;
        self.status = TournamentStatus::InProgress;
    }

    pub fn session_started(&mut self, match_id: MatchId, session_id: SessionId) -> bool {
        match find_match(&mut self.matches, match_id) {
            Some(m) if m.session_id.is_none() && !m.is_finished() => {
                m.session_id = Some(session_id);
                m.advance(MatchState::Waiting);
                true
            }
            _ => false,
        }
    }

    pub fn session_progress(&mut self, match_id: MatchId, state: MatchState, scores: [u32; 2]) -> bool {
        find_match(&mut self.matches, match_id).is_some_and(|m| m.progress(state, scores))
    }

    pub fn complete_match(&mut self, match_id: MatchId, scores: [u32; 2], winner: Slot) -> bool {
        find_match(&mut self.matches, match_id).is_some_and(|m| m.complete(scores, winner))
    }

    pub fn forfeit_match(&mut self, match_id: MatchId, forfeiter: UserId, winner: Slot) -> bool {
        find_match(&mut self.matches, match_id).is_some_and(|m| m.forfeit(forfeiter, winner))
    }

    /// Installs round `round`: its slot list and its freshly paired matches.
    pub fn round_advanced(&mut self, round: u32, slots: Vec<Slot>, matches: Vec<Match>) -> bool {
        let Some(bracket) = self.bracket.as_mut() else {
            return false;
        };
        if round <= self.current_round || !bracket.install_round(round as usize, slots) {
            return false;
        }
        self.matches.retain(|m| m.match_id.round != round);
        self.matches.extend(matches);
        self.current_round = round;
        self.countdown = None;
        true
    }

    pub fn finish(&mut self, winner: UserId) -> bool {
        if self.status == TournamentStatus::Finished {
            return false;
        }
        if let Some(bracket) = self.bracket.as_mut() {
            bracket.crown(Slot::Player(winner));
        }
        self.status = TournamentStatus::Finished;
        self.winner = Some(winner);
        self.countdown = None;
        true
    }
}
