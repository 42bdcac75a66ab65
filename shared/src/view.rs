//! Client-side replica of subscribed topics.
//!
//! Live events and resync replays go through the same `apply_envelope` path.
//! Envelopes at or below a topic's last applied sequence number are skipped,
//! which makes duplicated datagrams and overlapping replays harmless. An
//! incremental envelope that does not directly follow the last applied one is
//! refused, so `last_seq` only ever covers a contiguous prefix and a later
//! replay can fill the hole. Snapshots are applied across a gap.

use crate::model::{RoomSnapshot, TournamentId, TournamentSnapshot};
use crate::protocol::{Envelope, ServerEvent, ServerMessage, Topic};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TopicState {
    #[default]
    Empty,
    Room(RoomSnapshot),
    Tournament(TournamentSnapshot),
}

/// Outcome of offering one envelope to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Already applied.
    Stale,
    /// An earlier envelope is missing; the topic needs a resync.
    Gap,
}

impl Applied {
    pub fn changed(self) -> bool {
        self == Applied::Changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicView {
    pub last_seq: u64,
    pub state: TopicState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientView {
    topics: BTreeMap<Topic, TopicView>,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a server message if it carries topic events.
    /// Returns true if any state changed.
    pub fn apply_message(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Event { topic, envelope } => {
                self.apply_envelope(topic, envelope).changed()
            }
            ServerMessage::Resync { topic, events } => self.apply_resync(topic, events) > 0,
            _ => false,
        }
    }

    pub fn apply_resync(&mut self, topic: &Topic, events: &[Envelope]) -> usize {
        events
            .iter()
            .filter(|envelope| self.apply_envelope(topic, envelope).changed())
            .count()
    }

    pub fn apply_envelope(&mut self, topic: &Topic, envelope: &Envelope) -> Applied {
        let view = self.topics.entry(topic.clone()).or_default();
        if envelope.seq <= view.last_seq {
            return Applied::Stale;
        }
        if envelope.seq != view.last_seq + 1 && !envelope.event.is_snapshot() {
            return Applied::Gap;
        }
        view.last_seq = envelope.seq;
        if apply_event(&mut view.state, &envelope.event) {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    pub fn topic(&self, topic: &Topic) -> Option<&TopicView> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.keys()
    }

    pub fn forget(&mut self, topic: &Topic) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn room(&self, code: &str) -> Option<&RoomSnapshot> {
        match self.topics.get(&Topic::Room(code.to_string())).map(|v| &v.state) {
            Some(TopicState::Room(room)) => Some(room),
            _ => None,
        }
    }

    pub fn tournament(&self, id: TournamentId) -> Option<&TournamentSnapshot> {
        match self.topics.get(&Topic::Tournament(id)).map(|v| &v.state) {
            Some(TopicState::Tournament(t)) => Some(t),
            _ => None,
        }
    }
}

/// The single per-type event handler. Returns true if the state changed.
pub fn apply_event(state: &mut TopicState, event: &ServerEvent) -> bool {
    match event {
        ServerEvent::RoomState(snapshot) => {
            *state = TopicState::Room(snapshot.clone());
            true
        }
        ServerEvent::TournamentState(snapshot) => {
            *state = TopicState::Tournament(snapshot.clone());
            true
        }
        ServerEvent::PlayerJoined { slot } => match state {
            TopicState::Room(room) => room.add_player(slot.clone()),
            TopicState::Tournament(t) => t.add_player(slot.clone()),
            TopicState::Empty => false,
        },
        ServerEvent::PlayerLeft { user_id } => match state {
            TopicState::Room(room) => room.remove_player(*user_id).0,
            TopicState::Tournament(t) => t.remove_player(*user_id).0,
            TopicState::Empty => false,
        },
        ServerEvent::ReadyChanged { user_id, ready } => match state {
            TopicState::Room(room) => room.set_ready(*user_id, *ready),
            TopicState::Tournament(t) => t.set_ready(*user_id, *ready),
            TopicState::Empty => false,
        },
        ServerEvent::HostChanged { user_id } => match state {
            TopicState::Room(room) => room.set_host(*user_id),
            TopicState::Tournament(t) => t.set_host(*user_id),
            TopicState::Empty => false,
        },
        ServerEvent::ConfigChanged { config } => match state {
            TopicState::Room(room) => {
                room.config = config.clone();
                true
            }
            _ => false,
        },
        ServerEvent::AllReady => match state {
            TopicState::Room(room) => {
                room.mark_starting();
                true
            }
            _ => false,
        },
        ServerEvent::CountdownStarted { countdown } => match state {
            TopicState::Room(room) => {
                room.start_countdown(countdown.clone());
                true
            }
            TopicState::Tournament(t) => {
                t.start_countdown(countdown.clone());
                true
            }
            TopicState::Empty => false,
        },
        ServerEvent::CountdownCancelled { key } => match state {
            TopicState::Room(room) => room.cancel_countdown(key),
            TopicState::Tournament(t) => t.cancel_countdown(key),
            TopicState::Empty => false,
        },
        ServerEvent::SessionStarted {
            match_id,
            session_id,
            participants,
        } => match state {
            TopicState::Room(room) => room.session_started(*match_id, *session_id, participants),
            TopicState::Tournament(t) => t.session_started(*match_id, *session_id),
            TopicState::Empty => false,
        },
        ServerEvent::SessionProgress {
            match_id,
            state: match_state,
            scores,
        } => match state {
            TopicState::Room(room) => room.session_progress(*match_id, *match_state, *scores),
            TopicState::Tournament(t) => t.session_progress(*match_id, *match_state, *scores),
            TopicState::Empty => false,
        },
        ServerEvent::SessionFinished {
            match_id,
            scores,
            winner,
        }
        | ServerEvent::BracketMatchCompleted {
            match_id,
            scores,
            winner,
        } => match state {
            TopicState::Room(room) => room.complete_match(*match_id, *scores, *winner),
            TopicState::Tournament(t) => t.complete_match(*match_id, *scores, *winner),
            TopicState::Empty => false,
        },
        ServerEvent::BracketGenerated { bracket, matches } => match state {
            TopicState::Tournament(t) => {
                t.bracket_generated(bracket.clone(), matches.clone());
                true
            }
            _ => false,
        },
        ServerEvent::BracketRoundAdvanced {
            round,
            slots,
            matches,
        } => match state {
            TopicState::Tournament(t) => t.round_advanced(*round, slots.clone(), matches.clone()),
            _ => false,
        },
        ServerEvent::BracketTournamentFinished { winner } => match state {
            TopicState::Tournament(t) => t.finish(*winner),
            _ => false,
        },
        ServerEvent::ForfeitWin {
            match_id,
            winner,
            forfeiter,
        } => match state {
            TopicState::Room(room) => room.forfeit_match(*match_id, *forfeiter, *winner),
            TopicState::Tournament(t) => t.forfeit_match(*match_id, *forfeiter, *winner),
            TopicState::Empty => false,
        },
    }
}
