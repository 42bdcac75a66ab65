//! Match-to-session binding.
//!
//! A lease ties a running engine session to the match that owns it. Leases
//! are removed exactly once, by `finish` or `abandon`; later reports for the
//! same session find nothing and are absorbed by the caller.

use crate::utils::{generate_session_id, get_timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::info;
use shared::{MatchId, Participant, SessionId, SessionStart, Topic, TournamentId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseOwner {
    Room(String),
    Tournament(TournamentId),
}

impl LeaseOwner {
    pub fn topic(&self) -> Topic {
        match self {
            LeaseOwner::Room(code) => Topic::Room(code.clone()),
            LeaseOwner::Tournament(id) => Topic::Tournament(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: SessionId,
    pub owner: LeaseOwner,
    pub match_id: MatchId,
    pub participants: [Participant; 2],
    pub opened_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionBridge {
    leases: DashMap<SessionId, SessionLease>,
}

impl SessionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh session id and records its lease.
    ///
    /// `participants` is in slot order; side 0 plays the left paddle.
    pub fn open_session(
        &self,
        owner: LeaseOwner,
        match_id: MatchId,
        participants: [Participant; 2],
    ) -> SessionStart {
        loop {
            let session_id = generate_session_id();
            if let Entry::Vacant(slot) = self.leases.entry(session_id) {
                let topic = owner.topic();
                slot.insert(SessionLease {
                    session_id,
                    owner,
                    match_id,
                    participants: participants.clone(),
                    opened_at_ms: get_timestamp(),
                });
                info!(
                    "Session {} opened for {} {} ({} vs {})",
                    session_id,
                    topic,
                    match_id,
                    participants[0].display_name,
                    participants[1].display_name
                );
                return SessionStart {
                    session_id,
                    topic,
                    match_id,
                    participants,
                };
            }
        }
    }

    pub fn lease(&self, session_id: SessionId) -> Option<SessionLease> {
        self.leases.get(&session_id).map(|lease| lease.clone())
    }

    /// Ends a session whose result has been applied.
    pub fn finish(&self, session_id: SessionId) -> Option<SessionLease> {
        let lease = self.leases.remove(&session_id).map(|(_, lease)| lease);
        if let Some(lease) = &lease {
            info!("Session {} finished ({})", session_id, lease.match_id);
        }
        lease
    }

    /// Ends a session without a played result (forfeit or teardown).
    pub fn abandon(&self, session_id: SessionId) -> Option<SessionLease> {
        let lease = self.leases.remove(&session_id).map(|(_, lease)| lease);
        if let Some(lease) = &lease {
            info!("Session {} abandoned ({})", session_id, lease.match_id);
        }
        lease
    }

    pub fn leases_of(&self, owner: &LeaseOwner) -> Vec<SessionId> {
        self.leases
            .iter()
            .filter(|lease| lease.owner == *owner)
            .map(|lease| lease.session_id)
            .collect()
    }

    /// Every running session, oldest first, as it was first handed out.
    pub fn active_sessions(&self) -> Vec<SessionStart> {
        let mut leases: Vec<SessionLease> =
            self.leases.iter().map(|lease| lease.clone()).collect();
        leases.sort_by_key(|lease| (lease.opened_at_ms, lease.session_id));
        leases
            .into_iter()
            .map(|lease| SessionStart {
                session_id: lease.session_id,
                topic: lease.owner.topic(),
                match_id: lease.match_id,
                participants: lease.participants,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PlayerSlot;

    fn pair() -> [Participant; 2] {
        [
            PlayerSlot::new(1, "left").participant(),
            PlayerSlot::new(2, "right").participant(),
        ]
    }

    #[test]
    fn test_open_session_keeps_slot_order() {
        let bridge = SessionBridge::new();
        let start = bridge.open_session(LeaseOwner::Room("ABCDEF".into()), MatchId::new(0, 0), pair());

        assert_eq!(start.topic, Topic::Room("ABCDEF".into()));
        assert_eq!(start.participants[0].user_id, 1);
        assert_eq!(start.participants[1].user_id, 2);
        assert_eq!(bridge.lease(start.session_id).unwrap().match_id, MatchId::new(0, 0));
    }

    #[test]
    fn test_lease_is_released_once() {
        let bridge = SessionBridge::new();
        let start = bridge.open_session(LeaseOwner::Tournament(3), MatchId::new(1, 0), pair());

        assert!(bridge.finish(start.session_id).is_some());
        assert!(bridge.finish(start.session_id).is_none());
        assert!(bridge.abandon(start.session_id).is_none());
        assert_eq!(bridge.active_count(), 0);
    }

    #[test]
    fn test_active_sessions_rebuild_assignments() {
        let bridge = SessionBridge::new();
        let kept = bridge.open_session(LeaseOwner::Room("ABCDEF".into()), MatchId::new(0, 0), pair());
        let done = bridge.open_session(LeaseOwner::Tournament(3), MatchId::new(0, 1), pair());
        bridge.abandon(done.session_id);

        assert_eq!(bridge.active_sessions(), vec![kept]);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let bridge = SessionBridge::new();
        let owner = LeaseOwner::Tournament(1);
        for i in 0..64 {
            bridge.open_session(owner.clone(), MatchId::new(0, i), pair());
        }
        assert_eq!(bridge.leases_of(&owner).len(), 64);
    }
}
