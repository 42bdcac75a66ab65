//! Exactly-once application of state transitions.
//!
//! Every entity (a match, or a tournament's round pointer) carries the highest
//! rank applied so far and the logical ids it has already processed. An event
//! below the current rank or with a known id is absorbed; anything else runs
//! its mutation and is recorded. The table is sharded by entity so partitions
//! never contend on a global lock.

use dashmap::DashMap;
use log::debug;
use shared::{MatchId, MatchState, Topic, TournamentId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Match { topic: Topic, match_id: MatchId },
    Round { tournament: TournamentId },
}

impl EntityKey {
    pub fn topic(&self) -> Topic {
        match self {
            EntityKey::Match { topic, .. } => topic.clone(),
            EntityKey::Round { tournament } => Topic::Tournament(*tournament),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedEvent {
    pub entity: EntityKey,
    pub rank: u32,
    pub event_id: String,
}

impl GuardedEvent {
    pub fn new(entity: EntityKey, rank: u32, event_id: impl Into<String>) -> Self {
        Self {
            entity,
            rank,
            event_id: event_id.into(),
        }
    }

    /// The terminal transition of a match: a played result or a forfeit.
    /// Both share one id so only the first of them can apply.
    pub fn match_result(topic: &Topic, match_id: MatchId) -> Self {
        Self::new(
            EntityKey::Match {
                topic: topic.clone(),
                match_id,
            },
            MatchState::Finished.rank(),
            format!("{}:final", match_id),
        )
    }

    pub fn match_progress(
        topic: &Topic,
        match_id: MatchId,
        state: MatchState,
        scores: [u32; 2],
    ) -> Self {
        Self::new(
            EntityKey::Match {
                topic: topic.clone(),
                match_id,
            },
            state.rank(),
            format!("{}:{:?}:{}-{}", match_id, state, scores[0], scores[1]),
        )
    }

    /// Advancing `tournament` into `round`, identified as `tournament·round·matchCount`.
    pub fn round_advance(tournament: TournamentId, round: u32, match_count: usize) -> Self {
        Self::new(
            EntityKey::Round { tournament },
            round,
            format!("{}·{}·{}", tournament, round, match_count),
        )
    }
}

#[derive(Debug, Default)]
struct EntityRecord {
    rank: u32,
    processed: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    entities: DashMap<EntityKey, EntityRecord>,
    absorbed: AtomicU64,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `mutate` unless the event is stale or already processed.
    ///
    /// The entity's shard stays locked while `mutate` runs, so `mutate` must not
    /// call back into the guard.
    pub fn apply<T>(&self, event: &GuardedEvent, mutate: impl FnOnce() -> T) -> Option<T> {
        let mut record = self.entities.entry(event.entity.clone()).or_default();
        if event.rank < record.rank || record.processed.contains(&event.event_id) {
            self.absorbed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Absorbed {} for {:?} (rank {} < {} or already processed)",
                event.event_id, event.entity, event.rank, record.rank
            );
            return None;
        }

        let result = mutate();
        record.rank = event.rank;
        record.processed.insert(event.event_id.clone());
        Some(result)
    }

    pub fn is_processed(&self, entity: &EntityKey, event_id: &str) -> bool {
        self.entities
            .get(entity)
            .is_some_and(|record| record.processed.contains(event_id))
    }

    pub fn rank_of(&self, entity: &EntityKey) -> Option<u32> {
        self.entities.get(entity).map(|record| record.rank)
    }

    pub fn forget(&self, entity: &EntityKey) -> bool {
        self.entities.remove(entity).is_some()
    }

    /// Drops every entity that belongs to `topic`.
    pub fn forget_topic(&self, topic: &Topic) {
        self.entities.retain(|entity, _| entity.topic() != *topic);
    }

    /// Number of events rejected so far.
    pub fn absorbed(&self) -> u64 {
        self.absorbed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn match_key() -> EntityKey {
        EntityKey::Match {
            topic: Topic::Room("ABCDEF".to_string()),
            match_id: MatchId::new(0, 0),
        }
    }

    #[test]
    fn test_duplicate_event_is_noop() {
        let guard = IdempotencyGuard::new();
        let event = GuardedEvent::new(match_key(), 3, "r0m0:final");
        let mut applied = 0;

        assert_eq!(guard.apply(&event, || applied += 1), Some(()));
        assert_eq!(guard.apply(&event, || applied += 1), None);
        assert_eq!(applied, 1);
        assert_eq!(guard.absorbed(), 1);
        assert!(guard.is_processed(&match_key(), "r0m0:final"));
    }

    #[test]
    fn test_stale_rank_is_rejected() {
        let guard = IdempotencyGuard::new();
        guard.apply(&GuardedEvent::new(match_key(), 2, "playing"), || ());
        assert!(guard
            .apply(&GuardedEvent::new(match_key(), 1, "waiting"), || ())
            .is_none());
        assert!(guard
            .apply(&GuardedEvent::new(match_key(), 2, "playing-again"), || ())
            .is_some());
        assert_eq!(guard.rank_of(&match_key()), Some(2));
    }

    #[test]
    fn test_result_and_forfeit_share_one_slot() {
        let guard = IdempotencyGuard::new();
        let topic = Topic::Tournament(1);
        let forfeit = GuardedEvent::match_result(&topic, MatchId::new(0, 1));
        let late_result = GuardedEvent::match_result(&topic, MatchId::new(0, 1));
        let late_progress =
            GuardedEvent::match_progress(&topic, MatchId::new(0, 1), MatchState::Playing, [2, 2]);

        assert!(guard.apply(&forfeit, || ()).is_some());
        assert!(guard.apply(&late_result, || ()).is_none());
        assert!(guard.apply(&late_progress, || ()).is_none());
    }

    #[test]
    fn test_forget_topic_only_drops_its_entities() {
        let guard = IdempotencyGuard::new();
        guard.apply(&GuardedEvent::new(match_key(), 0, "a"), || ());
        guard.apply(
            &GuardedEvent::new(EntityKey::Round { tournament: 4 }, 1, "4.1.2"),
            || (),
        );

        guard.forget_topic(&Topic::Room("ABCDEF".to_string()));
        assert_eq!(guard.len(), 1);
        assert!(guard.is_processed(&EntityKey::Round { tournament: 4 }, "4.1.2"));
    }

    #[test]
    fn test_concurrent_applies_run_once() {
        let guard = Arc::new(IdempotencyGuard::new());
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    let event = GuardedEvent::new(EntityKey::Round { tournament: 1 }, 1, "1.1.4");
                    guard.apply(&event, || counter.fetch_add(1, Ordering::SeqCst));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(guard.absorbed(), 7);
    }
}
