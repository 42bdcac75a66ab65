//! Live partitions and the topics each user belongs to.

use crate::error::{OrchestratorError, Result};
use crate::partition::{Mailbox, PartitionMessage};
use dashmap::DashMap;
use shared::{Topic, TournamentId, UserId};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct PartitionHandle {
    topic: Topic,
    mailbox: Mailbox,
}

impl PartitionHandle {
    pub fn new(topic: Topic, mailbox: Mailbox) -> Self {
        Self { topic, mailbox }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn send(&self, message: PartitionMessage) -> Result<()> {
        self.mailbox
            .send(message)
            .map_err(|_| OrchestratorError::NotFound(self.topic.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    pub(crate) rooms: DashMap<String, PartitionHandle>,
    pub(crate) tournaments: DashMap<TournamentId, PartitionHandle>,
    memberships: DashMap<UserId, BTreeSet<Topic>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &Topic) -> Option<PartitionHandle> {
        match topic {
            Topic::Room(code) => self.rooms.get(code).map(|h| h.clone()),
            Topic::Tournament(id) => self.tournaments.get(id).map(|h| h.clone()),
        }
    }

    pub fn lookup(&self, topic: &Topic) -> Result<PartitionHandle> {
        self.get(topic)
            .ok_or_else(|| OrchestratorError::NotFound(topic.to_string()))
    }

    /// Drops the partition and every membership pointing at it.
    pub fn unregister(&self, topic: &Topic) {
        match topic {
            Topic::Room(code) => {
                self.rooms.remove(code);
            }
            Topic::Tournament(id) => {
                self.tournaments.remove(id);
            }
        }
        self.memberships.retain(|_, topics| {
            topics.remove(topic);
            !topics.is_empty()
        });
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn tournament_count(&self) -> usize {
        self.tournaments.len()
    }

    pub fn add_member(&self, user_id: UserId, topic: &Topic) {
        self.memberships
            .entry(user_id)
            .or_default()
            .insert(topic.clone());
    }

    pub fn remove_member(&self, user_id: UserId, topic: &Topic) {
        if let Some(mut topics) = self.memberships.get_mut(&user_id) {
            topics.remove(topic);
        }
        self.memberships.remove_if(&user_id, |_, topics| topics.is_empty());
    }

    /// Rooms and tournaments `user_id` currently holds a slot in.
    pub fn memberships_of(&self, user_id: UserId) -> Vec<Topic> {
        self.memberships
            .get(&user_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }
}
