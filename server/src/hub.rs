//! Publish/subscribe fabric keyed by topic.
//!
//! Each topic keeps a sequence counter, its latest full-state snapshot and the
//! incremental events published since. Subscribing delivers that replay while
//! the topic's shard is locked, so no live event can overtake it. Delivery
//! never blocks: a full outbox drops the event, a closed one drops the
//! subscriber.

use dashmap::DashMap;
use log::{debug, info, warn};
use shared::{ClientId, Envelope, ServerEvent, ServerMessage, Topic};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Per-connection queue of outbound messages.
pub type Outbox = mpsc::Sender<ServerMessage>;

#[derive(Debug, Default)]
struct TopicState {
    last_seq: u64,
    snapshot: Option<Envelope>,
    tail: Vec<Envelope>,
    subscribers: HashMap<ClientId, Outbox>,
    delivered: u64,
}

impl TopicState {
    fn replay(&self) -> Vec<Envelope> {
        self.snapshot
            .iter()
            .chain(self.tail.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Hub {
    topics: DashMap<Topic, TopicState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the current replay to `outbox` and registers it under `topic`.
    /// Subscribing again replaces the outbox and re-sends the replay.
    ///
    /// Returns the number of replayed events, or `None` if the replay could
    /// not be queued. The client is then left unsubscribed, so it never sees
    /// live events without their base.
    pub fn subscribe(&self, topic: &Topic, client_id: ClientId, outbox: Outbox) -> Option<usize> {
        let mut state = self.topics.entry(topic.clone()).or_default();
        let events = state.replay();
        let count = events.len();
        let message = ServerMessage::Resync {
            topic: topic.clone(),
            events,
        };
        if let Err(e) = outbox.try_send(message) {
            state.subscribers.remove(&client_id);
            match e {
                TrySendError::Full(_) => warn!(
                    "Resync for client {} on {} dropped: outbox full",
                    client_id, topic
                ),
                TrySendError::Closed(_) => {
                    debug!("Client {} gone before subscribing to {}", client_id, topic)
                }
            }
            return None;
        }
        if state.subscribers.insert(client_id, outbox).is_none() {
            debug!("Client {} subscribed to {}", client_id, topic);
        }
        Some(count)
    }

    pub fn unsubscribe(&self, topic: &Topic, client_id: ClientId) -> bool {
        self.topics
            .get_mut(topic)
            .is_some_and(|mut state| state.subscribers.remove(&client_id).is_some())
    }

    /// Removes `client_id` from every topic. Returns the topics it was on.
    pub fn unsubscribe_all(&self, client_id: ClientId) -> Vec<Topic> {
        let mut topics = Vec::new();
        for mut entry in self.topics.iter_mut() {
            if entry.subscribers.remove(&client_id).is_some() {
                topics.push(entry.key().clone());
            }
        }
        topics
    }

    pub fn topics_of(&self, client_id: ClientId) -> Vec<Topic> {
        self.topics
            .iter()
            .filter(|entry| entry.subscribers.contains_key(&client_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stamps `event` with the topic's next sequence number and fans it out.
    pub fn publish(&self, topic: &Topic, event: ServerEvent) -> u64 {
        let mut state = self.topics.entry(topic.clone()).or_default();
        state.last_seq += 1;
        let envelope = Envelope {
            seq: state.last_seq,
            event,
        };
        if envelope.event.is_snapshot() {
            state.snapshot = Some(envelope.clone());
            state.tail.clear();
        } else {
            state.tail.push(envelope.clone());
        }

        let mut closed = Vec::new();
        let mut delivered = 0;
        for (client_id, outbox) in &state.subscribers {
            let message = ServerMessage::Event {
                topic: topic.clone(),
                envelope: envelope.clone(),
            };
            match outbox.try_send(message) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => debug!(
                    "Dropped {} #{} for client {}: outbox full",
                    envelope.event.name(),
                    envelope.seq,
                    client_id
                ),
                Err(TrySendError::Closed(_)) => closed.push(*client_id),
            }
        }
        for client_id in closed {
            state.subscribers.remove(&client_id);
        }
        state.delivered += delivered;
        envelope.seq
    }

    pub fn snapshot(&self, topic: &Topic) -> Option<Envelope> {
        self.topics.get(topic).and_then(|state| state.snapshot.clone())
    }

    /// Snapshot followed by every later event, in publish order.
    pub fn replay(&self, topic: &Topic) -> Vec<Envelope> {
        self.topics
            .get(topic)
            .map(|state| state.replay())
            .unwrap_or_default()
    }

    pub fn close_topic(&self, topic: &Topic) -> bool {
        let closed = self.topics.remove(topic).is_some();
        if closed {
            info!("Topic {} closed", topic);
        }
        closed
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |state| state.subscribers.len())
    }

    /// Events successfully queued to subscribers of `topic` so far.
    pub fn delivered(&self, topic: &Topic) -> u64 {
        self.topics.get(topic).map_or(0, |state| state.delivered)
    }

    pub fn last_seq(&self, topic: &Topic) -> u64 {
        self.topics.get(topic).map_or(0, |state| state.last_seq)
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PlayerSlot, RoomConfig, RoomSnapshot};
    use tokio::sync::mpsc::Receiver;

    fn topic() -> Topic {
        Topic::Room("ABCDEF".to_string())
    }

    fn room_state() -> ServerEvent {
        ServerEvent::RoomState(RoomSnapshot::new(
            "ABCDEF".to_string(),
            PlayerSlot::new(1, "host"),
            2,
            RoomConfig::default(),
        ))
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_subscriber_gets_replay_before_live_events() {
        let hub = Hub::new();
        hub.publish(&topic(), room_state());
        hub.publish(&topic(), ServerEvent::AllReady);

        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(hub.subscribe(&topic(), 1, tx), Some(2));
        hub.publish(&topic(), ServerEvent::PlayerLeft { user_id: 1 });

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ServerMessage::Resync { events, .. } => {
                assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("expected resync, got {:?}", other),
        }
        match &messages[1] {
            ServerMessage::Event { envelope, .. } => assert_eq!(envelope.seq, 3),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_clears_tail() {
        let hub = Hub::new();
        hub.publish(&topic(), room_state());
        hub.publish(&topic(), ServerEvent::AllReady);
        hub.publish(&topic(), room_state());

        let replay = hub.replay(&topic());
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].seq, 3);
        assert_eq!(hub.snapshot(&topic()).map(|e| e.seq), Some(3));
    }

    #[test]
    fn test_full_outbox_drops_without_blocking() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        hub.subscribe(&topic(), 1, tx);

        hub.publish(&topic(), ServerEvent::AllReady);
        hub.publish(&topic(), ServerEvent::AllReady);

        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(hub.delivered(&topic()), 0);
        assert_eq!(hub.subscriber_count(&topic()), 1);
    }

    #[test]
    fn test_full_outbox_is_not_subscribed() {
        let hub = Hub::new();
        hub.publish(&topic(), room_state());
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(ServerMessage::HeartbeatAck { timestamp: 0 })
            .unwrap();

        assert_eq!(hub.subscribe(&topic(), 1, tx), None);
        assert_eq!(hub.subscriber_count(&topic()), 0);

        rx.try_recv().unwrap();
        hub.publish(&topic(), ServerEvent::AllReady);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_failed_resubscribe_drops_old_registration() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        assert_eq!(hub.subscribe(&topic(), 1, tx.clone()), Some(0));
        assert_eq!(hub.subscribe(&topic(), 1, tx), None);
        assert_eq!(hub.subscriber_count(&topic()), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_closed_outbox_is_evicted() {
        let hub = Hub::new();
        let (tx, rx) = mpsc::channel(4);
        hub.subscribe(&topic(), 1, tx);
        drop(rx);

        hub.publish(&topic(), ServerEvent::AllReady);
        assert_eq!(hub.subscriber_count(&topic()), 0);
    }

    #[test]
    fn test_unsubscribe_all_reports_topics() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.subscribe(&topic(), 9, tx.clone());
        hub.subscribe(&Topic::Tournament(2), 9, tx);

        let mut topics = hub.unsubscribe_all(9);
        topics.sort();
        assert_eq!(topics, vec![topic(), Topic::Tournament(2)]);
        assert!(hub.topics_of(9).is_empty());
    }
}
