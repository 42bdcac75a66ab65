//! The external game engine, as seen by the orchestrator.
//!
//! The orchestrator only hands sessions out; the engine plays them and
//! reports back through `SessionStatus`/`SessionFinished` messages.

use crate::hub::Outbox;
use dashmap::DashMap;
use log::{debug, info, warn};
use shared::{ClientId, ServerMessage, SessionId, SessionStart};
use std::sync::Mutex;

pub trait GameEngine: Send + Sync {
    fn start_session(&self, start: &SessionStart);

    fn abandon_session(&self, _session_id: SessionId) {}
}

/// Forwards sessions to engine processes connected over the wire.
///
/// Sessions opened while no engine is connected keep their lease; they are
/// handed out when the next engine registers.
#[derive(Debug, Default)]
pub struct RemoteEngine {
    engines: DashMap<ClientId, Outbox>,
}

impl RemoteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine connection and assigns it every session in `active`.
    pub fn register(&self, client_id: ClientId, outbox: Outbox, active: &[SessionStart]) {
        info!(
            "Engine connected as client {}; resuming {} session(s)",
            client_id,
            active.len()
        );
        for start in active {
            deliver(
                client_id,
                &outbox,
                ServerMessage::SessionAssigned(start.clone()),
            );
        }
        self.engines.insert(client_id, outbox);
    }

    pub fn unregister(&self, client_id: ClientId) -> bool {
        self.engines.remove(&client_id).is_some()
    }

    pub fn connected(&self) -> usize {
        self.engines.len()
    }

    fn broadcast(&self, message: ServerMessage) {
        for entry in self.engines.iter() {
            deliver(*entry.key(), entry.value(), message.clone());
        }
    }
}

fn deliver(client_id: ClientId, outbox: &Outbox, message: ServerMessage) {
    if let Err(e) = outbox.try_send(message) {
        warn!("Failed to reach engine client {}: {}", client_id, e);
    }
}

impl GameEngine for RemoteEngine {
    fn start_session(&self, start: &SessionStart) {
        if self.engines.is_empty() {
            warn!(
                "No engine connected; session {} waits for one",
                start.session_id
            );
            return;
        }
        self.broadcast(ServerMessage::SessionAssigned(start.clone()));
    }

    fn abandon_session(&self, session_id: SessionId) {
        debug!("Telling engines to drop session {}", session_id);
        self.broadcast(ServerMessage::SessionAbandoned { session_id });
    }
}

/// Keeps every session handed to it. Used to drive the orchestrator in tests.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    started: Mutex<Vec<SessionStart>>,
    abandoned: Mutex<Vec<SessionId>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<SessionStart> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn abandoned(&self) -> Vec<SessionId> {
        self.abandoned.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl GameEngine for RecordingEngine {
    fn start_session(&self, start: &SessionStart) {
        if let Ok(mut started) = self.started.lock() {
            started.push(start.clone());
        }
    }

    fn abandon_session(&self, session_id: SessionId) {
        if let Ok(mut abandoned) = self.abandoned.lock() {
            abandoned.push(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MatchId, PlayerSlot, Topic};
    use tokio::sync::mpsc;

    fn start() -> SessionStart {
        SessionStart {
            session_id: 5,
            topic: Topic::Room("ABCDEF".into()),
            match_id: MatchId::new(0, 0),
            participants: [
                PlayerSlot::new(1, "a").participant(),
                PlayerSlot::new(2, "b").participant(),
            ],
        }
    }

    #[test]
    fn test_remote_engine_forwards_assignment() {
        let engine = RemoteEngine::new();
        let (tx, mut rx) = mpsc::channel(4);
        engine.register(10, tx, &[]);

        engine.start_session(&start());
        match rx.try_recv() {
            Ok(ServerMessage::SessionAssigned(s)) => assert_eq!(s.session_id, 5),
            other => panic!("expected assignment, got {:?}", other),
        }

        assert!(engine.unregister(10));
        assert_eq!(engine.connected(), 0);
    }

    #[test]
    fn test_late_engine_receives_waiting_sessions() {
        let engine = RemoteEngine::new();
        engine.start_session(&start());

        let (tx, mut rx) = mpsc::channel(4);
        engine.register(11, tx, &[start()]);
        match rx.try_recv() {
            Ok(ServerMessage::SessionAssigned(s)) => assert_eq!(s, start()),
            other => panic!("expected assignment, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remote_engine_forwards_abandon() {
        let engine = RemoteEngine::new();
        let (first, mut first_rx) = mpsc::channel(4);
        let (second, mut second_rx) = mpsc::channel(4);
        engine.register(10, first, &[]);
        engine.register(11, second, &[]);

        engine.abandon_session(5);
        for rx in [&mut first_rx, &mut second_rx] {
            assert_eq!(
                rx.try_recv().ok(),
                Some(ServerMessage::SessionAbandoned { session_id: 5 })
            );
        }
    }

    #[test]
    fn test_recording_engine_keeps_history() {
        let engine = RecordingEngine::new();
        engine.start_session(&start());
        engine.abandon_session(5);
        assert_eq!(engine.started().len(), 1);
        assert_eq!(engine.abandoned(), vec![5]);
    }
}
