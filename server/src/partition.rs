//! Per-room and per-tournament actors.
//!
//! Each partition owns its state exclusively and drains a single mailbox, so
//! mutations of one room or tournament are strictly ordered while different
//! partitions run in parallel. Timer callbacks do not touch state; they post
//! `TimerElapsed` back into the owning mailbox.

use crate::config::ServerConfig;
use crate::engine::GameEngine;
use crate::error::Result;
use crate::guard::IdempotencyGuard;
use crate::hub::{Hub, Outbox};
use crate::registry::Registry;
use crate::session::SessionBridge;
use crate::store::Store;
use crate::timer::{TimerKey, TimerScheduler};
use log::{debug, info, warn};
use shared::{
    ClientId, Identity, MatchId, MatchState, RoomConfig, ServerMessage, SessionId, Topic, UserId,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Mailbox = mpsc::UnboundedSender<PartitionMessage>;

/// Everything a partition needs besides its own state.
pub struct Services {
    pub config: ServerConfig,
    pub hub: Hub,
    pub guard: IdempotencyGuard,
    pub timers: TimerScheduler,
    pub bridge: SessionBridge,
    pub registry: Registry,
    pub engine: Arc<dyn GameEngine>,
    pub store: Arc<dyn Store>,
}

impl Services {
    pub fn new(config: ServerConfig, engine: Arc<dyn GameEngine>, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            hub: Hub::new(),
            guard: IdempotencyGuard::new(),
            timers: TimerScheduler::new(),
            bridge: SessionBridge::new(),
            registry: Registry::new(),
            engine,
            store,
        }
    }

    /// Starts `key` so that it elapses inside the partition behind `mailbox`.
    pub fn schedule(&self, mailbox: &Mailbox, key: TimerKey, expires_at_ms: u64) {
        let mailbox = mailbox.clone();
        let elapsed = key.clone();
        self.timers.start_timer_at(key, expires_at_ms, move || {
            let _ = mailbox.send(PartitionMessage::TimerElapsed(elapsed));
        });
    }
}

/// The connection a request came from, with its reply path.
#[derive(Debug, Clone)]
pub struct Caller {
    pub client_id: ClientId,
    pub identity: Identity,
    pub outbox: Outbox,
}

impl Caller {
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub fn reply(&self, message: ServerMessage) {
        if self.outbox.try_send(message).is_err() {
            debug!("Reply to client {} dropped", self.client_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join,
    Leave,
    ToggleReady,
    SetConfig(RoomConfig),
    InviteBot,
    /// Subscribe (or re-subscribe) and receive the replay.
    Resync,
}

#[derive(Debug)]
pub enum PartitionMessage {
    Request {
        caller: Caller,
        request: Request,
    },
    SessionStatus {
        session_id: SessionId,
        match_id: MatchId,
        state: MatchState,
        scores: [u32; 2],
    },
    SessionFinished {
        session_id: SessionId,
        match_id: MatchId,
        scores: [u32; 2],
    },
    ConnectionLost {
        user_id: UserId,
    },
    TimerElapsed(TimerKey),
}

impl PartitionMessage {
    pub fn caller(&self) -> Option<&Caller> {
        match self {
            PartitionMessage::Request { caller, .. } => Some(caller),
            _ => None,
        }
    }
}

pub trait Partition: Send + 'static {
    fn topic(&self) -> Topic;

    fn handle(&mut self, message: PartitionMessage) -> Result<()>;

    fn is_closed(&self) -> bool;
}

pub fn spawn_partition<P: Partition>(
    partition: P,
    inbox: mpsc::UnboundedReceiver<PartitionMessage>,
    services: Arc<Services>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_partition(partition, inbox, services))
}

async fn run_partition<P: Partition>(
    mut partition: P,
    mut inbox: mpsc::UnboundedReceiver<PartitionMessage>,
    services: Arc<Services>,
) {
    let topic = partition.topic();
    info!("Partition {} started", topic);

    while let Some(message) = inbox.recv().await {
        let caller = message.caller().cloned();
        if let Err(e) = partition.handle(message) {
            match (e.payload(), caller) {
                (Some(payload), Some(caller)) => {
                    warn!("{}: rejected request from client {}: {}", topic, caller.client_id, e);
                    caller.reply(ServerMessage::Error(payload));
                }
                _ => debug!("{}: {}", topic, e),
            }
        }
        if partition.is_closed() {
            break;
        }
    }

    services.registry.unregister(&topic);
    services.hub.close_topic(&topic);
    services.guard.forget_topic(&topic);
    info!("Partition {} stopped", topic);
}
