//! Runtime tunables shared by the network loop and every partition.

use std::time::Duration;

pub const DEFAULT_ENGINE_TOKEN: &str = "engine";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Expected cadence of client heartbeats; also the timeout sweep period.
    pub heartbeat_interval: Duration,
    /// Consecutive silent intervals before a client is evicted.
    pub missed_heartbeats: u32,
    /// How long a disconnected tournament player may stay away from a live match.
    pub forfeit_grace: Duration,
    /// Pre-match countdown once a lobby is full and ready.
    pub countdown: Duration,
    /// Pause between a completed bracket round and the next one.
    pub round_countdown: Duration,
    /// How long a finished tournament stays subscribable before it is released.
    pub finished_linger: Duration,
    pub max_clients: usize,
    /// Messages buffered per connection before new ones are dropped.
    pub outbox_capacity: usize,
    /// Connect token that identifies the game engine.
    pub engine_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            missed_heartbeats: 3,
            forfeit_grace: Duration::from_millis(10_000),
            countdown: Duration::from_millis(3000),
            round_countdown: Duration::from_millis(5000),
            finished_linger: Duration::from_millis(60_000),
            max_clients: 256,
            outbox_capacity: 256,
            engine_token: DEFAULT_ENGINE_TOKEN.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }

    /// True while the well-known engine token is still in place.
    pub fn uses_default_engine_token(&self) -> bool {
        self.engine_token == DEFAULT_ENGINE_TOKEN
    }
}
