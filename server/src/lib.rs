//! # Match Orchestration Server Library
//!
//! This library provides the authoritative orchestration service for lobbies,
//! one-off matches and single-elimination tournaments. The game itself runs in
//! an external engine; this server decides who plays whom, when, and what the
//! outcome means, and keeps every connected client's view consistent with it.
//!
//! ## Core Responsibilities
//!
//! ### Room Lifecycle
//! Players create and join rooms, become ready, and once a room is full and
//! ready a countdown hands its slot pairs to the engine as sessions.
//!
//! ### Tournament Brackets
//! Registered players are seeded into a bye-padded bracket. Rounds advance as
//! matches finish, with a countdown between rounds, until a champion is crowned.
//! A player who stays disconnected past the grace window forfeits.
//!
//! ### Consistent Views
//! Every state change is published on a topic as a sequenced event. Clients
//! that (re)subscribe receive a replay of the latest snapshot plus the events
//! after it and fold it through the same reducer they use for live events.
//!
//! ## Architecture Design
//!
//! ### Partition Actors
//! Each room and each tournament is an actor with its own mailbox. Requests,
//! engine reports, lost connections and elapsed timers are all messages, so
//! one partition's state changes are strictly ordered while partitions run in
//! parallel. There is no global lock.
//!
//! ### Exactly-Once Transitions
//! Match results, forfeits and round advances pass through an idempotency
//! guard keyed by entity. Retried or duplicated reports change nothing and
//! publish nothing.
//!
//! ### UDP-Based Communication
//! Clients and engines talk to the server over UDP with one bincode message
//! per datagram. Liveness is judged by heartbeats; a client silent for
//! several intervals takes the same path as an explicit disconnect.
//!
//! ## Module Organization
//!
//! - `network`, `client_manager`: transport, handshakes, heartbeats
//! - `orchestrator`, `registry`, `partition`: routing and the actor runtime
//! - `room`, `tournament`: the two partition kinds
//! - `hub`: topic publish/subscribe with replay
//! - `guard`, `timer`, `session`: idempotency, countdowns, session leases
//! - `engine`, `identity`, `store`: collaborator interfaces
//! - `config`, `error`, `utils`: ambient plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:8080", ServerConfig::default()).await?;
//!
//!     // Runs until a Shutdown message arrives on `server.shutdown_sender()`
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod hub;
pub mod identity;
pub mod network;
pub mod orchestrator;
pub mod partition;
pub mod registry;
pub mod room;
pub mod session;
pub mod store;
pub mod timer;
pub mod tournament;
pub mod utils;
