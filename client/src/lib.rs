//! # Orchestration Client Library
//!
//! A headless command-line client for the match orchestration server. It
//! connects over UDP, heartbeats, and turns stdin commands into room and
//! tournament requests. Every event it receives is folded into a local
//! [`shared::ClientView`], the same reducer used for live events and for
//! resync replays, and logged as it arrives.
//!
//! ## Module Organization
//!
//! - `commands`: parsing of stdin lines into [`commands::Command`]s
//! - `state`: connection state, followed topics and the local view
//! - `network`: the socket loop tying stdin, heartbeats and server packets together
//!
//! ## Reconnection
//!
//! When the server goes quiet for several heartbeat intervals, or answers
//! with `Disconnected`, the client keeps sending `Connect`. Once a new
//! `Connected` arrives it requests a `Resync` for every topic it follows.
//! Replayed envelopes at or below the last applied sequence number are
//! skipped, so the rebuilt view matches one that never dropped.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client =
//!         client::network::Client::new("127.0.0.1:8080", "alice", Duration::from_secs(1)).await?;
//!     client.run().await
//! }
//! ```

pub mod commands;
pub mod network;
pub mod state;
