//! Connection tracking for the orchestration server
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Connection lifecycle (connect, replace, disconnect, timeout)
//! - The identity each connection resolved to
//! - The outbox every message to that connection goes through
//! - Capacity limits and heartbeat-based liveness
//!
//! Liveness is judged only by packets received. A client that stops sending
//! for longer than the heartbeat timeout is considered gone, whatever the
//! transport believes.

use crate::hub::Outbox;
use log::info;
use shared::{ClientId, Identity, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// A connected client
///
/// Each client maintains:
/// - Connection metadata (ID, address, last activity)
/// - The resolved identity used for every request it sends
/// - A bounded outbox drained by its forwarder task
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: ClientId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Who this connection belongs to
    pub identity: Identity,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Queue of outbound messages for this connection
    pub outbox: Outbox,
}

impl Client {
    /// Creates a new client and marks it as recently active
    pub fn new(id: ClientId, addr: SocketAddr, identity: Identity, outbox: Outbox) -> Self {
        Self {
            id,
            addr,
            identity,
            last_seen: Instant::now(),
            outbox,
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients
///
/// The ClientManager enforces server capacity limits and answers the lookups
/// the network loop needs: by ID, by address, and by user.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<ClientId, Client>,
    /// Next available client ID for new connections
    next_client_id: ClientId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if server is at capacity.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        identity: Identity,
        outbox: Outbox,
    ) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!(
            "Client {} connected from {} as {} (user {})",
            client_id, addr, identity.display_name, identity.user_id
        );
        self.clients
            .insert(client_id, Client::new(client_id, addr, identity, outbox));

        Some(client_id)
    }

    /// Removes a client from the server
    ///
    /// Returns the removed client so callers can release whatever it held,
    /// or None if it was already gone.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&client_id);
        if let Some(client) = &client {
            info!("Client {} disconnected", client.id);
        }
        client
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Finds a client ID by their network address
    ///
    /// Used to associate incoming packets with existing client connections.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Finds the live connection of a user, if any
    pub fn find_client_by_user(&self, user_id: UserId) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, client)| client.identity.user_id == user_id)
            .map(|(id, _)| *id)
    }

    /// Records activity from a client. Returns false for unknown IDs.
    pub fn touch(&mut self, client_id: ClientId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Checks for and removes timed-out clients
    ///
    /// Disconnects clients that haven't sent packets within `timeout` and
    /// returns them so their memberships can be released. This is the path
    /// a vanished client takes; it is the same one an explicit disconnect takes.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Client> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn outbox() -> Outbox {
        mpsc::channel(8).0
    }

    #[test]
    fn test_client_creation() {
        let addr = test_addr();
        let client = Client::new(1, addr, Identity::player(7, "alice"), outbox());

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, addr);
        assert_eq!(client.identity.user_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_timeout() {
        let client = Client::new(1, test_addr(), Identity::player(7, "alice"), outbox());
        assert!(!client.is_timed_out(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        let client_id1 = manager.add_client(test_addr(), Identity::player(1, "a"), outbox());
        assert_eq!(client_id1, Some(1));

        let client_id2 = manager.add_client(test_addr2(), Identity::player(2, "b"), outbox());
        assert!(client_id2.is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        let client_id = manager
            .add_client(test_addr(), Identity::player(1, "a"), outbox())
            .unwrap();

        let removed = manager.remove_client(client_id);
        assert_eq!(removed.map(|c| c.identity.user_id), Some(1));
        assert!(manager.is_empty());
        assert!(manager.remove_client(client_id).is_none());
    }

    #[test]
    fn test_lookups() {
        let mut manager = ClientManager::new(2);
        let client_id1 = manager
            .add_client(test_addr(), Identity::player(10, "a"), outbox())
            .unwrap();
        let client_id2 = manager
            .add_client(test_addr2(), Identity::player(20, "b"), outbox())
            .unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));
        assert_eq!(manager.find_client_by_user(20), Some(client_id2));
        assert_eq!(manager.find_client_by_user(30), None);

        let unknown_addr: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown_addr), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_client_alive() {
        let mut manager = ClientManager::new(2);
        let quiet = manager
            .add_client(test_addr(), Identity::player(1, "a"), outbox())
            .unwrap();
        let chatty = manager
            .add_client(test_addr2(), Identity::player(2, "b"), outbox())
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(manager.touch(chatty));
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = manager.check_timeouts(Duration::from_secs(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, quiet);
        assert_eq!(manager.len(), 1);
        assert!(!manager.touch(quiet));
    }
}
