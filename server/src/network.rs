//! Server network layer handling UDP communications and connection lifecycles
//!
//! Every datagram carries one bincode-encoded message. The receive task
//! decodes packets and feeds them to the main loop, which performs the
//! connect handshake and heartbeats itself and hands everything else to the
//! orchestrator. Each connection gets a bounded outbox drained by its own
//! forwarder task, so a slow client only ever loses its own messages.

use crate::client_manager::{Client, ClientManager};
use crate::config::ServerConfig;
use crate::engine::RemoteEngine;
use crate::identity::{GuestIdentityProvider, IdentityProvider};
use crate::orchestrator::Orchestrator;
use crate::partition::Caller;
use crate::store::{MemoryStore, Store};
use log::{debug, error, info, warn};
use shared::protocol::{decode, encode, MAX_DATAGRAM_SIZE};
use shared::{ClientId, ClientMessage, Role, ServerMessage, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum NetworkMessage {
    PacketReceived {
        message: ClientMessage,
        addr: SocketAddr,
    },
    ClientTimeout {
        client: Client,
    },
    Shutdown,
}

/// Main server coordinating the transport and the orchestrator
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    orchestrator: Orchestrator,
    identity: Arc<dyn IdentityProvider>,
    engine: Arc<RemoteEngine>,
    config: ServerConfig,

    // Communication channels
    network_tx: mpsc::UnboundedSender<NetworkMessage>,
    network_rx: mpsc::UnboundedReceiver<NetworkMessage>,
}

impl Server {
    /// Binds `addr` with guest identities and an in-memory store.
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let identity = Arc::new(GuestIdentityProvider::new(config.engine_token.clone()));
        Self::with_collaborators(addr, config, identity, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_collaborators(
        addr: &str,
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn Store>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let engine = Arc::new(RemoteEngine::new());
        let orchestrator = Orchestrator::new(config.clone(), engine.clone(), store);
        let (network_tx, network_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            orchestrator,
            identity,
            engine,
            config,
            network_tx,
            network_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sending `NetworkMessage::Shutdown` here stops `run`.
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<NetworkMessage> {
        self.network_tx.clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let network_tx = self.network_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode::<ClientMessage>(&buffer[..len]) {
                        Ok(message) => {
                            if let Err(e) =
                                network_tx.send(NetworkMessage::PacketReceived { message, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that evicts clients whose heartbeats stopped
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let network_tx = self.network_tx.clone();
        let period = self.config.heartbeat_interval;
        let timeout = self.config.heartbeat_timeout();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(timeout)
                };

                for client in timed_out {
                    if let Err(e) = network_tx.send(NetworkMessage::ClientTimeout { client }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains one connection's outbox onto the socket
    fn spawn_forwarder(
        &self,
        client_id: ClientId,
        addr: SocketAddr,
        mut outbox: mpsc::Receiver<ServerMessage>,
    ) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if let Err(e) = Self::send_message_impl(&socket, &message, addr).await {
                    warn!("Failed to send to client {}: {}", client_id, e);
                }
            }
            debug!("Forwarder for client {} stopped", client_id);
        });
    }

    async fn send_message_impl(
        socket: &UdpSocket,
        message: &ServerMessage,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let data = encode(message)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(format!("message of {} bytes exceeds a datagram", data.len()).into());
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Sends outside any outbox, for addresses without a connection
    async fn send_direct(&self, message: ServerMessage, addr: SocketAddr) {
        if let Err(e) = Self::send_message_impl(&self.socket, &message, addr).await {
            error!("Failed to send packet to {}: {}", addr, e);
        }
    }

    /// Releases everything a departed connection held
    fn release(&self, client: Client) {
        if client.identity.role == Role::Engine {
            self.engine.unregister(client.id);
            self.orchestrator.replace_connection(client.id);
        } else {
            self.orchestrator
                .connection_lost(client.id, client.identity.user_id);
        }
    }

    /// Drops an old connection of a user who just connected again
    fn replace(&self, client: Client) {
        info!(
            "User {} reconnected; replacing client {}",
            client.identity.user_id, client.id
        );
        if client.identity.role == Role::Engine {
            self.engine.unregister(client.id);
        }
        self.orchestrator.replace_connection(client.id);
    }

    async fn handle_connect(&mut self, client_version: u32, token: &str, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );

        if client_version != PROTOCOL_VERSION {
            let reason = format!(
                "Unsupported protocol version {} (server speaks {})",
                client_version, PROTOCOL_VERSION
            );
            self.send_direct(ServerMessage::Disconnected { reason }, addr)
                .await;
            return;
        }

        let identity = match self.identity.resolve(token) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejected connect from {}: {}", addr, e);
                let reason = e.to_string();
                self.send_direct(ServerMessage::Disconnected { reason }, addr)
                    .await;
                return;
            }
        };

        // Remove existing connections from this address or for this user
        let (by_addr, by_user) = {
            let clients = self.clients.read().await;
            (
                clients.find_client_by_addr(addr),
                clients.find_client_by_user(identity.user_id),
            )
        };
        if let Some(existing_id) = by_addr {
            let existing = self.clients.write().await.remove_client(existing_id);
            match existing {
                Some(old) if old.identity.user_id == identity.user_id => self.replace(old),
                Some(old) => self.release(old),
                None => {}
            }
        }
        if let Some(existing_id) = by_user.filter(|id| Some(*id) != by_addr) {
            let existing = self.clients.write().await.remove_client(existing_id);
            if let Some(old) = existing {
                self.replace(old);
            }
        }

        let (outbox, outbox_rx) = mpsc::channel(self.config.outbox_capacity);
        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, identity.clone(), outbox.clone())
        };

        match client_id {
            Some(client_id) => {
                self.spawn_forwarder(client_id, addr, outbox_rx);
                let connected = ServerMessage::Connected {
                    client_id,
                    user_id: identity.user_id,
                    display_name: identity.display_name,
                };
                if outbox.try_send(connected).is_err() {
                    warn!("Could not confirm connection of client {}", client_id);
                }
                if identity.role == Role::Engine {
                    let active = self.orchestrator.services().bridge.active_sessions();
                    self.engine.register(client_id, outbox, &active);
                }
            }
            None => {
                let reason = "Server full".to_string();
                self.send_direct(ServerMessage::Disconnected { reason }, addr)
                    .await;
            }
        }
    }

    /// Processes one decoded packet
    async fn handle_packet(&mut self, message: ClientMessage, addr: SocketAddr) {
        if let ClientMessage::Connect {
            client_version,
            token,
        } = message
        {
            self.handle_connect(client_version, &token, addr).await;
            return;
        }

        let client = {
            let mut clients = self.clients.write().await;
            match clients.find_client_by_addr(addr) {
                Some(client_id) => {
                    clients.touch(client_id);
                    clients.get(client_id).cloned()
                }
                None => None,
            }
        };
        let Some(client) = client else {
            debug!("Packet from unknown address {}", addr);
            let reason = "Not connected".to_string();
            self.send_direct(ServerMessage::Disconnected { reason }, addr)
                .await;
            return;
        };

        match message {
            ClientMessage::Heartbeat { timestamp } => {
                if client
                    .outbox
                    .try_send(ServerMessage::HeartbeatAck { timestamp })
                    .is_err()
                {
                    debug!("Heartbeat ack to client {} dropped", client.id);
                }
            }
            ClientMessage::Disconnect => {
                let removed = self.clients.write().await.remove_client(client.id);
                if let Some(removed) = removed {
                    self.release(removed);
                }
            }
            request => {
                let caller = Caller {
                    client_id: client.id,
                    identity: client.identity,
                    outbox: client.outbox,
                };
                self.orchestrator.dispatch(&caller, request);
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        while let Some(message) = self.network_rx.recv().await {
            match message {
                NetworkMessage::PacketReceived { message, addr } => {
                    self.handle_packet(message, addr).await;
                }
                NetworkMessage::ClientTimeout { client } => {
                    info!("Client {} timed out", client.id);
                    self.release(client);
                }
                NetworkMessage::Shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::timeout;

    async fn start_server(config: ServerConfig) -> SocketAddr {
        let mut server = Server::new("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    async fn send(socket: &UdpSocket, message: &ClientMessage, server: SocketAddr) {
        socket.send_to(&encode(message).unwrap(), server).await.unwrap();
    }

    async fn recv(socket: &UdpSocket) -> ServerMessage {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("no reply from server")
            .unwrap();
        decode(&buffer[..len]).unwrap()
    }

    #[test]
    fn test_network_message_creation() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let msg = NetworkMessage::PacketReceived {
            message: ClientMessage::Heartbeat { timestamp: 7 },
            addr,
        };

        match msg {
            NetworkMessage::PacketReceived { message, addr: a } => {
                assert_eq!(a, addr);
                assert_eq!(message, ClientMessage::Heartbeat { timestamp: 7 });
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_connect_and_heartbeat() {
        let server = start_server(ServerConfig::default()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(
            &socket,
            &ClientMessage::Connect {
                client_version: PROTOCOL_VERSION,
                token: "alice".into(),
            },
            server,
        )
        .await;
        match recv(&socket).await {
            ServerMessage::Connected { display_name, .. } => assert_eq!(display_name, "alice"),
            other => panic!("Expected Connected, got {:?}", other),
        }

        send(&socket, &ClientMessage::Heartbeat { timestamp: 42 }, server).await;
        assert_eq!(recv(&socket).await, ServerMessage::HeartbeatAck { timestamp: 42 });
    }

    #[tokio::test]
    async fn test_rejects_wrong_version_and_unknown_sender() {
        let server = start_server(ServerConfig::default()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(
            &socket,
            &ClientMessage::Connect {
                client_version: PROTOCOL_VERSION + 1,
                token: "bob".into(),
            },
            server,
        )
        .await;
        assert!(matches!(recv(&socket).await, ServerMessage::Disconnected { .. }));

        send(&socket, &ClientMessage::ListRooms, server).await;
        assert_eq!(
            recv(&socket).await,
            ServerMessage::Disconnected {
                reason: "Not connected".into()
            }
        );
    }

    #[tokio::test]
    async fn test_server_full() {
        let config = ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        };
        let server = start_server(config).await;

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = |token: &str| ClientMessage::Connect {
            client_version: PROTOCOL_VERSION,
            token: token.to_string(),
        };
        send(&first, &connect("one"), server).await;
        assert!(matches!(recv(&first).await, ServerMessage::Connected { .. }));

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send(&second, &connect("two"), server).await;
        assert_eq!(
            recv(&second).await,
            ServerMessage::Disconnected {
                reason: "Server full".into()
            }
        );
    }
}
