use crate::commands::{Command, HELP};
use crate::state::{now_ms, ClientState};
use log::{error, info, warn};
use shared::protocol::{decode, encode, MAX_DATAGRAM_SIZE};
use shared::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::{interval, Instant};

/// Heartbeat intervals without an ack before the client reconnects.
const MISSED_ACKS: u32 = 3;

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    heartbeat_interval: Duration,
    last_heard: Instant,
    state: ClientState,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        name: &str,
        heartbeat_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            heartbeat_interval,
            last_heard: Instant::now(),
            state: ClientState::new(name),
        })
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(message)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_all(&self, messages: Vec<ClientMessage>) {
        for message in messages {
            if let Err(e) = self.send_message(&message).await {
                error!("Error sending message: {}", e);
            }
        }
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        self.last_heard = Instant::now();
        let message = self.state.connect_message();
        self.send_message(&message).await
    }

    /// Heartbeats while connected; reconnects when the server has gone quiet.
    async fn heartbeat(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.state.is_connected()
            && self.last_heard.elapsed() > self.heartbeat_interval * MISSED_ACKS
        {
            self.state.connection_lost();
        }

        if self.state.is_connected() {
            self.send_message(&ClientMessage::Heartbeat {
                timestamp: now_ms(),
            })
            .await
        } else {
            self.connect().await
        }
    }

    async fn handle_packet(&mut self, data: &[u8]) {
        match decode::<ServerMessage>(data) {
            Ok(message) => {
                self.last_heard = Instant::now();
                let replies = self.state.handle_message(message);
                self.send_all(replies).await;
            }
            Err(e) => warn!("Malformed packet from server: {}", e),
        }
    }

    /// Returns false when the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                info!("{}", HELP);
                return true;
            }
        };

        match self.state.handle_command(command.clone()) {
            Ok(messages) => self.send_all(messages).await,
            Err(e) => warn!("{}", e),
        }

        match command {
            Command::State => {
                for line in self.state.describe() {
                    println!("{}", line);
                }
                true
            }
            Command::Quit => false,
            _ => true,
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;
        info!("{}", HELP);

        let mut heartbeat_interval = interval(self.heartbeat_interval);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            self.handle_packet(&buffer[..len]).await;
                        }
                        Ok((_, addr)) => warn!("Ignoring packet from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        error!("Error sending heartbeat: {}", e);
                    }
                },

                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if !self.handle_line(&line).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = self.handle_line("quit").await;
                            break;
                        }
                        Err(e) => error!("Error reading stdin: {}", e),
                    }
                },
            }
        }

        Ok(())
    }
}
