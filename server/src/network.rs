//! Server loop coordinating the UDP transport and the session state machine

use crate::config::ServerConfig;
use crate::session::ServerSession;
use crate::transport::{ServerTransport, TransportEvent};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from network tasks (or a controlling task) to the server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8>, addr: SocketAddr },
    Shutdown,
}

/// Main server coordinating networking and the replication session
pub struct Server {
    transport: ServerTransport,
    session: ServerSession,
    config: ServerConfig,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, BoxError> {
        let transport = ServerTransport::bind(&config.bind_address, config.link).await?;
        let session = ServerSession::from_config(&config);
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            transport,
            session,
            config,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Sender for controlling the loop from outside, e.g. to shut it down
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = self.transport.socket();
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; shared::transport::MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if server_tx
                            .send(ServerMessage::DatagramReceived { data, addr })
                            .is_err()
                        {
                            // Loop is gone
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn handle_datagram(&mut self, data: Vec<u8>, addr: SocketAddr) {
        let session = &mut self.session;
        let events = self
            .transport
            .handle_datagram(&data, addr, |connection| {
                session.admit_connection(connection)
            })
            .await;

        self.apply_events(events);
        self.flush_outbox().await;
    }

    fn apply_events(&mut self, events: Vec<TransportEvent>) {
        for event in events {
            match event {
                TransportEvent::Received {
                    connection,
                    payload,
                } => self.session.handle_message(connection, &payload),
                TransportEvent::Disconnected { connection } => {
                    self.session.handle_disconnect(connection)
                }
            }
        }
    }

    /// Sends everything the session queued, each with its kind's delivery mode
    async fn flush_outbox(&mut self) {
        for outgoing in self.session.drain_outbox() {
            let delivery = outgoing.delivery();
            match outgoing.message.encode() {
                Ok(payload) => {
                    self.transport
                        .send(outgoing.connection, delivery, payload)
                        .await
                }
                Err(e) => warn!(
                    "Dropping {} for connection {}: {}",
                    outgoing.message.kind(),
                    outgoing.connection,
                    e
                ),
            }
        }
    }

    /// `connection:millis` for every open connection, `-` where no pong arrived yet
    fn latency_summary(&self) -> String {
        self.transport
            .connections()
            .into_iter()
            .map(|connection| match self.transport.rtt(connection) {
                Some(rtt) => format!("{}:{}ms", connection, rtt.as_millis()),
                None => format!("{}:-", connection),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), BoxError> {
        self.spawn_network_receiver();

        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance_interval = interval(self.config.maintenance_interval());
        maintenance_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Server started: {}Hz, max {} connections, spawn at ({}, {})",
            self.config.tick_rate,
            self.config.max_connections,
            self.config.spawn_position.x,
            self.config.spawn_position.y
        );

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { data, addr }) => {
                            self.handle_datagram(data, addr).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Broadcast one snapshot per tick
                _ = tick_interval.tick() => {
                    self.session.broadcast_tick();
                    self.flush_outbox().await;

                    // Periodic monitoring
                    if self.session.tick() % 60 == 0 && self.session.connection_count() > 0 {
                        debug!(
                            "Tick {}: {} connections, {} joined, rtt [{}]",
                            self.session.tick(),
                            self.session.connection_count(),
                            self.session.active_count(),
                            self.latency_summary()
                        );
                    }
                },

                // Resends, pings and timeouts
                _ = maintenance_interval.tick() => {
                    let events = self.transport.maintain().await;
                    self.apply_events(events);
                    self.flush_outbox().await;
                },
            }
        }

        self.transport.shutdown().await;
        Ok(())
    }
}
