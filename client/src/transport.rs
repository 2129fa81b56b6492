//! Client side of the UDP transport
//!
//! Runs the connect handshake against one server address, wraps outgoing
//! payloads per delivery mode and reports what happened as [`ClientEvent`]s.

use log::{debug, error, info, warn};
use shared::channel::PeerLink;
use shared::{ConnectionId, Delivery, Frame, LinkSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Server accepted the connection and assigned this handle
    Connected(ConnectionId),
    /// Server refused the connection, or never answered
    Rejected(String),
    Disconnected,
    Received(Vec<u8>),
}

#[derive(Debug)]
enum Phase {
    Idle,
    Connecting {
        session: u64,
        started: Instant,
        last_attempt: Instant,
    },
    Connected {
        connection: ConnectionId,
        link: PeerLink,
    },
}

pub struct ClientTransport {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    settings: LinkSettings,
    phase: Phase,
}

impl ClientTransport {
    pub async fn bind(server_addr: &str, settings: LinkSettings) -> std::io::Result<Self> {
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        debug!("Client socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            server_addr,
            settings,
            phase: Phase::Idle,
        })
    }

    /// Shared handle for the receiver task
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Starts the handshake; `maintain` keeps retrying until answered
    pub async fn connect(&mut self) {
        info!("Connecting to server {}...", self.server_addr);
        let now = Instant::now();
        let session = rand::random::<u64>();
        self.phase = Phase::Connecting {
            session,
            started: now,
            last_attempt: now,
        };
        self.send_frame(&Frame::Connect { session }).await;
    }

    pub async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Vec<ClientEvent> {
        if from != self.server_addr {
            debug!("Ignoring datagram from {}", from);
            return Vec::new();
        }

        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode datagram from server: {}", e);
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut events = Vec::new();
        let mut replies = Vec::new();

        let connecting = matches!(self.phase, Phase::Connecting { .. });

        match frame {
            Frame::Accepted { connection } if connecting => {
                info!("Connection accepted (handle {})", connection);
                self.phase = Phase::Connected {
                    connection,
                    link: PeerLink::new(self.settings, now),
                };
                events.push(ClientEvent::Connected(connection));
            }
            Frame::Rejected { reason } if connecting => {
                warn!("Connection rejected: {}", reason);
                self.phase = Phase::Idle;
                events.push(ClientEvent::Rejected(reason));
            }
            Frame::Disconnect if self.is_connected() => {
                info!("Server closed the connection");
                self.phase = Phase::Idle;
                events.push(ClientEvent::Disconnected);
            }
            Frame::Accepted { .. } => {
                // Retried Connect answered twice
            }
            frame => match &mut self.phase {
                Phase::Connected { link, .. } => {
                    let inbound = link.incoming(frame, now);
                    replies = inbound.replies;
                    events.extend(inbound.payloads.into_iter().map(ClientEvent::Received));
                }
                _ => debug!("Ignoring {:?} while not connected", frame),
            },
        }

        for reply in replies {
            self.send_frame(&reply).await;
        }
        events
    }

    /// Sends an encoded message; dropped unless connected
    pub async fn send(&mut self, delivery: Delivery, payload: Vec<u8>) {
        let Phase::Connected { link, .. } = &mut self.phase else {
            debug!("Dropping payload while not connected");
            return;
        };
        let frame = link.outgoing(delivery, payload, Instant::now());
        self.send_frame(&frame).await;
    }

    /// Connect retries, resends, pings and timeout detection
    pub async fn maintain(&mut self) -> Vec<ClientEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut frames = Vec::new();

        let mut next_phase = None;
        match &mut self.phase {
            Phase::Idle => {}
            Phase::Connecting {
                session,
                started,
                last_attempt,
            } => {
                if now.duration_since(*started) >= self.settings.timeout {
                    warn!("No answer from {}", self.server_addr);
                    next_phase = Some(Phase::Idle);
                    events.push(ClientEvent::Rejected(format!(
                        "no answer from {}",
                        self.server_addr
                    )));
                } else if now.duration_since(*last_attempt) >= self.settings.resend_interval {
                    *last_attempt = now;
                    frames.push(Frame::Connect { session: *session });
                }
            }
            Phase::Connected { link, .. } => {
                if link.is_timed_out(now) {
                    warn!("Connection to {} timed out", self.server_addr);
                    next_phase = Some(Phase::Idle);
                    events.push(ClientEvent::Disconnected);
                } else {
                    frames = link.maintain(now);
                }
            }
        }
        if let Some(phase) = next_phase {
            self.phase = phase;
        }

        for frame in frames {
            self.send_frame(&frame).await;
        }
        events
    }

    /// Courtesy goodbye; the server also notices through its timeout
    pub async fn disconnect(&mut self) {
        if let Phase::Connected { .. } = self.phase {
            self.send_frame(&Frame::Disconnect).await;
        }
        self.phase = Phase::Idle;
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match &self.phase {
            Phase::Connected { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub fn rtt(&self) -> Option<Duration> {
        match &self.phase {
            Phase::Connected { link, .. } => link.rtt(),
            _ => None,
        }
    }

    async fn send_frame(&self, frame: &Frame) {
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode frame: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, self.server_addr).await {
            error!("Failed to send to {}: {}", self.server_addr, e);
        }
    }
}
