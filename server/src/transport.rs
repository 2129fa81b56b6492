//! Server side of the UDP transport
//!
//! Maps socket addresses to connection handles, runs the connect/reject
//! handshake through an admission callback, and turns datagrams into
//! [`TransportEvent`]s for the server loop. Handles are the lowest free id
//! starting at 1, so an id is never shared by two open connections and is
//! reused once its connection is gone.

use log::{debug, error, info, warn};
use shared::channel::PeerLink;
use shared::{ConnectionId, Delivery, Frame, LinkSettings, ProtocolError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// What the transport reports to the protocol layer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded-frame payload for an admitted connection
    Received {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
    /// The connection is gone (peer said goodbye or timed out)
    Disconnected { connection: ConnectionId },
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    /// Client-chosen id of the connect attempt this peer was admitted with
    session: u64,
    link: PeerLink,
}

pub struct ServerTransport {
    socket: Arc<UdpSocket>,
    peers: HashMap<ConnectionId, Peer>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    settings: LinkSettings,
}

impl ServerTransport {
    pub async fn bind(addr: &str, settings: LinkSettings) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared handle for the receiver task
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Processes one datagram
    ///
    /// `admit` is the admission policy; it is asked once per new address and
    /// decides whether the connection is accepted before any protocol
    /// message is exchanged.
    pub async fn handle_datagram(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
        mut admit: impl FnMut(ConnectionId) -> Result<(), ProtocolError>,
    ) -> Vec<TransportEvent> {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode datagram from {}: {}", addr, e);
                return Vec::new();
            }
        };

        let known = self.by_addr.get(&addr).copied();
        let mut events = Vec::new();

        match (frame, known) {
            (Frame::Connect { session }, Some(connection)) => {
                let current = self.peers.get(&connection).map(|peer| peer.session);
                if current == Some(session) {
                    // Our Accepted was lost and the client retried
                    self.send_frame(&Frame::Accepted { connection }, addr).await;
                } else {
                    // Same address, new client session: the old one is gone.
                    // The client keeps retrying Connect, and the retry is
                    // admitted once the loop has released the old connection.
                    self.forget(connection);
                    info!(
                        "Connection {} from {} restarted, dropping stale session",
                        connection, addr
                    );
                    events.push(TransportEvent::Disconnected { connection });
                }
            }
            (Frame::Connect { session }, None) => {
                let connection = self.next_free_id();
                match admit(connection) {
                    Ok(()) => {
                        info!("Connection {} accepted from {}", connection, addr);
                        let link = PeerLink::new(self.settings, Instant::now());
                        self.peers.insert(
                            connection,
                            Peer {
                                addr,
                                session,
                                link,
                            },
                        );
                        self.by_addr.insert(addr, connection);
                        self.send_frame(&Frame::Accepted { connection }, addr).await;
                    }
                    Err(e) => {
                        info!("Refusing connection from {}: {}", addr, e);
                        let reason = match e {
                            ProtocolError::ConnectionRejected(reason) => reason,
                            other => other.to_string(),
                        };
                        self.send_frame(&Frame::Rejected { reason }, addr).await;
                    }
                }
            }
            (Frame::Disconnect, Some(connection)) => {
                self.forget(connection);
                info!("Connection {} closed by peer", connection);
                events.push(TransportEvent::Disconnected { connection });
            }
            (frame, Some(connection)) => {
                let Some(peer) = self.peers.get_mut(&connection) else {
                    return events;
                };
                let inbound = peer.link.incoming(frame, Instant::now());
                for reply in inbound.replies {
                    self.send_frame(&reply, addr).await;
                }
                events.extend(
                    inbound
                        .payloads
                        .into_iter()
                        .map(|payload| TransportEvent::Received {
                            connection,
                            payload,
                        }),
                );
            }
            (frame, None) => {
                debug!("Ignoring {:?} from unconnected address {}", frame, addr);
            }
        }

        events
    }

    /// Sends an encoded message to one connection
    pub async fn send(&mut self, connection: ConnectionId, delivery: Delivery, payload: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&connection) else {
            debug!("Dropping payload for closed connection {}", connection);
            return;
        };
        let addr = peer.addr;
        let frame = peer.link.outgoing(delivery, payload, Instant::now());
        self.send_frame(&frame, addr).await;
    }

    /// Re-sends, pings and drops timed-out peers
    pub async fn maintain(&mut self) -> Vec<TransportEvent> {
        let now = Instant::now();

        let timed_out: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.link.is_timed_out(now))
            .map(|(connection, _)| *connection)
            .collect();

        let mut events = Vec::new();
        for connection in timed_out {
            if let Some(peer) = self.forget(connection) {
                warn!("Connection {} from {} timed out", connection, peer.addr);
                self.send_frame(&Frame::Disconnect, peer.addr).await;
            }
            events.push(TransportEvent::Disconnected { connection });
        }

        let mut outgoing = Vec::new();
        for peer in self.peers.values_mut() {
            for frame in peer.link.maintain(now) {
                outgoing.push((frame, peer.addr));
            }
        }
        for (frame, addr) in outgoing {
            self.send_frame(&frame, addr).await;
        }

        events
    }

    /// Says goodbye to every peer
    pub async fn shutdown(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.values().map(|peer| peer.addr).collect();
        for addr in addrs {
            self.send_frame(&Frame::Disconnect, addr).await;
        }
        self.peers.clear();
        self.by_addr.clear();
    }

    pub fn rtt(&self, connection: ConnectionId) -> Option<Duration> {
        self.peers.get(&connection).and_then(|peer| peer.link.rtt())
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Open connection handles in ascending order
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut connections: Vec<ConnectionId> = self.peers.keys().copied().collect();
        connections.sort_unstable();
        connections
    }

    fn next_free_id(&self) -> ConnectionId {
        (1..)
            .find(|id| !self.peers.contains_key(id))
            .unwrap_or(ConnectionId::MAX)
    }

    fn forget(&mut self, connection: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&connection)?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    async fn send_frame(&self, frame: &Frame, addr: SocketAddr) {
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode frame for {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, addr).await {
            error!("Failed to send to {}: {}", addr, e);
        }
    }
}
