//! Client loop coordinating the UDP transport and the session state machine

use crate::config::ClientConfig;
use crate::session::ClientSession;
use crate::transport::{ClientEvent, ClientTransport};
use crate::view::ViewSink;
use log::{debug, error, info, warn};
use shared::{ProtocolError, Vec2};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const PING_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Requests from the input side of the client
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    MoveTo(Vec2),
    MoveBy(Vec2),
    Disconnect,
}

pub struct Client<V: ViewSink> {
    transport: ClientTransport,
    session: ClientSession<V>,
    config: ClientConfig,
}

impl<V: ViewSink> Client<V> {
    pub async fn new(config: ClientConfig, view: V) -> Result<Self, BoxError> {
        let transport = ClientTransport::bind(&config.server_address, config.link).await?;
        let session = ClientSession::new(config.username.clone(), view);

        Ok(Client {
            transport,
            session,
            config,
        })
    }

    pub fn session(&self) -> &ClientSession<V> {
        &self.session
    }

    pub fn view(&self) -> &V {
        self.session.view()
    }

    /// Spawns task that forwards every datagram to the loop
    fn spawn_network_receiver(
        &self,
        datagram_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> JoinHandle<()> {
        let socket = self.transport.socket();

        tokio::spawn(async move {
            let mut buffer = [0u8; shared::transport::MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if datagram_tx.send((buffer[..len].to_vec(), addr)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Feeds transport events into the session
    ///
    /// Returns `Some` when the loop has to end with that result.
    fn apply_events(&mut self, events: Vec<ClientEvent>) -> Option<Result<(), BoxError>> {
        for event in events {
            match event {
                ClientEvent::Connected(_) => self.session.handle_connected(),
                ClientEvent::Received(payload) => self.session.handle_message(&payload),
                ClientEvent::Rejected(reason) => {
                    self.session.handle_disconnected();
                    return Some(Err(ProtocolError::ConnectionRejected(reason).into()));
                }
                ClientEvent::Disconnected => {
                    self.session.handle_disconnected();
                    return Some(Ok(()));
                }
            }
        }
        None
    }

    async fn flush_outbox(&mut self) {
        for message in self.session.drain_outbox() {
            match message.encode() {
                Ok(payload) => self.transport.send(message.delivery(), payload).await,
                Err(e) => warn!("Dropping {}: {}", message.kind(), e),
            }
        }
    }

    /// Connects and runs until disconnected
    ///
    /// Dropping every sender of `commands` counts as a disconnect request.
    /// A refused or unanswered connection attempt ends with
    /// [`ProtocolError::ConnectionRejected`].
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Result<(), BoxError> {
        let (datagram_tx, mut datagram_rx) = mpsc::unbounded_channel();
        let receiver = self.spawn_network_receiver(datagram_tx);

        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance_interval = interval(self.config.maintenance_interval());
        maintenance_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_ping_log = Instant::now();

        self.session.connect();
        self.transport.connect().await;

        let result = loop {
            tokio::select! {
                // Handle network events
                Some((data, addr)) = datagram_rx.recv() => {
                    let events = self.transport.handle_datagram(&data, addr).await;
                    if let Some(result) = self.apply_events(events) {
                        break result;
                    }
                    self.flush_outbox().await;
                },

                // Report our position once per tick
                _ = tick_interval.tick() => {
                    if self.session.tick() {
                        self.flush_outbox().await;
                    }
                },

                // Connect retries, resends, pings and timeouts
                _ = maintenance_interval.tick() => {
                    let events = self.transport.maintain().await;
                    if let Some(result) = self.apply_events(events) {
                        break result;
                    }
                    self.flush_outbox().await;

                    if last_ping_log.elapsed() >= PING_LOG_INTERVAL {
                        last_ping_log = Instant::now();
                        if let Some(rtt) = self.transport.rtt() {
                            info!("Ping: {}ms", rtt.as_millis());
                        }
                    }
                },

                command = commands.recv() => {
                    match command {
                        Some(ClientCommand::MoveTo(position)) => self.session.set_position(position),
                        Some(ClientCommand::MoveBy(delta)) => self.session.move_by(delta),
                        Some(ClientCommand::Disconnect) | None => {
                            info!("Disconnecting from server");
                            self.transport.disconnect().await;
                            self.session.handle_disconnected();
                            break Ok(());
                        }
                    }
                },
            }
        };

        receiver.abort();
        debug!("Client loop finished");
        result
    }
}
