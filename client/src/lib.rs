//! # Replication Client Library
//!
//! Client side of the position replication protocol. The client connects
//! to one server, joins under a display name, reports its own position once
//! per tick and mirrors every other participant through a [`view::ViewSink`].
//!
//! ## Architecture Overview
//!
//! ### Session State Machine
//! [`session::ClientSession`] walks through `Disconnected`, `Connecting`,
//! `AwaitingAccept` and `Joined`. It only reacts to typed calls and queues
//! outgoing messages, so it can be driven by tests without a socket.
//!
//! ### Remote Roster
//! Remote participants are created by `ParticipantJoined`, moved by
//! snapshots and removed by `ParticipantLeft`. Snapshots never create
//! participants; entries for ids the client has not been told about yet are
//! skipped until the join notice arrives.
//!
//! ### No Prediction
//! The local position is whatever the input side last set. The server
//! accepts it as-is and the client never corrects it from snapshots.
//!
//! ## Module Organization
//!
//! - [`session`]: join handshake, roster and position reporting
//! - [`view`]: rendering seam and the headless [`view::LogView`]
//! - [`transport`]: UDP connect handshake and delivery modes
//! - [`network`]: the client loop and its [`network::ClientCommand`]s
//! - [`config`]: configuration inputs
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::{Client, ClientCommand};
//! use client::view::LogView;
//! use shared::Vec2;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ClientConfig {
//!         username: "Alice".to_string(),
//!         ..ClientConfig::default()
//!     };
//!
//!     let (commands, commands_rx) = mpsc::unbounded_channel();
//!     commands.send(ClientCommand::MoveTo(Vec2::new(5.0, 3.0)))?;
//!
//!     let mut client = Client::new(config, LogView::new()).await?;
//!     client.run(commands_rx).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod session;
pub mod transport;
pub mod view;
