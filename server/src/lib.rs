//! # Replication Server Library
//!
//! This library provides the authoritative server for the position
//! replication protocol. It tracks where every connected participant is,
//! answers join requests, tells everyone who joined and who left, and
//! broadcasts a consolidated snapshot of all positions once per tick.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Registry
//! The server holds the only writable copy of every participant's state.
//! Clients report their own position; the server stores it and hands copies
//! to everyone else. Reported positions are trusted as-is.
//!
//! ### Connection Management
//! Handles the lifecycle of client connections:
//! - Admission against a maximum connection count before any protocol exchange
//! - Join handshake and participant id assignment
//! - Disconnect and timeout cleanup with exactly one leave notification
//!
//! ### State Broadcasting
//! Every tick the full registry is sent to every joined client on the
//! unreliable channel. Snapshots are self-contained, so a lost or late
//! snapshot is simply superseded by the next one.
//!
//! ## Architecture Design
//!
//! ### Single Control Loop
//! One `tokio::select!` loop owns the session and therefore the registry.
//! Inbound datagrams, tick broadcasts and transport maintenance are handled
//! one after another, so nothing needs a lock.
//!
//! ### State Machine Separate From I/O
//! [`session::ServerSession`] only consumes typed calls and queues outgoing
//! messages. [`transport::ServerTransport`] turns datagrams into those calls
//! and flushes the queue, so the protocol can be tested without sockets.
//!
//! ## Module Organization
//!
//! - [`registry`]: participant id to identity map
//! - [`session`]: per-connection state machine, join/leave fan-out, broadcast
//! - [`transport`]: UDP connection handshake and delivery modes
//! - [`network`]: the server loop
//! - [`config`]: configuration inputs
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig {
//!         bind_address: "0.0.0.0:12345".to_string(),
//!         max_connections: 4,
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod registry;
pub mod session;
pub mod transport;
