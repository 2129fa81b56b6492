//! Server configuration inputs
//!
//! The server never loads configuration itself; `main` builds a
//! [`ServerConfig`] from command-line arguments and tests build one directly.

use shared::transport::DEFAULT_PORT;
use shared::{LinkSettings, Vec2};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_address: String,
    /// Snapshot broadcasts per second
    pub tick_rate: u32,
    /// Concurrent connections (pending or joined) before new ones are refused
    pub max_connections: usize,
    /// Where every participant starts
    pub spawn_position: Vec2,
    pub link: LinkSettings,
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    /// How often the transport checks timeouts and re-sends reliable frames
    pub fn maintenance_interval(&self) -> Duration {
        (self.link.resend_interval / 2).max(Duration::from_millis(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            tick_rate: 30,
            max_connections: 8,
            spawn_position: Vec2::ZERO,
            link: LinkSettings::default(),
        }
    }
}
