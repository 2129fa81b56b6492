//! Client configuration inputs

use shared::transport::DEFAULT_PORT;
use shared::LinkSettings;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ip:port` of the server
    pub server_address: String,
    /// Display name sent with the join request
    pub username: String,
    /// Position updates per second
    pub tick_rate: u32,
    /// Also bounds how long the connect handshake may take
    pub link: LinkSettings,
}

impl ClientConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    pub fn maintenance_interval(&self) -> Duration {
        (self.link.resend_interval / 2).max(Duration::from_millis(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            username: "Player 1".to_string(),
            tick_rate: 60,
            link: LinkSettings::default(),
        }
    }
}
