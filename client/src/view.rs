//! Hooks into whatever renders the session
//!
//! The client session never reaches into a scene graph. It calls a
//! [`ViewSink`] when the local participant spawns and when remote
//! participants appear, move or leave, and keeps the handle the sink gave
//! back for each remote id.

use log::info;
use shared::{ClientIdentity, PlayerState, Vec2};

pub trait ViewSink {
    /// Whatever the view uses to find a remote participant's representation again
    type Handle;

    /// The server accepted our join; `state` carries our id and spawn position
    fn local_joined(&mut self, state: &PlayerState);

    fn spawn_remote(&mut self, identity: &ClientIdentity) -> Self::Handle;

    fn move_remote(&mut self, handle: &mut Self::Handle, position: Vec2);

    fn despawn_remote(&mut self, handle: Self::Handle);
}

/// Headless view that only logs, used by the command-line client
#[derive(Debug, Default)]
pub struct LogView {
    moves: u64,
}

impl LogView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote position changes applied so far
    pub fn moves(&self) -> u64 {
        self.moves
    }
}

impl ViewSink for LogView {
    type Handle = String;

    fn local_joined(&mut self, state: &PlayerState) {
        info!(
            "Joined as participant {} at ({:.1}, {:.1})",
            state.id, state.position.x, state.position.y
        );
    }

    fn spawn_remote(&mut self, identity: &ClientIdentity) -> String {
        info!(
            "Player '{}' (pid: {}) joined the game",
            identity.username,
            identity.id()
        );
        identity.username.clone()
    }

    fn move_remote(&mut self, _handle: &mut String, _position: Vec2) {
        self.moves += 1;
    }

    fn despawn_remote(&mut self, handle: String) {
        info!("Player '{}' left the game", handle);
    }
}
