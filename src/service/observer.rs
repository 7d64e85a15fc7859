// ABOUTME: Status reporting seam for connection and audio state changes
// ABOUTME: Includes an observer that writes every report to the log

use crate::peer::{AudioState, ConnectionState, PeerAddress, Role};

/// Receives peer status reports on the service executor
///
/// Calls must not block; they run between state machine transitions.
pub trait StatusObserver: Send {
    /// A peer's connection state changed
    fn on_connection_state(&mut self, role: Role, peer: PeerAddress, state: ConnectionState);

    /// A peer's audio state changed
    fn on_audio_state(&mut self, role: Role, peer: PeerAddress, state: AudioState);

    /// Admission policy turned a peer away
    fn on_connection_rejected(&mut self, _role: Role, _peer: PeerAddress) {}

    /// The active peer for a role changed
    fn on_active_peer_changed(&mut self, _role: Role, _peer: Option<PeerAddress>) {}
}

/// Observer that logs every report
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn on_connection_state(&mut self, role: Role, peer: PeerAddress, state: ConnectionState) {
        log::info!("{} peer {}: connection {:?}", role, peer, state);
    }

    fn on_audio_state(&mut self, role: Role, peer: PeerAddress, state: AudioState) {
        log::info!("{} peer {}: audio {:?}", role, peer, state);
    }

    fn on_connection_rejected(&mut self, role: Role, peer: PeerAddress) {
        log::warn!("{} peer {}: connection rejected", role, peer);
    }

    fn on_active_peer_changed(&mut self, role: Role, peer: Option<PeerAddress>) {
        match peer {
            Some(peer) => log::info!("Active {} peer: {}", role, peer),
            None => log::info!("No active {} peer", role),
        }
    }
}
