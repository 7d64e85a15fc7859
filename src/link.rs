// ABOUTME: Link-layer seam: commands issued to the stack and events it reports back
// ABOUTME: Includes a loopback link layer that confirms every command immediately

use crate::peer::{Initiator, LinkHandle, PeerAddress, PeerEvent, PeerKey, Role, EDR_2MBPS, EDR_3MBPS};
use crate::service::ServiceMessage;
use crate::streaming::CodecConfig;
use crossbeam::channel::Sender;

/// Commands issued to the link layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// Open the media link to a peer
    Open {
        /// Target peer
        peer: PeerAddress,
        /// Local role for the link
        role: Role,
    },
    /// Start streaming
    Start {
        /// Target peer
        peer: PeerAddress,
    },
    /// Stop streaming
    Stop {
        /// Target peer
        peer: PeerAddress,
    },
    /// Suspend streaming
    Suspend {
        /// Target peer
        peer: PeerAddress,
    },
    /// Close the link
    Close {
        /// Target peer
        peer: PeerAddress,
    },
    /// Start the hardware offload path
    OffloadStart {
        /// Target peer
        peer: PeerAddress,
    },
}

impl LinkCommand {
    /// Peer the command targets
    pub fn peer(&self) -> PeerAddress {
        match *self {
            LinkCommand::Open { peer, .. }
            | LinkCommand::Start { peer }
            | LinkCommand::Stop { peer }
            | LinkCommand::Suspend { peer }
            | LinkCommand::Close { peer }
            | LinkCommand::OffloadStart { peer } => peer,
        }
    }
}

/// Events reported by the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Peer registered and assigned a handle
    Registered {
        /// Peer address
        address: PeerAddress,
        /// Assigned handle
        handle: LinkHandle,
        /// Local role for this peer
        role: Role,
    },
    /// Codec negotiation finished
    CodecConfigured {
        /// Peer
        peer: PeerKey,
        /// Negotiated configuration
        config: CodecConfig,
    },
    /// Sink reported its playback delay (1/10 ms)
    DelayReport {
        /// Peer
        peer: PeerKey,
        /// Delay in 1/10 ms
        delay: u16,
    },
    /// Remote peer is connecting
    RemotePending {
        /// Peer address
        address: PeerAddress,
        /// Local role for this peer
        role: Role,
    },
    /// Remote opened signaling but not the media link
    RemoteSignalingOpened {
        /// Peer address
        address: PeerAddress,
        /// Local role for this peer
        role: Role,
    },
    /// Link open finished
    LinkOpened {
        /// Peer
        peer: PeerKey,
        /// Open succeeded
        success: bool,
        /// EDR capability bits
        edr_caps: u8,
    },
    /// Link open rejected
    LinkRejected {
        /// Peer
        peer: PeerKey,
    },
    /// Streaming start finished
    LinkStarted {
        /// Peer
        peer: PeerKey,
        /// Start succeeded
        success: bool,
        /// Link is suspending right away
        suspending: bool,
        /// Who started
        initiator: Initiator,
    },
    /// Streaming suspend finished
    LinkSuspended {
        /// Peer
        peer: PeerKey,
        /// Suspend succeeded
        success: bool,
        /// Who suspended
        initiator: Initiator,
    },
    /// Streaming stop finished
    LinkStopped {
        /// Peer
        peer: PeerKey,
        /// Stop succeeded
        success: bool,
    },
    /// Link closed
    LinkClosed {
        /// Peer
        peer: PeerKey,
    },
    /// ACL link disconnected
    AclDisconnected {
        /// Peer
        peer: PeerKey,
    },
    /// Local ACL link dropped
    LocalAclDropped {
        /// Peer
        peer: PeerKey,
    },
    /// Offload start finished
    OffloadStarted {
        /// Peer
        peer: PeerKey,
        /// Offload started
        success: bool,
    },
}

impl LinkEvent {
    /// State machine event carried by this link event, if any
    pub fn peer_event(&self) -> Option<PeerEvent> {
        let event = match *self {
            LinkEvent::RemotePending { .. } => PeerEvent::RemotePending,
            LinkEvent::RemoteSignalingOpened { .. } => PeerEvent::RemoteSignalingOpened,
            LinkEvent::LinkOpened {
                success, edr_caps, ..
            } => PeerEvent::LinkOpened { success, edr_caps },
            LinkEvent::LinkRejected { .. } => PeerEvent::LinkRejected,
            LinkEvent::LinkStarted {
                success,
                suspending,
                initiator,
                ..
            } => PeerEvent::LinkStarted {
                success,
                suspending,
                initiator,
            },
            LinkEvent::LinkSuspended {
                success, initiator, ..
            } => PeerEvent::LinkSuspended { success, initiator },
            LinkEvent::LinkStopped { success, .. } => PeerEvent::LinkStopped { success },
            LinkEvent::LinkClosed { .. } => PeerEvent::LinkClosed,
            LinkEvent::AclDisconnected { .. } => PeerEvent::AclDisconnected,
            LinkEvent::LocalAclDropped { .. } => PeerEvent::LocalAclDropped,
            LinkEvent::Registered { .. }
            | LinkEvent::CodecConfigured { .. }
            | LinkEvent::DelayReport { .. }
            | LinkEvent::OffloadStarted { .. } => return None,
        };
        Some(event)
    }

    /// Peer the event concerns
    pub fn key(&self) -> PeerKey {
        match *self {
            LinkEvent::Registered { address, .. }
            | LinkEvent::RemotePending { address, .. }
            | LinkEvent::RemoteSignalingOpened { address, .. } => PeerKey::Address(address),
            LinkEvent::CodecConfigured { peer, .. }
            | LinkEvent::DelayReport { peer, .. }
            | LinkEvent::LinkOpened { peer, .. }
            | LinkEvent::LinkRejected { peer }
            | LinkEvent::LinkStarted { peer, .. }
            | LinkEvent::LinkSuspended { peer, .. }
            | LinkEvent::LinkStopped { peer, .. }
            | LinkEvent::LinkClosed { peer }
            | LinkEvent::AclDisconnected { peer }
            | LinkEvent::LocalAclDropped { peer }
            | LinkEvent::OffloadStarted { peer, .. } => peer,
        }
    }
}

/// Trait for link-layer stacks
///
/// `issue` is called on the service executor and must not block; results come
/// back later as [`LinkEvent`]s through an [`EventSender`].
pub trait LinkLayer: Send {
    /// Issue a command
    fn issue(&mut self, command: LinkCommand);
}

/// Handle for delivering link events to the service
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<ServiceMessage>,
}

impl EventSender {
    pub(crate) fn new(tx: Sender<ServiceMessage>) -> Self {
        Self { tx }
    }

    /// Deliver an event; returns false once the service has shut down
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx.send(ServiceMessage::Link(event)).is_ok()
    }
}

/// Link layer that confirms every command with a successful event
pub struct LoopbackLink {
    events: EventSender,
    edr_caps: u8,
    offload: bool,
}

impl LoopbackLink {
    /// Create a loopback link reporting to `events`
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            edr_caps: EDR_2MBPS | EDR_3MBPS,
            offload: false,
        }
    }

    /// EDR capability bits reported on open
    pub fn with_edr_caps(mut self, edr_caps: u8) -> Self {
        self.edr_caps = edr_caps;
        self
    }

    /// Whether offload start succeeds
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }
}

impl LinkLayer for LoopbackLink {
    fn issue(&mut self, command: LinkCommand) {
        log::debug!("Loopback link: {:?}", command);

        let peer = PeerKey::Address(command.peer());
        let event = match command {
            LinkCommand::Open { .. } => LinkEvent::LinkOpened {
                peer,
                success: true,
                edr_caps: self.edr_caps,
            },
            LinkCommand::Start { .. } => LinkEvent::LinkStarted {
                peer,
                success: true,
                suspending: false,
                initiator: Initiator::Local,
            },
            LinkCommand::Stop { .. } => LinkEvent::LinkStopped {
                peer,
                success: true,
            },
            LinkCommand::Suspend { .. } => LinkEvent::LinkSuspended {
                peer,
                success: true,
                initiator: Initiator::Local,
            },
            LinkCommand::Close { .. } => LinkEvent::LinkClosed { peer },
            LinkCommand::OffloadStart { .. } => LinkEvent::OffloadStarted {
                peer,
                success: self.offload,
            },
        };

        if !self.events.send(event) {
            log::debug!("Loopback link: service gone, dropping event");
        }
    }
}
