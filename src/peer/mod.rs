// ABOUTME: Remote audio peers and their identifying types
// ABOUTME: Addresses, roles, status flags and the peer record owned by the registry

mod registry;
mod state_machine;

pub use registry::{ActivePeer, PeerRegistry, SessionRouter};
pub use state_machine::{
    Action, EventContext, Initiator, PeerEvent, PeerState, StreamRequest, Transition,
};

use crate::streaming::CodecConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque handle assigned to a peer by the link layer
pub type LinkHandle = u16;

/// EDR capability bit: 2 Mbps rate supported
pub const EDR_2MBPS: u8 = 0x01;
/// EDR capability bit: 3 Mbps rate supported
pub const EDR_3MBPS: u8 = 0x02;

/// Peer registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot is taken
    #[error("No free peer slot for {role} role (max {max})")]
    NoFreeSlot {
        /// Registry role
        role: Role,
        /// Configured slot count
        max: usize,
    },

    /// Address not in the registry
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerAddress),
}

/// Error parsing a textual peer address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid peer address: {0}")]
pub struct AddressParseError(String);

/// Six-byte stable peer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    /// Wrap raw address bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Which side of the link originates audio locally
///
/// A `Source` registry holds sink peers (we send audio to them); a `Sink`
/// registry holds source peers (we receive audio from them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Local side sends audio
    Source,
    /// Local side receives audio
    Sink,
}

impl Role {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Sink => "sink",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a link event names the peer it concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKey {
    /// By address
    Address(PeerAddress),
    /// By link-layer handle
    Handle(LinkHandle),
}

impl From<PeerAddress> for PeerKey {
    fn from(address: PeerAddress) -> Self {
        PeerKey::Address(address)
    }
}

/// Per-peer status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerFlags(u8);

impl PeerFlags {
    /// A local stop/suspend is waiting for link confirmation
    pub const LOCAL_SUSPEND_PENDING: PeerFlags = PeerFlags(0x01);
    /// The remote side suspended the stream
    pub const REMOTE_SUSPEND: PeerFlags = PeerFlags(0x02);
    /// A local start is waiting for link confirmation
    pub const PENDING_START: PeerFlags = PeerFlags(0x04);
    /// A local stop is waiting for link confirmation
    pub const PENDING_STOP: PeerFlags = PeerFlags(0x08);

    /// No flags set
    pub const fn empty() -> Self {
        PeerFlags(0)
    }

    /// Whether every bit of `other` is set
    pub fn contains(&self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: PeerFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: PeerFlags) {
        self.0 &= !other.0;
    }

    /// Clear everything
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Whether no flag is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Connection report delivered to the status observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Open in progress
    Connecting,
    /// Link open
    Connected,
    /// Close in progress
    Disconnecting,
}

/// Audio report delivered to the status observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    /// Remote suspended the stream
    RemoteSuspend,
    /// Stream stopped
    Stopped,
    /// Stream started
    Started,
}

/// A remote endpoint and its connection state
#[derive(Debug, Clone)]
pub struct Peer {
    pub(crate) address: PeerAddress,
    pub(crate) role: Role,
    pub(crate) handle: Option<LinkHandle>,
    pub(crate) slot: usize,
    pub(crate) flags: PeerFlags,
    pub(crate) state: PeerState,
    pub(crate) previous: Option<PeerState>,
    pub(crate) edr: u8,
    pub(crate) codec_config: Option<CodecConfig>,
    pub(crate) delay_report: u16,
}

impl Peer {
    /// Create a peer in `Idle`
    pub fn new(address: PeerAddress, role: Role, handle: Option<LinkHandle>, slot: usize) -> Self {
        Self {
            address,
            role,
            handle,
            slot,
            flags: PeerFlags::empty(),
            state: PeerState::Idle,
            previous: None,
            edr: 0,
            codec_config: None,
            delay_report: 0,
        }
    }

    /// Peer address
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Registry role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Link-layer handle, once assigned
    pub fn handle(&self) -> Option<LinkHandle> {
        self.handle
    }

    /// Assign the link-layer handle
    pub fn set_handle(&mut self, handle: LinkHandle) {
        self.handle = Some(handle);
    }

    /// Registry slot id
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current status flags
    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    /// Current connection state
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// State this peer was in before the last state change, if any
    pub fn previous_state(&self) -> Option<PeerState> {
        self.previous
    }

    /// Whether the peer is in `Opening`, `Opened` or `Started`
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(
            self.state,
            PeerState::Opening | PeerState::Opened | PeerState::Started
        )
    }

    /// Whether the peer is `Opened` or `Started`
    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Opened | PeerState::Started)
    }

    /// Peer is back in `Idle` after having left it
    pub fn can_be_deleted(&self) -> bool {
        self.state == PeerState::Idle && self.previous.is_some()
    }

    /// Peer supports EDR
    pub fn is_edr(&self) -> bool {
        self.edr != 0
    }

    /// Peer supports the 3 Mbps EDR rate
    pub fn supports_3mbps(&self) -> bool {
        self.edr & EDR_3MBPS != 0
    }

    /// Negotiated codec configuration
    pub fn codec_config(&self) -> Option<CodecConfig> {
        self.codec_config
    }

    /// Store the negotiated codec configuration
    pub fn set_codec_config(&mut self, config: CodecConfig) {
        self.codec_config = Some(config);
    }

    /// Last reported sink delay in 1/10 ms
    pub fn delay_report(&self) -> u16 {
        self.delay_report
    }

    /// Store a sink delay report (1/10 ms)
    pub fn set_delay_report(&mut self, delay: u16) {
        self.delay_report = delay;
    }
}
