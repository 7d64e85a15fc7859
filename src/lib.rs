// ABOUTME: Main library entry point for a2dp-link
// ABOUTME: Exports the transport, peer state machine, streaming engine and control protocol

//! # a2dp-link
//!
//! Control and data path manager for a point-to-point audio streaming link such as
//! Bluetooth A2DP.
//!
//! The crate accepts or initiates connections to remote audio peers, arbitrates a single
//! active peer per role, starts/stops/suspends streaming on request from either the local
//! audio subsystem or the remote peer, and pumps encoded frames between the audio
//! subsystem and the link at the codec's fixed cadence.
//!
//! ## Components
//!
//! - **Transport**: multiplexed Unix-socket channels (control + audio data) served by one I/O thread
//! - **Frame Queue**: bounded FIFO of encoded frames with overflow/underflow accounting
//! - **Peer Registry**: slot-indexed peers per role and the single active peer
//! - **Peer State Machine**: per-peer connection lifecycle driven by link events and requests
//! - **Streaming Engine**: periodic encode/send (source) and receive/decode (sink) pump
//! - **Control Protocol**: one-byte command/ack protocol spoken with the audio subsystem
//!
//! ## Example: Running the service with the loopback link
//!
//! ```no_run
//! use a2dp_link::link::LoopbackLink;
//! use a2dp_link::peer::Role;
//! use a2dp_link::service::{LinkService, ServiceConfig};
//!
//! let config = ServiceConfig::new()
//!     .control_path("/tmp/a2dp-ctrl")
//!     .data_path("/tmp/a2dp-data");
//!
//! let builder = LinkService::builder(config);
//! let link = LoopbackLink::new(builder.event_sender());
//! let service = builder.link(Box::new(link)).start().unwrap();
//!
//! service.handle().connect("00:11:22:33:44:55".parse().unwrap(), Role::Source);
//! service.shutdown();
//! ```

#![warn(missing_docs)]

/// Control channel command/acknowledgement protocol
pub mod control;
/// Link-layer event source seam
pub mod link;
/// Peers, the peer registry and the connection state machine
pub mod peer;
/// Service composition: executor, configuration and CLI
pub mod service;
/// Streaming engine, frame queue and codec provider seam
pub mod streaming;
/// Multiplexed local socket transport
pub mod transport;

pub use peer::{PeerAddress, Role};
pub use service::{LinkService, ServiceConfig, ServiceHandle};
pub use transport::Transport;

/// Result type for a2dp-link operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for a2dp-link
pub mod error {
    use thiserror::Error;

    /// Error types for a2dp-link operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// Transport setup or channel error
        #[error("Transport error: {0}")]
        Transport(String),

        /// Codec provider failure
        #[error("Codec error: {0}")]
        Codec(#[from] crate::streaming::CodecError),

        /// Peer registry failure
        #[error("Registry error: {0}")]
        Registry(#[from] crate::peer::RegistryError),

        /// Link-layer failure
        #[error("Link error: {0}")]
        Link(String),

        /// Control protocol violation
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// Invalid configuration
        #[error("Configuration error: {0}")]
        Config(String),

        /// Underlying I/O error
        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }
}
