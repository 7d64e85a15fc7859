// ABOUTME: Channel identifiers, listener callbacks and per-channel bookkeeping
// ABOUTME: Holds the inbound byte buffer that read() drains with a poll timeout

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Numeric channel identifier
pub type ChannelId = usize;

/// Control command/ack channel
pub const CONTROL_CHANNEL: ChannelId = 0;
/// Audio data channel
pub const AUDIO_CHANNEL: ChannelId = 1;
/// Number of channel ids the transport serves
pub const CHANNEL_COUNT: usize = 2;

/// Inbound bytes buffered per channel before the I/O thread stops reading
pub(crate) const INBOUND_LIMIT: usize = 64 * 1024;

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not open
    Disconnected,
    /// Listening, no client attached
    ListeningNoClient,
    /// Client attached
    Connected,
}

/// Which channels an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTarget {
    /// One channel
    Channel(ChannelId),
    /// Every channel, plus the I/O thread
    All,
}

/// Events delivered to a channel listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Client connected
    Opened,
    /// Client disconnected or channel closed
    Closed,
    /// Bytes are available to `read()`
    InboundDataReady,
}

/// Callbacks for channel events
///
/// Invoked on the transport I/O thread, one at a time. Implementations may
/// call non-blocking transport operations (`send`, `configure`, zero-timeout
/// `read`) but must not block.
pub trait ChannelListener: Send + Sync {
    /// A client connected
    fn on_opened(&self, _channel: ChannelId) {}

    /// The client disconnected or the channel was closed
    fn on_closed(&self, _channel: ChannelId) {}

    /// Inbound bytes are buffered
    fn on_data_ready(&self, _channel: ChannelId) {}
}

/// Per-channel configuration options
#[derive(Clone)]
pub enum ChannelOption {
    /// Drop buffered inbound bytes without dispatching them
    FlushInbound,
    /// Replace the event listener
    RegisterCallback(Arc<dyn ChannelListener>),
    /// Stop dispatching data-ready events; the owner reads directly
    DetachFromEventLoop,
    /// Timeout used by `read()`
    SetReadPollTimeout(Duration),
}

impl std::fmt::Debug for ChannelOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelOption::FlushInbound => write!(f, "FlushInbound"),
            ChannelOption::RegisterCallback(_) => write!(f, "RegisterCallback"),
            ChannelOption::DetachFromEventLoop => write!(f, "DetachFromEventLoop"),
            ChannelOption::SetReadPollTimeout(timeout) => {
                write!(f, "SetReadPollTimeout({:?})", timeout)
            }
        }
    }
}

struct InboundState {
    bytes: VecDeque<u8>,
    connected: bool,
}

/// Bytes received on one connection, waiting for `read()`
pub(crate) struct Inbound {
    state: Mutex<InboundState>,
    readable: Condvar,
    pub(crate) space: Notify,
}

impl Inbound {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InboundState {
                bytes: VecDeque::new(),
                connected: false,
            }),
            readable: Condvar::new(),
            space: Notify::new(),
        }
    }

    /// A new client attached; stale bytes from a previous client are dropped
    pub(crate) fn connect(&self) {
        let mut state = self.state.lock();
        state.bytes.clear();
        state.connected = true;
        self.space.notify_one();
    }

    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        self.readable.notify_all();
    }

    pub(crate) fn push(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.bytes.extend(data);
        self.readable.notify_all();
    }

    pub(crate) fn is_full(&self) -> bool {
        self.state.lock().bytes.len() >= INBOUND_LIMIT
    }

    pub(crate) fn available(&self) -> usize {
        self.state.lock().bytes.len()
    }

    pub(crate) fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.bytes.len();
        state.bytes.clear();
        drop(state);
        self.space.notify_one();
        dropped
    }

    /// Fill `buf` until full, the client detaches, or `timeout` elapses
    pub(crate) fn read(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        let mut state = self.state.lock();

        loop {
            let take = (buf.len() - filled).min(state.bytes.len());
            for (dst, src) in buf[filled..filled + take]
                .iter_mut()
                .zip(state.bytes.drain(..take))
            {
                *dst = src;
            }
            filled += take;

            if filled == buf.len() || !state.connected || Instant::now() >= deadline {
                break;
            }
            let _ = self.readable.wait_until(&mut state, deadline);
        }

        drop(state);
        if filled > 0 {
            self.space.notify_one();
        }
        filled
    }
}

/// Bookkeeping for one channel id, guarded by the transport lock
pub(crate) struct ChannelSlot {
    pub(crate) state: ChannelState,
    pub(crate) listener: Option<Arc<dyn ChannelListener>>,
    pub(crate) poll_timeout: Duration,
    pub(crate) detached: bool,
    pub(crate) endpoint: Option<PathBuf>,
    pub(crate) writer: Option<Arc<UnixStream>>,
    pub(crate) inbound: Arc<Inbound>,
    pub(crate) generation: u64,
}

impl ChannelSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            listener: None,
            poll_timeout: Duration::ZERO,
            detached: false,
            endpoint: None,
            writer: None,
            inbound: Arc::new(Inbound::new()),
            generation: 0,
        }
    }

    /// Forget the connection and listener; the next open starts a new generation
    pub(crate) fn reset(&mut self) {
        self.generation += 1;
        self.state = ChannelState::Disconnected;
        self.writer = None;
        self.detached = false;
        self.inbound.disconnect();
        if let Some(path) = self.endpoint.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
