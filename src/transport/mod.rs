// ABOUTME: Multiplexed local socket transport
// ABOUTME: Independently openable channels served by one background I/O thread

mod channel;
mod io;

pub use channel::{
    ChannelEvent, ChannelId, ChannelListener, ChannelOption, ChannelState, ChannelTarget,
    AUDIO_CHANNEL, CHANNEL_COUNT, CONTROL_CHANNEL,
};

use channel::{ChannelSlot, Inbound};
use io::{spawn_io_thread, IoCommand};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::io::{ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long `send` keeps retrying a full socket buffer
const SEND_DEADLINE: Duration = Duration::from_millis(20);

struct IoThread {
    commands: mpsc::UnboundedSender<IoCommand>,
    handle: JoinHandle<()>,
}

struct TransportState {
    slots: Vec<ChannelSlot>,
    io: Option<IoThread>,
}

/// State shared between callers and the I/O thread
pub(crate) struct Shared {
    state: ReentrantMutex<RefCell<TransportState>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(TransportState {
                slots: (0..CHANNEL_COUNT).map(|_| ChannelSlot::new()).collect(),
                io: None,
            })),
        }
    }

    /// Deliver an event to the channel's listener under the transport lock
    pub(crate) fn dispatch(&self, channel: ChannelId, event: ChannelEvent) {
        let guard = self.state.lock();
        let listener = {
            let state = guard.borrow();
            let slot = &state.slots[channel];
            if event == ChannelEvent::InboundDataReady && slot.detached {
                return;
            }
            slot.listener.clone()
        };

        if let Some(listener) = listener {
            match event {
                ChannelEvent::Opened => listener.on_opened(channel),
                ChannelEvent::Closed => listener.on_closed(channel),
                ChannelEvent::InboundDataReady => listener.on_data_ready(channel),
            }
        }
    }

    pub(crate) fn attach_client(
        &self,
        channel: ChannelId,
        generation: u64,
        writer: UnixStream,
    ) -> Option<Arc<Inbound>> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let slot = &mut state.slots[channel];
        if slot.generation != generation {
            return None;
        }

        slot.state = ChannelState::Connected;
        slot.writer = Some(Arc::new(writer));
        slot.inbound.connect();
        Some(slot.inbound.clone())
    }

    pub(crate) fn detach_client(&self, channel: ChannelId, generation: u64) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let slot = &mut state.slots[channel];
        if slot.generation != generation {
            return;
        }

        slot.state = ChannelState::ListeningNoClient;
        slot.writer = None;
        slot.inbound.disconnect();
    }

    pub(crate) fn release(&self, channel: ChannelId, generation: u64) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let slot = &mut state.slots[channel];
        if slot.generation == generation {
            slot.reset();
        }
    }
}

/// Multiplexed channel transport over Unix domain sockets
///
/// Each channel id listens on its own socket path and serves one client at a
/// time. All socket I/O and every listener callback runs on a single
/// background thread started by the first successful `open`.
///
/// All operations take one transport-wide reentrant lock, so listener
/// callbacks may call back into the transport. `close(ChannelTarget::All)`
/// blocks until the I/O thread has exited and must not be called from a
/// callback.
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Create a transport with every channel closed
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Start listening for one client on `endpoint`
    ///
    /// Returns false for an out-of-range id or if the socket cannot be bound.
    /// Opening an already open channel succeeds without changes.
    pub fn open(
        &self,
        channel: ChannelId,
        listener: Arc<dyn ChannelListener>,
        endpoint: impl AsRef<Path>,
    ) -> bool {
        if channel >= CHANNEL_COUNT {
            log::warn!("Cannot open channel {}: out of range", channel);
            return false;
        }
        let endpoint = endpoint.as_ref();

        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if state.slots[channel].state != ChannelState::Disconnected {
            log::debug!("Channel {} already open", channel);
            return true;
        }

        match std::fs::remove_file(endpoint) {
            Ok(()) => log::debug!("Removed stale socket {}", endpoint.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Cannot remove {}: {}", endpoint.display(), e),
        }

        let socket = match UnixListener::bind(endpoint).and_then(|l| {
            l.set_nonblocking(true)?;
            Ok(l)
        }) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Channel {}: cannot listen on {}: {}", channel, endpoint.display(), e);
                return false;
            }
        };

        if state.io.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            match spawn_io_thread(self.shared.clone(), rx) {
                Ok(handle) => {
                    state.io = Some(IoThread {
                        commands: tx,
                        handle,
                    })
                }
                Err(e) => {
                    log::error!("Cannot start transport I/O thread: {}", e);
                    let _ = std::fs::remove_file(endpoint);
                    return false;
                }
            }
        }

        let slot = &mut state.slots[channel];
        slot.generation += 1;
        slot.state = ChannelState::ListeningNoClient;
        slot.listener = Some(listener);
        slot.detached = false;
        slot.endpoint = Some(endpoint.to_path_buf());
        slot.inbound = Arc::new(Inbound::new());
        let generation = slot.generation;

        let queued = state.io.as_ref().map(|io| {
            io.commands
                .send(IoCommand::Open {
                    channel,
                    generation,
                    listener: socket,
                })
                .is_ok()
        });

        if queued != Some(true) {
            log::error!("Channel {}: transport I/O thread is gone", channel);
            state.slots[channel].reset();
            return false;
        }

        log::info!("Channel {} listening on {}", channel, endpoint.display());
        true
    }

    /// Close one channel (asynchronously) or the whole transport (blocking)
    pub fn close(&self, target: ChannelTarget) {
        match target {
            ChannelTarget::Channel(channel) => self.close_channel(channel),
            ChannelTarget::All => self.close_all(),
        }
    }

    fn close_channel(&self, channel: ChannelId) {
        if channel >= CHANNEL_COUNT {
            log::warn!("Cannot close channel {}: out of range", channel);
            return;
        }

        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if state.slots[channel].state == ChannelState::Disconnected {
            return;
        }

        state.slots[channel].reset();
        if let Some(io) = state.io.as_ref() {
            let _ = io.commands.send(IoCommand::Close { channel });
        }
        log::debug!("Channel {} closing", channel);
    }

    fn close_all(&self) {
        let io = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            for slot in state.slots.iter_mut() {
                if slot.state != ChannelState::Disconnected {
                    slot.reset();
                }
            }
            state.io.take()
        };

        let Some(io) = io else {
            return;
        };

        let _ = io.commands.send(IoCommand::Shutdown);
        if io.handle.thread().id() == std::thread::current().id() {
            log::error!("Transport closed from its own I/O thread; not waiting for exit");
            return;
        }
        if io.handle.join().is_err() {
            log::error!("Transport I/O thread panicked");
        }
        log::info!("Transport shut down");
    }

    /// Write `bytes` to the channel's client
    ///
    /// Returns false (and logs) if no client is attached or the write fails.
    /// A failed write does not close the channel.
    pub fn send(&self, channel: ChannelId, bytes: &[u8]) -> bool {
        if channel >= CHANNEL_COUNT {
            return false;
        }

        let writer = {
            let guard = self.shared.state.lock();
            let state = guard.borrow();
            state.slots[channel].writer.clone()
        };

        let Some(writer) = writer else {
            log::debug!("Channel {}: send with no client attached", channel);
            return false;
        };

        match write_with_deadline(&writer, bytes, SEND_DEADLINE) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Channel {}: send of {} bytes failed: {}", channel, bytes.len(), e);
                false
            }
        }
    }

    /// Read up to `buf.len()` bytes, waiting at most the channel's poll timeout
    ///
    /// Returns 0 when no client is attached. A short count means the timeout
    /// elapsed or the client detached.
    pub fn read(&self, channel: ChannelId, buf: &mut [u8]) -> usize {
        if channel >= CHANNEL_COUNT || buf.is_empty() {
            return 0;
        }

        let (inbound, timeout) = {
            let guard = self.shared.state.lock();
            let state = guard.borrow();
            let slot = &state.slots[channel];
            if slot.state == ChannelState::Disconnected {
                return 0;
            }
            (slot.inbound.clone(), slot.poll_timeout)
        };

        inbound.read(buf, timeout)
    }

    /// Bytes buffered for `read`
    pub fn available(&self, channel: ChannelId) -> usize {
        if channel >= CHANNEL_COUNT {
            return 0;
        }
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.slots[channel].inbound.available()
    }

    /// Connection state of a channel
    pub fn state(&self, channel: ChannelId) -> ChannelState {
        if channel >= CHANNEL_COUNT {
            return ChannelState::Disconnected;
        }
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.slots[channel].state
    }

    /// Apply a channel option; returns false for an out-of-range id
    pub fn configure(&self, channel: ChannelId, option: ChannelOption) -> bool {
        if channel >= CHANNEL_COUNT {
            log::warn!("Cannot configure channel {}: out of range", channel);
            return false;
        }

        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        let slot = &mut state.slots[channel];
        match option {
            ChannelOption::FlushInbound => {
                let dropped = slot.inbound.flush();
                if dropped > 0 {
                    log::debug!("Channel {}: flushed {} inbound bytes", channel, dropped);
                }
            }
            ChannelOption::RegisterCallback(listener) => slot.listener = Some(listener),
            ChannelOption::DetachFromEventLoop => slot.detached = true,
            ChannelOption::SetReadPollTimeout(timeout) => slot.poll_timeout = timeout,
        }
        true
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn write_with_deadline(stream: &UnixStream, mut bytes: &[u8], deadline: Duration) -> std::io::Result<()> {
    let give_up = Instant::now() + deadline;
    let mut stream = stream;

    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= give_up {
                    return Err(ErrorKind::TimedOut.into());
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
