// ABOUTME: Streaming engine pumping frames between codec providers and the data channel
// ABOUTME: One worker thread per active role ticks at the codec interval until the session stops

use crate::error::Error;
use crate::peer::{Peer, PeerAddress, Role, SessionRouter};
use crate::streaming::clock::StreamClock;
use crate::streaming::codec::{AudioConfig, CodecConfig, CodecError, CodecProvider, PeerParams};
use crate::streaming::queue::{Frame, FrameQueue, OverflowPolicy, QueueCounters};
use crate::transport::{ChannelId, Transport};
use crate::Result;
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Codec provider shared between the engine and its worker
pub type SharedCodec = Arc<Mutex<Box<dyn CodecProvider>>>;

/// Default outbound queue bound (frames)
pub const DEFAULT_SOURCE_QUEUE: usize = 18;
/// Default inbound queue bound (frames)
pub const DEFAULT_SINK_QUEUE: usize = 80;

struct SessionShared {
    queue: FrameQueue,
    frames: AtomicU64,
    bytes: AtomicU64,
    codec_errors: AtomicU64,
    send_failures: AtomicU64,
}

impl SessionShared {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: FrameQueue::new(capacity, policy),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
struct SessionInfo {
    id: Uuid,
    peer: PeerAddress,
    interval: Duration,
    started: Instant,
    shared: Arc<SessionShared>,
}

/// Snapshot of one streaming session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session identifier
    pub session_id: Uuid,
    /// Streaming role
    pub role: Role,
    /// Peer the session streams with
    pub peer: PeerAddress,
    /// Tick period in milliseconds
    pub interval_ms: u64,
    /// Time since the session started
    pub uptime_ms: u64,
    /// Codec frames sent (source) or decoded (sink)
    pub frames: u64,
    /// Bytes sent (source) or decoded (sink)
    pub bytes: u64,
    /// Bytes moved for this role across all sessions
    pub total_bytes: u64,
    /// Ticks skipped because the codec failed
    pub codec_errors: u64,
    /// Frames the transport refused
    pub send_failures: u64,
    /// Current queue depth
    pub queue_depth: usize,
    /// Queue bound
    pub queue_capacity: usize,
    /// Queue accounting
    pub queue: QueueCounters,
}

/// Thread-safe view of the running sessions
#[derive(Clone)]
pub struct SessionDirectory {
    sessions: Arc<RwLock<HashMap<Role, SessionInfo>>>,
    totals: Arc<HashMap<Role, AtomicU64>>,
}

impl SessionDirectory {
    fn new() -> Self {
        let totals = [Role::Source, Role::Sink]
            .into_iter()
            .map(|role| (role, AtomicU64::new(0)))
            .collect();
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            totals: Arc::new(totals),
        }
    }

    /// Statistics for the role's running session
    pub fn stats(&self, role: Role) -> Option<SessionStats> {
        let sessions = self.sessions.read();
        let info = sessions.get(&role)?;
        let shared = &info.shared;

        Some(SessionStats {
            session_id: info.id,
            role,
            peer: info.peer,
            interval_ms: info.interval.as_millis() as u64,
            uptime_ms: info.started.elapsed().as_millis() as u64,
            frames: shared.frames.load(Ordering::Relaxed),
            bytes: shared.bytes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes(role),
            codec_errors: shared.codec_errors.load(Ordering::Relaxed),
            send_failures: shared.send_failures.load(Ordering::Relaxed),
            queue_depth: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
            queue: shared.queue.counters(),
        })
    }

    /// Bytes moved for `role` since the engine was created
    pub fn total_bytes(&self, role: Role) -> u64 {
        self.totals
            .get(&role)
            .map(|t| t.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn add_bytes(&self, role: Role, bytes: u64) {
        if let Some(total) = self.totals.get(&role) {
            total.fetch_add(bytes, Ordering::Relaxed);
        }
    }
}

struct SinkRoute {
    shared: Arc<SessionShared>,
    frame_bytes: usize,
    partial: Vec<u8>,
}

/// Entry point for inbound data-channel bytes on the sink side
///
/// Splits the byte stream into frames of the codec's fixed size and queues
/// them for the sink worker. Bytes arriving with no sink session are dropped.
#[derive(Clone, Default)]
pub struct SinkInbound {
    route: Arc<Mutex<Option<SinkRoute>>>,
}

impl SinkInbound {
    /// Queue received bytes; returns the number of whole frames queued
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut route = self.route.lock();
        let Some(route) = route.as_mut() else {
            return 0;
        };

        let now = Instant::now();
        if route.frame_bytes == 0 {
            route.shared.queue.enqueue(Frame::new(bytes.to_vec(), 1, now));
            return 1;
        }

        route.partial.extend_from_slice(bytes);
        let mut queued = 0;
        while route.partial.len() >= route.frame_bytes {
            let payload: Vec<u8> = route.partial.drain(..route.frame_bytes).collect();
            route.shared.queue.enqueue(Frame::new(payload, 1, now));
            queued += 1;
        }
        queued
    }

    /// Whether a sink session is receiving
    pub fn is_routed(&self) -> bool {
        self.route.lock().is_some()
    }

    fn attach(&self, shared: Arc<SessionShared>, frame_bytes: usize) {
        *self.route.lock() = Some(SinkRoute {
            shared,
            frame_bytes,
            partial: Vec::new(),
        });
    }

    fn detach(&self) {
        *self.route.lock() = None;
    }
}

struct Worker {
    role: Role,
    shared: Arc<SessionShared>,
    codec: SharedCodec,
    transport: Arc<Transport>,
    channel: ChannelId,
    directory: SessionDirectory,
}

impl Worker {
    fn run(self, interval: Duration, stop: Receiver<()>) {
        let ticker = channel::tick(interval);

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(ticker) -> tick => {
                    let now = tick.unwrap_or_else(|_| Instant::now());
                    match self.role {
                        Role::Source => self.source_tick(now),
                        Role::Sink => self.sink_tick(),
                    }
                }
            }
        }
    }

    fn source_tick(&self, now: Instant) {
        let queue = &self.shared.queue;
        if queue.is_discarding() {
            queue.flush();
            return;
        }

        let mut produced = Vec::new();
        let encoded = {
            let mut codec = self.codec.lock();
            codec.set_queue_depth_hint(queue.len());
            codec.encode_tick(now, &mut produced)
        };
        if let Err(e) = encoded {
            self.shared.codec_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("Source codec failed, skipping tick: {}", e);
            return;
        }

        for frame in produced {
            queue.enqueue(frame);
        }

        let mut sent = 0;
        while let Some(frame) = queue.dequeue() {
            if !self.transport.send(self.channel, &frame.payload) {
                self.shared.send_failures.fetch_add(1, Ordering::Relaxed);
                queue.requeue_front(frame);
                break;
            }

            let bytes = frame.len() as u64;
            self.shared.frames.fetch_add(u64::from(frame.frame_count), Ordering::Relaxed);
            self.shared.bytes.fetch_add(bytes, Ordering::Relaxed);
            self.directory.add_bytes(self.role, bytes);
            sent += 1;
        }

        if sent == 0 && queue.is_empty() {
            queue.record_underflow(now);
            log::debug!(
                "Source queue underflow ({} so far)",
                queue.counters().underflow_events
            );
        }
    }

    fn sink_tick(&self) {
        while let Some(frame) = self.shared.queue.dequeue() {
            let decoded = self.codec.lock().decode(&frame);
            match decoded {
                Ok(()) => {
                    let bytes = frame.len() as u64;
                    self.shared.frames.fetch_add(u64::from(frame.frame_count), Ordering::Relaxed);
                    self.shared.bytes.fetch_add(bytes, Ordering::Relaxed);
                    self.directory.add_bytes(self.role, bytes);
                }
                Err(e) => {
                    self.shared.codec_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Sink codec failed to decode frame: {}", e);
                }
            }
        }
    }
}

struct RunningSession {
    info: SessionInfo,
    stop: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

/// Streaming engine
///
/// Owns the codec provider for each role and at most one running session per
/// role. Sessions are started and stopped by the peer state machine; the
/// engine never decides on its own to stream.
pub struct StreamingEngine {
    transport: Arc<Transport>,
    data_channel: ChannelId,
    source_capacity: usize,
    sink_capacity: usize,
    default_codec: CodecConfig,
    codecs: HashMap<Role, SharedCodec>,
    sessions: HashMap<Role, RunningSession>,
    directory: SessionDirectory,
    sink_inbound: SinkInbound,
    clock: StreamClock,
}

impl StreamingEngine {
    /// Create an engine writing to (and reading from) `data_channel`
    pub fn new(transport: Arc<Transport>, data_channel: ChannelId) -> Self {
        Self {
            transport,
            data_channel,
            source_capacity: DEFAULT_SOURCE_QUEUE,
            sink_capacity: DEFAULT_SINK_QUEUE,
            default_codec: CodecConfig::default(),
            codecs: HashMap::new(),
            sessions: HashMap::new(),
            directory: SessionDirectory::new(),
            sink_inbound: SinkInbound::default(),
            clock: StreamClock::new(),
        }
    }

    /// Set the outbound and inbound queue bounds
    pub fn with_queue_bounds(mut self, source: usize, sink: usize) -> Self {
        self.source_capacity = source;
        self.sink_capacity = sink;
        self
    }

    /// Codec configuration used when a peer has not negotiated one
    pub fn with_default_codec(mut self, config: CodecConfig) -> Self {
        self.default_codec = config;
        self
    }

    /// Install the codec provider for a role
    pub fn register_codec(&mut self, role: Role, codec: Box<dyn CodecProvider>) {
        log::debug!("Registered {} codec for {} role", codec.name(), role);
        self.codecs.insert(role, Arc::new(Mutex::new(codec)));
    }

    /// Start streaming for `role` with the given peer
    ///
    /// Calling this again for the peer already streaming is a no-op; a
    /// different peer replaces the running session.
    pub fn start_session(&mut self, role: Role, peer: &PeerParams, config: &CodecConfig) -> Result<()> {
        if let Some(session) = self.sessions.get(&role) {
            if session.info.peer == peer.address {
                log::debug!("{} session for {} already running", role, peer.address);
                return Ok(());
            }
            self.stop_session(role);
        }

        let codec = self
            .codecs
            .get(&role)
            .cloned()
            .ok_or_else(|| CodecError::Init(format!("no codec provider for {} role", role)))?;

        let (interval_ms, frame_bytes) = {
            let mut provider = codec.lock();
            provider.init(peer, config)?;
            let interval_ms = provider.interval_ms();
            if interval_ms == 0 {
                provider.cleanup();
                return Err(CodecError::Init("codec reported a zero interval".to_string()).into());
            }
            provider.feeding_reset();
            (interval_ms, provider.max_frame_bytes())
        };

        let (capacity, policy) = match role {
            Role::Source => (self.source_capacity, OverflowPolicy::DropAll),
            Role::Sink => (self.sink_capacity, OverflowPolicy::DropOldest),
        };
        let shared = Arc::new(SessionShared::new(capacity, policy));
        let interval = Duration::from_millis(interval_ms);

        let worker = Worker {
            role,
            shared: shared.clone(),
            codec: codec.clone(),
            transport: self.transport.clone(),
            channel: self.data_channel,
            directory: self.directory.clone(),
        };
        let (stop_tx, stop_rx) = channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name(format!("a2dp-{}-stream", role))
            .spawn(move || worker.run(interval, stop_rx));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                codec.lock().cleanup();
                return Err(Error::Io(e));
            }
        };

        if role == Role::Sink {
            self.sink_inbound.attach(shared.clone(), frame_bytes);
        }

        let info = SessionInfo {
            id: Uuid::new_v4(),
            peer: peer.address,
            interval,
            started: Instant::now(),
            shared,
        };
        self.directory.sessions.write().insert(role, info.clone());

        log::info!(
            "Started {} session {} with {}: {} ms interval, queue bound {}",
            role,
            info.id,
            peer.address,
            interval_ms,
            capacity
        );

        self.sessions.insert(
            role,
            RunningSession {
                info,
                stop: stop_tx,
                worker: Some(handle),
            },
        );
        Ok(())
    }

    /// Stop the role's session
    ///
    /// Returns after any tick in progress has finished; then drains the
    /// queue and releases codec resources.
    pub fn stop_session(&mut self, role: Role) {
        let Some(mut session) = self.sessions.remove(&role) else {
            return;
        };

        if role == Role::Sink {
            self.sink_inbound.detach();
        }
        self.directory.sessions.write().remove(&role);

        let _ = session.stop.send(());
        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                log::error!("{} streaming worker panicked", role);
            }
        }

        let flushed = session.info.shared.queue.flush();
        if let Some(codec) = self.codecs.get(&role) {
            let mut codec = codec.lock();
            codec.feeding_flush();
            codec.cleanup();
        }

        log::info!(
            "Stopped {} session {} ({} frames, {} queued frames dropped)",
            role,
            session.info.id,
            session.info.shared.frames.load(Ordering::Relaxed),
            flushed
        );
    }

    /// Stop every running session
    pub fn stop_all(&mut self) {
        let roles: Vec<Role> = self.sessions.keys().copied().collect();
        for role in roles {
            self.stop_session(role);
        }
    }

    /// Toggle discard mode: the source stops producing, the sink stops decoding
    pub fn set_discarding(&self, role: Role, discarding: bool) {
        if let Some(session) = self.sessions.get(&role) {
            session.info.shared.queue.set_discarding(discarding);
            log::debug!("{} session discarding: {}", role, discarding);
        }
    }

    /// Drain the role's queue without processing; returns frames dropped
    pub fn flush(&self, role: Role) -> usize {
        self.sessions
            .get(&role)
            .map(|s| s.info.shared.queue.flush())
            .unwrap_or(0)
    }

    /// Reset the role's codec input buffering
    pub fn feeding_reset(&self, role: Role) {
        if let Some(codec) = self.codecs.get(&role) {
            codec.lock().feeding_reset();
        }
    }

    /// Drop the role's buffered codec input
    pub fn feeding_flush(&self, role: Role) {
        if let Some(codec) = self.codecs.get(&role) {
            codec.lock().feeding_flush();
        }
    }

    /// Forward a PCM feeding configuration change to the role's codec
    pub fn update_feeding(&self, role: Role, audio: AudioConfig) {
        if let Some(codec) = self.codecs.get(&role) {
            codec.lock().update_feeding(audio);
        }
    }

    /// Whether the role has a running session
    pub fn has_session(&self, role: Role) -> bool {
        self.sessions.contains_key(&role)
    }

    /// Peer the role's session streams with
    pub fn session_peer(&self, role: Role) -> Option<PeerAddress> {
        self.sessions.get(&role).map(|s| s.info.peer)
    }

    /// Tick period of the role's session
    pub fn session_interval(&self, role: Role) -> Option<Duration> {
        self.sessions.get(&role).map(|s| s.info.interval)
    }

    /// Statistics for the role's session
    pub fn session_stats(&self, role: Role) -> Option<SessionStats> {
        self.directory.stats(role)
    }

    /// Shareable view of the running sessions
    pub fn directory(&self) -> SessionDirectory {
        self.directory.clone()
    }

    /// Inbound entry point for sink-side data
    pub fn sink_inbound(&self) -> SinkInbound {
        self.sink_inbound.clone()
    }

    /// Engine clock
    pub fn clock(&self) -> StreamClock {
        self.clock
    }
}

impl SessionRouter for StreamingEngine {
    fn begin_session(&mut self, role: Role, peer: &Peer) -> bool {
        let params = PeerParams {
            address: peer.address(),
            is_edr: peer.is_edr(),
            supports_3mbps: peer.supports_3mbps(),
        };
        let config = peer.codec_config().unwrap_or(self.default_codec);

        match self.start_session(role, &params, &config) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cannot start {} session for {}: {}", role, params.address, e);
                false
            }
        }
    }

    fn end_session(&mut self, role: Role) {
        self.stop_session(role);
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
