// ABOUTME: Top-level service composing transport, registries, streaming engine and control handler
// ABOUTME: All state machine and control work runs on one executor thread fed by a message channel

use crate::control::{ControlContext, ControlHandler, PresentationPosition, TransportControl};
use crate::error::Error;
use crate::link::{EventSender, LinkCommand, LinkEvent, LinkLayer};
use crate::peer::{
    Action, ActivePeer, Peer, PeerAddress, PeerEvent, PeerFlags, PeerKey, PeerRegistry, PeerState,
    RegistryError, Role, SessionRouter, StreamRequest,
};
use crate::service::completion::{Completion, CompletionHandle};
use crate::service::config::ServiceConfig;
use crate::service::observer::{LogObserver, StatusObserver};
use crate::streaming::{
    AudioConfig, CodecProvider, CountingSink, PcmCodec, PcmSource, SessionDirectory,
    SessionStats, SilenceSource, SinkInbound, StreamClock, StreamingEngine, ToneSource,
};
use crate::transport::{
    ChannelId, ChannelListener, ChannelOption, ChannelTarget, Transport, AUDIO_CHANNEL,
    CONTROL_CHANNEL,
};
use crate::Result;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Requests from [`ServiceHandle`]
#[derive(Debug)]
pub(crate) enum ApiRequest {
    Connect {
        address: PeerAddress,
        role: Role,
        done: Completion,
    },
    Disconnect {
        address: PeerAddress,
        role: Role,
        done: Completion,
    },
    Stream {
        role: Role,
        request: StreamRequest,
        done: Completion,
    },
    SetActive {
        role: Role,
        address: Option<PeerAddress>,
        done: Completion,
    },
    SetCallActive(bool),
    PeerState {
        address: PeerAddress,
        role: Role,
        reply: Sender<Option<PeerState>>,
    },
}

/// Everything the executor thread consumes
#[derive(Debug)]
pub(crate) enum ServiceMessage {
    Link(LinkEvent),
    Api(ApiRequest),
    ControlOpened,
    ControlClosed,
    ControlDataReady,
    Shutdown,
}

struct ControlListener {
    tx: Sender<ServiceMessage>,
}

impl ChannelListener for ControlListener {
    fn on_opened(&self, _channel: ChannelId) {
        let _ = self.tx.send(ServiceMessage::ControlOpened);
    }

    fn on_closed(&self, _channel: ChannelId) {
        let _ = self.tx.send(ServiceMessage::ControlClosed);
    }

    fn on_data_ready(&self, _channel: ChannelId) {
        let _ = self.tx.send(ServiceMessage::ControlDataReady);
    }
}

/// Routes inbound audio bytes to the sink session, or drops them
struct DataListener {
    transport: Weak<Transport>,
    inbound: Option<SinkInbound>,
}

impl ChannelListener for DataListener {
    fn on_opened(&self, channel: ChannelId) {
        log::info!("Audio data client connected on channel {}", channel);
    }

    fn on_closed(&self, channel: ChannelId) {
        log::info!("Audio data client gone from channel {}", channel);
    }

    fn on_data_ready(&self, channel: ChannelId) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };

        let Some(inbound) = &self.inbound else {
            transport.configure(channel, ChannelOption::FlushInbound);
            return;
        };

        // Only ask for what is buffered so the read never waits on the poll timeout
        let mut buf = [0u8; 4096];
        loop {
            let ready = transport.available(channel).min(buf.len());
            if ready == 0 {
                break;
            }
            let n = transport.read(channel, &mut buf[..ready]);
            if n == 0 {
                break;
            }
            if inbound.push(&buf[..n]) == 0 && !inbound.is_routed() {
                log::trace!("Dropped {} inbound bytes with no sink session", n);
            }
        }
    }
}

struct GraceTimer {
    deadline: Instant,
    role: Role,
    address: PeerAddress,
}

/// State owned by the executor thread
struct CoreState {
    registries: Vec<PeerRegistry>,
    engine: StreamingEngine,
    link: Box<dyn LinkLayer>,
    observer: Box<dyn StatusObserver>,
    timers: Vec<GraceTimer>,
    resolutions: Vec<(StreamRequest, bool)>,
    control_role: Role,
    call_active: bool,
    offload: bool,
    grace: Duration,
    default_audio: AudioConfig,
    output_override: Option<AudioConfig>,
    clock: StreamClock,
}

impl CoreState {
    fn registry(&self, role: Role) -> Option<&PeerRegistry> {
        self.registries.iter().find(|r| r.role() == role)
    }

    fn registry_mut(&mut self, role: Role) -> Option<&mut PeerRegistry> {
        self.registries.iter_mut().find(|r| r.role() == role)
    }

    fn locate(&self, key: PeerKey) -> Option<(Role, PeerAddress)> {
        self.registries
            .iter()
            .find_map(|r| r.resolve(key).map(|address| (r.role(), address)))
    }

    /// Find or create a peer, sweeping idle peers once if every slot is taken
    fn admit(&mut self, role: Role, address: PeerAddress) -> bool {
        let Some(registry) = self.registry_mut(role) else {
            log::warn!("{} role is not enabled, ignoring peer {}", role, address);
            return false;
        };

        let created = match registry.find_or_create(address, None) {
            Err(RegistryError::NoFreeSlot { .. }) => {
                let swept = registry.delete_idle();
                log::debug!("Swept {} idle {} peers", swept, role);
                registry.find_or_create(address, None).map(|_| ())
            }
            other => other.map(|_| ()),
        };

        match created {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cannot admit {} peer {}: {}", role, address, e);
                self.observer.on_connection_rejected(role, address);
                false
            }
        }
    }

    /// Run one event through a peer's state machine and apply its actions
    ///
    /// Returns false when the event was unhandled or admission rejected it.
    fn dispatch(&mut self, role: Role, address: PeerAddress, event: PeerEvent) -> bool {
        let Some(registry) = self.registry_mut(role) else {
            return false;
        };
        let ctx = registry.context_for(&address);
        let Some(peer) = registry.find_mut(&address) else {
            log::warn!("{:?} for unknown {} peer {}", event, role, address);
            return false;
        };

        let transition = peer.process_event(&event, &ctx);
        let accepted =
            transition.handled && !transition.actions.contains(&Action::ConnectionRejected);
        self.apply(role, address, transition.actions);
        accepted
    }

    fn apply(&mut self, role: Role, address: PeerAddress, actions: Vec<Action>) {
        let mut session_failed = false;

        for action in actions {
            match action {
                Action::Link(command) => self.link.issue(command),
                Action::ReportConnection(state) => {
                    self.observer.on_connection_state(role, address, state)
                }
                Action::ReportAudio(state) => self.observer.on_audio_state(role, address, state),
                Action::StartSession => {
                    if !self.begin_session(role, address) {
                        session_failed = true;
                    }
                }
                Action::StopSession => self.engine.stop_session(role),
                Action::SetDiscarding(discarding) => self.engine.set_discarding(role, discarding),
                Action::FlushSession => {
                    let dropped = self.engine.flush(role);
                    if dropped > 0 {
                        log::debug!("Flushed {} queued {} frames", dropped, role);
                    }
                }
                Action::SetActive => {
                    self.set_active(role, Some(address));
                }
                Action::ClearActive => {
                    self.set_active(role, None);
                }
                Action::ResolveCommand { request, success } => {
                    if role != self.control_role {
                        continue;
                    }
                    let mut success = success;
                    if success
                        && request == StreamRequest::Start
                        && (session_failed || !self.engine.has_session(role))
                    {
                        log::warn!("Peer {} started but no streaming session is running", address);
                        success = false;
                    }
                    self.resolutions.push((request, success));
                }
                Action::ArmGraceTimer => {
                    self.timers.retain(|t| t.address != address || t.role != role);
                    self.timers.push(GraceTimer {
                        deadline: Instant::now() + self.grace,
                        role,
                        address,
                    });
                }
                Action::ScheduleDelete => {
                    self.timers.retain(|t| t.address != address || t.role != role);
                    if let Some(registry) = self.registry_mut(role) {
                        registry.delete(&address);
                    }
                }
                Action::ConnectionRejected => self.observer.on_connection_rejected(role, address),
            }
        }
    }

    fn begin_session(&mut self, role: Role, address: PeerAddress) -> bool {
        let Some(registry) = self.registries.iter().find(|r| r.role() == role) else {
            return false;
        };
        let Some(peer) = registry.find(&address) else {
            return false;
        };
        self.engine.begin_session(role, peer)
    }

    fn set_active(&mut self, role: Role, address: Option<PeerAddress>) -> bool {
        let Some(registry) = self.registries.iter_mut().find(|r| r.role() == role) else {
            return false;
        };

        let previous = registry.active();
        let changed = registry.set_active(address, &mut self.engine);
        let current = registry.active();
        if previous != current {
            self.observer.on_active_peer_changed(role, current);
        }
        changed
    }

    fn active_peer(&self, role: Role) -> Option<(Role, PeerAddress)> {
        self.registry(role)?.active().map(|address| (role, address))
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Registered {
                address,
                handle,
                role,
            } => {
                let Some(registry) = self.registry_mut(role) else {
                    log::warn!("Registration for disabled {} role ignored", role);
                    return;
                };
                match registry.find_or_create(address, Some(handle)) {
                    Ok(_) => log::debug!("Peer {} registered with handle {}", address, handle),
                    Err(e) => log::warn!("Cannot register peer {}: {}", address, e),
                }
            }
            LinkEvent::RemotePending { address, role }
            | LinkEvent::RemoteSignalingOpened { address, role } => {
                if !self.admit(role, address) {
                    if matches!(event, LinkEvent::RemotePending { .. }) {
                        self.link.issue(LinkCommand::Close { peer: address });
                    }
                    return;
                }
                if let Some(peer_event) = event.peer_event() {
                    self.dispatch(role, address, peer_event);
                }
            }
            LinkEvent::CodecConfigured { peer, config } => {
                let Some((role, address)) = self.locate(peer) else {
                    log::warn!("Codec configuration for unknown peer {:?}", peer);
                    return;
                };
                log::info!(
                    "Peer {} codec: {} Hz, {} bit, {:?}, {} ms",
                    address,
                    config.audio.sample_rate,
                    config.audio.bits_per_sample,
                    config.audio.channel_mode,
                    config.interval_ms
                );
                if let Some(peer) = self.registry_mut(role).and_then(|r| r.find_mut(&address)) {
                    peer.set_codec_config(config);
                }
            }
            LinkEvent::DelayReport { peer, delay } => {
                let Some((role, address)) = self.locate(peer) else {
                    log::warn!("Delay report for unknown peer {:?}", peer);
                    return;
                };
                log::debug!("Peer {} delay report: {} (1/10 ms)", address, delay);
                if let Some(peer) = self.registry_mut(role).and_then(|r| r.find_mut(&address)) {
                    peer.set_delay_report(delay);
                }
            }
            LinkEvent::OffloadStarted { peer, success } => {
                let Some((role, address)) = self.locate(peer) else {
                    log::warn!("Offload result for unknown peer {:?}", peer);
                    return;
                };
                log::info!("Peer {} offload start: {}", address, success);
                if role == self.control_role {
                    self.resolutions.push((StreamRequest::OffloadStart, success));
                }
            }
            other => {
                let key = other.key();
                let Some((role, address)) = self.locate(key) else {
                    log::warn!("Link event for unknown peer {:?}: {:?}", key, other);
                    return;
                };
                if let Some(peer_event) = other.peer_event() {
                    self.dispatch(role, address, peer_event);
                }
            }
        }
    }

    fn on_api_request(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::Connect {
                address,
                role,
                done,
            } => {
                let ok = self.admit(role, address)
                    && self.dispatch(role, address, PeerEvent::ConnectRequest);
                done.complete(ok);
            }
            ApiRequest::Disconnect {
                address,
                role,
                done,
            } => {
                let ok = self.dispatch(role, address, PeerEvent::DisconnectRequest);
                done.complete(ok);
            }
            ApiRequest::Stream {
                role,
                request,
                done,
            } => {
                let ok = self.stream_request(role, request);
                done.complete(ok);
            }
            ApiRequest::SetActive {
                role,
                address,
                done,
            } => {
                let ok = self.set_active(role, address);
                done.complete(ok);
            }
            ApiRequest::SetCallActive(active) => {
                log::info!("Voice call {}", if active { "started" } else { "ended" });
                self.call_active = active;
            }
            ApiRequest::PeerState {
                address,
                role,
                reply,
            } => {
                let state = self
                    .registry(role)
                    .and_then(|r| r.find(&address))
                    .map(|p| p.state());
                let _ = reply.send(state);
            }
        }
    }

    fn stream_request(&mut self, role: Role, request: StreamRequest) -> bool {
        let Some((role, address)) = self.active_peer(role) else {
            log::warn!("{:?} with no active {} peer", request, role);
            return false;
        };

        let event = match request {
            StreamRequest::Start => PeerEvent::StartRequest,
            StreamRequest::Stop => PeerEvent::StopRequest,
            StreamRequest::Suspend => PeerEvent::SuspendRequest,
            StreamRequest::OffloadStart => {
                self.link.issue(LinkCommand::OffloadStart { peer: address });
                return true;
            }
        };
        self.dispatch(role, address, event)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    fn fire_timers(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.timers.drain(..).partition(|t| t.deadline <= now);
        self.timers = pending;

        for timer in due {
            let idle = self
                .registry(timer.role)
                .and_then(|r| r.find(&timer.address))
                .map(|p| p.state() == PeerState::Idle)
                .unwrap_or(false);
            if idle {
                log::info!(
                    "Peer {} opened signaling only, connecting after grace period",
                    timer.address
                );
                self.dispatch(timer.role, timer.address, PeerEvent::ConnectRequest);
            }
        }
    }

    fn control_peer(&self) -> Option<&Peer> {
        let registry = self.registry(self.control_role)?;
        registry.find(&registry.active()?)
    }
}

impl ControlContext for CoreState {
    fn control_role(&self) -> Role {
        self.control_role
    }

    fn call_active(&self) -> bool {
        self.call_active
    }

    fn any_peer_ready(&self) -> bool {
        self.registry(self.control_role)
            .map(|r| r.peers().any(|p| p.is_connected()))
            .unwrap_or(false)
    }

    fn stream_peer(&self) -> Option<(PeerState, PeerFlags)> {
        self.control_peer().map(|p| (p.state(), p.flags()))
    }

    fn request(&mut self, request: StreamRequest) -> bool {
        self.stream_request(self.control_role, request)
    }

    fn clear_remote_suspend(&mut self) {
        let role = self.control_role;
        let Some(registry) = self.registry_mut(role) else {
            return;
        };
        let Some(address) = registry.active() else {
            return;
        };
        if let Some(peer) = registry.find_mut(&address) {
            peer.flags.remove(PeerFlags::REMOTE_SUSPEND);
        }
    }

    fn offload_enabled(&self) -> bool {
        self.offload
    }

    fn input_config(&self) -> AudioConfig {
        self.registry(Role::Sink)
            .and_then(|r| r.find(&r.active()?))
            .and_then(|p| p.codec_config())
            .map(|c| c.audio)
            .unwrap_or(self.default_audio)
    }

    fn output_config(&self) -> AudioConfig {
        if let Some(config) = self.output_override {
            return config;
        }
        self.registry(Role::Source)
            .and_then(|r| r.find(&r.active()?))
            .and_then(|p| p.codec_config())
            .map(|c| c.audio)
            .unwrap_or(self.default_audio)
    }

    fn set_output_config(&mut self, config: AudioConfig) {
        self.output_override = Some(config);
        self.engine.update_feeding(Role::Source, config);
    }

    fn position(&self) -> PresentationPosition {
        PresentationPosition {
            bytes: self.engine.directory().total_bytes(self.control_role),
            delay: self.control_peer().map(|p| p.delay_report()).unwrap_or(0),
            timestamp_us: self.clock.now_micros(),
        }
    }

    fn session_interval_ms(&self) -> u64 {
        self.engine
            .session_interval(self.control_role)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

struct Executor {
    rx: Receiver<ServiceMessage>,
    core: CoreState,
    control: ControlHandler,
}

impl Executor {
    fn run(mut self) {
        log::debug!("Service executor running");

        loop {
            self.core.fire_timers(Instant::now());
            self.drain_resolutions();

            let message = match self.core.next_deadline() {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                ServiceMessage::Shutdown => break,
                ServiceMessage::Link(event) => self.core.on_link_event(event),
                ServiceMessage::Api(request) => self.core.on_api_request(request),
                ServiceMessage::ControlOpened => self.control.on_client_opened(),
                ServiceMessage::ControlClosed => self.control.on_client_closed(),
                ServiceMessage::ControlDataReady => self.control.on_data_ready(&mut self.core),
            }
            self.drain_resolutions();
        }

        self.control.set_shutting_down();
        self.core.engine.stop_all();
        log::debug!("Service executor stopped");
    }

    fn drain_resolutions(&mut self) {
        loop {
            let batch = std::mem::take(&mut self.core.resolutions);
            if batch.is_empty() {
                break;
            }
            for (request, success) in batch {
                self.control.resolve(request, success, &mut self.core);
            }
        }
    }
}

/// Cloneable handle for driving a running service
#[derive(Clone)]
pub struct ServiceHandle {
    tx: Sender<ServiceMessage>,
    directory: SessionDirectory,
    active: HashMap<Role, ActivePeer>,
}

impl ServiceHandle {
    fn request(&self, build: impl FnOnce(Completion) -> ApiRequest) -> CompletionHandle {
        let (done, handle) = Completion::channel();
        if self.tx.send(ServiceMessage::Api(build(done))).is_err() {
            log::warn!("Service is stopped, request dropped");
        }
        handle
    }

    /// Connect to a peer in the given local role
    pub fn connect(&self, address: PeerAddress, role: Role) -> CompletionHandle {
        self.request(|done| ApiRequest::Connect {
            address,
            role,
            done,
        })
    }

    /// Disconnect a peer
    pub fn disconnect(&self, address: PeerAddress, role: Role) -> CompletionHandle {
        self.request(|done| ApiRequest::Disconnect {
            address,
            role,
            done,
        })
    }

    /// Ask the role's active peer to start streaming
    pub fn start_stream(&self, role: Role) -> CompletionHandle {
        self.request(|done| ApiRequest::Stream {
            role,
            request: StreamRequest::Start,
            done,
        })
    }

    /// Ask the role's active peer to stop streaming
    pub fn stop_stream(&self, role: Role) -> CompletionHandle {
        self.request(|done| ApiRequest::Stream {
            role,
            request: StreamRequest::Stop,
            done,
        })
    }

    /// Ask the role's active peer to suspend streaming
    pub fn suspend_stream(&self, role: Role) -> CompletionHandle {
        self.request(|done| ApiRequest::Stream {
            role,
            request: StreamRequest::Suspend,
            done,
        })
    }

    /// Change (or clear) the role's active peer
    ///
    /// The completion fires once the previous session is torn down and the
    /// new one is running.
    pub fn set_active_peer(&self, role: Role, address: Option<PeerAddress>) -> CompletionHandle {
        self.request(|done| ApiRequest::SetActive {
            role,
            address,
            done,
        })
    }

    /// Record whether a voice call owns the audio path
    pub fn set_call_active(&self, active: bool) {
        let _ = self
            .tx
            .send(ServiceMessage::Api(ApiRequest::SetCallActive(active)));
    }

    /// Connection state of a peer, `None` if unknown or the service stopped
    pub fn peer_state(&self, address: PeerAddress, role: Role) -> Option<PeerState> {
        let (reply, rx) = channel::bounded(1);
        self.tx
            .send(ServiceMessage::Api(ApiRequest::PeerState {
                address,
                role,
                reply,
            }))
            .ok()?;
        rx.recv().ok().flatten()
    }

    /// The role's active peer
    pub fn active_peer(&self, role: Role) -> Option<PeerAddress> {
        self.active.get(&role).and_then(|a| a.get())
    }

    /// Statistics of the role's streaming session
    pub fn session_stats(&self, role: Role) -> Option<SessionStats> {
        self.directory.stats(role)
    }

    /// Bytes streamed for the role since the service started
    pub fn total_bytes(&self, role: Role) -> u64 {
        self.directory.total_bytes(role)
    }

    /// Sender for injecting link events
    pub fn event_sender(&self) -> EventSender {
        EventSender::new(self.tx.clone())
    }
}

/// Builder for [`LinkService`]
pub struct LinkServiceBuilder {
    config: ServiceConfig,
    tx: Sender<ServiceMessage>,
    rx: Receiver<ServiceMessage>,
    link: Option<Box<dyn LinkLayer>>,
    codecs: Vec<(Role, Box<dyn CodecProvider>)>,
    observer: Box<dyn StatusObserver>,
}

impl LinkServiceBuilder {
    /// Sender the link layer reports its events through
    pub fn event_sender(&self) -> EventSender {
        EventSender::new(self.tx.clone())
    }

    /// Set the link layer
    pub fn link(mut self, link: Box<dyn LinkLayer>) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the codec provider for a role (defaults to [`PcmCodec`])
    pub fn codec(mut self, role: Role, codec: Box<dyn CodecProvider>) -> Self {
        self.codecs.retain(|(r, _)| *r != role);
        self.codecs.push((role, codec));
        self
    }

    /// Set the status observer (defaults to [`LogObserver`])
    pub fn observer(mut self, observer: Box<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Open the channels and start the executor
    pub fn start(self) -> Result<LinkService> {
        let config = self.config;
        config.validate()?;
        let control_role = config
            .control_role()
            .ok_or_else(|| Error::Config("no role enabled".to_string()))?;
        let link = self
            .link
            .ok_or_else(|| Error::Link("no link layer configured".to_string()))?;

        let transport = Arc::new(Transport::new());

        let mut engine = StreamingEngine::new(transport.clone(), AUDIO_CHANNEL)
            .with_queue_bounds(config.source_queue_frames, config.sink_queue_frames)
            .with_default_codec(config.default_codec());
        let mut codecs = self.codecs;
        for role in &config.roles {
            let codec = match codecs.iter().position(|(r, _)| r == role) {
                Some(index) => codecs.swap_remove(index).1,
                None => default_codec(*role, config.tone_frequency),
            };
            engine.register_codec(*role, codec);
        }

        let registries: Vec<PeerRegistry> = config
            .roles
            .iter()
            .map(|role| PeerRegistry::new(*role, config.max_peers, config.max_connected))
            .collect();
        let active = registries
            .iter()
            .map(|r| (r.role(), r.active_handle()))
            .collect();

        let inbound = config
            .roles
            .contains(&Role::Sink)
            .then(|| engine.sink_inbound());
        let directory = engine.directory();
        let clock = engine.clock();

        let control_listener = Arc::new(ControlListener {
            tx: self.tx.clone(),
        });
        if !transport.open(CONTROL_CHANNEL, control_listener, &config.control_path) {
            return Err(Error::Transport(format!(
                "cannot open control channel at {}",
                config.control_path.display()
            )));
        }
        transport.configure(
            CONTROL_CHANNEL,
            ChannelOption::SetReadPollTimeout(Duration::from_millis(config.control_poll_timeout_ms)),
        );

        let data_listener = Arc::new(DataListener {
            transport: Arc::downgrade(&transport),
            inbound,
        });
        if !transport.open(AUDIO_CHANNEL, data_listener, &config.data_path) {
            transport.close(ChannelTarget::All);
            return Err(Error::Transport(format!(
                "cannot open data channel at {}",
                config.data_path.display()
            )));
        }
        transport.configure(
            AUDIO_CHANNEL,
            ChannelOption::SetReadPollTimeout(Duration::from_millis(config.data_poll_timeout_ms)),
        );

        let core = CoreState {
            registries,
            engine,
            link,
            observer: self.observer,
            timers: Vec::new(),
            resolutions: Vec::new(),
            control_role,
            call_active: false,
            offload: config.offload,
            grace: config.signaling_grace(),
            default_audio: config.audio,
            output_override: None,
            clock,
        };
        let executor = Executor {
            rx: self.rx,
            core,
            control: ControlHandler::new(Box::new(TransportControl::new(
                transport.clone(),
                CONTROL_CHANNEL,
            ))),
        };

        let thread = std::thread::Builder::new()
            .name("a2dp-executor".to_string())
            .spawn(move || executor.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                transport.close(ChannelTarget::All);
                return Err(Error::Io(e));
            }
        };

        log::info!(
            "Link service started: roles {:?}, control on {}",
            config.roles,
            control_role
        );

        Ok(LinkService {
            handle: ServiceHandle {
                tx: self.tx,
                directory,
                active,
            },
            transport,
            executor: Some(thread),
        })
    }
}

fn default_codec(role: Role, tone_frequency: f64) -> Box<dyn CodecProvider> {
    let source: Box<dyn PcmSource> = match role {
        Role::Source if tone_frequency > 0.0 => Box::new(ToneSource::new(tone_frequency)),
        _ => Box::new(SilenceSource),
    };
    Box::new(PcmCodec::new(source, Box::new(CountingSink::new())))
}

/// Running link service
///
/// Owns the transport and the executor thread. Dropping it shuts both down.
pub struct LinkService {
    handle: ServiceHandle,
    transport: Arc<Transport>,
    executor: Option<JoinHandle<()>>,
}

impl LinkService {
    /// Start building a service
    pub fn builder(config: ServiceConfig) -> LinkServiceBuilder {
        let (tx, rx) = channel::unbounded();
        LinkServiceBuilder {
            config,
            tx,
            rx,
            link: None,
            codecs: Vec::new(),
            observer: Box::new(LogObserver),
        }
    }

    /// Handle for driving the service
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Transport serving the control and data channels
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    /// Stop the executor, then close every channel
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(executor) = self.executor.take() else {
            return;
        };

        let _ = self.handle.tx.send(ServiceMessage::Shutdown);
        if executor.join().is_err() {
            log::error!("Service executor panicked");
        }
        self.transport.close(ChannelTarget::All);
        log::info!("Link service stopped");
    }
}

impl Drop for LinkService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LoopbackLink;
    use crate::peer::{AudioState, ConnectionState};
    use parking_lot::Mutex;

    const PEER: PeerAddress = PeerAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

    fn socket_config(name: &str) -> ServiceConfig {
        let base = std::env::temp_dir().join(format!("a2dp-svc-{}-{}", std::process::id(), name));
        ServiceConfig::new()
            .control_path(base.with_extension("ctrl"))
            .data_path(base.with_extension("data"))
    }

    #[derive(Clone, Default)]
    struct Reports(Arc<Mutex<Vec<String>>>);

    impl StatusObserver for Reports {
        fn on_connection_state(&mut self, _role: Role, _peer: PeerAddress, state: ConnectionState) {
            self.0.lock().push(format!("{:?}", state));
        }

        fn on_audio_state(&mut self, _role: Role, _peer: PeerAddress, state: AudioState) {
            self.0.lock().push(format!("audio {:?}", state));
        }

        fn on_connection_rejected(&mut self, _role: Role, _peer: PeerAddress) {
            self.0.lock().push("rejected".to_string());
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_start_requires_link() {
        let result = LinkService::builder(socket_config("nolink")).start();
        assert!(matches!(result, Err(Error::Link(_))));
    }

    #[test]
    fn test_connect_and_stream_with_loopback() {
        let reports = Reports::default();
        let builder = LinkService::builder(socket_config("loopback"));
        let link = LoopbackLink::new(builder.event_sender());
        let service = builder
            .link(Box::new(link))
            .observer(Box::new(reports.clone()))
            .start()
            .unwrap();
        let handle = service.handle();

        assert!(handle.connect(PEER, Role::Source).wait());
        assert!(wait_for(|| handle.peer_state(PEER, Role::Source) == Some(PeerState::Opened)));
        assert_eq!(handle.active_peer(Role::Source), Some(PEER));

        assert!(handle.start_stream(Role::Source).wait());
        assert!(wait_for(|| handle.session_stats(Role::Source).is_some()));
        assert_eq!(handle.session_stats(Role::Source).unwrap().interval_ms, 20);

        assert!(handle.stop_stream(Role::Source).wait());
        assert!(wait_for(|| handle.session_stats(Role::Source).is_none()));

        assert!(handle.disconnect(PEER, Role::Source).wait());
        assert!(wait_for(|| handle.peer_state(PEER, Role::Source).is_none()));
        service.shutdown();

        let reports = reports.0.lock().clone();
        assert_eq!(reports.iter().filter(|r| *r == "Connected").count(), 1);
        assert!(reports.contains(&"audio Started".to_string()));
        assert_eq!(reports.last().map(String::as_str), Some("Disconnected"));
    }

    #[test]
    fn test_admission_limit_rejects_second_peer() {
        let reports = Reports::default();
        let builder = LinkService::builder(socket_config("admission"));
        let link = LoopbackLink::new(builder.event_sender());
        let service = builder
            .link(Box::new(link))
            .observer(Box::new(reports.clone()))
            .start()
            .unwrap();
        let handle = service.handle();

        assert!(handle.connect(PEER, Role::Source).wait());
        let other = PeerAddress::new([9; 6]);
        assert!(!handle.connect(other, Role::Source).wait());
        service.shutdown();

        assert!(reports.0.lock().contains(&"rejected".to_string()));
    }

    #[test]
    fn test_requests_after_shutdown_complete_false() {
        let builder = LinkService::builder(socket_config("after"));
        let link = LoopbackLink::new(builder.event_sender());
        let service = builder.link(Box::new(link)).start().unwrap();
        let handle = service.handle();
        service.shutdown();

        assert!(!handle.connect(PEER, Role::Source).wait());
        assert!(!handle.start_stream(Role::Source).wait());
        assert_eq!(handle.peer_state(PEER, Role::Source), None);
    }

    #[test]
    fn test_stream_request_without_active_peer_fails() {
        let builder = LinkService::builder(socket_config("noactive"));
        let link = LoopbackLink::new(builder.event_sender());
        let service = builder.link(Box::new(link)).start().unwrap();

        assert!(!service.handle().start_stream(Role::Source).wait());
        service.shutdown();
    }
}
