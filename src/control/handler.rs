// ABOUTME: Control protocol handler
// ABOUTME: Decodes commands from the control channel, runs them against peer state and writes acks

use crate::control::protocol::{
    encode_audio_config, AckCode, CommandCode, ControlCommand, PresentationPosition,
};
use crate::peer::{PeerFlags, PeerState, Role, StreamRequest};
use crate::streaming::AudioConfig;
use crate::transport::{ChannelId, Transport};
use std::collections::VecDeque;
use std::sync::Arc;

/// Commands allowed to wait behind a pending one
pub const MAX_DEFERRED: usize = 8;

/// Byte pipe the handler speaks over
pub trait ControlChannel: Send {
    /// Bytes ready to read without waiting
    fn available(&self) -> usize;

    /// Read up to `buf.len()` bytes, waiting at most the channel's poll timeout
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write all of `bytes`; false if no client took them
    fn write(&mut self, bytes: &[u8]) -> bool;
}

/// [`ControlChannel`] backed by a transport channel
pub struct TransportControl {
    transport: Arc<Transport>,
    channel: ChannelId,
}

impl TransportControl {
    /// Speak over `channel` of `transport`
    pub fn new(transport: Arc<Transport>, channel: ChannelId) -> Self {
        Self { transport, channel }
    }
}

impl ControlChannel for TransportControl {
    fn available(&self) -> usize {
        self.transport.available(self.channel)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.transport.read(self.channel, buf)
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        self.transport.send(self.channel, bytes)
    }
}

/// Peer and streaming state the handler consults and drives
pub trait ControlContext {
    /// Role the control channel speaks for
    fn control_role(&self) -> Role;

    /// Whether a voice call currently owns the audio path
    fn call_active(&self) -> bool;

    /// Whether some peer is `Opened` or `Started`
    fn any_peer_ready(&self) -> bool;

    /// State and flags of the control role's active peer
    fn stream_peer(&self) -> Option<(PeerState, PeerFlags)>;

    /// Feed a request to the active peer's state machine; false if there is none
    fn request(&mut self, request: StreamRequest) -> bool;

    /// Forget that the remote suspended the stream
    fn clear_remote_suspend(&mut self);

    /// Whether a hardware offload path exists
    fn offload_enabled(&self) -> bool;

    /// Configuration of audio received from the link
    fn input_config(&self) -> AudioConfig;

    /// Configuration of audio fed to the link
    fn output_config(&self) -> AudioConfig;

    /// Apply a new output feeding configuration
    fn set_output_config(&mut self, config: AudioConfig);

    /// Current playback position
    fn position(&self) -> PresentationPosition;

    /// Tick interval of the control role's session, 0 without one
    fn session_interval_ms(&self) -> u64;
}

enum Reply {
    Ack(AckCode),
    AckWith(AckCode, Vec<u8>),
    Deferred,
}

/// Control protocol handler
///
/// At most one command waits for a link confirmation at a time. Commands that
/// arrive meanwhile are queued and run in order once it resolves; position
/// queries are answered immediately.
pub struct ControlHandler {
    channel: Box<dyn ControlChannel>,
    pending: Option<ControlCommand>,
    deferred: VecDeque<ControlCommand>,
    shutting_down: bool,
    last_position: Option<PresentationPosition>,
}

impl ControlHandler {
    /// Create a handler speaking over `channel`
    pub fn new(channel: Box<dyn ControlChannel>) -> Self {
        Self {
            channel,
            pending: None,
            deferred: VecDeque::new(),
            shutting_down: false,
            last_position: None,
        }
    }

    /// Command waiting for its ack
    pub fn pending(&self) -> Option<ControlCommand> {
        self.pending
    }

    /// Commands queued behind the pending one
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Position recorded by the last start confirmation or position query
    pub fn last_position(&self) -> Option<PresentationPosition> {
        self.last_position
    }

    /// Refuse readiness from now on
    pub fn set_shutting_down(&mut self) {
        self.shutting_down = true;
    }

    /// Read and run every command buffered on the channel
    pub fn on_data_ready(&mut self, ctx: &mut dyn ControlContext) {
        while self.channel.available() > 0 {
            let mut code = [0u8; 1];
            if self.channel.read(&mut code) == 0 {
                break;
            }

            let payload_len = CommandCode::from_byte(code[0])
                .map(|c| c.request_payload_len())
                .unwrap_or(0);
            let payload = self.read_payload(payload_len);
            let command = ControlCommand::decode(code[0], &payload);
            self.submit(command, ctx);
        }
    }

    /// Run a command now, or queue it behind the pending one
    pub fn submit(&mut self, command: ControlCommand, ctx: &mut dyn ControlContext) {
        if command == ControlCommand::GetPresentationPosition {
            self.execute(command, ctx);
            return;
        }

        if self.pending.is_some() || !self.deferred.is_empty() {
            if self.deferred.len() >= MAX_DEFERRED {
                log::warn!(
                    "Control: {} commands already queued, refusing {:?}",
                    self.deferred.len(),
                    command
                );
                self.write_reply(AckCode::Failure, &[]);
                return;
            }
            log::debug!(
                "Control: {:?} queued behind {:?}",
                command,
                self.pending
            );
            self.deferred.push_back(command);
            return;
        }

        self.execute(command, ctx);
    }

    /// Deliver the link's answer to the pending command
    ///
    /// Without a matching pending command this only logs.
    pub fn resolve(&mut self, request: StreamRequest, success: bool, ctx: &mut dyn ControlContext) {
        let Some(command) = self.pending else {
            log::debug!(
                "Control: {:?} resolution ({}) with no pending command",
                request,
                success
            );
            return;
        };

        if request_for(&command) != Some(request) {
            log::warn!(
                "Control: {:?} resolution does not match pending {:?}",
                request,
                command
            );
            return;
        }
        self.pending = None;

        if success && request == StreamRequest::Start {
            let interval = ctx.session_interval_ms();
            assert!(
                interval > 0,
                "start acknowledged without an initialized codec interval"
            );
            self.last_position = Some(ctx.position());
        }

        let ack = if success {
            AckCode::Success
        } else {
            AckCode::Failure
        };
        log::debug!("Control: {:?} resolved with {}", command, ack);
        self.write_reply(ack, &[]);

        self.run_deferred(ctx);
    }

    /// Audio subsystem connected to the control channel
    pub fn on_client_opened(&mut self) {
        log::info!("Control client connected");
    }

    /// Audio subsystem went away; drop everything in flight
    pub fn on_client_closed(&mut self) {
        if let Some(command) = self.pending.take() {
            log::info!("Control client gone, dropping pending {:?}", command);
        }
        if !self.deferred.is_empty() {
            log::info!(
                "Control client gone, dropping {} queued commands",
                self.deferred.len()
            );
            self.deferred.clear();
        }
    }

    fn read_payload(&mut self, len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.channel.read(&mut payload[filled..]);
            if n == 0 {
                log::warn!("Control: payload truncated at {} of {} bytes", filled, len);
                break;
            }
            filled += n;
        }
        payload.truncate(filled);
        payload
    }

    fn run_deferred(&mut self, ctx: &mut dyn ControlContext) {
        while self.pending.is_none() {
            let Some(command) = self.deferred.pop_front() else {
                break;
            };
            self.execute(command, ctx);
        }
    }

    fn execute(&mut self, command: ControlCommand, ctx: &mut dyn ControlContext) {
        let reply = self.dispatch(command, ctx);
        match reply {
            Reply::Ack(ack) => {
                log::debug!("Control: {:?} -> {}", command, ack);
                self.write_reply(ack, &[]);
            }
            Reply::AckWith(ack, payload) => {
                log::debug!("Control: {:?} -> {} (+{} bytes)", command, ack, payload.len());
                self.write_reply(ack, &payload);
            }
            Reply::Deferred => {
                log::debug!("Control: {:?} awaiting link confirmation", command);
                self.pending = Some(command);
            }
        }
    }

    fn dispatch(&mut self, command: ControlCommand, ctx: &mut dyn ControlContext) -> Reply {
        match command {
            ControlCommand::CheckReady => {
                if !self.shutting_down && ctx.any_peer_ready() {
                    Reply::Ack(AckCode::Success)
                } else {
                    Reply::Ack(AckCode::Failure)
                }
            }
            ControlCommand::Start => self.start(ctx),
            ControlCommand::Stop => {
                if let Some((PeerState::Started, flags)) = ctx.stream_peer() {
                    if !flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING) {
                        ctx.request(StreamRequest::Stop);
                    }
                }
                Reply::Ack(AckCode::Success)
            }
            ControlCommand::Suspend => match ctx.stream_peer() {
                Some((PeerState::Started, flags)) => {
                    if flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING) {
                        Reply::Ack(AckCode::Success)
                    } else if ctx.request(StreamRequest::Suspend) {
                        Reply::Deferred
                    } else {
                        Reply::Ack(AckCode::Failure)
                    }
                }
                _ => {
                    ctx.clear_remote_suspend();
                    Reply::Ack(AckCode::Success)
                }
            },
            ControlCommand::GetInputAudioConfig => Reply::AckWith(
                AckCode::Success,
                encode_audio_config(&ctx.input_config()).to_vec(),
            ),
            ControlCommand::GetOutputAudioConfig => Reply::AckWith(
                AckCode::Success,
                encode_audio_config(&ctx.output_config()).to_vec(),
            ),
            ControlCommand::SetOutputAudioConfig(config) => {
                log::info!(
                    "Output feeding now {} Hz, {} bit, {:?}",
                    config.sample_rate,
                    config.bits_per_sample,
                    config.channel_mode
                );
                ctx.set_output_config(config);
                Reply::Ack(AckCode::Success)
            }
            ControlCommand::OffloadStart => {
                if !ctx.offload_enabled() {
                    return Reply::Ack(AckCode::Unsupported);
                }
                match ctx.stream_peer() {
                    Some((PeerState::Started, _)) if ctx.request(StreamRequest::OffloadStart) => {
                        Reply::Deferred
                    }
                    _ => Reply::Ack(AckCode::Failure),
                }
            }
            ControlCommand::GetPresentationPosition => {
                let position = ctx.position();
                self.last_position = Some(position);
                Reply::AckWith(AckCode::Success, position.encode().to_vec())
            }
            ControlCommand::Malformed(_) | ControlCommand::Unknown(_) => {
                log::warn!("Control: rejecting {:?}", command);
                Reply::Ack(AckCode::Failure)
            }
        }
    }

    fn start(&mut self, ctx: &mut dyn ControlContext) -> Reply {
        if ctx.call_active() {
            log::info!("Control: start refused during a voice call");
            return Reply::Ack(AckCode::InCallFailure);
        }

        match ctx.stream_peer() {
            Some((PeerState::Started, _)) => Reply::Ack(AckCode::Success),
            Some((PeerState::Opened, flags)) if link_ready(flags) => {
                if !ctx.request(StreamRequest::Start) {
                    Reply::Ack(AckCode::Failure)
                } else if ctx.control_role() == Role::Sink {
                    Reply::Ack(AckCode::Success)
                } else {
                    Reply::Deferred
                }
            }
            Some((PeerState::Closing, _)) => Reply::Ack(AckCode::DisconnectInProgress),
            state => {
                log::warn!("Control: start refused, stream peer {:?}", state);
                Reply::Ack(AckCode::Failure)
            }
        }
    }

    fn write_reply(&mut self, ack: AckCode, payload: &[u8]) {
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(ack.as_byte());
        bytes.extend_from_slice(payload);
        if !self.channel.write(&bytes) {
            log::warn!("Control: ack {} not delivered", ack);
        }
    }
}

fn link_ready(flags: PeerFlags) -> bool {
    !flags.contains(PeerFlags::REMOTE_SUSPEND)
        && !flags.contains(PeerFlags::PENDING_START)
        && !flags.contains(PeerFlags::PENDING_STOP)
        && !flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING)
}

fn request_for(command: &ControlCommand) -> Option<StreamRequest> {
    match command {
        ControlCommand::Start => Some(StreamRequest::Start),
        ControlCommand::Suspend => Some(StreamRequest::Suspend),
        ControlCommand::OffloadStart => Some(StreamRequest::OffloadStart),
        _ => None,
    }
}
