// ABOUTME: Per-peer connection state machine
// ABOUTME: Maps (state, event) to the next state plus the side effects the service must perform

use super::{AudioState, ConnectionState, Peer, PeerFlags, Role};
use crate::link::LinkCommand;
use serde::Serialize;
use std::fmt;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Initial and terminal state
    Idle,
    /// Link open requested
    Opening,
    /// Link open, not streaming
    Opened,
    /// Streaming
    Started,
    /// Link close requested
    Closing,
}

impl PeerState {
    /// All states, in lifecycle order
    pub const ALL: [PeerState; 5] = [
        PeerState::Idle,
        PeerState::Opening,
        PeerState::Opened,
        PeerState::Started,
        PeerState::Closing,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Opening => "opening",
            PeerState::Opened => "opened",
            PeerState::Started => "started",
            PeerState::Closing => "closing",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side initiated a link operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// This side
    Local,
    /// The remote peer
    Remote,
}

/// Inputs to the state machine: local requests and link-layer events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local request to connect
    ConnectRequest,
    /// Local request to disconnect
    DisconnectRequest,
    /// Local request to start streaming
    StartRequest,
    /// Local request to stop streaming
    StopRequest,
    /// Local request to suspend streaming
    SuspendRequest,
    /// Remote peer is connecting
    RemotePending,
    /// Remote opened signaling without opening the media link
    RemoteSignalingOpened,
    /// Link open completed
    LinkOpened {
        /// Open succeeded
        success: bool,
        /// EDR capability bits
        edr_caps: u8,
    },
    /// Link open rejected
    LinkRejected,
    /// Local ACL link dropped while opening
    LocalAclDropped,
    /// ACL link disconnected
    AclDisconnected,
    /// Streaming start completed
    LinkStarted {
        /// Start succeeded
        success: bool,
        /// Link is about to suspend right away
        suspending: bool,
        /// Who initiated the start
        initiator: Initiator,
    },
    /// Streaming suspend completed
    LinkSuspended {
        /// Suspend succeeded
        success: bool,
        /// Who initiated the suspend
        initiator: Initiator,
    },
    /// Streaming stop completed
    LinkStopped {
        /// Stop succeeded
        success: bool,
    },
    /// Link closed
    LinkClosed,
}

/// Registry facts the transition function needs
#[derive(Debug, Clone, Copy, Default)]
pub struct EventContext {
    /// Admission policy allows this peer to connect
    pub allowed_to_connect: bool,
    /// This peer is the active peer for its role
    pub is_active: bool,
    /// Some peer is active for this role
    pub role_has_active_peer: bool,
}

/// Streaming request a control command maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// Start streaming
    Start,
    /// Stop streaming
    Stop,
    /// Suspend streaming
    Suspend,
    /// Start the hardware offload path
    OffloadStart,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Issue a command to the link layer
    Link(LinkCommand),
    /// Report a connection state change
    ReportConnection(ConnectionState),
    /// Report an audio state change
    ReportAudio(AudioState),
    /// Start the streaming session for this peer
    StartSession,
    /// Stop the streaming session for this peer's role
    StopSession,
    /// Toggle the session's discard flag
    SetDiscarding(bool),
    /// Drain the session queue
    FlushSession,
    /// Make this peer the active one
    SetActive,
    /// Clear the active peer for this role
    ClearActive,
    /// Resolve the pending control command
    ResolveCommand {
        /// Request the link confirmed or refused
        request: StreamRequest,
        /// Outcome delivered in the ack
        success: bool,
    },
    /// Arm the signaling grace timer
    ArmGraceTimer,
    /// Remove this peer from the registry
    ScheduleDelete,
    /// Admission policy rejected the peer
    ConnectionRejected,
}

/// Outcome of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Whether the state handled the event
    pub handled: bool,
    /// State before the event
    pub from: PeerState,
    /// State after the event
    pub to: PeerState,
    /// Side effects, in order
    pub actions: Vec<Action>,
}

impl Peer {
    /// Feed one event through the state machine
    ///
    /// Events the current state does not handle leave the peer untouched and
    /// come back with `handled == false`.
    pub fn process_event(&mut self, event: &PeerEvent, ctx: &EventContext) -> Transition {
        let from = self.state;
        let mut actions = Vec::new();

        let handled = match from {
            PeerState::Idle => self.on_idle(event, ctx, &mut actions),
            PeerState::Opening => self.on_opening(event, ctx, &mut actions),
            PeerState::Opened => self.on_opened(event, ctx, &mut actions),
            PeerState::Started => self.on_started(event, ctx, &mut actions),
            PeerState::Closing => self.on_closing(event, ctx, &mut actions),
        };

        if handled {
            log::debug!(
                "Peer {} ({}): {:?} in {} -> {}",
                self.address,
                self.role,
                event,
                from,
                self.state
            );
        } else {
            log::debug!(
                "Peer {} ({}): unhandled {:?} in {}",
                self.address,
                self.role,
                event,
                from
            );
        }

        Transition {
            handled,
            from,
            to: self.state,
            actions,
        }
    }

    fn change_state(&mut self, to: PeerState, ctx: &EventContext, actions: &mut Vec<Action>) {
        let from = self.state;
        if from == PeerState::Started && ctx.is_active {
            actions.push(Action::StopSession);
        }

        self.previous = Some(from);
        self.state = to;

        match to {
            PeerState::Idle => {
                self.fail_pending(actions);
                self.flags.clear();
                if ctx.is_active {
                    actions.push(Action::ClearActive);
                }
                if self.can_be_deleted() {
                    actions.push(Action::ScheduleDelete);
                }
            }
            PeerState::Opening => {
                actions.push(Action::ReportConnection(ConnectionState::Connecting));
            }
            PeerState::Started => {
                self.flags.remove(PeerFlags::REMOTE_SUSPEND);
                actions.push(Action::ReportAudio(AudioState::Started));
            }
            PeerState::Closing => self.fail_pending(actions),
            PeerState::Opened => {}
        }
    }

    /// Fail any start or suspend still waiting on the link
    fn fail_pending(&mut self, actions: &mut Vec<Action>) {
        if self.flags.contains(PeerFlags::PENDING_START) {
            actions.push(Action::ResolveCommand {
                request: StreamRequest::Start,
                success: false,
            });
        }
        if self.flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING)
            && !self.flags.contains(PeerFlags::PENDING_STOP)
        {
            actions.push(Action::ResolveCommand {
                request: StreamRequest::Suspend,
                success: false,
            });
        }
        self.flags.remove(PeerFlags::PENDING_START);
        self.flags.remove(PeerFlags::LOCAL_SUSPEND_PENDING);
    }

    fn disconnected(&mut self, ctx: &EventContext, actions: &mut Vec<Action>) {
        actions.push(Action::ReportConnection(ConnectionState::Disconnected));
        self.change_state(PeerState::Idle, ctx, actions);
    }

    fn on_idle(&mut self, event: &PeerEvent, ctx: &EventContext, actions: &mut Vec<Action>) -> bool {
        match event {
            PeerEvent::ConnectRequest | PeerEvent::RemotePending => {
                if !ctx.allowed_to_connect {
                    log::warn!("Peer {} rejected: too many connected peers", self.address);
                    actions.push(Action::ConnectionRejected);
                    if *event == PeerEvent::RemotePending {
                        actions.push(Action::Link(LinkCommand::Close { peer: self.address }));
                    }
                    return true;
                }

                actions.push(Action::Link(LinkCommand::Open {
                    peer: self.address,
                    role: self.role,
                }));
                self.change_state(PeerState::Opening, ctx, actions);
                true
            }
            PeerEvent::RemoteSignalingOpened => {
                actions.push(Action::ArmGraceTimer);
                true
            }
            PeerEvent::AclDisconnected => true,
            _ => false,
        }
    }

    fn on_opening(&mut self, event: &PeerEvent, ctx: &EventContext, actions: &mut Vec<Action>) -> bool {
        match *event {
            PeerEvent::LinkOpened {
                success: true,
                edr_caps,
            } => {
                if !ctx.allowed_to_connect {
                    log::warn!("Peer {} opened but admission now denies it", self.address);
                    actions.push(Action::ConnectionRejected);
                    actions.push(Action::Link(LinkCommand::Close { peer: self.address }));
                    self.disconnected(ctx, actions);
                    return true;
                }

                self.edr = edr_caps;
                actions.push(Action::ReportConnection(ConnectionState::Connected));
                if self.role == Role::Source && !ctx.role_has_active_peer {
                    actions.push(Action::SetActive);
                }
                self.change_state(PeerState::Opened, ctx, actions);
                true
            }
            PeerEvent::LinkOpened { success: false, .. }
            | PeerEvent::LinkRejected
            | PeerEvent::LocalAclDropped
            | PeerEvent::AclDisconnected => {
                self.disconnected(ctx, actions);
                true
            }
            _ => false,
        }
    }

    fn on_opened(&mut self, event: &PeerEvent, ctx: &EventContext, actions: &mut Vec<Action>) -> bool {
        match *event {
            PeerEvent::StartRequest => {
                actions.push(Action::Link(LinkCommand::Start { peer: self.address }));
                self.flags.insert(PeerFlags::PENDING_START);
                true
            }
            PeerEvent::LinkStarted {
                success,
                suspending,
                initiator,
            } => {
                let local_start = self.flags.contains(PeerFlags::PENDING_START);
                self.flags.remove(PeerFlags::PENDING_START);

                if !success || suspending {
                    if local_start {
                        actions.push(Action::ResolveCommand {
                            request: StreamRequest::Start,
                            success: false,
                        });
                    }
                    return true;
                }

                if ctx.is_active {
                    actions.push(Action::StartSession);
                }
                if local_start {
                    actions.push(Action::ResolveCommand {
                        request: StreamRequest::Start,
                        success: true,
                    });
                }
                if self.role == Role::Source
                    && !ctx.is_active
                    && initiator == Initiator::Remote
                    && !local_start
                {
                    log::info!("Peer {} started remotely but is not active, suspending", self.address);
                    actions.push(Action::Link(LinkCommand::Suspend { peer: self.address }));
                }
                self.change_state(PeerState::Started, ctx, actions);
                true
            }
            PeerEvent::DisconnectRequest => {
                actions.push(Action::Link(LinkCommand::Close { peer: self.address }));
                actions.push(Action::ReportConnection(ConnectionState::Disconnecting));
                self.change_state(PeerState::Closing, ctx, actions);
                true
            }
            PeerEvent::LinkClosed => {
                self.fail_pending(actions);
                if ctx.is_active {
                    actions.push(Action::StopSession);
                }
                self.disconnected(ctx, actions);
                true
            }
            PeerEvent::AclDisconnected => true,
            _ => false,
        }
    }

    fn on_started(&mut self, event: &PeerEvent, ctx: &EventContext, actions: &mut Vec<Action>) -> bool {
        match *event {
            PeerEvent::StopRequest | PeerEvent::SuspendRequest => {
                self.flags.insert(PeerFlags::LOCAL_SUSPEND_PENDING);
                self.flags.remove(PeerFlags::REMOTE_SUSPEND);
                if ctx.is_active {
                    actions.push(Action::SetDiscarding(true));
                    actions.push(Action::FlushSession);
                }

                if *event == PeerEvent::StopRequest {
                    self.flags.insert(PeerFlags::PENDING_STOP);
                    actions.push(Action::Link(LinkCommand::Stop { peer: self.address }));
                } else {
                    actions.push(Action::Link(LinkCommand::Suspend { peer: self.address }));
                }
                true
            }
            PeerEvent::LinkSuspended { success, initiator } => {
                let local_suspend = self.flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING);
                self.flags.remove(PeerFlags::LOCAL_SUSPEND_PENDING);

                if !success {
                    if ctx.is_active {
                        actions.push(Action::SetDiscarding(false));
                    }
                    if local_suspend {
                        actions.push(Action::ResolveCommand {
                            request: StreamRequest::Suspend,
                            success: false,
                        });
                    }
                    return true;
                }

                if initiator == Initiator::Remote {
                    self.flags.insert(PeerFlags::REMOTE_SUSPEND);
                    actions.push(Action::ReportAudio(AudioState::RemoteSuspend));
                } else {
                    actions.push(Action::ReportAudio(AudioState::Stopped));
                }
                if local_suspend {
                    actions.push(Action::ResolveCommand {
                        request: StreamRequest::Suspend,
                        success: true,
                    });
                }
                self.change_state(PeerState::Opened, ctx, actions);
                true
            }
            PeerEvent::LinkStopped { success } => {
                let local_suspend = self.flags.contains(PeerFlags::LOCAL_SUSPEND_PENDING)
                    && !self.flags.contains(PeerFlags::PENDING_STOP);
                self.flags.remove(PeerFlags::LOCAL_SUSPEND_PENDING);
                self.flags.remove(PeerFlags::PENDING_STOP);

                if local_suspend {
                    actions.push(Action::ResolveCommand {
                        request: StreamRequest::Suspend,
                        success,
                    });
                }
                if !success {
                    if ctx.is_active {
                        actions.push(Action::SetDiscarding(false));
                    }
                    return true;
                }

                actions.push(Action::ReportAudio(AudioState::Stopped));
                self.change_state(PeerState::Opened, ctx, actions);
                true
            }
            PeerEvent::LinkClosed => {
                self.fail_pending(actions);
                self.disconnected(ctx, actions);
                true
            }
            PeerEvent::DisconnectRequest => {
                actions.push(Action::Link(LinkCommand::Close { peer: self.address }));
                actions.push(Action::ReportConnection(ConnectionState::Disconnecting));
                self.change_state(PeerState::Closing, ctx, actions);
                true
            }
            PeerEvent::AclDisconnected => true,
            _ => false,
        }
    }

    fn on_closing(&mut self, event: &PeerEvent, ctx: &EventContext, actions: &mut Vec<Action>) -> bool {
        match event {
            PeerEvent::LinkClosed => {
                self.disconnected(ctx, actions);
                true
            }
            PeerEvent::AclDisconnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerAddress;

    const ADDR: PeerAddress = PeerAddress::new([0xA0, 0, 0, 0, 0, 1]);

    fn admitted() -> EventContext {
        EventContext {
            allowed_to_connect: true,
            is_active: false,
            role_has_active_peer: false,
        }
    }

    fn active() -> EventContext {
        EventContext {
            allowed_to_connect: true,
            is_active: true,
            role_has_active_peer: true,
        }
    }

    fn peer_in(state: PeerState) -> Peer {
        let mut peer = Peer::new(ADDR, Role::Source, Some(1), 0);
        if state != PeerState::Idle {
            peer.previous = Some(PeerState::Idle);
        }
        peer.state = state;
        peer
    }

    fn all_events() -> Vec<PeerEvent> {
        let mut events = vec![
            PeerEvent::ConnectRequest,
            PeerEvent::DisconnectRequest,
            PeerEvent::StartRequest,
            PeerEvent::StopRequest,
            PeerEvent::SuspendRequest,
            PeerEvent::RemotePending,
            PeerEvent::RemoteSignalingOpened,
            PeerEvent::LinkRejected,
            PeerEvent::LocalAclDropped,
            PeerEvent::AclDisconnected,
            PeerEvent::LinkClosed,
        ];
        for success in [true, false] {
            events.push(PeerEvent::LinkOpened { success, edr_caps: 0 });
            events.push(PeerEvent::LinkStopped { success });
            for initiator in [Initiator::Local, Initiator::Remote] {
                events.push(PeerEvent::LinkSuspended { success, initiator });
                for suspending in [true, false] {
                    events.push(PeerEvent::LinkStarted {
                        success,
                        suspending,
                        initiator,
                    });
                }
            }
        }
        events
    }

    fn listed(state: PeerState, event: &PeerEvent) -> bool {
        use PeerEvent::*;
        if *event == AclDisconnected {
            return true;
        }
        match state {
            PeerState::Idle => matches!(event, ConnectRequest | RemotePending | RemoteSignalingOpened),
            PeerState::Opening => matches!(event, LinkOpened { .. } | LinkRejected | LocalAclDropped),
            PeerState::Opened => {
                matches!(event, StartRequest | LinkStarted { .. } | DisconnectRequest | LinkClosed)
            }
            PeerState::Started => matches!(
                event,
                StopRequest
                    | SuspendRequest
                    | LinkSuspended { .. }
                    | LinkStopped { .. }
                    | LinkClosed
                    | DisconnectRequest
            ),
            PeerState::Closing => matches!(event, LinkClosed),
        }
    }

    #[test]
    fn test_totality() {
        for state in PeerState::ALL {
            for event in all_events() {
                let mut peer = peer_in(state);
                let transition = peer.process_event(&event, &admitted());

                if listed(state, &event) {
                    assert!(transition.handled, "{:?} in {} should be handled", event, state);
                } else {
                    assert!(!transition.handled, "{:?} in {} should be unhandled", event, state);
                    assert_eq!(peer.state(), state);
                    assert!(transition.actions.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_connect_and_open() {
        let mut peer = peer_in(PeerState::Idle);

        let t = peer.process_event(&PeerEvent::ConnectRequest, &admitted());
        assert_eq!(t.to, PeerState::Opening);
        assert_eq!(
            t.actions,
            vec![
                Action::Link(LinkCommand::Open {
                    peer: ADDR,
                    role: Role::Source
                }),
                Action::ReportConnection(ConnectionState::Connecting),
            ]
        );

        let t = peer.process_event(
            &PeerEvent::LinkOpened {
                success: true,
                edr_caps: 0x03,
            },
            &admitted(),
        );
        assert_eq!(t.to, PeerState::Opened);
        assert_eq!(
            t.actions,
            vec![
                Action::ReportConnection(ConnectionState::Connected),
                Action::SetActive
            ]
        );
        assert!(peer.supports_3mbps());
    }

    #[test]
    fn test_sink_role_not_auto_activated() {
        let mut peer = Peer::new(ADDR, Role::Sink, None, 0);
        peer.process_event(&PeerEvent::ConnectRequest, &admitted());
        let t = peer.process_event(
            &PeerEvent::LinkOpened {
                success: true,
                edr_caps: 0,
            },
            &admitted(),
        );
        assert!(!t.actions.contains(&Action::SetActive));
    }

    #[test]
    fn test_admission_denied_stays_idle() {
        let mut peer = peer_in(PeerState::Idle);
        let denied = EventContext::default();

        let t = peer.process_event(&PeerEvent::ConnectRequest, &denied);
        assert!(t.handled);
        assert_eq!(peer.state(), PeerState::Idle);
        assert_eq!(t.actions, vec![Action::ConnectionRejected]);

        let t = peer.process_event(&PeerEvent::RemotePending, &denied);
        assert_eq!(
            t.actions,
            vec![
                Action::ConnectionRejected,
                Action::Link(LinkCommand::Close { peer: ADDR })
            ]
        );
    }

    #[test]
    fn test_open_failure_returns_idle_and_deletes() {
        let mut peer = peer_in(PeerState::Idle);
        peer.process_event(&PeerEvent::ConnectRequest, &admitted());
        let t = peer.process_event(&PeerEvent::LinkRejected, &admitted());

        assert_eq!(t.to, PeerState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Action::ReportConnection(ConnectionState::Disconnected),
                Action::ScheduleDelete
            ]
        );
    }

    #[test]
    fn test_fresh_idle_peer_not_deletable() {
        let peer = Peer::new(ADDR, Role::Source, None, 0);
        assert!(!peer.can_be_deleted());
    }

    #[test]
    fn test_local_start_resolves_command() {
        let mut peer = peer_in(PeerState::Opened);
        peer.process_event(&PeerEvent::StartRequest, &active());
        assert!(peer.flags().contains(PeerFlags::PENDING_START));

        let t = peer.process_event(
            &PeerEvent::LinkStarted {
                success: true,
                suspending: false,
                initiator: Initiator::Local,
            },
            &active(),
        );
        assert_eq!(t.to, PeerState::Started);
        assert_eq!(
            t.actions,
            vec![
                Action::StartSession,
                Action::ResolveCommand {
                    request: StreamRequest::Start,
                    success: true
                },
                Action::ReportAudio(AudioState::Started),
            ]
        );
        assert!(!peer.flags().contains(PeerFlags::PENDING_START));
    }

    #[test]
    fn test_start_failure_stays_opened() {
        let mut peer = peer_in(PeerState::Opened);
        peer.process_event(&PeerEvent::StartRequest, &active());
        let t = peer.process_event(
            &PeerEvent::LinkStarted {
                success: true,
                suspending: true,
                initiator: Initiator::Local,
            },
            &active(),
        );
        assert_eq!(t.to, PeerState::Opened);
        assert_eq!(
            t.actions,
            vec![Action::ResolveCommand {
                request: StreamRequest::Start,
                success: false
            }]
        );
    }

    #[test]
    fn test_remote_start_on_inactive_source_peer_is_suspended() {
        let mut peer = peer_in(PeerState::Opened);
        let t = peer.process_event(
            &PeerEvent::LinkStarted {
                success: true,
                suspending: false,
                initiator: Initiator::Remote,
            },
            &admitted(),
        );
        assert_eq!(t.to, PeerState::Started);
        assert!(t
            .actions
            .contains(&Action::Link(LinkCommand::Suspend { peer: ADDR })));
        assert!(!t.actions.contains(&Action::StartSession));
    }

    #[test]
    fn test_suspend_round_trip() {
        let mut peer = peer_in(PeerState::Started);
        peer.flags.insert(PeerFlags::REMOTE_SUSPEND);

        let t = peer.process_event(&PeerEvent::SuspendRequest, &active());
        assert_eq!(t.to, PeerState::Started);
        assert!(peer.flags().contains(PeerFlags::LOCAL_SUSPEND_PENDING));
        assert!(!peer.flags().contains(PeerFlags::REMOTE_SUSPEND));
        assert_eq!(
            t.actions,
            vec![
                Action::SetDiscarding(true),
                Action::FlushSession,
                Action::Link(LinkCommand::Suspend { peer: ADDR }),
            ]
        );

        let t = peer.process_event(
            &PeerEvent::LinkSuspended {
                success: true,
                initiator: Initiator::Local,
            },
            &active(),
        );
        assert_eq!(t.to, PeerState::Opened);
        assert_eq!(
            t.actions,
            vec![
                Action::ReportAudio(AudioState::Stopped),
                Action::ResolveCommand {
                    request: StreamRequest::Suspend,
                    success: true
                },
                Action::StopSession,
            ]
        );
    }

    #[test]
    fn test_remote_suspend_sets_flag() {
        let mut peer = peer_in(PeerState::Started);
        let t = peer.process_event(
            &PeerEvent::LinkSuspended {
                success: true,
                initiator: Initiator::Remote,
            },
            &admitted(),
        );
        assert_eq!(t.to, PeerState::Opened);
        assert!(peer.flags().contains(PeerFlags::REMOTE_SUSPEND));
        assert_eq!(t.actions, vec![Action::ReportAudio(AudioState::RemoteSuspend)]);
    }

    #[test]
    fn test_stop_then_stopped() {
        let mut peer = peer_in(PeerState::Started);
        peer.process_event(&PeerEvent::StopRequest, &active());
        assert!(peer.flags().contains(PeerFlags::PENDING_STOP));

        let t = peer.process_event(&PeerEvent::LinkStopped { success: true }, &active());
        assert_eq!(t.to, PeerState::Opened);
        assert!(peer.flags().is_empty());
        assert_eq!(
            t.actions,
            vec![Action::ReportAudio(AudioState::Stopped), Action::StopSession]
        );
    }

    #[test]
    fn test_link_closed_while_started_active() {
        let mut peer = peer_in(PeerState::Started);
        let t = peer.process_event(&PeerEvent::LinkClosed, &active());
        assert_eq!(t.to, PeerState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Action::ReportConnection(ConnectionState::Disconnected),
                Action::StopSession,
                Action::ClearActive,
                Action::ScheduleDelete,
            ]
        );
    }

    #[test]
    fn test_disconnect_via_closing() {
        let mut peer = peer_in(PeerState::Opened);
        let t = peer.process_event(&PeerEvent::DisconnectRequest, &admitted());
        assert_eq!(t.to, PeerState::Closing);
        assert_eq!(
            t.actions,
            vec![
                Action::Link(LinkCommand::Close { peer: ADDR }),
                Action::ReportConnection(ConnectionState::Disconnecting),
            ]
        );

        let t = peer.process_event(&PeerEvent::LinkClosed, &admitted());
        assert_eq!(t.to, PeerState::Idle);
        assert!(t.actions.contains(&Action::ScheduleDelete));
    }

    #[test]
    fn test_acl_disconnected_while_opening() {
        let mut peer = peer_in(PeerState::Opening);
        let t = peer.process_event(&PeerEvent::AclDisconnected, &admitted());
        assert_eq!(t.to, PeerState::Idle);
    }

    #[test]
    fn test_grace_timer_armed() {
        let mut peer = peer_in(PeerState::Idle);
        let t = peer.process_event(&PeerEvent::RemoteSignalingOpened, &admitted());
        assert_eq!(t.to, PeerState::Idle);
        assert_eq!(t.actions, vec![Action::ArmGraceTimer]);
    }

    #[test]
    fn test_idle_entry_clears_flags() {
        let mut peer = peer_in(PeerState::Opened);
        peer.flags.insert(PeerFlags::REMOTE_SUSPEND);
        peer.process_event(&PeerEvent::LinkClosed, &admitted());
        assert!(peer.flags().is_empty());
    }

    fn resolutions(t: &Transition) -> Vec<Action> {
        t.actions
            .iter()
            .filter(|a| matches!(a, Action::ResolveCommand { .. }))
            .cloned()
            .collect()
    }

    #[test]
    fn test_disconnect_fails_pending_start() {
        let mut peer = peer_in(PeerState::Opened);
        peer.process_event(&PeerEvent::StartRequest, &active());
        assert!(peer.flags().contains(PeerFlags::PENDING_START));

        let t = peer.process_event(&PeerEvent::DisconnectRequest, &active());
        assert_eq!(t.to, PeerState::Closing);
        assert_eq!(
            resolutions(&t),
            vec![Action::ResolveCommand {
                request: StreamRequest::Start,
                success: false
            }]
        );
        assert!(!peer.flags().contains(PeerFlags::PENDING_START));

        let t = peer.process_event(&PeerEvent::LinkClosed, &active());
        assert_eq!(t.to, PeerState::Idle);
        assert!(resolutions(&t).is_empty());
    }

    #[test]
    fn test_disconnect_fails_pending_suspend() {
        let mut peer = peer_in(PeerState::Started);
        peer.process_event(&PeerEvent::SuspendRequest, &active());

        let t = peer.process_event(&PeerEvent::DisconnectRequest, &active());
        assert_eq!(t.to, PeerState::Closing);
        assert_eq!(
            resolutions(&t),
            vec![Action::ResolveCommand {
                request: StreamRequest::Suspend,
                success: false
            }]
        );
    }

    #[test]
    fn test_link_closed_fails_pending_start() {
        let mut peer = peer_in(PeerState::Opened);
        peer.process_event(&PeerEvent::StartRequest, &active());

        let t = peer.process_event(&PeerEvent::LinkClosed, &active());
        assert_eq!(t.to, PeerState::Idle);
        assert_eq!(
            resolutions(&t),
            vec![Action::ResolveCommand {
                request: StreamRequest::Start,
                success: false
            }]
        );
    }

    #[test]
    fn test_stopped_resolves_pending_suspend() {
        let mut peer = peer_in(PeerState::Started);
        peer.process_event(&PeerEvent::SuspendRequest, &active());

        let t = peer.process_event(&PeerEvent::LinkStopped { success: true }, &active());
        assert_eq!(t.to, PeerState::Opened);
        assert_eq!(
            resolutions(&t),
            vec![Action::ResolveCommand {
                request: StreamRequest::Suspend,
                success: true
            }]
        );
        assert!(peer.flags().is_empty());
    }

    #[test]
    fn test_failed_stop_fails_pending_suspend() {
        let mut peer = peer_in(PeerState::Started);
        peer.process_event(&PeerEvent::SuspendRequest, &active());

        let t = peer.process_event(&PeerEvent::LinkStopped { success: false }, &active());
        assert_eq!(t.to, PeerState::Started);
        assert_eq!(
            resolutions(&t),
            vec![Action::ResolveCommand {
                request: StreamRequest::Suspend,
                success: false
            }]
        );
    }
}
