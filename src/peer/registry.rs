// ABOUTME: Slot-indexed registry of peers for one role
// ABOUTME: Tracks the single active peer and applies the connection admission policy

use super::state_machine::{EventContext, PeerState};
use super::{LinkHandle, Peer, PeerAddress, PeerKey, RegistryError, Role};
use parking_lot::Mutex;
use std::sync::Arc;

/// Streaming routing hooks invoked when the active peer changes
pub trait SessionRouter {
    /// Start streaming for a newly active, already started peer
    fn begin_session(&mut self, role: Role, peer: &Peer) -> bool;

    /// Tear down the streaming session for `role`
    fn end_session(&mut self, role: Role);
}

/// Shareable view of a registry's active peer
#[derive(Debug, Clone, Default)]
pub struct ActivePeer(Arc<Mutex<Option<PeerAddress>>>);

impl ActivePeer {
    /// Current active peer
    pub fn get(&self) -> Option<PeerAddress> {
        *self.0.lock()
    }

    fn set(&self, address: Option<PeerAddress>) {
        *self.0.lock() = address;
    }
}

/// Peers known for one role
#[derive(Debug)]
pub struct PeerRegistry {
    role: Role,
    slots: Vec<Option<Peer>>,
    max_connected: usize,
    active: ActivePeer,
}

impl PeerRegistry {
    /// Create a registry with `max_peers` slots admitting `max_connected` concurrent peers
    pub fn new(role: Role, max_peers: usize, max_connected: usize) -> Self {
        Self {
            role,
            slots: vec![None; max_peers.max(1)],
            max_connected,
            active: ActivePeer::default(),
        }
    }

    /// Registry role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no peer is known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All known peers in slot order
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().flatten()
    }

    /// Find a peer by address
    pub fn find(&self, address: &PeerAddress) -> Option<&Peer> {
        self.peers().find(|p| p.address == *address)
    }

    /// Find a peer by address for mutation
    pub fn find_mut(&mut self, address: &PeerAddress) -> Option<&mut Peer> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.address == *address)
    }

    /// Find a peer by link handle
    pub fn find_by_link_handle(&self, handle: LinkHandle) -> Option<&Peer> {
        self.peers().find(|p| p.handle == Some(handle))
    }

    /// Resolve an event key to a known peer address
    pub fn resolve(&self, key: PeerKey) -> Option<PeerAddress> {
        match key {
            PeerKey::Address(address) => self.find(&address).map(|p| p.address),
            PeerKey::Handle(handle) => self.find_by_link_handle(handle).map(|p| p.address),
        }
    }

    /// Find a peer, creating it in the lowest free slot if unknown
    ///
    /// A known peer without a handle adopts `handle` when one is given.
    pub fn find_or_create(
        &mut self,
        address: PeerAddress,
        handle: Option<LinkHandle>,
    ) -> Result<&mut Peer, RegistryError> {
        let index = match self.slot_of(&address) {
            Some(index) => index,
            None => {
                let free = self
                    .slots
                    .iter()
                    .position(|s| s.is_none())
                    .ok_or(RegistryError::NoFreeSlot {
                        role: self.role,
                        max: self.slots.len(),
                    })?;
                log::debug!("Created {} peer {} in slot {}", self.role, address, free);
                self.slots[free] = Some(Peer::new(address, self.role, handle, free));
                free
            }
        };

        let peer = self.slots[index]
            .as_mut()
            .ok_or(RegistryError::UnknownPeer(address))?;
        if let Some(handle) = handle {
            if peer.handle.is_none() {
                peer.handle = Some(handle);
            }
        }
        Ok(peer)
    }

    /// Remove a peer; returns false if it was unknown
    pub fn delete(&mut self, address: &PeerAddress) -> bool {
        match self.slot_of(address) {
            Some(index) => {
                if self.active.get() == Some(*address) {
                    log::warn!("Deleting active {} peer {}", self.role, address);
                    self.active.set(None);
                }
                self.slots[index] = None;
                log::debug!("Deleted {} peer {} from slot {}", self.role, address, index);
                true
            }
            None => false,
        }
    }

    /// Remove every peer that has returned to `Idle`; returns how many were removed
    pub fn delete_idle(&mut self) -> usize {
        let idle: Vec<PeerAddress> = self
            .peers()
            .filter(|p| p.can_be_deleted())
            .map(|p| p.address)
            .collect();
        for address in &idle {
            self.delete(address);
        }
        idle.len()
    }

    /// Change the active peer
    ///
    /// Ends the previous peer's session, starts the new peer's session if it is
    /// already streaming, and only then moves the active pointer. `None` clears
    /// the active peer.
    pub fn set_active(&mut self, address: Option<PeerAddress>, router: &mut dyn SessionRouter) -> bool {
        let current = self.active.get();
        if current == address {
            return true;
        }

        let Some(address) = address else {
            router.end_session(self.role);
            self.active.set(None);
            log::info!("No active {} peer", self.role);
            return true;
        };

        let Some(peer) = self.find(&address) else {
            log::warn!("Cannot make unknown peer {} active", address);
            return false;
        };

        if current.is_some() {
            router.end_session(self.role);
        }

        if peer.state == PeerState::Started && !router.begin_session(self.role, peer) {
            log::warn!("Failed to start session for new active peer {}", address);
            self.active.set(None);
            return false;
        }

        self.active.set(Some(address));
        log::info!("Active {} peer is now {}", self.role, address);
        true
    }

    /// Current active peer
    pub fn active(&self) -> Option<PeerAddress> {
        self.active.get()
    }

    /// Shareable view of the active peer
    pub fn active_handle(&self) -> ActivePeer {
        self.active.clone()
    }

    /// Whether `address` is the active peer
    pub fn is_active(&self, address: &PeerAddress) -> bool {
        self.active.get() == Some(*address)
    }

    /// Admission policy
    ///
    /// True if `address` already counts as connecting or connected, or if
    /// fewer than the configured maximum are.
    pub fn allowed_to_connect(&self, address: &PeerAddress) -> bool {
        let mut connected = 0;
        for peer in self.peers().filter(|p| p.is_connecting_or_connected()) {
            if peer.address == *address {
                return true;
            }
            connected += 1;
        }

        let allowed = connected < self.max_connected;
        if !allowed {
            log::debug!(
                "{} peer {} not admitted: {} of {} connected",
                self.role,
                address,
                connected,
                self.max_connected
            );
        }
        allowed
    }

    /// Registry facts for a state machine event on `address`
    pub fn context_for(&self, address: &PeerAddress) -> EventContext {
        EventContext {
            allowed_to_connect: self.allowed_to_connect(address),
            is_active: self.is_active(address),
            role_has_active_peer: self.active.get().is_some(),
        }
    }

    fn slot_of(&self, address: &PeerAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|p| p.address == *address).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRouter {
        calls: Vec<String>,
        fail_begin: bool,
    }

    impl SessionRouter for RecordingRouter {
        fn begin_session(&mut self, role: Role, peer: &Peer) -> bool {
            self.calls.push(format!("begin {} {}", role, peer.address()));
            !self.fail_begin
        }

        fn end_session(&mut self, role: Role) {
            self.calls.push(format!("end {}", role));
        }
    }

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_lowest_free_slot_reused() {
        let mut registry = PeerRegistry::new(Role::Source, 3, 1);
        assert_eq!(registry.find_or_create(addr(1), None).unwrap().slot(), 0);
        assert_eq!(registry.find_or_create(addr(2), None).unwrap().slot(), 1);
        assert_eq!(registry.find_or_create(addr(3), None).unwrap().slot(), 2);

        assert_eq!(
            registry.find_or_create(addr(4), None).unwrap_err(),
            RegistryError::NoFreeSlot {
                role: Role::Source,
                max: 3
            }
        );

        assert!(registry.delete(&addr(2)));
        assert_eq!(registry.find_or_create(addr(4), None).unwrap().slot(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_find_or_create_existing_adopts_handle() {
        let mut registry = PeerRegistry::new(Role::Sink, 2, 1);
        registry.find_or_create(addr(1), None).unwrap();
        let peer = registry.find_or_create(addr(1), Some(9)).unwrap();
        assert_eq!(peer.handle(), Some(9));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.find_by_link_handle(9).unwrap().address(), addr(1));
        assert_eq!(registry.resolve(PeerKey::Handle(9)), Some(addr(1)));
        assert_eq!(registry.resolve(PeerKey::Handle(3)), None);
    }

    #[test]
    fn test_delete_idle_skips_fresh_peers() {
        let mut registry = PeerRegistry::new(Role::Source, 4, 2);
        registry.find_or_create(addr(1), None).unwrap();
        let peer = registry.find_or_create(addr(2), None).unwrap();
        peer.previous = Some(PeerState::Opening);

        assert_eq!(registry.delete_idle(), 1);
        assert!(registry.find(&addr(1)).is_some());
        assert!(registry.find(&addr(2)).is_none());
    }

    #[test]
    fn test_admission_policy() {
        let mut registry = PeerRegistry::new(Role::Source, 4, 1);
        registry.find_or_create(addr(1), None).unwrap().state = PeerState::Opened;
        registry.find_or_create(addr(2), None).unwrap();

        assert!(registry.allowed_to_connect(&addr(1)));
        assert!(!registry.allowed_to_connect(&addr(2)));

        registry.find_mut(&addr(1)).unwrap().state = PeerState::Closing;
        assert!(registry.allowed_to_connect(&addr(2)));
    }

    #[test]
    fn test_set_active_ordering() {
        let mut registry = PeerRegistry::new(Role::Source, 4, 2);
        let mut router = RecordingRouter::default();
        registry.find_or_create(addr(1), None).unwrap().state = PeerState::Started;
        registry.find_or_create(addr(2), None).unwrap().state = PeerState::Opened;

        assert!(registry.set_active(Some(addr(1)), &mut router));
        assert!(registry.set_active(Some(addr(2)), &mut router));
        assert!(registry.set_active(None, &mut router));

        assert_eq!(
            router.calls,
            vec![
                "begin source 00:00:00:00:00:01",
                "end source",
                "end source"
            ]
        );
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn test_set_active_unknown_peer() {
        let mut registry = PeerRegistry::new(Role::Source, 2, 1);
        let mut router = RecordingRouter::default();
        assert!(!registry.set_active(Some(addr(5)), &mut router));
        assert!(router.calls.is_empty());
    }

    #[test]
    fn test_set_active_begin_failure_clears_pointer() {
        let mut registry = PeerRegistry::new(Role::Source, 2, 1);
        let mut router = RecordingRouter {
            fail_begin: true,
            ..Default::default()
        };
        registry.find_or_create(addr(1), None).unwrap().state = PeerState::Started;

        assert!(!registry.set_active(Some(addr(1)), &mut router));
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn test_at_most_one_active() {
        let mut registry = PeerRegistry::new(Role::Source, 4, 4);
        let mut router = RecordingRouter::default();
        for last in 1..=4 {
            registry.find_or_create(addr(last), None).unwrap();
        }

        let sequence = [Some(1), Some(3), None, Some(2), Some(2), Some(9), Some(4), None, Some(1)];
        for target in sequence {
            registry.set_active(target.map(addr), &mut router);
            let active = registry
                .peers()
                .filter(|p| registry.is_active(&p.address()))
                .count();
            assert!(active <= 1);
        }
        assert_eq!(registry.active(), Some(addr(1)));
    }

    #[test]
    fn test_active_handle_is_shared() {
        let mut registry = PeerRegistry::new(Role::Sink, 2, 1);
        let mut router = RecordingRouter::default();
        let view = registry.active_handle();
        registry.find_or_create(addr(7), None).unwrap();
        registry.set_active(Some(addr(7)), &mut router);
        assert_eq!(view.get(), Some(addr(7)));
    }
}
