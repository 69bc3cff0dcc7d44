use std::collections::HashMap;

use log::trace;

use crate::{AttributeRef, CharacteristicHandle, DescriptorHandle, Peer, PeripheralHandle, ServiceHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub(crate) struct CachedPeripheral {
    pub(crate) handle: PeripheralHandle,
    pub(crate) state: ConnectionState,
}

// The full hierarchy of backend handles is kept for each attribute since
// the backend API expects all of them for every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CachedAttribute {
    Service {
        service: ServiceHandle,
    },
    Characteristic {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
    },
    Descriptor {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
        descriptor: DescriptorHandle,
    },
}

// The cache is the only place that maps broker-level identifiers (Peer,
// AttributeRef) to backend handles and it's the single source of truth for
// whether those identifiers are still valid.
//
// Peripherals are added when a scan reports them and are dropped when a
// later scan starts (unless they are connected or connecting). Attributes
// are added by completed discovery requests and dropped when their peer
// disconnects. Everything is dropped when the adapter stops being powered
// on.
#[derive(Debug)]
pub(crate) struct Cache {
    generation: u64,
    next_attribute_id: u64,
    peripherals: HashMap<Peer, CachedPeripheral>,
    peers_by_handle: HashMap<PeripheralHandle, Peer>,
    attributes: HashMap<AttributeRef, CachedAttribute>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            generation: 0,
            next_attribute_id: 1,
            peripherals: HashMap::new(),
            peers_by_handle: HashMap::new(),
            attributes: HashMap::new(),
        }
    }
}

impl Cache {
    /// Begins a new scan generation, forgetting every peripheral that
    /// doesn't currently have a connection (or connection attempt) that
    /// would keep its handles valid.
    pub(crate) fn start_generation(&mut self) -> u64 {
        self.generation += 1;

        let stale: Vec<Peer> = self.peripherals
                                   .iter()
                                   .filter(|(_, cached)| cached.state == ConnectionState::Disconnected)
                                   .map(|(peer, _)| peer.clone())
                                   .collect();
        for peer in stale {
            self.forget_peripheral(&peer);
        }

        trace!("Starting scan generation {}, {} peripherals retained",
               self.generation, self.peripherals.len());
        self.generation
    }

    pub(crate) fn clear(&mut self) {
        trace!("Clearing cache");
        self.peripherals.clear();
        self.peers_by_handle.clear();
        self.attributes.clear();
    }

    fn forget_peripheral(&mut self, peer: &Peer) {
        if let Some(cached) = self.peripherals.remove(peer) {
            self.peers_by_handle.remove(&cached.handle);
        }
        self.purge_attributes(peer);
    }

    pub(crate) fn refresh_peripheral(&mut self, peer: &Peer, handle: PeripheralHandle) {
        match self.peripherals.get_mut(peer) {
            Some(cached) => {
                if cached.handle != handle {
                    trace!("Backend handle for {} changed from {:?} to {:?}", peer, cached.handle, handle);
                    self.peers_by_handle.remove(&cached.handle);
                    cached.handle = handle;
                }
            }
            None => {
                self.peripherals.insert(peer.clone(), CachedPeripheral {
                    handle,
                    state: ConnectionState::Disconnected,
                });
            }
        }
        self.peers_by_handle.insert(handle, peer.clone());
    }

    pub(crate) fn peripheral(&self, peer: &Peer) -> Option<&CachedPeripheral> {
        self.peripherals.get(peer)
    }

    pub(crate) fn peer_for_handle(&self, handle: PeripheralHandle) -> Option<&Peer> {
        self.peers_by_handle.get(&handle)
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        self.peripherals.keys().cloned().collect()
    }

    /// Updates the connection state of a known peripheral, returning the
    /// previous state
    pub(crate) fn set_state(&mut self, peer: &Peer, state: ConnectionState) -> Option<ConnectionState> {
        self.peripherals
            .get_mut(peer)
            .map(|cached| std::mem::replace(&mut cached.state, state))
    }

    pub(crate) fn insert_attribute(&mut self, peer: &Peer, attribute: CachedAttribute) -> AttributeRef {
        let attribute_ref = AttributeRef::new(peer.clone(), self.next_attribute_id);
        self.next_attribute_id += 1;
        self.attributes.insert(attribute_ref.clone(), attribute);
        attribute_ref
    }

    pub(crate) fn attribute(&self, attribute: &AttributeRef) -> Option<CachedAttribute> {
        self.attributes.get(attribute).copied()
    }

    pub(crate) fn purge_attributes(&mut self, peer: &Peer) {
        self.attributes.retain(|attribute, _| attribute.peer() != peer);
    }
}
