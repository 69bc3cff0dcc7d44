use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Address;

// For the public API a Peer is nothing more than the address the backend
// reported when the device was discovered.
//
// It's notably not a handle to any broker state: all the state associated
// with a peer (backend handle, connection state, pending requests) lives in
// the session's IO task and a Peer only serves as the key for looking it up.
// This means a Peer can be cloned, stored and compared freely, and that
// requests against a Peer that hasn't been seen by the current scan will
// simply fail with `UnknownPeer`.

/// A remote device, identified by its address
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    address: Address,
}

impl Peer {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl From<Address> for Peer {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Peer").field(&self.address).finish()
    }
}

/// The advertising data a backend reported alongside a discovered device
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub tx_power: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// Whether the advertisement mentions the given service, either in its
    /// list of service UUIDs or as a key of its service data
    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid) || self.service_data.contains_key(uuid)
    }
}

/// One element of a [`crate::scan::Scan`] stream
#[derive(Clone, Debug)]
pub struct DiscoveryEvent {
    pub peer: Peer,
    pub timestamp: SystemTime,
    pub rssi: i16,
    pub advertisement: AdvertisementData,
    pub connectable: bool,
}

impl DiscoveryEvent {
    pub fn name(&self) -> Option<&str> {
        self.advertisement.local_name.as_deref()
    }
}
