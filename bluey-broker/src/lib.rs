//! An async broker for callback-driven Bluetooth Low Energy GATT backends.
//!
//! A platform backend (see [`session::BackendSession`]) accepts one request
//! at a time per connection and reports each result later through a single
//! event callback. A [`Session`] turns that into independently awaitable
//! requests that are serialized per peripheral, plus two long-lived streams:
//! device discovery ([`scan::Scan`]) and characteristic notifications
//! ([`notify::Notifications`]).

use ::uuid::Uuid;
use anyhow::anyhow;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

pub mod session;
pub use session::{Session, SessionConfig};

pub mod peripheral;
pub use peripheral::{AdvertisementData, DiscoveryEvent, Peer};

pub mod service;
pub use service::Service;

pub mod characteristic;
pub use characteristic::{Characteristic, CharacteristicProperties, WriteType};

pub mod descriptor;
pub use descriptor::Descriptor;

pub mod notify;
pub mod scan;

mod cache;
mod io;
mod registry;
mod validation;

pub mod fake;

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A backend-specific unique identifier for Bluetooth devices
///
/// Backends that can see the hardware MAC address report it directly, others
/// (e.g. CoreBluetooth) hand out an opaque string that is only stable for the
/// life of the backend.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "{}", mac),
            Address::String(s) => write!(f, "{}", s),
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "MAC:{}", mac),
            Address::String(s) => write!(f, "String:{}", s),
        }
    }
}

// Anything that doesn't look like six colon separated octets is treated as an
// opaque string address, so there's no error to report here.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    let mut octets = ArrayVec::<u8, 6>::new();
    for part in s.split(':') {
        if part.len() != 2 {
            return None;
        }
        let octet = u8::from_str_radix(part, 16).ok()?;
        octets.try_push(octet).ok()?;
    }
    if !octets.is_full() {
        return None;
    }

    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&octets);
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    // Octets are always formatted as uppercase
    assert_eq!(addr.to_string(), "F1:E2:D3:C4:B5:A6");
    assert_eq!(Address::from_str("f1:e2:d3:c4:b5:a6").unwrap(), addr);

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    assert_eq!(addr.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");

    // Too many octets
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6:97").unwrap();
    assert!(matches!(addr, Address::String(_)));
}

// Backend handles are allocated by the backend and are only meaningful to
// the backend that issued them. The broker never interprets them beyond
// equality.
//
// On backends where it's supported the attribute handles should correspond
// to the underlying ATT attribute handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u32);

/// An opaque reference to a discovered service, characteristic or descriptor
///
/// References are scoped to one [`Peer`] and to one connection: once the
/// peer disconnects, requests made with an old reference fail with
/// [`Error::UnknownAttribute`]. Discovering the same remote attribute twice
/// may hand out two distinct references.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    peer: Peer,
    id: u64,
}
impl AttributeRef {
    pub(crate) fn new(peer: Peer, id: u64) -> Self {
        Self { peer, id }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}
impl fmt::Debug for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AttributeRef({}#{})", self.peer, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General Failure: {0}")]
    GeneralFailure(String),
}

#[derive(Clone, Debug)]
pub struct BackendService {
    pub handle: ServiceHandle,
    pub uuid: Uuid,
    pub is_primary: bool,
}

#[derive(Clone, Debug)]
pub struct BackendCharacteristic {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Clone, Debug)]
pub struct BackendDescriptor {
    pub handle: DescriptorHandle,
    pub uuid: Uuid,
}

/// Events reported by a backend through its [`session::BackendBus`]
///
/// Apart from `StateChanged`, `PeripheralDiscovered`, `PeripheralDisconnected`
/// and `ReadyToWriteWithoutResponse` every event is the single completion of
/// one earlier backend request. None of them carry a request identifier; the
/// broker pairs them with requests by peripheral and (where needed) attribute
/// handle.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    StateChanged {
        state: AdapterState,
    },
    PeripheralDiscovered {
        peripheral_handle: PeripheralHandle,
        address: Address,
        rssi: i16,
        advertisement: AdvertisementData,
        connectable: bool,
    },
    PeripheralConnected {
        peripheral_handle: PeripheralHandle,
    },
    PeripheralConnectionFailed {
        peripheral_handle: PeripheralHandle,
        error: Option<GattError>,
    },
    PeripheralDisconnected {
        peripheral_handle: PeripheralHandle,
        error: Option<GattError>,
    },
    GattServicesDiscovered {
        peripheral_handle: PeripheralHandle,
        services: Vec<BackendService>,
        error: Option<GattError>,
    },
    GattIncludedServicesDiscovered {
        peripheral_handle: PeripheralHandle,
        service_handle: ServiceHandle,
        services: Vec<BackendService>,
        error: Option<GattError>,
    },
    GattCharacteristicsDiscovered {
        peripheral_handle: PeripheralHandle,
        service_handle: ServiceHandle,
        characteristics: Vec<BackendCharacteristic>,
        error: Option<GattError>,
    },
    GattDescriptorsDiscovered {
        peripheral_handle: PeripheralHandle,
        characteristic_handle: CharacteristicHandle,
        descriptors: Vec<BackendDescriptor>,
        error: Option<GattError>,
    },
    /// Either the response to a read request or a notification/indication
    GattCharacteristicValue {
        peripheral_handle: PeripheralHandle,
        characteristic_handle: CharacteristicHandle,
        value: Vec<u8>,
        error: Option<GattError>,
    },
    GattCharacteristicWritten {
        peripheral_handle: PeripheralHandle,
        characteristic_handle: CharacteristicHandle,
        error: Option<GattError>,
    },
    GattDescriptorValue {
        peripheral_handle: PeripheralHandle,
        descriptor_handle: DescriptorHandle,
        value: Vec<u8>,
        error: Option<GattError>,
    },
    GattDescriptorWritten {
        peripheral_handle: PeripheralHandle,
        descriptor_handle: DescriptorHandle,
        error: Option<GattError>,
    },
    GattNotifyStateUpdated {
        peripheral_handle: PeripheralHandle,
        characteristic_handle: CharacteristicHandle,
        enabled: bool,
        error: Option<GattError>,
    },
    ReadyToWriteWithoutResponse {
        peripheral_handle: PeripheralHandle,
    },
    RssiRead {
        peripheral_handle: PeripheralHandle,
        rssi: i16,
        error: Option<GattError>,
    },
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    #[non_exhaustive]
    AdapterStateChanged {
        state: AdapterState,
    },

    #[non_exhaustive]
    PeripheralConnected {
        peer: Peer,
    },

    #[non_exhaustive]
    PeripheralFailedToConnect {
        peer: Peer,
        error: Option<GattError>,
    },

    /// Indicates that a peripheral has disconnected.
    ///
    /// Once a peripheral has disconnected then all previously discovered
    /// `Service`s, `Characteristic`s and `Descriptor`s become invalid and
    /// requests against these will report `UnknownAttribute` errors.
    #[non_exhaustive]
    PeripheralDisconnected {
        peer: Peer,
        error: Option<GattError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The Bluetooth adapter is not powered on")]
    AdapterNotReady,

    #[error("Unknown peripheral (not seen by the current scan)")]
    UnknownPeer,

    #[error("Invalid State Reference: the attribute is not known for the current connection")]
    UnknownAttribute,

    #[error("The peripheral is not connected")]
    Disconnected,

    #[error("The backend reported a GATT failure: {0}")]
    BackendFailure(#[from] GattError),

    #[error("The request was cancelled")]
    Cancelled,

    #[error("The request timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Other(anyhow!("IO Error: the session's IO task has exited"))
    }
}

// A completion handle that gets dropped without being resolved always means
// the request was abandoned along the way.
impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, Error>;
