use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AttributeRef, Peer};

// NB: a Uuid is not a unique key for a characteristic since it's possible
// for devices to expose the same characteristic (with the same uuid)
// multiple times, differentiated by attribute handle. The AttributeRef is
// what identifies a characteristic.

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// The peripheral acknowledges the write and the request completes once
    /// the acknowledgement arrives
    WithResponse,

    /// No acknowledgement is sent, so the request completes as soon as the
    /// backend has accepted the data
    WithoutResponse,
}

/// A discovered GATT characteristic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Characteristic {
    attribute: AttributeRef,
    service: AttributeRef,
    uuid: Uuid,
    properties: CharacteristicProperties,
}

impl Characteristic {
    pub(crate) fn new(attribute: AttributeRef, service: AttributeRef, uuid: Uuid,
                      properties: CharacteristicProperties) -> Self {
        Self {
            attribute,
            service,
            uuid,
            properties,
        }
    }

    pub fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    /// The service this characteristic was discovered under
    pub fn service(&self) -> &AttributeRef {
        &self.service
    }

    pub fn peer(&self) -> &Peer {
        self.attribute.peer()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Whether the characteristic can be subscribed to, either with
    /// notifications or indications
    pub fn can_subscribe(&self) -> bool {
        self.properties
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
    }
}
