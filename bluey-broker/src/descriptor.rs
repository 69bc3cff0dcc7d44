use uuid::Uuid;

use crate::{AttributeRef, Peer};

/// A discovered GATT descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    attribute: AttributeRef,
    characteristic: AttributeRef,
    uuid: Uuid,
}

impl Descriptor {
    pub(crate) fn new(attribute: AttributeRef, characteristic: AttributeRef, uuid: Uuid) -> Self {
        Self {
            attribute,
            characteristic,
            uuid,
        }
    }

    pub fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    pub fn characteristic(&self) -> &AttributeRef {
        &self.characteristic
    }

    pub fn peer(&self) -> &Peer {
        self.attribute.peer()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}
