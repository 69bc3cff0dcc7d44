use uuid::Uuid;

use crate::{AttributeRef, Peer};

/// A discovered GATT service
///
/// This is an inert value: requests against the service (such as
/// [`crate::Session::discover_characteristics`]) are made through the
/// `Session` and are validated against the session's attribute cache, so a
/// `Service` kept across a disconnect simply stops being usable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Service {
    attribute: AttributeRef,
    uuid: Uuid,
    is_primary: bool,
}

impl Service {
    pub(crate) fn new(attribute: AttributeRef, uuid: Uuid, is_primary: bool) -> Self {
        Self {
            attribute,
            uuid,
            is_primary,
        }
    }

    pub fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    pub fn peer(&self) -> &Peer {
        self.attribute.peer()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this is a primary service (as opposed to a secondary service
    /// only reachable as an included service)
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }
}
