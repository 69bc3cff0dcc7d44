use crate::cache::{Cache, CachedAttribute, ConnectionState};
use crate::{AdapterState, AttributeRef, Error, Peer, PeripheralHandle, Result};

/// What a request needs to be true before it may touch the backend
///
/// Checks always run in the same order (adapter, peer, connection,
/// attribute) and each one assumes the ones before it passed.
#[derive(Clone, Debug, Default)]
pub(crate) struct Needs {
    pub(crate) powered_on: bool,
    pub(crate) known_peer: bool,
    pub(crate) connected: bool,
    pub(crate) attribute: Option<AttributeRef>,
}

impl Needs {
    pub(crate) fn adapter() -> Self {
        Self {
            powered_on: true,
            ..Default::default()
        }
    }

    pub(crate) fn peer() -> Self {
        Self {
            known_peer: true,
            ..Self::adapter()
        }
    }

    pub(crate) fn connection() -> Self {
        Self {
            connected: true,
            ..Self::peer()
        }
    }

    pub(crate) fn attribute(attribute: &AttributeRef) -> Self {
        Self {
            attribute: Some(attribute.clone()),
            ..Self::connection()
        }
    }
}

/// The backend handles a successful validation resolved
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Validated {
    pub(crate) peripheral: Option<PeripheralHandle>,
    pub(crate) attribute: Option<CachedAttribute>,
}

pub(crate) fn validate(adapter_state: AdapterState, cache: &Cache, peer: Option<&Peer>, needs: &Needs)
    -> Result<Validated>
{
    let mut validated = Validated::default();

    if needs.powered_on && adapter_state != AdapterState::PoweredOn {
        return Err(Error::AdapterNotReady);
    }

    let cached = match peer {
        Some(peer) if needs.known_peer => {
            let cached = cache.peripheral(peer).ok_or(Error::UnknownPeer)?;
            validated.peripheral = Some(cached.handle);
            Some(cached)
        }
        _ => None,
    };

    if needs.connected {
        match cached {
            Some(cached) if cached.state == ConnectionState::Connected => {}
            _ => return Err(Error::Disconnected),
        }
    }

    if let Some(attribute) = &needs.attribute {
        // An AttributeRef for some other peer can't be valid for this request
        // even if it happens to still be cached.
        if Some(attribute.peer()) != peer {
            return Err(Error::UnknownAttribute);
        }
        validated.attribute = Some(cache.attribute(attribute).ok_or(Error::UnknownAttribute)?);
    }

    Ok(validated)
}
