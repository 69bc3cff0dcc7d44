use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cache::CachedAttribute;
use crate::notify::NotificationSink;
use crate::validation::Needs;
use crate::{AttributeRef, Characteristic, CharacteristicHandle, Descriptor, Error, Result, Service, WriteType};

pub(crate) type OpId = u64;

// Operations created by the IO task itself (e.g. disabling notifications
// after the last subscriber went away) are never abandoned by a caller, so
// they all share this id. Ids handed out by a Session start at 1.
pub(crate) const INTERNAL_OP_ID: OpId = 0;

/// The sending half of a request's result
///
/// Resolving consumes the completion, and a completion that's dropped
/// without being resolved reports `Cancelled`, so every request sees exactly
/// one result.
pub(crate) struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub(crate) fn resolve(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have stopped waiting, which is fine
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match &self.tx {
            Some(tx) if tx.is_closed() => "abandoned",
            Some(_) => "waiting",
            None => "resolved",
        };
        f.debug_tuple("Completion").field(&state).finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum OperationKind {
    Connect,
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    ReadCharacteristic,
    WriteCharacteristic,
    DiscoverDescriptors,
    ReadDescriptor,
    WriteDescriptor,
    AwaitWritableWithoutResponse,
    SetNotificationState,
    ReadSignalStrength,
}

#[derive(Debug)]
pub(crate) enum Operation {
    Connect {
        completion: Completion<()>,
    },
    DiscoverServices {
        uuids: Vec<Uuid>,
        completion: Completion<Vec<Service>>,
    },
    DiscoverIncludedServices {
        service: AttributeRef,
        uuids: Vec<Uuid>,
        completion: Completion<Vec<Service>>,
    },
    DiscoverCharacteristics {
        service: AttributeRef,
        uuids: Vec<Uuid>,
        completion: Completion<Vec<Characteristic>>,
    },
    ReadCharacteristic {
        characteristic: AttributeRef,
        completion: Completion<Vec<u8>>,
    },
    WriteCharacteristic {
        characteristic: AttributeRef,
        value: Vec<u8>,
        write_type: WriteType,
        completion: Completion<()>,
    },
    DiscoverDescriptors {
        characteristic: AttributeRef,
        completion: Completion<Vec<Descriptor>>,
    },
    ReadDescriptor {
        descriptor: AttributeRef,
        completion: Completion<Vec<u8>>,
    },
    WriteDescriptor {
        descriptor: AttributeRef,
        value: Vec<u8>,
        completion: Completion<()>,
    },
    AwaitWritableWithoutResponse {
        completion: Completion<()>,
    },
    SetNotificationState {
        characteristic: AttributeRef,
        enabled: bool,
        // Installed once an enable request succeeds
        sink: Option<NotificationSink>,
        completion: Completion<()>,
    },
    ReadSignalStrength {
        completion: Completion<i16>,
    },
}

impl Operation {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Operation::Connect { .. } => OperationKind::Connect,
            Operation::DiscoverServices { .. } => OperationKind::DiscoverServices,
            Operation::DiscoverIncludedServices { .. } => OperationKind::DiscoverIncludedServices,
            Operation::DiscoverCharacteristics { .. } => OperationKind::DiscoverCharacteristics,
            Operation::ReadCharacteristic { .. } => OperationKind::ReadCharacteristic,
            Operation::WriteCharacteristic { .. } => OperationKind::WriteCharacteristic,
            Operation::DiscoverDescriptors { .. } => OperationKind::DiscoverDescriptors,
            Operation::ReadDescriptor { .. } => OperationKind::ReadDescriptor,
            Operation::WriteDescriptor { .. } => OperationKind::WriteDescriptor,
            Operation::AwaitWritableWithoutResponse { .. } => OperationKind::AwaitWritableWithoutResponse,
            Operation::SetNotificationState { .. } => OperationKind::SetNotificationState,
            Operation::ReadSignalStrength { .. } => OperationKind::ReadSignalStrength,
        }
    }

    pub(crate) fn attribute(&self) -> Option<&AttributeRef> {
        match self {
            Operation::DiscoverIncludedServices { service, .. } |
            Operation::DiscoverCharacteristics { service, .. } => Some(service),
            Operation::ReadCharacteristic { characteristic, .. } |
            Operation::WriteCharacteristic { characteristic, .. } |
            Operation::DiscoverDescriptors { characteristic, .. } |
            Operation::SetNotificationState { characteristic, .. } => Some(characteristic),
            Operation::ReadDescriptor { descriptor, .. } |
            Operation::WriteDescriptor { descriptor, .. } => Some(descriptor),
            Operation::Connect { .. } |
            Operation::DiscoverServices { .. } |
            Operation::AwaitWritableWithoutResponse { .. } |
            Operation::ReadSignalStrength { .. } => None,
        }
    }

    pub(crate) fn needs(&self) -> Needs {
        match (self.kind(), self.attribute()) {
            (OperationKind::Connect, _) => Needs::peer(),
            (_, Some(attribute)) => Needs::attribute(attribute),
            (_, None) => Needs::connection(),
        }
    }

    /// Resolves the operation with an error, whatever its result type
    pub(crate) fn fail(self, error: Error) {
        match self {
            Operation::Connect { completion } |
            Operation::WriteCharacteristic { completion, .. } |
            Operation::WriteDescriptor { completion, .. } |
            Operation::AwaitWritableWithoutResponse { completion } |
            Operation::SetNotificationState { completion, .. } => completion.resolve(Err(error)),
            Operation::DiscoverServices { completion, .. } |
            Operation::DiscoverIncludedServices { completion, .. } => completion.resolve(Err(error)),
            Operation::DiscoverCharacteristics { completion, .. } => completion.resolve(Err(error)),
            Operation::DiscoverDescriptors { completion, .. } => completion.resolve(Err(error)),
            Operation::ReadCharacteristic { completion, .. } |
            Operation::ReadDescriptor { completion, .. } => completion.resolve(Err(error)),
            Operation::ReadSignalStrength { completion } => completion.resolve(Err(error)),
        }
    }
}

/// A request waiting in a peer's queue
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub(crate) id: OpId,
    pub(crate) op: Operation,
}

/// A request that has been handed to the backend, along with the backend
/// handles it targets so the eventual event can be matched against it
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) id: OpId,
    pub(crate) op: Operation,
    pub(crate) target: Option<CachedAttribute>,
}

#[derive(Debug)]
pub(crate) enum Slot {
    Empty,
    Occupied(InFlight),

    // The caller stopped waiting while the backend still owes us an event for
    // this request. The slot stays busy until that event arrives so it can't
    // be paired with a later request.
    Detached {
        kind: OperationKind,
        target: Option<CachedAttribute>,
        attribute: Option<AttributeRef>,
    },
}

impl Default for Slot {
    fn default() -> Self {
        Slot::Empty
    }
}

/// The outcome of looking up the request a backend event completes
#[derive(Debug)]
pub(crate) enum Taken {
    Matched(InFlight),
    // Consumed by a detached slot; nobody is waiting for the result. Carries
    // the attribute the abandoned request was for.
    Detached(Option<AttributeRef>),
    // The late completion of a request that was cancelled by a disconnect
    Stale,
    // Nothing is in flight
    Unsolicited,
    // Something else is in flight
    Mismatched(OperationKind),
}

impl Slot {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    fn take(&mut self, kind: OperationKind,
            target_matches: impl Fn(Option<&CachedAttribute>) -> bool) -> Taken
    {
        match std::mem::take(self) {
            Slot::Empty => Taken::Unsolicited,
            Slot::Occupied(in_flight) => {
                let found = in_flight.op.kind();
                if found == kind && target_matches(in_flight.target.as_ref()) {
                    Taken::Matched(in_flight)
                } else {
                    *self = Slot::Occupied(in_flight);
                    Taken::Mismatched(found)
                }
            }
            Slot::Detached { kind: found, target, attribute } => {
                if found == kind && target_matches(target.as_ref()) {
                    Taken::Detached(attribute)
                } else {
                    *self = Slot::Detached { kind: found, target, attribute };
                    Taken::Mismatched(found)
                }
            }
        }
    }

    fn take_by_id(&mut self, id: OpId) -> Option<InFlight> {
        match std::mem::take(self) {
            Slot::Occupied(in_flight) if in_flight.id == id => Some(in_flight),
            other => {
                *self = other;
                None
            }
        }
    }

    fn detach(&mut self, id: OpId) -> bool {
        match self.take_by_id(id) {
            Some(in_flight) => {
                *self = Slot::Detached {
                    kind: in_flight.op.kind(),
                    target: in_flight.target,
                    attribute: in_flight.op.attribute().cloned(),
                };
                // Dropping the operation reports Cancelled
                true
            }
            None => false,
        }
    }

    // Resolves an in-flight request, returning what the backend still owes
    // us an event for
    fn close(self, error: Error) -> Option<StaleRequest> {
        match self {
            Slot::Empty => None,
            Slot::Occupied(in_flight) => {
                let stale = StaleRequest {
                    kind: in_flight.op.kind(),
                    target: in_flight.target,
                };
                in_flight.op.fail(error);
                Some(stale)
            }
            Slot::Detached { kind, target, .. } => Some(StaleRequest { kind, target }),
        }
    }
}

/// A request that was cancelled (by a disconnect) after it had been handed
/// to the backend
///
/// The backend may still report its completion later, possibly after the
/// peer has reconnected and something else is in flight. Unlike a detached
/// slot it doesn't hold up the peer's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StaleRequest {
    kind: OperationKind,
    target: Option<CachedAttribute>,
}

/// All the request state the IO task keeps for one peer
///
/// Signal strength reads have their own slot and queue since the backend
/// reports them independently of GATT requests; everything else is
/// serialized through the main slot in submission order.
#[derive(Debug, Default)]
pub(crate) struct PeerContext {
    main: Slot,
    queue: VecDeque<PendingOperation>,

    rssi: Slot,
    rssi_queue: VecDeque<PendingOperation>,

    sinks: HashMap<CharacteristicHandle, Vec<NotificationSink>>,

    stale: Vec<StaleRequest>,
}

impl PeerContext {
    pub(crate) fn enqueue(&mut self, pending: PendingOperation) {
        if pending.op.kind() == OperationKind::ReadSignalStrength {
            self.rssi_queue.push_back(pending);
        } else {
            self.queue.push_back(pending);
        }
    }

    /// The next queued request, if the main slot is free to take it
    pub(crate) fn next_main(&mut self) -> Option<PendingOperation> {
        if self.main.is_empty() {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub(crate) fn next_rssi(&mut self) -> Option<PendingOperation> {
        if self.rssi.is_empty() {
            self.rssi_queue.pop_front()
        } else {
            None
        }
    }

    fn slot_mut(&mut self, kind: OperationKind) -> &mut Slot {
        if kind == OperationKind::ReadSignalStrength {
            &mut self.rssi
        } else {
            &mut self.main
        }
    }

    pub(crate) fn register(&mut self, in_flight: InFlight) {
        let slot = self.slot_mut(in_flight.op.kind());
        debug_assert!(slot.is_empty(), "registered {:?} over a busy slot", in_flight.op.kind());
        *slot = Slot::Occupied(in_flight);
    }

    pub(crate) fn take(&mut self, kind: OperationKind,
                       target_matches: impl Fn(Option<&CachedAttribute>) -> bool) -> Taken
    {
        match self.slot_mut(kind).take(kind, &target_matches) {
            taken @ Taken::Unsolicited | taken @ Taken::Mismatched(_) => {
                let stale = self.stale
                                .iter()
                                .position(|stale| stale.kind == kind && target_matches(stale.target.as_ref()));
                match stale {
                    Some(pos) => {
                        self.stale.remove(pos);
                        Taken::Stale
                    }
                    None => taken,
                }
            }
            taken => taken,
        }
    }

    /// Remembers requests cancelled by an earlier disconnect whose
    /// completions may still turn up
    pub(crate) fn add_stale(&mut self, stale: Vec<StaleRequest>) {
        self.stale.extend(stale);
    }

    pub(crate) fn take_by_id(&mut self, kind: OperationKind, id: OpId) -> Option<InFlight> {
        self.slot_mut(kind).take_by_id(id)
    }

    /// Drops a request whose caller stopped waiting for it. Returns whether
    /// the request was found.
    pub(crate) fn abandon(&mut self, id: OpId) -> bool {
        for queue in [&mut self.queue, &mut self.rssi_queue] {
            if let Some(pos) = queue.iter().position(|pending| pending.id == id) {
                queue.remove(pos);
                return true;
            }
        }
        self.main.detach(id) || self.rssi.detach(id)
    }

    pub(crate) fn add_sink(&mut self, characteristic: CharacteristicHandle, sink: NotificationSink) {
        self.sinks.entry(characteristic).or_default().push(sink);
    }

    /// Removes a sink, returning the characteristic it was subscribed to and
    /// whether it was the last sink for that characteristic
    pub(crate) fn remove_sink(&mut self, sink_id: u64) -> Option<(CharacteristicHandle, bool)> {
        let (handle, sinks) = self.sinks
                                  .iter_mut()
                                  .find(|(_, sinks)| sinks.iter().any(|sink| sink.id() == sink_id))?;
        let handle = *handle;
        sinks.retain(|sink| sink.id() != sink_id);
        let last = sinks.is_empty();
        if last {
            self.sinks.remove(&handle);
        }
        Some((handle, last))
    }

    pub(crate) fn sinks(&self, characteristic: CharacteristicHandle) -> &[NotificationSink] {
        self.sinks
            .get(&characteristic)
            .map(|sinks| sinks.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.main.is_empty() &&
        self.rssi.is_empty() &&
        self.queue.is_empty() &&
        self.rssi_queue.is_empty() &&
        self.sinks.is_empty() &&
        self.stale.is_empty()
    }

    /// Resolves every request (queued or in flight) and closes every sink
    /// with an error produced by `error`
    ///
    /// Returns the requests the backend may still report completions for,
    /// including any left over from earlier.
    pub(crate) fn close(self, error: impl Fn() -> Error) -> Vec<StaleRequest> {
        let PeerContext { main, queue, rssi, rssi_queue, sinks, mut stale } = self;

        stale.extend(main.close(error()));
        stale.extend(rssi.close(error()));
        for pending in queue.into_iter().chain(rssi_queue) {
            pending.op.fail(error());
        }
        for sink in sinks.into_values().flatten() {
            sink.close(error());
        }
        stale
    }
}
