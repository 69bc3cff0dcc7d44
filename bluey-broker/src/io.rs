use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use log::{debug, error, trace, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::cache::{Cache, CachedAttribute, ConnectionState};
use crate::registry::{Completion, InFlight, OpId, Operation, OperationKind, PeerContext, PendingOperation,
                      Taken, INTERNAL_OP_ID};
use crate::scan::{Filter, ScanSession};
use crate::session::{BackendSession, SessionConfig};
use crate::uuid::BluetoothUuid;
use crate::validation::{validate, Needs};
use crate::{AdapterState, AdvertisementData, Address, AttributeRef, BackendCharacteristic, BackendDescriptor,
            BackendEvent, BackendService, Characteristic, CharacteristicHandle, Descriptor, DescriptorHandle,
            DiscoveryEvent, Error, Event, GattError, Peer, PeripheralHandle, Result, Service, ServiceHandle,
            WriteType};

/// Commands sent from the `Session` (and the streams it hands out) to the IO
/// task
pub(crate) enum IoCmd {
    Request {
        peer: Peer,
        pending: PendingOperation,
    },
    // The caller stopped waiting for a request (dropped, cancelled or timed out)
    Abandon {
        peer: Peer,
        id: OpId,
    },
    StartScanning {
        filter: Filter,
        sink: mpsc::UnboundedSender<Result<DiscoveryEvent>>,
        result_tx: oneshot::Sender<Result<u64>>,
    },
    // `None` stops whatever scan is active
    StopScanning {
        generation: Option<u64>,
    },
    Unsubscribe {
        attribute: AttributeRef,
        sink_id: u64,
    },
    Disconnect {
        peer: Peer,
    },
    DisconnectAll,
    QueryAdapterState {
        result_tx: oneshot::Sender<AdapterState>,
    },
    Flush {
        result_tx: oneshot::Sender<()>,
    },
    Shutdown,
}

impl fmt::Debug for IoCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoCmd::Request { peer, pending } => write!(f, "Request({:?} #{} for {})", pending.op.kind(), pending.id, peer),
            IoCmd::Abandon { peer, id } => write!(f, "Abandon(#{} for {})", id, peer),
            IoCmd::StartScanning { filter, .. } => write!(f, "StartScanning({:?})", filter),
            IoCmd::StopScanning { generation } => write!(f, "StopScanning({:?})", generation),
            IoCmd::Unsubscribe { attribute, sink_id } => write!(f, "Unsubscribe({:?}, sink {})", attribute, sink_id),
            IoCmd::Disconnect { peer } => write!(f, "Disconnect({})", peer),
            IoCmd::DisconnectAll => write!(f, "DisconnectAll"),
            IoCmd::QueryAdapterState { .. } => write!(f, "QueryAdapterState"),
            IoCmd::Flush { .. } => write!(f, "Flush"),
            IoCmd::Shutdown => write!(f, "Shutdown"),
        }
    }
}

// What we actually ask of the backend for an operation, with broker-level
// references already resolved to backend handles.
#[derive(Debug)]
enum BackendRequest {
    Connect,
    DiscoverServices {
        uuids: Vec<Uuid>,
    },
    DiscoverIncludedServices {
        service: ServiceHandle,
        uuids: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        service: ServiceHandle,
        uuids: Vec<Uuid>,
    },
    DiscoverDescriptors {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
    },
    ReadCharacteristic {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
    },
    WriteCharacteristic {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
        enabled: bool,
    },
    ReadDescriptor {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
        descriptor: DescriptorHandle,
    },
    WriteDescriptor {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
        descriptor: DescriptorHandle,
        value: Vec<u8>,
    },
    // Nothing to submit, we just wait for the backend to tell us
    AwaitWritable,
    ReadRssi,
}

impl BackendRequest {
    // Values to write are moved out of the operation since it has no further
    // use for them once they've been handed to the backend.
    fn new(op: &mut Operation, target: Option<CachedAttribute>) -> Result<Self> {
        use CachedAttribute as A;

        Ok(match (op, target) {
            (Operation::Connect { .. }, _) => BackendRequest::Connect,
            (Operation::DiscoverServices { uuids, .. }, _) => {
                BackendRequest::DiscoverServices { uuids: uuids.clone() }
            }
            (Operation::DiscoverIncludedServices { uuids, .. }, Some(A::Service { service })) => {
                BackendRequest::DiscoverIncludedServices { service, uuids: uuids.clone() }
            }
            (Operation::DiscoverCharacteristics { uuids, .. }, Some(A::Service { service })) => {
                BackendRequest::DiscoverCharacteristics { service, uuids: uuids.clone() }
            }
            (Operation::DiscoverDescriptors { .. }, Some(A::Characteristic { service, characteristic })) => {
                BackendRequest::DiscoverDescriptors { service, characteristic }
            }
            (Operation::ReadCharacteristic { .. }, Some(A::Characteristic { service, characteristic })) => {
                BackendRequest::ReadCharacteristic { service, characteristic }
            }
            (Operation::WriteCharacteristic { value, write_type, .. },
             Some(A::Characteristic { service, characteristic })) => {
                BackendRequest::WriteCharacteristic {
                    service,
                    characteristic,
                    value: std::mem::take(value),
                    write_type: *write_type,
                }
            }
            (Operation::SetNotificationState { enabled, .. }, Some(A::Characteristic { service, characteristic })) => {
                BackendRequest::SetNotify { service, characteristic, enabled: *enabled }
            }
            (Operation::ReadDescriptor { .. }, Some(A::Descriptor { service, characteristic, descriptor })) => {
                BackendRequest::ReadDescriptor { service, characteristic, descriptor }
            }
            (Operation::WriteDescriptor { value, .. }, Some(A::Descriptor { service, characteristic, descriptor })) => {
                BackendRequest::WriteDescriptor {
                    service,
                    characteristic,
                    descriptor,
                    value: std::mem::take(value),
                }
            }
            (Operation::AwaitWritableWithoutResponse { .. }, _) => BackendRequest::AwaitWritable,
            (Operation::ReadSignalStrength { .. }, _) => BackendRequest::ReadRssi,

            // e.g. a descriptor reference where a characteristic was expected
            _ => return Err(Error::UnknownAttribute),
        })
    }
}

fn any_target(_target: Option<&CachedAttribute>) -> bool {
    true
}

fn service_target(handle: ServiceHandle) -> impl Fn(Option<&CachedAttribute>) -> bool {
    move |target| matches!(target, Some(CachedAttribute::Service { service }) if *service == handle)
}

fn characteristic_target(handle: CharacteristicHandle) -> impl Fn(Option<&CachedAttribute>) -> bool {
    move |target| {
        matches!(target, Some(CachedAttribute::Characteristic { characteristic, .. }) if *characteristic == handle)
    }
}

fn descriptor_target(handle: DescriptorHandle) -> impl Fn(Option<&CachedAttribute>) -> bool {
    move |target| matches!(target, Some(CachedAttribute::Descriptor { descriptor, .. }) if *descriptor == handle)
}

fn gatt_result<T>(error: Option<GattError>, value: T) -> Result<T> {
    match error {
        Some(error) => Err(Error::BackendFailure(error)),
        None => Ok(value),
    }
}

// The IO task is the only owner of broker state. Commands from the Session
// and events from the backend are both funnelled into this one task so all
// of the state below is only ever touched from here.
//
// Note: backend events are always given priority over commands, so by the
// time a command is processed every event the backend had already reported
// has been handled.
pub(crate) struct IoTask {
    backend: Box<dyn BackendSession>,
    event_bus: broadcast::Sender<Event>,
    scan_allow_duplicates: bool,

    adapter_state: AdapterState,
    cache: Cache,
    contexts: HashMap<Peer, PeerContext>,
    scan: Option<ScanSession>,
}

impl IoTask {
    pub(crate) fn new(backend: Box<dyn BackendSession>, event_bus: broadcast::Sender<Event>,
                      config: &SessionConfig) -> Self {
        Self {
            backend,
            event_bus,
            scan_allow_duplicates: config.scan_allow_duplicates,

            adapter_state: AdapterState::Unknown,
            cache: Cache::default(),
            contexts: HashMap::new(),
            scan: None,
        }
    }

    pub(crate) async fn run(mut self, mut io_bus: mpsc::UnboundedReceiver<IoCmd>,
                            mut backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Starting IO task");

        let mut backend_closed = false;
        loop {
            tokio::select! {
                biased;

                event = backend_bus.recv(), if !backend_closed => {
                    match event {
                        Some(event) => self.handle_backend_event(event).await,
                        None => {
                            warn!("Backend bus closed, no more backend events will be processed");
                            backend_closed = true;
                        }
                    }
                }
                cmd = io_bus.recv() => {
                    match cmd {
                        Some(IoCmd::Shutdown) => {
                            trace!("IO task shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_cmd(cmd).await,
                        None => {
                            trace!("Exiting IO task since the Session and all its streams have been dropped");
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown();
        trace!("Finished IO task");
    }

    fn shutdown(&mut self) {
        self.stop_scanning(None, Error::Cancelled);
        for (peer, context) in self.contexts.drain() {
            trace!("Cancelling outstanding requests for {}", peer);
            context.close(|| Error::Cancelled);
        }
    }

    async fn handle_cmd(&mut self, cmd: IoCmd) {
        trace!("IO cmd: {:?}", cmd);

        match cmd {
            IoCmd::Request { peer, pending } => {
                self.contexts.entry(peer.clone()).or_default().enqueue(pending);
                self.pump(&peer).await;
            }
            IoCmd::Abandon { peer, id } => {
                if let Some(context) = self.contexts.get_mut(&peer) {
                    if context.abandon(id) {
                        debug!("Request #{} for {} abandoned by caller", id, peer);
                    }
                }
                self.pump(&peer).await;
            }
            IoCmd::StartScanning { filter, sink, result_tx } => {
                self.start_scanning(filter, sink, result_tx);
            }
            IoCmd::StopScanning { generation } => {
                self.stop_scanning(generation, Error::Cancelled);
            }
            IoCmd::Unsubscribe { attribute, sink_id } => {
                self.unsubscribe(attribute, sink_id).await;
            }
            IoCmd::Disconnect { peer } => {
                self.disconnect(&peer).await;
            }
            IoCmd::DisconnectAll => {
                let mut peers: Vec<Peer> = self.cache
                                               .peers()
                                               .into_iter()
                                               .filter(|peer| self.is_linked(peer))
                                               .collect();
                for peer in self.contexts.keys() {
                    if !peers.contains(peer) {
                        peers.push(peer.clone());
                    }
                }
                for peer in peers {
                    self.disconnect(&peer).await;
                }
            }
            IoCmd::QueryAdapterState { result_tx } => {
                let _ = result_tx.send(self.adapter_state);
            }
            IoCmd::Flush { result_tx } => {
                let _ = result_tx.send(());
            }
            // Handled by the run loop
            IoCmd::Shutdown => {}
        }
    }

    fn is_linked(&self, peer: &Peer) -> bool {
        matches!(self.cache.peripheral(peer).map(|cached| cached.state),
                 Some(ConnectionState::Connecting) | Some(ConnectionState::Connected))
    }

    fn is_connected(&self, peer: &Peer) -> bool {
        matches!(self.cache.peripheral(peer).map(|cached| cached.state), Some(ConnectionState::Connected))
    }

    // Dispatches queued requests for a peer for as long as its slots are free
    async fn pump(&mut self, peer: &Peer) {
        loop {
            let next = match self.contexts.get_mut(peer) {
                Some(context) => match context.next_main() {
                    Some(pending) => Some(pending),
                    None => context.next_rssi(),
                },
                None => None,
            };
            match next {
                Some(pending) => self.dispatch(peer, pending).await,
                None => break,
            }
        }

        if matches!(self.contexts.get(peer), Some(context) if context.is_idle()) {
            self.contexts.remove(peer);
        }
    }

    async fn dispatch(&mut self, peer: &Peer, pending: PendingOperation) {
        let PendingOperation { id, mut op } = pending;
        let kind = op.kind();

        // Validation failures resolve the request without touching the backend
        let validated = match validate(self.adapter_state, &self.cache, Some(peer), &op.needs()) {
            Ok(validated) => validated,
            Err(err) => {
                debug!("{:?} #{} for {} rejected: {}", kind, id, peer, err);
                op.fail(err);
                return;
            }
        };
        let peripheral_handle = match validated.peripheral {
            Some(handle) => handle,
            None => {
                op.fail(Error::UnknownPeer);
                return;
            }
        };
        let request = match BackendRequest::new(&mut op, validated.attribute) {
            Ok(request) => request,
            Err(err) => {
                op.fail(err);
                return;
            }
        };

        // Someone may have subscribed again while the disable was queued
        if let BackendRequest::SetNotify { characteristic, enabled: false, .. } = &request {
            let subscribed = self.contexts
                                 .get(peer)
                                 .map(|context| !context.sinks(*characteristic).is_empty())
                                 .unwrap_or(false);
            if subscribed {
                debug!("Not disabling notifications for {:?} of {} since it has subscribers again",
                       characteristic, peer);
                if let Operation::SetNotificationState { completion, .. } = op {
                    completion.resolve(Ok(()));
                }
                return;
            }
        }

        // The backend can't scan and talk to a peripheral at the same time
        self.stop_scanning(None, Error::Cancelled);

        // Some requests complete without waiting for an event
        let op = match op {
            Operation::Connect { completion } if self.is_connected(peer) => {
                trace!("{} is already connected", peer);
                completion.resolve(Ok(()));
                return;
            }
            Operation::AwaitWritableWithoutResponse { completion }
                if self.backend.peripheral_can_write_without_response(peripheral_handle) =>
            {
                completion.resolve(Ok(()));
                return;
            }
            Operation::WriteCharacteristic { write_type: WriteType::WithoutResponse, completion, .. } => {
                trace!("Dispatching {:?} #{} (without response) for {}", kind, id, peer);
                completion.resolve(self.submit(peripheral_handle, request).await);
                return;
            }
            op => op,
        };

        if kind == OperationKind::Connect {
            self.cache.set_state(peer, ConnectionState::Connecting);
        }

        trace!("Dispatching {:?} #{} for {}: {:?}", kind, id, peer, request);
        self.contexts.entry(peer.clone()).or_default().register(InFlight {
            id,
            op,
            target: validated.attribute,
        });

        if let Err(err) = self.submit(peripheral_handle, request).await {
            warn!("Backend failed to submit {:?} #{} for {}: {}", kind, id, peer, err);
            if kind == OperationKind::Connect {
                self.cache.set_state(peer, ConnectionState::Disconnected);
            }
            let in_flight = self.contexts.get_mut(peer).and_then(|context| context.take_by_id(kind, id));
            if let Some(in_flight) = in_flight {
                in_flight.op.fail(err);
            }
        }
    }

    async fn submit(&self, peripheral_handle: PeripheralHandle, request: BackendRequest) -> Result<()> {
        let backend = &self.backend;
        match request {
            BackendRequest::Connect => backend.peripheral_connect(peripheral_handle).await,
            BackendRequest::DiscoverServices { uuids } => {
                backend.peripheral_discover_gatt_services(peripheral_handle, &uuids).await
            }
            BackendRequest::DiscoverIncludedServices { service, uuids } => {
                backend.gatt_service_discover_includes(peripheral_handle, service, &uuids).await
            }
            BackendRequest::DiscoverCharacteristics { service, uuids } => {
                backend.gatt_service_discover_characteristics(peripheral_handle, service, &uuids).await
            }
            BackendRequest::DiscoverDescriptors { service, characteristic } => {
                backend.gatt_characteristic_discover_descriptors(peripheral_handle, service, characteristic).await
            }
            BackendRequest::ReadCharacteristic { service, characteristic } => {
                backend.gatt_characteristic_read(peripheral_handle, service, characteristic).await
            }
            BackendRequest::WriteCharacteristic { service, characteristic, value, write_type } => {
                backend.gatt_characteristic_write(peripheral_handle, service, characteristic, write_type, &value)
                       .await
            }
            BackendRequest::SetNotify { service, characteristic, enabled } => {
                backend.gatt_characteristic_set_notify(peripheral_handle, service, characteristic, enabled).await
            }
            BackendRequest::ReadDescriptor { service, characteristic, descriptor } => {
                backend.gatt_descriptor_read(peripheral_handle, service, characteristic, descriptor).await
            }
            BackendRequest::WriteDescriptor { service, characteristic, descriptor, value } => {
                backend.gatt_descriptor_write(peripheral_handle, service, characteristic, descriptor, &value).await
            }
            BackendRequest::AwaitWritable => Ok(()),
            BackendRequest::ReadRssi => backend.peripheral_read_rssi(peripheral_handle).await,
        }
    }

    fn start_scanning(&mut self, filter: Filter, sink: mpsc::UnboundedSender<Result<DiscoveryEvent>>,
                      result_tx: oneshot::Sender<Result<u64>>) {
        if let Err(err) = validate(self.adapter_state, &self.cache, None, &Needs::adapter()) {
            let _ = result_tx.send(Err(err));
            return;
        }

        // Only one scan at a time, the previous consumer sees its stream cancelled
        self.stop_scanning(None, Error::Cancelled);

        let generation = self.cache.start_generation();
        if let Err(err) = self.backend.start_scanning(&filter, self.scan_allow_duplicates) {
            warn!("Backend failed to start scanning: {}", err);
            let _ = result_tx.send(Err(err));
            return;
        }

        debug!("Scan generation {} started with {:?}", generation, filter);
        self.scan = Some(ScanSession::new(generation, filter, sink));
        if result_tx.send(Ok(generation)).is_err() {
            debug!("Scan requester went away before the scan started");
            self.stop_scanning(Some(generation), Error::Cancelled);
        }
    }

    fn stop_scanning(&mut self, generation: Option<u64>, reason: Error) {
        let current = match (&self.scan, generation) {
            (Some(scan), Some(generation)) => scan.generation() == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !current {
            return;
        }

        if let Some(scan) = self.scan.take() {
            debug!("Stopping scan generation {}", scan.generation());
            if let Err(err) = self.backend.stop_scanning() {
                warn!("Backend failed to stop scanning: {}", err);
            }
            scan.finish(reason);
        }
    }

    async fn unsubscribe(&mut self, attribute: AttributeRef, sink_id: u64) {
        let peer = attribute.peer().clone();
        let removed = self.contexts.get_mut(&peer).and_then(|context| context.remove_sink(sink_id));

        match removed {
            None => {
                trace!("Notification sink {} for {:?} was already closed", sink_id, attribute);
            }
            Some((_, false)) => {
                trace!("Notification sink {} for {:?} closed, other subscribers remain", sink_id, attribute);
            }
            Some((_, true)) => {
                debug!("Last subscriber for {:?} went away, disabling notifications", attribute);
                self.queue_disable(&peer, attribute);
                self.pump(&peer).await;
            }
        }
    }

    // Queues a request to turn notifications off behind whatever the peer is
    // already doing. Nobody waits for it, so the result is only logged.
    fn queue_disable(&mut self, peer: &Peer, attribute: AttributeRef) {
        let (completion, rx) = Completion::channel();
        let logged_attribute = attribute.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => trace!("Notifications disabled for {:?}", logged_attribute),
                // Nothing left to disable
                Ok(Err(Error::Disconnected)) | Ok(Err(Error::Cancelled)) | Err(_) => {}
                Ok(Err(err)) => warn!("Failed to disable notifications for {:?}: {}", logged_attribute, err),
            }
        });

        self.contexts.entry(peer.clone()).or_default().enqueue(PendingOperation {
            id: INTERNAL_OP_ID,
            op: Operation::SetNotificationState {
                characteristic: attribute,
                enabled: false,
                sink: None,
                completion,
            },
        });
    }

    async fn disconnect(&mut self, peer: &Peer) {
        let cached = self.cache.peripheral(peer).map(|cached| (cached.handle, cached.state));
        if let Some((peripheral_handle, state)) = cached {
            if state != ConnectionState::Disconnected {
                if let Err(err) = self.backend.peripheral_cancel_connection(peripheral_handle).await {
                    warn!("Backend failed to disconnect {}: {}", peer, err);
                }
            }
        }

        // We don't wait for the backend to confirm; its PeripheralDisconnected
        // event will find nothing left to clean up.
        self.propagate_disconnect(peer, None);
    }

    fn propagate_disconnect(&mut self, peer: &Peer, error: Option<GattError>) {
        let previous = self.cache.set_state(peer, ConnectionState::Disconnected);

        if let Some(context) = self.contexts.remove(peer) {
            trace!("Failing outstanding requests and subscriptions for {}", peer);
            let stale = context.close(|| Error::Disconnected);
            // The backend may still complete the requests that were in flight
            if !stale.is_empty() {
                self.contexts.entry(peer.clone()).or_default().add_stale(stale);
            }
        }
        self.cache.purge_attributes(peer);

        if previous == Some(ConnectionState::Connected) {
            trace!("Notifying peripheral {} disconnected", peer);
            let _ = self.event_bus.send(Event::PeripheralDisconnected {
                peer: peer.clone(),
                error,
            });
        } else {
            trace!("Redundant disconnect for {} (was {:?})", peer, previous);
        }
    }

    fn take_in_flight(&mut self, peer: &Peer, kind: OperationKind,
                      target_matches: impl Fn(Option<&CachedAttribute>) -> bool) -> Option<InFlight>
    {
        let taken = match self.contexts.get_mut(peer) {
            Some(context) => context.take(kind, target_matches),
            None => Taken::Unsolicited,
        };
        match taken {
            Taken::Matched(in_flight) => Some(in_flight),
            taken => {
                self.log_unmatched(peer, kind, taken);
                None
            }
        }
    }

    // Events that don't complete a waiting request. Anything we can't account
    // for means events can no longer be paired with requests for this backend.
    fn log_unmatched(&self, peer: &Peer, kind: OperationKind, taken: Taken) {
        match taken {
            Taken::Matched(_) => {}
            Taken::Detached(_) => {
                debug!("Dropping {:?} result for {} since its caller went away", kind, peer);
            }
            Taken::Stale => {
                debug!("Dropping late {:?} result for {} from before it disconnected", kind, peer);
            }
            Taken::Unsolicited => {
                warn!("Spurious {:?} completion for {} with no request in flight", kind, peer);
            }
            Taken::Mismatched(found) => {
                error!("Backend reported a {:?} completion for {} while {:?} was in flight", kind, peer, found);
                panic!("Inconsistent backend event: {:?} completion while {:?} was in flight", kind, found);
            }
        }
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        let peripheral_handle = match event {
            BackendEvent::StateChanged { state } => {
                self.on_state_changed(state);
                return;
            }
            BackendEvent::PeripheralDiscovered { peripheral_handle, address, rssi, advertisement, connectable } => {
                self.on_peripheral_discovered(peripheral_handle, address, rssi, advertisement, connectable);
                return;
            }
            BackendEvent::PeripheralConnected { peripheral_handle } |
            BackendEvent::PeripheralConnectionFailed { peripheral_handle, .. } |
            BackendEvent::PeripheralDisconnected { peripheral_handle, .. } |
            BackendEvent::GattServicesDiscovered { peripheral_handle, .. } |
            BackendEvent::GattIncludedServicesDiscovered { peripheral_handle, .. } |
            BackendEvent::GattCharacteristicsDiscovered { peripheral_handle, .. } |
            BackendEvent::GattDescriptorsDiscovered { peripheral_handle, .. } |
            BackendEvent::GattCharacteristicValue { peripheral_handle, .. } |
            BackendEvent::GattCharacteristicWritten { peripheral_handle, .. } |
            BackendEvent::GattDescriptorValue { peripheral_handle, .. } |
            BackendEvent::GattDescriptorWritten { peripheral_handle, .. } |
            BackendEvent::GattNotifyStateUpdated { peripheral_handle, .. } |
            BackendEvent::ReadyToWriteWithoutResponse { peripheral_handle } |
            BackendEvent::RssiRead { peripheral_handle, .. } => peripheral_handle,
        };

        let peer = match self.cache.peer_for_handle(peripheral_handle) {
            Some(peer) => peer.clone(),
            None => {
                debug!("Ignoring event for unknown peripheral {:?}: {:?}", peripheral_handle, event);
                return;
            }
        };

        match event {
            BackendEvent::StateChanged { .. } | BackendEvent::PeripheralDiscovered { .. } => {}
            BackendEvent::PeripheralConnected { .. } => self.on_connected(&peer),
            BackendEvent::PeripheralConnectionFailed { error, .. } => self.on_connection_failed(&peer, error),
            BackendEvent::PeripheralDisconnected { error, .. } => {
                debug!("Backend reported {} disconnected", peer);
                self.propagate_disconnect(&peer, error);
            }
            BackendEvent::GattServicesDiscovered { services, error, .. } => {
                self.on_services_discovered(&peer, services, error);
            }
            BackendEvent::GattIncludedServicesDiscovered { service_handle, services, error, .. } => {
                self.on_included_services_discovered(&peer, service_handle, services, error);
            }
            BackendEvent::GattCharacteristicsDiscovered { service_handle, characteristics, error, .. } => {
                self.on_characteristics_discovered(&peer, service_handle, characteristics, error);
            }
            BackendEvent::GattDescriptorsDiscovered { characteristic_handle, descriptors, error, .. } => {
                self.on_descriptors_discovered(&peer, characteristic_handle, descriptors, error);
            }
            BackendEvent::GattCharacteristicValue { characteristic_handle, value, error, .. } => {
                self.on_characteristic_value(&peer, characteristic_handle, value, error);
            }
            BackendEvent::GattCharacteristicWritten { characteristic_handle, error, .. } => {
                let in_flight = self.take_in_flight(&peer, OperationKind::WriteCharacteristic,
                                                    characteristic_target(characteristic_handle));
                if let Some(InFlight { op: Operation::WriteCharacteristic { completion, .. }, .. }) = in_flight {
                    completion.resolve(gatt_result(error, ()));
                }
            }
            BackendEvent::GattDescriptorValue { descriptor_handle, value, error, .. } => {
                let in_flight = self.take_in_flight(&peer, OperationKind::ReadDescriptor,
                                                    descriptor_target(descriptor_handle));
                if let Some(InFlight { op: Operation::ReadDescriptor { completion, .. }, .. }) = in_flight {
                    completion.resolve(gatt_result(error, value));
                }
            }
            BackendEvent::GattDescriptorWritten { descriptor_handle, error, .. } => {
                let in_flight = self.take_in_flight(&peer, OperationKind::WriteDescriptor,
                                                    descriptor_target(descriptor_handle));
                if let Some(InFlight { op: Operation::WriteDescriptor { completion, .. }, .. }) = in_flight {
                    completion.resolve(gatt_result(error, ()));
                }
            }
            BackendEvent::GattNotifyStateUpdated { characteristic_handle, enabled, error, .. } => {
                self.on_notify_state_updated(&peer, characteristic_handle, enabled, error);
            }
            BackendEvent::ReadyToWriteWithoutResponse { .. } => {
                // Backends may report this whenever their write queue drains,
                // not only when we asked
                let taken = match self.contexts.get_mut(&peer) {
                    Some(context) => context.take(OperationKind::AwaitWritableWithoutResponse, any_target),
                    None => Taken::Unsolicited,
                };
                match taken {
                    Taken::Matched(InFlight { op: Operation::AwaitWritableWithoutResponse { completion }, .. }) => {
                        completion.resolve(Ok(()));
                    }
                    _ => trace!("{} is ready to write without response", peer),
                }
            }
            BackendEvent::RssiRead { rssi, error, .. } => {
                let in_flight = self.take_in_flight(&peer, OperationKind::ReadSignalStrength, any_target);
                if let Some(InFlight { op: Operation::ReadSignalStrength { completion }, .. }) = in_flight {
                    completion.resolve(gatt_result(error, rssi));
                }
            }
        }

        self.pump(&peer).await;
    }

    fn on_state_changed(&mut self, state: AdapterState) {
        let previous = std::mem::replace(&mut self.adapter_state, state);
        if previous == state {
            return;
        }
        debug!("Adapter state changed from {:?} to {:?}", previous, state);

        if state != AdapterState::PoweredOn {
            // Nothing survives the adapter going away
            if let Some(scan) = self.scan.take() {
                scan.finish(Error::AdapterNotReady);
            }
            for (peer, context) in self.contexts.drain() {
                trace!("Failing outstanding requests for {} since the adapter is not ready", peer);
                context.close(|| Error::AdapterNotReady);
            }
            for peer in self.cache.peers() {
                if self.is_connected(&peer) {
                    let _ = self.event_bus.send(Event::PeripheralDisconnected { peer, error: None });
                }
            }
            self.cache.clear();
        }

        let _ = self.event_bus.send(Event::AdapterStateChanged { state });
    }

    fn on_peripheral_discovered(&mut self, peripheral_handle: PeripheralHandle, address: Address, rssi: i16,
                                advertisement: AdvertisementData, connectable: bool) {
        let scan = match &self.scan {
            Some(scan) => scan,
            None => {
                trace!("Ignoring discovery of {} while not scanning", address);
                return;
            }
        };
        if !scan.filter().matches(&advertisement) {
            trace!("Ignoring discovery of {} that doesn't match the scan filter", address);
            return;
        }

        let peer = Peer::new(address);
        self.cache.refresh_peripheral(&peer, peripheral_handle);

        let event = DiscoveryEvent {
            peer,
            timestamp: SystemTime::now(),
            rssi,
            advertisement,
            connectable,
        };
        if !scan.emit(event) {
            debug!("Scan consumer went away");
            self.stop_scanning(None, Error::Cancelled);
        }
    }

    fn on_connected(&mut self, peer: &Peer) {
        let previous = self.cache.set_state(peer, ConnectionState::Connected);

        let taken = match self.contexts.get_mut(peer) {
            Some(context) => context.take(OperationKind::Connect, any_target),
            None => Taken::Unsolicited,
        };
        match taken {
            Taken::Matched(InFlight { op: Operation::Connect { completion }, .. }) => completion.resolve(Ok(())),
            Taken::Detached(_) => debug!("{} connected after its connect request was abandoned", peer),
            _ => {
                if previous == Some(ConnectionState::Connected) {
                    warn!("Spurious, unbalanced/redundant PeripheralConnected notification from backend");
                }
            }
        }

        if previous != Some(ConnectionState::Connected) {
            trace!("Notifying peripheral {} connected", peer);
            let _ = self.event_bus.send(Event::PeripheralConnected { peer: peer.clone() });
        }
    }

    fn on_connection_failed(&mut self, peer: &Peer, error: Option<GattError>) {
        self.cache.set_state(peer, ConnectionState::Disconnected);

        let in_flight = self.take_in_flight(peer, OperationKind::Connect, any_target);
        if let Some(InFlight { op: Operation::Connect { completion }, .. }) = in_flight {
            let error = error.clone()
                             .unwrap_or_else(|| GattError::GeneralFailure("connection attempt failed".to_string()));
            completion.resolve(Err(Error::BackendFailure(error)));
        }

        let _ = self.event_bus.send(Event::PeripheralFailedToConnect {
            peer: peer.clone(),
            error,
        });
    }

    fn on_services_discovered(&mut self, peer: &Peer, services: Vec<BackendService>, error: Option<GattError>) {
        let in_flight = self.take_in_flight(peer, OperationKind::DiscoverServices, any_target);
        if let Some(InFlight { op: Operation::DiscoverServices { uuids, completion }, .. }) = in_flight {
            if let Some(error) = error {
                completion.resolve(Err(Error::BackendFailure(error)));
                return;
            }
            let services = services.into_iter()
                                   .filter(|service| uuids.is_empty() || uuids.contains(&service.uuid))
                                   .map(|service| {
                                       trace!("{} has service {} ({:?})", peer, service.uuid.short(), service.handle);
                                       let attribute = self.cache.insert_attribute(peer, CachedAttribute::Service {
                                           service: service.handle,
                                       });
                                       Service::new(attribute, service.uuid, service.is_primary)
                                   })
                                   .collect();
            completion.resolve(Ok(services));
        }
    }

    fn on_included_services_discovered(&mut self, peer: &Peer, service_handle: ServiceHandle,
                                       services: Vec<BackendService>, error: Option<GattError>) {
        let in_flight = self.take_in_flight(peer, OperationKind::DiscoverIncludedServices,
                                            service_target(service_handle));
        if let Some(InFlight { op: Operation::DiscoverIncludedServices { uuids, completion, .. }, .. }) = in_flight {
            if let Some(error) = error {
                completion.resolve(Err(Error::BackendFailure(error)));
                return;
            }
            let services = services.into_iter()
                                   .filter(|service| uuids.is_empty() || uuids.contains(&service.uuid))
                                   .map(|service| {
                                       trace!("{} has service {} ({:?})", peer, service.uuid.short(), service.handle);
                                       let attribute = self.cache.insert_attribute(peer, CachedAttribute::Service {
                                           service: service.handle,
                                       });
                                       Service::new(attribute, service.uuid, service.is_primary)
                                   })
                                   .collect();
            completion.resolve(Ok(services));
        }
    }

    fn on_characteristics_discovered(&mut self, peer: &Peer, service_handle: ServiceHandle,
                                     characteristics: Vec<BackendCharacteristic>, error: Option<GattError>) {
        let in_flight = self.take_in_flight(peer, OperationKind::DiscoverCharacteristics,
                                            service_target(service_handle));
        if let Some(InFlight { op: Operation::DiscoverCharacteristics { service, uuids, completion }, .. }) = in_flight {
            if let Some(error) = error {
                completion.resolve(Err(Error::BackendFailure(error)));
                return;
            }
            let characteristics = characteristics
                .into_iter()
                .filter(|characteristic| uuids.is_empty() || uuids.contains(&characteristic.uuid))
                .map(|characteristic| {
                    trace!("{} has characteristic {} ({:?}) in {:?}",
                           peer, characteristic.uuid.short(), characteristic.handle, service_handle);
                    let attribute = self.cache.insert_attribute(peer, CachedAttribute::Characteristic {
                        service: service_handle,
                        characteristic: characteristic.handle,
                    });
                    Characteristic::new(attribute, service.clone(), characteristic.uuid, characteristic.properties)
                })
                .collect();
            completion.resolve(Ok(characteristics));
        }
    }

    fn on_descriptors_discovered(&mut self, peer: &Peer, characteristic_handle: CharacteristicHandle,
                                 descriptors: Vec<BackendDescriptor>, error: Option<GattError>) {
        let in_flight = self.take_in_flight(peer, OperationKind::DiscoverDescriptors,
                                            characteristic_target(characteristic_handle));
        let (characteristic, completion, service_handle) = match in_flight {
            Some(InFlight {
                op: Operation::DiscoverDescriptors { characteristic, completion },
                target: Some(CachedAttribute::Characteristic { service, .. }),
                ..
            }) => (characteristic, completion, service),
            _ => return,
        };
        if let Some(error) = error {
            completion.resolve(Err(Error::BackendFailure(error)));
            return;
        }

        let descriptors = descriptors.into_iter()
                                     .map(|descriptor| {
                                         trace!("{} has descriptor {} ({:?}) on {:?}",
                                                peer, descriptor.uuid.short(), descriptor.handle, characteristic_handle);
                                         let attribute = self.cache.insert_attribute(peer, CachedAttribute::Descriptor {
                                             service: service_handle,
                                             characteristic: characteristic_handle,
                                             descriptor: descriptor.handle,
                                         });
                                         Descriptor::new(attribute, characteristic.clone(), descriptor.uuid)
                                     })
                                     .collect();
        completion.resolve(Ok(descriptors));
    }

    // Value updates either answer a read or carry a notification. A pending
    // read for the same characteristic always takes precedence.
    fn on_characteristic_value(&mut self, peer: &Peer, characteristic_handle: CharacteristicHandle,
                               value: Vec<u8>, error: Option<GattError>) {
        let taken = match self.contexts.get_mut(peer) {
            Some(context) => context.take(OperationKind::ReadCharacteristic, characteristic_target(characteristic_handle)),
            None => Taken::Unsolicited,
        };

        match taken {
            Taken::Matched(in_flight) => {
                if let Operation::ReadCharacteristic { completion, .. } = in_flight.op {
                    completion.resolve(gatt_result(error, value));
                }
            }
            Taken::Detached(_) | Taken::Stale => {
                debug!("Dropping read of {:?} for {} since its caller went away", characteristic_handle, peer);
            }
            Taken::Unsolicited | Taken::Mismatched(_) => {
                if let Some(error) = error {
                    debug!("Ignoring failed value update for {:?} of {}: {}", characteristic_handle, peer, error);
                    return;
                }
                let delivered = self.contexts
                                    .get(peer)
                                    .map(|context| {
                                        context.sinks(characteristic_handle)
                                               .iter()
                                               .filter(|sink| sink.deliver(&value))
                                               .count()
                                    })
                                    .unwrap_or(0);
                if delivered == 0 {
                    debug!("Ignoring unsolicited value update for {:?} of {}", characteristic_handle, peer);
                }
            }
        }
    }

    fn on_notify_state_updated(&mut self, peer: &Peer, characteristic_handle: CharacteristicHandle,
                               enabled: bool, error: Option<GattError>) {
        let taken = match self.contexts.get_mut(peer) {
            Some(context) => context.take(OperationKind::SetNotificationState,
                                          characteristic_target(characteristic_handle)),
            None => Taken::Unsolicited,
        };
        let (attribute, requested, sink, completion) = match taken {
            Taken::Matched(InFlight {
                op: Operation::SetNotificationState { characteristic, enabled, sink, completion },
                ..
            }) => (characteristic, enabled, sink, completion),
            // The subscriber went away while notifications were being
            // enabled, so nobody would ever turn them off again
            Taken::Detached(Some(attribute)) => {
                if enabled && error.is_none() {
                    debug!("Subscriber for {:?} went away while enabling notifications, disabling them", attribute);
                    self.queue_disable(peer, attribute);
                }
                return;
            }
            taken => {
                self.log_unmatched(peer, OperationKind::SetNotificationState, taken);
                return;
            }
        };

        if let Some(error) = error {
            completion.resolve(Err(Error::BackendFailure(error)));
            return;
        }
        if enabled != requested {
            warn!("Backend reported notifications {} for {:?} of {} after asking for {}",
                  if enabled { "enabled" } else { "disabled" }, characteristic_handle, peer,
                  if requested { "enabled" } else { "disabled" });
        }

        // The sink has to be in place before the subscriber hears about it,
        // otherwise the first notification could be dropped
        if let (true, Some(sink)) = (requested, sink) {
            // The subscribe call was dropped before we got to its abandonment
            if sink.is_closed() {
                debug!("Subscriber for {:?} is already gone, disabling notifications", attribute);
                self.queue_disable(peer, attribute);
                return;
            }
            self.contexts.entry(peer.clone()).or_default().add_sink(characteristic_handle, sink);
        }
        completion.resolve(Ok(()));
    }
}
