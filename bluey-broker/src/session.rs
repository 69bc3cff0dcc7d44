use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::io::{IoCmd, IoTask};
use crate::notify::{NotificationSink, Notifications};
use crate::registry::{Completion, OpId, Operation, PendingOperation};
use crate::scan::{Filter, Scan};
use crate::{AdapterState, BackendEvent, Characteristic, CharacteristicHandle, Descriptor, DescriptorHandle, Error,
            Event, Peer, PeripheralHandle, Result, Service, ServiceHandle, WriteType};

// Note the entry points into the backend generally provide the full heirarchy
// of associated handles (such as peripheral -> service -> characteristic -> descriptor)
// so that a backend doesn't have to track relationships between handles itself.
//
// None of the request methods return a result directly: `Ok(())` only means the
// request was accepted and the backend will later report exactly one matching
// event via its BackendBus. An `Err` means nothing was submitted and no event
// will follow.
#[async_trait]
pub trait BackendSession: Send + Sync + 'static {
    /// Called once, before the session starts, with the bus the backend must
    /// deliver all of its events through
    fn attach(&mut self, bus: BackendBus) -> Result<()>;

    fn start_scanning(&self, filter: &Filter, allow_duplicates: bool) -> Result<()>;
    fn stop_scanning(&self) -> Result<()>;

    async fn peripheral_connect(&self, peripheral_handle: PeripheralHandle) -> Result<()>;

    /// Tears down a connection (or connection attempt). The broker doesn't
    /// wait for the corresponding `PeripheralDisconnected` event.
    async fn peripheral_cancel_connection(&self, peripheral_handle: PeripheralHandle) -> Result<()>;

    async fn peripheral_read_rssi(&self, peripheral_handle: PeripheralHandle) -> Result<()>;

    /// Whether a write without response could be queued right now
    fn peripheral_can_write_without_response(&self, peripheral_handle: PeripheralHandle) -> bool;

    async fn peripheral_discover_gatt_services(&self, peripheral_handle: PeripheralHandle,
                                               of_interest_hint: &[Uuid])
                                               -> Result<()>;

    async fn gatt_service_discover_includes(&self, peripheral_handle: PeripheralHandle,
                                            service_handle: ServiceHandle,
                                            of_interest_hint: &[Uuid])
                                            -> Result<()>;
    async fn gatt_service_discover_characteristics(&self, peripheral_handle: PeripheralHandle,
                                                   service_handle: ServiceHandle,
                                                   of_interest_hint: &[Uuid])
                                                   -> Result<()>;

    async fn gatt_characteristic_discover_descriptors(&self, peripheral_handle: PeripheralHandle,
                                                      service_handle: ServiceHandle,
                                                      characteristic_handle: CharacteristicHandle)
                                                      -> Result<()>;

    async fn gatt_characteristic_read(&self, peripheral_handle: PeripheralHandle,
                                      service_handle: ServiceHandle,
                                      characteristic_handle: CharacteristicHandle)
                                      -> Result<()>;

    /// Writes without response are considered complete once accepted, so no
    /// `GattCharacteristicWritten` event should be sent for them
    async fn gatt_characteristic_write(&self, peripheral_handle: PeripheralHandle,
                                       service_handle: ServiceHandle,
                                       characteristic_handle: CharacteristicHandle,
                                       write_type: WriteType, data: &[u8])
                                       -> Result<()>;

    async fn gatt_characteristic_set_notify(&self, peripheral_handle: PeripheralHandle,
                                            service_handle: ServiceHandle,
                                            characteristic_handle: CharacteristicHandle,
                                            enabled: bool)
                                            -> Result<()>;

    async fn gatt_descriptor_read(&self, peripheral_handle: PeripheralHandle,
                                  service_handle: ServiceHandle,
                                  characteristic_handle: CharacteristicHandle,
                                  descriptor_handle: DescriptorHandle)
                                  -> Result<()>;
    async fn gatt_descriptor_write(&self, peripheral_handle: PeripheralHandle,
                                   service_handle: ServiceHandle,
                                   characteristic_handle: CharacteristicHandle,
                                   descriptor_handle: DescriptorHandle,
                                   data: &[u8])
                                   -> Result<()>;
}

/// The backend's end of the channel that carries its events into a session
///
/// Backends may send from any thread, including from within a request
/// method before it returns.
#[derive(Clone, Debug)]
pub struct BackendBus {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendBus {
    pub(crate) fn new(tx: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the session has gone away
    pub fn send(&self, event: BackendEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) scan_allow_duplicates: bool,
    pub(crate) event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            scan_allow_duplicates: false,
            event_capacity: 16,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail requests that haven't completed within the given time with
    /// `Error::Timeout`
    ///
    /// The backend isn't asked to abort the request: the peripheral stays
    /// busy until the backend eventually reports the late result (or the
    /// peripheral disconnects).
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.request_timeout = timeout;
        self
    }

    pub fn set_scan_allow_duplicates(&mut self, allow_duplicates: bool) -> &mut Self {
        self.scan_allow_duplicates = allow_duplicates;
        self
    }

    /// How many events `Session::events()` streams may lag behind before
    /// they start missing events
    pub fn set_event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = capacity;
        self
    }

    pub async fn start(&self, backend: impl BackendSession) -> Result<Session> {
        Session::start(self.clone(), Box::new(backend)).await
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[tokio::test]
async fn session_eq() {
    let session0 = SessionConfig::new().start(crate::fake::FakeSession::new()).await.unwrap();
    let session1 = SessionConfig::new().start(crate::fake::FakeSession::new()).await.unwrap();
    assert_ne!(session0, session1);
    assert_eq!(session0, session0.clone());
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // All broker state is owned by the IO task, we only ever talk to it
    // over this bus. The task exits once every sender (held here and by
    // outstanding requests and streams) has gone.
    io_bus: mpsc::UnboundedSender<IoCmd>,

    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    // Shared by request ids and notification sink ids. Id 0 is reserved for
    // requests the IO task makes on its own behalf.
    next_id: AtomicU64,

    config: SessionConfig,
}

// The future for one request's result
//
// If it's dropped before the result arrives (the caller's task was aborted,
// it lost a select!, or it timed out) then the IO task is told so it can
// forget the request.
struct PendingRequest<T> {
    peer: Peer,
    id: OpId,
    rx: oneshot::Receiver<Result<T>>,
    io_bus: mpsc::UnboundedSender<IoCmd>,
    done: bool,
}

impl<T> Future for PendingRequest<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or_else(|err| Err(err.into())))
            }
        }
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.io_bus.send(IoCmd::Abandon {
                peer: self.peer.clone(),
                id: self.id,
            });
        }
    }
}

impl Session {
    async fn start(config: SessionConfig, mut backend: Box<dyn BackendSession>) -> Result<Self> {
        let (event_bus, _) = broadcast::channel(config.event_capacity.max(1));

        // The backend is responsible for feeding the backend event bus and the
        // IO task handles all the state tracking, request resolution and
        // forwarding of events to the application
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        backend.attach(BackendBus::new(backend_bus_tx))?;

        let (io_bus_tx, io_bus_rx) = mpsc::unbounded_channel();
        let task = IoTask::new(backend, event_bus.clone(), &config);
        tokio::spawn(task.run(io_bus_rx, backend_bus_rx));

        Ok(Session {
            inner: Arc::new(SessionInner {
                io_bus: io_bus_tx,
                event_bus,
                next_id: AtomicU64::new(1),
                config,
            }),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request<T>(&self, peer: &Peer, op: impl FnOnce(Completion<T>) -> Operation) -> Result<T> {
        let (completion, rx) = Completion::channel();
        let id = self.next_id();
        self.io_bus.send(IoCmd::Request {
            peer: peer.clone(),
            pending: PendingOperation { id, op: op(completion) },
        })?;

        let pending = PendingRequest {
            peer: peer.clone(),
            id,
            rx,
            io_bus: self.io_bus.clone(),
            done: false,
        };
        match self.config.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending).await.map_err(|_| Error::Timeout)?,
            None => pending.await,
        }
    }

    /// Returns a stream of adapter and connection events
    ///
    /// A stream that falls too far behind (see
    /// `SessionConfig::set_event_capacity`) silently skips the events it
    /// missed.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    pub async fn adapter_state(&self) -> Result<AdapterState> {
        let (result_tx, result_rx) = oneshot::channel();
        self.io_bus.send(IoCmd::QueryAdapterState { result_tx })?;
        Ok(result_rx.await?)
    }

    /// Waits until every request made and every backend event delivered
    /// before this call has been processed
    pub async fn flush(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.io_bus.send(IoCmd::Flush { result_tx })?;
        Ok(result_rx.await?)
    }

    /// Shuts the session down
    ///
    /// Any scan is stopped and every outstanding request and notification
    /// stream fails with `Error::Cancelled`. Requests made afterwards fail.
    pub fn close(&self) -> Result<()> {
        self.io_bus.send(IoCmd::Shutdown)?;
        Ok(())
    }

    /// Starts scanning for Bluetooth devices, according to the given filter
    ///
    /// Only one scan can be active at a time: starting a new scan ends the
    /// stream of any previous one. Starting a scan also forgets every
    /// previously discovered device that isn't currently connected, so
    /// requests for them fail with `Error::UnknownPeer` until they are
    /// discovered again.
    pub async fn start_scanning(&self, filter: Filter) -> Result<Scan> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.io_bus.send(IoCmd::StartScanning {
            filter,
            sink: tx,
            result_tx,
        })?;
        let generation = result_rx.await??;

        Ok(Scan::new(generation, rx, self.io_bus.clone()))
    }

    /// Stops any active scan. It's not an error to call this when not
    /// scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.io_bus.send(IoCmd::StopScanning { generation: None })?;
        self.flush().await
    }

    /// Connects to a peer seen by the current scan
    ///
    /// Resolves immediately if the peer is already connected.
    pub async fn connect(&self, peer: &Peer) -> Result<()> {
        self.request(peer, |completion| Operation::Connect { completion }).await
    }

    /// Disconnects a peer
    ///
    /// Every request queued for the peer, or still waiting for the backend,
    /// fails with `Error::Disconnected`, any notification streams end and
    /// previously discovered attributes become invalid.
    pub async fn disconnect(&self, peer: &Peer) -> Result<()> {
        self.io_bus.send(IoCmd::Disconnect { peer: peer.clone() })?;
        self.flush().await
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        self.io_bus.send(IoCmd::DisconnectAll)?;
        self.flush().await
    }

    /// Discovers the primary services of a connected peer, optionally only
    /// those with one of the given `uuids`
    pub async fn discover_services(&self, peer: &Peer, uuids: &[Uuid]) -> Result<Vec<Service>> {
        let uuids = uuids.to_vec();
        self.request(peer, |completion| Operation::DiscoverServices { uuids, completion }).await
    }

    pub async fn discover_included_services(&self, service: &Service, uuids: &[Uuid]) -> Result<Vec<Service>> {
        let uuids = uuids.to_vec();
        self.request(service.peer(), |completion| Operation::DiscoverIncludedServices {
                service: service.attribute().clone(),
                uuids,
                completion,
            })
            .await
    }

    pub async fn discover_characteristics(&self, service: &Service, uuids: &[Uuid])
                                          -> Result<Vec<Characteristic>> {
        let uuids = uuids.to_vec();
        self.request(service.peer(), |completion| Operation::DiscoverCharacteristics {
                service: service.attribute().clone(),
                uuids,
                completion,
            })
            .await
    }

    pub async fn discover_descriptors(&self, characteristic: &Characteristic) -> Result<Vec<Descriptor>> {
        self.request(characteristic.peer(), |completion| Operation::DiscoverDescriptors {
                characteristic: characteristic.attribute().clone(),
                completion,
            })
            .await
    }

    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.request(characteristic.peer(), |completion| Operation::ReadCharacteristic {
                characteristic: characteristic.attribute().clone(),
                completion,
            })
            .await
    }

    /// Writes a characteristic value
    ///
    /// With `WriteType::WithoutResponse` this resolves as soon as the
    /// backend has accepted the write. Use `wait_writable_without_response`
    /// to avoid overflowing the backend's queue.
    pub async fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8],
                                      write_type: WriteType) -> Result<()> {
        let value = value.to_vec();
        self.request(characteristic.peer(), |completion| Operation::WriteCharacteristic {
                characteristic: characteristic.attribute().clone(),
                value,
                write_type,
                completion,
            })
            .await
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.request(descriptor.peer(), |completion| Operation::ReadDescriptor {
                descriptor: descriptor.attribute().clone(),
                completion,
            })
            .await
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        let value = value.to_vec();
        self.request(descriptor.peer(), |completion| Operation::WriteDescriptor {
                descriptor: descriptor.attribute().clone(),
                value,
                completion,
            })
            .await
    }

    /// Waits until the peer's link can take another write without response
    pub async fn wait_writable_without_response(&self, peer: &Peer) -> Result<()> {
        self.request(peer, |completion| Operation::AwaitWritableWithoutResponse { completion }).await
    }

    /// Enables notifications for a characteristic and returns the stream of
    /// notified values
    ///
    /// The stream is only returned once the peripheral has confirmed
    /// notifications are enabled, and no value notified after that point
    /// is missed.
    pub async fn subscribe(&self, characteristic: &Characteristic) -> Result<Notifications> {
        let sink_id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let attribute = characteristic.attribute().clone();
        let sink = NotificationSink::new(sink_id, attribute.clone(), tx);

        self.request(characteristic.peer(), |completion| Operation::SetNotificationState {
                characteristic: attribute,
                enabled: true,
                sink: Some(sink),
                completion,
            })
            .await?;

        Ok(Notifications::new(characteristic.clone(), sink_id, rx, self.io_bus.clone()))
    }

    /// Reads the signal strength of a connected peer
    ///
    /// Signal strength reads don't wait behind GATT requests for the same
    /// peer.
    pub async fn read_rssi(&self, peer: &Peer) -> Result<i16> {
        self.request(peer, |completion| Operation::ReadSignalStrength { completion }).await
    }
}
