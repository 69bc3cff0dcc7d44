use std::collections::{BTreeMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use log::trace;
use uuid::Uuid;

use crate::scan::Filter;
use crate::session::{BackendBus, BackendSession};
use crate::{AdapterState, AdvertisementData, Address, BackendCharacteristic, BackendDescriptor, BackendEvent,
            BackendService, CharacteristicHandle, CharacteristicProperties, DescriptorHandle, Error, GattError,
            PeripheralHandle, Result, ServiceHandle, WriteType};

/// A descriptor to expose from a [`FakeCharacteristic`]
#[derive(Clone, Debug)]
pub struct FakeDescriptor {
    uuid: Uuid,
    value: Vec<u8>,
}

impl FakeDescriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, value: vec![] }
    }

    pub fn value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<FakeDescriptor>,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: vec![],
            descriptors: vec![],
        }
    }

    pub fn value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }

    pub fn descriptor(mut self, descriptor: FakeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeService {
    uuid: Uuid,
    is_primary: bool,
    includes: Vec<FakeService>,
    characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            is_primary: true,
            includes: vec![],
            characteristics: vec![],
        }
    }

    pub fn secondary(mut self) -> Self {
        self.is_primary = false;
        self
    }

    pub fn include(mut self, service: FakeService) -> Self {
        self.includes.push(service);
        self
    }

    pub fn characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A scripted remote device
#[derive(Clone, Debug)]
pub struct FakePeripheral {
    address: Address,
    name: Option<String>,
    rssi: i16,
    connectable: bool,
    advertised_services: Vec<Uuid>,
    services: Vec<FakeService>,
}

impl FakePeripheral {
    pub fn new(address: &str) -> Self {
        Self {
            address: Address::from_str(address).unwrap_or_else(|never| match never {}),
            name: None,
            rssi: -60,
            connectable: true,
            advertised_services: vec![],
            services: vec![],
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn not_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn advertise_service(mut self, uuid: Uuid) -> Self {
        self.advertised_services.push(uuid);
        self
    }

    pub fn service(mut self, service: FakeService) -> Self {
        self.services.push(service);
        self
    }
}

/// A request the fake backend accepted, in submission order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeRequest {
    StartScanning { allow_duplicates: bool },
    StopScanning,
    Connect(PeripheralHandle),
    CancelConnection(PeripheralHandle),
    ReadRssi(PeripheralHandle),
    DiscoverServices(PeripheralHandle),
    DiscoverIncludes(PeripheralHandle, ServiceHandle),
    DiscoverCharacteristics(PeripheralHandle, ServiceHandle),
    DiscoverDescriptors(PeripheralHandle, CharacteristicHandle),
    ReadCharacteristic(PeripheralHandle, CharacteristicHandle),
    WriteCharacteristic(PeripheralHandle, CharacteristicHandle, WriteType, Vec<u8>),
    SetNotify(PeripheralHandle, CharacteristicHandle, bool),
    ReadDescriptor(PeripheralHandle, DescriptorHandle),
    WriteDescriptor(PeripheralHandle, DescriptorHandle, Vec<u8>),
}

#[derive(Debug)]
struct ServiceEntry {
    uuid: Uuid,
    is_primary: bool,
    includes: Vec<ServiceHandle>,
    characteristics: Vec<CharacteristicHandle>,
}

#[derive(Debug)]
struct CharacteristicEntry {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<DescriptorHandle>,
}

#[derive(Debug)]
struct DescriptorEntry {
    uuid: Uuid,
    value: Vec<u8>,
}

// Attribute handles are allocated per peripheral, starting from 1 like ATT
// handles would
#[derive(Debug)]
struct PeripheralEntry {
    handle: PeripheralHandle,
    address: Address,
    name: Option<String>,
    rssi: i16,
    connectable: bool,
    advertised_services: Vec<Uuid>,

    next_attribute_handle: u32,
    primary_services: Vec<ServiceHandle>,
    services: BTreeMap<ServiceHandle, ServiceEntry>,
    characteristics: BTreeMap<CharacteristicHandle, CharacteristicEntry>,
    descriptors: BTreeMap<DescriptorHandle, DescriptorEntry>,

    connected: bool,
    notifying: HashSet<CharacteristicHandle>,
}

impl PeripheralEntry {
    fn new(handle: PeripheralHandle, peripheral: FakePeripheral) -> Self {
        let mut entry = Self {
            handle,
            address: peripheral.address,
            name: peripheral.name,
            rssi: peripheral.rssi,
            connectable: peripheral.connectable,
            advertised_services: peripheral.advertised_services,
            next_attribute_handle: 1,
            primary_services: vec![],
            services: BTreeMap::new(),
            characteristics: BTreeMap::new(),
            descriptors: BTreeMap::new(),
            connected: false,
            notifying: HashSet::new(),
        };
        for service in peripheral.services {
            let service_handle = entry.add_service(service);
            entry.primary_services.push(service_handle);
        }
        entry
    }

    fn allocate(&mut self) -> u32 {
        let handle = self.next_attribute_handle;
        self.next_attribute_handle += 1;
        handle
    }

    fn add_service(&mut self, service: FakeService) -> ServiceHandle {
        let service_handle = ServiceHandle(self.allocate());

        let mut characteristics = vec![];
        for characteristic in service.characteristics {
            let characteristic_handle = CharacteristicHandle(self.allocate());
            let mut descriptors = vec![];
            for descriptor in characteristic.descriptors {
                let descriptor_handle = DescriptorHandle(self.allocate());
                self.descriptors.insert(descriptor_handle, DescriptorEntry {
                    uuid: descriptor.uuid,
                    value: descriptor.value,
                });
                descriptors.push(descriptor_handle);
            }
            self.characteristics.insert(characteristic_handle, CharacteristicEntry {
                uuid: characteristic.uuid,
                properties: characteristic.properties,
                value: characteristic.value,
                descriptors,
            });
            characteristics.push(characteristic_handle);
        }

        let includes = service.includes
                              .into_iter()
                              .map(|included| self.add_service(included))
                              .collect();

        self.services.insert(service_handle, ServiceEntry {
            uuid: service.uuid,
            is_primary: service.is_primary,
            includes,
            characteristics,
        });
        service_handle
    }

    fn backend_service(&self, handle: ServiceHandle) -> Option<BackendService> {
        self.services.get(&handle).map(|service| BackendService {
            handle,
            uuid: service.uuid,
            is_primary: service.is_primary,
        })
    }

    fn advertisement(&self) -> AdvertisementData {
        AdvertisementData {
            local_name: self.name.clone(),
            service_uuids: self.advertised_services.clone(),
            ..Default::default()
        }
    }

    fn characteristic_by_uuid(&self, uuid: Uuid) -> Option<CharacteristicHandle> {
        self.characteristics
            .iter()
            .find(|(_, characteristic)| characteristic.uuid == uuid)
            .map(|(handle, _)| *handle)
    }
}

#[derive(Debug)]
struct FakeState {
    bus: Option<BackendBus>,
    adapter_state: AdapterState,
    writable_without_response: bool,
    scanning: bool,

    next_peripheral_handle: u32,
    peripherals: BTreeMap<PeripheralHandle, PeripheralEntry>,

    requests: Vec<FakeRequest>,

    // Scripted outcomes for the next requests
    held: bool,
    held_events: VecDeque<BackendEvent>,
    fail_next: VecDeque<GattError>,
    reject_next: usize,
}

impl FakeState {
    fn send(&self, event: BackendEvent) {
        trace!("Fake backend event: {:?}", event);
        match &self.bus {
            Some(bus) => {
                bus.send(event);
            }
            None => trace!("Fake backend not attached, dropping event"),
        }
    }

    // The completion of an accepted request, which may be held back by the
    // test driving the fake
    fn complete(&mut self, event: BackendEvent) {
        if self.held {
            self.held_events.push_back(event);
        } else {
            self.send(event);
        }
    }

    fn accept(&mut self, request: FakeRequest) -> Result<()> {
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return Err(Error::Other(anyhow!("Fake backend rejected {:?}", request)));
        }
        trace!("Fake backend request: {:?}", request);
        self.requests.push(request);
        Ok(())
    }

    fn scripted_error(&mut self) -> Option<GattError> {
        self.fail_next.pop_front()
    }

    fn peripheral(&mut self, handle: PeripheralHandle) -> Result<&mut PeripheralEntry> {
        self.peripherals
            .get_mut(&handle)
            .ok_or_else(|| Error::Other(anyhow!("Fake backend has no peripheral {:?}", handle)))
    }

    fn peripheral_by_address(&mut self, address: &str) -> Option<&mut PeripheralEntry> {
        let address: Address = address.parse().ok()?;
        self.peripherals
            .values_mut()
            .find(|peripheral| peripheral.address == address)
    }

    fn discovery_event(peripheral: &PeripheralEntry) -> BackendEvent {
        BackendEvent::PeripheralDiscovered {
            peripheral_handle: peripheral.handle,
            address: peripheral.address.clone(),
            rssi: peripheral.rssi,
            advertisement: peripheral.advertisement(),
            connectable: peripheral.connectable,
        }
    }
}

/// A scriptable, in-memory [`BackendSession`]
///
/// Cloning a `FakeSession` gives another handle to the same fake, so a test
/// can keep one handle to drive the fake after handing another to
/// [`crate::SessionConfig::start`].
///
/// By default every accepted request is completed immediately with a
/// successful event. `hold()` queues completions until the test releases
/// them, `fail_next()` completes requests with a GATT error and
/// `reject_next()` makes the next request fail submission.
#[derive(Clone, Debug)]
pub struct FakeSession {
    inner: Arc<Mutex<FakeState>>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                bus: None,
                adapter_state: AdapterState::PoweredOn,
                writable_without_response: true,
                scanning: false,
                next_peripheral_handle: 1,
                peripherals: BTreeMap::new(),
                requests: vec![],
                held: false,
                held_events: VecDeque::new(),
                fail_next: VecDeque::new(),
                reject_next: 0,
            })),
        }
    }

    // A panicking test thread shouldn't take every other user of the fake
    // down with it
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_peripheral(&self, peripheral: FakePeripheral) -> PeripheralHandle {
        let mut state = self.state();
        let handle = PeripheralHandle(state.next_peripheral_handle);
        state.next_peripheral_handle += 1;
        state.peripherals.insert(handle, PeripheralEntry::new(handle, peripheral));
        handle
    }

    pub fn peripheral_handle(&self, address: &str) -> Option<PeripheralHandle> {
        self.state().peripheral_by_address(address).map(|peripheral| peripheral.handle)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state().peripheral_by_address(address).map(|peripheral| peripheral.connected).unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Every request accepted so far
    pub fn requests(&self) -> Vec<FakeRequest> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Queue request completions until they're released
    pub fn hold(&self) {
        self.state().held = true;
    }

    /// Stop holding completions, delivering any that are queued
    pub fn unhold(&self) {
        let mut state = self.state();
        state.held = false;
        while let Some(event) = state.held_events.pop_front() {
            state.send(event);
        }
    }

    /// Delivers the oldest held completion. Returns false if none are held.
    pub fn release_next(&self) -> bool {
        let mut state = self.state();
        match state.held_events.pop_front() {
            Some(event) => {
                state.send(event);
                true
            }
            None => false,
        }
    }

    pub fn held_count(&self) -> usize {
        self.state().held_events.len()
    }

    /// Completes the next request with the given error
    pub fn fail_next(&self, error: GattError) {
        self.state().fail_next.push_back(error);
    }

    /// Makes the next request fail to be submitted at all
    pub fn reject_next(&self) {
        self.state().reject_next += 1;
    }

    /// Sends an arbitrary event, as if the backend reported it
    pub fn emit(&self, event: BackendEvent) {
        self.state().send(event);
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        let mut state = self.state();
        state.adapter_state = adapter_state;
        if adapter_state != AdapterState::PoweredOn {
            state.scanning = false;
            for peripheral in state.peripherals.values_mut() {
                peripheral.connected = false;
                peripheral.notifying.clear();
            }
        }
        state.send(BackendEvent::StateChanged { state: adapter_state });
    }

    /// Changes whether the link can take writes without response. Becoming
    /// writable reports `ReadyToWriteWithoutResponse` for every connected
    /// peripheral.
    pub fn set_writable_without_response(&self, writable: bool) {
        let mut state = self.state();
        let was_writable = std::mem::replace(&mut state.writable_without_response, writable);
        if writable && !was_writable {
            let connected: Vec<PeripheralHandle> = state.peripherals
                                                        .values()
                                                        .filter(|peripheral| peripheral.connected)
                                                        .map(|peripheral| peripheral.handle)
                                                        .collect();
            for peripheral_handle in connected {
                state.send(BackendEvent::ReadyToWriteWithoutResponse { peripheral_handle });
            }
        }
    }

    /// Reports an advertisement for a peripheral, as if it was seen again
    pub fn advertise(&self, address: &str) {
        let mut state = self.state();
        let event = state.peripheral_by_address(address).map(|peripheral| FakeState::discovery_event(peripheral));
        if let Some(event) = event {
            state.send(event);
        }
    }

    /// Sends a notification for the first characteristic with the given uuid
    ///
    /// The value is sent whether or not notifications are enabled.
    pub fn notify(&self, address: &str, characteristic: Uuid, value: &[u8]) {
        let mut state = self.state();
        let event = state.peripheral_by_address(address).and_then(|peripheral| {
            let characteristic_handle = peripheral.characteristic_by_uuid(characteristic)?;
            Some(BackendEvent::GattCharacteristicValue {
                peripheral_handle: peripheral.handle,
                characteristic_handle,
                value: value.to_vec(),
                error: None,
            })
        });
        if let Some(event) = event {
            state.send(event);
        }
    }

    pub fn is_notifying(&self, address: &str, characteristic: Uuid) -> bool {
        let mut state = self.state();
        state.peripheral_by_address(address)
             .and_then(|peripheral| {
                 let handle = peripheral.characteristic_by_uuid(characteristic)?;
                 Some(peripheral.notifying.contains(&handle))
             })
             .unwrap_or(false)
    }

    /// The peripheral drops the connection on its own
    pub fn disconnect_peripheral(&self, address: &str) {
        let mut state = self.state();
        let event = state.peripheral_by_address(address).map(|peripheral| {
            peripheral.connected = false;
            peripheral.notifying.clear();
            BackendEvent::PeripheralDisconnected {
                peripheral_handle: peripheral.handle,
                error: None,
            }
        });
        if let Some(event) = event {
            state.send(event);
        }
    }

    fn gatt_result<T>(state: &mut FakeState, value: T) -> (T, Option<GattError>) {
        (value, state.scripted_error())
    }
}

#[async_trait]
impl BackendSession for FakeSession {
    fn attach(&mut self, bus: BackendBus) -> Result<()> {
        let mut state = self.state();
        if state.bus.is_some() {
            return Err(Error::Other(anyhow!("Fake backend is already attached to a session")));
        }
        state.bus = Some(bus);
        let adapter_state = state.adapter_state;
        state.send(BackendEvent::StateChanged { state: adapter_state });
        Ok(())
    }

    fn start_scanning(&self, filter: &Filter, allow_duplicates: bool) -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::StartScanning { allow_duplicates })?;
        state.scanning = true;

        let events: Vec<BackendEvent> = state.peripherals
                                             .values()
                                             .filter(|peripheral| {
                                                 filter.service_uuids().is_empty() ||
                                                 peripheral.advertised_services
                                                           .iter()
                                                           .any(|uuid| filter.service_uuids().contains(uuid))
                                             })
                                             .map(FakeState::discovery_event)
                                             .collect();
        for event in events {
            state.send(event);
        }
        Ok(())
    }

    fn stop_scanning(&self) -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::StopScanning)?;
        state.scanning = false;
        Ok(())
    }

    async fn peripheral_connect(&self, peripheral_handle: PeripheralHandle) -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::Connect(peripheral_handle))?;
        let error = state.scripted_error();
        let peripheral = state.peripheral(peripheral_handle)?;

        let event = match error {
            None if peripheral.connectable => {
                peripheral.connected = true;
                BackendEvent::PeripheralConnected { peripheral_handle }
            }
            error => BackendEvent::PeripheralConnectionFailed {
                peripheral_handle,
                error: error.or_else(|| Some(GattError::GeneralFailure("not connectable".to_string()))),
            },
        };
        state.complete(event);
        Ok(())
    }

    async fn peripheral_cancel_connection(&self, peripheral_handle: PeripheralHandle) -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::CancelConnection(peripheral_handle))?;
        let peripheral = state.peripheral(peripheral_handle)?;
        peripheral.connected = false;
        peripheral.notifying.clear();
        state.send(BackendEvent::PeripheralDisconnected {
            peripheral_handle,
            error: None,
        });
        Ok(())
    }

    async fn peripheral_read_rssi(&self, peripheral_handle: PeripheralHandle) -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::ReadRssi(peripheral_handle))?;
        let rssi = state.peripheral(peripheral_handle)?.rssi;
        let (rssi, error) = Self::gatt_result(&mut state, rssi);
        state.complete(BackendEvent::RssiRead {
            peripheral_handle,
            rssi,
            error,
        });
        Ok(())
    }

    fn peripheral_can_write_without_response(&self, _peripheral_handle: PeripheralHandle) -> bool {
        self.state().writable_without_response
    }

    async fn peripheral_discover_gatt_services(&self, peripheral_handle: PeripheralHandle,
                                               _of_interest_hint: &[Uuid])
                                               -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::DiscoverServices(peripheral_handle))?;
        let peripheral = state.peripheral(peripheral_handle)?;
        let services: Vec<BackendService> = peripheral.primary_services
                                 .iter()
                                 .filter_map(|handle| peripheral.backend_service(*handle))
                                 .collect();
        let (services, error) = Self::gatt_result(&mut state, services);
        state.complete(BackendEvent::GattServicesDiscovered {
            peripheral_handle,
            services,
            error,
        });
        Ok(())
    }

    async fn gatt_service_discover_includes(&self, peripheral_handle: PeripheralHandle,
                                            service_handle: ServiceHandle,
                                            _of_interest_hint: &[Uuid])
                                            -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::DiscoverIncludes(peripheral_handle, service_handle))?;
        let peripheral = state.peripheral(peripheral_handle)?;
        let includes = peripheral.services
                                 .get(&service_handle)
                                 .map(|service| service.includes.clone())
                                 .ok_or_else(|| Error::Other(anyhow!("Fake backend has no service {:?}",
                                                                     service_handle)))?;
        let services: Vec<BackendService> = includes.iter()
                               .filter_map(|handle| peripheral.backend_service(*handle))
                               .collect();
        let (services, error) = Self::gatt_result(&mut state, services);
        state.complete(BackendEvent::GattIncludedServicesDiscovered {
            peripheral_handle,
            service_handle,
            services,
            error,
        });
        Ok(())
    }

    async fn gatt_service_discover_characteristics(&self, peripheral_handle: PeripheralHandle,
                                                   service_handle: ServiceHandle,
                                                   _of_interest_hint: &[Uuid])
                                                   -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::DiscoverCharacteristics(peripheral_handle, service_handle))?;
        let peripheral = state.peripheral(peripheral_handle)?;
        let service = peripheral.services
                                .get(&service_handle)
                                .ok_or_else(|| Error::Other(anyhow!("Fake backend has no service {:?}",
                                                                    service_handle)))?;
        let characteristics: Vec<BackendCharacteristic> = service.characteristics
                                     .iter()
                                     .filter_map(|handle| {
                                         peripheral.characteristics.get(handle).map(|characteristic| {
                                             BackendCharacteristic {
                                                 handle: *handle,
                                                 uuid: characteristic.uuid,
                                                 properties: characteristic.properties,
                                             }
                                         })
                                     })
                                     .collect();
        let (characteristics, error) = Self::gatt_result(&mut state, characteristics);
        state.complete(BackendEvent::GattCharacteristicsDiscovered {
            peripheral_handle,
            service_handle,
            characteristics,
            error,
        });
        Ok(())
    }

    async fn gatt_characteristic_discover_descriptors(&self, peripheral_handle: PeripheralHandle,
                                                      _service_handle: ServiceHandle,
                                                      characteristic_handle: CharacteristicHandle)
                                                      -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::DiscoverDescriptors(peripheral_handle, characteristic_handle))?;
        let peripheral = state.peripheral(peripheral_handle)?;
        let characteristic = peripheral.characteristics
                                       .get(&characteristic_handle)
                                       .ok_or_else(|| Error::Other(anyhow!("Fake backend has no characteristic {:?}",
                                                                           characteristic_handle)))?;
        let descriptors: Vec<BackendDescriptor> = characteristic.descriptors
                                        .iter()
                                        .filter_map(|handle| {
                                            peripheral.descriptors.get(handle).map(|descriptor| BackendDescriptor {
                                                handle: *handle,
                                                uuid: descriptor.uuid,
                                            })
                                        })
                                        .collect();
        let (descriptors, error) = Self::gatt_result(&mut state, descriptors);
        state.complete(BackendEvent::GattDescriptorsDiscovered {
            peripheral_handle,
            characteristic_handle,
            descriptors,
            error,
        });
        Ok(())
    }

    async fn gatt_characteristic_read(&self, peripheral_handle: PeripheralHandle,
                                      _service_handle: ServiceHandle,
                                      characteristic_handle: CharacteristicHandle)
                                      -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::ReadCharacteristic(peripheral_handle, characteristic_handle))?;
        let value = state.peripheral(peripheral_handle)?
                         .characteristics
                         .get(&characteristic_handle)
                         .map(|characteristic| characteristic.value.clone())
                         .ok_or_else(|| Error::Other(anyhow!("Fake backend has no characteristic {:?}",
                                                             characteristic_handle)))?;
        let (value, error) = Self::gatt_result(&mut state, value);
        state.complete(BackendEvent::GattCharacteristicValue {
            peripheral_handle,
            characteristic_handle,
            value: if error.is_some() { vec![] } else { value },
            error,
        });
        Ok(())
    }

    async fn gatt_characteristic_write(&self, peripheral_handle: PeripheralHandle,
                                       _service_handle: ServiceHandle,
                                       characteristic_handle: CharacteristicHandle,
                                       write_type: WriteType, data: &[u8])
                                       -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::WriteCharacteristic(peripheral_handle, characteristic_handle, write_type,
                                                      data.to_vec()))?;
        let error = match write_type {
            WriteType::WithResponse => state.scripted_error(),
            WriteType::WithoutResponse => None,
        };
        let characteristic = state.peripheral(peripheral_handle)?
                                  .characteristics
                                  .get_mut(&characteristic_handle)
                                  .ok_or_else(|| Error::Other(anyhow!("Fake backend has no characteristic {:?}",
                                                                      characteristic_handle)))?;
        if error.is_none() {
            characteristic.value = data.to_vec();
        }
        if write_type == WriteType::WithResponse {
            state.complete(BackendEvent::GattCharacteristicWritten {
                peripheral_handle,
                characteristic_handle,
                error,
            });
        }
        Ok(())
    }

    async fn gatt_characteristic_set_notify(&self, peripheral_handle: PeripheralHandle,
                                            _service_handle: ServiceHandle,
                                            characteristic_handle: CharacteristicHandle,
                                            enabled: bool)
                                            -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::SetNotify(peripheral_handle, characteristic_handle, enabled))?;
        let error = state.scripted_error();
        let peripheral = state.peripheral(peripheral_handle)?;
        if error.is_none() {
            if enabled {
                peripheral.notifying.insert(characteristic_handle);
            } else {
                peripheral.notifying.remove(&characteristic_handle);
            }
        }
        state.complete(BackendEvent::GattNotifyStateUpdated {
            peripheral_handle,
            characteristic_handle,
            enabled,
            error,
        });
        Ok(())
    }

    async fn gatt_descriptor_read(&self, peripheral_handle: PeripheralHandle,
                                  _service_handle: ServiceHandle,
                                  _characteristic_handle: CharacteristicHandle,
                                  descriptor_handle: DescriptorHandle)
                                  -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::ReadDescriptor(peripheral_handle, descriptor_handle))?;
        let value = state.peripheral(peripheral_handle)?
                         .descriptors
                         .get(&descriptor_handle)
                         .map(|descriptor| descriptor.value.clone())
                         .ok_or_else(|| Error::Other(anyhow!("Fake backend has no descriptor {:?}",
                                                             descriptor_handle)))?;
        let (value, error) = Self::gatt_result(&mut state, value);
        state.complete(BackendEvent::GattDescriptorValue {
            peripheral_handle,
            descriptor_handle,
            value: if error.is_some() { vec![] } else { value },
            error,
        });
        Ok(())
    }

    async fn gatt_descriptor_write(&self, peripheral_handle: PeripheralHandle,
                                   _service_handle: ServiceHandle,
                                   _characteristic_handle: CharacteristicHandle,
                                   descriptor_handle: DescriptorHandle,
                                   data: &[u8])
                                   -> Result<()> {
        let mut state = self.state();
        state.accept(FakeRequest::WriteDescriptor(peripheral_handle, descriptor_handle, data.to_vec()))?;
        let error = state.scripted_error();
        let descriptor = state.peripheral(peripheral_handle)?
                              .descriptors
                              .get_mut(&descriptor_handle)
                              .ok_or_else(|| Error::Other(anyhow!("Fake backend has no descriptor {:?}",
                                                                  descriptor_handle)))?;
        if error.is_none() {
            descriptor.value = data.to_vec();
        }
        state.complete(BackendEvent::GattDescriptorWritten {
            peripheral_handle,
            descriptor_handle,
            error,
        });
        Ok(())
    }
}
