use std::time::Duration;

use ::uuid::Uuid;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::fake::{FakeCharacteristic, FakeDescriptor, FakePeripheral, FakeRequest, FakeService, FakeSession};
use crate::scan::Filter;
use crate::uuid::uuid_from_u16;
use crate::{AdapterState, AdvertisementData, BackendEvent, Characteristic, CharacteristicProperties, Error, Event,
            GattError, Peer, PeripheralHandle, Session, SessionConfig, WriteType};

const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);
const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
const BODY_SENSOR_LOCATION: Uuid = uuid_from_u16(0x2A38);
const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);
const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

const DEVICE: &str = "AA:BB:CC:DD:EE:01";
const OTHER_DEVICE: &str = "AA:BB:CC:DD:EE:02";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn peer(address: &str) -> Peer {
    Peer::new(address.parse().unwrap())
}

fn heart_rate_monitor(address: &str) -> FakePeripheral {
    let battery = FakeService::new(BATTERY_SERVICE)
        .secondary()
        .characteristic(FakeCharacteristic::new(BATTERY_LEVEL,
                                                CharacteristicProperties::READ |
                                                CharacteristicProperties::WRITE |
                                                CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
                        .value(&[0x64]));

    FakePeripheral::new(address)
        .name("Heart Rate Monitor")
        .advertise_service(HEART_RATE_SERVICE)
        .service(FakeService::new(HEART_RATE_SERVICE)
                 .characteristic(FakeCharacteristic::new(HEART_RATE_MEASUREMENT, CharacteristicProperties::NOTIFY)
                                 .descriptor(FakeDescriptor::new(CLIENT_CHARACTERISTIC_CONFIGURATION)
                                             .value(&[0x00, 0x00])))
                 .characteristic(FakeCharacteristic::new(BODY_SENSOR_LOCATION, CharacteristicProperties::READ)
                                 .value(&[0x01]))
                 .include(battery))
}

async fn start(fake: &FakeSession) -> Session {
    init_logging();
    SessionConfig::new().start(fake.clone()).await.unwrap()
}

// Scans until the given device is reported, then stops scanning
async fn discover(session: &Session, address: &str) -> Peer {
    let mut scan = session.start_scanning(Filter::new()).await.unwrap();
    loop {
        let event = scan.next().await.unwrap().unwrap();
        if event.peer.address().to_string() == address {
            return event.peer;
        }
    }
}

async fn connected_monitor() -> (FakeSession, Session, Peer) {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    let session = start(&fake).await;
    let peer = discover(&session, DEVICE).await;
    session.connect(&peer).await.unwrap();
    (fake, session, peer)
}

async fn characteristic(session: &Session, peer: &Peer, uuid: Uuid) -> Characteristic {
    let services = session.discover_services(peer, &[HEART_RATE_SERVICE]).await.unwrap();
    session.discover_characteristics(&services[0], &[uuid]).await.unwrap().remove(0)
}

async fn battery_level(session: &Session, peer: &Peer) -> Characteristic {
    let services = session.discover_services(peer, &[HEART_RATE_SERVICE]).await.unwrap();
    let included = session.discover_included_services(&services[0], &[BATTERY_SERVICE]).await.unwrap();
    session.discover_characteristics(&included[0], &[BATTERY_LEVEL]).await.unwrap().remove(0)
}

// Lets the IO task (and any spawned tasks) run until the condition holds
async fn until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

fn count_requests(fake: &FakeSession, filter: impl Fn(&FakeRequest) -> bool) -> usize {
    fake.requests().iter().filter(|request| filter(request)).count()
}

#[tokio::test]
async fn connect_discover_read_and_write() {
    let (fake, session, peer) = connected_monitor().await;
    assert!(fake.is_connected(DEVICE));

    let services = session.discover_services(&peer, &[]).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid(), HEART_RATE_SERVICE);
    assert!(services[0].is_primary());
    assert_eq!(services[0].peer(), &peer);

    let characteristics = session.discover_characteristics(&services[0], &[]).await.unwrap();
    assert_eq!(characteristics.len(), 2);
    let location = characteristics.iter().find(|c| c.uuid() == BODY_SENSOR_LOCATION).unwrap();
    assert_eq!(location.service(), services[0].attribute());
    assert_eq!(session.read_characteristic(location).await.unwrap(), vec![0x01]);

    let included = session.discover_included_services(&services[0], &[]).await.unwrap();
    assert_eq!(included.len(), 1);
    assert!(!included[0].is_primary());
    let level = session.discover_characteristics(&included[0], &[BATTERY_LEVEL]).await.unwrap().remove(0);
    session.write_characteristic(&level, &[0x32], WriteType::WithResponse).await.unwrap();
    assert_eq!(session.read_characteristic(&level).await.unwrap(), vec![0x32]);

    let measurement = characteristics.iter().find(|c| c.uuid() == HEART_RATE_MEASUREMENT).unwrap();
    assert!(measurement.can_subscribe());
    let descriptors = session.discover_descriptors(measurement).await.unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].uuid(), CLIENT_CHARACTERISTIC_CONFIGURATION);
    assert_eq!(descriptors[0].characteristic(), measurement.attribute());
    session.write_descriptor(&descriptors[0], &[0x01, 0x00]).await.unwrap();
    assert_eq!(session.read_descriptor(&descriptors[0]).await.unwrap(), vec![0x01, 0x00]);
}

#[tokio::test]
async fn discovery_filters_by_uuid() {
    let (_fake, session, peer) = connected_monitor().await;

    // The battery service is only reachable as an included service
    assert!(session.discover_services(&peer, &[BATTERY_SERVICE]).await.unwrap().is_empty());

    let services = session.discover_services(&peer, &[HEART_RATE_SERVICE, BATTERY_SERVICE]).await.unwrap();
    assert_eq!(services.len(), 1);
    let characteristics = session.discover_characteristics(&services[0], &[BODY_SENSOR_LOCATION]).await.unwrap();
    assert_eq!(characteristics.len(), 1);
    assert_eq!(characteristics[0].uuid(), BODY_SENSOR_LOCATION);
}

#[tokio::test]
async fn connect_when_connected_is_local() {
    let (fake, session, peer) = connected_monitor().await;
    session.connect(&peer).await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::Connect(_))), 1);
}

#[tokio::test]
async fn failed_connection() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE).not_connectable());
    let session = start(&fake).await;
    let mut events = Box::pin(session.events().unwrap());
    let peer = discover(&session, DEVICE).await;

    assert!(matches!(session.connect(&peer).await, Err(Error::BackendFailure(GattError::GeneralFailure(_)))));
    assert!(matches!(session.read_rssi(&peer).await, Err(Error::Disconnected)));

    loop {
        match events.next().await.unwrap() {
            Event::AdapterStateChanged { .. } => continue,
            Event::PeripheralFailedToConnect { peer: failed, .. } => {
                assert_eq!(failed, peer);
                break;
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn disconnect_fails_in_flight_read() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;

    fake.hold();
    let read = tokio::spawn({
        let session = session.clone();
        let location = location.clone();
        async move { session.read_characteristic(&location).await }
    });
    until(|| fake.held_count() == 1).await;

    fake.disconnect_peripheral(DEVICE);
    assert!(matches!(read.await.unwrap(), Err(Error::Disconnected)));

    // The late read response has nobody to go to
    fake.unhold();
    session.flush().await.unwrap();

    // Attributes don't survive the connection they were discovered on
    session.connect(&peer).await.unwrap();
    assert!(matches!(session.read_characteristic(&location).await, Err(Error::UnknownAttribute)));
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::ReadCharacteristic(..))), 1);

    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn disconnect_fails_every_pending_request() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    let worker = tokio::spawn({
        let session = session.clone();
        let peer = peer.clone();
        async move {
            futures::join!(session.read_characteristic(&location),
                           session.write_characteristic(&level, &[0x01], WriteType::WithResponse),
                           session.read_characteristic(&level),
                           session.read_rssi(&peer))
        }
    });
    // One GATT request and the signal strength read are in flight, the
    // others are queued behind the GATT request
    until(|| fake.held_count() == 2).await;

    session.disconnect(&peer).await.unwrap();
    assert!(!fake.is_connected(DEVICE));

    let (read, write, read_level, rssi) = worker.await.unwrap();
    assert!(matches!(read, Err(Error::Disconnected)));
    assert!(matches!(write, Err(Error::Disconnected)));
    assert!(matches!(read_level, Err(Error::Disconnected)));
    assert!(matches!(rssi, Err(Error::Disconnected)));

    // Queued requests never reached the backend
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::WriteCharacteristic(..))), 0);
    fake.unhold();
    session.flush().await.unwrap();
}

#[tokio::test]
async fn requests_are_serialized_per_peer() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.clear_requests();
    fake.hold();
    let worker = tokio::spawn({
        let session = session.clone();
        async move {
            futures::join!(session.write_characteristic(&level, &[0x01], WriteType::WithResponse),
                           session.read_characteristic(&location),
                           session.read_characteristic(&level))
        }
    });

    until(|| fake.held_count() == 1).await;
    session.flush().await.unwrap();
    assert!(matches!(fake.requests().as_slice(), [FakeRequest::WriteCharacteristic(..)]));

    assert!(fake.release_next());
    until(|| fake.requests().len() == 2).await;
    session.flush().await.unwrap();
    assert_eq!(fake.requests().len(), 2);

    assert!(fake.release_next());
    until(|| fake.requests().len() == 3).await;
    fake.unhold();

    let (write, read_location, read_level) = worker.await.unwrap();
    write.unwrap();
    assert_eq!(read_location.unwrap(), vec![0x01]);
    // Submission order is completion order
    assert_eq!(read_level.unwrap(), vec![0x01]);
    assert!(matches!(fake.requests().as_slice(),
                     [FakeRequest::WriteCharacteristic(..),
                      FakeRequest::ReadCharacteristic(..),
                      FakeRequest::ReadCharacteristic(..)]));
}

#[tokio::test]
async fn backend_errors() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;

    fake.fail_next(GattError::ReadNotPermitted);
    assert!(matches!(session.read_characteristic(&location).await,
                     Err(Error::BackendFailure(GattError::ReadNotPermitted))));

    // A request the backend won't even accept resolves straight away and
    // doesn't leave the peer busy
    fake.reject_next();
    assert!(matches!(session.read_characteristic(&location).await, Err(Error::Other(_))));
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn notifications() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;

    let mut notifications = session.subscribe(&measurement).await.unwrap();
    assert!(fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));
    assert_eq!(notifications.characteristic(), &measurement);

    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xAA]);
    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xBB]);
    assert_eq!(notifications.next().await.unwrap().unwrap(), vec![0xAA]);
    assert_eq!(notifications.next().await.unwrap().unwrap(), vec![0xBB]);

    drop(notifications);
    session.flush().await.unwrap();
    assert!(!fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);

    // Nobody is listening any more
    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xCC]);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
}

#[tokio::test]
async fn last_subscriber_disables_notifications() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;

    let first = session.subscribe(&measurement).await.unwrap();
    let mut second = session.subscribe(&measurement).await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, true))), 2);

    drop(first);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 0);

    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0x01]);
    assert_eq!(second.next().await.unwrap().unwrap(), vec![0x01]);

    drop(second);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
}

#[tokio::test]
async fn notifications_end_on_disconnect() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let mut notifications = session.subscribe(&measurement).await.unwrap();

    fake.disconnect_peripheral(DEVICE);
    assert!(matches!(notifications.next().await, Some(Err(Error::Disconnected))));
    assert!(notifications.next().await.is_none());

    // There's nothing left to disable
    drop(notifications);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 0);
}

#[tokio::test]
async fn disable_in_flight_during_disconnect() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let notifications = session.subscribe(&measurement).await.unwrap();

    fake.hold();
    drop(notifications);
    until(|| fake.held_count() == 1).await;
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);

    // The background disable fails with Disconnected, which is expected
    fake.disconnect_peripheral(DEVICE);
    fake.unhold();
    session.flush().await.unwrap();

    session.connect(&peer).await.unwrap();
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let _notifications = session.subscribe(&measurement).await.unwrap();
    assert!(fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));
}

#[tokio::test]
async fn resubscribing_as_last_subscriber_leaves_keeps_notifications() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let first = session.subscribe(&measurement).await.unwrap();

    fake.hold();
    let mut second = Box::pin(session.subscribe(&measurement));
    assert!(futures::poll!(second.as_mut()).is_pending());
    until(|| fake.held_count() == 1).await;

    // The only installed subscriber goes away while another one is being set up
    drop(first);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 0);

    fake.unhold();
    let mut second = second.await.unwrap();
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 0);
    assert!(fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));

    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xDD]);
    assert_eq!(second.next().await.unwrap().unwrap(), vec![0xDD]);

    drop(second);
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
}

#[tokio::test]
async fn aborted_subscribe_disables_notifications() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;

    fake.hold();
    let subscriber = tokio::spawn({
        let session = session.clone();
        let measurement = measurement.clone();
        async move { session.subscribe(&measurement).await.map(|_| ()) }
    });
    until(|| fake.held_count() == 1).await;
    subscriber.abort();
    assert!(subscriber.await.unwrap_err().is_cancelled());
    session.flush().await.unwrap();

    fake.unhold();
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
    assert!(!fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn subscribe_dropped_as_notifications_are_enabled() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;

    fake.hold();
    let mut subscribe = Box::pin(session.subscribe(&measurement));
    assert!(futures::poll!(subscribe.as_mut()).is_pending());
    until(|| fake.held_count() == 1).await;

    // The backend confirms before the IO task hears the caller is gone
    drop(subscribe);
    fake.unhold();
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
    assert!(!fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));

    let mut notifications = session.subscribe(&measurement).await.unwrap();
    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xEE]);
    assert_eq!(notifications.next().await.unwrap().unwrap(), vec![0xEE]);
}

#[tokio::test]
async fn notification_racing_unsubscribe_is_dropped() {
    let (fake, session, peer) = connected_monitor().await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let notifications = session.subscribe(&measurement).await.unwrap();

    // The value reaches the IO task before the stream's unsubscribe does
    drop(notifications);
    fake.notify(DEVICE, HEART_RATE_MEASUREMENT, &[0xCC]);
    session.flush().await.unwrap();

    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::SetNotify(_, _, false))), 1);
    assert!(!fake.is_notifying(DEVICE, HEART_RATE_MEASUREMENT));
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn scan_is_superseded_by_new_scan() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    let session = start(&fake).await;

    let mut first = session.start_scanning(Filter::new()).await.unwrap();
    assert!(first.next().await.unwrap().is_ok());

    let mut second = session.start_scanning(Filter::new()).await.unwrap();
    assert!(matches!(first.next().await, Some(Err(Error::Cancelled))));
    assert!(first.next().await.is_none());
    let event = second.next().await.unwrap().unwrap();
    assert_eq!(event.peer.address().to_string(), DEVICE);
    assert_eq!(event.name(), Some("Heart Rate Monitor"));

    // Dropping the old stream doesn't stop the new scan
    drop(first);
    session.flush().await.unwrap();
    assert!(fake.is_scanning());

    drop(second);
    session.flush().await.unwrap();
    assert!(!fake.is_scanning());

    // Stopping when not scanning is fine
    session.stop_scanning().await.unwrap();
}

#[tokio::test]
async fn requests_stop_scanning() {
    let (fake, session, peer) = connected_monitor().await;

    let mut scan = session.start_scanning(Filter::new()).await.unwrap();
    assert!(fake.is_scanning());
    assert_eq!(session.read_rssi(&peer).await.unwrap(), -60);
    assert!(!fake.is_scanning());

    assert!(matches!(scan.next().await, Some(Ok(_))));
    assert!(matches!(scan.next().await, Some(Err(Error::Cancelled))));
    assert!(scan.next().await.is_none());
}

#[tokio::test]
async fn scan_filter_and_duplicates() {
    init_logging();
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    fake.add_peripheral(FakePeripheral::new(OTHER_DEVICE).advertise_service(BATTERY_SERVICE));
    let session = SessionConfig::new().set_scan_allow_duplicates(true).start(fake.clone()).await.unwrap();

    let mut filter = Filter::new();
    filter.add_service(HEART_RATE_SERVICE);
    let mut scan = session.start_scanning(filter).await.unwrap();
    assert_eq!(scan.next().await.unwrap().unwrap().peer, peer(DEVICE));

    // Reports that slip past the backend's own filtering are dropped
    fake.emit(BackendEvent::PeripheralDiscovered {
        peripheral_handle: PeripheralHandle(99),
        address: OTHER_DEVICE.parse().unwrap(),
        rssi: -80,
        advertisement: AdvertisementData {
            service_uuids: vec![BATTERY_SERVICE],
            ..Default::default()
        },
        connectable: true,
    });
    fake.advertise(DEVICE);
    assert_eq!(scan.next().await.unwrap().unwrap().peer, peer(DEVICE));

    assert!(fake.requests().contains(&FakeRequest::StartScanning { allow_duplicates: true }));
}

#[tokio::test]
async fn new_scan_forgets_disconnected_peers() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    fake.add_peripheral(FakePeripheral::new(OTHER_DEVICE).advertise_service(BATTERY_SERVICE));
    let session = start(&fake).await;

    let device = discover(&session, DEVICE).await;
    session.connect(&device).await.unwrap();

    let mut filter = Filter::new();
    filter.add_service(HEART_RATE_SERVICE);
    let scan = session.start_scanning(filter).await.unwrap();
    drop(scan);

    // Not seen by the new scan
    assert!(matches!(session.connect(&peer(OTHER_DEVICE)).await, Err(Error::UnknownPeer)));
    // Connected peers survive
    assert_eq!(session.read_rssi(&device).await.unwrap(), -60);
}

#[tokio::test]
async fn validation_failures_never_reach_the_backend() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    let session = start(&fake).await;
    let device = discover(&session, DEVICE).await;
    session.flush().await.unwrap();
    fake.clear_requests();

    assert!(matches!(session.read_rssi(&device).await, Err(Error::Disconnected)));
    assert!(matches!(session.wait_writable_without_response(&device).await, Err(Error::Disconnected)));

    let stranger = peer("11:22:33:44:55:66");
    assert!(matches!(session.connect(&stranger).await, Err(Error::UnknownPeer)));
    assert!(matches!(session.discover_services(&stranger, &[]).await, Err(Error::UnknownPeer)));

    fake.set_adapter_state(AdapterState::PoweredOff);
    session.flush().await.unwrap();
    assert!(matches!(session.connect(&device).await, Err(Error::AdapterNotReady)));
    assert!(matches!(session.start_scanning(Filter::new()).await, Err(Error::AdapterNotReady)));

    assert!(fake.requests().is_empty());
}

#[tokio::test]
async fn attributes_are_scoped_to_their_peer() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    fake.add_peripheral(heart_rate_monitor(OTHER_DEVICE));
    let session = start(&fake).await;

    let mut scan = session.start_scanning(Filter::new()).await.unwrap();
    let first = scan.next().await.unwrap().unwrap().peer;
    let second = scan.next().await.unwrap().unwrap().peer;
    drop(scan);
    session.connect(&first).await.unwrap();
    session.connect(&second).await.unwrap();

    let location = characteristic(&session, &first, BODY_SENSOR_LOCATION).await;
    session.disconnect(&second).await.unwrap();
    // Disconnecting one peer leaves the other's attributes alone
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn write_without_response_completes_on_submission() {
    let (fake, session, peer) = connected_monitor().await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    session.write_characteristic(&level, &[0x07], WriteType::WithoutResponse).await.unwrap();
    assert_eq!(fake.held_count(), 0);

    fake.unhold();
    assert_eq!(session.read_characteristic(&level).await.unwrap(), vec![0x07]);

    fake.reject_next();
    assert!(session.write_characteristic(&level, &[0x08], WriteType::WithoutResponse).await.is_err());
}

#[tokio::test]
async fn wait_writable_without_response() {
    let (fake, session, peer) = connected_monitor().await;

    fake.set_writable_without_response(false);
    let mut waiter = Box::pin(session.wait_writable_without_response(&peer));
    assert!(futures::poll!(waiter.as_mut()).is_pending());
    session.flush().await.unwrap();
    assert!(futures::poll!(waiter.as_mut()).is_pending());

    fake.set_writable_without_response(true);
    waiter.await.unwrap();

    // Already writable
    session.wait_writable_without_response(&peer).await.unwrap();
}

#[tokio::test]
async fn rssi_reads_bypass_the_gatt_queue() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;

    fake.hold();
    let mut read = Box::pin(session.read_characteristic(&location));
    assert!(futures::poll!(read.as_mut()).is_pending());
    until(|| fake.held_count() == 1).await;

    let mut rssi = Box::pin(session.read_rssi(&peer));
    assert!(futures::poll!(rssi.as_mut()).is_pending());
    until(|| fake.held_count() == 2).await;

    fake.unhold();
    assert_eq!(read.await.unwrap(), vec![0x01]);
    assert_eq!(rssi.await.unwrap(), -60);
}

#[tokio::test]
async fn abandoned_queued_request_is_never_sent() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.clear_requests();
    fake.hold();
    let reader = tokio::spawn({
        let session = session.clone();
        let location = location.clone();
        async move { session.read_characteristic(&location).await }
    });
    until(|| fake.held_count() == 1).await;

    let mut queued = Box::pin(session.read_characteristic(&level));
    assert!(futures::poll!(queued.as_mut()).is_pending());
    drop(queued);
    session.flush().await.unwrap();

    fake.unhold();
    assert_eq!(reader.await.unwrap().unwrap(), vec![0x01]);
    session.flush().await.unwrap();
    assert_eq!(fake.requests().len(), 1);
}

#[tokio::test]
async fn aborted_request_swallows_its_late_response() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    let reader = tokio::spawn({
        let session = session.clone();
        let location = location.clone();
        async move { session.read_characteristic(&location).await }
    });
    until(|| fake.held_count() == 1).await;
    reader.abort();
    assert!(reader.await.unwrap_err().is_cancelled());

    // The peer stays busy until the backend answers the abandoned read, and
    // that answer mustn't be handed to the next request
    let mut next = Box::pin(session.read_characteristic(&level));
    assert!(futures::poll!(next.as_mut()).is_pending());
    session.flush().await.unwrap();
    assert_eq!(count_requests(&fake, |r| matches!(r, FakeRequest::ReadCharacteristic(..))), 1);

    fake.unhold();
    assert_eq!(next.await.unwrap(), vec![0x64]);
}

#[tokio::test]
async fn late_completion_after_reconnect_is_dropped() {
    let (fake, session, peer) = connected_monitor().await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    let write = tokio::spawn({
        let session = session.clone();
        let level = level.clone();
        async move { session.write_characteristic(&level, &[0x32], WriteType::WithResponse).await }
    });
    until(|| fake.held_count() == 1).await;
    session.disconnect(&peer).await.unwrap();
    assert!(matches!(write.await.unwrap(), Err(Error::Disconnected)));

    // The write's completion only turns up while we're connecting again
    let mut connect = Box::pin(session.connect(&peer));
    assert!(futures::poll!(connect.as_mut()).is_pending());
    until(|| fake.held_count() == 2).await;
    fake.unhold();
    connect.await.unwrap();
    session.flush().await.unwrap();

    let level = battery_level(&session, &peer).await;
    assert_eq!(session.read_characteristic(&level).await.unwrap(), vec![0x32]);

    // A completion nobody asked for at all is only logged
    let (peripheral_handle, characteristic_handle) = fake.requests()
                                                         .iter()
                                                         .find_map(|r| match r {
                                                             FakeRequest::WriteCharacteristic(p, c, ..) => Some((*p, *c)),
                                                             _ => None,
                                                         })
                                                         .unwrap();
    fake.emit(BackendEvent::GattCharacteristicWritten {
        peripheral_handle,
        characteristic_handle,
        error: None,
    });
    session.flush().await.unwrap();
    assert_eq!(session.read_characteristic(&level).await.unwrap(), vec![0x32]);
}

#[tokio::test(start_paused = true)]
async fn request_timeout() {
    init_logging();
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    let session = SessionConfig::new()
        .set_request_timeout(Some(Duration::from_secs(5)))
        .start(fake.clone())
        .await
        .unwrap();
    let peer = discover(&session, DEVICE).await;
    session.connect(&peer).await.unwrap();
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    assert!(matches!(session.read_characteristic(&location).await, Err(Error::Timeout)));

    let mut next = Box::pin(session.read_characteristic(&level));
    assert!(futures::poll!(next.as_mut()).is_pending());
    session.flush().await.unwrap();
    assert_eq!(fake.held_count(), 1);

    fake.unhold();
    assert_eq!(next.await.unwrap(), vec![0x64]);
}

#[tokio::test]
async fn adapter_power_loss() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let mut notifications = session.subscribe(&measurement).await.unwrap();

    fake.hold();
    let mut read = Box::pin(session.read_characteristic(&location));
    assert!(futures::poll!(read.as_mut()).is_pending());
    until(|| fake.held_count() == 1).await;
    let mut scan = session.start_scanning(Filter::new()).await.unwrap();

    fake.set_adapter_state(AdapterState::PoweredOff);
    assert!(matches!(read.await, Err(Error::AdapterNotReady)));
    assert!(matches!(notifications.next().await, Some(Err(Error::AdapterNotReady))));
    assert!(notifications.next().await.is_none());
    let last = loop {
        match scan.next().await {
            Some(Ok(_)) => continue,
            other => break other,
        }
    };
    assert!(matches!(last, Some(Err(Error::AdapterNotReady))));
    assert_eq!(session.adapter_state().await.unwrap(), AdapterState::PoweredOff);

    // Nothing is remembered across power cycles
    fake.unhold();
    fake.set_adapter_state(AdapterState::PoweredOn);
    session.flush().await.unwrap();
    assert!(matches!(session.connect(&peer).await, Err(Error::UnknownPeer)));
}

#[tokio::test]
async fn session_events() {
    let fake = FakeSession::new();
    fake.add_peripheral(heart_rate_monitor(DEVICE));
    let session = start(&fake).await;
    let mut events = Box::pin(session.events().unwrap());

    let peer = discover(&session, DEVICE).await;
    session.connect(&peer).await.unwrap();
    fake.disconnect_peripheral(DEVICE);
    session.flush().await.unwrap();
    fake.set_adapter_state(AdapterState::PoweredOff);

    let mut seen = vec![];
    while seen.len() < 3 {
        match events.next().await.unwrap() {
            Event::AdapterStateChanged { state: AdapterState::PoweredOn, .. } => {}
            event => seen.push(event),
        }
    }
    assert!(matches!(&seen[0], Event::PeripheralConnected { peer: p, .. } if *p == peer));
    assert!(matches!(&seen[1], Event::PeripheralDisconnected { peer: p, .. } if *p == peer));
    assert!(matches!(&seen[2], Event::AdapterStateChanged { state: AdapterState::PoweredOff, .. }));
}

#[tokio::test]
async fn unknown_backend_handles_are_ignored() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;

    fake.emit(BackendEvent::RssiRead {
        peripheral_handle: PeripheralHandle(42),
        rssi: -10,
        error: None,
    });
    fake.emit(BackendEvent::PeripheralDisconnected {
        peripheral_handle: PeripheralHandle(42),
        error: None,
    });
    session.flush().await.unwrap();
    assert_eq!(session.read_characteristic(&location).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn close_cancels_everything() {
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let measurement = characteristic(&session, &peer, HEART_RATE_MEASUREMENT).await;
    let mut notifications = session.subscribe(&measurement).await.unwrap();

    fake.hold();
    let mut read = Box::pin(session.read_characteristic(&location));
    assert!(futures::poll!(read.as_mut()).is_pending());
    until(|| fake.held_count() == 1).await;

    session.close().unwrap();
    assert!(matches!(read.await, Err(Error::Cancelled)));
    assert!(matches!(notifications.next().await, Some(Err(Error::Cancelled))));
    assert!(notifications.next().await.is_none());

    assert!(session.flush().await.is_err());
    assert!(session.connect(&peer).await.is_err());
}

#[tokio::test]
async fn every_request_resolves_exactly_once() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let (fake, session, peer) = connected_monitor().await;
    let location = characteristic(&session, &peer, BODY_SENSOR_LOCATION).await;
    let level = battery_level(&session, &peer).await;

    fake.hold();
    let mut tasks = vec![];
    for i in 0..40u8 {
        let session = session.clone();
        let peer = peer.clone();
        let location = location.clone();
        let level = level.clone();
        let kind = rng.gen_range(0..4);
        tasks.push(tokio::spawn(async move {
            match kind {
                0 => session.read_characteristic(&location).await.map(|_| ()),
                1 => session.write_characteristic(&level, &[i], WriteType::WithResponse).await,
                2 => session.read_rssi(&peer).await.map(|_| ()),
                _ => session.read_characteristic(&level).await.map(|_| ()),
            }
        }));
    }

    for _ in 0..30 {
        tokio::task::yield_now().await;
        match rng.gen_range(0..3) {
            0 => {
                fake.release_next();
            }
            1 => {
                let victim = rng.gen_range(0..tasks.len());
                tasks[victim].abort();
            }
            _ => session.flush().await.unwrap(),
        }
    }

    fake.disconnect_peripheral(DEVICE);
    fake.unhold();

    let mut resolved = 0;
    let mut aborted = 0;
    for task in tasks {
        match task.await {
            Ok(result) => {
                assert!(matches!(result, Ok(()) | Err(Error::Disconnected)), "unexpected {:?}", result);
                resolved += 1;
            }
            Err(err) => {
                assert!(err.is_cancelled());
                aborted += 1;
            }
        }
    }
    assert_eq!(resolved + aborted, 40);

    // The peer is usable again once reconnected
    session.flush().await.unwrap();
    session.connect(&peer).await.unwrap();
    assert_eq!(session.read_rssi(&peer).await.unwrap(), -60);
}
