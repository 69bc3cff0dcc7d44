use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::io::IoCmd;
use crate::{AdvertisementData, DiscoveryEvent, Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub(crate) service_uuids: HashSet<Uuid>,
}

impl Filter {
    pub fn new() -> Self {
        Self {
            service_uuids: HashSet::new(),
        }
    }

    /// Only report devices advertising the given service. Adding several
    /// services reports devices advertising any of them.
    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);

        self
    }

    pub fn service_uuids(&self) -> &HashSet<Uuid> {
        &self.service_uuids
    }

    // Backends are expected to filter by service themselves, but not all of
    // them can, so advertisements that do list services are re-checked here.
    // Reports without any service information (e.g. a scan response on its
    // own) are let through.
    pub(crate) fn matches(&self, advertisement: &AdvertisementData) -> bool {
        if self.service_uuids.is_empty() {
            return true;
        }
        if advertisement.service_uuids.is_empty() && advertisement.service_data.is_empty() {
            return true;
        }
        self.service_uuids
            .iter()
            .any(|uuid| advertisement.advertises_service(uuid))
    }
}

/// The IO task's state for the one active scan
pub(crate) struct ScanSession {
    generation: u64,
    filter: Filter,
    sink: mpsc::UnboundedSender<Result<DiscoveryEvent>>,
}

impl ScanSession {
    pub(crate) fn new(generation: u64, filter: Filter, sink: mpsc::UnboundedSender<Result<DiscoveryEvent>>) -> Self {
        Self { generation, filter, sink }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Returns false if the consumer has already gone away
    pub(crate) fn emit(&self, event: DiscoveryEvent) -> bool {
        self.sink.send(Ok(event)).is_ok()
    }

    pub(crate) fn finish(self, error: Error) {
        let _ = self.sink.send(Err(error));
    }
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("generation", &self.generation)
            .field("filter", &self.filter)
            .finish()
    }
}

/// A live stream of discovered devices
///
/// Created by [`crate::Session::start_scanning`]. Only one scan can be
/// active at a time: the stream yields a final `Err(Error::Cancelled)` and
/// ends when a new scan starts, when a request that needs the radio stops
/// the scan, or when the session closes.
///
/// Dropping the stream stops scanning.
pub struct Scan {
    generation: u64,
    events: UnboundedReceiverStream<Result<DiscoveryEvent>>,
    io_bus: mpsc::UnboundedSender<IoCmd>,
}

impl Scan {
    pub(crate) fn new(generation: u64, events: mpsc::UnboundedReceiver<Result<DiscoveryEvent>>,
                      io_bus: mpsc::UnboundedSender<IoCmd>) -> Self {
        Self {
            generation,
            events: UnboundedReceiverStream::new(events),
            io_bus,
        }
    }
}

impl Stream for Scan {
    type Item = Result<DiscoveryEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        // Only stops the scan if it's still ours
        let _ = self.io_bus.send(IoCmd::StopScanning {
            generation: Some(self.generation),
        });
    }
}

impl fmt::Debug for Scan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scan")
            .field("generation", &self.generation)
            .finish()
    }
}
