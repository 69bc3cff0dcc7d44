use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::io::IoCmd;
use crate::{AttributeRef, Characteristic, Error, Result};

/// The IO task's end of a [`Notifications`] stream
pub(crate) struct NotificationSink {
    id: u64,
    attribute: AttributeRef,
    tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

impl NotificationSink {
    pub(crate) fn new(id: u64, attribute: AttributeRef, tx: mpsc::UnboundedSender<Result<Vec<u8>>>) -> Self {
        Self { id, attribute, tx }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns false if the consumer has already gone away
    pub(crate) fn deliver(&self, value: &[u8]) -> bool {
        self.tx.send(Ok(value.to_vec())).is_ok()
    }

    /// Terminates the stream with a final error
    pub(crate) fn close(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NotificationSink")
            .field("id", &self.id)
            .field("attribute", &self.attribute)
            .finish()
    }
}

/// A stream of values notified (or indicated) by a characteristic
///
/// Created by [`crate::Session::subscribe`], which only returns once the
/// peripheral has confirmed notifications are enabled. The stream doesn't end
/// by itself: if the peripheral disconnects it yields a final
/// `Err(Error::Disconnected)` and then ends.
///
/// Dropping the stream unsubscribes. Notifications are disabled on the
/// peripheral in the background once the last subscriber for the
/// characteristic has gone; failures at that point are only logged.
pub struct Notifications {
    characteristic: Characteristic,
    sink_id: u64,
    values: UnboundedReceiverStream<Result<Vec<u8>>>,
    io_bus: mpsc::UnboundedSender<IoCmd>,
}

impl Notifications {
    pub(crate) fn new(characteristic: Characteristic, sink_id: u64,
                      values: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
                      io_bus: mpsc::UnboundedSender<IoCmd>) -> Self {
        Self {
            characteristic,
            sink_id,
            values: UnboundedReceiverStream::new(values),
            io_bus,
        }
    }

    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }
}

impl Stream for Notifications {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.values.poll_next_unpin(cx)
    }
}

impl Drop for Notifications {
    fn drop(&mut self) {
        // If the IO task has already exited there's nothing left to clean up
        let _ = self.io_bus.send(IoCmd::Unsubscribe {
            attribute: self.characteristic.attribute().clone(),
            sink_id: self.sink_id,
        });
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("characteristic", &self.characteristic)
            .field("sink_id", &self.sink_id)
            .finish()
    }
}
