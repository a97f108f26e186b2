//! Event-stream plumbing for the single operator console.
//!
//! The engine publishes `addTag`/`removeTag` messages to at most one
//! subscriber. Delivery is best-effort with a hard deadline; an operator
//! that stops reading loses events and starts over from a cleared
//! inventory when it reattaches.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::Stream;

use crate::reader::Reader;
use crate::tag::Tag;

/// How long a publish waits for the consumer before the message is dropped.
pub const PUBLISH_DEADLINE: Duration = Duration::from_millis(300);
/// How long a new consumer waits for the previous one to let go.
pub const SUBSCRIBE_WAIT: Duration = Duration::from_secs(2);

/// One server-sent event: the event name plus the JSON-serialized tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsMsg {
    pub event: &'static str,
    pub data: String,
}

impl EsMsg {
    pub fn tag(event: &'static str, tag: &Tag) -> EsMsg {
        EsMsg {
            event,
            data: serde_json::to_string(tag).unwrap(),
        }
    }
}

/// Another consumer already holds the event stream.
#[derive(Debug)]
pub struct StreamBusy;

impl fmt::Display for StreamBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event stream busy")
    }
}

impl std::error::Error for StreamBusy {}

/// The receiving half of the event bus. Dropping it detaches the sink and
/// releases the admission permit for the next consumer.
pub struct Subscription {
    rx: mpsc::Receiver<EsMsg>,
    id: u64,
    reader: Arc<Reader>,
    _permit: OwnedSemaphorePermit,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::Receiver<EsMsg>,
        id: u64,
        reader: Arc<Reader>,
        permit: OwnedSemaphorePermit,
    ) -> Subscription {
        Subscription {
            rx,
            id,
            reader,
            _permit: permit,
        }
    }
}

impl Stream for Subscription {
    type Item = EsMsg;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<EsMsg>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.reader.detach_sink(self.id);
    }
}
