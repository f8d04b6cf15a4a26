use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, header};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tracing::{error, trace};

use crate::codec::HeaderEncoder;
use crate::connection::outbound::{Completion, OutboundItem, OutboundQueue};
use crate::protocol::{ConnectionError, ResponseHead};

/// Requests a handler posts back to its connection.
///
/// They are applied as ordinary steps of the connection task, never inline, and
/// carry the id of the request they belong to.
#[derive(Debug)]
pub(crate) enum Control {
    Close { request_id: u64, result: Result<(), ConnectionError> },
    Resume { request_id: u64 },
}

/// The handler's side of a connection.
///
/// Cheap to clone and usable from any thread. Sends are queued and written in
/// the order they were made; `close` and `resume` are applied by the connection
/// task at its next step.
#[derive(Debug, Clone)]
pub struct ReplyStream {
    queue: Arc<OutboundQueue>,
    control: mpsc::UnboundedSender<Control>,
    request_id: u64,
    keep_alive: bool,
}

impl ReplyStream {
    pub(crate) fn new(queue: Arc<OutboundQueue>, control: mpsc::UnboundedSender<Control>, request_id: u64, keep_alive: bool) -> Self {
        Self { queue, control, request_id, keep_alive }
    }

    /// Returns true if the connection will be reused after this request.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Queues the response head followed by the first part of the body.
    ///
    /// `Connection: keep-alive` is added when the request asked for a persistent
    /// connection. `completion` runs once both are written, or with the error that
    /// prevented it.
    pub fn send_headers<F>(&self, mut head: ResponseHead, body: Bytes, completion: F)
    where
        F: FnOnce(Result<(), ConnectionError>) + Send + 'static,
    {
        if self.keep_alive {
            head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        let mut encoded = BytesMut::new();
        if let Err(e) = HeaderEncoder.encode(head, &mut encoded) {
            error!(cause = %e, "can't encode response head");
            completion(Err(ConnectionError::handler(format!("can't encode response head: {e}"))));
            return;
        }

        let completion: Completion = Box::new(completion);
        self.queue.enqueue(OutboundItem::new([encoded.freeze(), body], Some(completion)));
    }

    /// Queues more body bytes.
    pub fn send_data<F>(&self, data: Bytes, completion: F)
    where
        F: FnOnce(Result<(), ConnectionError>) + Send + 'static,
    {
        let completion: Completion = Box::new(completion);
        self.queue.enqueue(OutboundItem::new([data], Some(completion)));
    }

    /// Signals that the response is complete (`Ok`) or that the connection must be
    /// torn down (`Err`).
    pub fn close(&self, result: Result<(), ConnectionError>) {
        self.post(Control::Close { request_id: self.request_id, result });
    }

    /// Signals that the handler can accept more body bytes.
    pub fn resume(&self) {
        self.post(Control::Resume { request_id: self.request_id });
    }

    fn post(&self, control: Control) {
        if let Err(e) = self.control.send(control) {
            trace!(control = ?e.0, "connection already gone, dropping control message");
        }
    }
}
