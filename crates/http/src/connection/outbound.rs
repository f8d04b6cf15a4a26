//! Outbound write queue.
//!
//! Handlers may enqueue response bytes from any thread while the connection task
//! is in the middle of writing an earlier item. The queue only guards the list of
//! pending items and the `sending` flag; the item being written belongs to the
//! connection task alone and is advanced there as partial writes complete.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use tokio::sync::Notify;
use tracing::trace;

use crate::protocol::ConnectionError;

/// Called exactly once when an item was fully written, or with the error that
/// prevented it.
pub type Completion = Box<dyn FnOnce(Result<(), ConnectionError>) + Send>;

/// Upper bound of slices handed to a single vectored write.
const MAX_WRITE_SLICES: usize = 64;

/// One unit of outbound data: an ordered list of buffers and its completion.
///
/// The buffers own their storage, so it stays alive for as long as the write
/// is in progress and is released as soon as the item completes.
pub(crate) struct OutboundItem {
    buffers: VecDeque<Bytes>,
    completion: Option<Completion>,
}

impl OutboundItem {
    pub(crate) fn new<I>(buffers: I, completion: Option<Completion>) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let buffers = buffers.into_iter().filter(|bytes| !bytes.is_empty()).collect();
        Self { buffers, completion }
    }

    /// Returns true once every byte of this item has been written.
    pub(crate) fn is_done(&self) -> bool {
        self.buffers.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    /// The not yet written buffers, in write order.
    pub(crate) fn buffers(&self) -> &VecDeque<Bytes> {
        &self.buffers
    }

    /// Marks `written` bytes as sent.
    ///
    /// Fully written buffers are dropped, the first partially written one is advanced.
    pub(crate) fn advance(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };

            if written >= front.len() {
                written -= front.len();
                self.buffers.pop_front();
            } else {
                front.advance(written);
                written = 0;
            }
        }
    }

    /// Invokes the completion, releasing the buffers first.
    pub(crate) fn complete(mut self, result: Result<(), ConnectionError>) {
        self.buffers.clear();
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl std::fmt::Debug for OutboundItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundItem")
            .field("buffers", &self.buffers.len())
            .field("remaining", &self.remaining())
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    sending: bool,
    pending: VecDeque<OutboundItem>,
    closed: Option<ConnectionError>,
}

/// The part of the write path shared between the connection task and handlers.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an item for writing.
    ///
    /// If no write is in progress the connection task is woken to start this one.
    /// Once the connection has gone away the item completes immediately with the
    /// error the connection ended with.
    pub(crate) fn enqueue(&self, item: OutboundItem) {
        let rejected = {
            let mut state = self.lock();
            match &state.closed {
                Some(error) => Some((item, error.clone())),
                None => {
                    state.pending.push_back(item);
                    if !state.sending {
                        state.sending = true;
                        self.wakeup.notify_one();
                    }
                    None
                }
            }
        };

        if let Some((item, error)) = rejected {
            trace!(cause = %error, "connection gone, rejecting outbound item");
            item.complete(Err(error));
        }
    }

    /// Takes the next item to write.
    ///
    /// Returns `None` and clears the `sending` flag when nothing is pending, so the
    /// next [`OutboundQueue::enqueue`] wakes the connection again.
    pub(crate) fn next_item(&self) -> Option<OutboundItem> {
        let mut state = self.lock();
        if !state.sending {
            return None;
        }

        let item = state.pending.pop_front();
        if item.is_none() {
            state.sending = false;
        }
        item
    }

    /// Returns true while a write is in progress or pending.
    pub(crate) fn is_sending(&self) -> bool {
        self.lock().sending
    }

    /// Waits until an enqueue asks the connection to start writing.
    pub(crate) async fn notified(&self) {
        self.wakeup.notified().await;
    }

    /// Closes the queue and returns every pending item.
    ///
    /// Later enqueues complete immediately with `error`.
    pub(crate) fn close(&self, error: ConnectionError) -> Vec<OutboundItem> {
        let mut state = self.lock();
        state.sending = false;
        if state.closed.is_none() {
            state.closed = Some(error);
        }
        mem::take(&mut state.pending).into_iter().collect()
    }
}

/// Fills `slices` with `buffers`, returns how many were set.
fn io_slices<'a>(buffers: &'a VecDeque<Bytes>, slices: &mut [IoSlice<'a>]) -> usize {
    let mut count = 0;
    for (slot, bytes) in slices.iter_mut().zip(buffers.iter()) {
        *slot = IoSlice::new(bytes);
        count += 1;
    }
    count
}

/// Writes as much of `buffers` as the writer accepts in one call.
///
/// Takes the buffers of the item being written rather than the item itself, the
/// completion inside an item is not `Sync`.
pub(crate) async fn write_some<W>(writer: &mut W, buffers: Option<&VecDeque<Bytes>>) -> std::io::Result<usize>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let Some(buffers) = buffers else {
        return Ok(0);
    };

    let mut slices = [IoSlice::new(&[]); MAX_WRITE_SLICES];
    let count = io_slices(buffers, &mut slices);
    writer.write_vectored(&slices[..count]).await
}
