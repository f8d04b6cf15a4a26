use std::cmp;
use std::io;
use std::mem;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec::stock_reply::{CONTINUE, stock_reply_bytes};
use crate::codec::{ParseStatus, RequestParser};
use crate::connection::outbound::{self, Completion, OutboundItem, OutboundQueue};
use crate::connection::reply_stream::{Control, ReplyStream};
use crate::handler::RequestHandler;
use crate::protocol::{ConnectionError, RequestHeader};
use crate::server::Server;

/// Where the read side of a connection is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    /// Waiting for, or in the middle of, a request head.
    Headers,
    /// Delivering the request body to the handler.
    Body,
    /// The request was read completely, the response is still being produced.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Shut the socket down once the outbound queue is empty.
    Graceful,
    /// Shut the socket down right away, queued data is dropped.
    Abort,
}

enum Event {
    Control(Control),
    WriteQueued,
    Written(io::Result<usize>),
    Read(io::Result<usize>),
}

/// Serves the HTTP/1.1 requests of one client socket.
///
/// The connection is a single task: socket completions, handler callbacks and the
/// `close`/`resume` requests posted by handlers all run as steps of [`Connection::run`],
/// one at a time. Only the outbound queue is shared with other threads.
///
/// A request is served in three read phases: its head is parsed, its body is offered
/// to the handler until `Content-Length` bytes were accepted, then the connection
/// waits for the handler to close its response. Only when both the body is drained
/// and the response closed is the connection reset for the next, possibly already
/// buffered, request.
pub struct Connection<R, W> {
    reader: R,
    writer: W,
    server: Arc<Server>,

    read_buf: BytesMut,
    read_buffer_size: usize,
    read_in_flight: bool,
    parser: RequestParser,
    phase: ReadPhase,
    response_closed_early: bool,
    response_pending: bool,
    unprocessed: Bytes,
    body_remaining: u64,
    keep_alive: bool,
    handler: Option<Box<dyn RequestHandler>>,
    // the attached handler already got its `on_close`
    close_notified: bool,
    request_id: u64,

    queue: Arc<OutboundQueue>,
    current: Option<OutboundItem>,

    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    shutdown: Option<Shutdown>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Registers a new connection with `server`.
    pub fn new(reader: R, writer: W, server: Arc<Server>) -> Self {
        server.counters().connection_opened();
        let read_buffer_size = server.config().read_buffer_size();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            reader,
            writer,
            server,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            read_buffer_size,
            read_in_flight: false,
            parser: RequestParser::new(),
            phase: ReadPhase::Headers,
            response_closed_early: false,
            response_pending: false,
            unprocessed: Bytes::new(),
            body_remaining: 0,
            keep_alive: false,
            handler: None,
            close_notified: false,
            request_id: 0,
            queue: Arc::new(OutboundQueue::new()),
            current: None,
            control_tx,
            control_rx,
            shutdown: None,
        }
    }

    /// Drives the connection until no read, write, handler or response is left.
    pub async fn run(mut self) {
        self.async_read();

        loop {
            if self.current.is_none() {
                self.start_next_write();
            }
            if self.is_finished() {
                break;
            }

            let event = self.next_event().await;
            self.dispatch(event);
        }

        if self.shutdown.is_some() {
            if let Err(e) = self.writer.shutdown().await {
                debug!(cause = %e, "socket shutdown failed");
            }
        }
        trace!(requests = self.request_id, "connection finished");
    }

    async fn next_event(&mut self) -> Event {
        let reading = self.read_in_flight && self.shutdown.is_none();
        let writing = self.current.is_some();

        tokio::select! {
            biased;
            Some(control) = self.control_rx.recv() => Event::Control(control),
            result = outbound::write_some(&mut self.writer, self.current.as_ref().map(OutboundItem::buffers)), if writing => Event::Written(result),
            () = self.queue.notified(), if !writing => Event::WriteQueued,
            result = self.reader.read_buf(&mut self.read_buf), if reading => Event::Read(result),
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Control(Control::Close { request_id, result }) => self.apply_close(request_id, result),
            Event::Control(Control::Resume { request_id }) => self.apply_resume(request_id),
            Event::WriteQueued => trace!("outbound data queued"),
            Event::Written(result) => self.on_write_complete(result),
            Event::Read(result) => self.on_read_complete(result),
        }
    }

    fn is_finished(&self) -> bool {
        let writes_idle = self.current.is_none() && !self.queue.is_sending();
        match self.shutdown {
            Some(Shutdown::Abort) => true,
            Some(Shutdown::Graceful) => writes_idle,
            None => writes_idle && !self.read_in_flight && self.handler.is_none() && !self.response_pending,
        }
    }

    /// Asks for more bytes from the socket, unless a read is already outstanding.
    fn async_read(&mut self) {
        if self.read_in_flight || self.shutdown.is_some() {
            return;
        }
        self.read_buf.reserve(self.read_buffer_size);
        self.read_in_flight = true;
    }

    fn on_read_complete(&mut self, result: io::Result<usize>) {
        self.read_in_flight = false;
        match result {
            Ok(0) => self.on_eof(),
            Ok(n) => {
                trace!(bytes = n, "read from socket");
                let data = self.read_buf.split().freeze();
                self.process(data);
            }
            Err(e) => {
                warn!(cause = %e, "read from socket failed");
                self.fail_read(ConnectionError::transport(e));
            }
        }
    }

    fn on_eof(&mut self) {
        if self.phase == ReadPhase::Body || self.parser.has_partial() {
            warn!(phase = ?self.phase, "peer closed the connection in the middle of a request");
            self.fail_read(ConnectionError::transport(io::Error::from(io::ErrorKind::UnexpectedEof)));
        } else {
            debug!("peer closed idle connection");
        }
    }

    fn fail_read(&mut self, error: ConnectionError) {
        self.response_pending = false;
        self.release_handler(Err(error));
    }

    /// Detaches the handler, telling it `result` unless it was already told how its request ended.
    fn release_handler(&mut self, result: Result<(), ConnectionError>) {
        if let Some(mut handler) = self.handler.take() {
            if !self.close_notified {
                handler.on_close(result);
            }
            self.server.counters().handler_detached();
        }
        self.close_notified = false;
    }

    /// Runs the read-side state machine over freshly available bytes.
    fn process(&mut self, mut data: Bytes) {
        loop {
            match self.phase {
                ReadPhase::Headers => match self.parser.parse(&data) {
                    ParseStatus::Incomplete => {
                        self.async_read();
                        return;
                    }
                    ParseStatus::Failed(e) => {
                        warn!(cause = %e, "malformed request");
                        self.reject(StatusCode::BAD_REQUEST);
                        return;
                    }
                    ParseStatus::Complete { request, consumed } => {
                        data.advance(consumed);
                        if !self.begin_request(request) {
                            return;
                        }
                    }
                },

                ReadPhase::Body => {
                    let avail = cmp::min(self.body_remaining, data.len() as u64) as usize;
                    let consumed = match &mut self.handler {
                        Some(handler) if avail > 0 => cmp::min(handler.on_data(&data[..avail]), avail),
                        // nobody listens anymore, the body is only drained off the wire
                        _ => avail,
                    };
                    self.body_remaining -= consumed as u64;
                    data.advance(consumed);

                    if consumed < avail {
                        trace!(offered = avail, consumed, "handler applied backpressure");
                        self.unprocessed = data;
                        return;
                    }

                    if self.body_remaining > 0 {
                        self.async_read();
                        return;
                    }

                    self.phase = ReadPhase::Drained;
                    self.unprocessed = data;
                    if let Some(handler) = &mut self.handler {
                        handler.on_close(Ok(()));
                        self.close_notified = true;
                    }

                    if !self.response_closed_early || !self.next_request() {
                        return;
                    }

                    data = mem::take(&mut self.unprocessed);
                    if data.is_empty() {
                        self.async_read();
                        return;
                    }
                }

                ReadPhase::Drained => {
                    // bytes of the next pipelined request wait for the current response
                    self.stash(data);
                    return;
                }
            }
        }
    }

    /// Sets up the connection for a freshly parsed request.
    ///
    /// Returns false when the request was rejected and processing must stop.
    fn begin_request(&mut self, request: RequestHeader) -> bool {
        let body_length = match request.content_length() {
            Ok(length) => length,
            Err(e) => {
                warn!(cause = %e, "can't frame request body");
                self.reject(StatusCode::BAD_REQUEST);
                return false;
            }
        };

        self.request_id += 1;
        self.body_remaining = body_length;
        self.keep_alive = request.is_keep_alive();
        self.response_pending = true;
        self.phase = ReadPhase::Body;

        let Some(factory) = self.server.handler_factory(request.uri().path()) else {
            info!(method = %request.method(), path = request.uri().path(), "no handler for request");
            if request.expects_continue() && body_length > 0 {
                // the client may hold the announced body back forever
                self.keep_alive = false;
                self.body_remaining = 0;
                self.phase = ReadPhase::Drained;
            }
            self.send_stock_reply(StatusCode::NOT_FOUND);
            return true;
        };

        debug!(method = %request.method(), path = request.uri().path(), body_length, keep_alive = self.keep_alive, "serving request");
        if request.expects_continue() && body_length > 0 {
            self.queue.enqueue(OutboundItem::new([Bytes::from_static(CONTINUE)], None));
        }

        self.server.counters().handler_attached();
        let mut handler = factory.create();
        handler.initialize(self.reply_stream());
        handler.on_headers(request);
        self.handler = Some(handler);
        self.close_notified = false;
        true
    }

    /// Answers a request whose framing is unknown, the connection closes afterwards.
    fn reject(&mut self, status: StatusCode) {
        self.request_id += 1;
        self.keep_alive = false;
        self.body_remaining = 0;
        self.response_pending = true;
        self.phase = ReadPhase::Drained;
        self.unprocessed = Bytes::new();
        self.send_stock_reply(status);
    }

    fn send_stock_reply(&mut self, status: StatusCode) {
        let control = self.control_tx.clone();
        let request_id = self.request_id;
        let completion: Completion = Box::new(move |result| {
            if control.send(Control::Close { request_id, result }).is_err() {
                trace!("connection gone before stock reply completed");
            }
        });

        let bytes = stock_reply_bytes(status, self.keep_alive);
        self.queue.enqueue(OutboundItem::new([bytes], Some(completion)));
    }

    fn reply_stream(&self) -> ReplyStream {
        ReplyStream::new(Arc::clone(&self.queue), self.control_tx.clone(), self.request_id, self.keep_alive)
    }

    fn apply_close(&mut self, request_id: u64, result: Result<(), ConnectionError>) {
        if self.shutdown.is_some() || request_id != self.request_id || !self.response_pending {
            trace!(request_id, current = self.request_id, "ignoring stale close");
            return;
        }

        self.response_pending = false;
        self.detach_handler();

        match result {
            Err(e) => {
                warn!(cause = %e, "response closed with error, dropping connection");
                self.abort(&e);
            }
            Ok(()) if self.phase != ReadPhase::Drained => {
                debug!(body_remaining = self.body_remaining, "response finished before the request body, draining");
                self.response_closed_early = true;
                self.resume();
            }
            Ok(()) => {
                if self.next_request() {
                    self.resume();
                }
            }
        }
    }

    fn apply_resume(&mut self, request_id: u64) {
        if self.shutdown.is_some() || request_id != self.request_id || self.phase != ReadPhase::Body {
            trace!(request_id, current = self.request_id, phase = ?self.phase, "ignoring stale resume");
            return;
        }
        self.resume();
    }

    /// Continues with buffered bytes if there are any, otherwise reads more.
    fn resume(&mut self) {
        let data = mem::take(&mut self.unprocessed);
        if data.is_empty() {
            self.async_read();
        } else {
            self.process(data);
        }
    }

    /// Prepares for the next request once the current one is fully done.
    ///
    /// Returns false when the connection is not reused and shuts down instead.
    fn next_request(&mut self) -> bool {
        if !self.keep_alive {
            debug!("request done, closing connection");
            self.shutdown = Some(Shutdown::Graceful);
            return false;
        }

        trace!(buffered = self.unprocessed.len(), "request done, waiting for the next one");
        self.phase = ReadPhase::Headers;
        self.parser.reset();
        self.response_closed_early = false;
        self.body_remaining = 0;
        self.detach_handler();
        true
    }

    /// Drops the handler without a callback, it closed its response itself.
    fn detach_handler(&mut self) {
        if self.handler.take().is_some() {
            self.server.counters().handler_detached();
        }
        self.close_notified = false;
    }

    fn stash(&mut self, data: Bytes) {
        if self.unprocessed.is_empty() {
            self.unprocessed = data;
        } else if !data.is_empty() {
            let mut joined = BytesMut::with_capacity(self.unprocessed.len() + data.len());
            joined.extend_from_slice(&self.unprocessed);
            joined.extend_from_slice(&data);
            self.unprocessed = joined.freeze();
        }
    }

    fn start_next_write(&mut self) {
        while self.current.is_none() {
            let Some(item) = self.queue.next_item() else {
                break;
            };

            if item.is_done() {
                item.complete(Ok(()));
            } else {
                self.current = Some(item);
            }
        }
    }

    fn on_write_complete(&mut self, result: io::Result<usize>) {
        let written = match result {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            other => other,
        };

        match written {
            Ok(n) => {
                let Some(item) = &mut self.current else {
                    return;
                };
                item.advance(n);
                trace!(bytes = n, remaining = item.remaining(), "wrote to socket");

                if item.is_done() {
                    if let Some(item) = self.current.take() {
                        item.complete(Ok(()));
                    }
                    self.start_next_write();
                }
            }
            Err(e) => {
                warn!(cause = %e, "write to socket failed");
                let error = ConnectionError::transport(e);
                self.abort(&error);
                self.response_pending = false;
                self.release_handler(Err(error));
            }
        }
    }

    /// Fails every queued write with `error` and stops the connection.
    fn abort(&mut self, error: &ConnectionError) {
        self.shutdown = Some(Shutdown::Abort);
        self.read_in_flight = false;

        let mut items: Vec<OutboundItem> = self.current.take().into_iter().collect();
        items.extend(self.queue.close(error.clone()));
        for item in items {
            item.complete(Err(error.clone()));
        }
    }
}

impl<R, W> Drop for Connection<R, W> {
    fn drop(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            if !self.close_notified {
                handler.on_close(Ok(()));
            }
            self.server.counters().handler_detached();
        }

        let mut items: Vec<OutboundItem> = self.current.take().into_iter().collect();
        items.extend(self.queue.close(ConnectionError::Closed));
        for item in items {
            item.complete(Err(ConnectionError::Closed));
        }

        self.server.counters().connection_closed();
    }
}

impl<R, W> std::fmt::Debug for Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .field("request_id", &self.request_id)
            .field("body_remaining", &self.body_remaining)
            .field("keep_alive", &self.keep_alive)
            .field("read_in_flight", &self.read_in_flight)
            .field("unprocessed", &self.unprocessed.len())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}
