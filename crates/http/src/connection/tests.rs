use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use http::{Response, StatusCode};
use indoc::indoc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::connection::ReplyStream;
use crate::handler::{MockHandlerFactory, RequestHandler, make_factory};
use crate::protocol::{ConnectionError, RequestHeader};
use crate::server::Server;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(50);

/// Reader fed from the test, one chunk per socket read.
struct ScriptedReader {
    chunks: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    leftover: Bytes,
    delivered: Arc<AtomicUsize>,
}

impl ScriptedReader {
    fn copy_out(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.leftover.len());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.advance(n);
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            self.copy_out(buf);
            return Poll::Ready(Ok(()));
        }

        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                self.leftover = chunk;
                self.copy_out(buf);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
            // sender dropped: end of stream
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    written: Vec<u8>,
    max_chunk: Option<usize>,
    fail: Option<io::ErrorKind>,
    shutdown: bool,
}

#[derive(Clone, Default)]
struct RecordingWriter {
    state: Arc<Mutex<WriterState>>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.fail {
            return Poll::Ready(Err(io::Error::from(kind)));
        }
        let n = state.max_chunk.map_or(buf.len(), |max| max.min(buf.len()));
        state.written.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.lock().unwrap().shutdown = true;
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug)]
enum Seen {
    Headers { request: RequestHeader, reply: ReplyStream },
    Data { offered: Vec<u8>, accepted: usize },
    Close(Result<(), ConnectionError>),
}

/// Handler that reports every callback and accepts at most `budget` body bytes.
struct Recorder {
    events: mpsc::UnboundedSender<Seen>,
    budget: Arc<AtomicUsize>,
    reply: Option<ReplyStream>,
}

impl RequestHandler for Recorder {
    fn initialize(&mut self, reply: ReplyStream) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, request: RequestHeader) {
        let reply = self.reply.clone().expect("initialized before headers");
        self.events.send(Seen::Headers { request, reply }).unwrap();
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.budget.load(Ordering::SeqCst));
        self.budget.fetch_sub(accepted, Ordering::SeqCst);
        self.events.send(Seen::Data { offered: data.to_vec(), accepted }).unwrap();
        accepted
    }

    fn on_close(&mut self, result: Result<(), ConnectionError>) {
        self.events.send(Seen::Close(result)).unwrap();
    }
}

struct Harness {
    input: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    delivered: Arc<AtomicUsize>,
    writer: Arc<Mutex<WriterState>>,
    events: mpsc::UnboundedReceiver<Seen>,
    budget: Arc<AtomicUsize>,
    server: Arc<Server>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(|writer| writer)
    }

    fn start_with(setup: impl FnOnce(WriterState) -> WriterState) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let budget = Arc::new(AtomicUsize::new(usize::MAX));

        let factory_budget = Arc::clone(&budget);
        let factory = make_factory(move || Recorder { events: events_tx.clone(), budget: Arc::clone(&factory_budget), reply: None });
        let server = Arc::new(Server::builder().route("/upload", factory).build().unwrap());

        let (input, chunks) = mpsc::unbounded_channel();
        let delivered = Arc::new(AtomicUsize::new(0));
        let reader = ScriptedReader { chunks, leftover: Bytes::new(), delivered: Arc::clone(&delivered) };
        let writer = RecordingWriter { state: Arc::new(Mutex::new(setup(WriterState::default()))) };
        let writer_state = Arc::clone(&writer.state);

        let task = tokio::spawn(Arc::clone(&server).serve_connection(reader, writer));

        Self { input: Some(input), delivered, writer: writer_state, events, budget, server, task }
    }

    fn send(&self, data: &str) {
        self.input.as_ref().unwrap().send(Ok(Bytes::copy_from_slice(data.as_bytes()))).unwrap();
    }

    fn fail_read(&self, kind: io::ErrorKind) {
        self.input.as_ref().unwrap().send(Err(io::Error::from(kind))).unwrap();
    }

    fn close_input(&mut self) {
        self.input = None;
    }

    fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    async fn next(&mut self) -> Seen {
        timeout(WAIT, self.events.recv()).await.expect("handler event").expect("handler events open")
    }

    async fn headers(&mut self) -> (RequestHeader, ReplyStream) {
        match self.next().await {
            Seen::Headers { request, reply } => (request, reply),
            other => panic!("expected headers, got {other:?}"),
        }
    }

    async fn data(&mut self) -> (Vec<u8>, usize) {
        match self.next().await {
            Seen::Data { offered, accepted } => (offered, accepted),
            other => panic!("expected data, got {other:?}"),
        }
    }

    async fn closed(&mut self) -> Result<(), ConnectionError> {
        match self.next().await {
            Seen::Close(result) => result,
            other => panic!("expected close, got {other:?}"),
        }
    }

    async fn quiet(&mut self) {
        if let Ok(event) = timeout(QUIET, self.events.recv()).await {
            panic!("unexpected handler event {event:?}");
        }
    }

    fn written(&self) -> String {
        String::from_utf8(self.writer.lock().unwrap().written.clone()).unwrap()
    }

    async fn wait_written(&self, expected: &str) {
        let waited = timeout(WAIT, async {
            while self.written() != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "written {:?}, expected {:?}", self.written(), expected);
    }

    fn is_shut_down(&self) -> bool {
        self.writer.lock().unwrap().shutdown
    }

    async fn finished(self) -> Arc<Server> {
        timeout(WAIT, self.task).await.expect("connection finished").unwrap();
        self.server
    }
}

fn respond(reply: &ReplyStream, body: &'static str) {
    let head = Response::builder().status(StatusCode::OK).header("content-length", body.len()).body(()).unwrap();
    let closer = reply.clone();
    reply.send_headers(head, Bytes::from_static(body.as_bytes()), move |result| closer.close(result));
}

const OK_KEEP_ALIVE: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: keep-alive\r\n\r\nok";
const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n";
const NOT_FOUND_CLOSE: &str = "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

#[tokio::test]
async fn bodyless_request_closes_right_after_headers() {
    let mut harness = Harness::start();
    harness.send("GET /upload HTTP/1.1\r\nHost: h\r\n\r\n");

    let (request, reply) = harness.headers().await;
    assert_eq!(request.uri().path(), "/upload");
    assert!(reply.is_keep_alive());
    assert!(harness.closed().await.is_ok());
    assert_eq!(harness.server.counters().connections_active(), 1);

    respond(&reply, "ok");
    harness.wait_written(OK_KEEP_ALIVE).await;
    harness.quiet().await;

    harness.close_input();
    let server = harness.finished().await;
    assert_eq!(server.counters().connections_active(), 0);
    assert_eq!(server.counters().connections_total(), 0);
}

#[tokio::test]
async fn unknown_path_gets_not_found_and_keeps_connection() {
    let mut harness = Harness::start();
    harness.send("GET /missing HTTP/1.1\r\nHost: h\r\n\r\n");
    harness.wait_written(NOT_FOUND).await;
    assert!(!harness.is_shut_down());

    harness.send("GET /upload HTTP/1.1\r\nHost: h\r\n\r\n");
    let (request, _reply) = harness.headers().await;
    assert_eq!(request.uri().path(), "/upload");
}

#[tokio::test]
async fn unknown_path_without_keep_alive_shuts_down() {
    let harness = Harness::start();
    harness.send("GET /missing HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");

    harness.wait_written(NOT_FOUND_CLOSE).await;
    let writer = Arc::clone(&harness.writer);
    let server = harness.finished().await;

    assert!(writer.lock().unwrap().shutdown);
    assert_eq!(server.counters().connections_total(), 0);
}

#[tokio::test]
async fn unknown_path_body_is_discarded() {
    let mut harness = Harness::start();
    harness.send("POST /missing HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
    harness.send("lo");
    harness.send("GET /upload HTTP/1.1\r\n\r\n");

    let (request, _reply) = harness.headers().await;
    assert_eq!(request.uri().path(), "/upload");
    assert_eq!(harness.written(), NOT_FOUND);
}

#[tokio::test]
async fn body_in_two_reads() {
    let mut harness = Harness::start();
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
    harness.headers().await;

    harness.send("abcd");
    assert_eq!(harness.data().await, (b"abcd".to_vec(), 4));
    harness.send("efghij");
    assert_eq!(harness.data().await, (b"efghij".to_vec(), 6));
    assert!(harness.closed().await.is_ok());
    harness.quiet().await;
}

#[tokio::test]
async fn backpressure_holds_reads_until_resume() {
    let mut harness = Harness::start();
    harness.budget.store(2, Ordering::SeqCst);
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nabcd");

    let (_request, reply) = harness.headers().await;
    assert_eq!(harness.data().await, (b"abcd".to_vec(), 2));

    harness.send("efghij");
    harness.quiet().await;
    assert_eq!(harness.delivered(), 1);

    harness.budget.store(usize::MAX, Ordering::SeqCst);
    reply.resume();
    assert_eq!(harness.data().await, (b"cd".to_vec(), 2));
    assert_eq!(harness.data().await, (b"efghij".to_vec(), 6));
    assert_eq!(harness.delivered(), 2);
    assert!(harness.closed().await.is_ok());
}

#[tokio::test]
async fn head_split_byte_by_byte() {
    let mut harness = Harness::start();
    let request = indoc! {"
        POST /upload HTTP/1.1
        Host: h
        Content-Length: 2

        "};
    for i in 0..request.len() {
        harness.send(&request[i..=i]);
    }
    harness.send("xy");

    let (request, _reply) = harness.headers().await;
    assert_eq!(request.content_length().unwrap(), 2);
    assert_eq!(harness.data().await, (b"xy".to_vec(), 2));
    assert!(harness.closed().await.is_ok());
}

#[tokio::test]
async fn pipelined_requests_wait_for_the_response() {
    let mut harness = Harness::start();
    harness.send("GET /upload?n=1 HTTP/1.1\r\n\r\nGET /upload?n=2 HTTP/1.1\r\n\r\n");

    let (first, reply) = harness.headers().await;
    assert_eq!(first.uri().query(), Some("n=1"));
    assert!(harness.closed().await.is_ok());
    harness.quiet().await;

    respond(&reply, "ok");
    let (second, reply) = harness.headers().await;
    assert_eq!(second.uri().query(), Some("n=2"));
    assert!(harness.closed().await.is_ok());

    respond(&reply, "ok");
    harness.wait_written(&OK_KEEP_ALIVE.repeat(2)).await;
    assert_eq!(harness.delivered(), 1);
}

#[tokio::test]
async fn early_response_drains_the_body() {
    let mut harness = Harness::start();
    harness.budget.store(0, Ordering::SeqCst);
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc");

    let (_request, reply) = harness.headers().await;
    assert_eq!(harness.data().await, (b"abc".to_vec(), 0));

    respond(&reply, "ok");
    harness.wait_written(OK_KEEP_ALIVE).await;

    // the rest of the body is read and dropped without the handler
    harness.send("def");
    harness.send("GET /upload HTTP/1.1\r\n\r\n");
    let (next, _reply) = harness.headers().await;
    assert_eq!(next.method(), http::Method::GET);
    assert_eq!(harness.server.counters().connections_active(), 1);
}

#[tokio::test]
async fn early_response_without_keep_alive_drains_then_shuts_down() {
    let mut harness = Harness::start();
    harness.budget.store(0, Ordering::SeqCst);
    harness.send("POST /upload HTTP/1.1\r\nConnection: close\r\nContent-Length: 6\r\n\r\nabc");

    let (_request, reply) = harness.headers().await;
    assert!(!reply.is_keep_alive());
    assert_eq!(harness.data().await, (b"abc".to_vec(), 0));

    respond(&reply, "ok");
    harness.wait_written("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
    harness.quiet().await;
    assert!(!harness.is_shut_down());

    harness.send("def");
    let writer = Arc::clone(&harness.writer);
    let server = harness.finished().await;

    assert!(writer.lock().unwrap().shutdown);
    assert_eq!(server.counters().connections_total(), 0);
}

#[tokio::test]
async fn early_response_then_pipelined_request_in_same_read() {
    let mut harness = Harness::start();
    harness.budget.store(0, Ordering::SeqCst);
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");

    let (_request, reply) = harness.headers().await;
    harness.data().await;
    respond(&reply, "ok");
    harness.wait_written(OK_KEEP_ALIVE).await;

    harness.send("cdGET /upload?n=2 HTTP/1.1\r\n\r\n");
    let (next, _reply) = harness.headers().await;
    assert_eq!(next.uri().query(), Some("n=2"));
}

#[tokio::test]
async fn writes_flush_in_order_across_partial_writes() {
    let mut harness = Harness::start_with(|writer| WriterState { max_chunk: Some(3), ..writer });
    harness.send("GET /upload HTTP/1.1\r\n\r\n");

    let (_request, reply) = harness.headers().await;
    let head = Response::builder().status(StatusCode::OK).header("content-length", 9).body(()).unwrap();
    reply.send_headers(head, Bytes::from_static(b"one"), |_| {});
    reply.send_data(Bytes::from_static(b"two"), |_| {});
    let closer = reply.clone();
    reply.send_data(Bytes::from_static(b"three"), move |result| closer.close(result));

    harness.wait_written("HTTP/1.1 200 OK\r\ncontent-length: 9\r\nconnection: keep-alive\r\n\r\nonetwothree").await;
}

#[tokio::test]
async fn write_failure_fails_every_queued_item() {
    let mut harness = Harness::start_with(|writer| WriterState { fail: Some(io::ErrorKind::BrokenPipe), ..writer });
    harness.budget.store(0, Ordering::SeqCst);
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\n");

    let (_request, reply) = harness.headers().await;
    let (results_tx, mut results) = mpsc::unbounded_channel();
    for part in ["a", "b", "c"] {
        let results_tx = results_tx.clone();
        reply.send_data(Bytes::from_static(part.as_bytes()), move |result| results_tx.send(result).unwrap());
    }

    for _ in 0..3 {
        let result = timeout(WAIT, results.recv()).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err().io_kind(), Some(io::ErrorKind::BrokenPipe));
    }
    assert!(harness.closed().await.is_err());

    let server = harness.finished().await;
    assert_eq!(server.counters().connections_active(), 0);
    assert_eq!(server.counters().connections_total(), 0);

    // the queue rejects whatever the handler still sends
    reply.send_data(Bytes::from_static(b"late"), move |result| assert!(result.is_err()));
}

#[tokio::test]
async fn write_failure_after_drained_body_keeps_the_single_close() {
    let mut harness = Harness::start_with(|writer| WriterState { fail: Some(io::ErrorKind::BrokenPipe), ..writer });
    harness.send("GET /upload HTTP/1.1\r\n\r\n");

    let (_request, reply) = harness.headers().await;
    assert!(harness.closed().await.is_ok());

    respond(&reply, "ok");
    harness.quiet().await;

    let server = harness.finished().await;
    assert_eq!(server.counters().connections_active(), 0);
    assert_eq!(server.counters().connections_total(), 0);
}

#[tokio::test]
async fn read_failure_reaches_the_handler() {
    let mut harness = Harness::start();
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
    harness.headers().await;
    harness.data().await;

    harness.fail_read(io::ErrorKind::ConnectionReset);
    let result = harness.closed().await;
    assert_eq!(result.unwrap_err().io_kind(), Some(io::ErrorKind::ConnectionReset));

    let server = harness.finished().await;
    assert_eq!(server.counters().connections_active(), 0);
}

#[tokio::test]
async fn eof_in_the_middle_of_a_body() {
    let mut harness = Harness::start();
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
    harness.headers().await;
    harness.data().await;

    harness.close_input();
    assert_eq!(harness.closed().await.unwrap_err().io_kind(), Some(io::ErrorKind::UnexpectedEof));
    harness.finished().await;
}

#[tokio::test]
async fn eof_on_idle_connection_ends_quietly() {
    let mut harness = Harness::start();
    harness.close_input();
    harness.quiet().await;

    let server = harness.finished().await;
    assert_eq!(server.counters().connections_total(), 0);
}

#[tokio::test]
async fn stale_close_is_ignored() {
    let mut harness = Harness::start();
    harness.send("GET /upload HTTP/1.1\r\n\r\n");
    let (_request, first) = harness.headers().await;
    assert!(harness.closed().await.is_ok());
    respond(&first, "ok");

    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 3\r\n\r\n");
    let (_request, _second) = harness.headers().await;

    // a second close from the finished request must not end the new one
    first.close(Err(ConnectionError::handler("late")));
    harness.send("abc");
    assert_eq!(harness.data().await, (b"abc".to_vec(), 3));
    assert!(harness.closed().await.is_ok());
    assert!(!harness.is_shut_down());
}

#[tokio::test]
async fn close_with_error_aborts() {
    let mut harness = Harness::start();
    harness.send("GET /upload HTTP/1.1\r\n\r\n");
    let (_request, reply) = harness.headers().await;
    assert!(harness.closed().await.is_ok());

    reply.close(Err(ConnectionError::handler("gave up")));
    let server = harness.finished().await;
    assert_eq!(server.counters().connections_active(), 0);
}

#[tokio::test]
async fn expect_continue_sends_interim_response() {
    let mut harness = Harness::start();
    harness.send("POST /upload HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n");

    let (request, _reply) = harness.headers().await;
    assert!(request.expects_continue());
    harness.wait_written("HTTP/1.1 100 Continue\r\n\r\n").await;

    harness.send("hi");
    assert_eq!(harness.data().await, (b"hi".to_vec(), 2));
}

#[tokio::test]
async fn expect_continue_without_handler_closes() {
    let harness = Harness::start();
    harness.send("POST /missing HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n");

    harness.wait_written(NOT_FOUND_CLOSE).await;
    harness.finished().await;
}

#[tokio::test]
async fn malformed_request_gets_bad_request() {
    let harness = Harness::start();
    harness.send("BROKEN\0REQUEST\r\n\r\n");

    harness.wait_written(BAD_REQUEST).await;
    let writer = Arc::clone(&harness.writer);
    harness.finished().await;
    assert!(writer.lock().unwrap().shutdown);
}

#[tokio::test]
async fn chunked_request_is_rejected() {
    let mut harness = Harness::start();
    harness.send("POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n");

    harness.wait_written(BAD_REQUEST).await;
    harness.quiet().await;
    harness.finished().await;
}

#[tokio::test]
async fn http_10_is_not_kept_alive() {
    let mut harness = Harness::start();
    harness.send("GET /upload HTTP/1.0\r\n\r\n");

    let (_request, reply) = harness.headers().await;
    assert!(!reply.is_keep_alive());
    assert!(harness.closed().await.is_ok());

    let head = Response::builder().status(StatusCode::NO_CONTENT).body(()).unwrap();
    let closer = reply.clone();
    reply.send_headers(head, Bytes::new(), move |result| closer.close(result));

    harness.wait_written("HTTP/1.1 204 No Content\r\n\r\n").await;
    harness.finished().await;
}

#[tokio::test]
async fn factory_creates_one_handler_per_request() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut factory = MockHandlerFactory::new();
    factory.expect_create().times(2).returning(move || {
        Box::new(Recorder { events: events_tx.clone(), budget: Arc::new(AtomicUsize::new(usize::MAX)), reply: None })
    });
    let server = Arc::new(Server::builder().route("/", factory).build().unwrap());

    let (input, chunks) = mpsc::unbounded_channel();
    let reader = ScriptedReader { chunks, leftover: Bytes::new(), delivered: Arc::new(AtomicUsize::new(0)) };
    let task = tokio::spawn(Arc::clone(&server).serve_connection(reader, RecordingWriter::default()));

    input.send(Ok(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\nConnection: close\r\n\r\n"))).unwrap();
    for _ in 0..2 {
        let reply = match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            Seen::Headers { reply, .. } => reply,
            other => panic!("expected headers, got {other:?}"),
        };
        assert!(matches!(timeout(WAIT, events.recv()).await.unwrap(), Some(Seen::Close(Ok(())))));
        respond(&reply, "ok");
    }

    timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(server.counters().connections_total(), 0);
}
