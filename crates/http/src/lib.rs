//! A per-connection HTTP/1.1 engine built on tokio
//!
//! This crate serves the requests of one accepted socket at a time: it parses request
//! heads, streams request bodies to a handler with explicit backpressure, writes
//! responses through an ordered outbound queue and keeps persistent connections
//! in sync with the handler's response when requests are pipelined.
//!
//! Accepting sockets, TLS, routing beyond path lookup and response generation are left
//! to the embedding application.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use http::{Response, StatusCode};
//! use tokio::net::TcpListener;
//! use tracing::{info, warn};
//! use void_http::connection::ReplyStream;
//! use void_http::handler::{RequestHandler, make_factory};
//! use void_http::protocol::{ConnectionError, RequestHeader};
//! use void_http::server::Server;
//!
//! #[derive(Default)]
//! struct Hello {
//!     reply: Option<ReplyStream>,
//! }
//!
//! impl RequestHandler for Hello {
//!     fn initialize(&mut self, reply: ReplyStream) {
//!         self.reply = Some(reply);
//!     }
//!
//!     fn on_headers(&mut self, request: RequestHeader) {
//!         info!(path = request.uri().path(), "request");
//!     }
//!
//!     fn on_data(&mut self, data: &[u8]) -> usize {
//!         data.len()
//!     }
//!
//!     fn on_close(&mut self, result: Result<(), ConnectionError>) {
//!         let (Some(reply), Ok(())) = (&self.reply, result) else { return };
//!         let head = Response::builder().status(StatusCode::OK).header("content-length", 14).body(()).unwrap();
//!         let closer = reply.clone();
//!         reply.send_headers(head, Bytes::from_static(b"Hello World!\r\n"), move |result| closer.close(result));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Arc::new(Server::builder().route("/", make_factory(Hello::default)).build().unwrap());
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!
//!     loop {
//!         let (tcp_stream, _remote_addr) = match listener.accept().await {
//!             Ok(accepted) => accepted,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let server = Arc::clone(&server);
//!         tokio::spawn(async move {
//!             let (reader, writer) = tcp_stream.into_split();
//!             server.serve_connection(reader, writer).await;
//!         });
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: the connection state machine and the handler's [`ReplyStream`](connection::ReplyStream)
//! - [`handler`]: the [`RequestHandler`](handler::RequestHandler) and [`HandlerFactory`](handler::HandlerFactory) traits
//! - [`server`]: handler registry, connection counters and configuration
//! - [`protocol`]: request head, response head and error types
//! - [`codec`]: request head parsing and response head encoding
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - Request bodies must be framed by `Content-Length`, chunked requests are rejected
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;
