//! Per-connection HTTP/1.1 engine
//!
//! - [`Connection`]: reads and parses requests, hands bodies to handlers with
//!   backpressure, keeps pipelined requests in order and writes responses
//! - [`ReplyStream`]: what a handler gets to answer its request
//!
//! # Lifecycle
//!
//! A connection starts reading as soon as [`Connection::run`] is awaited and ends
//! once nothing is left to do: no read outstanding, no handler attached, no
//! response pending and nothing left to write. Every write that is still queued
//! at that point completes with [`ConnectionError::Closed`](crate::protocol::ConnectionError::Closed).
//!
//! # Keep-alive
//!
//! The next request is only parsed after the current request body has been
//! drained *and* its response closed, whichever happens last. Bytes of a pipelined
//! request that arrive earlier are buffered in the meantime.

mod http_connection;
mod outbound;
mod reply_stream;

#[cfg(test)]
mod tests;

pub use http_connection::Connection;
pub use outbound::Completion;
pub use reply_stream::ReplyStream;
