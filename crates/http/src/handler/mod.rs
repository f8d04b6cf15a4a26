//! Request handler traits.
//!
//! A [`RequestHandler`] serves exactly one request. The connection creates it
//! through the [`HandlerFactory`] registered for the request path, hands it a
//! [`ReplyStream`] and then drives it with header, body and close events.
//!
//! # Flow control
//!
//! [`RequestHandler::on_data`] returns how many of the offered bytes were
//! accepted. Accepting less than offered pauses body delivery until the handler
//! calls [`ReplyStream::resume`]; the bytes that were not accepted are offered
//! again first.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use http::{Response, StatusCode};
//! use void_http::connection::ReplyStream;
//! use void_http::handler::{make_factory, RequestHandler};
//! use void_http::protocol::{ConnectionError, RequestHeader};
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
//!     fn on_headers(&mut self, _request: RequestHeader) {}
//!
//!     fn on_data(&mut self, data: &[u8]) -> usize {
//!         data.len()
//!     }
//!
//!     fn on_close(&mut self, result: Result<(), ConnectionError>) {
//!         let (Some(reply), Ok(())) = (&self.reply, result) else { return };
//!         let head = Response::builder().status(StatusCode::OK).header("content-length", 5).body(()).unwrap();
//!         let closer = reply.clone();
//!         reply.send_headers(head, Bytes::from_static(b"hello"), move |result| closer.close(result));
//!     }
//! }
//!
//! let _factory = make_factory(Hello::default);
//! ```

use crate::connection::ReplyStream;
use crate::protocol::{ConnectionError, RequestHeader};

/// Serves a single request on a connection.
///
/// All callbacks run on the connection's task, one at a time.
pub trait RequestHandler: Send {
    /// Attaches the reply stream, called once before [`RequestHandler::on_headers`].
    fn initialize(&mut self, reply: ReplyStream);

    /// Called exactly once with the parsed request head, before any body bytes.
    fn on_headers(&mut self, request: RequestHeader);

    /// Offers the next body bytes, returns how many of them were accepted.
    ///
    /// Values larger than `data.len()` are treated as `data.len()`.
    fn on_data(&mut self, data: &[u8]) -> usize;

    /// Called once the body was fully delivered (`Ok`), or when the connection
    /// failed or went away while this handler was attached (`Err`).
    fn on_close(&mut self, result: Result<(), ConnectionError>);
}

/// Creates a fresh [`RequestHandler`] for every routed request.
#[cfg_attr(test, mockall::automock)]
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn RequestHandler>;
}

/// A [`HandlerFactory`] backed by a closure.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, H> HandlerFactory for HandlerFn<F>
where
    F: Fn() -> H + Send + Sync,
    H: RequestHandler + 'static,
{
    fn create(&self) -> Box<dyn RequestHandler> {
        Box::new((self.f)())
    }
}

/// Wraps a handler constructor into a [`HandlerFactory`].
pub fn make_factory<F, H>(f: F) -> HandlerFn<F>
where
    F: Fn() -> H + Send + Sync,
    H: RequestHandler + 'static,
{
    HandlerFn { f }
}
