//! HTTP codec module for the request and response heads
//!
//! - [`RequestParser`]: resumable request-head parser fed one read at a time
//! - [`HeaderDecoder`]: `tokio_util` decoder behind the parser
//! - [`HeaderEncoder`]: serializes response heads
//! - [`stock_reply`]: canned error replies and the `100 Continue` interim response
//!
//! # Example
//!
//! ```
//! use void_http::codec::{ParseStatus, RequestParser};
//!
//! let mut parser = RequestParser::new();
//! assert!(matches!(parser.parse(b"GET /index.html HTTP/1.1\r\n"), ParseStatus::Incomplete));
//! match parser.parse(b"Host: localhost\r\n\r\nnext") {
//!     ParseStatus::Complete { request, consumed } => {
//!         assert_eq!(request.uri().path(), "/index.html");
//!         assert_eq!(consumed, 19);
//!     }
//!     _ => unreachable!(),
//! }
//! ```

mod header;
mod request_parser;
pub mod stock_reply;

pub use header::{HeaderDecoder, HeaderEncoder};
pub use request_parser::{ParseStatus, RequestParser};
