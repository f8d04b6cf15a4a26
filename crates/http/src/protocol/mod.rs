//! Core HTTP protocol types shared by the parser, the connection and handlers.
//!
//! - [`RequestHeader`]: a parsed request head plus its framing information
//! - [`ResponseHead`]: the head of a reply produced by a handler
//! - [`ParseError`]: failures while parsing a request head
//! - [`ConnectionError`]: failures delivered through completion and close channels

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::ConnectionError;
pub use error::ParseError;
