//! HTTP response header handling.
//!
//! Handlers describe the head of their reply as `http::Response<()>`; the body
//! bytes travel separately through the connection's outbound queue.

use http::Response;

/// Type alias for HTTP response headers.
///
/// The head is serialized on its own by [`HeaderEncoder`](crate::codec::HeaderEncoder),
/// so the body slot is always `()`.
pub type ResponseHead = Response<()>;
