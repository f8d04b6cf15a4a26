//! Canned responses the connection emits on its own.

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Response, StatusCode, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::HeaderEncoder;
use crate::protocol::ResponseHead;

/// Interim response sent before reading the body of an `Expect: 100-continue` request.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Builds a bodyless response head for `status`.
pub fn stock_reply(status: StatusCode) -> ResponseHead {
    let mut head = Response::new(());
    *head.status_mut() = status;
    head.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    head
}

/// Serializes the stock reply for `status`, with `Connection: close` when the
/// connection is not going to be reused.
pub fn stock_reply_bytes(status: StatusCode, keep_alive: bool) -> Bytes {
    let mut head = stock_reply(status);
    if !keep_alive {
        head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    let mut dst = BytesMut::new();
    match HeaderEncoder.encode(head, &mut dst) {
        Ok(()) => dst.freeze(),
        Err(e) => {
            error!(cause = %e, status = %status, "can't encode stock reply");
            Bytes::new()
        }
    }
}
