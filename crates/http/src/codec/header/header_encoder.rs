//! HTTP header encoder implementation for serializing HTTP response heads
//!
//! The encoder writes the status line followed by every header field exactly as
//! the handler set them. Body framing headers are the handler's business, only
//! stock replies fill in `Content-Length` themselves.

use crate::protocol::ResponseHead;

use bytes::{BufMut, BytesMut};

use http::Version;
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl Encoder<ResponseHead> for HeaderEncoder {
    type Error = io::Error;

    /// Encodes an HTTP response head into the provided bytes buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP version is neither HTTP/1.0 nor HTTP/1.1
    fn encode(&mut self, head: ResponseHead, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(INIT_HEADER_SIZE);
        let version = match head.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported));
            }
        };

        write!(
            FastWrite(dst),
            "{} {} {}\r\n",
            version,
            head.status().as_str(),
            head.status().canonical_reason().unwrap_or("")
        )?;

        for (header_name, header_value) in head.headers() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Fast writer implementation for writing to BytesMut.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode, header};

    #[test]
    fn encodes_status_line_and_headers() {
        let head = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, 5)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        HeaderEncoder.encode(head, &mut dst).unwrap();

        assert_eq!(&dst[..], &b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\ncontent-type: text/plain\r\n\r\n"[..]);
    }

    #[test]
    fn encodes_http_10() {
        let head = Response::builder().status(StatusCode::NOT_FOUND).version(Version::HTTP_10).body(()).unwrap();

        let mut dst = BytesMut::new();
        HeaderEncoder.encode(head, &mut dst).unwrap();

        assert_eq!(&dst[..], &b"HTTP/1.0 404 Not Found\r\n\r\n"[..]);
    }

    #[test]
    fn rejects_http_2() {
        let head = Response::builder().version(Version::HTTP_2).body(()).unwrap();

        let mut dst = BytesMut::new();
        let error = HeaderEncoder.encode(head, &mut dst).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Unsupported);
    }
}
