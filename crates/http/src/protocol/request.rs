//! HTTP request header handling implementation.
//!
//! This module wraps the standard `http::Request` type and adds the few pieces of
//! framing information the connection needs from a request head: the declared
//! body length, the keep-alive decision and the expect-continue marker.

use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Uri, Version, header};

use crate::protocol::ParseError;

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Body framing information (`Content-Length`)
/// - Connection persistence (`Connection: keep-alive` / `close`)
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Returns the declared body length, `0` when no `Content-Length` is present.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - `Transfer-Encoding` is present, the connection only frames bodies by length
    /// - `Content-Length` is not a valid `u64`
    /// - several `Content-Length` headers disagree
    pub fn content_length(&self) -> Result<u64, ParseError> {
        if let Some(te) = self.headers().get(header::TRANSFER_ENCODING) {
            let reason = te.to_str().unwrap_or("<non-ascii>").to_string();
            return Err(ParseError::unsupported_transfer_encoding(reason));
        }

        let mut length = None;
        for value in self.headers().get_all(header::CONTENT_LENGTH) {
            let parsed = parse_content_length(value)?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ParseError::invalid_content_length(format!("conflicting values {previous} and {parsed}")));
                }
                _ => length = Some(parsed),
            }
        }

        Ok(length.unwrap_or(0))
    }

    /// Determines whether the connection may be reused after this request.
    ///
    /// HTTP/1.1 connections are persistent unless `Connection: close` is sent,
    /// HTTP/1.0 connections only when `Connection: keep-alive` is sent.
    pub fn is_keep_alive(&self) -> bool {
        let mut keep_alive = self.version() >= Version::HTTP_11;
        for value in self.headers().get_all(header::CONNECTION) {
            for token in value.as_bytes().split(|b| *b == b',').map(<[u8]>::trim_ascii) {
                if token.eq_ignore_ascii_case(b"close") {
                    return false;
                }
                if token.eq_ignore_ascii_case(b"keep-alive") {
                    keep_alive = true;
                }
            }
        }
        keep_alive
    }

    /// Returns true if the client waits for `100 Continue` before sending the body.
    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(header::EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }
}

fn parse_content_length(value: &HeaderValue) -> Result<u64, ParseError> {
    let str = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
    str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {str} is not u64")))
}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
