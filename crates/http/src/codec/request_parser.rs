//! Resumable request-head parser.
//!
//! The connection hands over whatever the socket delivered, one read at a time.
//! [`RequestParser`] keeps the partial head between calls and reports how many
//! bytes of the latest slice belonged to the head, so the caller can route the
//! rest to the body or to the next pipelined request.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::header::HeaderDecoder;
use crate::protocol::{ParseError, RequestHeader};

/// Outcome of feeding a slice of bytes to a [`RequestParser`].
#[derive(Debug)]
pub enum ParseStatus {
    /// The head is not complete yet, every byte of the slice was retained.
    Incomplete,
    /// The head is complete; `consumed` is the number of bytes of the latest slice
    /// that belonged to it.
    Complete { request: RequestHeader, consumed: usize },
    /// The head is malformed, the byte stream can't be framed anymore.
    Failed(ParseError),
}

/// Stateful request-head parser, reusable across requests through [`RequestParser::reset`].
#[derive(Debug, Default)]
pub struct RequestParser {
    decoder: HeaderDecoder,
    partial: BytesMut,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next slice of the byte stream to the parser.
    pub fn parse(&mut self, data: &[u8]) -> ParseStatus {
        self.partial.extend_from_slice(data);

        match self.decoder.decode(&mut self.partial) {
            Ok(Some(request)) => {
                // the decoder split the head off, what is left is the tail of `data`
                let consumed = data.len() - self.partial.len();
                self.partial.clear();
                ParseStatus::Complete { request, consumed }
            }
            Ok(None) => ParseStatus::Incomplete,
            Err(e) => {
                self.partial.clear();
                ParseStatus::Failed(e)
            }
        }
    }

    /// Returns true if some bytes of a head were already seen.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Forgets any partially parsed head.
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}
