use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while parsing a request head.
///
/// A parse error is recoverable at the connection level: the connection answers
/// with a `400 Bad Request` stock reply and closes once it is flushed.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("unsupported transfer-encoding: {reason}")]
    UnsupportedTransferEncoding { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::UnsupportedTransferEncoding { reason: str.to_string() }
    }
}

/// The error delivered through every completion and close channel of a connection.
///
/// One transport failure fans out to every queued write completion and to the
/// attached handler, so the error is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("transport error: {source}")]
    Transport { source: Arc<io::Error> },

    #[error("handler aborted the connection: {reason}")]
    Handler { reason: String },

    #[error("connection closed before the data was written")]
    Closed,
}

impl ConnectionError {
    pub fn transport<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: Arc::new(e.into()) }
    }

    pub fn handler<S: ToString>(str: S) -> Self {
        Self::Handler { reason: str.to_string() }
    }

    /// Returns the io error kind when this is a transport failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Transport { source } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::transport(e)
    }
}
