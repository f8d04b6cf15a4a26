//! HTTP header processing module for encoding and decoding heads
//!
//! - [`HeaderDecoder`]: decodes an HTTP/1.x request head from raw bytes and
//!   enforces the header count and size limits
//! - [`HeaderEncoder`]: serializes a response head into raw bytes

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub(crate) use header_decoder::MAX_HEADER_BYTES;
pub use header_encoder::HeaderEncoder;
