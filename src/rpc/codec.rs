//! JSON Lines codec for the RPC streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so an
//! unterminated or oversized line from a misbehaving peer cannot exhaust
//! memory.
//!
//! # Usage
//!
//! Use [`RpcCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] on either end: the server frames its
//! stdin with it, the client frames the child's stdout.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_relay::rpc::codec::RpcCodec;
//!
//! let lines = FramedRead::new(tokio::io::stdin(), RpcCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted by the codec: 1 MiB.
///
/// Lines exceeding this limit decode as [`Frame::Oversized`]. The rest of
/// the oversized line is discarded and decoding resumes after its newline.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line longer than [`MAX_LINE_BYTES`] was dropped.
    Oversized,
}

/// Newline-delimited JSON codec.
///
/// Each newline-terminated (`\n`) UTF-8 string is one complete message.
/// A trailing `\r` is stripped by the underlying [`LinesCodec`].
///
/// Oversized lines are reported as a [`Frame`] rather than a decoder
/// error: `FramedRead` ends the stream after any decoder error, and one
/// bad line must not end the session.
#[derive(Debug)]
pub struct RpcCodec(LinesCodec);

impl RpcCodec {
    /// Create a new `RpcCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        into_frame(self.0.decode(src))
    }

    /// Decode the final, possibly unterminated, line at EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        into_frame(self.0.decode_eof(src))
    }
}

impl Encoder<String> for RpcCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on underlying I/O failures.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // The max length only applies when decoding.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn into_frame(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        Err(e) => Err(map_codec_error(e)),
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
