//! Line framing for ACP agent streams.
//!
//! One ACP message is one UTF-8 JSON object terminated by `\n`. The codec
//! delegates framing to [`tokio_util::codec::LinesCodec`] and caps inbound
//! lines at [`MAX_LINE_BYTES`] so a misbehaving agent cannot force the
//! supervisor to buffer an unterminated frame without bound. Chunk
//! boundaries are arbitrary; partial lines stay buffered until their
//! newline arrives.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum inbound line length accepted by the transport: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited JSON codec for one ACP stream direction.
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] inbound limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = String;
    type Error = AppError;

    /// Yield the next complete line, or `Ok(None)` while buffering.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] when the line exceeds [`MAX_LINE_BYTES`],
    /// [`AppError::Io`] on stream failure.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Yield a final unterminated line at EOF, if any.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    /// Encode `item` followed by the `\n` delimiter.
    ///
    /// The length cap is a decoder-side protection and is not applied here.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Acp(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
