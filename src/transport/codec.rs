//! NDJSON codec for session messages on byte-stream transports.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot make a node buffer an unbounded frame. Each
//! newline-terminated line is one JSON-encoded [`SessionMessage`].
//!
//! ```rust,ignore
//! use tokio_util::codec::{FramedRead, FramedWrite};
//! use flowstate::transport::codec::SessionCodec;
//!
//! let inbound = FramedRead::new(reader, SessionCodec::new());
//! let outbound = FramedWrite::new(writer, SessionCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::models::message::SessionMessage;
use crate::{AppError, Result};

/// Maximum accepted frame length: 1 MiB.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Line-delimited JSON codec for [`SessionMessage`] frames.
#[derive(Debug)]
pub struct SessionCodec(LinesCodec);

impl SessionCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
    }
}

impl Default for SessionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SessionCodec {
    type Item = SessionMessage;
    type Error = AppError;

    /// Decode the next complete frame, skipping blank lines.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src).map_err(map_codec_error)? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return parse_frame(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src).map_err(map_codec_error)? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return parse_frame(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<SessionMessage> for SessionCodec {
    type Error = AppError;

    fn encode(&mut self, item: SessionMessage, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)?;
        self.0.encode(line, dst).map_err(map_codec_error)
    }
}

fn parse_frame(line: &str) -> Result<SessionMessage> {
    serde_json::from_str(line).map_err(|err| AppError::Codec(format!("malformed frame: {err}")))
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Codec(format!("frame too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
