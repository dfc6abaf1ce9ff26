//! Turns a chunked byte stream into complete frames.
//!
//! Partial lines are buffered across chunk boundaries by `LinesCodec`; only
//! complete lines are parsed. A bad line (malformed JSON, unknown shape, or
//! over the length cap) is dropped and decoding continues. End of stream is
//! the transport's business; `{"done":true}` is just another frame.

use crate::constants::MAX_RECORD_BYTES;
use crate::frames::{parse_record, Frame};
use crate::types::StreamKeeperError;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

pub struct FrameCodec {
    lines: LinesCodec,
    dropped: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_RECORD_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            dropped: 0,
        }
    }

    /// Number of non-blank lines dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn parse_line(&mut self, line: &str) -> Option<Frame> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let data = match trimmed.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            None => trimmed,
        };
        let frame = parse_record(data);
        if frame.is_none() {
            self.dropped += 1;
        }
        frame
    }

    fn next_frame(
        &mut self,
        buf: &mut BytesMut,
        eof: bool,
    ) -> std::result::Result<Option<Frame>, StreamKeeperError> {
        loop {
            let line = if eof {
                self.lines.decode_eof(buf)
            } else {
                self.lines.decode(buf)
            };
            match line {
                Ok(Some(line)) => {
                    if let Some(frame) = self.parse_line(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    self.dropped += 1;
                    tracing::warn!(
                        "[DECODE] Record exceeded {} bytes; dropping it",
                        MAX_RECORD_BYTES
                    );
                }
                // The codec has already consumed the offending line.
                Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    self.dropped += 1;
                    tracing::warn!("[DECODE] Dropping non-UTF-8 record: {}", e);
                }
                Err(LinesCodecError::Io(e)) => return Err(StreamKeeperError::Io(e)),
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = StreamKeeperError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Frame>, Self::Error> {
        self.next_frame(buf, false)
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<Frame>, Self::Error> {
        self.next_frame(buf, true)
    }
}

pub type FrameStream<R> = FramedRead<StreamReader<R, Bytes>, FrameCodec>;

/// Wraps a transport body in the frame decoder.
pub fn frame_stream<R>(body: R) -> FrameStream<R>
where
    R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    FramedRead::new(StreamReader::new(body), FrameCodec::new())
}
