//! Line framing shared by both relay directions.
//!
//! A frame is one line of text. On the wire, frames are separated by any run
//! of `\r` and `\n` bytes; empty segments produced by leading, trailing or
//! repeated delimiters are discarded. Every frame written to either endpoint
//! ends in exactly one `\n`.
//!
//! - [`LineCodec`] decodes the backend byte stream (buffering partial lines
//!   across reads) and encodes client frames for the backend.
//! - [`split_frames`] splits one client WebSocket message into frames.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Errors produced while framing the backend stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The backend sent more than `limit` bytes without a line delimiter.
    #[error("line exceeds {limit} bytes without a delimiter")]
    LineTooLong {
        /// Configured maximum line length.
        limit: usize,
    },
    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn is_delimiter(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// Split text on runs of CR/LF, skipping empty segments.
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n']).filter(|line| !line.is_empty())
}

/// Append the single trailing newline every outbound frame carries.
pub fn terminate(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 1);
    out.push_str(line);
    out.push('\n');
    out
}

/// Newline-delimited text codec.
///
/// Decoding yields lines with delimiters stripped; invalid UTF-8 is replaced
/// with U+FFFD. Encoding writes the line followed by `\n`.
#[derive(Clone, Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a delimiter in the current partial line.
    scanned: usize,
}

impl LineCodec {
    /// Codec that rejects lines longer than `max_length` bytes.
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if self.scanned == 0 {
            let leading = src.iter().take_while(|b| is_delimiter(**b)).count();
            src.advance(leading);
        }

        let Some(offset) = src[self.scanned..].iter().position(|b| is_delimiter(*b)) else {
            self.scanned = src.len();
            if src.len() > self.max_length {
                return Err(FrameError::LineTooLong {
                    limit: self.max_length,
                });
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;
        if end > self.max_length {
            return Err(FrameError::LineTooLong {
                limit: self.max_length,
            });
        }
        let line = src.split_to(end);
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
