//! Demultiplexer for the engine's attach framing
//!
//! The engine multiplexes stdout and stderr over one byte stream using an
//! 8-byte header per frame: byte 0 is the stream id (1 = stdout,
//! 2 = stderr), bytes 1-3 are reserved zeroes, bytes 4-7 are a big-endian
//! u32 payload length. Engines running a TTY emit raw unframed text instead;
//! the decoder detects that on the first bytes and falls back to treating
//! everything as stdout.

use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 8;

/// Which of the container's output streams a payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One demultiplexed payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder.
///
/// Feed it byte chunks as they arrive; complete frames come back, partial
/// frames are buffered until the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Set once the first bytes fail header validation; all subsequent
    /// input is passed through as raw stdout text.
    raw_mode: bool,
    decided: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        if !self.decided && !self.buf.is_empty() {
            // A valid header needs 4 inspectable bytes; wait for them before
            // deciding unless the stream id is already impossible.
            if self.buf.len() >= 4 {
                self.raw_mode = !plausible_header(&self.buf);
                self.decided = true;
            } else if self.buf[0] > 2 {
                self.raw_mode = true;
                self.decided = true;
            } else {
                return frames;
            }
        }

        if self.raw_mode {
            if !self.buf.is_empty() {
                frames.push(DecodedFrame {
                    stream: StreamKind::Stdout,
                    payload: std::mem::take(&mut self.buf),
                });
            }
            return frames;
        }

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            let stream = match self.buf[0] {
                2 => StreamKind::Stderr,
                _ => StreamKind::Stdout,
            };
            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);
            frames.push(DecodedFrame { stream, payload });
        }

        frames
    }

    /// Bytes still waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drain the decoder at end of stream.
    ///
    /// A container that dies mid-frame leaves a truncated frame behind:
    /// a complete header with a short payload, or a fragment of the header
    /// itself. Whatever payload bytes arrived are force-emitted under the
    /// header's stream; header fragments too short to name a stream come
    /// out as stdout.
    pub fn finish(&mut self) -> Option<DecodedFrame> {
        if self.buf.is_empty() {
            return None;
        }

        let skip = if !self.raw_mode && self.buf.len() >= HEADER_LEN && plausible_header(&self.buf)
        {
            HEADER_LEN
        } else {
            0
        };
        let stream = if skip > 0 && self.buf[0] == 2 {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        };

        let payload: Vec<u8> = self.buf.drain(..).skip(skip).collect();
        if payload.is_empty() {
            return None;
        }
        Some(DecodedFrame { stream, payload })
    }
}

fn plausible_header(buf: &[u8]) -> bool {
    buf[0] <= 2 && buf[1] == 0 && buf[2] == 0 && buf[3] == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream_id, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_demux_two_frames() {
        let mut decoder = FrameDecoder::new();
        let mut input = frame(1, b"hello");
        input.extend_from_slice(&frame(2, b"world\n"));

        let frames = decoder.push(&input);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].stream, StreamKind::Stdout);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[1].stream, StreamKind::Stderr);
        assert_eq!(frames[1].payload, b"world\n");
    }

    #[test]
    fn test_truncated_header_defers() {
        let mut decoder = FrameDecoder::new();
        let full = frame(1, b"payload");

        // Everything except the last byte of the header
        let frames = decoder.push(&full[..7]);
        assert!(frames.is_empty());
        assert_eq!(decoder.pending(), 7);

        // Remainder completes the frame
        let frames = decoder.push(&full[7..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"payload");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_split_payload_defers() {
        let mut decoder = FrameDecoder::new();
        let full = frame(2, b"0123456789");

        assert!(decoder.push(&full[..12]).is_empty());
        let frames = decoder.push(&full[12..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, StreamKind::Stderr);
        assert_eq!(frames[0].payload, b"0123456789");
    }

    #[test]
    fn test_raw_text_fallback() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"plain text from a tty\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, StreamKind::Stdout);
        assert_eq!(frames[0].payload, b"plain text from a tty\n");

        // Later chunks stay raw even if they would parse as headers
        let sneaky = frame(1, b"x");
        let frames = decoder.push(&sneaky);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, sneaky);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&frame(1, b""));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_finish_emits_truncated_payload() {
        let mut decoder = FrameDecoder::new();
        let full = frame(2, b"died mid-write");

        // Header plus only part of the declared payload
        assert!(decoder.push(&full[..12]).is_empty());
        let tail = decoder.finish().unwrap();
        assert_eq!(tail.stream, StreamKind::Stderr);
        assert_eq!(tail.payload, b"died");
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_finish_emits_header_fragment_as_stdout() {
        let mut decoder = FrameDecoder::new();
        let full = frame(2, b"x");

        assert!(decoder.push(&full[..3]).is_empty());
        let tail = decoder.finish().unwrap();
        assert_eq!(tail.stream, StreamKind::Stdout);
        assert_eq!(tail.payload, &full[..3]);
    }

    #[test]
    fn test_finish_on_bare_header_is_empty() {
        let mut decoder = FrameDecoder::new();
        let full = frame(1, b"never arrives");

        // The header landed but none of the payload did
        assert!(decoder.push(&full[..8]).is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_finish_after_clean_stream_is_empty() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame(1, b"complete"));
        assert!(decoder.finish().is_none());

        let mut raw = FrameDecoder::new();
        raw.push(b"raw text\n");
        assert!(raw.finish().is_none());
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let mut decoder = FrameDecoder::new();
        let full = frame(2, b"slow");

        let mut collected = Vec::new();
        for byte in &full {
            collected.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].stream, StreamKind::Stderr);
        assert_eq!(collected[0].payload, b"slow");
    }
}
