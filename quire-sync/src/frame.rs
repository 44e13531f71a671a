//! Transport frames, fragmentation and reassembly.
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! ┌──────────┬───────────┬────────┬──────────────────────┐
//! │ command  │ stream_id │ more   │ payload              │
//! │ u8       │ u32       │ bool   │ ≤ MAX_FRAME_PAYLOAD  │
//! └──────────┴───────────┴────────┴──────────────────────┘
//! ```
//!
//! A message whose payload fits in one frame goes out on stream 0.
//! Larger payloads get a fresh non-zero stream id from the sender's
//! [`Fragmenter`]; every fragment but the last has `more = true`. The
//! receiving [`Reassembler`] keys partial messages by stream id, so two
//! large messages of the same command may interleave safely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::SyncError;

/// Largest payload carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Stream id for messages that fit in one frame.
pub const SINGLE_FRAME_STREAM: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("frame decoding failed: {0}")]
    Decode(String),
    #[error("stream {stream_id} switched command from {expected} to {got}")]
    CommandMismatch { stream_id: u32, expected: u8, got: u8 },
    #[error("reassembled message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },
    #[error("too many partial streams open (limit {limit})")]
    TooManyStreams { limit: usize },
    #[error("single-frame stream 0 cannot carry fragments")]
    FragmentOnStreamZero,
}

impl From<FrameError> for SyncError {
    fn from(e: FrameError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub command: u8,
    pub stream_id: u32,
    pub more: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn single(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            stream_id: SINGLE_FRAME_STREAM,
            more: false,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FrameError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Splits outgoing payloads into frames. One per connection direction.
#[derive(Debug)]
pub struct Fragmenter {
    next_stream: u32,
    max_payload: usize,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(MAX_FRAME_PAYLOAD)
    }
}

impl Fragmenter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            next_stream: 1,
            max_payload: max_payload.max(1),
        }
    }

    /// Frames for one logical message, in send order.
    pub fn split(&mut self, command: u8, payload: &[u8]) -> Vec<Frame> {
        if payload.len() <= self.max_payload {
            return vec![Frame::single(command, payload.to_vec())];
        }

        let stream_id = self.next_stream;
        // Wraps past u32::MAX back to 1; stream 0 stays reserved.
        self.next_stream = self.next_stream.checked_add(1).unwrap_or(1);

        let chunks: Vec<&[u8]> = payload.chunks(self.max_payload).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Frame {
                command,
                stream_id,
                more: i < last,
                payload: chunk.to_vec(),
            })
            .collect()
    }

    /// Split and bincode-encode, ready for the socket.
    pub fn encode(&mut self, command: u8, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.split(command, payload).iter().map(Frame::encode).collect()
    }
}

struct Partial {
    command: u8,
    buf: Vec<u8>,
}

/// Rebuilds logical messages from incoming frames.
pub struct Reassembler {
    partial: HashMap<u32, Partial>,
    max_streams: usize,
    max_message_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(16, 64 * 1024 * 1024)
    }
}

impl Reassembler {
    pub fn new(max_streams: usize, max_message_bytes: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_streams,
            max_message_bytes,
        }
    }

    /// Feed one frame. Returns `(command, payload)` once a message is whole.
    pub fn push(&mut self, frame: Frame) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        if frame.stream_id == SINGLE_FRAME_STREAM {
            if frame.more {
                return Err(FrameError::FragmentOnStreamZero);
            }
            return Ok(Some((frame.command, frame.payload)));
        }

        if !self.partial.contains_key(&frame.stream_id) && self.partial.len() >= self.max_streams {
            return Err(FrameError::TooManyStreams { limit: self.max_streams });
        }

        let entry = self.partial.entry(frame.stream_id).or_insert_with(|| Partial {
            command: frame.command,
            buf: Vec::new(),
        });
        if entry.command != frame.command {
            let expected = entry.command;
            self.partial.remove(&frame.stream_id);
            return Err(FrameError::CommandMismatch {
                stream_id: frame.stream_id,
                expected,
                got: frame.command,
            });
        }
        if entry.buf.len() + frame.payload.len() > self.max_message_bytes {
            self.partial.remove(&frame.stream_id);
            return Err(FrameError::MessageTooLarge { limit: self.max_message_bytes });
        }
        entry.buf.extend_from_slice(&frame.payload);

        if frame.more {
            return Ok(None);
        }
        Ok(self
            .partial
            .remove(&frame.stream_id)
            .map(|done| (done.command, done.buf)))
    }

    /// Number of messages still waiting for fragments.
    pub fn pending_streams(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_one_frame() {
        let mut fragmenter = Fragmenter::default();
        let frames = fragmenter.split(6, b"{}");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, SINGLE_FRAME_STREAM);
        assert!(!frames[0].more);
    }

    #[test]
    fn test_large_payload_fragments_and_reassembles() {
        let mut fragmenter = Fragmenter::new(10);
        let payload: Vec<u8> = (0..35u8).collect();
        let frames = fragmenter.split(2, &payload);
        assert_eq!(frames.len(), 4);
        assert!(frames[..3].iter().all(|f| f.more));
        assert!(!frames[3].more);

        let mut reassembler = Reassembler::default();
        let mut done = None;
        for frame in frames {
            let bytes = frame.encode().unwrap();
            done = reassembler.push(Frame::decode(&bytes).unwrap()).unwrap();
        }
        assert_eq!(done, Some((2, payload)));
        assert_eq!(reassembler.pending_streams(), 0);
    }

    #[test]
    fn test_interleaved_streams_of_same_command() {
        let mut fragmenter = Fragmenter::new(4);
        let a = fragmenter.split(8, b"aaaaaaaa");
        let b = fragmenter.split(8, b"bbbbbbbbbb");
        assert_ne!(a[0].stream_id, b[0].stream_id);

        let mut reassembler = Reassembler::default();
        let mut finished = Vec::new();
        let mut a_iter = a.into_iter();
        let mut b_iter = b.into_iter();
        loop {
            let mut progressed = false;
            for frame in [a_iter.next(), b_iter.next()].into_iter().flatten() {
                progressed = true;
                if let Some(done) = reassembler.push(frame).unwrap() {
                    finished.push(done);
                }
            }
            if !progressed {
                break;
            }
        }
        assert_eq!(finished.len(), 2);
        assert!(finished.contains(&(8, b"aaaaaaaa".to_vec())));
        assert!(finished.contains(&(8, b"bbbbbbbbbb".to_vec())));
    }

    #[test]
    fn test_reassembly_limits() {
        let mut reassembler = Reassembler::new(1, 8);
        let first = Frame { command: 2, stream_id: 1, more: true, payload: vec![0; 4] };
        assert_eq!(reassembler.push(first).unwrap(), None);

        let other_stream = Frame { command: 2, stream_id: 2, more: true, payload: vec![0; 1] };
        assert_eq!(
            reassembler.push(other_stream),
            Err(FrameError::TooManyStreams { limit: 1 })
        );

        let overflow = Frame { command: 2, stream_id: 1, more: true, payload: vec![0; 5] };
        assert_eq!(reassembler.push(overflow), Err(FrameError::MessageTooLarge { limit: 8 }));
        assert_eq!(reassembler.pending_streams(), 0);
    }

    #[test]
    fn test_fragment_on_stream_zero_is_rejected() {
        let mut reassembler = Reassembler::default();
        let bad = Frame { command: 2, stream_id: 0, more: true, payload: vec![1] };
        assert_eq!(reassembler.push(bad), Err(FrameError::FragmentOnStreamZero));
    }
}
