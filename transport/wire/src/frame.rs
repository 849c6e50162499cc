//! Length-prefix framing for stream transports.
//!
//! A frame on a stream transport is a 4-byte big-endian payload length
//! followed by the payload bytes. [`encode_frame`] produces the outgoing
//! byte image; [`FrameAssembler`] rebuilds incoming frames incrementally
//! from however many bytes each non-blocking read happens to deliver.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::WireError;

/// Size of the length prefix carried by every stream frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on a declared incoming frame length (16 MiB)
///
/// The prefix itself could declare up to 4 GiB; accepting that from an
/// arbitrary peer would let a single corrupt or hostile frame force
/// unbounded buffering before the frame is judged invalid.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode one frame: length prefix followed by the payload bytes.
///
/// Fails only when the payload cannot be described by the 4-byte prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > u32::MAX as usize {
        return Err(WireError::Prefix(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental reassembly of length-prefixed frames.
///
/// The assembler accepts bytes in arbitrarily small chunks: first it
/// accumulates the 4-byte prefix (possibly one byte at a time), then the
/// declared number of payload bytes. [`FrameAssembler::missing`] reports
/// how many bytes the current stage still needs, so a caller driving a
/// non-blocking socket can read exactly what the frame wants and never
/// consume bytes belonging to the next frame.
#[derive(Debug)]
pub struct FrameAssembler {
    max_frame_size: usize,
    prefix: [u8; LENGTH_PREFIX_SIZE],
    prefix_filled: usize,
    declared: usize,
    payload: BytesMut,
}

impl FrameAssembler {
    /// Create an assembler enforcing the given maximum frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            prefix: [0; LENGTH_PREFIX_SIZE],
            prefix_filled: 0,
            declared: 0,
            payload: BytesMut::new(),
        }
    }

    /// Change the maximum accepted frame size.
    ///
    /// Applies to the next frame; a frame whose prefix was already accepted
    /// keeps its declared length.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// The maximum accepted frame size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.prefix_filled == 0 && self.payload.is_empty()
    }

    /// Whether the length prefix is still incomplete.
    pub fn awaiting_prefix(&self) -> bool {
        self.prefix_filled < LENGTH_PREFIX_SIZE
    }

    /// Bytes the current stage still needs.
    ///
    /// While the prefix is incomplete this is the remainder of the prefix;
    /// afterwards it is the remainder of the declared payload.
    pub fn missing(&self) -> usize {
        if self.awaiting_prefix() {
            LENGTH_PREFIX_SIZE - self.prefix_filled
        } else {
            self.declared - self.payload.len()
        }
    }

    /// Feed received bytes into the assembler.
    ///
    /// Returns the completed payload once the declared number of bytes has
    /// accumulated. A declared length above the maximum frame size is a
    /// protocol violation: the partial state is discarded and the error
    /// returned. The caller must not feed more than [`FrameAssembler::missing`]
    /// bytes at a time, so completion consumes the whole chunk.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Option<Bytes>, WireError> {
        while !chunk.is_empty() || self.ready() {
            if self.ready() {
                let payload = self.payload.split().freeze();
                self.reset();
                return Ok(Some(payload));
            }

            if self.awaiting_prefix() {
                let take = (LENGTH_PREFIX_SIZE - self.prefix_filled).min(chunk.len());
                self.prefix[self.prefix_filled..self.prefix_filled + take]
                    .copy_from_slice(&chunk[..take]);
                self.prefix_filled += take;
                chunk = &chunk[take..];

                if self.prefix_filled == LENGTH_PREFIX_SIZE {
                    let declared = u32::from_be_bytes(self.prefix) as usize;
                    if declared > self.max_frame_size {
                        warn!(
                            declared,
                            limit = self.max_frame_size,
                            "rejecting oversized incoming frame"
                        );
                        self.reset();
                        return Err(WireError::Size(declared));
                    }
                    self.declared = declared;
                }
            } else {
                let take = (self.declared - self.payload.len()).min(chunk.len());
                self.payload.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
            }
        }

        Ok(None)
    }

    /// Discard any partially assembled frame.
    pub fn reset(&mut self) {
        self.prefix = [0; LENGTH_PREFIX_SIZE];
        self.prefix_filled = 0;
        self.declared = 0;
        self.payload.clear();
    }

    /// Whether a complete frame is buffered and ready to be taken.
    fn ready(&self) -> bool {
        !self.awaiting_prefix() && self.payload.len() == self.declared
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefixes_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let empty = encode_frame(b"").unwrap();
        assert_eq!(&empty[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_single_shot_assembly() {
        let mut assembler = FrameAssembler::default();
        let frame = encode_frame(b"payload").unwrap();
        let out = assembler.feed(&frame).unwrap().expect("complete frame");
        assert_eq!(&out[..], b"payload");
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_equals_single_shot() {
        let frame = encode_frame(b"incremental").unwrap();

        let mut whole = FrameAssembler::default();
        let expected = whole.feed(&frame).unwrap().unwrap();

        let mut dribble = FrameAssembler::default();
        let mut result = None;
        for byte in frame.iter() {
            if let Some(payload) = dribble.feed(std::slice::from_ref(byte)).unwrap() {
                result = Some(payload);
            }
        }
        assert_eq!(result.as_deref(), Some(&expected[..]));
        assert!(dribble.is_empty());
    }

    #[test]
    fn test_missing_tracks_stages() {
        let mut assembler = FrameAssembler::default();
        assert_eq!(assembler.missing(), 4);
        assert!(assembler.feed(&[0, 0]).unwrap().is_none());
        assert_eq!(assembler.missing(), 2);
        assert!(assembler.feed(&[0, 5]).unwrap().is_none());
        assert!(!assembler.awaiting_prefix());
        assert_eq!(assembler.missing(), 5);
        assert!(assembler.feed(b"ab").unwrap().is_none());
        assert_eq!(assembler.missing(), 3);
        let out = assembler.feed(b"cde").unwrap().unwrap();
        assert_eq!(&out[..], b"abcde");
    }

    #[test]
    fn test_zero_length_frame_completes_on_prefix() {
        let mut assembler = FrameAssembler::default();
        let out = assembler.feed(&[0, 0, 0, 0]).unwrap().unwrap();
        assert!(out.is_empty());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_oversized_declaration_is_rejected_and_state_dropped() {
        let mut assembler = FrameAssembler::new(8);
        let err = assembler.feed(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, WireError::Size(_)));
        assert!(assembler.is_empty());
        assert_eq!(assembler.missing(), 4);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut assembler = FrameAssembler::default();
        let first = assembler.feed(&encode_frame(b"one").unwrap()).unwrap();
        assert_eq!(first.as_deref(), Some(&b"one"[..]));
        let second = assembler.feed(&encode_frame(b"two").unwrap()).unwrap();
        assert_eq!(second.as_deref(), Some(&b"two"[..]));
    }
}
