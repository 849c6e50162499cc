//! Packet codec and wire framing for the wharf transport layer.
//!
//! This crate implements the in-memory message format shared by every
//! wharf transport: a typed, bounds-checked packet buffer whose multi-byte
//! integers are normalized to network byte order, and the length-prefix
//! frame format used to carry packets over stream sockets.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 payload_len      | big-endian, stream only    |
//! +----------------------+----------------------------+
//! | payload bytes        | packet content             |
//! +----------------------+----------------------------+
//! ```
//!
//! Inside a payload, integers are big-endian, floats keep the sender's
//! native layout, and strings are a `u32` count followed by raw bytes
//! (narrow) or one `u32` per character (UTF-32). Datagram transports carry
//! the payload bytes alone: one datagram is one frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod packet;

pub use error::WireError;
pub use frame::{
    encode_frame, FrameAssembler, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
};
pub use packet::Packet;
