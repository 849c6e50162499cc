//! Wire format error types.

use thiserror::Error;

/// Wire format errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Declared frame length exceeds the configured maximum
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Payload too large for the 4-byte length prefix
    #[error("payload not representable in length prefix: {0}")]
    Prefix(usize),
}
