//! IPC layer: wire messages and framing for the coordination socket.

pub mod codec;
pub mod protocol;

pub use codec::{ClientCodec, MessageCodec, ServerCodec};

/// Transport-level failure on a coordination socket.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = codec::MAX_FRAME_LEN)]
    FrameTooLarge(usize),
}
