/// Socket transfer over Unix domain sockets
///
/// Control frames carry a bincode message and, optionally, live file
/// descriptors as `SCM_RIGHTS` ancillary data on the frame's bytes.
///
/// Frame layout: `u32 LE body length | u8 descriptor count | body`.

pub mod channel;
pub mod frame;

pub use channel::FdChannel;
pub use frame::FrameHeader;

use hostlink_common::BrokerError;

/// Errors from the framed descriptor channel
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Too many descriptors in one frame: {0}")]
    TooManyDescriptors(usize),

    #[error("Frame announced {expected} descriptors but {received} arrived")]
    MissingDescriptors { expected: usize, received: usize },

    #[error("Ancillary data truncated by the kernel")]
    Truncated,

    #[error("Channel closed in the middle of a frame")]
    UnexpectedEof,
}

impl From<TransferError> for BrokerError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => BrokerError::Io(e),
            other => BrokerError::transport(other.to_string()),
        }
    }
}
