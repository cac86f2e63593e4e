//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Operation header with a version other than 0x0111
    #[error("Unsupported protocol version: {0:#06x}")]
    UnsupportedVersion(u16),

    /// Operation code outside the devlist/import set
    #[error("Unknown operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Transfer command outside CMD_SUBMIT..RET_UNLINK
    #[error("Unknown transfer command: {0:#010x}")]
    UnknownCommand(u32),

    /// Direction field that is neither OUT (0) nor IN (1)
    #[error("Invalid transfer direction: {0}")]
    InvalidDirection(u32),

    /// Device speed value not defined by the kernel's usb_device_speed
    #[error("Invalid device speed: {0}")]
    InvalidSpeed(u32),

    /// Announced payload larger than the codec accepts
    #[error("Transfer too large: {length} bytes (max: {max})")]
    TransferTooLarge { length: u32, max: u32 },

    /// Announced isochronous packet count larger than the codec accepts
    #[error("Too many iso packets: {count} (max: {max})")]
    TooManyIsoPackets { count: u32, max: u32 },

    /// OP_REP_DEVLIST announcing more devices than the single-device layout holds
    #[error("Device list holds {0} devices, only 0 or 1 are supported")]
    TooManyDevices(u32),

    /// A message whose length fields disagree with the payload it carries
    #[error("Payload mismatch for {field}: declared {declared}, got {actual}")]
    PayloadMismatch {
        field: &'static str,
        declared: usize,
        actual: usize,
    },

    /// Peer closed the stream before a full message arrived
    #[error("Connection closed with {buffered} bytes of a partial message buffered")]
    ConnectionClosed { buffered: usize },

    /// I/O error while reading or writing a stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error means the byte stream can not be a valid USB/IP
    /// message, as opposed to a transport or encoder-side failure
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion(_)
                | Self::UnknownOpCode(_)
                | Self::UnknownCommand(_)
                | Self::InvalidDirection(_)
                | Self::InvalidSpeed(_)
                | Self::TransferTooLarge { .. }
                | Self::TooManyIsoPackets { .. }
                | Self::TooManyDevices(_)
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
