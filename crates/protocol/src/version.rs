//! Protocol version management

/// USB/IP protocol version carried in every operation header (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Check whether an operation header version is one we speak
///
/// Only 1.1.1 is accepted; the Linux tools have used it since the protocol
/// was merged into mainline and never negotiate anything else.
pub fn is_supported(version: u16) -> bool {
    version == USBIP_VERSION
}
