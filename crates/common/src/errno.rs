//! Linux errno values used in URB status fields
//!
//! USB/IP carries URB status as a negated errno, exactly as the kernel's
//! `urb->status`. Use the helpers to produce the wire value.

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EACCES: i32 = 13;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EPIPE: i32 = 32;
pub const EPROTO: i32 = 71;
pub const EOVERFLOW: i32 = 75;
pub const EMSGSIZE: i32 = 90;
pub const ECONNRESET: i32 = 104;
pub const ESHUTDOWN: i32 = 108;
pub const ETIMEDOUT: i32 = 110;

/// Wire status for a failed URB
pub const fn status(errno: i32) -> i32 {
    -errno
}
