//! Common utilities for usbip-bridge
//!
//! This crate provides functionality shared between the protocol engine and
//! its device backends: URB types, Linux errno values, error handling,
//! logging setup, and the completion queue that carries transfer results
//! from device worker threads back to the reactor.

pub mod channel;
pub mod errno;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    CompletionEvent, CompletionQueue, CompletionReceiver, CompletionSender, SessionId, Wake,
    completion_queue,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{UnlinkOutcome, UrbCompletion, UrbRequest, UrbToken};
