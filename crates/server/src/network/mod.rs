//! USB/IP network engine
//!
//! # Architecture
//!
//! ```text
//! Reactor (mio, one thread)
//!   ├─> accept on link-up, reject when every slot is taken
//!   └─> Connection per client
//!         ├─> partial reads -> codec -> Session
//!         ├─> Session -> device executor (CMD_SUBMIT / CMD_UNLINK)
//!         ├─> completion queue -> Session -> RET_SUBMIT
//!         └─> idle sweep and cleanup on disconnect
//! ```

pub mod connection;
pub mod server;
pub mod session;

pub use connection::{Connection, ConnectionError};
pub use server::{Reactor, ReactorConfig, ReactorHandle, ReactorStats, spawn};
pub use session::{Session, SessionError, SessionState};
