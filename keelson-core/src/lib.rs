//! Keelson Core
//!
//! This crate contains the runtime-agnostic building blocks shared by the
//! keelson networking stack:
//! - Contiguous input/output byte buffer with scatter-read (`buffer`)
//! - IPv4/IPv6 address + port value type (`addr`)
//! - Non-blocking socket creation and raw-fd helpers (`sockets`)
//! - Microsecond monotonic timestamps (`time`)
//! - Error types (`error`)
//!
//! Nothing in here spins an event loop; the reactor lives in `keelson-net`
//! and consumes these pieces through their narrow interfaces.

// The sockets and time modules need raw fd / clock syscalls; buffer needs
// readv. Everything else stays safe.
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod addr;
pub mod buffer;
pub mod error;
pub mod sockets;
pub mod time;

// A small prelude for downstream crates. Kept minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::addr::InetAddr;
    pub use crate::buffer::Buffer;
    pub use crate::error::{KeelsonError, Result};
    pub use crate::sockets::Socket;
    pub use crate::time::Timestamp;
}
