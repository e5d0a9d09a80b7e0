//! Networking helpers: owned descriptors and raw link sockets.

mod fd;
mod packet;

pub use fd::{set_cloexec, set_nonblocking, Fd};
pub use packet::PacketSocket;
