//! Privilege-separated runtime of a network configuration daemon.
//!
//! The daemon is split into cooperating processes that only talk to
//! each other over `imsg` channels:
//!
//! - `root` keeps the privileges and runs a fixed allow-list of
//!   operations on behalf of the others, see [`privsep::RootDispatcher`];
//! - `inet` owns the raw network sockets;
//! - `control` accepts administrative clients on the control sockets;
//! - `manager` runs the protocol logic without any privileges.
//!
//! Each process runs a single-threaded [`eloop::Eloop`] that
//! multiplexes timers, descriptors and signals.  On top of it, the
//! [`arp`] module implements Address Conflict Detection (RFC 5227):
//! probing, announcing and defending IPv4 addresses.
//!
//! The roles are declared with [`dhcpcd-derive`]:
//!
//! ```ignore
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Privsep)]
//! #[username = "_dhcpcd"]
//! pub enum Role {
//!     Root,
//!     Manager,
//!     Inet,
//!     Control,
//! }
//! ```
//!
//! The `dhcpcd` binary executes itself once per role and dispatches
//! on the program name, see [`privsep::spawn`].
//!
//! [`dhcpcd-derive`]: ../dhcpcd_derive/index.html

pub mod arp;
pub mod control;
pub mod eloop;
mod error;
pub mod interface;
pub mod manager;
pub mod net;
pub mod options;
pub mod privsep;

pub use error::Error;
