use derive_more::{Display, From};
use nix::errno::Errno;
use std::{env, io};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Invalid argument: {}", "_0")]
    #[from(ignore)]
    InvalidArgument(&'static str),
    #[display(fmt = "Resource exhausted: {}", "_0")]
    #[from(ignore)]
    ResourceExhausted(&'static str),
    #[display(fmt = "Not found")]
    NotFound,
    #[display(fmt = "Protocol error: {}", "_0")]
    #[from(ignore)]
    Protocol(&'static str),
    #[display(fmt = "Permission denied")]
    PermissionDenied,
    #[display(fmt = "Operation not supported")]
    NotSupported,
    #[display(fmt = "{}", "_0")]
    SerializeError(bincode::Error),
    #[display(fmt = "{}", "_0")]
    VarError(env::VarError),
    #[display(fmt = "Invalid process")]
    InvalidProcess,
    #[display(fmt = "Username '{}' for dropping privileges not found", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, nix::Error),
}

impl Error {
    /// Returns the errno that represents this error in an RPC envelope.
    pub fn errno(&self) -> Errno {
        match self {
            Self::IoError(err) => err
                .raw_os_error()
                .map(Errno::from_i32)
                .unwrap_or(Errno::EIO),
            Self::UnixError(errno) | Self::Privdrop(_, errno) => *errno,
            Self::InvalidArgument(_) | Self::SerializeError(_) | Self::VarError(_) => {
                Errno::EINVAL
            }
            Self::ResourceExhausted(_) => Errno::ENOBUFS,
            Self::NotFound => Errno::ENOENT,
            Self::Protocol(_) => Errno::EPROTO,
            Self::PermissionDenied => Errno::EPERM,
            Self::NotSupported => Errno::ENOTSUP,
            Self::InvalidProcess => Errno::ESRCH,
            Self::UserNotFound(_) => Errno::ENOENT,
        }
    }

    /// Errors that are retried at the failing syscall.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.errno(),
            Errno::EINTR | Errno::EAGAIN | Errno::EPIPE | Errno::ENOTCONN
        )
    }
}

impl std::error::Error for Error {}
