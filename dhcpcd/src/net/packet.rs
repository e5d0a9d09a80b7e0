//! Raw link-layer sockets for ARP.

use crate::{error::Error, net::Fd};
use nix::{errno::Errno, unistd};
use std::os::unix::io::{AsRawFd, RawFd};

/// Raw socket that receives and sends complete ARP Ethernet frames.
#[derive(Debug)]
pub struct PacketSocket {
    fd: Fd,
    ifindex: u32,
}

impl PacketSocket {
    /// Wrap a socket that was opened by another process.
    pub fn from_fd(fd: Fd, ifindex: u32) -> Self {
        Self { fd, ifindex }
    }

    /// Interface that the socket is bound to.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Send one frame.
    pub fn send(&self, frame: &[u8]) -> Result<(), Error> {
        let length = loop {
            match unistd::write(self.fd.as_raw_fd(), frame) {
                Err(Errno::EINTR) => continue,
                result => break result?,
            }
        };
        if length != frame.len() {
            return Err(Error::Protocol("short frame write"));
        }
        Ok(())
    }

    /// Receive one frame, `None` if nothing is pending.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        loop {
            match unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(length) => break Ok(Some(length)),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break Ok(None),
                Err(err) => break Err(err.into()),
            }
        }
    }

    /// Release the socket descriptor.
    pub fn into_fd(self) -> Fd {
        self.fd
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        use std::{io, mem};

        impl PacketSocket {
            /// Open a non-blocking `AF_PACKET` socket bound to `ETH_P_ARP`.
            pub fn open(ifindex: u32) -> Result<Self, Error> {
                let protocol = (libc::ETH_P_ARP as u16).to_be();
                let fd = unsafe {
                    libc::socket(
                        libc::AF_PACKET,
                        libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                        libc::c_int::from(protocol),
                    )
                };
                if fd == -1 {
                    return Err(io::Error::last_os_error().into());
                }
                let fd = Fd::from(fd);

                let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
                sll.sll_family = libc::AF_PACKET as libc::c_ushort;
                sll.sll_protocol = protocol;
                sll.sll_ifindex = ifindex as libc::c_int;

                let ret = unsafe {
                    libc::bind(
                        fd.as_raw_fd(),
                        &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                    )
                };
                if ret == -1 {
                    return Err(io::Error::last_os_error().into());
                }

                Ok(Self { fd, ifindex })
            }
        }
    } else {
        impl PacketSocket {
            /// BPF capture is provided by the platform layer.
            pub fn open(_ifindex: u32) -> Result<Self, Error> {
                Err(Error::NotSupported)
            }
        }
    }
}
