//! Link-layer I/O for ARP frames.

use crate::{
    error::Error,
    interface::Interface,
    net::PacketSocket,
    privsep::imsg::{Command, Handler, MsgHdr, PsId},
};
use std::{
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

/// Capture and inject ARP frames on one interface.
pub trait LinkIo {
    /// Open the link, returns a descriptor to watch for frames, if any.
    fn open(&mut self, iface: &Interface) -> Result<Option<RawFd>, Error>;

    /// Send one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Receive one frame, `None` if nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    fn close(&mut self);
}

/// Creates the link of an interface.
pub type LinkFactory = Box<dyn Fn(&Interface) -> Box<dyn LinkIo>>;

/// Raw socket owned by this process.
#[derive(Debug, Default)]
pub struct PacketLink {
    socket: Option<PacketSocket>,
}

impl PacketLink {
    pub fn factory() -> LinkFactory {
        Box::new(|_| Box::new(Self::default()))
    }

    fn socket(&self) -> Result<&PacketSocket, Error> {
        self.socket.as_ref().ok_or(Error::NotFound)
    }
}

impl LinkIo for PacketLink {
    fn open(&mut self, iface: &Interface) -> Result<Option<RawFd>, Error> {
        let socket = PacketSocket::open(iface.index)?;
        let fd = socket.as_raw_fd();
        self.socket = Some(socket);
        Ok(Some(fd))
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.socket()?.send(frame)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        self.socket()?.recv(buf)
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

/// Frames relayed through the root process to the network process.
///
/// Received frames arrive as `BpfArp` messages on the data channel.
#[derive(Debug)]
pub struct PrivsepLink {
    handler: Rc<Handler>,
    id: PsId,
}

impl PrivsepLink {
    pub fn factory(handler: Rc<Handler>) -> LinkFactory {
        Box::new(move |iface| {
            Box::new(Self {
                handler: handler.clone(),
                id: PsId::new(Command::BpfArp.into(), iface.index, None),
            })
        })
    }
}

impl LinkIo for PrivsepLink {
    fn open(&mut self, _iface: &Interface) -> Result<Option<RawFd>, Error> {
        self.handler
            .send_cmd(Command::BpfArp, MsgHdr::START, self.id, &[])?;
        Ok(None)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.handler.send_cmd(Command::BpfArp, 0, self.id, frame)
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<Option<usize>, Error> {
        Ok(None)
    }

    fn close(&mut self) {
        let _ = self
            .handler
            .send_cmd(Command::BpfArp, MsgHdr::STOP, self.id, &[]);
    }
}
