//! The network process.
//!
//! Inet owns the raw ARP sockets.  The root process opens them on
//! request and passes the descriptors; frames are exchanged with the
//! manager as `BpfArp` messages routed by root.

use super::{
    imsg::{Command, Handler, Message, MsgHdr, PsId},
    Child, RootClient,
};
use crate::{
    eloop::{Eloop, Events},
    error::Error,
    net::PacketSocket,
};
use log::{debug, error, warn};
use std::{cell::RefCell, collections::BTreeMap, os::unix::io::AsRawFd, rc::Rc};

/// Largest frame read from a link.
const FRAME_LENGTH: usize = 1536;

struct Links {
    root: RootClient,
    data: Rc<Handler>,
    sockets: BTreeMap<u32, PacketSocket>,
}

#[derive(Clone)]
pub struct Inet(Rc<RefCell<Links>>);

impl Inet {
    pub fn new(root: RootClient, data: Rc<Handler>) -> Self {
        Self(Rc::new(RefCell::new(Links {
            root,
            data,
            sockets: BTreeMap::new(),
        })))
    }

    /// Handle a `BpfArp` message of the manager.
    pub fn handle(&self, eloop: &mut Eloop, message: Message) {
        match message.command() {
            Ok(Command::BpfArp) => {}
            Ok(cmd) => {
                warn!("inet: unexpected {:?}", cmd);
                return;
            }
            Err(err) => {
                warn!("inet: {}", err);
                return;
            }
        }
        let ifindex = message.header.id.ifindex;
        let flags = message.header.flags;

        let result = if flags & MsgHdr::START != 0 {
            self.open(eloop, ifindex)
        } else if flags & MsgHdr::STOP != 0 {
            self.close(eloop, ifindex);
            Ok(())
        } else {
            match self.0.borrow().sockets.get(&ifindex) {
                Some(socket) => socket.send(&message.data),
                None => Err(Error::NotFound),
            }
        };
        if let Err(err) = result {
            error!("inet: interface {}: {}", ifindex, err);
        }
    }

    fn open(&self, eloop: &mut Eloop, ifindex: u32) -> Result<(), Error> {
        if self.0.borrow().sockets.contains_key(&ifindex) {
            return Ok(());
        }
        let fd = self.0.borrow().root.open_link(ifindex)?;
        self.add_link(eloop, PacketSocket::from_fd(fd, ifindex))
    }

    /// Start reading frames from a socket.
    pub fn add_link(&self, eloop: &mut Eloop, socket: PacketSocket) -> Result<(), Error> {
        let ifindex = socket.ifindex();
        let inet = self.clone();
        eloop.add_fd(socket.as_raw_fd(), Events::READ, move |eloop, _| {
            inet.read_link(eloop, ifindex)
        })?;
        self.0.borrow_mut().sockets.insert(ifindex, socket);
        debug!("inet: interface {} opened", ifindex);
        Ok(())
    }

    pub fn close(&self, eloop: &mut Eloop, ifindex: u32) {
        if let Some(socket) = self.0.borrow_mut().sockets.remove(&ifindex) {
            let _ = eloop.delete_fd(socket.as_raw_fd());
            debug!("inet: interface {} closed", ifindex);
        }
    }

    pub fn link_count(&self) -> usize {
        self.0.borrow().sockets.len()
    }

    fn read_link(&self, eloop: &mut Eloop, ifindex: u32) {
        let mut buf = [0u8; FRAME_LENGTH];
        let id = PsId::new(Command::BpfArp.into(), ifindex, None);

        loop {
            let (result, data) = {
                let links = self.0.borrow();
                match links.sockets.get(&ifindex) {
                    Some(socket) => (socket.recv(&mut buf), links.data.clone()),
                    None => return,
                }
            };
            let result = match result {
                Ok(Some(length)) => data.send_cmd(Command::BpfArp, 0, id, &buf[..length]),
                Ok(None) => return,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!("inet: interface {}: {}", ifindex, err);
                self.close(eloop, ifindex);
                return;
            }
        }
    }
}

/// Run the network process.
pub fn run_inet(child: Child) -> Result<i32, Error> {
    child.drop_privileges()?;

    let mut eloop = Eloop::new()?;
    let inet = Inet::new(RootClient::Remote(child.cmd.clone()), child.data.clone());
    child.watch(&mut eloop, move |eloop, message| inet.handle(eloop, message))?;

    Ok(eloop.run())
}
