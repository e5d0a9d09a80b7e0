//! Internal message handling between privilege-separated processes.
//!
//! Every message is a fixed [`MsgHdr`] followed by `name_len` bytes of
//! name and `data_len` bytes of data.  A descriptor travels as
//! `SCM_RIGHTS` ancillary data, announced by a non-zero
//! `control_len`.  Requests on a command channel are answered with an
//! [`Envelope`] carrying the result and errno computed by the remote
//! dispatcher.

use crate::{
    eloop::{wait_fd, Events},
    error::Error,
    net::{set_cloexec, Fd},
};
use bytes::{Bytes, BytesMut};
use log::debug;
use nix::{
    cmsg_space,
    errno::Errno,
    sys::socket::{
        recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    },
    unistd::getpid,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::TryFrom,
    io::{IoSlice, IoSliceMut},
    iter, mem,
    net::IpAddr,
    os::unix::{
        io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
        net::UnixStream,
    },
};
use zerocopy::{AsBytes, FromBytes};

/// Closed set of commands that cross a privsep channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Ioctl = 0x0010,
    Route = 0x0011,
    Script = 0x0012,
    Unlink = 0x0013,
    ReadFile = 0x0014,
    WriteFile = 0x0015,
    FileMtime = 0x0016,
    Ctl = 0x0018,
    CtlEof = 0x0019,
    Sysctl = 0x0023,
    OpenLink = 0x0030,
    BpfArp = 0x0101,
    Start = 0x4000,
    Stop = 0x8000,
}

impl TryFrom<u16> for Command {
    type Error = Error;

    fn try_from(cmd: u16) -> Result<Self, Self::Error> {
        Ok(match cmd {
            0x0010 => Self::Ioctl,
            0x0011 => Self::Route,
            0x0012 => Self::Script,
            0x0013 => Self::Unlink,
            0x0014 => Self::ReadFile,
            0x0015 => Self::WriteFile,
            0x0016 => Self::FileMtime,
            0x0018 => Self::Ctl,
            0x0019 => Self::CtlEof,
            0x0023 => Self::Sysctl,
            0x0030 => Self::OpenLink,
            0x0101 => Self::BpfArp,
            0x4000 => Self::Start,
            0x8000 => Self::Stop,
            _ => return Err(Error::NotSupported),
        })
    }
}

impl From<Command> for u16 {
    fn from(cmd: Command) -> u16 {
        cmd as u16
    }
}

/// Identity of a process or of the object a message is about.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsBytes, FromBytes,
)]
#[repr(C)]
pub struct PsId {
    /// IPv4 or IPv6 address, zero padded.
    pub addr: [u8; 16],
    /// Interface index.
    pub ifindex: u32,
    /// Role or command of the owner.
    pub cmd: u16,
    /// Address family of `addr`, 0 if unset.
    pub family: u16,
}

impl PsId {
    pub fn new(cmd: u16, ifindex: u32, addr: Option<IpAddr>) -> Self {
        let mut id = Self {
            cmd,
            ifindex,
            ..Default::default()
        };
        match addr {
            Some(IpAddr::V4(addr)) => {
                id.addr[..4].copy_from_slice(&addr.octets());
                id.family = libc::AF_INET as u16;
            }
            Some(IpAddr::V6(addr)) => {
                id.addr.copy_from_slice(&addr.octets());
                id.family = libc::AF_INET6 as u16;
            }
            None => {}
        }
        id
    }

    /// Returns the address according to the family.
    pub fn addr(&self) -> Option<IpAddr> {
        match i32::from(self.family) {
            libc::AF_INET => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.addr[..4]);
                Some(octets.into())
            }
            libc::AF_INET6 => Some(self.addr.into()),
            _ => None,
        }
    }
}

/// Message header.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct MsgHdr {
    /// Length of the data that follows the name.
    pub data_len: u64,
    /// Identity of the object.
    pub id: PsId,
    /// `START`, `STOP` or command specific flags.
    pub flags: u32,
    /// Length of the name that follows the header.
    pub name_len: u32,
    /// Length of the ancillary data, non-zero if a descriptor is passed.
    pub control_len: u32,
    /// PID of the sender.
    pub pid: libc::pid_t,
    /// Command.
    pub cmd: u16,
    _reserved: [u8; 6],
}

impl MsgHdr {
    pub const START: u32 = 0x4000;
    pub const STOP: u32 = 0x8000;

    /// Message header length.
    pub const HEADER_LENGTH: usize = mem::size_of::<Self>();

    /// Create a new message header.
    pub fn new(cmd: Command, flags: u32, id: PsId) -> Self {
        Self {
            cmd: cmd.into(),
            flags,
            id,
            pid: getpid().as_raw(),
            ..Default::default()
        }
    }

    fn set_lengths(&mut self, fd: bool, name: &[u8], data: &[u8]) -> Result<(), Error> {
        self.name_len =
            u32::try_from(name.len()).map_err(|_| Error::InvalidArgument("name too long"))?;
        self.data_len = data.len() as u64;
        self.control_len = if fd { mem::size_of::<RawFd>() as u32 } else { 0 };
        self.payload_len().map(|_| ())
    }

    fn payload_len(&self) -> Result<usize, Error> {
        let length = self.data_len.saturating_add(self.name_len.into());
        if length > MAX_DATA as u64 {
            return Err(Error::Protocol("oversized message"));
        }
        Ok(length as usize)
    }
}

/// RPC result envelope.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct Envelope {
    pub result: i64,
    pub errno: i32,
    pub control_len: u32,
    pub data_len: u64,
}

impl Envelope {
    pub const HEADER_LENGTH: usize = mem::size_of::<Self>();

    fn reply(reply: &Reply) -> Self {
        Self {
            result: reply.result,
            errno: 0,
            control_len: reply
                .fd
                .as_ref()
                .map(|_| mem::size_of::<RawFd>() as u32)
                .unwrap_or(0),
            data_len: reply.data.len() as u64,
        }
    }

    fn error(errno: Errno) -> Self {
        Self {
            result: -1,
            errno: errno as i32,
            ..Default::default()
        }
    }

    fn payload_len(&self) -> Result<usize, Error> {
        if self.data_len > MAX_DATA as u64 {
            return Err(Error::Protocol("oversized envelope"));
        }
        Ok(self.data_len as usize)
    }
}

/// Channel buffer length, also the largest possible message.
pub const BUFFER_LENGTH: usize = 0x10000;

/// Maximum length of name and data in one message.
pub const MAX_DATA: usize = BUFFER_LENGTH - MsgHdr::HEADER_LENGTH;

/// A received message.
#[derive(Debug)]
pub struct Message {
    pub header: MsgHdr,
    pub name: Bytes,
    pub data: Bytes,
    pub fd: Option<Fd>,
}

impl Message {
    pub fn command(&self) -> Result<Command, Error> {
        Command::try_from(self.header.cmd)
    }

    /// Deserialize the data.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.data).map_err(Into::into)
    }
}

/// Reply of a dispatcher that is returned in the envelope.
#[derive(Debug, Default)]
pub struct Reply {
    pub result: i64,
    pub data: Vec<u8>,
    pub fd: Option<Fd>,
}

impl Reply {
    pub fn result(result: i64) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self {
            result: data.len() as i64,
            data,
            fd: None,
        }
    }

    pub fn fd(fd: Fd) -> Self {
        Self {
            fd: Some(fd),
            ..Default::default()
        }
    }
}

/// Decoded envelope.
#[derive(Debug)]
pub struct RpcResult {
    pub result: i64,
    pub errno: i32,
    pub data: Bytes,
    pub fd: Option<Fd>,
}

impl RpcResult {
    /// Returns the errno as an error if the remote call failed.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.result == -1 {
            Err(Errno::from_i32(self.errno).into())
        } else {
            Ok(self)
        }
    }
}

/// Bytes that may be queued on a channel before messages are refused.
pub const QUEUE_LENGTH: usize = BUFFER_LENGTH * 4;

/// Result of reading a channel without waiting.
#[derive(Debug)]
pub enum Received {
    Message(Message),
    /// Only part of the next message arrived, it stays buffered.
    Incomplete,
    /// The remote end closed the channel.
    Closed,
}

enum Frame<H> {
    Complete(H, BytesMut),
    Incomplete,
    Closed,
}

/// A frame waiting for the channel to become writable.
#[derive(Debug)]
struct Outgoing {
    frame: Vec<u8>,
    written: usize,
    /// Passed with the first byte of the frame.
    fd: Option<Fd>,
}

fn frame(header: &[u8], payload: &[&[u8]]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + payload.iter().map(|p| p.len()).sum::<usize>());
    frame.extend_from_slice(header);
    for part in payload {
        frame.extend_from_slice(part);
    }
    frame
}

/// `imsg` handler.
///
/// The socket is non-blocking.  The `send_*` and `recv_message`
/// functions wait on this socket only and are used by the processes
/// that talk to root.  Root never waits for a peer: it reads with
/// `try_recv_message` and writes with the `queue_*` functions, the
/// queue is written by `flush` once the channel is writable.
#[derive(Debug)]
pub struct Handler {
    /// Half of a UNIX socketpair.
    socket: UnixStream,
    /// Set after the stream was shut down.
    shutdown: Cell<bool>,
    /// Read buffer.
    read_buffer: RefCell<BytesMut>,
    /// Descriptors received but not yet claimed by a message.
    fds: RefCell<VecDeque<Fd>>,
    /// Frames that did not fit into the socket.
    queue: RefCell<VecDeque<Outgoing>>,
}

impl Handler {
    /// Create new handler pair.
    pub fn pair() -> Result<(Self, Self), Error> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    pub fn new(socket: UnixStream) -> Result<Self, Error> {
        socket.set_nonblocking(true)?;

        // Room for a complete message in each direction.
        let length = BUFFER_LENGTH * 2;
        setsockopt(socket.as_raw_fd(), sockopt::SndBuf, &length)?;
        setsockopt(socket.as_raw_fd(), sockopt::RcvBuf, &length)?;

        Ok(Self {
            socket,
            shutdown: Default::default(),
            read_buffer: RefCell::new(BytesMut::with_capacity(BUFFER_LENGTH)),
            fds: Default::default(),
            queue: Default::default(),
        })
    }

    /// Create half of a handler pair from a file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Self, Error> {
        let fd = fd.into_raw_fd();
        set_cloexec(fd, true)?;
        Self::new(unsafe { UnixStream::from_raw_fd(fd) })
    }

    /// Send a command with raw data.
    pub fn send_cmd(&self, cmd: Command, flags: u32, id: PsId, data: &[u8]) -> Result<(), Error> {
        self.send_msg(MsgHdr::new(cmd, flags, id), None, &[], data)
    }

    /// Send a command with serialized data.
    pub fn send_message<T: Serialize>(
        &self,
        cmd: Command,
        flags: u32,
        id: PsId,
        data: &T,
    ) -> Result<(), Error> {
        let data = bincode::serialize(data)?;
        self.send_cmd(cmd, flags, id, &data)
    }

    /// Send a message with an optional descriptor.
    pub fn send_msg(
        &self,
        mut header: MsgHdr,
        fd: Option<RawFd>,
        name: &[u8],
        data: &[u8],
    ) -> Result<(), Error> {
        header.set_lengths(fd.is_some(), name, data)?;
        self.write_frame(header.as_bytes(), &[name, data], fd)
    }

    /// Queue a message, the channel is written as far as possible.
    ///
    /// Fails with `ResourceExhausted` instead of waiting if the peer
    /// does not read its messages.
    pub fn queue_msg(
        &self,
        mut header: MsgHdr,
        fd: Option<Fd>,
        name: &[u8],
        data: &[u8],
    ) -> Result<(), Error> {
        header.set_lengths(fd.is_some(), name, data)?;
        self.push(frame(header.as_bytes(), &[name, data]), fd)
    }

    /// Send the result of a request.
    pub fn send_envelope(&self, reply: Reply) -> Result<(), Error> {
        if reply.data.len() > MAX_DATA {
            return self.send_error(Errno::ENOBUFS);
        }
        let fd = reply.fd.as_ref().map(AsRawFd::as_raw_fd);
        self.write_frame(Envelope::reply(&reply).as_bytes(), &[&reply.data], fd)
    }

    /// Send a failed result.
    pub fn send_error(&self, errno: Errno) -> Result<(), Error> {
        self.write_frame(Envelope::error(errno).as_bytes(), &[], None)
    }

    /// Queue the result of a request.
    pub fn queue_envelope(&self, reply: Reply) -> Result<(), Error> {
        if reply.data.len() > MAX_DATA {
            return self.queue_error(Errno::ENOBUFS);
        }
        let frame = frame(Envelope::reply(&reply).as_bytes(), &[&reply.data]);
        self.push(frame, reply.fd)
    }

    /// Queue a failed result.
    pub fn queue_error(&self, errno: Errno) -> Result<(), Error> {
        self.push(Envelope::error(errno).as_bytes().to_vec(), None)
    }

    fn push(&self, frame: Vec<u8>, fd: Option<Fd>) -> Result<(), Error> {
        if self.shutdown.get() {
            return Err(Errno::ENOTCONN.into());
        }
        if self.queued() + frame.len() > QUEUE_LENGTH {
            return Err(Error::ResourceExhausted("channel queue full"));
        }
        self.queue.borrow_mut().push_back(Outgoing {
            frame,
            written: 0,
            fd,
        });
        self.flush()
    }

    /// Write queued frames until the socket would block.
    pub fn flush(&self) -> Result<(), Error> {
        let mut queue = self.queue.borrow_mut();
        while let Some(outgoing) = queue.front_mut() {
            let fds = outgoing.fd.as_ref().map(|fd| [fd.as_raw_fd()]);
            let cmsgs = match (&fds, outgoing.written) {
                (Some(fds), 0) => vec![ControlMessage::ScmRights(&fds[..])],
                _ => vec![],
            };
            let iov = [IoSlice::new(&outgoing.frame[outgoing.written..])];

            match sendmsg::<()>(self.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
                Ok(0) => return Err(Error::Protocol("short write")),
                Ok(length) => {
                    outgoing.written += length;
                    if outgoing.written == outgoing.frame.len() {
                        queue.pop_front();
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Returns true if queued frames wait for the channel to become writable.
    pub fn has_queued(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    fn queued(&self) -> usize {
        self.queue
            .borrow()
            .iter()
            .map(|outgoing| outgoing.frame.len() - outgoing.written)
            .sum()
    }

    fn write_frame(&self, header: &[u8], payload: &[&[u8]], fd: Option<RawFd>) -> Result<(), Error> {
        if self.shutdown.get() {
            return Err(Errno::ENOTCONN.into());
        }

        // Queued frames go first.
        while self.has_queued() {
            self.flush()?;
            if self.has_queued() {
                wait_fd(self.as_raw_fd(), Events::WRITE, None)?;
            }
        }

        let parts = iter::once(header)
            .chain(payload.iter().copied())
            .collect::<Vec<_>>();
        let total = parts.iter().map(|part| part.len()).sum::<usize>();
        let fds = fd.map(|fd| [fd]);
        let mut written = 0;

        while written < total {
            let mut skip = written;
            let mut iovs = Vec::with_capacity(parts.len());
            for part in &parts {
                if skip >= part.len() {
                    skip -= part.len();
                    continue;
                }
                iovs.push(IoSlice::new(&part[skip..]));
                skip = 0;
            }

            // The descriptor is attached to the first byte only.
            let cmsgs = match (&fds, written) {
                (Some(fds), 0) => vec![ControlMessage::ScmRights(&fds[..])],
                _ => vec![],
            };

            match sendmsg::<()>(self.as_raw_fd(), &iovs, &cmsgs, MsgFlags::empty(), None) {
                Ok(0) => return Err(Error::Protocol("short write")),
                Ok(length) => written += length,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    wait_fd(self.as_raw_fd(), Events::WRITE, None)?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Read available data, returns `false` on EOF.
    fn fill(&self) -> Result<bool, Error> {
        let mut buf = self.read_buffer.borrow_mut();
        let start = buf.len();
        buf.resize(start + BUFFER_LENGTH, 0);

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        let flags = MsgFlags::MSG_CMSG_CLOEXEC;
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        let flags = MsgFlags::empty();

        let mut cmsg = cmsg_space!([RawFd; 4]);
        let result = {
            let mut iov = [IoSliceMut::new(&mut buf[start..])];
            recvmsg::<()>(self.as_raw_fd(), &mut iov, Some(&mut cmsg), flags).map(|msg| {
                let fds = msg
                    .cmsgs()
                    .filter_map(|cmsg| match cmsg {
                        ControlMessageOwned::ScmRights(fds) => Some(fds),
                        _ => None,
                    })
                    .flatten()
                    .collect::<Vec<_>>();
                (msg.bytes, fds)
            })
        };

        match result {
            Ok((length, fds)) => {
                buf.truncate(start + length);
                let mut queue = self.fds.borrow_mut();
                for fd in fds {
                    let fd = Fd::from(fd);
                    if flags.is_empty() {
                        set_cloexec(fd.as_raw_fd(), true)?;
                    }
                    queue.push_back(fd);
                }
                Ok(length > 0)
            }
            Err(err) => {
                buf.truncate(start);
                Err(err.into())
            }
        }
    }

    /// Split a complete frame off the read buffer.
    fn take_frame<H: FromBytes>(
        &self,
        header_len: usize,
        payload_len: fn(&H) -> Result<usize, Error>,
    ) -> Result<Option<(H, BytesMut)>, Error> {
        let mut buf = self.read_buffer.borrow_mut();
        let header = match H::read_from_prefix(&buf[..]) {
            Some(header) => header,
            None => return Ok(None),
        };
        let length = header_len + payload_len(&header)?;
        if buf.len() < length {
            return Ok(None);
        }
        let mut frame = buf.split_to(length);
        Ok(Some((header, frame.split_off(header_len))))
    }

    /// Read one frame.
    ///
    /// Without `wait` a partial frame stays buffered and `Incomplete`
    /// is returned once the socket has no more data.
    fn read_frame<H: FromBytes>(
        &self,
        header_len: usize,
        payload_len: fn(&H) -> Result<usize, Error>,
        wait: bool,
    ) -> Result<Frame<H>, Error> {
        if self.shutdown.get() {
            return Err(Errno::ENOTCONN.into());
        }
        loop {
            if let Some((header, payload)) = self.take_frame(header_len, payload_len)? {
                return Ok(Frame::Complete(header, payload));
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) if self.read_buffer.borrow().is_empty() => return Ok(Frame::Closed),
                Ok(false) => return Err(Error::Protocol("truncated message")),
                Err(Error::UnixError(Errno::EINTR)) => continue,
                Err(Error::UnixError(Errno::EAGAIN)) if wait => {
                    wait_fd(self.as_raw_fd(), Events::READ, None)?;
                }
                Err(Error::UnixError(Errno::EAGAIN)) => return Ok(Frame::Incomplete),
                Err(err) => return Err(err),
            }
        }
    }

    fn take_fd(&self, control_len: u32) -> Result<Option<Fd>, Error> {
        if control_len == 0 {
            return Ok(None);
        }
        self.fds
            .borrow_mut()
            .pop_front()
            .map(Some)
            .ok_or(Error::Protocol("missing descriptor"))
    }

    fn read_message(&self, wait: bool) -> Result<Received, Error> {
        let (header, mut payload) =
            match self.read_frame(MsgHdr::HEADER_LENGTH, MsgHdr::payload_len, wait)? {
                Frame::Complete(header, payload) => (header, payload),
                Frame::Incomplete => return Ok(Received::Incomplete),
                Frame::Closed => return Ok(Received::Closed),
            };
        let fd = self.take_fd(header.control_len)?;
        let data = payload.split_off(header.name_len as usize).freeze();

        Ok(Received::Message(Message {
            header,
            name: payload.freeze(),
            data,
            fd,
        }))
    }

    /// Receive one message, `None` if the remote end closed the channel.
    pub fn recv_message(&self) -> Result<Option<Message>, Error> {
        match self.read_message(true)? {
            Received::Message(message) => Ok(Some(message)),
            Received::Closed => Ok(None),
            Received::Incomplete => Err(Error::Protocol("incomplete message")),
        }
    }

    /// Receive one message if it arrived completely.
    pub fn try_recv_message(&self) -> Result<Received, Error> {
        self.read_message(false)
    }

    /// Receive the envelope of a request sent on this channel.
    pub fn root_read_error(&self) -> Result<RpcResult, Error> {
        let (envelope, data) =
            match self.read_frame::<Envelope>(Envelope::HEADER_LENGTH, Envelope::payload_len, true)? {
                Frame::Complete(envelope, data) => (envelope, data),
                Frame::Incomplete | Frame::Closed => {
                    return Err(Error::Protocol("connection closed"))
                }
            };
        let fd = self.take_fd(envelope.control_len)?;

        Ok(RpcResult {
            result: envelope.result,
            errno: envelope.errno,
            data: data.freeze(),
            fd,
        })
    }

    /// Send a request and wait for the envelope.
    pub fn rpc(&self, cmd: Command, id: PsId, data: &[u8]) -> Result<RpcResult, Error> {
        self.send_cmd(cmd, 0, id, data)?;
        self.root_read_error()
    }

    /// Returns true if buffered data is waiting to be processed.
    pub fn has_pending(&self) -> bool {
        !self.read_buffer.borrow().is_empty()
    }

    /// Forcefully close the imsg handler without dropping it.
    pub fn shutdown(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        self.shutdown.set(true);
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Answer the requests that arrived on a command channel.
///
/// Never waits for the peer: a partial request stays buffered and
/// replies are queued, the queue is flushed when `events` reports the
/// channel writable.  No requests are read while replies are queued.
/// Returns `false` once the remote end closed the channel.
pub fn recv_ps_msg<F>(handler: &Handler, events: Events, mut callback: F) -> Result<bool, Error>
where
    F: FnMut(&Message) -> Result<Reply, Error>,
{
    // A closed peer fails the flush.
    if handler.has_queued() && events.intersects(Events::WRITE | Events::HANGUP | Events::ERROR) {
        handler.flush()?;
    }
    // Requests buffered while replies were queued are answered now.
    if !events.intersects(Events::READ | Events::HANGUP | Events::ERROR) && !handler.has_pending()
    {
        return Ok(true);
    }

    while !handler.has_queued() {
        let message = match handler.try_recv_message()? {
            Received::Message(message) => message,
            Received::Incomplete => break,
            Received::Closed => return Ok(false),
        };

        match callback(&message) {
            Ok(reply) => handler.queue_envelope(reply)?,
            Err(err) => {
                debug!("command {:#06x} failed: {}", message.header.cmd, err);
                handler.queue_error(err.errno())?
            }
        }

        if !handler.has_pending() {
            break;
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{
        recv_ps_msg, Command, Envelope, Handler, MsgHdr, PsId, Received, Reply, MAX_DATA,
    };
    use crate::{error::Error, eloop::Events};
    use nix::errno::Errno;
    use std::{
        convert::TryFrom,
        fs::File,
        io::{Read, Seek, SeekFrom, Write},
        net::{IpAddr, Ipv4Addr},
        os::unix::net::UnixStream,
    };
    use zerocopy::AsBytes;

    /// A handler and the raw socket of its peer.
    fn raw_pair() -> (Handler, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        (Handler::new(local).unwrap(), remote)
    }

    fn frame(cmd: Command, data_len: u64, data: &[u8]) -> Vec<u8> {
        let mut header = MsgHdr::new(cmd, 0, PsId::default());
        header.data_len = data_len;
        let mut frame = header.as_bytes().to_vec();
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(MsgHdr::HEADER_LENGTH, 56);
        assert_eq!(Envelope::HEADER_LENGTH, 24);
        assert_eq!(std::mem::size_of::<PsId>(), 24);
    }

    #[test]
    fn test_psid() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let id = PsId::new(Command::BpfArp.into(), 2, Some(addr));
        assert_eq!(id.addr(), Some(addr));
        assert_eq!(PsId::default().addr(), None);
        assert_eq!(Command::try_from(0x0101).unwrap(), Command::BpfArp);
        assert!(matches!(Command::try_from(0x7777), Err(Error::NotSupported)));
    }

    #[test]
    fn test_messages() {
        let (a, b) = Handler::pair().unwrap();
        let id = PsId::new(1, 3, None);

        a.send_message(Command::Start, MsgHdr::START, id, &"manager")
            .unwrap();
        a.send_cmd(Command::BpfArp, 0, id, b"frame").unwrap();

        let message = b.recv_message().unwrap().unwrap();
        assert_eq!(message.command().unwrap(), Command::Start);
        assert_eq!(message.header.flags, MsgHdr::START);
        assert_eq!(message.header.id, id);
        assert_eq!(message.decode::<String>().unwrap(), "manager");

        // Both messages arrived with the same read.
        assert!(b.has_pending());
        let message = b.recv_message().unwrap().unwrap();
        assert_eq!(&message.data[..], b"frame");
        assert!(!b.has_pending());

        drop(a);
        assert!(b.recv_message().unwrap().is_none());
    }

    #[test]
    fn test_oversized() {
        let (a, _b) = Handler::pair().unwrap();
        let data = vec![0u8; MAX_DATA + 1];
        assert!(matches!(
            a.send_cmd(Command::Route, 0, PsId::default(), &data),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_descriptor() {
        let (a, b) = Handler::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"passed").unwrap();

        a.send_cmd(Command::Ioctl, 0, PsId::default(), b"req").unwrap();
        recv_ps_msg(&b, Events::READ, |message| {
            assert_eq!(&message.data[..], b"req");
            let fd = crate::net::Fd::from(nix::unistd::dup(
                std::os::unix::io::AsRawFd::as_raw_fd(&file),
            )?);
            Ok(Reply::fd(fd))
        })
        .unwrap();

        let result = a.root_read_error().unwrap().into_result().unwrap();
        let fd = result.fd.unwrap();
        let mut file = unsafe {
            <File as std::os::unix::io::FromRawFd>::from_raw_fd(
                std::os::unix::io::IntoRawFd::into_raw_fd(fd),
            )
        };
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut data = String::new();
        file.read_to_string(&mut data).unwrap();
        assert_eq!(data, "passed");
    }

    #[test]
    fn test_error_envelope() {
        let (a, b) = Handler::pair().unwrap();

        a.send_cmd(Command::Sysctl, 0, PsId::default(), b"").unwrap();
        recv_ps_msg(&b, Events::READ, |_| Err(Error::PermissionDenied)).unwrap();

        let result = a.root_read_error().unwrap();
        assert_eq!(result.result, -1);
        assert_eq!(result.errno, Errno::EPERM as i32);
        assert!(matches!(
            result.into_result(),
            Err(Error::UnixError(Errno::EPERM))
        ));
    }

    #[test]
    fn test_partial_header() {
        let (handler, mut peer) = raw_pair();
        let request = frame(Command::Route, 5, b"route");

        peer.write_all(&request[..20]).unwrap();
        assert!(matches!(
            handler.try_recv_message().unwrap(),
            Received::Incomplete
        ));
        let mut called = false;
        assert!(recv_ps_msg(&handler, Events::READ, |_| {
            called = true;
            Ok(Reply::result(0))
        })
        .unwrap());
        assert!(!called);

        peer.write_all(&request[20..]).unwrap();
        match handler.try_recv_message().unwrap() {
            Received::Message(message) => assert_eq!(&message.data[..], b"route"),
            received => panic!("unexpected {:?}", received),
        }
    }

    #[test]
    fn test_truncated_payload() {
        let (handler, mut peer) = raw_pair();
        let request = frame(Command::Route, 5, b"route");

        peer.write_all(&request[..request.len() - 3]).unwrap();
        assert!(matches!(
            handler.try_recv_message().unwrap(),
            Received::Incomplete
        ));

        // Closing in the middle of a frame fails instead of waiting.
        drop(peer);
        assert!(matches!(
            handler.recv_message(),
            Err(Error::Protocol("truncated message"))
        ));
    }

    #[test]
    fn test_closed_in_header() {
        let (handler, mut peer) = raw_pair();
        peer.write_all(&frame(Command::Route, 0, &[])[..10]).unwrap();
        drop(peer);
        assert!(matches!(
            recv_ps_msg(&handler, Events::READ, |_| Ok(Reply::result(0))),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_length() {
        for length in [MAX_DATA as u64 + 1, u64::MAX] {
            let (handler, mut peer) = raw_pair();
            peer.write_all(&frame(Command::Route, length, &[])).unwrap();
            assert!(matches!(
                handler.try_recv_message(),
                Err(Error::Protocol("oversized message"))
            ));
        }

        let (handler, mut peer) = raw_pair();
        peer.write_all(&frame(Command::Route, MAX_DATA as u64 + 1, &[]))
            .unwrap();
        assert!(recv_ps_msg(&handler, Events::READ, |_| Ok(Reply::result(0))).is_err());
    }

    #[test]
    fn test_queue_full() {
        let (a, b) = Handler::pair().unwrap();
        let data = [0x5au8; 98];

        // The peer does not read, queueing fails instead of waiting.
        let mut queued = 0;
        loop {
            let header = MsgHdr::new(Command::BpfArp, 0, PsId::default());
            match a.queue_msg(header, None, &[], &data) {
                Ok(()) => queued += 1,
                Err(Error::ResourceExhausted(_)) => break,
                Err(err) => panic!("queue: {}", err),
            }
        }
        assert!(a.has_queued());

        let mut received = 0;
        while received < queued {
            a.flush().unwrap();
            while let Received::Message(message) = b.try_recv_message().unwrap() {
                assert_eq!(&message.data[..], &data[..]);
                received += 1;
            }
        }
        assert_eq!(received, queued);
        assert!(!a.has_queued());
    }
}
