//! Control socket server for administrative clients.
//!
//! The daemon listens on a privileged socket (mode 0660) and an
//! unprivileged one (mode 0666).  Each read from a client must contain
//! complete commands, see [`frame`].  Replies are queued per client and
//! written when the socket becomes writable.
//!
//! With privilege separation the Control process runs in proxy mode:
//! it validates the commands of its clients and forwards them as
//! [`CtlFrame`]s.  The Manager feeds these into [`Control::recv_relayed`],
//! which creates relayed clients whose replies are length-prefixed and
//! sent back through a [`RelaySink`].

mod frame;

pub use frame::{encode_argv, parse_argv, parse_frames};

use crate::{
    eloop::{Eloop, Events},
    error::Error,
    net::set_cloexec,
    privsep::imsg::Command,
};
use log::{debug, error, warn};
use nix::{errno::Errno, sys::uio::writev};
use serde_derive::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    fs::{self, Permissions},
    io::{self, IoSlice, Read},
    mem,
    os::unix::{
        fs::PermissionsExt,
        io::{AsRawFd, RawFd},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    rc::Rc,
};

/// Maximum number of queued replies per client.
pub const CONTROL_QUEUE_MAX: usize = 100;

/// Largest read from a client.
const CONTROL_BUFFER: usize = 4096;

/// Reply to `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Address family suffix of a per-interface socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Returns `<rundir>/dhcpcd[-ifname][-4|-6][.unpriv].sock`.
pub fn socket_path(
    rundir: &Path,
    ifname: Option<&str>,
    family: Option<Family>,
    unprivileged: bool,
) -> PathBuf {
    let mut name = "dhcpcd".to_string();
    if let Some(ifname) = ifname {
        name.push('-');
        name.push_str(ifname);
    }
    match family {
        Some(Family::V4) => name.push_str("-4"),
        Some(Family::V6) => name.push_str("-6"),
        None => {}
    }
    if unprivileged {
        name.push_str(".unpriv");
    }
    name.push_str(".sock");
    rundir.join(name)
}

/// A command forwarded between the Control and Manager processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlFrame {
    /// Client id in the Control process.
    pub client: u64,
    pub unprivileged: bool,
    pub data: Vec<u8>,
}

/// Runs a command of a privileged client.
pub type CommandHandler = Rc<dyn Fn(&mut Eloop, &Control, u64, &[String]) -> Result<(), Error>>;

/// Forwards a client's commands (`Ctl`) or disconnect (`CtlEof`).
pub type ProxySink = Rc<dyn Fn(Command, &CtlFrame) -> Result<(), Error>>;

/// Sends reply data to a remote client.
pub type RelaySink = Rc<dyn Fn(u64, &[u8]) -> Result<(), Error>>;

/// Client flags.
pub const LISTEN: u32 = 0x01;
pub const UNPRIVILEGED: u32 = 0x02;
pub const SEND_LEN: u32 = 0x04;

enum ClientIo {
    Socket(UnixStream),
    /// Remote client id.
    Relay(u64),
}

/// A queued reply.
struct Buffer {
    /// Prefix the data with its native-width length.
    send_len: bool,
    data: Vec<u8>,
    /// Bytes of prefix and data that were written.
    written: usize,
}

impl Buffer {
    fn len(&self) -> usize {
        self.prefix().len() + self.data.len()
    }

    fn prefix(&self) -> Vec<u8> {
        if self.send_len {
            self.data.len().to_ne_bytes().to_vec()
        } else {
            vec![]
        }
    }
}

struct Client {
    io: ClientIo,
    flags: u32,
    queue: VecDeque<Buffer>,
}

struct Listener {
    socket: UnixListener,
    path: PathBuf,
    unprivileged: bool,
}

#[derive(Default)]
struct Inner {
    listeners: Vec<Listener>,
    clients: BTreeMap<u64, Client>,
    relayed: BTreeMap<u64, u64>,
    next_id: u64,
    free: Vec<Vec<u8>>,
    handler: Option<CommandHandler>,
    proxy: Option<ProxySink>,
    relay: Option<RelaySink>,
}

/// Shared handle to the control sockets and their clients.
#[derive(Clone, Default)]
pub struct Control(Rc<RefCell<Inner>>);

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: CommandHandler) {
        self.0.borrow_mut().handler = Some(handler);
    }

    /// Forward all client commands instead of running them.
    pub fn set_proxy(&self, sink: ProxySink) {
        self.0.borrow_mut().proxy = Some(sink);
    }

    /// Send the replies of relayed clients.
    pub fn set_relay(&self, sink: RelaySink) {
        self.0.borrow_mut().relay = Some(sink);
    }

    /// Bind the privileged and unprivileged sockets.
    pub fn listen(
        &self,
        eloop: &mut Eloop,
        rundir: &Path,
        ifname: Option<&str>,
        family: Option<Family>,
    ) -> Result<(), Error> {
        for unprivileged in [false, true] {
            let path = socket_path(rundir, ifname, family, unprivileged);
            let mode = if unprivileged { 0o666 } else { 0o660 };

            match fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
            let socket = UnixListener::bind(&path)?;
            socket.set_nonblocking(true)?;
            set_cloexec(socket.as_raw_fd(), true)?;
            fs::set_permissions(&path, Permissions::from_mode(mode))?;

            let fd = socket.as_raw_fd();
            let control = self.clone();
            eloop.add_fd(fd, Events::READ, move |eloop, _| control.accept(eloop, fd))?;
            debug!("control: listening on {}", path.display());

            self.0.borrow_mut().listeners.push(Listener {
                socket,
                path,
                unprivileged,
            });
        }
        Ok(())
    }

    /// Paths of the bound sockets.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.0
            .borrow()
            .listeners
            .iter()
            .map(|listener| listener.path.clone())
            .collect()
    }

    /// Close all sockets and clients.
    pub fn close(&self, eloop: &mut Eloop) {
        let ids = self.0.borrow().clients.keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.disconnect(eloop, id);
        }
        let listeners = mem::take(&mut self.0.borrow_mut().listeners);
        for listener in listeners {
            let _ = eloop.delete_fd(listener.socket.as_raw_fd());
            let _ = fs::remove_file(&listener.path);
        }
    }

    fn accept(&self, eloop: &mut Eloop, fd: RawFd) {
        loop {
            let result = {
                let inner = self.0.borrow();
                match inner
                    .listeners
                    .iter()
                    .find(|listener| listener.socket.as_raw_fd() == fd)
                {
                    Some(listener) => listener
                        .socket
                        .accept()
                        .map(|(stream, _)| (stream, listener.unprivileged)),
                    None => return,
                }
            };
            match result {
                Ok((stream, unprivileged)) => {
                    if let Err(err) = self.add_client(eloop, stream, unprivileged) {
                        error!("control: accept: {}", err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("control: accept: {}", err);
                    return;
                }
            }
        }
    }

    /// Register a connected client stream, returns its id.
    pub fn add_client(
        &self,
        eloop: &mut Eloop,
        stream: UnixStream,
        unprivileged: bool,
    ) -> Result<u64, Error> {
        stream.set_nonblocking(true)?;
        set_cloexec(stream.as_raw_fd(), true)?;
        let fd = stream.as_raw_fd();

        let id = {
            let mut inner = self.0.borrow_mut();
            inner.next_id += 1;
            inner.next_id
        };
        let control = self.clone();
        eloop.add_fd(fd, Events::READ, move |eloop, events| {
            control.handle_client(eloop, id, events)
        })?;

        self.0.borrow_mut().clients.insert(
            id,
            Client {
                io: ClientIo::Socket(stream),
                flags: if unprivileged { UNPRIVILEGED } else { 0 },
                queue: VecDeque::new(),
            },
        );
        debug!("control: client {} connected", id);
        Ok(id)
    }

    pub fn client_count(&self) -> usize {
        self.0.borrow().clients.len()
    }

    pub fn flags(&self, client: u64) -> Option<u32> {
        self.0.borrow().clients.get(&client).map(|client| client.flags)
    }

    pub fn queue_len(&self, client: u64) -> usize {
        self.0
            .borrow()
            .clients
            .get(&client)
            .map(|client| client.queue.len())
            .unwrap_or(0)
    }

    /// Remove a client and release its buffers.
    pub fn disconnect(&self, eloop: &mut Eloop, client: u64) {
        let (removed, proxy) = {
            let mut inner = self.0.borrow_mut();
            let mut removed = match inner.clients.remove(&client) {
                Some(removed) => removed,
                None => return,
            };
            for buf in removed.queue.drain(..) {
                inner.release(buf.data);
            }
            if let ClientIo::Relay(remote) = removed.io {
                inner.relayed.remove(&remote);
            }
            (removed, inner.proxy.clone())
        };

        if let ClientIo::Socket(stream) = &removed.io {
            let _ = eloop.delete_fd(stream.as_raw_fd());
            if let Some(proxy) = proxy {
                let frame = CtlFrame {
                    client,
                    unprivileged: removed.flags & UNPRIVILEGED != 0,
                    data: vec![],
                };
                if let Err(err) = proxy(Command::CtlEof, &frame) {
                    error!("control: forward disconnect: {}", err);
                }
            }
        }
        debug!("control: client {} disconnected", client);
    }

    fn handle_client(&self, eloop: &mut Eloop, client: u64, events: Events) {
        if events.contains(Events::WRITE) {
            self.write_client(eloop, client);
        }
        if events.intersects(Events::READ | Events::HANGUP | Events::ERROR) {
            self.read_client(eloop, client);
        }
    }

    fn read_client(&self, eloop: &mut Eloop, client: u64) {
        let mut buf = [0u8; CONTROL_BUFFER];
        let result = loop {
            let result = match self.0.borrow_mut().clients.get_mut(&client) {
                Some(Client {
                    io: ClientIo::Socket(stream),
                    ..
                }) => stream.read(&mut buf),
                _ => return,
            };
            match result {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => break result,
            }
        };

        match result {
            Ok(0) => self.disconnect(eloop, client),
            Ok(length) => self.handle_data(eloop, client, &buf[..length]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                if !is_disconnect(&err) {
                    error!("control: client {}: {}", client, err);
                }
                self.disconnect(eloop, client);
            }
        }
    }

    fn handle_data(&self, eloop: &mut Eloop, client: u64, data: &[u8]) {
        let commands = match parse_frames(data) {
            Ok(commands) => commands,
            Err(err) => {
                warn!("control: client {}: {}", client, err);
                self.disconnect(eloop, client);
                return;
            }
        };

        let (proxy, flags) = {
            let inner = self.0.borrow();
            let flags = match inner.clients.get(&client) {
                Some(client) => client.flags,
                None => return,
            };
            (inner.proxy.clone(), flags)
        };

        if let Some(proxy) = proxy {
            let frame = CtlFrame {
                client,
                unprivileged: flags & UNPRIVILEGED != 0,
                data: data.to_vec(),
            };
            if let Err(err) = proxy(Command::Ctl, &frame) {
                error!("control: forward: {}", err);
            }
            return;
        }

        for argv in commands {
            if self.flags(client).is_none() {
                break;
            }
            if let Err(err) = self.dispatch(eloop, client, &argv) {
                warn!("control: {}: {}", argv[0], err);
            }
        }
    }

    fn dispatch(&self, eloop: &mut Eloop, client: u64, argv: &[String]) -> Result<(), Error> {
        match argv[0].as_str() {
            "--version" => {
                let mut reply = VERSION.as_bytes().to_vec();
                reply.push(0);
                self.send(eloop, client, &reply)
            }
            "--listen" => {
                if let Some(client) = self.0.borrow_mut().clients.get_mut(&client) {
                    client.flags |= LISTEN;
                }
                Ok(())
            }
            _ => {
                if self.flags(client).unwrap_or(UNPRIVILEGED) & UNPRIVILEGED != 0 {
                    return Err(Error::PermissionDenied);
                }
                let handler = self.0.borrow().handler.clone();
                match handler {
                    Some(handler) => handler(eloop, self, client, argv),
                    None => Err(Error::NotSupported),
                }
            }
        }
    }

    /// Queue a reply; listening clients receive a copy.
    pub fn send(&self, eloop: &mut Eloop, client: u64, data: &[u8]) -> Result<(), Error> {
        self.enqueue(eloop, client, data, true)?;

        let listeners = self
            .0
            .borrow()
            .clients
            .iter()
            .filter(|(id, other)| **id != client && other.flags & LISTEN != 0)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for listener in listeners {
            if let Err(err) = self.enqueue(eloop, listener, data, true) {
                warn!("control: listener {}: {}", listener, err);
            }
        }
        Ok(())
    }

    /// Send an event to all listening clients.
    pub fn broadcast(&self, eloop: &mut Eloop, data: &[u8]) {
        let listeners = self
            .0
            .borrow()
            .clients
            .iter()
            .filter(|(_, client)| client.flags & LISTEN != 0)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for listener in listeners {
            if let Err(err) = self.enqueue(eloop, listener, data, true) {
                warn!("control: listener {}: {}", listener, err);
            }
        }
    }

    /// Queue data that was already framed by the Manager.
    pub fn deliver(&self, eloop: &mut Eloop, client: u64, data: &[u8]) -> Result<(), Error> {
        self.enqueue(eloop, client, data, false)
    }

    fn enqueue(&self, eloop: &mut Eloop, client: u64, data: &[u8], framed: bool) -> Result<(), Error> {
        let (fd, relay) = {
            let mut guard = self.0.borrow_mut();
            let inner = &mut *guard;
            let entry = inner.clients.get_mut(&client).ok_or(Error::NotFound)?;
            if entry.queue.len() >= CONTROL_QUEUE_MAX {
                return Err(Error::ResourceExhausted("control queue"));
            }

            let mut buf = inner.free.pop().unwrap_or_default();
            buf.extend_from_slice(data);
            entry.queue.push_back(Buffer {
                send_len: framed && entry.flags & SEND_LEN != 0,
                data: buf,
                written: 0,
            });

            match entry.io {
                ClientIo::Socket(ref stream) => (Some(stream.as_raw_fd()), None),
                ClientIo::Relay(remote) => (None, Some(remote)),
            }
        };

        if let Some(fd) = fd {
            eloop.update_fd(fd, Events::READ | Events::WRITE)?;
        }
        if let Some(remote) = relay {
            self.flush_relay(eloop, client, remote);
        }
        Ok(())
    }

    /// Write the first queued buffer of a client.
    fn write_client(&self, eloop: &mut Eloop, client: u64) {
        let result = {
            let mut guard = self.0.borrow_mut();
            let inner = &mut *guard;
            let entry = match inner.clients.get_mut(&client) {
                Some(entry) => entry,
                None => return,
            };
            let fd = match entry.io {
                ClientIo::Socket(ref stream) => stream.as_raw_fd(),
                ClientIo::Relay(_) => return,
            };
            match entry.queue.front_mut() {
                None => Ok((true, fd)),
                Some(buf) => match write_buffer(fd, buf) {
                    Ok(length) if buf.written + length < buf.len() => {
                        buf.written += length;
                        Ok((false, fd))
                    }
                    Ok(_) => {
                        if let Some(buf) = entry.queue.pop_front() {
                            let empty = entry.queue.is_empty();
                            inner.release(buf.data);
                            Ok((empty, fd))
                        } else {
                            Ok((true, fd))
                        }
                    }
                    Err(err) => Err(err),
                },
            }
        };

        match result {
            Ok((true, fd)) => {
                if let Err(err) = eloop.update_fd(fd, Events::READ) {
                    error!("control: client {}: {}", client, err);
                }
            }
            Ok((false, _)) => {}
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(err) => {
                if !is_disconnect(&io::Error::from(err)) {
                    error!("control: client {}: {}", client, err);
                }
                self.disconnect(eloop, client);
            }
        }
    }

    fn flush_relay(&self, eloop: &mut Eloop, client: u64, remote: u64) {
        let (bufs, sink) = {
            let mut inner = self.0.borrow_mut();
            let bufs = match inner.clients.get_mut(&client) {
                Some(entry) => entry.queue.drain(..).collect::<Vec<_>>(),
                None => return,
            };
            (bufs, inner.relay.clone())
        };
        let sink = match sink {
            Some(sink) => sink,
            None => {
                error!("control: no relay for client {}", client);
                self.disconnect(eloop, client);
                return;
            }
        };

        for buf in bufs {
            let mut frame = buf.prefix();
            frame.extend_from_slice(&buf.data);
            if let Err(err) = sink(remote, &frame) {
                error!("control: relay to {}: {}", remote, err);
                self.disconnect(eloop, client);
                return;
            }
            self.0.borrow_mut().release(buf.data);
        }
    }

    /// Run the commands of a client of the Control process.
    pub fn recv_relayed(&self, eloop: &mut Eloop, frame: &CtlFrame) {
        let client = {
            let mut inner = self.0.borrow_mut();
            match inner.relayed.get(&frame.client) {
                Some(client) => *client,
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    let mut flags = SEND_LEN;
                    if frame.unprivileged {
                        flags |= UNPRIVILEGED;
                    }
                    inner.clients.insert(
                        id,
                        Client {
                            io: ClientIo::Relay(frame.client),
                            flags,
                            queue: VecDeque::new(),
                        },
                    );
                    inner.relayed.insert(frame.client, id);
                    id
                }
            }
        };
        self.handle_data(eloop, client, &frame.data);
    }

    /// A client of the Control process disconnected.
    pub fn drop_relayed(&self, eloop: &mut Eloop, remote: u64) {
        let client = self.0.borrow().relayed.get(&remote).copied();
        if let Some(client) = client {
            self.disconnect(eloop, client);
        }
    }
}

impl Inner {
    /// Return a buffer to the free pool.
    fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < CONTROL_QUEUE_MAX {
            buf.clear();
            self.free.push(buf);
        }
    }
}

/// Write the rest of a buffer, the length prefix and the data in one call.
fn write_buffer(fd: RawFd, buf: &Buffer) -> Result<usize, Errno> {
    let prefix = buf.prefix();
    let (prefix, data) = if buf.written < prefix.len() {
        (&prefix[buf.written..], &buf.data[..])
    } else {
        (&prefix[..0], &buf.data[buf.written - prefix.len()..])
    };
    writev(fd, &[IoSlice::new(prefix), IoSlice::new(data)])
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_i32),
        Some(Errno::EPIPE) | Some(Errno::ENOTCONN) | Some(Errno::ECONNRESET)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eloop::ALL_QUEUES;
    use std::{
        cell::Cell,
        io::{Read, Write},
    };

    /// Dispatch descriptors for a moment.
    fn run_once(eloop: &mut Eloop) {
        eloop
            .add_timeout(ALL_QUEUES, 0, 100_000_000, "control_test", 0, |eloop| {
                eloop.exit(0)
            })
            .unwrap();
        eloop.run();
    }

    #[test]
    fn test_socket_path() {
        let rundir = Path::new("/var/run/dhcpcd");
        assert_eq!(
            socket_path(rundir, None, None, false),
            rundir.join("dhcpcd.sock")
        );
        assert_eq!(
            socket_path(rundir, Some("eth0"), Some(Family::V4), true),
            rundir.join("dhcpcd-eth0-4.unpriv.sock")
        );
        assert_eq!(
            socket_path(rundir, Some("eth0"), Some(Family::V6), false),
            rundir.join("dhcpcd-eth0-6.sock")
        );
    }

    #[test]
    fn test_listen() {
        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();

        // Stale sockets are replaced.
        fs::write(dir.path().join("dhcpcd.sock"), b"").unwrap();
        control.listen(&mut eloop, dir.path(), None, None).unwrap();

        let modes = control
            .paths()
            .iter()
            .map(|path| fs::metadata(path).unwrap().permissions().mode() & 0o777)
            .collect::<Vec<_>>();
        assert_eq!(modes, vec![0o660, 0o666]);

        control.close(&mut eloop);
        assert!(!dir.path().join("dhcpcd.sock").exists());
        assert_eq!(eloop.fd_count(), 0);
    }

    #[test]
    fn test_version() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (mut peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, true).unwrap();

        peer.write_all(&encode_argv(&["--version"])).unwrap();
        run_once(&mut eloop);
        run_once(&mut eloop);

        let mut reply = vec![0u8; VERSION.len() + 1];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[..VERSION.len()], VERSION.as_bytes());
        assert_eq!(reply[VERSION.len()], 0);
        assert_eq!(control.queue_len(client), 0);
        assert_eq!(eloop.interest(peer_fd(&control, client)), Some(Events::READ));
    }

    fn peer_fd(control: &Control, client: u64) -> RawFd {
        match control.0.borrow().clients.get(&client).map(|client| &client.io) {
            Some(ClientIo::Socket(stream)) => stream.as_raw_fd(),
            _ => -1,
        }
    }

    #[test]
    fn test_unprivileged() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let called = Rc::new(Cell::new(0));
        control.set_handler({
            let called = called.clone();
            Rc::new(move |_, _, _, _| {
                called.set(called.get() + 1);
                Ok(())
            })
        });

        let (mut peer, stream) = UnixStream::pair().unwrap();
        let unprivileged = control.add_client(&mut eloop, stream, true).unwrap();
        let (mut other, stream) = UnixStream::pair().unwrap();
        control.add_client(&mut eloop, stream, false).unwrap();

        peer.write_all(&encode_argv(&["--rebind", "eth0"])).unwrap();
        peer.write_all(&encode_argv(&["--listen"])).unwrap();
        run_once(&mut eloop);
        assert_eq!(called.get(), 0);
        assert_eq!(control.flags(unprivileged), Some(UNPRIVILEGED | LISTEN));

        other.write_all(&encode_argv(&["--rebind", "eth0"])).unwrap();
        run_once(&mut eloop);
        assert_eq!(called.get(), 1);
    }

    #[test]
    fn test_malformed() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (mut peer, stream) = UnixStream::pair().unwrap();
        let (_other, stream2) = UnixStream::pair().unwrap();
        control.add_client(&mut eloop, stream, false).unwrap();
        let other = control.add_client(&mut eloop, stream2, false).unwrap();

        peer.write_all(b"--version\0").unwrap();
        run_once(&mut eloop);

        // Only the offending client is dropped.
        assert_eq!(control.client_count(), 1);
        assert!(control.flags(other).is_some());
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_queue_bound() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (_peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, false).unwrap();

        for _ in 0..CONTROL_QUEUE_MAX {
            control.send(&mut eloop, client, b"event\0").unwrap();
        }
        assert!(matches!(
            control.send(&mut eloop, client, b"event\0"),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(control.queue_len(client), CONTROL_QUEUE_MAX);
    }

    #[test]
    fn test_free_pool() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (mut peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, false).unwrap();

        control.send(&mut eloop, client, b"one\0").unwrap();
        control.send(&mut eloop, client, b"two\0").unwrap();
        run_once(&mut eloop);
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"one\0two\0");
        assert_eq!(control.0.borrow().free.len(), 2);

        // Rejected replies leave the pool alone.
        assert!(matches!(
            control.send(&mut eloop, 99, b"lost\0"),
            Err(Error::NotFound)
        ));
        assert_eq!(control.0.borrow().free.len(), 2);
        for _ in 0..CONTROL_QUEUE_MAX {
            control.send(&mut eloop, client, b"event\0").unwrap();
        }
        control.0.borrow_mut().free.push(Vec::with_capacity(64));
        assert!(matches!(
            control.send(&mut eloop, client, b"event\0"),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(control.0.borrow().free.len(), 1);
    }

    #[test]
    fn test_length_prefix() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (mut peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, false).unwrap();
        control.0.borrow_mut().clients.get_mut(&client).unwrap().flags |= SEND_LEN;

        control.send(&mut eloop, client, b"reply\0").unwrap();
        control.deliver(&mut eloop, client, b"raw").unwrap();
        run_once(&mut eloop);
        run_once(&mut eloop);

        let mut expected = 6usize.to_ne_bytes().to_vec();
        expected.extend_from_slice(b"reply\0raw");
        let mut buf = vec![0u8; expected.len()];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, expected);
        assert_eq!(control.queue_len(client), 0);
    }

    #[test]
    fn test_listeners() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let (_peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, false).unwrap();
        let (_listener, stream) = UnixStream::pair().unwrap();
        let listener = control.add_client(&mut eloop, stream, true).unwrap();
        control.0.borrow_mut().clients.get_mut(&listener).unwrap().flags |= LISTEN;

        control.send(&mut eloop, client, b"reply\0").unwrap();
        control.broadcast(&mut eloop, b"event\0");
        assert_eq!(control.queue_len(client), 1);
        assert_eq!(control.queue_len(listener), 2);
    }

    #[test]
    fn test_relayed() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let replies = Rc::new(RefCell::new(vec![]));
        control.set_relay({
            let replies = replies.clone();
            Rc::new(move |remote, data| {
                replies.borrow_mut().push((remote, data.to_vec()));
                Ok(())
            })
        });

        let frame = CtlFrame {
            client: 7,
            unprivileged: true,
            data: encode_argv(&["--version"]),
        };
        control.recv_relayed(&mut eloop, &frame);
        control.recv_relayed(&mut eloop, &frame);
        assert_eq!(control.client_count(), 1);

        let mut expected = (VERSION.len() + 1).to_ne_bytes().to_vec();
        expected.extend_from_slice(VERSION.as_bytes());
        expected.push(0);
        assert_eq!(*replies.borrow(), vec![(7, expected.clone()), (7, expected)]);

        control.drop_relayed(&mut eloop, 7);
        assert_eq!(control.client_count(), 0);
    }

    #[test]
    fn test_proxy() {
        let mut eloop = Eloop::new().unwrap();
        let control = Control::new();
        let forwarded = Rc::new(RefCell::new(vec![]));
        control.set_proxy({
            let forwarded = forwarded.clone();
            Rc::new(move |cmd, frame: &CtlFrame| {
                forwarded.borrow_mut().push((cmd, frame.clone()));
                Ok(())
            })
        });

        let (mut peer, stream) = UnixStream::pair().unwrap();
        let client = control.add_client(&mut eloop, stream, false).unwrap();
        peer.write_all(&encode_argv(&["--version"])).unwrap();
        run_once(&mut eloop);
        drop(peer);
        run_once(&mut eloop);

        let forwarded = forwarded.borrow();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].0, Command::Ctl);
        assert_eq!(forwarded[0].1.client, client);
        assert_eq!(forwarded[0].1.data, encode_argv(&["--version"]));
        assert_eq!(forwarded[1].0, Command::CtlEof);
        assert_eq!(control.client_count(), 0);
    }
}
