//! Privilege separation.
//!
//! The daemon runs as four processes: the privileged `root` process
//! and the unprivileged `manager`, `inet` and `control` processes.
//! Root forks and executes the others, each with two channels:
//!
//! - the command channel on [`PRIVSEP_FD`] carries requests to the
//!   root process, every request is answered with an envelope;
//! - the data channel on [`DATA_FD`] carries the start and stop
//!   messages and the traffic that root routes between the children.
//!
//! Root only runs the operations of its [`RootDispatcher`] and only
//! for the roles that need them.

mod ctl;
pub mod imsg;
mod inet;
mod process;
pub mod root;

pub use ctl::run_control;
pub use inet::{run_inet, Inet};
pub use process::{drop_privileges, spawn, Child};
pub use root::{RootClient, RootDispatcher};

use crate::{
    control::socket_path,
    eloop::{Eloop, Events},
    error::Error,
    options::Options,
};
use dhcpcd_derive::Privsep;
use imsg::{recv_ps_msg, Command, Handler, Message, MsgHdr, PsId, Received};
use log::{debug, error, info, warn};
use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{getuid, Pid},
};
use serde_derive::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

/// Command channel of a child process.
pub const PRIVSEP_FD: RawFd = 3;

/// Data channel of a child process.
pub const DATA_FD: RawFd = 4;

/// Process roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Privsep)]
#[username = "_dhcpcd"]
pub enum Role {
    /// Privileged process.
    Root,
    /// Runs the protocol logic.
    Manager,
    /// Owns the raw network sockets.
    Inet,
    /// Proxies the control sockets.
    Control,
}

impl Role {
    /// Identity of the role's process.
    pub fn id(&self) -> PsId {
        PsId::new(u16::from(*self), 0, None)
    }
}

/// Payload of the start message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInfo {
    pub role: u16,
    pub name: String,
    pub options: Options,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Forked and channels registered.
    Started,
    /// The start message was sent.
    Dispatching,
    StopRequested,
    /// The channels were closed, waiting to be reaped.
    Stopped,
}

/// A child process from the root point of view.
#[derive(Debug)]
pub struct Process {
    pub role: Role,
    pub id: PsId,
    pub pid: Pid,
    pub cmd: Rc<Handler>,
    pub data: Rc<Handler>,
    pub state: State,
}

#[derive(Debug)]
struct Supervisor {
    options: Options,
    dispatcher: RootDispatcher,
    processes: BTreeMap<Role, Process>,
    exiting: bool,
    exitcode: i32,
}

/// The process supervisor and message hub of the root process.
#[derive(Debug, Clone)]
pub struct Privsep(Rc<RefCell<Supervisor>>);

impl Privsep {
    pub fn new(options: Options) -> Self {
        Self(Rc::new(RefCell::new(Supervisor {
            dispatcher: RootDispatcher::new(options.clone()),
            options,
            processes: BTreeMap::new(),
            exiting: false,
            exitcode: 0,
        })))
    }

    /// Start the unprivileged processes.
    pub fn start(&self, eloop: &mut Eloop) -> Result<(), Error> {
        let privsep = self.clone();
        eloop.signal_handler(
            &[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT],
            move |eloop, signal| privsep.handle_signal(eloop, signal),
        )?;

        for role in [Role::Control, Role::Inet, Role::Manager] {
            let (pid, cmd, data) = spawn(role)?;
            self.add_process(eloop, role, pid, cmd, data)?;
        }
        Ok(())
    }

    /// Register the channels of a new process and send it the start message.
    pub fn add_process(
        &self,
        eloop: &mut Eloop,
        role: Role,
        pid: Pid,
        cmd: Handler,
        data: Handler,
    ) -> Result<(), Error> {
        if role == Role::Root || self.0.borrow().processes.contains_key(&role) {
            return Err(Error::InvalidArgument("process exists"));
        }
        let cmd = Rc::new(cmd);
        let data = Rc::new(data);

        let privsep = self.clone();
        eloop.add_fd(cmd.as_raw_fd(), Events::READ, move |eloop, events| {
            privsep.handle_cmd(eloop, role, events)
        })?;
        let privsep = self.clone();
        if let Err(err) = eloop.add_fd(data.as_raw_fd(), Events::READ, move |eloop, events| {
            privsep.handle_data(eloop, role, events)
        }) {
            let _ = eloop.delete_fd(cmd.as_raw_fd());
            return Err(err);
        }

        self.0.borrow_mut().processes.insert(
            role,
            Process {
                role,
                id: role.id(),
                pid,
                cmd,
                data: data.clone(),
                state: State::Started,
            },
        );

        let options = self.0.borrow().options.clone();
        Child::start(&data, role, &options)?;
        self.set_state(role, State::Dispatching);
        info!("{}: started process {}", role.name(), pid);

        Ok(())
    }

    pub fn state(&self, role: Role) -> Option<State> {
        self.0
            .borrow()
            .processes
            .get(&role)
            .map(|process| process.state)
    }

    pub fn process_count(&self) -> usize {
        self.0.borrow().processes.len()
    }

    pub fn is_exiting(&self) -> bool {
        self.0.borrow().exiting
    }

    fn set_state(&self, role: Role, state: State) {
        if let Some(process) = self.0.borrow_mut().processes.get_mut(&role) {
            process.state = state;
        }
    }

    fn handle_signal(&self, eloop: &mut Eloop, signal: Signal) {
        match signal {
            Signal::SIGCHLD => self.reap(eloop),
            Signal::SIGTERM | Signal::SIGINT => {
                info!("received {}, stopping", signal);
                self.shutdown(eloop);
            }
            _ => {}
        }
    }

    /// Collect the exit status of terminated processes.
    ///
    /// Only our own processes are waited for; script processes are
    /// waited for by the code that spawned them.
    fn reap(&self, eloop: &mut Eloop) {
        let pids = self
            .0
            .borrow()
            .processes
            .values()
            .map(|process| (process.role, process.pid))
            .collect::<Vec<_>>();

        for (role, pid) in pids {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => self.exited(eloop, role, code),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.exited(eloop, role, 128 + signal as i32)
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => self.exited(eloop, role, -1),
                Err(err) => error!("{}: waitpid: {}", role.name(), err),
            }
        }
    }

    /// Forget a terminated process.
    pub fn exited(&self, eloop: &mut Eloop, role: Role, code: i32) {
        let process = match self.0.borrow_mut().processes.remove(&role) {
            Some(process) => process,
            None => return,
        };
        let _ = eloop.delete_fd(process.cmd.as_raw_fd());
        let _ = eloop.delete_fd(process.data.as_raw_fd());

        if process.state == State::StopRequested {
            debug!("{}({}): exited with status {}", role.name(), process.pid, code);
        } else {
            warn!(
                "{}({}): unexpected exit with status {}",
                role.name(),
                process.pid,
                code
            );
        }

        let (exiting, remaining, exitcode) = {
            let mut supervisor = self.0.borrow_mut();
            if role == Role::Manager {
                supervisor.exitcode = code.max(0);
            }
            (
                supervisor.exiting,
                supervisor.processes.len(),
                supervisor.exitcode,
            )
        };

        if role == Role::Manager && !exiting {
            self.shutdown(eloop);
        } else if exiting && remaining == 0 {
            eloop.exit(exitcode);
        }
    }

    /// Ask all processes to stop; the loop exits after the last one.
    pub fn shutdown(&self, eloop: &mut Eloop) {
        let processes = {
            let mut supervisor = self.0.borrow_mut();
            supervisor.exiting = true;
            supervisor
                .processes
                .values()
                .filter(|process| {
                    process.state != State::StopRequested && process.state != State::Stopped
                })
                .map(|process| (process.role, process.id, process.data.clone()))
                .collect::<Vec<_>>()
        };

        for (role, id, data) in processes {
            let header = MsgHdr::new(Command::Stop, MsgHdr::STOP, id);
            match data.queue_msg(header, None, &[], &[]) {
                Ok(()) => {
                    watch_queue(eloop, &data, Events::READ);
                    self.set_state(role, State::StopRequested)
                }
                Err(err) => warn!("{}: stop: {}", role.name(), err),
            }
        }

        let (remaining, exitcode) = {
            let supervisor = self.0.borrow();
            (supervisor.processes.len(), supervisor.exitcode)
        };
        if remaining == 0 {
            eloop.exit(exitcode);
        }
    }

    fn handle_cmd(&self, eloop: &mut Eloop, role: Role, events: Events) {
        let (cmd, dispatcher) = {
            let supervisor = self.0.borrow();
            match supervisor.processes.get(&role) {
                Some(process) => (process.cmd.clone(), supervisor.dispatcher.clone()),
                None => return,
            }
        };

        let result = recv_ps_msg(&cmd, events, |message| {
            dispatcher.dispatch(role, message.command()?, &message.header.id, &message.data)
        });
        match result {
            // Requests wait until the replies were written.
            Ok(true) if cmd.has_queued() => watch_queue(eloop, &cmd, Events::empty()),
            Ok(true) => watch_queue(eloop, &cmd, Events::READ),
            Ok(false) => self.channel_closed(eloop, role),
            Err(err) => {
                error!("{}: command channel: {}", role.name(), err);
                self.channel_closed(eloop, role);
            }
        }
    }

    fn handle_data(&self, eloop: &mut Eloop, role: Role, events: Events) {
        let data = match self.0.borrow().processes.get(&role) {
            Some(process) => process.data.clone(),
            None => return,
        };

        if events.contains(Events::WRITE) {
            if let Err(err) = data.flush() {
                error!("{}: data channel: {}", role.name(), err);
                self.channel_closed(eloop, role);
                return;
            }
            watch_queue(eloop, &data, Events::READ);
        }
        if !events.intersects(Events::READ | Events::HANGUP | Events::ERROR) {
            return;
        }

        loop {
            match data.try_recv_message() {
                Ok(Received::Message(message)) => self.route(eloop, role, message),
                Ok(Received::Incomplete) => return,
                Ok(Received::Closed) => {
                    self.channel_closed(eloop, role);
                    return;
                }
                Err(err) => {
                    error!("{}: data channel: {}", role.name(), err);
                    self.channel_closed(eloop, role);
                    return;
                }
            }
            if !data.has_pending() {
                return;
            }
        }
    }

    /// Forward a message to the process that handles it.
    ///
    /// Messages for a process that does not read its channel are
    /// dropped once its queue is full.
    fn route(&self, eloop: &mut Eloop, from: Role, message: Message) {
        let cmd = match message.command() {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("{}: {}", from.name(), err);
                return;
            }
        };
        let to = match (from, cmd) {
            (Role::Manager, Command::BpfArp) => Role::Inet,
            (Role::Inet, Command::BpfArp) => Role::Manager,
            (Role::Control, Command::Ctl | Command::CtlEof) => Role::Manager,
            (Role::Manager, Command::Ctl) => Role::Control,
            _ => {
                warn!("{}: cannot route {:?}", from.name(), cmd);
                return;
            }
        };

        let data = match self.0.borrow().processes.get(&to) {
            Some(process) if process.state == State::Dispatching => process.data.clone(),
            _ => {
                debug!("{}: not running, dropped {:?}", to.name(), cmd);
                return;
            }
        };
        let Message {
            header,
            name,
            data: payload,
            fd,
        } = message;
        match data.queue_msg(header, fd, &name, &payload) {
            Ok(()) => watch_queue(eloop, &data, Events::READ),
            Err(Error::ResourceExhausted(_)) => {
                warn!("{}: channel full, dropped {:?}", to.name(), cmd)
            }
            Err(err) => error!("{}: route {:?}: {}", to.name(), cmd, err),
        }
    }

    fn channel_closed(&self, eloop: &mut Eloop, role: Role) {
        let (cmd, data, state, exiting) = {
            let mut supervisor = self.0.borrow_mut();
            let exiting = supervisor.exiting;
            match supervisor.processes.get_mut(&role) {
                Some(process) if process.state != State::Stopped => {
                    let state = process.state;
                    process.state = State::Stopped;
                    (process.cmd.clone(), process.data.clone(), state, exiting)
                }
                _ => return,
            }
        };
        let _ = eloop.delete_fd(cmd.as_raw_fd());
        let _ = eloop.delete_fd(data.as_raw_fd());

        if state != State::StopRequested {
            warn!("{}: channel closed", role.name());
        }
        if role == Role::Manager && !exiting {
            self.shutdown(eloop);
        }
    }
}

/// Set the interest of a channel, adding `WRITE` while frames are queued.
fn watch_queue(eloop: &mut Eloop, handler: &Handler, interest: Events) {
    let interest = if handler.has_queued() {
        interest | Events::WRITE
    } else {
        interest
    };
    if let Err(err) = eloop.update_fd(handler.as_raw_fd(), interest) {
        debug!("channel {}: {}", handler.as_raw_fd(), err);
    }
}

/// Run the root process until all other processes stopped.
pub fn run_root(options: Options) -> Result<i32, Error> {
    if !options.disable_privdrop && !getuid().is_root() {
        return Err(Error::PermissionDenied);
    }
    fs::create_dir_all(&options.rundir)?;

    let mut eloop = Eloop::new()?;
    let privsep = Privsep::new(options.clone());
    privsep.start(&mut eloop)?;
    let code = eloop.run();

    // The control process cannot remove its sockets after chroot.
    for unprivileged in [false, true] {
        let _ = fs::remove_file(socket_path(&options.rundir, None, None, unprivileged));
    }
    info!("root: exiting with status {}", code);

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::{
        imsg::{Command, Handler, MsgHdr, PsId, Received},
        Privsep, Role, RootClient, State,
    };
    use crate::{
        eloop::{Eloop, ALL_QUEUES},
        error::Error,
        options::Options,
    };
    use nix::{
        errno::Errno,
        unistd::{write, Pid},
    };
    use std::{
        convert::TryFrom,
        os::unix::io::AsRawFd,
        path::Path,
        rc::Rc,
        sync::mpsc,
        thread,
    };

    fn options(dir: &Path) -> Options {
        let options = Options {
            rundir: dir.join("run"),
            dbdir: dir.join("db"),
            ..Default::default()
        };
        std::fs::create_dir_all(&options.rundir).unwrap();
        std::fs::create_dir_all(&options.dbdir).unwrap();
        options
    }

    /// Add a process and return its side of the channels.
    fn add(eloop: &mut Eloop, privsep: &Privsep, role: Role) -> (Handler, Handler) {
        let (cmd, cmd_remote) = Handler::pair().unwrap();
        let (data, data_remote) = Handler::pair().unwrap();
        privsep
            .add_process(eloop, role, Pid::this(), cmd, data)
            .unwrap();

        let start = data_remote.recv_message().unwrap().unwrap();
        assert_eq!(start.command().unwrap(), Command::Start);
        (cmd_remote, data_remote)
    }

    fn run_until<T>(eloop: &mut Eloop, receiver: &mpsc::Receiver<T>) -> T {
        for _ in 0..50 {
            eloop
                .add_timeout(ALL_QUEUES, 0, 100_000_000, "privsep_test", 0, |eloop| {
                    eloop.exit(0)
                })
                .unwrap();
            eloop.run();
            if let Ok(result) = receiver.try_recv() {
                return result;
            }
        }
        panic!("timed out");
    }

    fn run_once(eloop: &mut Eloop) {
        eloop
            .add_timeout(ALL_QUEUES, 0, 100_000_000, "privsep_test", 0, |eloop| {
                eloop.exit(0)
            })
            .unwrap();
        eloop.run();
    }

    #[test]
    fn test_roles() {
        assert_eq!(Role::Manager.name(), "manager");
        assert_eq!(Role::from_name("inet"), Some(Role::Inet));
        assert_eq!(Role::from_name("dhcpcd"), None);
        assert_eq!(Role::try_from(u16::from(Role::Control)), Ok(Role::Control));
        assert_eq!(Role::USERNAME, "_dhcpcd");
        assert_eq!(Role::ROLES.len(), 4);
    }

    #[test]
    fn test_unique_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options(dir.path()));
        let _manager = add(&mut eloop, &privsep, Role::Manager);
        assert_eq!(privsep.state(Role::Manager), Some(State::Dispatching));

        let (cmd, _) = Handler::pair().unwrap();
        let (data, _) = Handler::pair().unwrap();
        assert!(privsep
            .add_process(&mut eloop, Role::Manager, Pid::this(), cmd, data)
            .is_err());
        assert_eq!(privsep.process_count(), 1);
    }

    #[test]
    fn test_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let lease = options.dbdir.join("eth0.lease");
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options);
        let (cmd, _data) = add(&mut eloop, &privsep, Role::Manager);

        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn({
            let lease = lease.clone();
            move || {
                let root = RootClient::Remote(Rc::new(cmd));
                let written = root.write_file(&lease, b"lease").unwrap();
                let data = root.read_file(&lease).unwrap();
                let denied = root.read_file(Path::new("/etc/passwd"));
                let missing = root.read_file(&lease.with_extension("none"));
                sender
                    .send((
                        written,
                        data,
                        matches!(denied, Err(Error::UnixError(Errno::EPERM))),
                        matches!(missing, Err(Error::UnixError(Errno::ENOENT))),
                    ))
                    .unwrap();
            }
        });

        let (written, data, denied, missing) = run_until(&mut eloop, &receiver);
        handle.join().unwrap();
        assert_eq!(written, 5);
        assert_eq!(data, b"lease");
        assert!(denied);
        assert!(missing);
    }

    #[test]
    fn test_role_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let lease = options.dbdir.join("eth0.lease");
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options);
        let (cmd, _data) = add(&mut eloop, &privsep, Role::Inet);

        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            let root = RootClient::Remote(Rc::new(cmd));
            let result = root.write_file(&lease, b"lease");
            sender
                .send(matches!(result, Err(Error::UnixError(Errno::EPERM))))
                .unwrap();
        });

        assert!(run_until(&mut eloop, &receiver));
        handle.join().unwrap();
    }

    #[test]
    fn test_route() {
        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options(dir.path()));
        let (_, manager) = add(&mut eloop, &privsep, Role::Manager);
        let (_, inet) = add(&mut eloop, &privsep, Role::Inet);
        let (_, control) = add(&mut eloop, &privsep, Role::Control);

        let id = PsId::new(Command::BpfArp.into(), 2, None);
        manager.send_cmd(Command::BpfArp, 0, id, b"frame").unwrap();
        control
            .send_cmd(Command::Ctl, 0, PsId::default(), b"ctl")
            .unwrap();

        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            let arp = inet.recv_message().unwrap().unwrap();
            let ctl = manager.recv_message().unwrap().unwrap();
            sender
                .send((
                    arp.command().unwrap(),
                    arp.header.id.ifindex,
                    arp.data.to_vec(),
                    ctl.command().unwrap(),
                    ctl.data.to_vec(),
                ))
                .unwrap();
        });

        let (cmd, ifindex, frame, ctl, data) = run_until(&mut eloop, &receiver);
        handle.join().unwrap();
        assert_eq!(cmd, Command::BpfArp);
        assert_eq!(ifindex, 2);
        assert_eq!(frame, b"frame");
        assert_eq!(ctl, Command::Ctl);
        assert_eq!(data, b"ctl");
    }

    #[test]
    fn test_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options(dir.path()));
        let (_, manager) = add(&mut eloop, &privsep, Role::Manager);
        let (_, inet) = add(&mut eloop, &privsep, Role::Inet);

        // The manager exiting stops everything else.
        privsep.exited(&mut eloop, Role::Manager, 3);
        assert!(privsep.is_exiting());
        assert_eq!(privsep.state(Role::Inet), Some(State::StopRequested));

        let stop = inet.recv_message().unwrap().unwrap();
        assert_eq!(stop.command().unwrap(), Command::Stop);
        assert_eq!(stop.header.flags, MsgHdr::STOP);
        drop(manager);

        privsep.exited(&mut eloop, Role::Inet, 0);
        assert_eq!(privsep.process_count(), 0);
        assert_eq!(eloop.fd_count(), 0);
    }

    #[test]
    fn test_partial_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options(dir.path()));
        let (cmd, _data) = add(&mut eloop, &privsep, Role::Manager);

        let header = MsgHdr::new(Command::OpenLink, 0, PsId::default());
        let request = zerocopy::AsBytes::as_bytes(&header).to_vec();

        // Root keeps serving while the rest of the header is missing.
        write(cmd.as_raw_fd(), &request[..20]).unwrap();
        run_once(&mut eloop);
        assert_eq!(privsep.state(Role::Manager), Some(State::Dispatching));

        write(cmd.as_raw_fd(), &request[20..]).unwrap();
        run_once(&mut eloop);
        let result = cmd.root_read_error().unwrap();
        assert_eq!(result.result, -1);
        assert_eq!(result.errno, Errno::EPERM as i32);
    }

    #[test]
    fn test_route_full_channel() {
        const FRAMES: usize = 10000;
        let frame = [0x5au8; 98];

        let dir = tempfile::tempdir().unwrap();
        let mut eloop = Eloop::new().unwrap();
        let privsep = Privsep::new(options(dir.path()));
        let (_, manager) = add(&mut eloop, &privsep, Role::Manager);
        let (_, inet) = add(&mut eloop, &privsep, Role::Inet);

        // The manager does not read while inet floods it.
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            for _ in 0..FRAMES {
                inet.send_cmd(Command::BpfArp, 0, PsId::default(), &frame)
                    .unwrap();
            }
            sender.send(()).unwrap();
            inet
        });
        run_until(&mut eloop, &receiver);
        let _inet = handle.join().unwrap();
        run_once(&mut eloop);
        assert_eq!(privsep.state(Role::Manager), Some(State::Dispatching));

        // Frames that were not dropped arrive intact and in order.
        let mut received = 0;
        loop {
            run_once(&mut eloop);
            let mut count = 0;
            while let Received::Message(message) = manager.try_recv_message().unwrap() {
                assert_eq!(message.command().unwrap(), Command::BpfArp);
                assert_eq!(&message.data[..], &frame[..]);
                count += 1;
            }
            if count == 0 {
                break;
            }
            received += count;
        }
        assert!(received > 0);
        assert!(received < FRAMES);
    }
}
