//! Forking, executing and sandboxing the privsep processes.

use super::{
    imsg::{Command, Handler, Message, MsgHdr, Received},
    Role, StartInfo, DATA_FD, PRIVSEP_FD,
};
use crate::{
    eloop::{Eloop, Events},
    error::Error,
    net::set_cloexec,
    options::Options,
};
use close_fds::close_open_fds;
use derive_more::Display;
use log::{debug, error, warn};
use nix::unistd::{self, chdir, chroot, dup, dup2, execve, fork, getpid, ForkResult, Pid, User};
use std::{
    convert::TryFrom,
    env,
    ffi::CString,
    os::unix::{
        ffi::OsStrExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
    rc::Rc,
};

/// Fork and execute this program as the given role.
///
/// Returns the child's pid and the root side of its command and data
/// channels.
pub fn spawn(role: Role) -> Result<(Pid, Handler, Handler), Error> {
    let program = path_to_cstr(&env::current_exe()?)?;
    let args = [CString::new(role.name()).map_err(|_| Error::InvalidArgument("role name"))?];
    let env = [CString::new(format!(
        "RUST_LOG={}",
        env::var("RUST_LOG").unwrap_or_default()
    ))
    .map_err(|_| Error::InvalidArgument("RUST_LOG"))?];

    let (cmd, cmd_remote) = Handler::pair()?;
    let (data, data_remote) = Handler::pair()?;

    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => Ok((child, cmd, data)),
        ForkResult::Child => {
            let _ = exec_child(
                &program,
                &args,
                &env,
                cmd_remote.as_raw_fd(),
                data_remote.as_raw_fd(),
            );
            unsafe { libc::_exit(1) }
        }
    }
}

fn exec_child(
    program: &CString,
    args: &[CString],
    env: &[CString],
    cmd_fd: RawFd,
    data_fd: RawFd,
) -> Result<(), Error> {
    // Don't clobber the data channel with the command channel.
    let data_fd = if data_fd == PRIVSEP_FD {
        dup(data_fd)?
    } else {
        data_fd
    };

    let fd = dup2(cmd_fd, PRIVSEP_FD)?;
    set_cloexec(fd, false)?;
    let fd = dup2(data_fd, DATA_FD)?;
    set_cloexec(fd, false)?;

    // Rust sets most file descriptors to close-on-exec but we make
    // sure that any additional file descriptors are closed.
    unsafe {
        close_open_fds(DATA_FD + 1, &[]);
    }

    execve(program, args, env)?;

    Err(Error::InvalidProcess)
}

/// chroot to the user's home and switch to its uid and gid.
pub fn drop_privileges(options: &Options) -> Result<(), Error> {
    if options.disable_privdrop {
        return Ok(());
    }

    // Get the privdrop user.
    let user = User::from_name(&options.username)?
        .ok_or_else(|| Error::UserNotFound(options.username.clone()))?;

    // chroot and change the working directory.
    let dir = if user.dir.is_dir() {
        user.dir.as_path()
    } else {
        Path::new("/var/empty")
    };
    chroot(dir).map_err(|err| Error::Privdrop("chroot", err))?;
    chdir("/").map_err(|err| Error::Privdrop("chdir", err))?;

    // Set the supplementary groups.
    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[user.gid]).map_err(|err| Error::Privdrop("setgroups", err))?;

    // Drop the privileges.
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            unistd::setresgid(user.gid, user.gid, user.gid)
                .map_err(|err| Error::Privdrop("setresgid", err))?;
            unistd::setresuid(user.uid, user.uid, user.uid)
                .map_err(|err| Error::Privdrop("setresuid", err))?;
        } else {
            unistd::setegid(user.gid).map_err(|err| Error::Privdrop("setegid", err))?;
            unistd::setgid(user.gid).map_err(|err| Error::Privdrop("setgid", err))?;
            // seteuid before setuid fails on macOS (and AIX...)
            #[cfg(not(any(target_os = "ios", target_os = "macos")))]
            unistd::seteuid(user.uid).map_err(|err| Error::Privdrop("seteuid", err))?;
            unistd::setuid(user.uid).map_err(|err| Error::Privdrop("setuid", err))?;
        }
    }

    debug!("dropped privileges to {}", options.username);
    Ok(())
}

/// An unprivileged process.
#[derive(Debug, Display)]
#[display(fmt = "{}({})", "role.name()", "pid")]
pub struct Child {
    pub role: Role,
    pub pid: Pid,
    /// Requests to the root process.
    pub cmd: Rc<Handler>,
    /// Messages routed through the root process.
    pub data: Rc<Handler>,
    pub options: Options,
}

impl Child {
    /// Take over the inherited channels and wait for the start message.
    pub fn new(role: Role) -> Result<Self, Error> {
        Self::from_handlers(
            role,
            Handler::from_raw_fd(PRIVSEP_FD)?,
            Handler::from_raw_fd(DATA_FD)?,
        )
    }

    pub fn from_handlers(role: Role, cmd: Handler, data: Handler) -> Result<Self, Error> {
        let message = data
            .recv_message()?
            .ok_or(Error::Protocol("missing start message"))?;
        if message.command()? != Command::Start {
            return Err(Error::Protocol("expected start message"));
        }
        let info: StartInfo = message.decode()?;
        if Role::try_from(info.role).ok() != Some(role) {
            return Err(Error::InvalidProcess);
        }
        debug!("{}: started by root", info.name);

        Ok(Self {
            role,
            pid: getpid(),
            cmd: Rc::new(cmd),
            data: Rc::new(data),
            options: info.options,
        })
    }

    pub fn drop_privileges(&self) -> Result<(), Error> {
        drop_privileges(&self.options)
    }

    /// Receive routed messages until the root process stops us.
    ///
    /// Losing the root process is fatal.
    pub fn watch<F>(&self, eloop: &mut Eloop, mut callback: F) -> Result<(), Error>
    where
        F: FnMut(&mut Eloop, Message) + 'static,
    {
        let data = self.data.clone();
        let name = self.role.name();

        eloop.add_fd(data.as_raw_fd(), Events::READ, move |eloop, _| loop {
            match data.try_recv_message() {
                Ok(Received::Message(message)) => match message.command() {
                    Ok(Command::Stop) => {
                        debug!("{}: stop requested", name);
                        eloop.exit(0);
                        return;
                    }
                    Ok(_) => callback(eloop, message),
                    Err(err) => warn!("{}: {}", name, err),
                },
                Ok(Received::Incomplete) => return,
                Ok(Received::Closed) => {
                    error!("{}: root process exited", name);
                    let _ = eloop.delete_fd(data.as_raw_fd());
                    eloop.exit(1);
                    return;
                }
                Err(err) => {
                    error!("{}: {}", name, err);
                    let _ = eloop.delete_fd(data.as_raw_fd());
                    eloop.exit(1);
                    return;
                }
            }
            if !data.has_pending() {
                return;
            }
        })
    }

    /// Send the start message to a new child.
    pub fn start(data: &Handler, role: Role, options: &Options) -> Result<(), Error> {
        let info = StartInfo {
            role: role.into(),
            name: role.name().to_string(),
            options: options.clone(),
        };
        data.send_message(Command::Start, MsgHdr::START, role.id(), &info)
    }
}

fn path_to_cstr(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidArgument("program path"))
}
