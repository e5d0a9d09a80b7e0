//! Privileged operations of the root process.
//!
//! The dispatcher implements a closed list of commands; every other
//! request fails with `NotSupported` and every command that is not
//! meant for the requesting role fails with `PermissionDenied`.

use super::{
    imsg::{Command, Handler, PsId, Reply, RpcResult},
    Role,
};
use crate::{
    error::Error,
    net::{Fd, PacketSocket},
    options::Options,
};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_derive::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    os::unix::{
        fs::{MetadataExt, OpenOptionsExt},
        io::AsRawFd,
        process::ExitStatusExt,
    },
    path::{Component, Path, PathBuf},
    process,
    rc::Rc,
};

/// Interface ioctls that the root process performs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IoctlOp {
    GetFlags,
    SetFlags(i16),
    GetMtu,
    SetMtu(i32),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IoctlRequest {
    pub ifname: String,
    pub op: IoctlOp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileRequest {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Read a sysctl and optionally set a new value.
///
/// The result is the full length of the current value, the returned
/// data is truncated to `old_len`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SysctlRequest {
    pub name: String,
    pub old_len: usize,
    pub new: Option<Vec<u8>>,
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, Error> {
    bincode::deserialize(data).map_err(Into::into)
}

/// Executes the allow-listed commands.
#[derive(Debug, Clone)]
pub struct RootDispatcher {
    options: Options,
}

impl RootDispatcher {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// Returns true if the role may request the command.
    pub fn permitted(role: Role, cmd: Command) -> bool {
        match (role, cmd) {
            (Role::Root, _) => true,
            (
                Role::Manager,
                Command::Ioctl
                | Command::Route
                | Command::Script
                | Command::ReadFile
                | Command::WriteFile
                | Command::Unlink
                | Command::FileMtime
                | Command::Sysctl,
            ) => true,
            (Role::Inet, Command::OpenLink) => true,
            _ => false,
        }
    }

    /// Run one request on behalf of a role.
    pub fn dispatch(
        &self,
        role: Role,
        cmd: Command,
        id: &PsId,
        data: &[u8],
    ) -> Result<Reply, Error> {
        if !Self::permitted(role, cmd) {
            warn!("{}: {:?} not permitted", role.name(), cmd);
            return Err(Error::PermissionDenied);
        }
        debug!("{}: {:?}", role.name(), cmd);

        match cmd {
            Command::Ioctl => ioctl(decode(data)?),
            Command::Route => route(data),
            Command::Script => self.script(decode(data)?),
            Command::ReadFile => {
                let path: PathBuf = decode(data)?;
                self.check_path(&path)?;
                Ok(Reply::data(fs::read(&path)?))
            }
            Command::WriteFile => {
                let request: FileRequest = decode(data)?;
                self.check_path(&request.path)?;
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o640)
                    .open(&request.path)?;
                file.write_all(&request.data)?;
                Ok(Reply::result(request.data.len() as i64))
            }
            Command::Unlink => {
                let path: PathBuf = decode(data)?;
                self.check_path(&path)?;
                fs::remove_file(&path)?;
                Ok(Reply::result(0))
            }
            Command::FileMtime => {
                let path: PathBuf = decode(data)?;
                self.check_path(&path)?;
                Ok(Reply::result(fs::metadata(&path)?.mtime()))
            }
            Command::Sysctl => sysctl(decode(data)?),
            Command::OpenLink => {
                let socket = PacketSocket::open(id.ifindex)?;
                Ok(Reply::fd(socket.into_fd()))
            }
            _ => Err(Error::NotSupported),
        }
    }

    /// Files must be below the run or database directory.
    fn check_path(&self, path: &Path) -> Result<(), Error> {
        if !path.is_absolute()
            || path
                .components()
                .any(|component| component == Component::ParentDir)
        {
            return Err(Error::PermissionDenied);
        }
        if [&self.options.rundir, &self.options.dbdir]
            .iter()
            .any(|dir| path != dir.as_path() && path.starts_with(dir))
        {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    fn script(&self, request: ScriptRequest) -> Result<Reply, Error> {
        let script = self.options.script.as_ref().ok_or(Error::NotSupported)?;
        let status = process::Command::new(script)
            .args(&request.argv)
            .env_clear()
            .envs(request.env)
            .status()?;
        let code = status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(255);
        Ok(Reply::result(i64::from(code)))
    }
}

fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<Fd, Error> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return Err(io::Error::last_os_error().into());
    }
    let fd = Fd::from(fd);
    crate::net::set_cloexec(fd.as_raw_fd(), true)?;
    Ok(fd)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const IFREQ_LENGTH: usize = 40;

        fn ioctl(request: IoctlRequest) -> Result<Reply, Error> {
            let name = request.ifname.as_bytes();
            if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains(&b'/') {
                return Err(Error::InvalidArgument("interface name"));
            }
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0)?;

            // struct ifreq: name followed by the request union.
            let mut ifr = [0u8; IFREQ_LENGTH];
            ifr[..name.len()].copy_from_slice(name);
            let value = &mut ifr[libc::IFNAMSIZ..];
            let code = match request.op {
                IoctlOp::GetFlags => libc::SIOCGIFFLAGS,
                IoctlOp::SetFlags(flags) => {
                    value[..2].copy_from_slice(&flags.to_ne_bytes());
                    libc::SIOCSIFFLAGS
                }
                IoctlOp::GetMtu => libc::SIOCGIFMTU,
                IoctlOp::SetMtu(mtu) => {
                    value[..4].copy_from_slice(&mtu.to_ne_bytes());
                    libc::SIOCSIFMTU
                }
            };

            if unsafe { libc::ioctl(fd.as_raw_fd(), code as _, ifr.as_mut_ptr()) } == -1 {
                return Err(io::Error::last_os_error().into());
            }

            let value = &ifr[libc::IFNAMSIZ..];
            let result = match request.op {
                IoctlOp::GetFlags => i64::from(i16::from_ne_bytes([value[0], value[1]])),
                IoctlOp::GetMtu => {
                    i64::from(i32::from_ne_bytes([value[0], value[1], value[2], value[3]]))
                }
                _ => 0,
            };
            Ok(Reply::result(result))
        }

        fn route(message: &[u8]) -> Result<Reply, Error> {
            // struct nlmsghdr starts with the total length.
            if message.len() < 16
                || u32::from_ne_bytes([message[0], message[1], message[2], message[3]]) as usize
                    != message.len()
            {
                return Err(Error::InvalidArgument("route message"));
            }
            let fd = socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE)?;
            let length = nix::unistd::write(fd.as_raw_fd(), message)?;
            Ok(Reply::result(length as i64))
        }

        const SYSCTL_ALLOWED: &[&str] = &[
            "net.ipv4.conf.",
            "net.ipv4.neigh.",
            "net.ipv6.conf.",
            "net.ipv6.neigh.",
        ];

        /// `/proc/sys` path of `<prefix>.<interface>.<parameter>`, the
        /// interface name may contain dots.
        fn sysctl_path(name: &str) -> Result<PathBuf, Error> {
            let prefix = SYSCTL_ALLOWED
                .iter()
                .find(|prefix| name.starts_with(*prefix))
                .ok_or(Error::PermissionDenied)?;
            let (ifname, param) = name[prefix.len()..]
                .rsplit_once('.')
                .filter(|(ifname, param)| !ifname.is_empty() && !param.is_empty())
                .ok_or(Error::InvalidArgument("sysctl name"))?;

            Ok(Path::new("/proc/sys")
                .join(prefix.trim_end_matches('.').replace('.', "/"))
                .join(ifname)
                .join(param))
        }

        fn sysctl_value(request: &SysctlRequest) -> Result<Vec<u8>, Error> {
            let path = sysctl_path(&request.name)?;
            let old = fs::read(&path)?;
            if let Some(new) = &request.new {
                fs::write(&path, new)?;
            }
            Ok(old)
        }
    } else {
        fn ioctl(_request: IoctlRequest) -> Result<Reply, Error> {
            Err(Error::NotSupported)
        }

        fn route(message: &[u8]) -> Result<Reply, Error> {
            // struct rt_msghdr starts with the total length.
            if message.len() < 4
                || u16::from_ne_bytes([message[0], message[1]]) as usize != message.len()
            {
                return Err(Error::InvalidArgument("route message"));
            }
            let fd = socket(libc::PF_ROUTE, libc::SOCK_RAW, 0)?;
            let length = nix::unistd::write(fd.as_raw_fd(), message)?;
            Ok(Reply::result(length as i64))
        }

        const SYSCTL_ALLOWED: &[&str] = &["net.inet.ip.", "net.inet6.ip6.", "net.link.ether."];

        #[cfg(any(target_os = "freebsd", target_os = "dragonfly", target_os = "netbsd",
                  target_os = "macos", target_os = "ios"))]
        fn sysctl_value(request: &SysctlRequest) -> Result<Vec<u8>, Error> {
            use std::{ffi::CString, ptr};

            let name = CString::new(request.name.as_str())
                .map_err(|_| Error::InvalidArgument("sysctl name"))?;

            let mut length: libc::size_t = 0;
            let ret = unsafe {
                libc::sysctlbyname(name.as_ptr(), ptr::null_mut(), &mut length, ptr::null_mut(), 0)
            };
            if ret == -1 {
                return Err(io::Error::last_os_error().into());
            }

            let mut old = vec![0u8; length];
            let (new, new_len) = match &request.new {
                Some(new) => (new.as_ptr(), new.len()),
                None => (ptr::null(), 0),
            };
            let ret = unsafe {
                libc::sysctlbyname(
                    name.as_ptr(),
                    old.as_mut_ptr() as *mut libc::c_void,
                    &mut length,
                    new as _,
                    new_len,
                )
            };
            if ret == -1 {
                return Err(io::Error::last_os_error().into());
            }
            old.truncate(length);
            Ok(old)
        }

        #[cfg(not(any(target_os = "freebsd", target_os = "dragonfly", target_os = "netbsd",
                      target_os = "macos", target_os = "ios")))]
        fn sysctl_value(_request: &SysctlRequest) -> Result<Vec<u8>, Error> {
            Err(Error::NotSupported)
        }
    }
}

fn sysctl(request: SysctlRequest) -> Result<Reply, Error> {
    if !SYSCTL_ALLOWED
        .iter()
        .any(|prefix| request.name.starts_with(prefix))
        || request.name.contains('/')
        || request.name.contains("..")
    {
        return Err(Error::PermissionDenied);
    }

    let mut data = sysctl_value(&request)?;
    let result = data.len() as i64;
    data.truncate(request.old_len);

    Ok(Reply {
        result,
        data,
        fd: None,
    })
}

/// Access to the privileged operations.
///
/// Without privilege separation the dispatcher runs in-process.
#[derive(Debug)]
pub enum RootClient {
    Remote(Rc<Handler>),
    Local(RootDispatcher),
}

impl RootClient {
    fn call(&self, cmd: Command, id: PsId, data: &[u8]) -> Result<RpcResult, Error> {
        match self {
            Self::Remote(handler) => handler.rpc(cmd, id, data)?.into_result(),
            Self::Local(dispatcher) => {
                let reply = dispatcher.dispatch(Role::Root, cmd, &id, data)?;
                Ok(RpcResult {
                    result: reply.result,
                    errno: 0,
                    data: reply.data.into(),
                    fd: reply.fd,
                })
            }
        }
    }

    fn call_message<T: Serialize>(&self, cmd: Command, data: &T) -> Result<RpcResult, Error> {
        self.call(cmd, PsId::default(), &bincode::serialize(data)?)
    }

    /// Run an interface ioctl, returns the requested value.
    pub fn ioctl(&self, ifname: &str, op: IoctlOp) -> Result<i64, Error> {
        let request = IoctlRequest {
            ifname: ifname.to_string(),
            op,
        };
        Ok(self.call_message(Command::Ioctl, &request)?.result)
    }

    /// Write a message to the route socket.
    pub fn route(&self, message: &[u8]) -> Result<usize, Error> {
        Ok(self.call(Command::Route, PsId::default(), message)?.result as usize)
    }

    /// Run the hook script, returns its exit status.
    pub fn script(&self, argv: &[String], env: &[(String, String)]) -> Result<i32, Error> {
        let request = ScriptRequest {
            argv: argv.to_vec(),
            env: env.to_vec(),
        };
        Ok(self.call_message(Command::Script, &request)?.result as i32)
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        Ok(self.call_message(Command::ReadFile, &path)?.data.to_vec())
    }

    pub fn write_file(&self, path: &Path, data: &[u8]) -> Result<usize, Error> {
        let request = FileRequest {
            path: path.to_path_buf(),
            data: data.to_vec(),
        };
        Ok(self.call_message(Command::WriteFile, &request)?.result as usize)
    }

    pub fn unlink(&self, path: &Path) -> Result<(), Error> {
        self.call_message(Command::Unlink, &path).map(|_| ())
    }

    /// Modification time in seconds since the epoch.
    pub fn file_mtime(&self, path: &Path) -> Result<i64, Error> {
        Ok(self.call_message(Command::FileMtime, &path)?.result)
    }

    /// Returns the full length and up to `old_len` bytes of the value.
    pub fn sysctl(
        &self,
        name: &str,
        old_len: usize,
        new: Option<&[u8]>,
    ) -> Result<(usize, Vec<u8>), Error> {
        let request = SysctlRequest {
            name: name.to_string(),
            old_len,
            new: new.map(|new| new.to_vec()),
        };
        let result = self.call_message(Command::Sysctl, &request)?;
        Ok((result.result as usize, result.data.to_vec()))
    }

    /// Open a raw ARP socket on the interface.
    pub fn open_link(&self, ifindex: u32) -> Result<Fd, Error> {
        let id = PsId::new(Command::OpenLink.into(), ifindex, None);
        self.call(Command::OpenLink, id, &[])?
            .fd
            .ok_or(Error::Protocol("missing descriptor"))
    }
}
