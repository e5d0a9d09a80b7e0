//! Logging for dhcpcd, inspired by OpenBSD's `log.c`.
//!
//! Every process of the daemon installs its own global `slog` logger
//! after it was started.  Library code logs through the `log` facade
//! which is bridged into the `slog` drain, so the same macros work in
//! the privileged root process and in the sandboxed children.
//!
//! All processes log with the `dhcpcd` syslog identity; the message is
//! tagged with the name of the process, e.g. `[inet] eth0: ...`.

mod envlogger;

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    ffi::{CString, NulError},
    fmt::{self, Write as _},
    io::{self, Write},
    sync::{Mutex, Once},
    thread,
};
use tokio::sync::mpsc;

/// Re-export the scoped logging macros.
pub use slog_scope::{debug, error, info, trace, warn};

/// Syslog identity of all processes.
const IDENT: &[u8] = b"dhcpcd\0";

static LOG_BRIDGE: Once = Once::new();
static OPENLOG: Once = Once::new();

/// Configuration for the logging crate.
#[derive(Debug, Default, Clone, Deserialize, Serialize, From)]
pub struct Config {
    /// Log to stderr instead of syslog.
    #[from(forward)]
    pub foreground: bool,
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
    #[display(fmt = "log thread exited")]
    Closed,
}

impl std::error::Error for Error {}

/// Destination of the formatted messages of one process.
#[derive(Debug)]
pub enum Target {
    /// `process: message` lines on stderr.
    Stderr(String),
    /// The daemon facility.
    Syslog(String),
}

impl Target {
    pub fn new(process: &str, config: &Config) -> Self {
        if config.foreground {
            Self::Stderr(process.to_string())
        } else {
            OPENLOG.call_once(|| unsafe {
                libc::openlog(
                    IDENT.as_ptr().cast(),
                    libc::LOG_PID | libc::LOG_NDELAY,
                    libc::LOG_DAEMON,
                )
            });
            Self::Syslog(process.to_string())
        }
    }

    pub fn write(&self, level: Level, message: &str) -> Result<(), Error> {
        match self {
            Self::Stderr(process) => {
                let line = format!("{}: {}\n", process, message);
                io::stderr().write_all(line.as_bytes())?;
            }
            Self::Syslog(process) => {
                let line = CString::new(format!("[{}] {}", process, message))?;
                unsafe {
                    libc::syslog(priority(level), b"%s\0".as_ptr().cast(), line.as_ptr());
                }
            }
        }
        Ok(())
    }
}

fn priority(level: Level) -> libc::c_int {
    match level {
        Level::Critical => libc::LOG_CRIT,
        Level::Error => libc::LOG_ERR,
        Level::Warning => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

/// Drain that writes in the calling thread.
pub struct Inline(Target);

impl Drain for Inline {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<(), Error> {
        self.0.write(record.level(), &format_record(record, values))
    }
}

enum Entry {
    Record(Level, String),
    Close,
}

/// Drain that hands formatted messages to a logging thread.
///
/// The event loops of the daemon must never block, so writing to
/// syslog or a slow terminal is moved out of the calling thread.
pub struct Async {
    sender: mpsc::UnboundedSender<Entry>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Async {
    pub fn new(target: Target) -> Result<Self, Error> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("log".to_string())
            .spawn(move || {
                while let Some(Entry::Record(level, message)) = receiver.blocking_recv() {
                    let _ = target.write(level, &message);
                }
            })?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }
}

impl Drain for Async {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<(), Error> {
        let entry = Entry::Record(record.level(), format_record(record, values));
        self.sender.send(entry).map_err(|_| Error::Closed)
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        // Entries queued before `Close` are still written.
        if let Some(thread) = self.thread.take() {
            if self.sender.send(Entry::Close).is_ok() {
                let _ = thread.join();
            }
        }
    }
}

fn init(process: &str, drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>) -> GlobalLoggerGuard {
    let drain = envlogger::Logger::new(drain, process);

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());
    let logger = slog::Logger::root(drain.fuse(), slog::o!()).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        // The directives filter bridged records, not the `log` facade.
        // Only fails if another `log` implementation was installed.
        let _ = slog_stdlog::init_with_level(log::Level::Trace);
    });

    guard
}

/// Install the global logger of a process, messages are written by a
/// background thread.
///
/// The guard must be kept until the process exits; dropping it flushes
/// the pending messages.
pub fn async_logger<C: Into<Config>>(process: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let target = Target::new(process, &config.into());
    let drain = Async::new(target)?;
    Ok(init(process, Box::new(drain.fuse())))
}

/// Install the global logger of a process, messages are written inline.
pub fn sync_logger<C: Into<Config>>(process: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let target = Target::new(process, &config.into());
    Ok(init(process, Box::new(Inline(target).fuse())))
}

/// The message followed by its key-value pairs.
///
/// Debug messages also carry their origin.
fn format_record(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut fields = Fields(record.msg().to_string());
    if !record.level().is_at_least(Level::Info) {
        let _ = write!(
            fields.0,
            ", source: {}:{}, module: {}",
            record.file(),
            record.line(),
            record.module()
        );
    }
    let _ = record.kv().serialize(record, &mut fields);
    let _ = values.serialize(record, &mut fields);
    fields.0
}

struct Fields(String);

impl slog::Serializer for Fields {
    fn emit_arguments(&mut self, key: slog::Key, val: &fmt::Arguments<'_>) -> slog::Result {
        let _ = write!(self.0, ", {}: {}", key, val);
        Ok(())
    }
}
