//! Single-threaded event loop for timers, descriptors and signals.
//!
//! Every process of the daemon owns exactly one `Eloop`.  Callbacks
//! receive the loop by mutable reference so they can add and delete
//! descriptors or timeouts, including their own, while the loop is
//! dispatching.  Nothing in a callback may block; waiting is expressed
//! by registering interest and returning.

mod backend;
mod signal;
mod timeout;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::Epoll as DefaultBackend;
    } else if #[cfg(any(target_os = "freebsd", target_os = "dragonfly",
                        target_os = "openbsd", target_os = "netbsd",
                        target_os = "macos", target_os = "ios"))] {
        mod kqueue;
        pub use kqueue::Kqueue as DefaultBackend;
    } else {
        pub use backend::Poll as DefaultBackend;
    }
}

pub use backend::{wait_fd, Backend, Poll};
pub use signal::SIGNAL_QUEUE_MAX;

use crate::error::Error;
use log::{debug, error};
use nix::{errno::Errno, sys::signal::Signal};
use signal::SignalPipe;
use std::{
    collections::BTreeMap,
    fmt, ops,
    os::unix::io::RawFd,
    time::{Duration, Instant},
};
use timeout::{Timeout, Timeouts};

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Default timeout queue; deleting from it matches all queues.
pub const ALL_QUEUES: u32 = 0;

/// Readiness conditions of a descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Events(u8);

impl Events {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const HANGUP: Self = Self(0x04);
    pub const ERROR: Self = Self(0x08);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for Events {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl ops::Sub for Events {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::HANGUP, "HANGUP"),
            (Self::ERROR, "ERROR"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>();
        write!(f, "Events({})", names.join("|"))
    }
}

type FdCallback = Box<dyn FnMut(&mut Eloop, Events)>;
type SignalCallback = Box<dyn FnMut(&mut Eloop, Signal)>;

/// Registered descriptor.
struct Event {
    interest: Events,
    /// Changes when the callback is replaced.
    generation: u64,
    /// `None` while the callback is running.
    callback: Option<FdCallback>,
}

/// The event loop.
pub struct Eloop {
    backend: Box<dyn Backend>,
    events: BTreeMap<RawFd, Event>,
    timeouts: Timeouts,
    signals: Option<SignalPipe>,
    signal_cb: Option<SignalCallback>,
    clock: Box<dyn Fn() -> Instant>,
    generation: u64,
    exitcode: i32,
    exitnow: bool,
}

impl fmt::Debug for Eloop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eloop")
            .field("fds", &self.events.keys().collect::<Vec<_>>())
            .field("timeouts", &self.timeouts.len())
            .field("exitcode", &self.exitcode)
            .field("exitnow", &self.exitnow)
            .finish()
    }
}

impl Eloop {
    /// Create a new loop with the platform's preferred backend.
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_backend(Box::new(DefaultBackend::new()?)))
    }

    /// Create a new loop with the given backend.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            events: BTreeMap::new(),
            timeouts: Timeouts::default(),
            signals: None,
            signal_cb: None,
            clock: Box::new(Instant::now),
            generation: 0,
            exitcode: 0,
            exitnow: false,
        }
    }

    /// Replace the monotonic clock.
    pub fn with_clock<F: Fn() -> Instant + 'static>(mut self, clock: F) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Current monotonic time.
    pub fn now(&self) -> Instant {
        (self.clock)()
    }

    /// Register a descriptor or update an existing registration.
    ///
    /// There is at most one registration per descriptor; calling this
    /// again replaces the interest and the callback.
    pub fn add_fd<F>(&mut self, fd: RawFd, interest: Events, callback: F) -> Result<(), Error>
    where
        F: FnMut(&mut Eloop, Events) + 'static,
    {
        if fd < 0 {
            return Err(Error::InvalidArgument("invalid descriptor"));
        }
        let interest = interest - (Events::HANGUP | Events::ERROR);
        if interest.is_empty() {
            return Err(Error::InvalidArgument("empty interest"));
        }
        self.generation += 1;

        match self.events.get_mut(&fd) {
            Some(event) => {
                if event.interest != interest {
                    self.backend.modify(fd, interest)?;
                }
                event.interest = interest;
                event.generation = self.generation;
                event.callback = Some(Box::new(callback));
            }
            None => {
                self.backend.add(fd, interest)?;
                self.events.insert(
                    fd,
                    Event {
                        interest,
                        generation: self.generation,
                        callback: Some(Box::new(callback)),
                    },
                );
            }
        }

        Ok(())
    }

    /// Change the interest of a descriptor but keep its callback.
    pub fn update_fd(&mut self, fd: RawFd, interest: Events) -> Result<(), Error> {
        let interest = interest - (Events::HANGUP | Events::ERROR);
        if interest.is_empty() {
            return Err(Error::InvalidArgument("empty interest"));
        }
        let event = self.events.get_mut(&fd).ok_or(Error::NotFound)?;
        if event.interest != interest {
            self.backend.modify(fd, interest)?;
            event.interest = interest;
        }
        Ok(())
    }

    /// Remove a descriptor registration.
    pub fn delete_fd(&mut self, fd: RawFd) -> Result<(), Error> {
        self.events.remove(&fd).ok_or(Error::NotFound)?;
        // The descriptor might have been closed already.
        if let Err(err) = self.backend.remove(fd) {
            debug!("eloop: fd {} removed: {}", fd, err);
        }
        Ok(())
    }

    /// Returns the interest of a registered descriptor.
    pub fn interest(&self, fd: RawFd) -> Option<Events> {
        self.events.get(&fd).map(|event| event.interest)
    }

    /// Number of registered descriptors.
    pub fn fd_count(&self) -> usize {
        self.events.len()
    }

    /// Add a timeout, replacing any timeout of the same callback and argument.
    pub fn add_timeout<F>(
        &mut self,
        queue: u32,
        secs: u64,
        nsecs: u32,
        callback: &'static str,
        arg: u64,
        action: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Eloop) + 'static,
    {
        if nsecs > NSEC_PER_SEC {
            return Err(Error::InvalidArgument("nanoseconds out of range"));
        }
        let when = Duration::from_secs(secs)
            .checked_add(Duration::from_nanos(nsecs.into()))
            .and_then(|duration| self.now().checked_add(duration))
            .ok_or(Error::InvalidArgument("timeout out of range"))?;
        self.timeouts.insert(Timeout {
            when,
            queue,
            callback,
            arg,
            action: Box::new(action),
        });
        Ok(())
    }

    /// Add a timeout in whole seconds on the default queue.
    pub fn add_timeout_sec<F>(
        &mut self,
        secs: u64,
        callback: &'static str,
        arg: u64,
        action: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Eloop) + 'static,
    {
        self.add_timeout(ALL_QUEUES, secs, 0, callback, arg, action)
    }

    /// Delete timeouts by queue (`ALL_QUEUES` for any), callback
    /// (`None` for any) and argument.  Returns the number deleted.
    pub fn delete_timeout(&mut self, queue: u32, callback: Option<&str>, arg: u64) -> usize {
        self.timeouts.delete(queue, callback, arg)
    }

    /// Pending timeouts in firing order as `(remaining, callback, arg)`.
    pub fn timeouts(&self) -> Vec<(Duration, &'static str, u64)> {
        let now = self.now();
        self.timeouts
            .iter()
            .map(|t| (t.when.saturating_duration_since(now), t.callback, t.arg))
            .collect()
    }

    /// Time until the first timeout expires.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = self.now();
        self.timeouts
            .first()
            .map(|when| when.saturating_duration_since(now))
    }

    /// Fire the oldest timeout if it expired.
    pub fn dispatch_timeout(&mut self) -> bool {
        match self.timeouts.pop_expired(self.now()) {
            Some(timeout) => {
                (timeout.action)(self);
                true
            }
            None => false,
        }
    }

    /// Deliver the given signals to the callback from the loop.
    pub fn signal_handler<F>(&mut self, signals: &[Signal], callback: F) -> Result<(), Error>
    where
        F: FnMut(&mut Eloop, Signal) + 'static,
    {
        if let Some(pipe) = self.signals.take() {
            let _ = self.backend.remove(pipe.as_raw_fd());
        }
        let pipe = SignalPipe::new(signals)?;
        self.backend.add(pipe.as_raw_fd(), Events::READ)?;
        self.signals = Some(pipe);
        self.signal_cb = Some(Box::new(callback));
        Ok(())
    }

    /// Request the loop to exit at the top of the next iteration.
    pub fn exit(&mut self, code: i32) {
        self.exitcode = code;
        self.exitnow = true;
    }

    /// Run until exit is requested or nothing is left to wait for.
    ///
    /// Returns the exit code, or `-errno` if the backend failed.
    pub fn run(&mut self) -> i32 {
        let mut ready = vec![];

        self.exitnow = false;
        loop {
            self.dispatch_signals();
            if self.exitnow {
                break self.exitcode;
            }

            let timeout = match self.timeouts.first() {
                Some(when) => {
                    let now = self.now();
                    if when <= now {
                        // One timeout per iteration.
                        self.dispatch_timeout();
                        continue;
                    }
                    Some(when - now)
                }
                None => None,
            };
            if timeout.is_none() && self.events.is_empty() {
                break self.exitcode;
            }

            ready.clear();
            match self.backend.wait(timeout, &mut ready) {
                Ok(()) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("eloop: {}", err);
                    break -(err as i32);
                }
            }

            for (fd, events) in ready.drain(..) {
                self.dispatch_fd(fd, events);
            }
        }
    }

    fn dispatch_fd(&mut self, fd: RawFd, events: Events) {
        if let Some(pipe) = self.signals.as_mut() {
            if pipe.as_raw_fd() == fd {
                pipe.read();
                return;
            }
        }

        // Entries deleted by an earlier callback are skipped.
        let (mut callback, generation) = match self.events.get_mut(&fd) {
            Some(event) => match event.callback.take() {
                Some(callback) => (callback, event.generation),
                None => return,
            },
            None => return,
        };

        callback(self, events);

        if let Some(event) = self.events.get_mut(&fd) {
            if event.generation == generation && event.callback.is_none() {
                event.callback = Some(callback);
            }
        }
    }

    fn dispatch_signals(&mut self) {
        while let Some(signal) = self.signals.as_mut().and_then(|pipe| pipe.pop()) {
            if let Some(mut callback) = self.signal_cb.take() {
                callback(self, signal);
                if self.signal_cb.is_none() {
                    self.signal_cb = Some(callback);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Eloop, Events, Poll, ALL_QUEUES};
    use crate::error::Error;
    use std::{
        cell::{Cell, RefCell},
        io::{Read, Write},
        os::unix::{io::AsRawFd, net::UnixStream},
        rc::Rc,
        time::{Duration, Instant},
    };

    fn manual_clock() -> (Eloop, Rc<Cell<Instant>>) {
        let now = Rc::new(Cell::new(Instant::now()));
        let eloop = Eloop::new().unwrap().with_clock({
            let now = now.clone();
            move || now.get()
        });
        (eloop, now)
    }

    #[test]
    fn test_timeout_order() {
        let (mut eloop, _) = manual_clock();

        for (arg, (secs, nsecs)) in [(3, 0), (1, 500), (0, 999_999_999), (1, 0), (3, 0)]
            .iter()
            .enumerate()
        {
            eloop
                .add_timeout(ALL_QUEUES, *secs, *nsecs, "cb", arg as u64, |_| {})
                .unwrap();
            let timeouts = eloop.timeouts();
            assert!(timeouts.windows(2).all(|w| w[0].0 <= w[1].0));
        }

        // Re-adding the same callback and argument replaces the entry.
        eloop
            .add_timeout(ALL_QUEUES, 10, 0, "cb", 2, |_| {})
            .unwrap();
        let timeouts = eloop.timeouts();
        assert_eq!(timeouts.len(), 5);
        assert_eq!(timeouts.iter().filter(|t| t.2 == 2).count(), 1);
        assert_eq!(timeouts.last().unwrap(), &(Duration::from_secs(10), "cb", 2));
    }

    #[test]
    fn test_timeout_invalid() {
        let (mut eloop, _) = manual_clock();
        let result = eloop.add_timeout(ALL_QUEUES, 0, 1_000_000_001, "cb", 0, |_| {});
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(eloop
            .add_timeout(ALL_QUEUES, 0, 1_000_000_000, "cb", 0, |_| {})
            .is_ok());

        for nsecs in [0, 1_000_000_000] {
            let result = eloop.add_timeout(ALL_QUEUES, u64::MAX, nsecs, "far", 0, |_| {});
            assert!(matches!(result, Err(Error::InvalidArgument(_))));
        }
        assert_eq!(eloop.timeouts().len(), 1);
    }

    #[test]
    fn test_timeout_dispatch() {
        let (mut eloop, now) = manual_clock();
        let fired = Rc::new(RefCell::new(vec![]));

        for (arg, secs) in [(1u64, 2u64), (2, 1), (3, 3)].iter() {
            let fired = fired.clone();
            let arg = *arg;
            eloop
                .add_timeout_sec(*secs, "cb", arg, move |_| fired.borrow_mut().push(arg))
                .unwrap();
        }
        assert_eq!(eloop.delete_timeout(ALL_QUEUES, Some("other"), 3), 0);
        assert_eq!(eloop.delete_timeout(ALL_QUEUES, None, 3), 1);

        assert!(!eloop.dispatch_timeout());
        now.set(now.get() + Duration::from_secs(5));
        while eloop.dispatch_timeout() {}

        assert_eq!(*fired.borrow(), vec![2, 1]);
        assert_eq!(eloop.next_timeout(), None);
    }

    #[test]
    fn test_run_timeouts() {
        let mut eloop = Eloop::new().unwrap();
        let count = Rc::new(Cell::new(0));

        for arg in 0..3 {
            let count = count.clone();
            eloop
                .add_timeout(ALL_QUEUES, 0, 1000, "tick", arg, move |_| {
                    count.set(count.get() + 1)
                })
                .unwrap();
        }

        // Nothing is left after the timeouts fired.
        assert_eq!(eloop.run(), 0);
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_fd_idempotent() {
        let mut eloop = Eloop::new().unwrap();
        let (_a, b) = UnixStream::pair().unwrap();

        eloop.add_fd(b.as_raw_fd(), Events::READ, |_, _| {}).unwrap();
        eloop
            .add_fd(b.as_raw_fd(), Events::READ | Events::WRITE, |_, _| {})
            .unwrap();
        assert_eq!(eloop.fd_count(), 1);
        assert_eq!(
            eloop.interest(b.as_raw_fd()),
            Some(Events::READ | Events::WRITE)
        );

        eloop.delete_fd(b.as_raw_fd()).unwrap();
        assert!(matches!(eloop.delete_fd(b.as_raw_fd()), Err(Error::NotFound)));
        assert!(matches!(
            eloop.add_fd(-1, Events::READ, |_, _| {}),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            eloop.add_fd(b.as_raw_fd(), Events::empty(), |_, _| {}),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_run_fd() {
        for mut eloop in vec![
            Eloop::new().unwrap(),
            Eloop::with_backend(Box::new(Poll::new())),
        ] {
            let (mut a, mut b) = UnixStream::pair().unwrap();
            b.set_nonblocking(true).unwrap();
            a.write_all(b"ping").unwrap();

            let fd = b.as_raw_fd();
            eloop
                .add_fd(fd, Events::READ, move |eloop, events| {
                    assert!(events.contains(Events::READ));
                    let mut buf = [0u8; 16];
                    let length = b.read(&mut buf).unwrap();
                    assert_eq!(&buf[..length], b"ping");
                    eloop.delete_fd(fd).unwrap();
                    eloop.exit(42);
                })
                .unwrap();

            assert_eq!(eloop.run(), 42);
            assert_eq!(eloop.fd_count(), 0);
        }
    }

    #[test]
    fn test_delete_during_dispatch() {
        let mut eloop = Eloop::new().unwrap();
        let (mut a1, b1) = UnixStream::pair().unwrap();
        let (mut a2, b2) = UnixStream::pair().unwrap();
        a1.write_all(b"x").unwrap();
        a2.write_all(b"x").unwrap();

        let (fd1, fd2) = (b1.as_raw_fd(), b2.as_raw_fd());
        let calls = Rc::new(Cell::new(0));

        for (fd, other) in &[(fd1, fd2), (fd2, fd1)] {
            let calls = calls.clone();
            let (fd, other) = (*fd, *other);
            eloop
                .add_fd(fd, Events::READ, move |eloop, _| {
                    calls.set(calls.get() + 1);
                    eloop.delete_fd(other).unwrap();
                    eloop.delete_fd(fd).unwrap();
                })
                .unwrap();
        }

        // Both are ready in the same wake but only one callback runs.
        assert_eq!(eloop.run(), 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_replace_own_callback() {
        let mut eloop = Eloop::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();
        let fd = b.as_raw_fd();

        eloop
            .add_fd(fd, Events::READ, move |eloop, _| {
                eloop
                    .add_fd(fd, Events::READ, move |eloop, _| {
                        eloop.delete_fd(fd).unwrap();
                        eloop.exit(2);
                    })
                    .unwrap();
            })
            .unwrap();

        assert_eq!(eloop.run(), 2);
        drop(b);
    }
}
