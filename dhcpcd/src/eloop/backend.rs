//! Pluggable polling backends.

use super::Events;
use crate::error::Error;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use std::{os::unix::io::RawFd, time::Duration};

/// The OS polling primitive behind the event loop.
///
/// `wait` reports at most one entry per descriptor, with all ready
/// conditions combined.
pub trait Backend {
    /// Start watching a descriptor.
    fn add(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno>;

    /// Change the interest of a watched descriptor.
    fn modify(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno>;

    /// Stop watching a descriptor.
    fn remove(&mut self, fd: RawFd) -> Result<(), Errno>;

    /// Block until a descriptor is ready or the timeout expired.
    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Events)>,
    ) -> Result<(), Errno>;
}

/// Round the timeout up to milliseconds, -1 waits forever.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let mut ms = timeout.as_millis();
            if Duration::from_millis(ms as u64) < timeout {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn poll_flags(interest: Events) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.contains(Events::READ) {
        flags |= PollFlags::POLLIN;
    }
    if interest.contains(Events::WRITE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn poll_events(revents: PollFlags) -> Events {
    let mut events = Events::empty();
    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
        events |= Events::READ;
    }
    if revents.contains(PollFlags::POLLOUT) {
        events |= Events::WRITE;
    }
    if revents.contains(PollFlags::POLLHUP) {
        events |= Events::HANGUP;
    }
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        events |= Events::ERROR;
    }
    events
}

/// Portable `poll(2)` backend.
#[derive(Debug, Default)]
pub struct Poll {
    fds: Vec<(RawFd, Events)>,
}

impl Poll {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for Poll {
    fn add(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        if self.fds.iter().any(|(other, _)| *other == fd) {
            return Err(Errno::EEXIST);
        }
        self.fds.push((fd, interest));
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        let entry = self
            .fds
            .iter_mut()
            .find(|(other, _)| *other == fd)
            .ok_or(Errno::ENOENT)?;
        entry.1 = interest;
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<(), Errno> {
        let len = self.fds.len();
        self.fds.retain(|(other, _)| *other != fd);
        if len == self.fds.len() {
            Err(Errno::ENOENT)
        } else {
            Ok(())
        }
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Events)>,
    ) -> Result<(), Errno> {
        let mut pfds = self
            .fds
            .iter()
            .map(|(fd, interest)| PollFd::new(*fd, poll_flags(*interest)))
            .collect::<Vec<_>>();

        if poll(&mut pfds, timeout_ms(timeout))? > 0 {
            for (pfd, (fd, _)) in pfds.iter().zip(self.fds.iter()) {
                if let Some(revents) = pfd.revents() {
                    let events = poll_events(revents);
                    if !events.is_empty() {
                        ready.push((*fd, events));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Wait for a single descriptor without dispatching anything else.
///
/// Returns empty events if the timeout expired.  Interrupted waits
/// are retried; pending signals stay in the self-pipe for the loop.
pub fn wait_fd(fd: RawFd, interest: Events, timeout: Option<Duration>) -> Result<Events, Error> {
    if fd < 0 {
        return Err(Error::InvalidArgument("invalid descriptor"));
    }
    loop {
        let mut pfds = [PollFd::new(fd, poll_flags(interest))];
        match poll(&mut pfds, timeout_ms(timeout)) {
            Ok(0) => break Ok(Events::empty()),
            Ok(_) => break Ok(pfds[0].revents().map(poll_events).unwrap_or_default()),
            Err(Errno::EINTR) => continue,
            Err(err) => break Err(err.into()),
        }
    }
}
