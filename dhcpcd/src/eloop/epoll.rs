//! Linux `epoll(7)` backend.

use super::{
    backend::{timeout_ms, Backend},
    Events,
};
use crate::{error::Error, net::Fd};
use nix::{
    errno::Errno,
    sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp},
};
use std::{
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};

const EVENTS_MIN: usize = 64;

#[derive(Debug)]
pub struct Epoll {
    fd: Fd,
    events: Vec<EpollEvent>,
}

impl Epoll {
    pub fn new() -> Result<Self, Error> {
        let fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            fd: Fd::from(fd),
            events: vec![EpollEvent::empty(); EVENTS_MIN],
        })
    }

    fn ctl(&self, op: EpollOp, fd: RawFd, interest: Events) -> Result<(), Errno> {
        let mut flags = EpollFlags::empty();
        if interest.contains(Events::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.contains(Events::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event)
    }
}

impl Backend for Epoll {
    fn add(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        self.ctl(EpollOp::EpollCtlAdd, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        self.ctl(EpollOp::EpollCtlMod, fd, interest)
    }

    fn remove(&mut self, fd: RawFd) -> Result<(), Errno> {
        epoll_ctl(self.fd.as_raw_fd(), EpollOp::EpollCtlDel, fd, None)
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Events)>,
    ) -> Result<(), Errno> {
        let count = epoll_wait(
            self.fd.as_raw_fd(),
            &mut self.events,
            timeout_ms(timeout) as isize,
        )?;

        for event in &self.events[..count] {
            let flags = event.events();
            let mut events = Events::empty();
            if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
                events |= Events::READ;
            }
            if flags.contains(EpollFlags::EPOLLOUT) {
                events |= Events::WRITE;
            }
            if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
                events |= Events::HANGUP;
            }
            if flags.contains(EpollFlags::EPOLLERR) {
                events |= Events::ERROR;
            }
            ready.push((event.data() as RawFd, events));
        }

        // Grow the event list when it was filled up.
        if count == self.events.len() {
            self.events.resize(count * 2, EpollEvent::empty());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Epoll;
    use crate::eloop::{backend::Backend, Events};
    use std::{
        io::Write,
        os::unix::{io::AsRawFd, net::UnixStream},
    };

    #[test]
    fn test_epoll() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut backend = Epoll::new().unwrap();

        backend
            .add(b.as_raw_fd(), Events::READ | Events::WRITE)
            .unwrap();
        backend.modify(b.as_raw_fd(), Events::READ).unwrap();

        a.write_all(b"x").unwrap();
        let mut ready = vec![];
        backend.wait(None, &mut ready).unwrap();
        assert_eq!(ready, vec![(b.as_raw_fd(), Events::READ)]);

        backend.remove(b.as_raw_fd()).unwrap();
    }
}
