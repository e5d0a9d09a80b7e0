//! BSD `kqueue(2)` backend.

use super::{backend::Backend, Events};
use crate::{error::Error, net::Fd};
use nix::{
    errno::Errno,
    sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent},
};
use std::{
    collections::BTreeMap,
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};

const EVENTS_MIN: usize = 64;

fn change(fd: RawFd, filter: EventFilter, flags: EventFlag) -> KEvent {
    KEvent::new(fd as usize, filter, flags, FilterFlag::empty(), 0, 0)
}

#[derive(Debug)]
pub struct Kqueue {
    fd: Fd,
    interest: BTreeMap<RawFd, Events>,
    events: Vec<KEvent>,
}

impl Kqueue {
    pub fn new() -> Result<Self, Error> {
        let fd = kqueue()?;
        crate::net::set_cloexec(fd, true)?;
        Ok(Self {
            fd: Fd::from(fd),
            interest: BTreeMap::new(),
            events: vec![change(0, EventFilter::EVFILT_READ, EventFlag::empty()); EVENTS_MIN],
        })
    }

    /// Add or delete the read and write filters that changed.
    fn apply(&mut self, fd: RawFd, old: Events, new: Events) -> Result<(), Errno> {
        let mut changes = vec![];
        for (flag, filter) in &[
            (Events::READ, EventFilter::EVFILT_READ),
            (Events::WRITE, EventFilter::EVFILT_WRITE),
        ] {
            if new.contains(*flag) && !old.contains(*flag) {
                changes.push(change(fd, *filter, EventFlag::EV_ADD));
            } else if !new.contains(*flag) && old.contains(*flag) {
                changes.push(change(fd, *filter, EventFlag::EV_DELETE));
            }
        }
        if !changes.is_empty() {
            kevent_ts(self.fd.as_raw_fd(), &changes, &mut [], None)?;
        }
        Ok(())
    }
}

impl Backend for Kqueue {
    fn add(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        if self.interest.contains_key(&fd) {
            return Err(Errno::EEXIST);
        }
        self.apply(fd, Events::empty(), interest)?;
        self.interest.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Events) -> Result<(), Errno> {
        let old = *self.interest.get(&fd).ok_or(Errno::ENOENT)?;
        self.apply(fd, old, interest)?;
        self.interest.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<(), Errno> {
        let old = self.interest.remove(&fd).ok_or(Errno::ENOENT)?;
        self.apply(fd, old, Events::empty())
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Events)>,
    ) -> Result<(), Errno> {
        let timeout = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let count = kevent_ts(self.fd.as_raw_fd(), &[], &mut self.events, timeout)?;

        // Read and write filters are separate events, combine them.
        let mut combined: BTreeMap<RawFd, Events> = BTreeMap::new();
        for event in &self.events[..count] {
            let fd = event.ident() as RawFd;
            let mut events = match event.filter() {
                Ok(EventFilter::EVFILT_READ) => Events::READ,
                Ok(EventFilter::EVFILT_WRITE) => Events::WRITE,
                _ => Events::empty(),
            };
            if event.flags().contains(EventFlag::EV_EOF) {
                events |= Events::HANGUP;
            }
            if event.flags().contains(EventFlag::EV_ERROR) {
                events |= Events::ERROR;
            }
            *combined.entry(fd).or_default() |= events;
        }
        ready.extend(combined);

        Ok(())
    }
}
