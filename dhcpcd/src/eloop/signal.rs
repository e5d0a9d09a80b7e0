//! Signal delivery through a self-pipe.

use crate::{
    error::Error,
    net::{set_cloexec, set_nonblocking, Fd},
};
use arrayvec::ArrayVec;
use log::warn;
use nix::{
    errno::Errno,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{self, pipe},
};
use std::{
    convert::TryFrom,
    os::unix::io::{AsRawFd, RawFd},
    sync::atomic::{AtomicI32, Ordering},
};

/// Maximum number of signals pending between two loop iterations.
pub const SIGNAL_QUEUE_MAX: usize = 5;

/// Write end of the self-pipe, -1 if no loop handles signals.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signo: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd != -1 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Self-pipe and the bounded queue of received signals.
pub(crate) struct SignalPipe {
    read: Fd,
    write: Fd,
    signals: Vec<Signal>,
    pending: ArrayVec<Signal, SIGNAL_QUEUE_MAX>,
}

impl SignalPipe {
    pub fn new(signals: &[Signal]) -> Result<Self, Error> {
        let (read, write) = pipe()?;
        let (read, write) = (Fd::from(read), Fd::from(write));
        for fd in &[&read, &write] {
            set_cloexec(fd.as_raw_fd(), true)?;
            set_nonblocking(fd.as_raw_fd(), true)?;
        }

        let previous = SIGNAL_FD.swap(write.as_raw_fd(), Ordering::SeqCst);
        if previous != -1 && previous != write.as_raw_fd() {
            warn!("signal pipe {} replaced", previous);
        }

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in signals {
            unsafe { sigaction(*signal, &action) }?;
        }

        Ok(Self {
            read,
            write,
            signals: signals.to_vec(),
            pending: ArrayVec::new(),
        })
    }

    /// Move all signals from the pipe into the pending queue.
    pub fn read(&mut self) {
        let mut buf = [0u8; 32];
        loop {
            match unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(length) => {
                    for signo in &buf[..length] {
                        if let Ok(signal) = Signal::try_from(libc::c_int::from(*signo)) {
                            self.push(signal);
                        }
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    /// Queue a signal, dropping the oldest one when full.
    pub fn push(&mut self, signal: Signal) {
        if self.pending.is_full() {
            let dropped = self.pending.remove(0);
            warn!("signal queue full, dropping {:?}", dropped);
        }
        self.pending.push(signal);
    }

    /// Oldest pending signal.
    pub fn pop(&mut self) -> Option<Signal> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in &self.signals {
            let _ = unsafe { sigaction(*signal, &action) };
        }
        let _ = SIGNAL_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
