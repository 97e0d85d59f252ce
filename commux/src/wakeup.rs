//! Wakeup multiplexer: per-interface event descriptors plus an internal
//! self-pipe, aggregated into one epoll set application threads block on.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::{pipe2, read, write};
use tracing::{debug, error};

use crate::caps::WakeupEvents;
use crate::error::{Error, Result};
use crate::transport::IfaceWakeup;

/// Event classes every interface wakeup is armed for.
pub(crate) const ARM_EVENTS: WakeupEvents = WakeupEvents::TX_COMPLETION
    .union(WakeupEvents::RX_AM)
    .union(WakeupEvents::RX_SIGNALED_AM);

/// Cross-thread signaling handle: the self-pipe write end.
///
/// Cloneable and sendable; writing wakes the worker's `wait` regardless of
/// which thread calls it.
#[derive(Clone)]
pub struct SignalHandle {
    pipe_w: Arc<OwnedFd>,
}

impl SignalHandle {
    /// Write one byte to the self-pipe. A full pipe means a signal is
    /// already pending, which counts as success.
    pub fn signal(&self) -> Result<()> {
        match write(&*self.pipe_w, &[0u8]) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => {
                error!("signaling wakeup failed: {}", e);
                Err(Error::Io(std::io::Error::from_raw_os_error(e as i32)))
            }
        }
    }
}

/// Worker wakeup state: self-pipe, dense per-interface wakeup handles and
/// the lazily-built aggregating epoll set.
pub(crate) struct WakeupState {
    pipe_r: OwnedFd,
    pipe_w: Arc<OwnedFd>,
    iface_wakeups: Mutex<Vec<Option<Box<dyn IfaceWakeup>>>>,
    efd: Mutex<Option<Epoll>>,
}

impl WakeupState {
    /// Create the self-pipe (both ends non-blocking) and the empty dense
    /// wakeup array. On failure everything allocated so far is unwound and
    /// the captured status returned.
    pub(crate) fn new(num_tls: usize) -> Result<Self> {
        let (pipe_r, pipe_w) = pipe2(OFlag::O_NONBLOCK).map_err(|e| {
            error!("failed to create wakeup pipe: {}", e);
            Error::from(e)
        })?;
        Ok(Self {
            pipe_r,
            pipe_w: Arc::new(pipe_w),
            iface_wakeups: Mutex::new((0..num_tls).map(|_| None).collect()),
            efd: Mutex::new(None),
        })
    }

    fn wakeups(&self) -> MutexGuard<'_, Vec<Option<Box<dyn IfaceWakeup>>>> {
        self.iface_wakeups.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the wakeup handle for one interface slot.
    pub(crate) fn set_iface_wakeup(&self, rsc_index: usize, wakeup: Box<dyn IfaceWakeup>) {
        self.wakeups()[rsc_index] = Some(wakeup);
    }

    /// True iff the slot holds a wakeup handle.
    pub(crate) fn has_iface_wakeup(&self, rsc_index: usize) -> bool {
        self.wakeups()[rsc_index].is_some()
    }

    /// Drop the wakeup handle for one interface, part of interface close.
    pub(crate) fn clear_iface_wakeup(&self, rsc_index: usize) {
        self.wakeups()[rsc_index] = None;
    }

    /// The signaling handle for this worker.
    pub(crate) fn signal_handle(&self) -> SignalHandle {
        SignalHandle {
            pipe_w: Arc::clone(&self.pipe_w),
        }
    }

    /// Lazily build the aggregating event descriptor: the self-pipe read
    /// end plus every per-interface wakeup descriptor. Stable once built.
    pub(crate) fn get_efd(&self) -> Result<RawFd> {
        let mut efd = self.efd.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(epoll) = efd.as_ref() {
            return Ok(epoll.0.as_raw_fd());
        }

        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(|e| {
            error!("failed to create epoll descriptor: {}", e);
            Error::from(e)
        })?;
        add_fd(&epoll, self.pipe_r.as_raw_fd())?;
        for (index, wakeup) in self.wakeups().iter().enumerate() {
            if let Some(wakeup) = wakeup {
                add_fd(&epoll, wakeup.efd()).inspect_err(|_| {
                    debug!(rsc_index = index, "failed to add iface wakeup fd");
                })?;
            }
        }

        let fd = epoll.0.as_raw_fd();
        *efd = Some(epoll);
        Ok(fd)
    }

    /// Arm every interface wakeup, then drain the self-pipe.
    ///
    /// Returns [`Error::Busy`] when a transport already had events pending
    /// or the pipe carried a signal: the caller must skip the wait and
    /// re-progress. Events seen here are never lost, only reported early.
    pub(crate) fn arm(&self) -> Result<()> {
        let mut busy = false;
        for wakeup in self.wakeups().iter().flatten() {
            match wakeup.arm(ARM_EVENTS) {
                Ok(()) => {}
                Err(Error::Busy) => busy = true,
                Err(e) => return Err(e),
            }
        }

        if self.drain_pipe()? > 0 {
            busy = true;
        }

        if busy {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }

    /// Block on the aggregating descriptor until at least one event is
    /// ready, retrying on interruption. `Busy` from arm skips the blocking
    /// step entirely.
    pub(crate) fn wait(&self, num_tls: usize) -> Result<()> {
        self.get_efd()?;
        match self.arm() {
            Err(Error::Busy) => return Ok(()),
            other => other?,
        }

        let efd = self.efd.lock().unwrap_or_else(|e| e.into_inner());
        let epoll = efd.as_ref().expect("efd built above");
        let mut events = vec![EpollEvent::empty(); num_tls.max(1)];
        loop {
            match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("polling internally for events failed: {}", e);
                    return Err(Error::from(e));
                }
            }
        }
    }

    /// Write one byte to the self-pipe; see [`SignalHandle::signal`].
    pub(crate) fn signal(&self) -> Result<()> {
        self.signal_handle().signal()
    }

    /// Non-blocking reads until EAGAIN; returns the number of bytes drained.
    fn drain_pipe(&self) -> Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; 32];
        loop {
            match read(self.pipe_r.as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(Errno::EAGAIN) => return Ok(total),
                Err(e) => {
                    error!("read from internal pipe failed: {}", e);
                    return Err(Error::from(e));
                }
            }
        }
    }
}

fn add_fd(epoll: &Epoll, fd: RawFd) -> Result<()> {
    // The fd is owned by the pipe or an interface wakeup, both outliving
    // the epoll set.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    epoll
        .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
        .map_err(|e| {
            error!("failed to add descriptor to epoll: {}", e);
            Error::from(e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_then_arm_is_busy() {
        let wakeup = WakeupState::new(0).unwrap();
        wakeup.signal().unwrap();
        assert!(matches!(wakeup.arm(), Err(Error::Busy)));
        // Pipe was drained by the busy arm; a fresh arm succeeds.
        assert!(wakeup.arm().is_ok());
    }

    #[test]
    fn test_wait_returns_after_pre_signal() {
        let wakeup = WakeupState::new(0).unwrap();
        wakeup.signal().unwrap();
        // arm reports Busy, so wait must return immediately.
        wakeup.wait(0).unwrap();
    }

    #[test]
    fn test_efd_is_stable() {
        let wakeup = WakeupState::new(0).unwrap();
        let fd1 = wakeup.get_efd().unwrap();
        let fd2 = wakeup.get_efd().unwrap();
        assert_eq!(fd1, fd2);
    }

    #[test]
    fn test_signal_coalesces() {
        let wakeup = WakeupState::new(0).unwrap();
        for _ in 0..4 {
            wakeup.signal().unwrap();
        }
        assert!(matches!(wakeup.arm(), Err(Error::Busy)));
        assert!(wakeup.arm().is_ok());
    }
}
