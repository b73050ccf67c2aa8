use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use crate::reactor::event::{Fired, Mask};

pub(crate) struct Poller {
    epfd: RawFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub(crate) const NAME: &'static str = "epoll";

    pub(crate) fn new(setsize: usize) -> io::Result<Self> {
        let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            events: vec![epoll_event { events: 0, u64: 0 }; setsize],
        })
    }

    pub(crate) fn resize(&mut self, setsize: usize) -> io::Result<()> {
        self.events.resize(setsize, epoll_event { events: 0, u64: 0 });
        Ok(())
    }

    pub(crate) fn add(&mut self, fd: RawFd, old: Mask, added: Mask) -> io::Result<()> {
        // The fd is new to the kernel only when no interest existed at all.
        let op = if old.is_empty() {
            EPOLL_CTL_ADD
        } else {
            EPOLL_CTL_MOD
        };
        let mut ev = epoll_event {
            events: Self::event_bits(old | added),
            u64: fd as u64,
        };
        if unsafe { epoll_ctl(self.epfd, op, fd, &mut ev) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd, old: Mask, removed: Mask) -> io::Result<()> {
        let remaining = old & !removed;
        let rc = if Self::event_bits(remaining) == 0 {
            // Some kernels reject a null event pointer, so pass a dummy.
            let mut ev = epoll_event { events: 0, u64: fd as u64 };
            unsafe { epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, &mut ev) }
        } else {
            let mut ev = epoll_event {
                events: Self::event_bits(remaining),
                u64: fd as u64,
            };
            unsafe { epoll_ctl(self.epfd, EPOLL_CTL_MOD, fd, &mut ev) }
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn poll(
        &mut self,
        _maxfd: RawFd,
        fired: &mut [Fired],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);

        let n = unsafe {
            epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let n = (n as usize).min(fired.len());
        for (slot, ev) in fired.iter_mut().zip(&self.events[..n]) {
            let bits = ev.events;
            let mut mask = Mask::empty();
            if bits & EPOLLIN as u32 != 0 {
                mask |= Mask::READABLE;
            }
            if bits & EPOLLOUT as u32 != 0 {
                mask |= Mask::WRITABLE;
            }
            // Errors and hang-ups wake both sides so whichever handler is
            // installed gets the chance to observe the failure.
            if bits & EPOLLERR as u32 != 0 {
                mask |= Mask::READABLE | Mask::WRITABLE;
            }
            if bits & EPOLLHUP as u32 != 0 {
                mask |= Mask::READABLE | Mask::WRITABLE;
            }
            *slot = Fired {
                fd: ev.u64 as RawFd,
                mask,
            };
        }
        Ok(n)
    }

    fn event_bits(mask: Mask) -> u32 {
        let mut bits = 0;
        if mask.contains(Mask::READABLE) {
            bits |= EPOLLIN as u32;
        }
        if mask.contains(Mask::WRITABLE) {
            bits |= EPOLLOUT as u32;
        }
        bits
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            tracing::warn!(
                backend = Self::NAME,
                error = %io::Error::last_os_error(),
                "failed to close backend handle"
            );
        }
    }
}
