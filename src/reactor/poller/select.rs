use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{fd_set, select, suseconds_t, time_t, timeval, FD_CLR, FD_ISSET, FD_SET, FD_ZERO};

use crate::reactor::event::{Fired, Mask};

/// Portable fallback backend. select(2) keeps no kernel-side registry, so
/// the interest sets and a per-fd mask record live here.
pub(crate) struct Poller {
    rfds: fd_set,
    wfds: fd_set,
    interests: Vec<Mask>,
}

impl Poller {
    pub(crate) const NAME: &'static str = "select";

    pub(crate) fn new(setsize: usize) -> io::Result<Self> {
        if setsize > libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut poller = Self {
            rfds: unsafe { mem::zeroed() },
            wfds: unsafe { mem::zeroed() },
            interests: vec![Mask::empty(); setsize],
        };
        unsafe {
            FD_ZERO(&mut poller.rfds);
            FD_ZERO(&mut poller.wfds);
        }
        Ok(poller)
    }

    pub(crate) fn resize(&mut self, setsize: usize) -> io::Result<()> {
        if setsize > libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.interests.resize(setsize, Mask::empty());
        Ok(())
    }

    pub(crate) fn add(&mut self, fd: RawFd, _old: Mask, added: Mask) -> io::Result<()> {
        if added.contains(Mask::READABLE) {
            unsafe { FD_SET(fd, &mut self.rfds) };
        }
        if added.contains(Mask::WRITABLE) {
            unsafe { FD_SET(fd, &mut self.wfds) };
        }
        self.interests[fd as usize] |= added & (Mask::READABLE | Mask::WRITABLE);
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd, _old: Mask, removed: Mask) -> io::Result<()> {
        if removed.contains(Mask::READABLE) {
            unsafe { FD_CLR(fd, &mut self.rfds) };
        }
        if removed.contains(Mask::WRITABLE) {
            unsafe { FD_CLR(fd, &mut self.wfds) };
        }
        self.interests[fd as usize] &= !removed;
        Ok(())
    }

    pub(crate) fn poll(
        &mut self,
        maxfd: RawFd,
        fired: &mut [Fired],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        // select mutates its sets in place; work on copies.
        let mut rfds = self.rfds;
        let mut wfds = self.wfds;

        let mut tv;
        let tv_ptr = match timeout {
            Some(t) => {
                tv = timeval {
                    tv_sec: t.as_secs() as time_t,
                    tv_usec: t.subsec_micros() as suseconds_t,
                };
                &mut tv as *mut timeval
            }
            None => ptr::null_mut(),
        };

        let rc = unsafe { select(maxfd + 1, &mut rfds, &mut wfds, ptr::null_mut(), tv_ptr) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(0);
        }

        let mut count = 0;
        for fd in 0..=maxfd {
            let interest = self.interests[fd as usize];
            if interest.is_empty() {
                continue;
            }
            let mut mask = Mask::empty();
            if interest.contains(Mask::READABLE) && unsafe { FD_ISSET(fd, &rfds) } {
                mask |= Mask::READABLE;
            }
            if interest.contains(Mask::WRITABLE) && unsafe { FD_ISSET(fd, &wfds) } {
                mask |= Mask::WRITABLE;
            }
            if !mask.is_empty() && count < fired.len() {
                fired[count] = Fired { fd, mask };
                count += 1;
            }
        }
        Ok(count)
    }
}
