use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{c_long, kevent, kqueue, time_t, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE};

use crate::reactor::event::{Fired, Mask};

pub(crate) struct Poller {
    kqfd: RawFd,
    events: Vec<kevent>,
}

impl Poller {
    pub(crate) const NAME: &'static str = "kqueue";

    pub(crate) fn new(setsize: usize) -> io::Result<Self> {
        let kqfd = unsafe { kqueue() };
        if kqfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kqfd,
            events: Vec::with_capacity(setsize),
        })
    }

    pub(crate) fn resize(&mut self, setsize: usize) -> io::Result<()> {
        self.events = Vec::with_capacity(setsize);
        Ok(())
    }

    pub(crate) fn add(&mut self, fd: RawFd, _old: Mask, added: Mask) -> io::Result<()> {
        if added.contains(Mask::READABLE) {
            self.change(fd, EVFILT_READ, EV_ADD)?;
        }
        if added.contains(Mask::WRITABLE) {
            self.change(fd, EVFILT_WRITE, EV_ADD)?;
        }
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd, old: Mask, removed: Mask) -> io::Result<()> {
        // Only drop filters the kernel actually holds, or EV_DELETE reports
        // a spurious ENOENT.
        let dropped = old & removed;
        if dropped.contains(Mask::READABLE) {
            self.change(fd, EVFILT_READ, EV_DELETE)?;
        }
        if dropped.contains(Mask::WRITABLE) {
            self.change(fd, EVFILT_WRITE, EV_DELETE)?;
        }
        Ok(())
    }

    pub(crate) fn poll(
        &mut self,
        _maxfd: RawFd,
        fired: &mut [Fired],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let ts;
        let ts_ptr = match timeout {
            Some(t) => {
                ts = timespec {
                    tv_sec: t.as_secs() as time_t,
                    tv_nsec: t.subsec_nanos() as c_long,
                };
                &ts as *const timespec
            }
            None => ptr::null(),
        };

        unsafe {
            self.events.set_len(self.events.capacity());
        }
        let n = unsafe {
            kevent(
                self.kqfd,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                ts_ptr,
            )
        };
        if n == -1 {
            unsafe {
                self.events.set_len(0);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        let n = n as usize;
        unsafe {
            self.events.set_len(n);
        }

        // The kernel reports one kevent per filter; fold read and write
        // readiness for the same fd into a single fired entry.
        let mut count = 0;
        for ev in &self.events[..n] {
            let fd = ev.ident as RawFd;
            let mut mask = Mask::empty();
            if ev.filter == EVFILT_READ {
                mask |= Mask::READABLE;
            }
            if ev.filter == EVFILT_WRITE {
                mask |= Mask::WRITABLE;
            }
            if let Some(entry) = fired[..count].iter_mut().find(|f| f.fd == fd) {
                entry.mask |= mask;
            } else if count < fired.len() {
                fired[count] = Fired { fd, mask };
                count += 1;
            }
        }
        Ok(count)
    }

    fn change(&mut self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let mut ev: kevent = unsafe { mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter;
        ev.flags = flags;
        if unsafe { kevent(self.kqfd, &ev, 1, ptr::null_mut(), 0, ptr::null()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if unsafe { libc::close(self.kqfd) } == -1 {
            tracing::warn!(
                backend = Self::NAME,
                error = %io::Error::last_os_error(),
                "failed to close backend handle"
            );
        }
    }
}
