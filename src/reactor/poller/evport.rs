use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{
    c_int, c_long, port_associate, port_create, port_dissociate, port_event, port_getn, time_t,
    timespec, uintptr_t, POLLERR, POLLHUP, POLLIN, POLLOUT, PORT_SOURCE_FD,
};

use crate::reactor::event::{Fired, Mask};

/// Retrieval batch per port_getn call.
const MAX_BATCH: usize = 512;

/// Solaris/illumos event-ports backend. Associations are consumed when an
/// event is retrieved, so the backend keeps its own per-fd interest record
/// and re-associates every fired fd that still holds interest.
pub(crate) struct Poller {
    portfd: RawFd,
    interests: Vec<Mask>,
    events: Vec<port_event>,
}

impl Poller {
    pub(crate) const NAME: &'static str = "evport";

    pub(crate) fn new(setsize: usize) -> io::Result<Self> {
        let portfd = unsafe { port_create() };
        if portfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            portfd,
            interests: vec![Mask::empty(); setsize],
            events: Vec::with_capacity(setsize.clamp(1, MAX_BATCH)),
        })
    }

    pub(crate) fn resize(&mut self, setsize: usize) -> io::Result<()> {
        self.interests.resize(setsize, Mask::empty());
        self.events = Vec::with_capacity(setsize.clamp(1, MAX_BATCH));
        Ok(())
    }

    pub(crate) fn add(&mut self, fd: RawFd, _old: Mask, added: Mask) -> io::Result<()> {
        let merged =
            (self.interests[fd as usize] | added) & (Mask::READABLE | Mask::WRITABLE);
        self.associate(fd, merged)?;
        self.interests[fd as usize] = merged;
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd, _old: Mask, removed: Mask) -> io::Result<()> {
        let remaining = self.interests[fd as usize] & !removed;
        if remaining.is_empty() {
            let rc = unsafe {
                port_dissociate(self.portfd, PORT_SOURCE_FD as c_int, fd as uintptr_t)
            };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
        } else {
            self.associate(fd, remaining)?;
        }
        self.interests[fd as usize] = remaining;
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
        let mut nget: u32 = 1;
        let rc = unsafe {
            port_getn(
                self.portfd,
                self.events.as_mut_ptr(),
                self.events.capacity() as u32,
                &mut nget,
                ts_ptr as *mut timespec,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // A timeout is not an error; events may still have landed.
                Some(libc::ETIME) => {}
                Some(libc::EINTR) => {
                    unsafe { self.events.set_len(0) };
                    return Ok(0);
                }
                _ => {
                    unsafe { self.events.set_len(0) };
                    return Err(err);
                }
            }
        }
        let n = (nget as usize).min(self.events.capacity());
        unsafe {
            self.events.set_len(n);
        }

        let mut count = 0;
        for i in 0..n {
            let (fd, bits, source) = {
                let ev = &self.events[i];
                (
                    ev.portev_object as RawFd,
                    ev.portev_events,
                    ev.portev_source,
                )
            };
            if source as c_int != PORT_SOURCE_FD as c_int {
                continue;
            }

            let mut mask = Mask::empty();
            if bits & POLLIN as c_int != 0 {
                mask |= Mask::READABLE;
            }
            if bits & POLLOUT as c_int != 0 {
                mask |= Mask::WRITABLE;
            }
            if bits & (POLLERR as c_int | POLLHUP as c_int) != 0 {
                mask |= Mask::READABLE | Mask::WRITABLE;
            }
            if count < fired.len() {
                fired[count] = Fired { fd, mask };
                count += 1;
            }

            // Retrieval consumed the association; restore any surviving
            // interest before handlers run.
            let interest = self
                .interests
                .get(fd as usize)
                .copied()
                .unwrap_or(Mask::empty());
            if !interest.is_empty() {
                if let Err(err) = self.associate(fd, interest) {
                    tracing::debug!(fd, error = %err, "failed to re-associate fd");
                }
            }
        }
        Ok(count)
    }

    fn associate(&self, fd: RawFd, interest: Mask) -> io::Result<()> {
        let mut bits: c_int = 0;
        if interest.contains(Mask::READABLE) {
            bits |= POLLIN as c_int;
        }
        if interest.contains(Mask::WRITABLE) {
            bits |= POLLOUT as c_int;
        }
        let rc = unsafe {
            port_associate(
                self.portfd,
                PORT_SOURCE_FD as c_int,
                fd as uintptr_t,
                bits,
                ptr::null_mut(),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if unsafe { libc::close(self.portfd) } == -1 {
            tracing::warn!(
                backend = Self::NAME,
                error = %io::Error::last_os_error(),
                "failed to close backend handle"
            );
        }
    }
}
