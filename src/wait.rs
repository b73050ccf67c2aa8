use std::os::unix::io::RawFd;

use crate::error::Error;
use crate::reactor::event::Mask;

/// Blocks up to `timeout_ms` milliseconds until `fd` is ready for the
/// events in `mask`, with a negative timeout meaning forever.
///
/// Returns the readiness actually observed, or an empty mask on timeout.
/// Errors and hang-ups are reported as `WRITABLE` so callers discover a
/// broken peer by attempting the write. This helper performs a one-shot OS
/// poll of its own; it touches no reactor state and is freely reentrant.
pub fn wait_fd(fd: RawFd, mask: Mask, timeout_ms: i64) -> Result<Mask, Error> {
    let mut pfd = libc::pollfd {
        fd,
        events: 0,
        revents: 0,
    };
    if mask.contains(Mask::READABLE) {
        pfd.events |= libc::POLLIN;
    }
    if mask.contains(Mask::WRITABLE) {
        pfd.events |= libc::POLLOUT;
    }

    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms as libc::c_int) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut fired = Mask::empty();
    if rc == 1 {
        if pfd.revents & libc::POLLIN != 0 {
            fired |= Mask::READABLE;
        }
        if pfd.revents & libc::POLLOUT != 0 {
            fired |= Mask::WRITABLE;
        }
        if pfd.revents & libc::POLLERR != 0 {
            fired |= Mask::WRITABLE;
        }
        if pfd.revents & libc::POLLHUP != 0 {
            fired |= Mask::WRITABLE;
        }
    }
    Ok(fired)
}
