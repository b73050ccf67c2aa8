//! Readiness-polling backends.
//!
//! Exactly one backend is compiled in, chosen by target capability in
//! descending order of performance: event ports, epoll, kqueue, then the
//! portable select fallback. Every backend exposes the same inherent API and
//! the same observable behavior, so the reactor core is backend-agnostic.

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod evport;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub(crate) use evport::Poller;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;

#[cfg(not(any(
    target_os = "solaris",
    target_os = "illumos",
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
mod select;
#[cfg(not(any(
    target_os = "solaris",
    target_os = "illumos",
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub(crate) use select::Poller;

/// Name of the multiplexing backend compiled into this build.
pub fn backend_name() -> &'static str {
    Poller::NAME
}
