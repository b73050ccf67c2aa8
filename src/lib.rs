//! Single-threaded event-driven reactor multiplexing file-descriptor
//! readiness with wall-clock timers.
//!
//! The reactor watches a set of file descriptors through the best OS
//! polling primitive available at build time and interleaves a timer list
//! with the readiness dispatch, sleeping in the kernel exactly as long as
//! the nearest deadline allows. Handlers run on the loop thread and may
//! mutate the event set from inside a callback, including deleting the
//! timer currently being serviced.
//!
//! # Architecture
//!
//! - **Reactor**: owns the per-fd event table, the timer list and the
//!   backend; drives registration, dispatch and the main loop
//! - **Poller**: compile-time selected backend (event ports, epoll, kqueue
//!   or the select fallback), all with identical observable behavior
//! - **Mask / EventFlags**: interest bits per fd and per-iteration flags
//! - **Timers**: head-inserted unordered list with tombstone deletion and
//!   backward-clock recovery
//! - **wait_fd**: standalone blocking wait on a single descriptor
//!
//! # Example
//!
//! ```no_run
//! use muxloop::{Reactor, TimerNext};
//!
//! let mut reactor = Reactor::new(1024).unwrap();
//! reactor.create_timer(1_000, |reactor, _id| {
//!     reactor.stop();
//!     TimerNext::Stop
//! });
//! reactor.run();
//! ```

mod error;
mod reactor;
mod wait;

pub use crate::error::Error;
pub use crate::reactor::core::Reactor;
pub use crate::reactor::event::{EventFlags, Mask};
pub use crate::reactor::poller::backend_name;
pub use crate::reactor::timer::{TimerId, TimerNext};
pub use crate::wait::wait_fd;
