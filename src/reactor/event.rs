use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bitflags::bitflags;

use crate::reactor::core::Reactor;

bitflags! {
    /// Interest and readiness bits for a single file descriptor.
    ///
    /// `BARRIER` is a dispatch modifier, not an OS-level event: a slot
    /// carrying it has its write handler invoked before its read handler
    /// within one iteration. The polling backends never forward it to the
    /// kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mask: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const BARRIER = 1 << 2;
    }
}

bitflags! {
    /// Flags selecting what a single [`Reactor::process_events`] call does.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const FILE_EVENTS = 1 << 0;
        const TIME_EVENTS = 1 << 1;
        const ALL_EVENTS = Self::FILE_EVENTS.bits() | Self::TIME_EVENTS.bits();
        /// Poll without blocking, even when a timer would otherwise set the
        /// sleep budget.
        const DONT_WAIT = 1 << 2;
        const CALL_BEFORE_SLEEP = 1 << 3;
        const CALL_AFTER_SLEEP = 1 << 4;
    }
}

pub(crate) type FileHandler = Rc<RefCell<dyn FnMut(&mut Reactor, RawFd, Mask)>>;

pub(crate) type SleepHook = Rc<RefCell<dyn FnMut(&mut Reactor)>>;

/// A readiness notification written by the backend into the scratch buffer.
/// Entries are only meaningful during the dispatch phase of one iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fired {
    pub(crate) fd: RawFd,
    pub(crate) mask: Mask,
}

impl Fired {
    pub(crate) const EMPTY: Self = Self {
        fd: -1,
        mask: Mask::empty(),
    };
}

/// One slot of the dense per-fd table. A slot with an empty mask is free;
/// its handlers are never invoked.
pub(crate) struct FileSlot {
    pub(crate) mask: Mask,
    pub(crate) read_handler: Option<FileHandler>,
    pub(crate) write_handler: Option<FileHandler>,
}

impl FileSlot {
    pub(crate) fn free() -> Self {
        Self {
            mask: Mask::empty(),
            read_handler: None,
            write_handler: None,
        }
    }
}
