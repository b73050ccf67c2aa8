use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::reactor::event::{EventFlags, FileHandler, FileSlot, Fired, Mask, SleepHook};
use crate::reactor::poller::Poller;
use crate::reactor::timer::{self, TimeEvent, TimerId};

/// A single-threaded event loop multiplexing file-descriptor readiness with
/// wall-clock timers.
///
/// The reactor owns a dense per-fd event table, a scratch buffer of fired
/// events, the timer list and the OS polling backend. Handlers run on the
/// loop thread and may freely call back into the reactor: registering and
/// unregistering events, creating and deleting timers (their own included)
/// and resizing the tables are all legal mid-dispatch.
///
/// The type is `!Send`, so cross-thread use is ruled out at compile time.
pub struct Reactor {
    pub(crate) setsize: usize,
    /// Highest fd with a non-empty mask, or -1 when nothing is registered.
    pub(crate) maxfd: RawFd,
    pub(crate) events: Vec<FileSlot>,
    pub(crate) fired: Vec<Fired>,
    /// Head-inserted timer list, scanned linearly.
    pub(crate) timers: Vec<Rc<RefCell<TimeEvent>>>,
    pub(crate) next_timer_id: TimerId,
    /// Wall-clock seconds observed by the previous timer pass, used to
    /// detect the clock moving backward.
    pub(crate) last_wall_secs: i64,
    pub(crate) stop: bool,
    pub(crate) flags: EventFlags,
    pub(crate) before_sleep: Option<SleepHook>,
    pub(crate) after_sleep: Option<SleepHook>,
    pub(crate) poller: Poller,
}

impl Reactor {
    /// Creates a reactor able to track fds in `[0, setsize)`.
    pub fn new(setsize: usize) -> Result<Self, Error> {
        let poller = Poller::new(setsize)?;
        let mut events = Vec::with_capacity(setsize);
        events.resize_with(setsize, FileSlot::free);
        let reactor = Self {
            setsize,
            maxfd: -1,
            events,
            fired: vec![Fired::EMPTY; setsize],
            timers: Vec::new(),
            next_timer_id: 0,
            last_wall_secs: timer::wall_clock().0,
            stop: false,
            flags: EventFlags::empty(),
            before_sleep: None,
            after_sleep: None,
            poller,
        };
        debug!(backend = Poller::NAME, setsize, "reactor created");
        Ok(reactor)
    }

    /// Current capacity: the maximum trackable fd plus one.
    pub fn capacity(&self) -> usize {
        self.setsize
    }

    /// Forces subsequent iterations to poll with a zero timeout until
    /// cleared, regardless of per-call flags. Used to drain without
    /// sleeping when urgent work was queued from inside a handler.
    pub fn set_dont_wait(&mut self, dont_wait: bool) {
        if dont_wait {
            self.flags |= EventFlags::DONT_WAIT;
        } else {
            self.flags &= !EventFlags::DONT_WAIT;
        }
    }

    /// Grows or shrinks the tracked fd range. Shrinking below a registered
    /// fd is refused and leaves the capacity unchanged.
    pub fn resize(&mut self, setsize: usize) -> Result<(), Error> {
        if setsize == self.setsize {
            return Ok(());
        }
        if self.maxfd >= 0 && self.maxfd as usize >= setsize {
            return Err(Error::TooSmall { requested: setsize });
        }
        self.poller.resize(setsize)?;
        self.events.resize_with(setsize, FileSlot::free);
        self.fired.resize(setsize, Fired::EMPTY);
        self.setsize = setsize;
        debug!(setsize, "reactor resized");
        Ok(())
    }

    /// Registers `handler` for `mask` on `fd`, merging with any interest
    /// already present. When `mask` spans both `READABLE` and `WRITABLE`
    /// the one callable serves both slots and fires at most once per
    /// iteration; register the bits separately to install distinct handlers.
    pub fn register_file<F>(&mut self, fd: RawFd, mask: Mask, handler: F) -> Result<(), Error>
    where
        F: FnMut(&mut Reactor, RawFd, Mask) + 'static,
    {
        if fd < 0 || fd as usize >= self.setsize {
            return Err(Error::Range { fd });
        }
        let old = self.events[fd as usize].mask;
        self.poller.add(fd, old, mask)?;

        let handler: FileHandler = Rc::new(RefCell::new(handler));
        let slot = &mut self.events[fd as usize];
        slot.mask |= mask;
        if mask.contains(Mask::READABLE) {
            slot.read_handler = Some(Rc::clone(&handler));
        }
        if mask.contains(Mask::WRITABLE) {
            slot.write_handler = Some(handler);
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        Ok(())
    }

    /// Drops the `mask` bits of interest from `fd`. Silently ignores fds
    /// that are out of range or carry no interest. Removing `WRITABLE`
    /// always removes `BARRIER` with it.
    pub fn unregister_file(&mut self, fd: RawFd, mask: Mask) {
        if fd < 0 || fd as usize >= self.setsize {
            return;
        }
        if self.events[fd as usize].mask.is_empty() {
            return;
        }
        let mut mask = mask;
        if mask.contains(Mask::WRITABLE) {
            mask |= Mask::BARRIER;
        }

        let old = self.events[fd as usize].mask;
        if let Err(err) = self.poller.del(fd, old, mask) {
            // The slot bookkeeping proceeds regardless; the kernel may keep
            // stale interest until the fd is closed.
            debug!(fd, error = %err, "backend failed to drop interest");
        }

        // Handlers stay in place: the mask alone gates dispatch, and the
        // dangling callables keep the same-callable comparison stable for
        // the rest of the iteration.
        self.events[fd as usize].mask &= !mask;

        if fd == self.maxfd && self.events[fd as usize].mask.is_empty() {
            let mut j = self.maxfd - 1;
            while j >= 0 && self.events[j as usize].mask.is_empty() {
                j -= 1;
            }
            self.maxfd = j;
        }
    }

    /// Interest currently registered on `fd`; empty for out-of-range fds.
    pub fn file_interest(&self, fd: RawFd) -> Mask {
        if fd < 0 || fd as usize >= self.setsize {
            return Mask::empty();
        }
        self.events[fd as usize].mask
    }

    /// Installs a hook running right before the backend poll of each
    /// iteration that asked for it.
    pub fn set_before_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.before_sleep = Some(Rc::new(RefCell::new(hook)));
    }

    pub fn clear_before_sleep(&mut self) {
        self.before_sleep = None;
    }

    /// Installs a hook running right after the backend poll returns.
    pub fn set_after_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.after_sleep = Some(Rc::new(RefCell::new(hook)));
    }

    pub fn clear_after_sleep(&mut self) {
        self.after_sleep = None;
    }

    /// Runs one iteration: compute the sleep budget, poll the backend,
    /// dispatch fired file events, then run expired timers. Returns the
    /// number of fired fds plus timer invocations.
    ///
    /// With no flag selecting file or time events the call returns
    /// immediately. `DONT_WAIT` (in `flags` or latched on the reactor)
    /// zeroes the sleep budget; otherwise the budget stretches to the
    /// nearest timer deadline, or forever when only file events exist.
    pub fn process_events(&mut self, flags: EventFlags) -> usize {
        let mut processed = 0;

        if !flags.intersects(EventFlags::ALL_EVENTS) {
            return 0;
        }

        // Poll even with no files registered: the poll timeout is what puts
        // the loop to sleep until the nearest timer is due.
        if self.maxfd != -1
            || (flags.contains(EventFlags::TIME_EVENTS) && !flags.contains(EventFlags::DONT_WAIT))
        {
            let shortest = if flags.contains(EventFlags::TIME_EVENTS)
                && !flags.contains(EventFlags::DONT_WAIT)
            {
                self.nearest_deadline()
            } else {
                None
            };

            let mut timeout = match shortest {
                Some((when_sec, when_ms)) => {
                    let (now_sec, now_ms) = timer::wall_clock();
                    let ms = (when_sec - now_sec) * 1000 + (when_ms - now_ms);
                    Some(Duration::from_millis(ms.max(0) as u64))
                }
                // No deadline to meet: spin or block depending on the caller.
                None => {
                    if flags.contains(EventFlags::DONT_WAIT) {
                        Some(Duration::ZERO)
                    } else {
                        None
                    }
                }
            };
            if self.flags.contains(EventFlags::DONT_WAIT) {
                timeout = Some(Duration::ZERO);
            }

            if flags.contains(EventFlags::CALL_BEFORE_SLEEP) {
                if let Some(hook) = self.before_sleep.clone() {
                    (&mut *hook.borrow_mut())(self);
                }
            }

            let numevents = match self.poller.poll(self.maxfd, &mut self.fired, timeout) {
                Ok(n) => n,
                Err(err) => {
                    warn!(backend = Poller::NAME, error = %err, "poll failed, continuing with no fired events");
                    0
                }
            };

            if flags.contains(EventFlags::CALL_AFTER_SLEEP) {
                if let Some(hook) = self.after_sleep.clone() {
                    (&mut *hook.borrow_mut())(self);
                }
            }

            for j in 0..numevents {
                let Fired { fd, mask } = match self.fired.get(j) {
                    Some(fired) => *fired,
                    // The fired buffer shrank under a mid-dispatch resize.
                    None => break,
                };

                let slot_mask = match self.events.get(fd as usize) {
                    Some(slot) => slot.mask,
                    None => continue,
                };
                // With BARRIER the slot asked for its write side to drain
                // before new input is served, so the call order flips.
                let invert = slot_mask.contains(Mask::BARRIER);
                let mut fired_count = 0;

                if !invert {
                    if let Some((handler, _)) = self.ready_handler(fd, mask, Mask::READABLE) {
                        (&mut *handler.borrow_mut())(self, fd, mask);
                        fired_count += 1;
                    }
                }

                // The slot is re-read on every step: the handler may have
                // unregistered the fd, swapped handlers or resized the table.
                if let Some((handler, shared)) = self.ready_handler(fd, mask, Mask::WRITABLE) {
                    if fired_count == 0 || !shared {
                        (&mut *handler.borrow_mut())(self, fd, mask);
                        fired_count += 1;
                    }
                }

                if invert {
                    if let Some((handler, shared)) = self.ready_handler(fd, mask, Mask::READABLE) {
                        if fired_count == 0 || !shared {
                            (&mut *handler.borrow_mut())(self, fd, mask);
                            fired_count += 1;
                        }
                    }
                }

                processed += 1;
            }
        }

        if flags.contains(EventFlags::TIME_EVENTS) {
            processed += self.process_time_events();
        }

        processed
    }

    /// Handler for `bit` on `fd` if that bit is both registered and fired,
    /// along with whether the read and write slots currently share one
    /// callable (a shared callable fires at most once per iteration).
    fn ready_handler(&self, fd: RawFd, fired_mask: Mask, bit: Mask) -> Option<(FileHandler, bool)> {
        let slot = self.events.get(fd as usize)?;
        if !(slot.mask & fired_mask).contains(bit) {
            return None;
        }
        let handler = if bit == Mask::READABLE {
            slot.read_handler.as_ref()?
        } else {
            slot.write_handler.as_ref()?
        };
        let shared = match (&slot.read_handler, &slot.write_handler) {
            (Some(read), Some(write)) => Rc::ptr_eq(read, write),
            _ => false,
        };
        Some((Rc::clone(handler), shared))
    }

    /// Drives [`Reactor::process_events`] until [`Reactor::stop`] is called.
    pub fn run(&mut self) {
        self.stop = false;
        while !self.stop {
            self.process_events(
                EventFlags::ALL_EVENTS
                    | EventFlags::CALL_BEFORE_SLEEP
                    | EventFlags::CALL_AFTER_SLEEP,
            );
        }
    }

    /// Makes [`Reactor::run`] return at its next top-of-loop check. Callable
    /// from any handler.
    pub fn stop(&mut self) {
        self.stop = true;
    }
}
