//! Timer bookkeeping for the reactor.
//!
//! Timers live in a head-inserted list and carry wall-clock deadlines. The
//! list is deliberately scanned linearly: handlers are allowed to create and
//! delete timers (including the one currently running) while a pass is in
//! flight, and an unordered list with tombstone deletion tolerates that kind
//! of mutation where a heap or tree would not. Deletion marks a node with a
//! sentinel id; the node is unlinked on a later pass once no invocation holds
//! a reference to it, and its finalizer runs at unlink time.
//!
//! Deadlines are wall-clock on purpose: if the system clock jumps backward,
//! every pending deadline is forced to expire on the next pass. Firing early
//! once is recoverable; a timer stranded in the future is not.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::reactor::core::Reactor;

/// Identifier of a pending timer. Strictly increasing, never reused.
pub type TimerId = i64;

/// What a timer handler wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerNext {
    /// Retire this timer; it will not run again.
    Stop,
    /// Run again after this many milliseconds.
    After(u64),
}

pub(crate) type TimerHandler = Rc<RefCell<dyn FnMut(&mut Reactor, TimerId) -> TimerNext>>;

pub(crate) type TimerFinalizer = Rc<RefCell<dyn FnMut(&mut Reactor)>>;

/// Sentinel id of a logically deleted node awaiting unlink.
pub(crate) const DELETED_TIMER_ID: TimerId = -1;

pub(crate) struct TimeEvent {
    pub(crate) id: TimerId,
    pub(crate) when_sec: i64,
    pub(crate) when_ms: i64,
    pub(crate) handler: TimerHandler,
    pub(crate) finalizer: Option<TimerFinalizer>,
    /// Number of in-flight handler invocations; the node may only be
    /// unlinked when this is zero.
    pub(crate) refcount: u32,
}

/// Current wall-clock time as (seconds, milliseconds).
pub(crate) fn wall_clock() -> (i64, i64) {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    (tv.tv_sec as i64, (tv.tv_usec / 1000) as i64)
}

/// Absolute deadline `ms` milliseconds from now.
pub(crate) fn deadline_after(ms: u64) -> (i64, i64) {
    let (cur_sec, cur_ms) = wall_clock();
    let mut when_sec = cur_sec + (ms / 1000) as i64;
    let mut when_ms = cur_ms + (ms % 1000) as i64;
    if when_ms >= 1000 {
        when_sec += 1;
        when_ms -= 1000;
    }
    (when_sec, when_ms)
}

impl Reactor {
    /// Schedules `handler` to run once `after_ms` milliseconds from now.
    ///
    /// The handler decides its own fate on every invocation by returning
    /// [`TimerNext::Stop`] or [`TimerNext::After`]. Returns the timer's id,
    /// usable with [`Reactor::delete_timer`].
    pub fn create_timer<F>(&mut self, after_ms: u64, handler: F) -> TimerId
    where
        F: FnMut(&mut Reactor, TimerId) -> TimerNext + 'static,
    {
        self.insert_timer(after_ms, Rc::new(RefCell::new(handler)), None)
    }

    /// Like [`Reactor::create_timer`], with a finalizer that runs once when
    /// the retired node is unlinked from the list (whether it stopped itself
    /// or was deleted externally).
    pub fn create_timer_with_finalizer<F, G>(
        &mut self,
        after_ms: u64,
        handler: F,
        finalizer: G,
    ) -> TimerId
    where
        F: FnMut(&mut Reactor, TimerId) -> TimerNext + 'static,
        G: FnMut(&mut Reactor) + 'static,
    {
        self.insert_timer(
            after_ms,
            Rc::new(RefCell::new(handler)),
            Some(Rc::new(RefCell::new(finalizer))),
        )
    }

    fn insert_timer(
        &mut self,
        after_ms: u64,
        handler: TimerHandler,
        finalizer: Option<TimerFinalizer>,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let (when_sec, when_ms) = deadline_after(after_ms);
        self.timers.insert(
            0,
            Rc::new(RefCell::new(TimeEvent {
                id,
                when_sec,
                when_ms,
                handler,
                finalizer,
                refcount: 0,
            })),
        );
        id
    }

    /// Marks the timer with `id` as deleted. It will never fire again; the
    /// node itself is unlinked (and its finalizer run) on the next timer
    /// pass once no invocation still references it. Safe to call from any
    /// handler, including the timer's own.
    pub fn delete_timer(&mut self, id: TimerId) -> Result<(), Error> {
        for te in &self.timers {
            let mut te = te.borrow_mut();
            if te.id == id {
                te.id = DELETED_TIMER_ID;
                return Ok(());
            }
        }
        Err(Error::NotFound { id })
    }

    /// Earliest pending deadline, if any. Linear scan: the list is unordered.
    /// Tombstoned nodes still count; a stale past deadline merely costs one
    /// non-blocking poll before the next pass unlinks it.
    pub(crate) fn nearest_deadline(&self) -> Option<(i64, i64)> {
        let mut nearest: Option<(i64, i64)> = None;
        for te in &self.timers {
            let te = te.borrow();
            let earlier = match nearest {
                None => true,
                Some((sec, ms)) => {
                    te.when_sec < sec || (te.when_sec == sec && te.when_ms < ms)
                }
            };
            if earlier {
                nearest = Some((te.when_sec, te.when_ms));
            }
        }
        nearest
    }

    /// Runs every expired timer and unlinks retired nodes. Returns the
    /// number of handler invocations.
    pub(crate) fn process_time_events(&mut self) -> usize {
        let mut processed = 0;

        // A backward clock jump would strand deadlines in the future and
        // delay them arbitrarily. Force everything to expire instead.
        let now_secs = wall_clock().0;
        if now_secs < self.last_wall_secs {
            for te in &self.timers {
                te.borrow_mut().when_sec = 0;
            }
        }
        self.last_wall_secs = now_secs;

        // Timers created by handlers during this pass carry an id above this
        // watermark and are skipped until the next pass.
        let max_id = self.next_timer_id - 1;

        // Walk a snapshot of node handles: handlers are free to insert at the
        // head or tombstone any node while we iterate.
        let pass: Vec<Rc<RefCell<TimeEvent>>> = self.timers.clone();
        for te in pass {
            let id = te.borrow().id;

            if id == DELETED_TIMER_ID {
                if te.borrow().refcount > 0 {
                    continue;
                }
                match self.timers.iter().position(|t| Rc::ptr_eq(t, &te)) {
                    Some(pos) => {
                        self.timers.remove(pos);
                    }
                    // Already unlinked by a nested pass.
                    None => continue,
                }
                let finalizer = te.borrow_mut().finalizer.take();
                if let Some(finalizer) = finalizer {
                    (&mut *finalizer.borrow_mut())(self);
                }
                continue;
            }

            if id > max_id {
                continue;
            }

            let (now_sec, now_ms) = wall_clock();
            let due = {
                let te = te.borrow();
                now_sec > te.when_sec || (now_sec == te.when_sec && now_ms >= te.when_ms)
            };
            if !due {
                continue;
            }

            te.borrow_mut().refcount += 1;
            let handler = Rc::clone(&te.borrow().handler);
            let next = (&mut *handler.borrow_mut())(self, id);
            te.borrow_mut().refcount -= 1;
            processed += 1;

            match next {
                TimerNext::After(ms) => {
                    // A handler that deleted its own id stays tombstoned;
                    // rewriting the deadline does not resurrect it.
                    let (when_sec, when_ms) = deadline_after(ms);
                    let mut te = te.borrow_mut();
                    te.when_sec = when_sec;
                    te.when_ms = when_ms;
                }
                TimerNext::Stop => {
                    te.borrow_mut().id = DELETED_TIMER_ID;
                }
            }
        }

        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backward_clock_jump_fires_every_timer_once() {
        let mut reactor = Reactor::new(8).unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let (f1, f2) = (fired.clone(), fired.clone());
        reactor.create_timer(100_000, move |_, _| {
            f1.set(f1.get() + 1);
            TimerNext::Stop
        });
        reactor.create_timer(200_000, move |_, _| {
            f2.set(f2.get() + 1);
            TimerNext::Stop
        });

        // Far-future deadlines: nothing due on a normal pass.
        assert_eq!(reactor.process_time_events(), 0);

        // Pretend the previous pass saw a clock 10 s ahead of now, the
        // observable state after the wall clock moves backward.
        reactor.last_wall_secs = wall_clock().0 + 10;
        assert_eq!(reactor.process_time_events(), 2, "skew must force expiry");
        assert_eq!(fired.get(), 2);

        // Both returned Stop; the tombstones are unlinked on the next pass.
        assert_eq!(reactor.process_time_events(), 0);
        assert!(reactor.timers.is_empty());
    }

    #[test]
    fn tombstone_survives_until_refcount_drops() {
        let mut reactor = Reactor::new(8).unwrap();
        let id = reactor.create_timer(100_000, |_, _| TimerNext::Stop);
        reactor.delete_timer(id).unwrap();
        assert_eq!(reactor.timers.len(), 1, "deletion is deferred");
        assert_eq!(reactor.timers[0].borrow().id, DELETED_TIMER_ID);

        reactor.process_time_events();
        assert!(reactor.timers.is_empty(), "pass unlinks quiescent tombstones");
    }

    #[test]
    fn ids_are_never_reused() {
        let mut reactor = Reactor::new(8).unwrap();
        let a = reactor.create_timer(10, |_, _| TimerNext::Stop);
        reactor.delete_timer(a).unwrap();
        reactor.process_time_events();
        let b = reactor.create_timer(10, |_, _| TimerNext::Stop);
        assert!(b > a);
    }
}
