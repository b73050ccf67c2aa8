use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use muxloop::{EventFlags, Reactor, TimerNext};

/// Drains due timers without ever blocking, for the phases of a test where
/// the timer list may become empty (a blocking iteration with no timers and
/// no files would sleep forever).
fn drain_for(reactor: &mut Reactor, window: Duration) {
    let start = Instant::now();
    while start.elapsed() < window {
        reactor.process_events(EventFlags::ALL_EVENTS | EventFlags::DONT_WAIT);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn timer_ids_increase_monotonically() {
    let mut reactor = Reactor::new(8).unwrap();
    let mut last = -1;
    for _ in 0..16 {
        let id = reactor.create_timer(1_000, |_, _| TimerNext::Stop);
        assert!(id > last, "ids must be strictly increasing");
        last = id;
    }
}

#[test]
fn periodic_timer_cadence() {
    let mut reactor = Reactor::new(8).unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();

    reactor.create_timer(30, move |_, _| {
        calls_in_handler.set(calls_in_handler.get() + 1);
        TimerNext::After(20)
    });

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(125) {
        reactor.process_events(EventFlags::ALL_EVENTS);
    }

    // Expected fires at roughly t = 30, 50, 70, 90, 110 ms.
    let n = calls.get();
    assert!(
        (4..=6).contains(&n),
        "expected about 5 invocations in 125 ms, got {n}"
    );
}

#[test]
fn stopped_timer_never_fires_again() {
    let mut reactor = Reactor::new(8).unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();

    reactor.create_timer(10, move |_, _| {
        calls_in_handler.set(calls_in_handler.get() + 1);
        TimerNext::Stop
    });

    let deadline = Instant::now() + Duration::from_millis(500);
    while calls.get() == 0 && Instant::now() < deadline {
        reactor.process_events(EventFlags::ALL_EVENTS);
    }
    assert_eq!(calls.get(), 1);

    drain_for(&mut reactor, Duration::from_millis(50));
    assert_eq!(calls.get(), 1, "a stopped timer must stay stopped");
}

#[test]
fn deleted_timer_never_fires() {
    let mut reactor = Reactor::new(8).unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();

    let id = reactor.create_timer(20, move |_, _| {
        calls_in_handler.set(calls_in_handler.get() + 1);
        TimerNext::Stop
    });
    reactor.delete_timer(id).unwrap();

    // The id is tombstoned: a second deletion no longer finds it.
    assert!(reactor.delete_timer(id).is_err());

    drain_for(&mut reactor, Duration::from_millis(60));
    assert_eq!(calls.get(), 0, "deleted timers must never run");
}

#[test]
fn deleting_an_unknown_id_reports_not_found() {
    let mut reactor = Reactor::new(8).unwrap();
    assert!(reactor.delete_timer(12345).is_err());
}

#[test]
fn self_deleting_timer_is_not_rescheduled() {
    let mut reactor = Reactor::new(8).unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();

    reactor.create_timer(10, move |reactor, id| {
        calls_in_handler.set(calls_in_handler.get() + 1);
        reactor.delete_timer(id).unwrap();
        // The reschedule must lose against the deletion above.
        TimerNext::After(10)
    });

    let deadline = Instant::now() + Duration::from_millis(500);
    while calls.get() == 0 && Instant::now() < deadline {
        reactor.process_events(EventFlags::ALL_EVENTS);
    }
    assert_eq!(calls.get(), 1);

    drain_for(&mut reactor, Duration::from_millis(60));
    assert_eq!(calls.get(), 1, "a self-deleted timer must not come back");
}

#[test]
fn finalizer_runs_when_the_node_is_unlinked() {
    let mut reactor = Reactor::new(8).unwrap();
    let finalized = Rc::new(Cell::new(false));
    let flag = finalized.clone();

    reactor.create_timer_with_finalizer(
        5,
        |_, _| TimerNext::Stop,
        move |_| flag.set(true),
    );

    let deadline = Instant::now() + Duration::from_millis(500);
    while !finalized.get() && Instant::now() < deadline {
        reactor.process_events(EventFlags::ALL_EVENTS | EventFlags::DONT_WAIT);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(finalized.get(), "finalizer must run after retirement");
}

#[test]
fn external_deletion_also_reaches_the_finalizer() {
    let mut reactor = Reactor::new(8).unwrap();
    let finalized = Rc::new(Cell::new(false));
    let flag = finalized.clone();

    let id = reactor.create_timer_with_finalizer(
        60_000,
        |_, _| TimerNext::Stop,
        move |_| flag.set(true),
    );
    reactor.delete_timer(id).unwrap();
    assert!(!finalized.get(), "unlink happens on the next pass, not inline");

    reactor.process_events(EventFlags::TIME_EVENTS | EventFlags::DONT_WAIT);
    assert!(finalized.get());
}

#[test]
fn timer_created_during_a_pass_waits_for_the_next_pass() {
    let mut reactor = Reactor::new(8).unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let outer_log = order.clone();

    reactor.create_timer(5, move |reactor, _| {
        outer_log.borrow_mut().push("outer");
        let inner_log = outer_log.clone();
        reactor.create_timer(0, move |_, _| {
            inner_log.borrow_mut().push("inner");
            TimerNext::Stop
        });
        TimerNext::Stop
    });

    let deadline = Instant::now() + Duration::from_millis(500);
    while order.borrow().is_empty() && Instant::now() < deadline {
        reactor.process_events(EventFlags::ALL_EVENTS);
    }
    assert_eq!(
        *order.borrow(),
        vec!["outer"],
        "a timer created mid-pass is shielded from that same pass"
    );

    reactor.process_events(EventFlags::ALL_EVENTS | EventFlags::DONT_WAIT);
    assert_eq!(*order.borrow(), vec!["outer", "inner"]);
}
