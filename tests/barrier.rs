use std::cell::{Cell, RefCell};
use std::rc::Rc;

use muxloop::{EventFlags, Mask, Reactor};

fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(res, 0, "socketpair() failed");
    (fds[0], fds[1])
}

#[test]
fn barrier_inverts_dispatch_order() {
    let mut reactor = Reactor::new(64).unwrap();
    let (a, b) = socketpair();
    let poke = unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) };
    assert_eq!(poke, 1);

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let (read_log, write_log) = (order.clone(), order.clone());

    reactor
        .register_file(a, Mask::READABLE, move |_, fd, _| {
            read_log.borrow_mut().push("read");
            let mut buf = [0u8; 8];
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        })
        .unwrap();
    reactor
        .register_file(a, Mask::WRITABLE | Mask::BARRIER, move |_, _, _| {
            write_log.borrow_mut().push("write");
        })
        .unwrap();

    reactor.process_events(EventFlags::FILE_EVENTS | EventFlags::DONT_WAIT);
    assert_eq!(
        *order.borrow(),
        vec!["write", "read"],
        "barrier must drain the write side before serving new input"
    );

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn barrier_with_shared_handler_still_runs_once() {
    let mut reactor = Reactor::new(64).unwrap();
    let (a, b) = socketpair();
    let poke = unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) };
    assert_eq!(poke, 1);

    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();
    reactor
        .register_file(
            a,
            Mask::READABLE | Mask::WRITABLE | Mask::BARRIER,
            move |_, fd, _| {
                calls_in_handler.set(calls_in_handler.get() + 1);
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            },
        )
        .unwrap();

    reactor.process_events(EventFlags::FILE_EVENTS | EventFlags::DONT_WAIT);
    assert_eq!(calls.get(), 1);

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn unregistering_writable_also_clears_barrier() {
    let mut reactor = Reactor::new(64).unwrap();
    let (a, b) = socketpair();

    reactor
        .register_file(a, Mask::READABLE | Mask::WRITABLE | Mask::BARRIER, |_, _, _| {})
        .unwrap();
    assert_eq!(
        reactor.file_interest(a),
        Mask::READABLE | Mask::WRITABLE | Mask::BARRIER
    );

    reactor.unregister_file(a, Mask::WRITABLE);
    assert_eq!(reactor.file_interest(a), Mask::READABLE);

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}
