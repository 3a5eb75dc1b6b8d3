//! A read-ready fire on an fd whose peer has closed reports `EPIPE` through
//! `aiofd-error-evt`, per the read path's `0 == peer closed` rule.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use reactor_io::aiofd::Aiofd;
use reactor_io::{Args, Loop, Registry};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    unsafe {
        assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK), 0);
    }
    (fds[0], fds[1])
}

#[test]
fn peer_closed_read_reports_epipe() {
    let _ = env_logger::try_init();
    let mut loop_ = Loop::new().unwrap();
    let handle = loop_.handle();

    let (rfd, wfd) = pipe();
    unsafe {
        libc::close(wfd);
    }

    let reg = Rc::new(RefCell::new(Registry::new()));
    let errno_seen: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));

    let aiofd = Aiofd::new(None, Some(rfd), Rc::clone(&reg)).unwrap();
    {
        let aiofd = aiofd.clone();
        reg.borrow_mut().add(
            "aiofd-read-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                let mut buf = [0u8; 16];
                let _ = aiofd.read(&mut buf);
            }),
        );
    }
    {
        let errno_seen = Rc::clone(&errno_seen);
        reg.borrow_mut().add(
            "aiofd-error-evt",
            0,
            Rc::new(move |args: &mut Args| {
                if let Args::AiofdError { errno, .. } = *args {
                    errno_seen.set(Some(errno));
                }
            }),
        );
    }
    aiofd.enable_read_evt(true, &handle).unwrap();

    for _ in 0..200 {
        loop_.run_once(Some(Duration::from_millis(10))).unwrap();
        if errno_seen.get().is_some() {
            break;
        }
    }

    assert_eq!(errno_seen.get(), Some(libc::EPIPE));
}
