//! Drains a write larger than the kernel pipe buffer through `Aiofd`,
//! exercising the partial-write continuation path (cursor advances across
//! several `EAGAIN`-bounded `write(2)` calls, re-armed by the write event)
//! and the matching multi-event read side.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use reactor_io::aiofd::Aiofd;
use reactor_io::{Args, Loop, Registry, WriteOutcome};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    unsafe {
        assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK), 0);
    }
    (fds[0], fds[1])
}

#[test]
fn partial_write_drains_fully_across_multiple_events() {
    let _ = env_logger::try_init();
    let mut loop_ = Loop::new().unwrap();
    let handle = loop_.handle();

    let (rfd, wfd) = pipe();

    // Larger than the default 64 KiB pipe buffer, forcing at least one
    // partial write and one EAGAIN before the queue drains.
    let payload = Bytes::from(vec![0xABu8; 300_000]);

    let write_reg = Rc::new(RefCell::new(Registry::new()));
    let write_done = Rc::new(Cell::new(false));
    {
        let write_done = Rc::clone(&write_done);
        write_reg.borrow_mut().add(
            "aiofd-write-evt",
            0,
            Rc::new(move |args: &mut Args| {
                if let Args::AiofdWrite { outcome: WriteOutcome::Wrote { .. } } = args {
                    write_done.set(true);
                }
            }),
        );
    }
    let writer = Aiofd::new(Some(wfd), None, write_reg).unwrap();
    writer.enable_write_evt(true, &handle).unwrap();

    let read_reg = Rc::new(RefCell::new(Registry::new()));
    let total_read = Rc::new(Cell::new(0usize));
    let reader = Aiofd::new(None, Some(rfd), Rc::clone(&read_reg)).unwrap();
    {
        let reader = reader.clone();
        let total_read = Rc::clone(&total_read);
        read_reg.borrow_mut().add(
            "aiofd-read-evt",
            0,
            Rc::new(move |args: &mut Args| {
                let Args::AiofdRead { nread } = *args else { return };
                if nread <= 0 {
                    return;
                }
                let mut buf = vec![0u8; nread as usize];
                let n = reader.read(&mut buf);
                if n > 0 {
                    total_read.set(total_read.get() + n as usize);
                }
            }),
        );
    }
    reader.enable_read_evt(true, &handle).unwrap();

    writer.write(payload.clone(), reactor_io::Tag::None);

    for _ in 0..1000 {
        loop_.run_once(Some(Duration::from_millis(10))).unwrap();
        if write_done.get() && total_read.get() == payload.len() {
            break;
        }
    }

    assert!(write_done.get(), "write queue never reported completion");
    assert_eq!(total_read.get(), payload.len(), "reader did not see every byte written");
}
