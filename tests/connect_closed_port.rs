//! Connecting to a port nothing is listening on surfaces the failed
//! `SO_ERROR` as `socket-error-evt`, rather than transitioning to connected.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use reactor_io::socket::{SocketBuilder, SocketKind};
use reactor_io::{Args, Loop, Registry};

#[test]
fn connect_to_closed_port_reports_socket_error() {
    let _ = env_logger::try_init();
    let mut loop_ = Loop::new().unwrap();

    let reg = Rc::new(RefCell::new(Registry::new()));
    let errno_seen: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
    let connected = Rc::new(Cell::new(false));

    {
        let errno_seen = Rc::clone(&errno_seen);
        reg.borrow_mut().add(
            "socket-error-evt",
            0,
            Rc::new(move |args: &mut Args| {
                if let Args::SocketError { errno } = *args {
                    errno_seen.set(Some(errno));
                }
            }),
        );
    }
    {
        let connected = Rc::clone(&connected);
        reg.borrow_mut().add(
            "socket-connect-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                connected.set(true);
            }),
        );
    }

    let client = SocketBuilder::new(SocketKind::Tcp, "127.0.0.1", 5559).build(reg).unwrap();
    client.connect(&loop_).unwrap();

    for _ in 0..200 {
        loop_.run_once(Some(Duration::from_millis(10))).unwrap();
        if errno_seen.get().is_some() {
            break;
        }
    }

    assert!(errno_seen.get().is_some(), "expected a socket-error-evt for the refused connection");
    assert!(!connected.get(), "a refused connection must not fire socket-connect-evt");
}
