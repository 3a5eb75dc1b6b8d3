//! End-to-end TCP echo over a real loopback connection: bind/listen/accept
//! on one socket, connect on another, one ping/pong round trip driven
//! entirely through `Loop::run_once`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use reactor_io::socket::{Socket, SocketBuilder, SocketKind};
use reactor_io::{Args, Loop, Registry};

fn run_until(loop_: &mut Loop, done: &Cell<bool>) {
    for _ in 0..500 {
        loop_.run_once(Some(Duration::from_millis(20))).unwrap();
        if done.get() {
            return;
        }
    }
    panic!("tcp ping-pong did not complete within the iteration budget");
}

#[test]
fn tcp_ping_pong() {
    let _ = env_logger::try_init();
    let mut loop_ = Loop::new().unwrap();

    let server_reg = Rc::new(RefCell::new(Registry::new()));
    let server = SocketBuilder::new(SocketKind::Tcp, "127.0.0.1", 12121)
        .build(Rc::clone(&server_reg))
        .unwrap();
    server.bind(&loop_).unwrap();
    server.listen(128, &loop_).unwrap();

    let accepted_slot: Rc<RefCell<Option<Socket>>> = Rc::new(RefCell::new(None));
    let client_done = Rc::new(Cell::new(false));

    {
        let accepted_slot = Rc::clone(&accepted_slot);
        let server = server.clone();
        server_reg.borrow_mut().add(
            "socket-connect-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                if accepted_slot.borrow().is_some() {
                    return;
                }
                let accepted_reg = Rc::new(RefCell::new(Registry::new()));
                let accepted_slot2 = Rc::clone(&accepted_slot);
                accepted_reg.borrow_mut().add(
                    "socket-read-evt",
                    0,
                    Rc::new(move |_args: &mut Args| {
                        let guard = accepted_slot2.borrow();
                        let sock = guard.as_ref().expect("accepted socket is stored before reads fire");
                        let mut buf = [0u8; 64];
                        let n = sock.read(&mut buf);
                        if n > 0 {
                            sock.write(Bytes::copy_from_slice(&buf[..n as usize]));
                        }
                    }),
                );
                let handle = server.loop_handle().expect("listening socket has a loop handle");
                let accepted = server.accept(accepted_reg, &handle).unwrap();
                *accepted_slot.borrow_mut() = Some(accepted);
            }),
        );
    }

    let client_reg = Rc::new(RefCell::new(Registry::new()));
    let client = SocketBuilder::new(SocketKind::Tcp, "127.0.0.1", 12121)
        .build(Rc::clone(&client_reg))
        .unwrap();

    {
        let client = client.clone();
        client_reg.borrow_mut().add(
            "socket-connect-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                client.write(Bytes::from_static(b"ping"));
            }),
        );
    }
    {
        let client = client.clone();
        let client_done = Rc::clone(&client_done);
        client_reg.borrow_mut().add(
            "socket-read-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                let mut buf = [0u8; 64];
                let n = client.read(&mut buf);
                assert_eq!(&buf[..n as usize], b"ping");
                client_done.set(true);
            }),
        );
    }

    client.connect(&loop_).unwrap();

    run_until(&mut loop_, &client_done);
}
