//! End-to-end UDP echo: a bound server socket and an ephemeral client
//! socket exchange one datagram round trip via `_to`/`_from`, with no
//! connect/listen/accept step (UDP has none).

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use reactor_io::socket::{SocketBuilder, SocketKind};
use reactor_io::{Args, Loop, Registry};

fn run_until(loop_: &mut Loop, done: &Cell<bool>) {
    for _ in 0..500 {
        loop_.run_once(Some(Duration::from_millis(20))).unwrap();
        if done.get() {
            return;
        }
    }
    panic!("udp ping-pong did not complete within the iteration budget");
}

#[test]
fn udp_ping_pong() {
    let _ = env_logger::try_init();
    let mut loop_ = Loop::new().unwrap();

    let server_reg = Rc::new(RefCell::new(Registry::new()));
    let server = SocketBuilder::new(SocketKind::Udp, "127.0.0.1", 12122)
        .build(Rc::clone(&server_reg))
        .unwrap();
    server.bind(&loop_).unwrap();

    {
        let server = server.clone();
        server_reg.borrow_mut().add(
            "socket-read-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                let mut buf = [0u8; 64];
                let (n, from) = server.read_from(&mut buf);
                if n > 0 {
                    let peer: SocketAddr = from.expect("udp read-evt stashes the sender");
                    server.write_to(Bytes::copy_from_slice(&buf[..n as usize]), peer);
                }
            }),
        );
    }

    let client_reg = Rc::new(RefCell::new(Registry::new()));
    let client = SocketBuilder::new(SocketKind::Udp, "127.0.0.1", 0)
        .build(Rc::clone(&client_reg))
        .unwrap();
    client.bind(&loop_).unwrap();

    let client_done = Rc::new(Cell::new(false));
    {
        let client_done = Rc::clone(&client_done);
        let client = client.clone();
        client_reg.borrow_mut().add(
            "socket-read-evt",
            0,
            Rc::new(move |_args: &mut Args| {
                let mut buf = [0u8; 64];
                let (n, _from) = client.read_from(&mut buf);
                assert_eq!(&buf[..n as usize], b"ping");
                client_done.set(true);
            }),
        );
    }

    let dest: SocketAddr = "127.0.0.1:12122".parse().unwrap();
    client.write_to(Bytes::from_static(b"ping"), dest);

    run_until(&mut loop_, &client_done);
}
