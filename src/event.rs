//! Typed payloads dispatched through the callback registry.
//!
//! The C original passes a `va_list` tail through `call()` and lets each
//! listener decode it however it likes. This port replaces that with one
//! closed sum type per the redesign note in spec §9 ("Variadic callback
//! payload → typed sum/trait"): every named channel has a fixed payload
//! shape, and a listener registered under a given name is expected to match
//! on the corresponding variant.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use bytes::Bytes;

/// Which half of a full-duplex fd an `Io` event watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn includes_read(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn includes_write(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

/// Opaque value threaded through a pending write and echoed on completion.
/// `Dest` is the `WriteDest` case used by the socket `_to` write variants;
/// ownership of the destination address moves with the write, as the spec's
/// design notes ask for, rather than being a manually-freed heap pointer.
#[derive(Debug, Clone, Default)]
pub enum Tag {
    #[default]
    None,
    Id(u64),
    Dest(SocketAddr),
}

/// What happened to the head of the write queue on a given drive of the
/// write path. The C original fuses "this write finished" and "the queue is
/// now empty" into one `aiofd-write-evt` dispatch carrying a null buffer
/// pointer as the "drained" sentinel (spec §9, open question (c)); this port
/// keeps the one event name but makes the sentinel an explicit variant.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Wrote { tag: Tag, buf: Bytes },
    QueueEmpty,
}

/// Payload delivered to `evt-signal` / `evt-child` / `evt-io` listeners by
/// the event loop.
#[derive(Debug, Clone, Copy)]
pub enum LoopPayload {
    Signal {
        signum: i32,
    },
    Child {
        pid: libc::pid_t,
        rpid: libc::pid_t,
        rstatus: i32,
    },
    Io {
        fd: RawFd,
        direction: Direction,
    },
}

/// Payload delivered on every other named channel in the system
/// (`aiofd-*-evt`, `socket-*-evt`).
#[derive(Debug, Clone)]
pub enum Args {
    Loop(LoopPayload),
    AiofdRead { nread: i64 },
    AiofdWrite { outcome: WriteOutcome },
    AiofdError { tag: Tag, errno: i32 },
    SocketConnect,
    SocketDisconnect,
    SocketError { errno: i32 },
    SocketRead { nread: usize },
    SocketWrite { outcome: WriteOutcome },
}
