//! Thin wrapper around epoll. Edge-triggered only: callers are expected to
//! drain a fd (read/write until `WouldBlock`) on every readiness fire and
//! re-register on the next edge, matching the aiofd write loop's own
//! "drain until EAGAIN" discipline.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::trace;

/// Opaque identifier handed back on every fired event, chosen by the
/// registrant at `register` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }

    pub fn add(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = libc::EPOLLET;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: epoll_create1 either returns a valid owned fd or -1.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let ep = unsafe { OwnedFd::from_raw_fd(raw) };
        trace!("epoll selector created, fd={}", ep.as_raw_fd());
        Ok(Selector { ep })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0 as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!("registered fd={} token={:?}", fd, token);
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0 as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!("deregistered fd={}", fd);
        Ok(())
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        events.inner.resize(events.capacity, libc::epoll_event { events: 0, u64: 0 });

        let n = unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                events.inner.as_mut_ptr(),
                events.capacity as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                events.inner.clear();
                return Ok(0);
            }
            return Err(err);
        }
        events.inner.truncate(n as usize);
        Ok(n as usize)
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

pub struct Events {
    inner: Vec<libc::epoll_event>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.inner.iter().map(|ev| Readiness {
            token: Token(ev.u64 as usize),
            readable: (ev.events as libc::c_int & (libc::EPOLLIN | libc::EPOLLPRI)) != 0,
            writable: (ev.events as libc::c_int & libc::EPOLLOUT) != 0,
            error: (ev.events as libc::c_int & (libc::EPOLLERR | libc::EPOLLHUP)) != 0,
        })
    }
}
