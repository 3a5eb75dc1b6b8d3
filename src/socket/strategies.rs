//! Per-kind `aiofd-*-io` strategy implementations: `recv`/`send` when the
//! socket is connected, `recvfrom`/`sendto` (stashing/consuming the peer
//! address) when it is an unbound-or-bound UDP socket, per spec §4.4's
//! strategy table.

use std::cell::RefCell;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::rc::Weak;

use crate::aiofd::{NreadResult, Strategies};
use crate::event::Tag;

use super::{addr, SocketInner, SocketKind};

pub(super) fn build(kind: SocketKind, weak: Weak<RefCell<SocketInner>>) -> Strategies {
    let w1 = Weak::clone(&weak);
    let w2 = Weak::clone(&weak);
    let w3 = Weak::clone(&weak);
    let w4 = Weak::clone(&weak);
    let w5 = weak;

    Strategies {
        read: Box::new(move |fd, buf| read_strategy(&w1, fd, buf)),
        write: Box::new(move |fd, buf, tag| write_strategy(&w2, fd, buf, tag)),
        readv: Box::new(move |fd, iov| readv_strategy(&w3, fd, iov)),
        writev: Box::new(move |fd, iov, tag| writev_strategy(&w4, fd, iov, tag)),
        nread: Box::new(move |fd| nread_strategy(&w5, kind, fd)),
    }
}

fn is_connected(weak: &Weak<RefCell<SocketInner>>) -> bool {
    weak.upgrade().map(|inner| inner.borrow().connected).unwrap_or(true)
}

fn read_strategy(weak: &Weak<RefCell<SocketInner>>, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    if is_connected(weak) {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        return if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) };
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(inner) = weak.upgrade() {
        if let Some(from) = unsafe { addr::sockaddr_to_socketaddr(&storage as *const _ as *const libc::sockaddr, len) } {
            inner.borrow_mut().last_from = Some(from);
        }
    }
    Ok(n as usize)
}

fn write_strategy(weak: &Weak<RefCell<SocketInner>>, fd: RawFd, buf: &[u8], tag: &Tag) -> io::Result<usize> {
    if is_connected(weak) {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        return if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) };
    }

    let Tag::Dest(dest) = tag else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "write_to destination missing on unconnected socket"));
    };
    let (storage, len) = addr::socketaddr_to_sockaddr_in(dest);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
}

fn readv_strategy(weak: &Weak<RefCell<SocketInner>>, fd: RawFd, iov: &mut [IoSliceMut]) -> io::Result<usize> {
    if is_connected(weak) {
        let n = unsafe { libc::readv(fd, iov.as_ptr() as *const libc::iovec, iov.len() as i32) };
        return if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) };
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = iov.as_mut_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(inner) = weak.upgrade() {
        if let Some(from) = unsafe {
            addr::sockaddr_to_socketaddr(&storage as *const _ as *const libc::sockaddr, msg.msg_namelen)
        } {
            inner.borrow_mut().last_from = Some(from);
        }
    }
    Ok(n as usize)
}

fn writev_strategy(weak: &Weak<RefCell<SocketInner>>, fd: RawFd, iov: &[IoSlice], tag: &Tag) -> io::Result<usize> {
    if is_connected(weak) {
        let n = unsafe { libc::writev(fd, iov.as_ptr() as *const libc::iovec, iov.len() as i32) };
        return if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) };
    }

    let Tag::Dest(dest) = tag else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "writev_to destination missing on unconnected socket"));
    };
    let (mut storage, len) = addr::socketaddr_to_sockaddr_in(dest);
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = len;
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
}

fn nread_strategy(weak: &Weak<RefCell<SocketInner>>, kind: SocketKind, fd: RawFd) -> io::Result<NreadResult> {
    let listening = weak.upgrade().map(|inner| inner.borrow().listening).unwrap_or(false);
    let _ = kind;
    let mut avail: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail) };
    if rc < 0 {
        Ok(NreadResult { nread: -1, listening })
    } else {
        Ok(NreadResult { nread: avail as i64, listening })
    }
}
