//! `getaddrinfo`-based endpoint resolution. Kept as raw `libc` calls rather
//! than `std::net::ToSocketAddrs` because the socket layer needs to pass
//! through caller-supplied `ai_flags`/`ai_family` hints (e.g. `AI_PASSIVE`
//! for a bind address, or pinning to `AF_INET`), which `ToSocketAddrs` has
//! no way to express.

use std::ffi::{CStr, CString};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use crate::error::{ReactorError, Result};

/// Matches the fixed-size stack buffers the C original formats addresses
/// into; kept here as the cap `addr_str`/`port_str` truncate to, rather than
/// reproducing the raw buffers themselves.
pub const HOST_BUF_LEN: usize = 1024;
pub const PORT_BUF_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ResolvedAddr {
    pub addr: SocketAddr,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

pub fn resolve(
    host: &str,
    port: u16,
    ai_flags: i32,
    ai_family: i32,
    socktype: i32,
    protocol: i32,
) -> Result<Vec<ResolvedAddr>> {
    let chost = CString::new(host).map_err(|_| ReactorError::BadHostname {
        host: host.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "host contains a NUL byte"),
    })?;
    let cport = CString::new(port.to_string()).expect("port digits never contain NUL");

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = ai_flags;
    hints.ai_family = ai_family;
    hints.ai_socktype = socktype;
    hints.ai_protocol = protocol;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(chost.as_ptr(), cport.as_ptr(), &hints, &mut res) };
    if rc != 0 {
        let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }.to_string_lossy().into_owned();
        return Err(ReactorError::BadHostname {
            host: host.to_owned(),
            source: io::Error::new(io::ErrorKind::Other, msg),
        });
    }

    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let info = unsafe { &*cur };
        if let Some(addr) = unsafe { sockaddr_to_socketaddr(info.ai_addr, info.ai_addrlen) } {
            out.push(ResolvedAddr {
                addr,
                family: info.ai_family,
                socktype: info.ai_socktype,
                protocol: info.ai_protocol,
            });
        }
        cur = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };

    if out.is_empty() {
        return Err(ReactorError::BadHostname {
            host: host.to_owned(),
            source: io::Error::new(io::ErrorKind::Other, "no usable address returned"),
        });
    }
    Ok(out)
}

/// # Safety
/// `addr` must point to at least `len` valid bytes of a `sockaddr`-family
/// struct, as returned by `getaddrinfo`/`accept`/`getsockname`.
pub unsafe fn sockaddr_to_socketaddr(
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match (*addr).sa_family as i32 {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

pub fn socketaddr_to_sockaddr_in(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_be_bytes(v4.ip().octets()).to_be() },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub fn format_host(addr: &SocketAddr) -> String {
    let s = addr.ip().to_string();
    s.chars().take(HOST_BUF_LEN - 1).collect()
}

pub fn format_port(port: u16) -> String {
    let s = port.to_string();
    s.chars().take(PORT_BUF_LEN - 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback_tcp() {
        let resolved = resolve("127.0.0.1", 0, 0, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(resolved.iter().any(|r| r.addr.ip().is_loopback()));
    }

    #[test]
    fn unresolvable_host_is_a_bad_hostname_error() {
        let err = resolve("this.host.does.not.exist.invalid", 80, 0, libc::AF_UNSPEC, libc::SOCK_STREAM, 0);
        assert!(matches!(err, Err(ReactorError::BadHostname { .. })));
    }
}
