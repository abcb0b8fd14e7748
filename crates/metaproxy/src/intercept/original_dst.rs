//! Original destination recovery for NAT-redirected sockets.
//!
//! When netfilter's `REDIRECT` (or `DNAT`) target rewrites a connection to
//! point at this proxy, conntrack still remembers where the client was going.
//! Linux exposes that through `getsockopt(SOL_IP, SO_ORIGINAL_DST)`, which
//! fills a `struct sockaddr_in`:
//!
//! ```text
//! offset 0  sin_family   u16 (host order)
//! offset 2  sin_port     u16 (network order)
//! offset 4  sin_addr     u32 (network order)
//! offset 8  sin_zero     [u8; 8]
//! ```
//!
//! IPv6 connections use `IP6T_SO_ORIGINAL_DST` on `SOL_IPV6` and a
//! `struct sockaddr_in6`.
//!
//! The query needs the raw descriptor, so the resolver only accepts sockets
//! that expose one through [`AsRawFd`]. Tokio's `TcpStream` does.

use metaproxy_core::{ProxyError, ProxyResult};
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recovers the pre-NAT destination of an accepted connection.
pub trait OriginalDestination: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ProxyError::Resolution`] when the destination cannot be
    /// recovered (socket not redirected, or platform without conntrack).
    fn original_destination(&self, conn: &TcpStream) -> ProxyResult<SocketAddr>;
}

/// Kernel-backed resolver using `SO_ORIGINAL_DST`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoOriginalDst;

impl OriginalDestination for SoOriginalDst {
    fn original_destination(&self, conn: &TcpStream) -> ProxyResult<SocketAddr> {
        original_dst(conn)
    }
}

#[cfg(target_os = "linux")]
pub use linux::original_dst;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::{AsRawFd, RawFd};

    /// `SO_ORIGINAL_DST` from `<linux/netfilter_ipv4.h>`.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    /// `IP6T_SO_ORIGINAL_DST` from `<linux/netfilter_ipv6/ip6_tables.h>`.
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    /// Query the original destination of `socket`, trying IPv4 then IPv6.
    pub fn original_dst<S: AsRawFd>(socket: &S) -> ProxyResult<SocketAddr> {
        let fd = socket.as_raw_fd();

        let v4_err = match query_v4(fd) {
            Ok(addr) => return Ok(SocketAddr::V4(addr)),
            Err(e) => e,
        };
        match query_v6(fd) {
            Ok(addr) => Ok(SocketAddr::V6(addr)),
            Err(v6_err) => Err(ProxyError::Resolution(format!(
                "getsockopt SO_ORIGINAL_DST failed (ipv4: {v4_err}, ipv6: {v6_err}); \
                 is the connection NAT-redirected?"
            ))),
        }
    }

    fn query_v4(fd: RawFd) -> io::Result<SocketAddrV4> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        // SAFETY: `addr` is a writable sockaddr_in and `len` holds its size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(decode_sockaddr_in(&addr))
    }

    fn query_v6(fd: RawFd) -> io::Result<SocketAddrV6> {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

        // SAFETY: `addr` is a writable sockaddr_in6 and `len` holds its size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(decode_sockaddr_in6(&addr))
    }

    /// Port and address are stored in network byte order.
    pub(super) fn decode_sockaddr_in(addr: &libc::sockaddr_in) -> SocketAddrV4 {
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        SocketAddrV4::new(ip, u16::from_be(addr.sin_port))
    }

    pub(super) fn decode_sockaddr_in6(addr: &libc::sockaddr_in6) -> SocketAddrV6 {
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        SocketAddrV6::new(
            ip,
            u16::from_be(addr.sin6_port),
            addr.sin6_flowinfo,
            addr.sin6_scope_id,
        )
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst<S>(_socket: &S) -> ProxyResult<SocketAddr> {
    Err(ProxyError::Resolution(
        "SO_ORIGINAL_DST is only available on Linux".to_string(),
    ))
}
