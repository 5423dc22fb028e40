//! OS-portable socket creation and option helpers.
//!
//! socket2 covers the portable options; the Linux-only ones (FREEBIND,
//! INCOMING_CPU, path-MTU probing) go through raw `setsockopt`. All of the
//! Linux extras are best-effort: they improve behaviour when available and
//! are silently skipped elsewhere.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Create a non-blocking UDP socket for the given address family.
pub(crate) fn udp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let sock = Socket::new(domain_for(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Create a non-blocking TCP socket for the given address family.
pub(crate) fn tcp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let sock = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// SO_REUSEADDR, so listeners can rebind promptly after restart.
pub(crate) fn reuse(sock: &Socket) -> io::Result<()> {
    sock.set_reuse_address(true)
}

/// SO_REUSEPORT (SO_REUSEPORT_LB where that exists), letting one child
/// socket per worker share a port with kernel load balancing.
pub(crate) fn reuse_lb(sock: &Socket) -> io::Result<()> {
    #[cfg(unix)]
    {
        sock.set_reuse_port(true)
    }
    #[cfg(not(unix))]
    {
        let _ = sock;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Whether per-worker listeners can share a port on this platform.
pub(crate) fn reuseport_supported() -> bool {
    cfg!(unix)
}

/// IP_FREEBIND: allow binding addresses that are not (yet) configured on
/// any interface.
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
pub(crate) fn freebind(sock: &Socket, addr: &SocketAddr) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;
        let fd = sock.as_raw_fd();
        let one: libc::c_int = 1;
        let (level, opt) = if addr.is_ipv4() {
            (libc::IPPROTO_IP, libc::IP_FREEBIND)
        } else {
            (libc::IPPROTO_IPV6, libc::IPV6_FREEBIND)
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &one as *const _ as _,
                size_of::<libc::c_int>() as _,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// SO_INCOMING_CPU: hint the kernel to steer packets to the CPU that owns
/// the socket. Best-effort; failures are ignored by callers.
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
pub(crate) fn incoming_cpu(sock: &Socket) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;
        let fd = sock.as_raw_fd();
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_INCOMING_CPU,
                &one as *const _ as _,
                size_of::<libc::c_int>() as _,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Disable fragmentation of outgoing datagrams where the platform allows
/// it (path-MTU discovery set to "omit" on Linux, so oversized datagrams
/// fail instead of fragmenting).
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
pub(crate) fn dontfrag(sock: &Socket, addr: &SocketAddr) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;
        let fd = sock.as_raw_fd();
        let val: libc::c_int = libc::IP_PMTUDISC_OMIT;
        let (level, opt) = if addr.is_ipv4() {
            (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER)
        } else {
            (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER)
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &val as *const _ as _,
                size_of::<libc::c_int>() as _,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_socket_binds() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = udp_socket(&addr).unwrap();
        reuse(&sock).unwrap();
        sock.bind(&addr.into()).unwrap();
        let local = sock.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_reuse_lb_allows_double_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = udp_socket(&addr).unwrap();
        reuse(&a).unwrap();
        reuse_lb(&a).unwrap();
        a.bind(&addr.into()).unwrap();
        let bound = a.local_addr().unwrap().as_socket().unwrap();

        let b = udp_socket(&bound).unwrap();
        reuse(&b).unwrap();
        reuse_lb(&b).unwrap();
        b.bind(&bound.into()).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_extras_apply() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = udp_socket(&addr).unwrap();
        freebind(&sock, &addr).unwrap();
        incoming_cpu(&sock).unwrap();
        dontfrag(&sock, &addr).unwrap();
    }
}
