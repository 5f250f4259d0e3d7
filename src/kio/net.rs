use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::{mem, ptr};

use nix::errno::Errno;

use crate::error::{Error, Result};

/// A socket address laid out the way the kernel expects it.
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    fn empty() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)).into())
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(
                    SocketAddrV6::new(
                        ip,
                        u16::from_be(sin6.sin6_port),
                        sin6.sin6_flowinfo,
                        sin6.sin6_scope_id,
                    )
                    .into(),
                )
            }
            _ => None,
        }
    }
}

impl From<&SocketAddr> for SockAddr {
    fn from(addr: &SocketAddr) -> Self {
        let mut out = Self::empty();

        match addr {
            SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());

                unsafe { ptr::write(out.as_mut_ptr() as *mut libc::sockaddr_in, sin) };
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr.s6_addr = a.ip().octets();
                sin6.sin6_scope_id = a.scope_id();

                unsafe { ptr::write(out.as_mut_ptr() as *mut libc::sockaddr_in6, sin6) };
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }

        out
    }
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> Result<RawFd> {
    let fd = Errno::result(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) })?;
    Ok(fd)
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let enable: libc::c_int = 1;
    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const _ as *const libc::c_void,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    })?;

    let addr = SockAddr::from(addr);
    Errno::result(unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) })?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    Errno::result(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut addr = SockAddr::empty();
    Errno::result(unsafe { libc::getsockname(fd, addr.as_mut_ptr(), &mut addr.len) })?;
    addr.to_socket_addr().ok_or(Error::Transport(libc::EAFNOSUPPORT))
}

/// Wake anything blocked on the socket; errors such as ENOTCONN don't matter.
pub fn shutdown(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}
