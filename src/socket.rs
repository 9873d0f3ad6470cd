//! Thin owning wrapper over a single non-blocking stream descriptor.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::endpoint::Endpoint;
use crate::error::last_os_error;

fn to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<Endpoint> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            let port = u16::from_be(sin.sin_port);
            Ok(Endpoint::from_raw(SocketAddr::new(ip.into(), port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(Endpoint::from_raw(SocketAddr::new(ip.into(), port)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

/// Creates a non-blocking, close-on-exec stream socket for `addr`'s family.
pub fn create_nonblocking_socket(addr: SocketAddr) -> io::Result<OwnedFd> {
    let family = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };
    let fd = syscall(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn syscall(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(last_os_error())
    } else {
        Ok(ret)
    }
}

/// Owns exactly one non-blocking stream descriptor; closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn new(addr: SocketAddr) -> io::Result<Socket> {
        Ok(Socket {
            fd: create_nonblocking_socket(addr)?,
        })
    }

    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consumes the wrapper, handing ownership of the descriptor to the caller.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Fatal on error: binding to an address the caller chose is a programmer error.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = to_sockaddr(addr);
        syscall(unsafe {
            libc::bind(
                self.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
        .map(|_| ())
    }

    /// Fatal on error. Backlog is the system maximum (`SOMAXCONN`).
    pub fn listen(&self) -> io::Result<()> {
        syscall(unsafe { libc::listen(self.as_raw_fd(), libc::SOMAXCONN) }).map(|_| ())
    }

    /// `Ok(Some((fd, peer)))` on success, `Ok(None)` on `EWOULDBLOCK`/`EAGAIN`,
    /// `Err` (with errno preserved) otherwise.
    pub fn accept(&self) -> io::Result<Option<(OwnedFd, Endpoint)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return Ok(None);
            }
            return Err(err);
        }
        let peer = from_sockaddr(&storage)?;
        Ok(Some((unsafe { OwnedFd::from_raw_fd(fd) }, peer)))
    }

    /// Reports the raw `connect(2)` result; errno interpretation is the Connector's job.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = to_sockaddr(addr);
        syscall(unsafe {
            libc::connect(
                self.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
        .map(|_| ())
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall(unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_WR) }).map(|_| ())
    }

    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuseport(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_opt(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let value: libc::c_int = on as libc::c_int;
        syscall(unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    /// The pending error set by a connect-in-progress socket once it becomes writable.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall(unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        if value == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(value)))
        }
    }

    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall(unsafe {
            libc::getpeername(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        from_sockaddr(&storage)
    }

    pub fn local_addr(&self) -> io::Result<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall(unsafe {
            libc::getsockname(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        from_sockaddr(&storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_connect_round_trip() {
        let listener = Socket::new("127.0.0.1:0".parse().unwrap()).unwrap();
        listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen().unwrap();
        let local = listener.local_addr().unwrap();

        let client = Socket::new(local.as_socket_addr()).unwrap();
        let connect_result = client.connect(local.as_socket_addr());
        assert!(
            connect_result.is_ok()
                || connect_result.as_ref().unwrap_err().kind() == io::ErrorKind::WouldBlock
        );

        // give the kernel a moment to queue the pending connection
        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = listener.accept().unwrap();
        assert!(accepted.is_some());
    }

    #[test]
    fn option_setters_do_not_error() {
        let sock = Socket::new("127.0.0.1:0".parse().unwrap()).unwrap();
        sock.set_reuseaddr(true).unwrap();
        sock.set_reuseport(true).unwrap();
        sock.set_keepalive(true).unwrap();
    }
}
