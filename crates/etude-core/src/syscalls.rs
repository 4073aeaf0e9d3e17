// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice};
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::EtudeResult;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR, bound and listening.
pub fn create_listen_socket(addr: SocketAddr, backlog: c_int) -> EtudeResult<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Atomic non-blocking socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // From here on the descriptor is closed on every early return.
        let owned = OwnedFd::from_raw_fd(fd);

        // 2. SO_REUSEADDR so a restart does not wait out TIME_WAIT
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        // 3. Bind
        bind_addr(fd, &addr)?;

        // 4. Listen
        if libc::listen(fd, backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(TcpListener::from(owned))
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let res = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ignore SIGPIPE process-wide; a peer resetting mid-write must not kill the server.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Single non-blocking receive. `Ok(0)` is an orderly shutdown by the peer;
/// "would block" comes back as an `io::ErrorKind::WouldBlock` error.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Scatter/gather send of several buffers in one syscall.
///
/// Uses `sendmsg` with `MSG_NOSIGNAL` so a reset peer surfaces as `EPIPE`
/// instead of a signal.
pub fn send_vectored(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    // SAFETY: msghdr is plain old data; every pointer field is set below.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    // IoSlice is guaranteed ABI compatible with iovec on Unix.
    msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = bufs.len() as _;

    loop {
        let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Half-close: send FIN but keep the receive side open.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---- Readiness registration ----

/// Direction a connection is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Event mask for a client socket. One-shot, edge-triggered and
/// peer-hangup reporting are always part of the mask: one-shot is what
/// hands a connection to exactly one worker at a time.
pub fn client_events(interest: Interest) -> u32 {
    let direction = match interest {
        Interest::Readable => libc::EPOLLIN,
        Interest::Writable => libc::EPOLLOUT,
    };
    (direction | libc::EPOLLONESHOT | libc::EPOLLET | libc::EPOLLRDHUP) as u32
}

/// Registration surface used by connections and the reactor.
pub trait Poller: Send + Sync {
    /// First registration of a freshly accepted client socket.
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    /// Re-arm a one-shot registration after its event has been consumed.
    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    /// Remove a socket from the readiness set.
    fn deregister(&self, fd: RawFd) -> io::Result<()>;
}

pub use libc::epoll_event;

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Level-triggered read interest without one-shot; used for the
    /// listening socket and the shutdown eventfd.
    pub fn add_level(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Block for events. A negative timeout waits indefinitely; `EINTR`
    /// reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }

            Ok(res as usize)
        }
    }
}

impl Poller for Epoll {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, client_events(interest))
    }

    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, client_events(interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

// ---- Wake-up descriptor ----

/// Non-blocking eventfd used to wake the reactor out of an untimed wait.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    pub fn notify(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        let res = unsafe { libc::write(self.fd.as_raw_fd(), one.as_ptr() as *const c_void, 8) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake-up is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reset the counter so the level-triggered registration goes quiet.
    /// An already-empty counter is not an error.
    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        loop {
            let res = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, 8) };
            if res >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => return Err(err),
            }
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
