//! Platform shims: errno taxonomy, raw transfers, and poll(2).

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::time::Duration;

use socket2::{SockAddr, Socket};

use crate::addr::IpAddress;
use crate::socket::Status;

/// Suppress SIGPIPE on dead-peer sends where the flag exists; macOS uses
/// the SO_NOSIGPIPE socket option applied at creation instead.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: i32 = 0;

/// Build a socket-layer address from an address/port pair.
pub(crate) fn sock_addr(address: IpAddress, port: u16) -> SockAddr {
    SockAddr::from(SocketAddrV4::new(address.into(), port))
}

/// Map an I/O error onto the socket status taxonomy.
///
/// EAGAIN/EWOULDBLOCK/EINPROGRESS are transient; connection-teardown errno
/// values mean the peer is gone; everything else is unexpected.
pub(crate) fn status_from_io(err: &io::Error) -> Status {
    match err.kind() {
        io::ErrorKind::WouldBlock => return Status::NotReady,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::TimedOut
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => return Status::Disconnected,
        _ => {}
    }

    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EINPROGRESS => Status::NotReady,
        Some(code) if code == libc::ENETRESET => Status::Disconnected,
        _ => Status::Error,
    }
}

/// Whether a connect attempt reported "in progress" rather than failure.
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Send with the platform's SIGPIPE-safe flags.
pub(crate) fn send(sock: &Socket, data: &[u8]) -> io::Result<usize> {
    sock.send_with_flags(data, SEND_FLAGS)
}

/// Receive into an initialized buffer.
pub(crate) fn recv(sock: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    // socket2 takes MaybeUninit to support uninitialized buffers; ours is
    // initialized, so the cast only loosens the type.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    sock.recv(uninit)
}

/// Receive one datagram, reporting the sender.
pub(crate) fn recv_from(sock: &Socket, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    sock.recv_from(uninit)
}

/// Wait until any of `fds` is readable or the timeout elapses.
///
/// `None` waits indefinitely. Returns the handles that are ready to read:
/// pending data, pending connection, or a hangup that makes the next read
/// return immediately.
pub(crate) fn poll_read(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
    let mut entries: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: (libc::POLLIN | libc::POLLPRI) as libc::c_short,
            revents: 0,
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    loop {
        let rc = unsafe { libc::poll(entries.as_mut_ptr(), entries.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Vec::new());
        }

        let ready_mask = (libc::POLLIN | libc::POLLPRI | libc::POLLHUP) as libc::c_short;
        return Ok(entries
            .iter()
            .filter(|entry| entry.revents & ready_mask != 0)
            .map(|entry| entry.fd)
            .collect());
    }
}

/// Wait until `fd` is writable or the timeout elapses.
///
/// Used to bound a non-blocking connect attempt.
pub(crate) fn poll_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let mut entry = libc::pollfd {
        fd,
        events: libc::POLLOUT as libc::c_short,
        revents: 0,
    };

    loop {
        let rc = unsafe { libc::poll(&mut entry as *mut libc::pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}
