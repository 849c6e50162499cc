//! Readiness multiplexer over any mix of socket kinds.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::error;

use crate::sys;

/// Access to a socket's native handle for readiness registration.
pub trait Selectable {
    /// The raw handle, or `None` while no OS socket exists.
    fn native_handle(&self) -> Option<RawFd>;
}

/// Waits on many sockets at once and reports which are ready to read.
///
/// The selector keeps weak, handle-keyed references: registering a socket
/// neither owns nor extends its lifetime, and a registered socket that is
/// closed or dropped must be removed by the caller (a stale registration
/// is the caller's bug, exactly as with any handle-based registry).
///
/// `wait` produces a readiness snapshot that `is_ready` queries; calling
/// `wait` again replaces the snapshot. For a listening socket "ready"
/// means a connection is waiting to be accepted; for stream and datagram
/// sockets it means a receive will not block.
#[derive(Debug, Default)]
pub struct Selector {
    entries: HashSet<RawFd>,
    ready: HashSet<RawFd>,
}

impl Selector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Does nothing if the socket has no live handle.
    ///
    /// There is no registration limit; the wait is poll-based rather than
    /// select-based, so no descriptor-set ceiling applies.
    pub fn add(&mut self, socket: &impl Selectable) {
        if let Some(fd) = socket.native_handle() {
            self.entries.insert(fd);
        }
    }

    /// Deregister a socket without affecting the socket itself.
    pub fn remove(&mut self, socket: &impl Selectable) {
        if let Some(fd) = socket.native_handle() {
            self.entries.remove(&fd);
            self.ready.remove(&fd);
        }
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ready.clear();
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block until at least one registered socket is ready to read, or the
    /// timeout elapses. A zero timeout waits indefinitely.
    ///
    /// Returns whether any socket became ready; the per-socket answer is
    /// queried with [`Selector::is_ready`].
    pub fn wait(&mut self, timeout: Duration) -> bool {
        self.ready.clear();

        let fds: Vec<RawFd> = self.entries.iter().copied().collect();
        let bound = if timeout.is_zero() { None } else { Some(timeout) };

        match sys::poll_read(&fds, bound) {
            Ok(ready) => {
                self.ready = ready.into_iter().collect();
                !self.ready.is_empty()
            }
            Err(err) => {
                error!("readiness wait failed: {err}");
                false
            }
        }
    }

    /// Whether `socket` was ready in the snapshot of the last `wait`.
    pub fn is_ready(&self, socket: &impl Selectable) -> bool {
        socket
            .native_handle()
            .is_some_and(|fd| self.ready.contains(&fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::IpAddress;
    use crate::listener::TcpListener;
    use crate::socket::{Status, ANY_PORT};
    use crate::tcp::TcpSocket;
    use crate::udp::UdpSocket;
    use std::time::Instant;

    fn bound_udp() -> (UdpSocket, u16) {
        let mut socket = UdpSocket::new();
        assert_eq!(socket.bind(ANY_PORT, IpAddress::ANY), Status::Done);
        let port = socket.local_port();
        (socket, port)
    }

    #[test]
    fn test_add_ignores_sockets_without_handles() {
        let mut selector = Selector::new();
        let socket = UdpSocket::new();
        selector.add(&socket);
        assert!(selector.is_empty());
        assert!(!selector.is_ready(&socket));
    }

    #[test]
    fn test_wait_times_out_when_nothing_is_readable() {
        let (quiet, _port) = bound_udp();
        let mut selector = Selector::new();
        selector.add(&quiet);

        let started = Instant::now();
        assert!(!selector.wait(Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!selector.is_ready(&quiet));
    }

    #[test]
    fn test_only_the_readable_socket_reports_ready() {
        let (mut first, first_port) = bound_udp();
        let (second, _second_port) = bound_udp();

        let mut selector = Selector::new();
        selector.add(&first);
        selector.add(&second);

        let mut sender = UdpSocket::new();
        assert_eq!(
            sender.send_to(b"wake", IpAddress::LOCALHOST, first_port),
            Status::Done
        );

        let started = Instant::now();
        assert!(selector.wait(Duration::from_secs(5)));
        // The wakeup must arrive promptly, not ride out the timeout.
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(selector.is_ready(&first));
        assert!(!selector.is_ready(&second));

        let mut buf = [0u8; 16];
        let (status, received, _) = first.receive_from(&mut buf);
        assert_eq!(status, Status::Done);
        assert_eq!(&buf[..received], b"wake");
    }

    #[test]
    fn test_listener_readiness_means_pending_accept() {
        let mut listener = TcpListener::new();
        assert_eq!(listener.listen(ANY_PORT, IpAddress::ANY), Status::Done);
        let port = listener.local_port();

        let mut selector = Selector::new();
        selector.add(&listener);
        assert!(!selector.wait(Duration::from_millis(50)));

        let mut client = TcpSocket::new();
        assert_eq!(
            client.connect(IpAddress::LOCALHOST, port, Duration::ZERO),
            Status::Done
        );

        assert!(selector.wait(Duration::from_secs(5)));
        assert!(selector.is_ready(&listener));

        let mut accepted = TcpSocket::new();
        assert_eq!(listener.accept(&mut accepted), Status::Done);
    }

    #[test]
    fn test_next_wait_invalidates_previous_snapshot() {
        let (mut first, first_port) = bound_udp();

        let mut selector = Selector::new();
        selector.add(&first);

        let mut sender = UdpSocket::new();
        assert_eq!(
            sender.send_to(b"one", IpAddress::LOCALHOST, first_port),
            Status::Done
        );
        assert!(selector.wait(Duration::from_secs(5)));
        assert!(selector.is_ready(&first));

        // Drain, then wait again: the old snapshot must not linger.
        let mut buf = [0u8; 16];
        let (status, _, _) = first.receive_from(&mut buf);
        assert_eq!(status, Status::Done);

        assert!(!selector.wait(Duration::from_millis(50)));
        assert!(!selector.is_ready(&first));
    }

    #[test]
    fn test_remove_and_clear_drop_registrations() {
        let (first, _) = bound_udp();
        let (second, _) = bound_udp();

        let mut selector = Selector::new();
        selector.add(&first);
        selector.add(&second);
        assert_eq!(selector.len(), 2);

        selector.remove(&first);
        assert_eq!(selector.len(), 1);

        selector.clear();
        assert!(selector.is_empty());
    }
}
