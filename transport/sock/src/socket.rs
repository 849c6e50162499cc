//! Shared socket lifecycle record and the transfer status contract.

use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Socket, Type};
use tracing::{error, warn};

/// Status codes reported by socket operations.
///
/// These five values are the whole contract surface: callers branch on
/// them and no other values are produced. `NotReady` and `Partial` are
/// ordinary outcomes under non-blocking use, not failures.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation transferred all requested data
    Done,
    /// The socket is not ready to transfer data yet
    NotReady,
    /// Only part of the data was transferred; resume with the remainder
    Partial,
    /// The connection was closed by the peer or torn down by the transport
    Disconnected,
    /// An unexpected error happened
    Error,
}

/// Special port value that lets the system pick any available port.
pub const ANY_PORT: u16 = 0;

/// Transport protocol carried by a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Connection-oriented, ordered byte stream
    Stream,
    /// Connectionless, message-oriented
    Datagram,
}

/// Handle-lifecycle record shared by every socket kind.
///
/// Owns at most one live OS socket. The handle is absent until first use
/// (lazy create) or until an accepted handle is adopted; dropping the
/// record closes it exactly once. The blocking flag is remembered even
/// while no handle exists and applied as soon as one does.
#[derive(Debug)]
pub(crate) struct SockBase {
    kind: Kind,
    sock: Option<Socket>,
    blocking: bool,
}

impl SockBase {
    /// New handle-less record; sockets start out blocking.
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            kind,
            sock: None,
            blocking: true,
        }
    }

    /// Lazily allocate the OS socket of the configured kind.
    ///
    /// Allocation failure leaves the record handle-less: later operations
    /// degrade to `Error`/`NotReady` instead of propagating a failure here.
    pub(crate) fn create(&mut self) {
        if self.sock.is_some() {
            return;
        }

        let ty = match self.kind {
            Kind::Stream => Type::STREAM,
            Kind::Datagram => Type::DGRAM,
        };
        match Socket::new(Domain::IPV4, ty, None) {
            Ok(sock) => self.adopt(sock),
            Err(err) => error!("failed to create socket: {err}"),
        }
    }

    /// Adopt an externally obtained handle (the accept path).
    ///
    /// Applies the remembered blocking mode and the protocol tuning every
    /// socket of this kind gets: stream sockets disable send coalescing,
    /// datagram sockets enable broadcast.
    pub(crate) fn adopt(&mut self, sock: Socket) {
        if self.sock.is_some() {
            return;
        }

        if let Err(err) = sock.set_nonblocking(!self.blocking) {
            warn!("failed to apply blocking mode to socket: {err}");
        }

        match self.kind {
            Kind::Stream => {
                if let Err(err) = sock.set_tcp_nodelay(true) {
                    warn!("failed to disable send coalescing on stream socket: {err}");
                }
                #[cfg(any(target_os = "macos", target_os = "ios"))]
                if let Err(err) = sock.set_nosigpipe(true) {
                    warn!("failed to suppress SIGPIPE on stream socket: {err}");
                }
            }
            Kind::Datagram => {
                if let Err(err) = sock.set_broadcast(true) {
                    warn!("failed to enable broadcast on datagram socket: {err}");
                }
            }
        }

        self.sock = Some(sock);
    }

    /// Release the handle if present; harmless to call again.
    pub(crate) fn close(&mut self) {
        self.sock = None;
    }

    /// Set the blocking mode, applying it immediately when a handle exists
    /// and remembering it for the next `create`/`adopt` otherwise.
    pub(crate) fn set_blocking(&mut self, blocking: bool) {
        if let Some(sock) = &self.sock {
            if let Err(err) = sock.set_nonblocking(!blocking) {
                warn!("failed to change socket blocking mode: {err}");
            }
        }
        self.blocking = blocking;
    }

    /// The last-set blocking flag, whether or not a handle exists.
    pub(crate) fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// The live OS socket, if one has been created or adopted.
    pub(crate) fn get(&self) -> Option<&Socket> {
        self.sock.as_ref()
    }

    /// The raw handle, for readiness registration.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|sock| sock.as_raw_fd())
    }

    /// Port the socket is bound to locally, or 0 when unknown.
    pub(crate) fn local_port(&self) -> u16 {
        self.sock
            .as_ref()
            .and_then(|sock| sock.local_addr().ok())
            .and_then(|addr| addr.as_socket_ipv4())
            .map(|addr| addr.port())
            .unwrap_or(0)
    }
}
