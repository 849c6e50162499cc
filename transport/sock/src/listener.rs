//! Listening socket producing accepted stream connections.

use tracing::error;

use crate::addr::IpAddress;
use crate::select::Selectable;
use crate::socket::{Kind, SockBase, Status};
use crate::sys;
use crate::tcp::TcpSocket;

/// A socket that listens for incoming stream connections.
#[derive(Debug)]
pub struct TcpListener {
    base: SockBase,
}

impl TcpListener {
    /// Create a listener in blocking mode, not yet listening.
    pub fn new() -> Self {
        Self {
            base: SockBase::new(Kind::Stream),
        }
    }

    /// Set the blocking mode; remembered if the handle does not exist yet.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.base.set_blocking(blocking);
    }

    /// The last-set blocking flag.
    pub fn is_blocking(&self) -> bool {
        self.base.is_blocking()
    }

    /// Port the listener is bound to, or 0 when not listening.
    pub fn local_port(&self) -> u16 {
        self.base.local_port()
    }

    /// Start listening on `port`.
    ///
    /// A listener already bound is closed and rebound. Listening on the
    /// broadcast address is rejected. The accept backlog uses the OS
    /// maximum.
    pub fn listen(&mut self, port: u16, address: IpAddress) -> Status {
        self.close();
        self.base.create();

        if address == IpAddress::BROADCAST {
            error!("cannot listen on the broadcast address");
            return Status::Error;
        }
        let Some(sock) = self.base.get() else {
            return Status::Error;
        };

        let addr = sys::sock_addr(address, port);
        if let Err(err) = sock.bind(&addr) {
            error!("failed to bind listener to port {port}: {err}");
            return Status::Error;
        }

        if let Err(err) = sock.listen(libc::SOMAXCONN) {
            error!("failed to listen on port {port}: {err}");
            return Status::Error;
        }

        Status::Done
    }

    /// Stop listening. Harmless when not listening.
    pub fn close(&mut self) {
        self.base.close();
    }

    /// Accept an incoming connection into `socket`.
    ///
    /// Blocks according to this listener's blocking mode. On success the
    /// destination socket is closed and re-initialized around the accepted
    /// connection. Fails with `Error` when the listener is not listening.
    pub fn accept(&mut self, socket: &mut TcpSocket) -> Status {
        let Some(sock) = self.base.get() else {
            error!("cannot accept: the socket is not listening");
            return Status::Error;
        };

        match sock.accept() {
            Ok((accepted, _peer)) => {
                socket.reinitialize(accepted);
                Status::Done
            }
            Err(err) => sys::status_from_io(&err),
        }
    }
}

impl Default for TcpListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Selectable for TcpListener {
    fn native_handle(&self) -> Option<std::os::unix::io::RawFd> {
        self.base.raw_fd()
    }
}
