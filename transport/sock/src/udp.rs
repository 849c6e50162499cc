//! Connectionless datagram socket.

use tracing::error;

use wharf_wire::Packet;

use crate::addr::IpAddress;
use crate::select::Selectable;
use crate::socket::{Kind, SockBase, Status};
use crate::sys;

/// Largest payload accepted for a single datagram.
///
/// Theoretical UDP limit minus the IP and UDP header overhead. Anything
/// larger is rejected outright: splitting one message across datagrams
/// would forfeit the ordering and atomicity a datagram guarantees, so the
/// ceiling is a protocol rule rather than an OS error.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// A datagram socket delivering discrete, unordered, best-effort messages.
///
/// Every send and receive names the peer explicitly; one datagram is one
/// message, and packets travel as their raw bytes with no added framing.
#[derive(Debug)]
pub struct UdpSocket {
    base: SockBase,
    /// Scratch space for whole-datagram packet receives
    buffer: Vec<u8>,
}

impl UdpSocket {
    /// Create an unbound datagram socket in blocking mode.
    pub fn new() -> Self {
        Self {
            base: SockBase::new(Kind::Datagram),
            buffer: Vec::new(),
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

    /// Port this socket is bound to, or 0 if unbound.
    pub fn local_port(&self) -> u16 {
        self.base.local_port()
    }

    /// Bind the socket so it can receive datagrams on `port`.
    ///
    /// A socket already bound is rebound. Binding to the broadcast address
    /// is rejected.
    pub fn bind(&mut self, port: u16, address: IpAddress) -> Status {
        self.base.close();
        self.base.create();

        if address == IpAddress::BROADCAST {
            error!("cannot bind datagram socket to the broadcast address");
            return Status::Error;
        }
        let Some(sock) = self.base.get() else {
            return Status::Error;
        };

        let addr = sys::sock_addr(address, port);
        if let Err(err) = sock.bind(&addr) {
            error!("failed to bind datagram socket to port {port}: {err}");
            return Status::Error;
        }

        Status::Done
    }

    /// Release the bound port.
    pub fn unbind(&mut self) {
        self.base.close();
    }

    /// Send one datagram to `address:port`.
    ///
    /// Payloads above [`MAX_DATAGRAM_SIZE`] are rejected before any OS call.
    /// A datagram is never partially sent.
    pub fn send_to(&mut self, data: &[u8], address: IpAddress, port: u16) -> Status {
        self.base.create();

        if data.len() > MAX_DATAGRAM_SIZE {
            error!(
                size = data.len(),
                limit = MAX_DATAGRAM_SIZE,
                "cannot send datagram larger than the per-message ceiling"
            );
            return Status::Error;
        }
        let Some(sock) = self.base.get() else {
            return Status::Error;
        };

        let target = sys::sock_addr(address, port);
        match sock.send_to(data, &target) {
            Ok(_) => Status::Done,
            Err(err) => sys::status_from_io(&err),
        }
    }

    /// Receive one datagram into `buf`, reporting the sender.
    ///
    /// A datagram longer than `buf` is truncated by the transport. On any
    /// non-`Done` outcome the count is 0 and the sender is `None`.
    pub fn receive_from(&mut self, buf: &mut [u8]) -> (Status, usize, Option<(IpAddress, u16)>) {
        let Some(sock) = self.base.get() else {
            error!("cannot receive: datagram socket is not bound");
            return (Status::Error, 0, None);
        };

        match sys::recv_from(sock, buf) {
            Ok((received, addr)) => {
                let sender = addr
                    .as_socket_ipv4()
                    .map(|v4| (IpAddress::from(*v4.ip()), v4.port()));
                (Status::Done, received, sender)
            }
            Err(err) => (sys::status_from_io(&err), 0, None),
        }
    }

    /// Send a packet's bytes as one datagram.
    ///
    /// The datagram itself is the frame, so no length prefix is added; the
    /// same size ceiling applies.
    pub fn send_packet_to(&mut self, packet: &Packet, address: IpAddress, port: u16) -> Status {
        self.send_to(packet.as_bytes(), address, port)
    }

    /// Receive one datagram into `packet`, reporting the sender.
    ///
    /// The packet is cleared first; on success it holds exactly the
    /// datagram's bytes.
    pub fn receive_packet_from(&mut self, packet: &mut Packet) -> (Status, Option<(IpAddress, u16)>) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.resize(MAX_DATAGRAM_SIZE, 0);

        let (status, received, sender) = self.receive_from(&mut buffer);

        packet.clear();
        if status == Status::Done && received > 0 {
            packet.append(&buffer[..received]);
        }

        self.buffer = buffer;
        (status, sender)
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Selectable for UdpSocket {
    fn native_handle(&self) -> Option<std::os::unix::io::RawFd> {
        self.base.raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ANY_PORT;

    fn bound_socket() -> (UdpSocket, u16) {
        let mut socket = UdpSocket::new();
        assert_eq!(socket.bind(ANY_PORT, IpAddress::ANY), Status::Done);
        let port = socket.local_port();
        assert_ne!(port, 0);
        (socket, port)
    }

    #[test]
    fn test_bind_rejects_broadcast_address() {
        let mut socket = UdpSocket::new();
        assert_eq!(socket.bind(ANY_PORT, IpAddress::BROADCAST), Status::Error);
    }

    #[test]
    fn test_unbind_twice_is_a_no_op() {
        let (mut socket, _port) = bound_socket();
        socket.unbind();
        socket.unbind();
        assert_eq!(socket.local_port(), 0);
    }

    #[test]
    fn test_datagram_round_trip_reports_sender() {
        let (mut receiver, port) = bound_socket();
        let mut sender = UdpSocket::new();

        assert_eq!(sender.send_to(b"hello", IpAddress::LOCALHOST, port), Status::Done);

        let mut buf = [0u8; 64];
        let (status, received, from) = receiver.receive_from(&mut buf);
        assert_eq!(status, Status::Done);
        assert_eq!(&buf[..received], b"hello");

        let (from_addr, from_port) = from.expect("sender reported");
        assert_eq!(from_addr, IpAddress::LOCALHOST);
        assert_eq!(from_port, sender.local_port());
    }

    #[test]
    fn test_oversized_datagram_rejected_without_sending() {
        let (mut receiver, port) = bound_socket();
        receiver.set_blocking(false);

        let mut sender = UdpSocket::new();
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert_eq!(
            sender.send_to(&oversized, IpAddress::LOCALHOST, port),
            Status::Error
        );

        // Nothing may have reached the wire, not even a truncated prefix.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut buf = [0u8; 64];
        let (status, received, from) = receiver.receive_from(&mut buf);
        assert_eq!(status, Status::NotReady);
        assert_eq!(received, 0);
        assert_eq!(from, None);
    }

    #[test]
    fn test_largest_allowed_datagram_is_accepted_locally() {
        let mut sender = UdpSocket::new();
        let payload = vec![7u8; MAX_DATAGRAM_SIZE];
        // Loopback MTU permits the full-size datagram; the ceiling itself
        // must not reject it.
        let status = sender.send_to(&payload, IpAddress::LOCALHOST, 9);
        assert_ne!(status, Status::Partial);
    }

    #[test]
    fn test_packet_datagram_round_trip() {
        let (mut receiver, port) = bound_socket();
        let mut sender = UdpSocket::new();

        let mut outgoing = Packet::new();
        outgoing.write_u16(99).write_str("datagram");
        assert_eq!(
            sender.send_packet_to(&outgoing, IpAddress::LOCALHOST, port),
            Status::Done
        );

        let mut incoming = Packet::new();
        let (status, from) = receiver.receive_packet_from(&mut incoming);
        assert_eq!(status, Status::Done);
        assert!(from.is_some());
        assert_eq!(incoming.read_u16(), Some(99));
        assert_eq!(incoming.read_string().as_deref(), Some("datagram"));
    }

    #[test]
    fn test_not_ready_clears_packet_and_sender() {
        let (mut receiver, _port) = bound_socket();
        receiver.set_blocking(false);

        let mut packet = Packet::new();
        packet.write_u8(1);
        let (status, from) = receiver.receive_packet_from(&mut packet);
        assert_eq!(status, Status::NotReady);
        assert_eq!(from, None);
        assert!(packet.is_empty());
    }
}
