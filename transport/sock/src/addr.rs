//! IPv4 address value type.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;

use socket2::{Domain, SockAddr, Socket, Type};

/// An immutable IPv4 network address.
///
/// The address is stored as its 32-bit integer value; comparison and
/// ordering follow that value, and fallible constructors return
/// `Option<IpAddress>`, which orders absent-before-present.
///
/// ```
/// use wharf_sock::IpAddress;
///
/// let addr = IpAddress::from_bytes(192, 168, 1, 56);
/// assert_eq!(addr.to_string(), "192.168.1.56");
/// assert_eq!(IpAddress::resolve("192.168.1.56"), Some(addr));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpAddress(u32);

impl IpAddress {
    /// Address representing any interface (0.0.0.0).
    pub const ANY: IpAddress = IpAddress::from_bytes(0, 0, 0, 0);
    /// The loopback address (127.0.0.1).
    pub const LOCALHOST: IpAddress = IpAddress::from_bytes(127, 0, 0, 1);
    /// The broadcast address (255.255.255.255).
    pub const BROADCAST: IpAddress = IpAddress::from_bytes(255, 255, 255, 255);

    /// Build an address from its four dotted-notation bytes.
    pub const fn from_bytes(b0: u8, b1: u8, b2: u8, b3: u8) -> Self {
        Self(u32::from_be_bytes([b0, b1, b2, b3]))
    }

    /// Build an address from the integer form produced by [`IpAddress::to_u32`].
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// The address packed into a 32-bit integer, suitable for sending over
    /// the wire and rebuilding with [`IpAddress::from_u32`].
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Turn a decimal address or a host name into an address.
    ///
    /// The broadcast and any addresses are handled explicitly; everything
    /// else is first parsed as dotted notation, then looked up as a host
    /// name. IPv6-only hosts resolve to `None`.
    pub fn resolve(host: &str) -> Option<Self> {
        if host.is_empty() {
            return None;
        }
        if host == "255.255.255.255" {
            return Some(Self::BROADCAST);
        }
        if host == "0.0.0.0" {
            return Some(Self::ANY);
        }

        if let Ok(parsed) = host.parse::<Ipv4Addr>() {
            return Some(parsed.into());
        }

        (host, 0u16)
            .to_socket_addrs()
            .ok()?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(IpAddress::from(*v4.ip())),
                SocketAddr::V6(_) => None,
            })
    }

    /// The machine's address on the local network.
    ///
    /// Connects a throwaway datagram socket (which sends no traffic) and
    /// reads back the address the system chose for it.
    pub fn local_address() -> Option<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).ok()?;
        let target = SockAddr::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        sock.connect(&target).ok()?;

        let local = sock.local_addr().ok()?;
        local.as_socket_ipv4().map(|addr| IpAddress::from(*addr.ip()))
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv4Addr::from(self.0).fmt(f)
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Self::from)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl From<IpAddress> for Ipv4Addr {
    fn from(addr: IpAddress) -> Self {
        Ipv4Addr::from(addr.0)
    }
}
