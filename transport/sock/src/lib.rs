//! Synchronous socket layer for the wharf transport.
//!
//! This crate is a thin, portable abstraction over stream and datagram
//! sockets on Unix platforms: a shared handle-lifecycle record, TCP and
//! UDP socket types with framed packet transfer, a listening socket, and
//! a poll-based readiness selector for driving many sockets from one
//! thread.
//!
//! All calls are synchronous; non-blocking mode only changes whether an
//! operation returns `NotReady`/`Partial` instead of suspending the
//! calling thread. No socket type is internally synchronized: each
//! instance is single-owner, and callers that share one across threads
//! must serialize access themselves.

#![warn(clippy::all)]

pub mod addr;
pub mod listener;
pub mod select;
pub mod socket;
mod sys;
pub mod tcp;
pub mod udp;

pub use addr::IpAddress;
pub use listener::TcpListener;
pub use select::{Selectable, Selector};
pub use socket::{Status, ANY_PORT};
pub use tcp::TcpSocket;
pub use udp::{UdpSocket, MAX_DATAGRAM_SIZE};
