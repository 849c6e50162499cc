//! Session-level collaborators built on the wharf socket layer.
//!
//! This crate layers convenience on the synchronous core without adding
//! any wire-level behavior of its own:
//!
//! - **TCP client/server wrappers**: a worker thread owns each socket and
//!   feeds lifecycle/traffic events through channels, so applications get
//!   callbacks-by-iteration instead of hand-rolled receive loops.
//! - **HTTP/1.x client**: plain-HTTP request/response with one connection
//!   per request.
//! - **FTP client**: control-channel commands plus passive-mode data
//!   channels for listings and transfers.
//!
//! The core's status codes never escape this crate as panics; transient
//! conditions are ridden out, terminal ones become events or responses.

#![warn(clippy::all)]

pub mod client;
pub mod ftp;
pub mod http;
pub mod server;

use thiserror::Error;

use wharf_sock::IpAddress;

/// Errors surfaced while setting a session up.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Host name did not resolve to an IPv4 address
    #[error("failed to resolve host: {0}")]
    Resolve(String),

    /// TCP connection could not be established
    #[error("failed to connect to {0}:{1}")]
    Connect(IpAddress, u16),

    /// Listening socket could not be bound
    #[error("failed to listen on port {0}")]
    Listen(u16),
}

pub use client::{ClientConfig, ClientEvent, TcpClient};
pub use ftp::{DirectoryResponse, Ftp, FtpResponse, FtpStatus, ListingResponse, TransferMode};
pub use http::{public_address, HttpClient, Method, Request, Response, ResponseStatus};
pub use server::{ClientId, ServerEvent, TcpServer};
