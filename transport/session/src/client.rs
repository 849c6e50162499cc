//! Event-driven TCP client session.
//!
//! One worker thread owns the stream socket; everything the caller does
//! goes through channels. Inbound traffic and lifecycle changes arrive as
//! [`ClientEvent`]s on the event channel, outbound sends travel over a
//! command channel, and shutdown is cooperative: dropping the client (or
//! calling [`TcpClient::disconnect`]) closes the command channel and joins
//! the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use wharf_sock::{IpAddress, Selector, Status, TcpSocket};

use crate::SessionError;

/// How long the worker waits on the socket before draining commands.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read buffer used by the receive loop.
const READ_CHUNK: usize = 4096;

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on the connect attempt; zero follows the blocking mode
    pub connect_timeout: Duration,
    /// Reconnect automatically after this pause when the peer drops us
    pub reconnect: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: None,
        }
    }
}

/// Events emitted by a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection (or a reconnection) is established
    Connected,
    /// Raw bytes arrived from the server
    Message(Vec<u8>),
    /// The server closed the connection
    Disconnected,
    /// The session hit an unrecoverable transport error and stopped
    Error(String),
}

enum Command {
    Send(Vec<u8>),
    Shutdown,
}

/// A TCP client running its own receive loop.
///
/// ```no_run
/// use wharf_session::{ClientConfig, ClientEvent, TcpClient};
/// use wharf_sock::IpAddress;
///
/// let client = TcpClient::connect(
///     IpAddress::LOCALHOST,
///     7100,
///     ClientConfig::default(),
/// ).unwrap();
///
/// client.send(b"hello".to_vec());
/// for event in client.events().iter() {
///     if let ClientEvent::Message(data) = event {
///         println!("got {} bytes", data.len());
///         break;
///     }
/// }
/// ```
pub struct TcpClient {
    commands: Sender<Command>,
    events: Receiver<ClientEvent>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TcpClient {
    /// Resolve `host` and connect to it.
    pub fn connect_host(host: &str, port: u16, config: ClientConfig) -> Result<Self, SessionError> {
        let address =
            IpAddress::resolve(host).ok_or_else(|| SessionError::Resolve(host.to_owned()))?;
        Self::connect(address, port, config)
    }

    /// Connect to `address:port` and start the receive loop.
    pub fn connect(
        address: IpAddress,
        port: u16,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        let mut socket = TcpSocket::new();
        if socket.connect(address, port, config.connect_timeout) != Status::Done {
            return Err(SessionError::Connect(address, port));
        }

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&connected);
        let worker = std::thread::Builder::new()
            .name("wharf-client".into())
            .spawn(move || {
                client_loop(socket, address, port, config, command_rx, event_tx, flag);
            })
            .map_err(|err| {
                warn!("failed to spawn client worker: {err}");
                SessionError::Connect(address, port)
            })?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            connected,
            worker: Some(worker),
        })
    }

    /// Whether the session currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queue raw bytes for sending. Returns false once the session is
    /// shut down.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.commands.send(Command::Send(data)).is_ok()
    }

    /// The event channel; block, iterate, or poll it as needed.
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// Take one pending event without blocking.
    pub fn poll_event(&self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Stop the receive loop and close the connection.
    pub fn disconnect(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn client_loop(
    mut socket: TcpSocket,
    address: IpAddress,
    port: u16,
    config: ClientConfig,
    commands: Receiver<Command>,
    events: Sender<ClientEvent>,
    connected: Arc<AtomicBool>,
) {
    let _ = events.send(ClientEvent::Connected);
    socket.set_blocking(false);

    let mut buf = vec![0u8; READ_CHUNK];
    let mut selector = Selector::new();
    selector.add(&socket);

    'session: loop {
        // Outbound first, so queued sends are not delayed by the wait.
        loop {
            match commands.try_recv() {
                Ok(Command::Send(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    let status = send_fully(&mut socket, &data);
                    if status == Status::Disconnected {
                        if !handle_drop(&mut socket, &address, port, &config, &commands, &events, &connected) {
                            break 'session;
                        }
                        // The reconnected socket carries a new handle.
                        selector.clear();
                        selector.add(&socket);
                    } else if status == Status::Error {
                        let _ = events.send(ClientEvent::Error("send failed".into()));
                        break 'session;
                    }
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break 'session,
                Err(TryRecvError::Empty) => break,
            }
        }

        if !selector.wait(POLL_INTERVAL) || !selector.is_ready(&socket) {
            continue;
        }

        match socket.receive(&mut buf) {
            (Status::Done, received) => {
                let _ = events.send(ClientEvent::Message(buf[..received].to_vec()));
            }
            (Status::NotReady, _) => {}
            (Status::Disconnected, _) => {
                if !handle_drop(&mut socket, &address, port, &config, &commands, &events, &connected) {
                    break 'session;
                }
                selector.clear();
                selector.add(&socket);
            }
            (status, _) => {
                let _ = events.send(ClientEvent::Error(format!("receive failed: {status:?}")));
                break 'session;
            }
        }
    }

    socket.disconnect();
    connected.store(false, Ordering::Relaxed);
    debug!("client session worker stopped");
}

/// React to a dropped connection: report it and, when configured,
/// reconnect. Returns false when the session should end.
fn handle_drop(
    socket: &mut TcpSocket,
    address: &IpAddress,
    port: u16,
    config: &ClientConfig,
    commands: &Receiver<Command>,
    events: &Sender<ClientEvent>,
    connected: &AtomicBool,
) -> bool {
    connected.store(false, Ordering::Relaxed);
    let _ = events.send(ClientEvent::Disconnected);

    let Some(interval) = config.reconnect else {
        return false;
    };

    loop {
        std::thread::sleep(interval);

        // A shutdown request outranks reconnecting; sends queued while the
        // connection is down cannot be delivered and are dropped.
        loop {
            match commands.try_recv() {
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Ok(Command::Send(_)) => debug!("dropping queued send while disconnected"),
                Err(TryRecvError::Empty) => break,
            }
        }

        *socket = TcpSocket::new();
        if socket.connect(*address, port, config.connect_timeout) == Status::Done {
            socket.set_blocking(false);
            connected.store(true, Ordering::Relaxed);
            let _ = events.send(ClientEvent::Connected);
            return true;
        }
        debug!("reconnect attempt to {address}:{port} failed, retrying");
    }
}

/// Send all of `data`, riding out partial acceptance on the
/// non-blocking socket.
pub(crate) fn send_fully(socket: &mut TcpSocket, data: &[u8]) -> Status {
    let mut offset = 0;
    loop {
        let (status, sent) = socket.send_some(&data[offset..]);
        match status {
            Status::Done => return Status::Done,
            Status::Partial | Status::NotReady => {
                offset += sent;
                std::thread::sleep(Duration::from_millis(1));
            }
            other => return other,
        }
    }
}
