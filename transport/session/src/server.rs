//! Event-driven TCP server session.
//!
//! A single worker thread owns the listener, the selector, and every
//! accepted socket. Callers talk to it over channels: lifecycle and
//! traffic come back as [`ServerEvent`]s, sends/kicks go in as commands.
//! The client roster is mirrored into a concurrent map so `client_count`
//! and `clients` never touch the worker's state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use tracing::{debug, warn};

use wharf_sock::{IpAddress, Selector, Status, TcpListener, TcpSocket, ANY_PORT};

use crate::client::send_fully;
use crate::SessionError;

/// How long the worker waits for readiness before draining commands.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read buffer used by the receive loop.
const READ_CHUNK: usize = 4096;

/// Identifier handed out for each accepted connection.
pub type ClientId = u64;

/// Events emitted by a server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A new connection was accepted
    Connected {
        /// Identifier of the new client
        client: ClientId,
        /// Peer address
        address: IpAddress,
        /// Peer port
        port: u16,
    },
    /// Raw bytes arrived from a client
    Message {
        /// Identifier of the sending client
        client: ClientId,
        /// The received bytes
        data: Vec<u8>,
    },
    /// A client went away (peer close or kick)
    Disconnected {
        /// Identifier of the departed client
        client: ClientId,
    },
}

enum Command {
    Send(ClientId, Vec<u8>),
    Broadcast(Vec<u8>),
    Kick(ClientId),
    Shutdown,
}

/// A TCP server accepting and serving connections on a worker thread.
pub struct TcpServer {
    commands: Sender<Command>,
    events: Receiver<ServerEvent>,
    roster: Arc<DashMap<ClientId, (IpAddress, u16)>>,
    running: Arc<AtomicBool>,
    local_port: u16,
    worker: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Bind `address:port` and start accepting connections.
    ///
    /// Pass [`ANY_PORT`] to let the system pick a port; read it back with
    /// [`TcpServer::local_port`].
    pub fn start(port: u16, address: IpAddress) -> Result<Self, SessionError> {
        let mut listener = TcpListener::new();
        if listener.listen(port, address) != Status::Done {
            return Err(SessionError::Listen(port));
        }
        let local_port = listener.local_port();
        listener.set_blocking(false);

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let roster = Arc::new(DashMap::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker_roster = Arc::clone(&roster);
        let worker_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("wharf-server".into())
            .spawn(move || {
                server_loop(listener, command_rx, event_tx, worker_roster, worker_running);
            })
            .map_err(|err| {
                warn!("failed to spawn server worker: {err}");
                SessionError::Listen(port)
            })?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            roster,
            running,
            local_port,
            worker: Some(worker),
        })
    }

    /// Start on any available port on all interfaces.
    pub fn start_any() -> Result<Self, SessionError> {
        Self::start(ANY_PORT, IpAddress::ANY)
    }

    /// Port the server is listening on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the worker is still serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Queue bytes for one client. Returns false once the server stopped.
    pub fn send_to(&self, client: ClientId, data: Vec<u8>) -> bool {
        self.commands.send(Command::Send(client, data)).is_ok()
    }

    /// Queue bytes for every connected client.
    pub fn broadcast(&self, data: Vec<u8>) -> bool {
        self.commands.send(Command::Broadcast(data)).is_ok()
    }

    /// Disconnect one client.
    pub fn kick(&self, client: ClientId) -> bool {
        self.commands.send(Command::Kick(client)).is_ok()
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.roster.len()
    }

    /// Snapshot of connected clients and their peer endpoints.
    pub fn clients(&self) -> Vec<(ClientId, IpAddress, u16)> {
        self.roster
            .iter()
            .map(|entry| (*entry.key(), entry.value().0, entry.value().1))
            .collect()
    }

    /// The event channel; block, iterate, or poll it as needed.
    pub fn events(&self) -> &Receiver<ServerEvent> {
        &self.events
    }

    /// Take one pending event without blocking.
    pub fn poll_event(&self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Stop accepting, drop every client, and join the worker.
    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ServerState {
    clients: HashMap<ClientId, TcpSocket>,
    roster: Arc<DashMap<ClientId, (IpAddress, u16)>>,
    next_id: ClientId,
}

impl ServerState {
    fn drop_client(&mut self, selector: &mut Selector, id: ClientId, events: &Sender<ServerEvent>) {
        if let Some(socket) = self.clients.remove(&id) {
            selector.remove(&socket);
            self.roster.remove(&id);
            let _ = events.send(ServerEvent::Disconnected { client: id });
        }
    }
}

fn server_loop(
    mut listener: TcpListener,
    commands: Receiver<Command>,
    events: Sender<ServerEvent>,
    roster: Arc<DashMap<ClientId, (IpAddress, u16)>>,
    running: Arc<AtomicBool>,
) {
    let mut selector = Selector::new();
    selector.add(&listener);

    let mut state = ServerState {
        clients: HashMap::new(),
        roster,
        next_id: 1,
    };
    let mut buf = vec![0u8; READ_CHUNK];

    'serving: loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Send(id, data)) => {
                    let mut gone = false;
                    if let Some(socket) = state.clients.get_mut(&id) {
                        gone = send_fully(socket, &data) == Status::Disconnected;
                    }
                    if gone {
                        state.drop_client(&mut selector, id, &events);
                    }
                }
                Ok(Command::Broadcast(data)) => {
                    let mut dropped = Vec::new();
                    for (id, socket) in state.clients.iter_mut() {
                        if send_fully(socket, &data) == Status::Disconnected {
                            dropped.push(*id);
                        }
                    }
                    for id in dropped {
                        state.drop_client(&mut selector, id, &events);
                    }
                }
                Ok(Command::Kick(id)) => state.drop_client(&mut selector, id, &events),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break 'serving,
                Err(TryRecvError::Empty) => break,
            }
        }

        if !selector.wait(POLL_INTERVAL) {
            continue;
        }

        // New connections first.
        if selector.is_ready(&listener) {
            let mut socket = TcpSocket::new();
            match listener.accept(&mut socket) {
                Status::Done => {
                    socket.set_blocking(false);

                    let id = state.next_id;
                    state.next_id += 1;
                    let address = socket.remote_address().unwrap_or(IpAddress::ANY);
                    let port = socket.remote_port();

                    selector.add(&socket);
                    state.clients.insert(id, socket);
                    state.roster.insert(id, (address, port));
                    let _ = events.send(ServerEvent::Connected {
                        client: id,
                        address,
                        port,
                    });
                }
                // The peer can vanish between readiness and accept.
                Status::NotReady | Status::Disconnected => {}
                status => warn!("accept failed: {status:?}"),
            }
        }

        // Then traffic from the clients that are ready.
        let ready: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, socket)| selector.is_ready(*socket))
            .map(|(id, _)| *id)
            .collect();

        for id in ready {
            let Some(socket) = state.clients.get_mut(&id) else {
                continue;
            };
            match socket.receive(&mut buf) {
                (Status::Done, received) => {
                    let _ = events.send(ServerEvent::Message {
                        client: id,
                        data: buf[..received].to_vec(),
                    });
                }
                (Status::NotReady, _) => {}
                (Status::Disconnected, _) => state.drop_client(&mut selector, id, &events),
                (status, _) => {
                    warn!(client = id, "receive failed: {status:?}");
                    state.drop_client(&mut selector, id, &events);
                }
            }
        }
    }

    state.roster.clear();
    running.store(false, Ordering::Relaxed);
    debug!("server session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, ClientEvent, TcpClient};

    const EVENT_WAIT: Duration = Duration::from_secs(5);

    fn wait_for<T, F: Fn(&T) -> bool>(events: &Receiver<T>, matches: F) -> T {
        let deadline = std::time::Instant::now() + EVENT_WAIT;
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .expect("timed out waiting for event");
            let event = events.recv_timeout(remaining).expect("event channel");
            if matches(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_client_server_round_trip() {
        let server = TcpServer::start_any().expect("server");
        let port = server.local_port();
        assert_ne!(port, 0);

        let client =
            TcpClient::connect(IpAddress::LOCALHOST, port, ClientConfig::default()).expect("client");
        assert!(client.is_connected());

        let connected = wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Connected { .. })
        });
        let ServerEvent::Connected { client: id, address, .. } = connected else {
            unreachable!()
        };
        assert_eq!(address, IpAddress::LOCALHOST);
        assert_eq!(server.client_count(), 1);

        assert!(client.send(b"hello server".to_vec()));
        let message = wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Message { .. })
        });
        let ServerEvent::Message { data, .. } = message else {
            unreachable!()
        };
        assert_eq!(data, b"hello server");

        assert!(server.send_to(id, b"hello client".to_vec()));
        let reply = wait_for(client.events(), |e| matches!(e, ClientEvent::Message(_)));
        assert_eq!(reply, ClientEvent::Message(b"hello client".to_vec()));
    }

    #[test]
    fn test_kick_disconnects_the_client() {
        let server = TcpServer::start_any().expect("server");
        let port = server.local_port();

        let client =
            TcpClient::connect(IpAddress::LOCALHOST, port, ClientConfig::default()).expect("client");

        let connected = wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Connected { .. })
        });
        let ServerEvent::Connected { client: id, .. } = connected else {
            unreachable!()
        };

        assert!(server.kick(id));
        wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Disconnected { .. })
        });
        wait_for(client.events(), |e| matches!(e, ClientEvent::Disconnected));
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let server = TcpServer::start_any().expect("server");
        let port = server.local_port();

        let first =
            TcpClient::connect(IpAddress::LOCALHOST, port, ClientConfig::default()).expect("first");
        let second =
            TcpClient::connect(IpAddress::LOCALHOST, port, ClientConfig::default()).expect("second");

        wait_for(server.events(), |e| matches!(e, ServerEvent::Connected { .. }));
        wait_for(server.events(), |e| matches!(e, ServerEvent::Connected { .. }));

        assert!(server.broadcast(b"to everyone".to_vec()));
        for client in [&first, &second] {
            let event = wait_for(client.events(), |e| matches!(e, ClientEvent::Message(_)));
            assert_eq!(event, ClientEvent::Message(b"to everyone".to_vec()));
        }
    }

    #[test]
    fn test_client_drop_is_noticed_by_server() {
        let server = TcpServer::start_any().expect("server");
        let port = server.local_port();

        let client =
            TcpClient::connect(IpAddress::LOCALHOST, port, ClientConfig::default()).expect("client");
        wait_for(server.events(), |e| matches!(e, ServerEvent::Connected { .. }));

        drop(client);
        wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Disconnected { .. })
        });
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_client_auto_reconnect() {
        let server = TcpServer::start_any().expect("server");
        let port = server.local_port();

        let config = ClientConfig {
            reconnect: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let client = TcpClient::connect(IpAddress::LOCALHOST, port, config).expect("client");

        wait_for(client.events(), |e| matches!(e, ClientEvent::Connected));
        let connected = wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Connected { .. })
        });
        let ServerEvent::Connected { client: id, .. } = connected else {
            unreachable!()
        };

        assert!(server.kick(id));
        wait_for(client.events(), |e| matches!(e, ClientEvent::Disconnected));

        // The session must come back on its own and register server-side.
        wait_for(client.events(), |e| matches!(e, ClientEvent::Connected));
        wait_for(server.events(), |e| {
            matches!(e, ServerEvent::Connected { .. })
        });
        assert!(client.is_connected());
    }

    #[test]
    fn test_stop_ends_the_worker() {
        let mut server = TcpServer::start_any().expect("server");
        assert!(server.is_running());
        server.stop();
        assert!(!server.is_running());
    }
}
