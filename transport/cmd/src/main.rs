//! wharf diagnostic tool.
//!
//! Exercises the transport stack end to end: a framed packet echo server
//! driven by the readiness selector, a round-trip probe client, and a
//! resolver check.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wharf_sock::{IpAddress, Selector, Status, TcpListener, TcpSocket};
use wharf_wire::Packet;

mod config;
mod logging;

use config::WharfConfig;
use logging::WharfLogFormatter;

/// How long the echo server waits for readiness per loop turn.
const SERVE_POLL: Duration = Duration::from_millis(100);

/// wharf transport diagnostic tool
#[derive(Parser, Debug)]
#[command(name = "wharf", version, about = "Transport layer diagnostic tool")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "wharf.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a framed packet echo server
    Serve {
        /// Listen port; overrides the config
        #[arg(long)]
        port: Option<u16>,

        /// Listen address; overrides the config
        #[arg(long)]
        address: Option<String>,
    },

    /// Send framed messages and report the round-trip latency
    Send {
        /// Server address
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        /// Server port; overrides the config
        #[arg(long)]
        port: Option<u16>,

        /// Message carried in each packet
        #[arg(long, default_value = "ping")]
        message: String,

        /// Number of round trips
        #[arg(long, default_value = "1")]
        count: u32,

        /// Connect timeout, e.g. 5s
        #[arg(long, default_value = "5s")]
        timeout: humantime::Duration,
    },

    /// Resolve a host name to its IPv4 address
    Resolve {
        /// Host name or dotted address
        host: String,
    },

    /// Report the machine's local and public IPv4 addresses
    Addresses {
        /// Bound on the public-address query
        #[arg(long, default_value = "5s")]
        timeout: humantime::Duration,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = WharfConfig::load_from_file(&args.config)?;
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());

    tracing_subscriber::fmt()
        .event_format(WharfLogFormatter::new())
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    match args.command {
        Command::Serve { port, address } => {
            let port = port.unwrap_or(config.listen_port);
            let address = address.unwrap_or_else(|| config.listen_address.clone());
            serve(port, &address, config.max_frame_size)
        }
        Command::Send {
            address,
            port,
            message,
            count,
            timeout,
        } => {
            let port = port.unwrap_or(config.listen_port);
            send(&address, port, &message, count, timeout.into())
        }
        Command::Resolve { host } => resolve(&host),
        Command::Addresses { timeout } => addresses(timeout.into()),
    }
}

/// Echo server: every complete frame goes straight back to its sender.
fn serve(port: u16, address: &str, max_frame_size: usize) -> Result<()> {
    let bind_address = IpAddress::resolve(address)
        .with_context(|| format!("cannot resolve listen address {address}"))?;

    let mut listener = TcpListener::new();
    if listener.listen(port, bind_address) != Status::Done {
        bail!("failed to listen on {address}:{port}");
    }
    listener.set_blocking(false);
    info!("echo server listening on {address}:{}", listener.local_port());

    let mut selector = Selector::new();
    selector.add(&listener);

    let mut clients: HashMap<u64, TcpSocket> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        if !selector.wait(SERVE_POLL) {
            continue;
        }

        if selector.is_ready(&listener) {
            let mut client = TcpSocket::new();
            if listener.accept(&mut client) == Status::Done {
                client.set_blocking(false);
                client.set_max_frame_size(max_frame_size);
                info!(
                    "client {next_id} connected from {}:{}",
                    client
                        .remote_address()
                        .unwrap_or(IpAddress::ANY),
                    client.remote_port()
                );
                selector.add(&client);
                clients.insert(next_id, client);
                next_id += 1;
            }
        }

        let ready: Vec<u64> = clients
            .iter()
            .filter(|(_, client)| selector.is_ready(*client))
            .map(|(id, _)| *id)
            .collect();

        for id in ready {
            let Some(client) = clients.get_mut(&id) else {
                continue;
            };

            let mut packet = Packet::new();
            match client.receive_packet(&mut packet) {
                Status::Done => {
                    if client.send_packet(&mut packet) != Status::Done {
                        warn!("client {id}: echo failed, dropping");
                        remove_client(&mut selector, &mut clients, id);
                    }
                }
                Status::NotReady => {}
                Status::Disconnected => {
                    info!("client {id} disconnected");
                    remove_client(&mut selector, &mut clients, id);
                }
                status => {
                    warn!("client {id}: receive failed ({status:?}), dropping");
                    remove_client(&mut selector, &mut clients, id);
                }
            }
        }
    }
}

fn remove_client(selector: &mut Selector, clients: &mut HashMap<u64, TcpSocket>, id: u64) {
    if let Some(client) = clients.remove(&id) {
        selector.remove(&client);
    }
}

/// Round-trip probe: send a framed message, wait for the echo, repeat.
fn send(address: &str, port: u16, message: &str, count: u32, timeout: Duration) -> Result<()> {
    let server = IpAddress::resolve(address)
        .with_context(|| format!("cannot resolve server address {address}"))?;

    let mut socket = TcpSocket::new();
    if socket.connect(server, port, timeout) != Status::Done {
        bail!("failed to connect to {address}:{port}");
    }
    info!("connected to {address}:{port}");

    for round in 1..=count {
        let mut outgoing = Packet::new();
        outgoing.write_u32(round).write_str(message);

        let started = Instant::now();
        if socket.send_packet(&mut outgoing) != Status::Done {
            bail!("round {round}: send failed");
        }

        let mut incoming = Packet::new();
        if socket.receive_packet(&mut incoming) != Status::Done {
            bail!("round {round}: no echo received");
        }
        let elapsed = started.elapsed();

        let sequence = incoming.read_u32();
        let text = incoming.read_string();
        if sequence != Some(round) || text.as_deref() != Some(message) {
            bail!("round {round}: echo did not match what was sent");
        }
        info!("round {round}: echoed {} bytes in {elapsed:?}", incoming.len());
    }

    socket.disconnect();
    Ok(())
}

/// Print what a host name resolves to.
fn resolve(host: &str) -> Result<()> {
    match IpAddress::resolve(host) {
        Some(address) => {
            info!("{host} resolves to {address}");
            Ok(())
        }
        None => bail!("could not resolve {host}"),
    }
}

/// Print the machine's addresses as seen from the LAN and the internet.
fn addresses(timeout: Duration) -> Result<()> {
    match IpAddress::local_address() {
        Some(address) => info!("local address: {address}"),
        None => warn!("local address could not be determined"),
    }
    match wharf_session::public_address(timeout) {
        Some(address) => info!("public address: {address}"),
        None => warn!("public address could not be determined (no internet access?)"),
    }
    Ok(())
}
