//! Discovery service: mutual awareness of peers on the broadcast domain.
//!
//! Three loops share one `Discovery`:
//!   - `announce_loop` sends this node's beacon every interval
//!   - `listen_loop` feeds received beacons into the peer registry
//!   - `sweep_loop` ages the registry and evicts silent peers
//!
//! Sockets are bound up front by `Discovery::bind` so that a port that is
//! already taken fails startup instead of a background task.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use meshpulse_core::config::MeshConfig;

use crate::peer::PeerRegistry;

pub mod broadcast;
pub mod listener;

/// Longest hostname prefix kept in a peer id.
const MAX_HOSTNAME_IN_ID: usize = 64;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Who this node says it is in every beacon.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// `<hostname>-<8 hex digits>`, fixed for the life of the process.
    pub peer_id: String,
    pub name: String,
    pub transfer_port: u16,
}

impl LocalIdentity {
    /// Fresh identity with a random instance suffix.
    pub fn generate(name: impl Into<String>, transfer_port: u16) -> Self {
        let host: String = local_hostname().chars().take(MAX_HOSTNAME_IN_ID).collect();
        Self {
            peer_id: format!("{host}-{:08x}", rand::random::<u32>()),
            name: name.into(),
            transfer_port,
        }
    }
}

/// The machine's hostname, or "mesh-pulse" if it cannot be read.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and outlives the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "mesh-pulse".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let host = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if host.is_empty() {
        "mesh-pulse".to_string()
    } else {
        host
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Socket addresses and timings for the discovery loops.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Local address the listen socket binds to.
    pub listen_addr: SocketAddr,
    /// Where beacons are sent.
    pub announce_to: SocketAddr,
    pub announce_interval: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub ttl: Duration,
}

impl DiscoverySettings {
    pub fn from_config(config: &MeshConfig) -> Self {
        let port = config.network.broadcast_port;
        Self {
            listen_addr: SocketAddr::new(config.network.bind_addr, port),
            announce_to: SocketAddr::new(config.network.broadcast_addr, port),
            announce_interval: config.discovery.announce_interval(),
            sweep_interval: config.discovery.sweep_interval(),
            stale_after: config.discovery.stale_after(),
            ttl: config.discovery.ttl(),
        }
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct Discovery {
    pub(crate) identity: LocalIdentity,
    pub(crate) settings: DiscoverySettings,
    pub(crate) registry: PeerRegistry,
    pub(crate) listen: UdpSocket,
    pub(crate) send: UdpSocket,
    pub(crate) seq: AtomicU64,
}

impl Discovery {
    /// Bind both sockets. Any failure here is fatal to startup.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        settings: DiscoverySettings,
        identity: LocalIdentity,
        registry: PeerRegistry,
    ) -> Result<Self> {
        let listen = make_listen_socket(settings.listen_addr).with_context(|| {
            format!("failed to bind discovery listener on {}", settings.listen_addr)
        })?;
        let send = make_broadcast_socket(settings.announce_to.ip())
            .context("failed to create discovery broadcast socket")?;

        tracing::info!(
            peer_id = %identity.peer_id,
            listen = %settings.listen_addr,
            announce_to = %settings.announce_to,
            "discovery bound"
        );

        Ok(Self {
            identity,
            settings,
            registry,
            listen: UdpSocket::from_std(listen).context("failed to convert to tokio UdpSocket")?,
            send: UdpSocket::from_std(send).context("failed to convert to tokio UdpSocket")?,
            seq: AtomicU64::new(0),
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Actual bound listen address (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listen.local_addr().context("listen socket has no local address")
    }
}

/// UDP socket bound to the discovery port, shareable with other processes.
fn make_listen_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;

    Ok(socket.into())
}

/// Unbound-port UDP socket allowed to send to the broadcast address.
fn make_broadcast_socket(dest: IpAddr) -> Result<std::net::UdpSocket> {
    let local: SocketAddr = match dest {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    if dest.is_ipv4() {
        socket.set_broadcast(true).context("SO_BROADCAST")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&local.into()).context("bind()")?;

    Ok(socket.into())
}
