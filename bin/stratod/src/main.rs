//! Strato Daemon - runs one cloud node of the mesh.
//!
//! The production deployment embeds the cloud node behind the reliable
//! transport; this daemon drives the same node over a plain UDP framing
//! (sender guid followed by the wire message) for development and
//! interop testing. Peers are configured statically.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use strato_cloud::{CloudConfig, CloudNode};
use strato_core::{PeerAddress, PeerGuid, Timestamp, WireEncode};

/// Strato mesh daemon.
#[derive(Parser)]
#[command(name = "stratod")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.strato/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Parse the configuration and print the effective settings
    CheckConfig,
}

/// A statically configured federated peer.
#[derive(Debug, Clone)]
struct PeerEntry {
    guid: PeerGuid,
    address: SocketAddr,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// This node's guid; generated at startup when zero.
    local_guid: PeerGuid,
    /// Listen address
    listen_addr: SocketAddr,
    /// Statically configured federated peers
    peers: Vec<PeerEntry>,
    /// Cloud store settings
    cloud: CloudConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            local_guid: PeerGuid::UNASSIGNED,
            listen_addr: "0.0.0.0:4247".parse().unwrap(),
            peers: Vec::new(),
            cloud: CloudConfig::default(),
        }
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.clone()
}

/// Parses a `guid@host:port` peer reference.
fn parse_peer(s: &str) -> Result<PeerEntry> {
    let (guid, addr) = s
        .split_once('@')
        .context("peer must be <hex-guid>@<host:port>")?;
    let guid = u64::from_str_radix(guid, 16).context("invalid peer guid")?;
    let address = addr.parse().context("invalid peer address")?;
    Ok(PeerEntry {
        guid: PeerGuid::new(guid),
        address,
    })
}

/// Load configuration from TOML file.
fn load_config(path: &PathBuf) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DaemonConfig::default();

    if let Some(node) = toml.get("node") {
        if let Some(guid) = node.get("guid").and_then(|v| v.as_str()) {
            config.local_guid =
                PeerGuid::new(u64::from_str_radix(guid, 16).context("Invalid node guid")?);
        }
    }

    if let Some(network) = toml.get("network") {
        if let Some(listen) = network.get("listen").and_then(|v| v.as_str()) {
            config.listen_addr = listen.parse().context("Invalid listen address")?;
        }
        if let Some(peers) = network.get("peers").and_then(|v| v.as_array()) {
            for peer in peers.iter().filter_map(|v| v.as_str()) {
                config.peers.push(parse_peer(peer)?);
            }
        }
    }

    if let Some(cloud) = toml.get("cloud") {
        if let Some(quota) = cloud.get("max_upload_bytes_per_client").and_then(|v| v.as_integer()) {
            config.cloud.max_upload_bytes_per_client = quota as u64;
        }
        if let Some(cap) = cloud.get("max_bytes_per_download").and_then(|v| v.as_integer()) {
            config.cloud.max_bytes_per_download = cap as u64;
        }
        if let Some(addr) = cloud.get("force_external_address").and_then(|v| v.as_str()) {
            let addr: SocketAddr = addr.parse().context("Invalid external address")?;
            config.cloud.force_external_address = Some(PeerAddress::new(addr));
        }
        if let Some(ms) = cloud.get("get_request_timeout_ms").and_then(|v| v.as_integer()) {
            config.cloud.get_request_timeout_ms = ms as u64;
        }
        if let Some(ms) = cloud.get("get_sweep_interval_ms").and_then(|v| v.as_integer()) {
            config.cloud.get_sweep_interval_ms = ms as u64;
        }
    }

    Ok(config)
}

/// UDP framing: eight guid bytes, then the wire message.
const FRAME_GUID_BYTES: usize = 8;

/// The daemon: one cloud node behind a development UDP socket.
struct Daemon {
    node: CloudNode,
    socket: UdpSocket,
    /// Last known socket address per peer guid, for outbound routing.
    routes: HashMap<PeerGuid, SocketAddr>,
    local_guid: PeerGuid,
}

impl Daemon {
    fn new(config: &DaemonConfig) -> Result<Self> {
        let local_guid = if config.local_guid.is_unassigned() {
            PeerGuid::random()
        } else {
            config.local_guid
        };

        let socket = UdpSocket::bind(config.listen_addr)
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .context("Failed to set socket timeout")?;
        let local_addr = socket.local_addr().context("Failed to read bound address")?;

        let mut node = CloudNode::new(local_guid, PeerAddress::new(local_addr), config.cloud.clone());

        let mut routes = HashMap::new();
        for peer in &config.peers {
            routes.insert(peer.guid, peer.address);
            node.add_server(peer.guid, PeerAddress::new(peer.address));
            info!(peer = %peer.guid, address = %peer.address, "configured federated peer");
        }

        Ok(Self {
            node,
            socket,
            routes,
            local_guid,
        })
    }

    fn run(&mut self) -> Result<()> {
        info!(guid = %self.local_guid, listen = %self.socket.local_addr()?, "stratod running");

        let mut buf = vec![0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    if len < FRAME_GUID_BYTES {
                        debug!(%addr, len, "short datagram dropped");
                    } else {
                        let mut guid_bytes = [0u8; FRAME_GUID_BYTES];
                        guid_bytes.copy_from_slice(&buf[..FRAME_GUID_BYTES]);
                        let from = PeerGuid::new(u64::from_be_bytes(guid_bytes));
                        self.routes.insert(from, addr);

                        self.node.handle_packet(
                            from,
                            PeerAddress::new(addr),
                            &buf[FRAME_GUID_BYTES..len],
                            Timestamp::now(),
                        );
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => {
                    warn!(%err, "socket receive error");
                }
            }

            self.node.tick(Timestamp::now());
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        while let Some(envelope) = self.node.poll_outbound() {
            let Some(addr) = self.routes.get(&envelope.to).copied() else {
                debug!(to = %envelope.to, "no route for envelope, dropping");
                continue;
            };

            let mut frame = Vec::with_capacity(64);
            frame.extend_from_slice(&self.local_guid.value().to_be_bytes());
            frame.extend_from_slice(&envelope.message.to_vec());
            if let Err(err) = self.socket.send_to(&frame, addr) {
                warn!(to = %envelope.to, %addr, %err, "failed to send envelope");
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run { listen: None }) {
        Commands::Run { listen } => {
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }

            let mut daemon = Daemon::new(&config)?;
            daemon.run()
        }

        Commands::CheckConfig => {
            println!("Effective configuration");
            println!("=======================");
            println!("Listen: {}", config.listen_addr);
            println!(
                "Node guid: {}",
                if config.local_guid.is_unassigned() {
                    "(generated at startup)".to_string()
                } else {
                    config.local_guid.to_string()
                }
            );
            println!("Peers: {}", config.peers.len());
            for peer in &config.peers {
                println!("  {} @ {}", peer.guid, peer.address);
            }
            println!("Upload quota: {} bytes (0 = unlimited)", config.cloud.max_upload_bytes_per_client);
            println!("Download cap: {} bytes (0 = unlimited)", config.cloud.max_bytes_per_download);
            println!("Get timeout: {} ms", config.cloud.get_request_timeout_ms);
            println!("Sweep interval: {} ms", config.cloud.get_sweep_interval_ms);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("00ff@127.0.0.1:4247").unwrap();
        assert_eq!(peer.guid, PeerGuid::new(0xFF));
        assert_eq!(peer.address.port(), 4247);

        assert!(parse_peer("no-separator").is_err());
        assert!(parse_peer("zz@127.0.0.1:4247").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), 4247);
        assert!(config.peers.is_empty());
        assert!(config.local_guid.is_unassigned());
    }

    #[test]
    fn test_expand_tilde() {
        let path = PathBuf::from("~/.strato/config.toml");
        let expanded = expand_tilde(&path);
        if std::env::var("HOME").is_ok() {
            assert!(expanded.ends_with(".strato/config.toml"));
            assert!(!expanded.to_string_lossy().starts_with('~'));
        }
    }
}
