//! Node configuration.
//!
//! Everything is settable as a CLI flag or an environment variable; the env
//! names are the operational contract (`P2P_SYNC_PORT`, `P2P_MY_ADDRESS`,
//! `P2P_PEERS`, `P2P_PREFERRED_MODULES`, plus the identity inputs).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use thiserror::Error;

use crate::message::Environment;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("P2P_SYNC_PORT must be nonzero")]
    ZeroPort,
    #[error("invalid peer address `{0}`: expected ip:port with an IPv4 or IPv6 host")]
    InvalidPeerAddress(String),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "orange-sync", about = "P2P synchronization node for the orange-bot cluster")]
pub struct SyncConfig {
    /// Port the sync listener binds on.
    #[arg(long, env = "P2P_SYNC_PORT")]
    pub sync_port: u16,

    /// Endpoint (host:port) this node advertises to peers.
    #[arg(long, env = "P2P_MY_ADDRESS")]
    pub my_address: Option<String>,

    /// Comma-separated peer endpoints to dial at startup.
    #[arg(long, env = "P2P_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Modules this node asks the controller for on connect.
    #[arg(long, env = "P2P_PREFERRED_MODULES", value_delimiter = ',')]
    pub preferred_modules: Vec<String>,

    /// Unique name of this instance in the cluster.
    #[arg(long, env = "INSTANCE_NAME")]
    pub instance_name: String,

    /// Deployment environment; nodes refuse to mesh across environments.
    #[arg(long, env = "ORANGE_ENV", default_value = "prod")]
    pub environment: Environment,

    /// Identity of the bot principal this cluster serves.
    #[arg(long, env = "BOT_USER_ID")]
    pub user_id: String,

    /// Directory holding ca.crt, orange-bot.crt/.key and the client pair.
    #[arg(long, env = "P2P_CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Peer address cache location.
    #[arg(long, default_value = ".cache/SyncHandler/p2p-cache.json")]
    pub cache_file: PathBuf,

    /// Local modules to register, comma-separated names. A `:unavailable`
    /// suffix registers the module without claiming capability.
    #[arg(long, env = "ORANGE_MODULES", value_delimiter = ',')]
    pub modules: Vec<String>,
}

impl SyncConfig {
    /// Validate the parts clap cannot: nonzero port, well-formed peer list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        for peer in &self.peers {
            validate_peer_addr(peer)?;
        }
        Ok(())
    }

    /// Build this node's protocol identity. Priority is wall-clock ms at
    /// startup, so independently started nodes get distinct election ranks.
    pub fn identity(&self) -> NodeIdentity {
        let priority = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        NodeIdentity {
            name: self.instance_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: self.environment,
            user_id: self.user_id.clone(),
            priority,
        }
    }
}

/// Peer endpoints must be literal `ip:port`, IPv4 or bracketed IPv6.
pub fn validate_peer_addr(addr: &str) -> Result<(), ConfigError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidPeerAddress(addr.to_string()))
}

/// What a node presents in its hello frame, plus its election rank.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub name: String,
    pub version: String,
    pub environment: Environment,
    pub user_id: String,
    pub priority: i64,
}

/// Protocol timing. Defaults are the production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct SyncTiming {
    /// Heartbeat broadcast period.
    pub heartbeat_interval: Duration,
    /// Status check period (death detection, election, reconciliation).
    pub check_interval: Duration,
    /// Slack past one heartbeat interval before a peer is suspect.
    pub dead_grace: Duration,
    /// Pause between outbound scan passes once the table is exhausted.
    pub peer_retry: Duration,
    /// How long to wait after a connectionless pass before going solo.
    pub give_up: Duration,
    /// TCP connect + TLS + hello budget per attempt.
    pub handshake_timeout: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        SyncTiming {
            heartbeat_interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            dead_grace: Duration::from_secs(2),
            peer_retry: Duration::from_secs(25),
            give_up: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncTiming {
    /// A peer is alive while its last message is within this window.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval + self.dead_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SyncConfig {
        SyncConfig::parse_from([
            "orange-sync",
            "--sync-port",
            "4000",
            "--instance-name",
            "node-a",
            "--user-id",
            "bot-123",
        ])
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let cfg = base();
        cfg.validate().unwrap();
        assert_eq!(cfg.sync_port, 4000);
        assert_eq!(cfg.environment, Environment::Prod);
        assert_eq!(cfg.cert_dir, PathBuf::from("certs"));
    }

    #[test]
    fn peer_list_splits_on_commas() {
        let cfg = SyncConfig::parse_from([
            "orange-sync",
            "--sync-port",
            "4000",
            "--instance-name",
            "node-a",
            "--user-id",
            "bot-123",
            "--peers",
            "10.0.0.2:4000,[::1]:4001",
        ]);
        cfg.validate().unwrap();
        assert_eq!(cfg.peers, vec!["10.0.0.2:4000", "[::1]:4001"]);
    }

    #[test]
    fn hostname_peers_are_rejected() {
        let cfg = SyncConfig::parse_from([
            "orange-sync",
            "--sync-port",
            "4000",
            "--instance-name",
            "node-a",
            "--user-id",
            "bot-123",
            "--peers",
            "peer.example.com:4000",
        ]);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidPeerAddress(_))
        ));
    }

    #[test]
    fn portless_peers_are_rejected() {
        assert!(validate_peer_addr("10.0.0.2").is_err());
        assert!(validate_peer_addr("::1").is_err());
        assert!(validate_peer_addr("").is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cfg = base();
        cfg.sync_port = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroPort)));
    }

    #[test]
    fn environment_parses() {
        let cfg = SyncConfig::parse_from([
            "orange-sync",
            "--sync-port",
            "4000",
            "--instance-name",
            "node-a",
            "--user-id",
            "bot-123",
            "--environment",
            "dev",
        ]);
        assert_eq!(cfg.environment, Environment::Dev);
    }

    #[test]
    fn identity_priority_is_wall_clock_ms() {
        let cfg = base();
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let identity = cfg.identity();
        assert!(identity.priority >= before);
        assert_eq!(identity.name, "node-a");
        assert_eq!(identity.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn timing_defaults_match_protocol_constants() {
        let t = SyncTiming::default();
        assert_eq!(t.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(t.check_interval, Duration::from_secs(5));
        assert_eq!(t.liveness_window(), Duration::from_secs(12));
        assert_eq!(t.peer_retry, Duration::from_secs(25));
        assert_eq!(t.give_up, Duration::from_secs(5));
    }
}
