//! PhazeTunnel server binary.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use phaze_crypto::ReplayWindow;
use phaze_server::config::{
    DEFAULT_HANDSHAKE_RATE, DEFAULT_INACTIVITY_TIMEOUT_SECS, DEFAULT_KEEPALIVE_INTERVAL_SECS,
    DEFAULT_LISTEN, DEFAULT_MAX_SESSIONS, DEFAULT_REKEY_BYTES, DEFAULT_REKEY_GRACE_SECS,
    DEFAULT_REKEY_INTERVAL_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TUNNEL_NETWORK,
    DEFAULT_TUN_NAME,
};
use phaze_server::pool::IpPool;
use phaze_server::{
    admin, DeviceBridge, ServerConfig, StaticIdentityStore, TunDevice, TunSettings, TunnelServer,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "phaze-server")]
#[command(about = "PhazeTunnel server - authenticated point-to-multipoint UDP VPN")]
struct Args {
    /// UDP listen address
    #[arg(long, env = "PHAZE_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Private network leased to clients; the first host address is the server's
    #[arg(long, env = "PHAZE_TUNNEL_NETWORK", default_value = DEFAULT_TUNNEL_NETWORK)]
    tunnel_network: Ipv4Net,

    /// JSON file with client credentials
    #[arg(long, env = "PHAZE_USERS_FILE")]
    users_file: PathBuf,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Seconds without traffic before a session is evicted
    #[arg(long, default_value_t = DEFAULT_INACTIVITY_TIMEOUT_SECS)]
    inactivity_timeout: u64,

    /// Seconds between keepalive probes to quiet sessions
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_INTERVAL_SECS)]
    keepalive_interval: u64,

    /// Seconds between maintenance sweeps
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval: u64,

    /// Bytes carried under one key before rekeying
    #[arg(long, default_value_t = DEFAULT_REKEY_BYTES)]
    rekey_bytes: u64,

    /// Seconds a key is used before rekeying
    #[arg(long, default_value_t = DEFAULT_REKEY_INTERVAL_SECS)]
    rekey_interval: u64,

    /// Seconds the previous key stays valid after a rekey
    #[arg(long, default_value_t = DEFAULT_REKEY_GRACE_SECS)]
    rekey_grace: u64,

    /// Replay window size in packets
    #[arg(long, default_value_t = ReplayWindow::DEFAULT_WINDOW_SIZE)]
    replay_window: usize,

    /// Pad data packets to disguise their length
    #[arg(long, default_value_t = false)]
    obfuscation: bool,

    /// Handshake attempts allowed per source IP per minute
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_RATE)]
    handshake_rate: u32,

    /// TUN interface name
    #[arg(long, default_value = DEFAULT_TUN_NAME)]
    tun_name: String,

    /// Do not open a TUN device; only relay between clients
    #[arg(long, default_value_t = false)]
    no_device: bool,

    /// Admin HTTP listen address (disabled when unset)
    #[arg(long)]
    admin_listen: Option<SocketAddr>,

    /// Admin API token, at least 32 characters
    #[arg(long, env = "PHAZE_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            tunnel_network: self.tunnel_network,
            max_sessions: self.max_sessions,
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            rekey_bytes: self.rekey_bytes,
            rekey_interval: Duration::from_secs(self.rekey_interval),
            rekey_grace: Duration::from_secs(self.rekey_grace),
            replay_window: self.replay_window,
            obfuscation: self.obfuscation,
            handshake_rate_per_minute: self.handshake_rate,
            tun_name: self.tun_name.clone(),
            device_enabled: !self.no_device,
            admin_listen: self.admin_listen,
        }
    }
}

fn open_device(config: &ServerConfig) -> Option<DeviceBridge> {
    if !config.device_enabled {
        return None;
    }

    let settings = TunSettings {
        name: config.tun_name.clone(),
        address: IpPool::new(config.tunnel_network).server_ip(),
        prefix_len: config.tunnel_network.prefix_len(),
        mtu: u16::try_from(config.tunnel_mtu()).ok()?,
    };
    let device = match TunDevice::open(&settings) {
        Ok(device) => device,
        Err(e) => {
            warn!("{}; continuing in relay-only mode", e);
            return None;
        }
    };

    match DeviceBridge::spawn(device, config.tunnel_mtu()) {
        Ok(bridge) => Some(bridge),
        Err(e) => {
            warn!("failed to start device threads: {}; continuing in relay-only mode", e);
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    phaze_common::init_tracing_with_default(&args.log_level);

    info!("Starting phaze-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = args.server_config();
    config.validate().context("invalid configuration")?;

    let identities = StaticIdentityStore::load(&args.users_file)
        .with_context(|| format!("failed to load users from {}", args.users_file.display()))?;
    if identities.is_empty() {
        warn!("users file contains no identities; every handshake will be rejected");
    } else {
        info!("loaded {} identities", identities.len());
    }

    let device = open_device(&config);
    let server = TunnelServer::bind(&config, Arc::new(identities), device).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = config.admin_listen {
        let handle = server.admin();
        let token = args.admin_token.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, handle, token, shutdown).await {
                error!("admin api stopped: {:#}", e);
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the server.
                error!("failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(shutdown_rx).await
}
