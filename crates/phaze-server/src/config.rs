//! Server configuration.
//!
//! Built once at startup (see `main.rs`) and handed to the server by
//! reference.

use std::net::SocketAddr;
use std::time::Duration;

use ipnet::Ipv4Net;
use phaze_core::{HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
use phaze_crypto::{ReplayWindow, TAG_LEN};
use thiserror::Error;
use tracing::warn;

use crate::obfuscation::{Obfuscator, PaddingObfuscator};
use crate::pool::IpPool;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:51820";
pub const DEFAULT_TUNNEL_NETWORK: &str = "10.9.0.0/24";
pub const DEFAULT_MAX_SESSIONS: usize = 250;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_REKEY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_REKEY_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_REKEY_GRACE_SECS: u64 = 10;
pub const DEFAULT_HANDSHAKE_RATE: u32 = 5;
pub const DEFAULT_TUN_NAME: &str = "phaze0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("replay window must be between 1 and {max}, got {got}")]
    ReplayWindow { got: usize, max: usize },

    #[error("tunnel network {0} has no room for client addresses")]
    NetworkTooSmall(Ipv4Net),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub tunnel_network: Ipv4Net,
    pub max_sessions: usize,
    pub inactivity_timeout: Duration,
    pub keepalive_interval: Duration,
    pub sweep_interval: Duration,
    pub rekey_bytes: u64,
    pub rekey_interval: Duration,
    pub rekey_grace: Duration,
    pub replay_window: usize,
    pub obfuscation: bool,
    pub handshake_rate_per_minute: u32,
    pub tun_name: String,
    pub device_enabled: bool,
    pub admin_listen: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 51820)),
            tunnel_network: Ipv4Net::new([10, 9, 0, 0].into(), 24)
                .unwrap_or_else(|_| unreachable!("24 is a valid prefix")),
            max_sessions: DEFAULT_MAX_SESSIONS,
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            rekey_bytes: DEFAULT_REKEY_BYTES,
            rekey_interval: Duration::from_secs(DEFAULT_REKEY_INTERVAL_SECS),
            rekey_grace: Duration::from_secs(DEFAULT_REKEY_GRACE_SECS),
            replay_window: ReplayWindow::DEFAULT_WINDOW_SIZE,
            obfuscation: false,
            handshake_rate_per_minute: DEFAULT_HANDSHAKE_RATE,
            tun_name: DEFAULT_TUN_NAME.to_string(),
            device_enabled: true,
            admin_listen: None,
        }
    }
}

impl ServerConfig {
    /// Reject unusable settings. `max_sessions` larger than the address
    /// pool is lowered to the pool size.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let durations = [
            ("inactivity timeout", self.inactivity_timeout),
            ("keepalive interval", self.keepalive_interval),
            ("sweep interval", self.sweep_interval),
            ("rekey interval", self.rekey_interval),
            ("rekey grace", self.rekey_grace),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.rekey_bytes == 0 {
            return Err(ConfigError::Zero("rekey bytes"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Zero("max sessions"));
        }
        if self.handshake_rate_per_minute == 0 {
            return Err(ConfigError::Zero("handshake rate"));
        }
        if self.replay_window == 0 || self.replay_window > ReplayWindow::MAX_WINDOW_SIZE {
            return Err(ConfigError::ReplayWindow {
                got: self.replay_window,
                max: ReplayWindow::MAX_WINDOW_SIZE,
            });
        }

        let capacity = IpPool::client_capacity(&self.tunnel_network);
        if capacity == 0 {
            return Err(ConfigError::NetworkTooSmall(self.tunnel_network));
        }
        if self.max_sessions > capacity {
            warn!(
                "max sessions {} exceeds the {} addresses in {}; capping",
                self.max_sessions, capacity, self.tunnel_network
            );
            self.max_sessions = capacity;
        }

        Ok(())
    }

    /// Largest IP packet that fits in one datagram after framing, the AEAD
    /// tag and obfuscation headroom.
    pub fn max_inner_packet(&self, obfuscation_overhead: usize) -> usize {
        MAX_PACKET_SIZE - HEADER_SIZE - TAG_LEN - obfuscation_overhead
    }

    /// MTU to configure on the tunnel device.
    pub fn tunnel_mtu(&self) -> usize {
        let overhead = if self.obfuscation {
            PaddingObfuscator::new(PaddingObfuscator::DEFAULT_MAX_PADDING, MAX_PAYLOAD_SIZE)
                .overhead()
        } else {
            0
        };
        self.max_inner_packet(overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = ServerConfig::default();
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!(config.tunnel_network, DEFAULT_TUNNEL_NETWORK.parse().unwrap());
        config.validate().unwrap();
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = ServerConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("sweep interval")));
    }

    #[test]
    fn test_replay_window_bounds() {
        let mut config = ServerConfig {
            replay_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.replay_window = ReplayWindow::MAX_WINDOW_SIZE + 1;
        assert!(config.validate().is_err());

        config.replay_window = ReplayWindow::MAX_WINDOW_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiny_network_rejected() {
        let mut config = ServerConfig {
            tunnel_network: "10.9.0.0/31".parse().unwrap(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NetworkTooSmall(_))
        ));
    }

    #[test]
    fn test_max_sessions_capped_to_pool() {
        let mut config = ServerConfig {
            tunnel_network: "10.9.0.0/29".parse().unwrap(),
            ..Default::default()
        };
        config.validate().unwrap();
        // 8 addresses minus network, broadcast and the server.
        assert_eq!(config.max_sessions, 5);
    }

    #[test]
    fn test_max_inner_packet() {
        let config = ServerConfig::default();
        assert_eq!(config.max_inner_packet(0), 1500 - 12 - 16);
        assert_eq!(config.tunnel_mtu(), 1472);

        let obfuscated = ServerConfig {
            obfuscation: true,
            ..Default::default()
        };
        assert_eq!(obfuscated.tunnel_mtu(), 1472 - 65);
    }
}
