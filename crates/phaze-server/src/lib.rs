//! PhazeTunnel server.
//!
//! Terminates authenticated, encrypted UDP tunnels from many clients, leases
//! each one an address on a private network and forwards traffic between
//! the tunnels and a kernel TUN interface.
//!
//! The protocol lives in [`tunnel::TunnelCore`], which is synchronous and
//! free of I/O; [`server::TunnelServer`] wraps it in a tokio event loop.

#![forbid(unsafe_code)]

pub mod admin;
pub mod client;
pub mod config;
pub mod device;
pub mod identity;
pub mod limiter;
pub mod obfuscation;
pub mod pool;
pub mod server;
pub mod session;
pub mod tunnel;

pub use admin::{AdminHandle, SessionStats};
pub use client::{ClientError, ClientEvent, ClientSession, ClientState};
pub use config::{ConfigError, ServerConfig};
pub use device::{DeviceBridge, MemoryDevice, TunDevice, TunSettings, VirtualDevice};
pub use identity::{CredentialRecord, IdentityStore, StaticIdentityStore};
pub use server::TunnelServer;
pub use session::{SessionState, SessionTable, SessionView};
pub use tunnel::{Action, TunnelCore};
