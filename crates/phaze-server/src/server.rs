//! UDP event loop.
//!
//! One task owns the socket and the protocol core and selects over network
//! input, device input, the maintenance timers and shutdown. All protocol
//! decisions are made by [`TunnelCore`]; this module only moves bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use phaze_core::MAX_PACKET_SIZE;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::admin::AdminHandle;
use crate::config::ServerConfig;
use crate::device::DeviceBridge;
use crate::identity::IdentityStore;
use crate::session::SessionTable;
use crate::tunnel::{Action, TunnelCore};

const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub struct TunnelServer {
    core: TunnelCore,
    socket: UdpSocket,
    device: Option<DeviceBridge>,
    config: ServerConfig,
}

impl TunnelServer {
    /// Bind the listening socket. Without a device bridge the server only
    /// relays between clients.
    pub async fn bind(
        config: &ServerConfig,
        identities: Arc<dyn IdentityStore>,
        device: Option<DeviceBridge>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let sock = SockRef::from(&socket);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set receive buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set send buffer: {}", e);
        }

        let mut core = TunnelCore::new(config, identities);
        core.set_device_available(device.is_some());
        if device.is_none() {
            warn!("no tunnel device; running in relay-only mode");
        }

        info!(
            "listening on {} (network {}, max {} sessions)",
            socket.local_addr()?,
            config.tunnel_network,
            config.max_sessions
        );

        Ok(Self {
            core,
            socket,
            device,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn table(&self) -> Arc<SessionTable> {
        self.core.table().clone()
    }

    pub fn admin(&self) -> AdminHandle {
        AdminHandle::new(self.table())
    }

    /// Serve until `shutdown` becomes true, then notify every client and
    /// drop all sessions.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        let mut inbound = self.device.as_mut().and_then(DeviceBridge::take_inbound);

        let sweep_every = self.config.sweep_interval;
        let mut sweep = time::interval_at(time::Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let keepalive_every = self.config.keepalive_interval;
        let mut keepalive =
            time::interval_at(time::Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let actions = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, src)) => self.core.handle_datagram(&buf[..len], src, Instant::now()),
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms.
                        debug!("recv failed: {}", e);
                        continue;
                    }
                },
                packet = recv_device(&mut inbound) => match packet {
                    Some(packet) => self.core.handle_device_packet(&packet, Instant::now()),
                    None => {
                        warn!("tunnel device closed; continuing in relay-only mode");
                        inbound = None;
                        self.device = None;
                        self.core.set_device_available(false);
                        continue;
                    }
                },
                _ = sweep.tick() => self.core.sweep(Instant::now()),
                _ = keepalive.tick() => self.core.keepalive_tick(Instant::now()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.dispatch(actions).await;
        }

        info!("shutting down");
        let farewells = self.core.shutdown(Instant::now());
        self.dispatch(farewells).await;
        if let Some(mut device) = self.device.take() {
            drop(inbound);
            device.close();
        }
        Ok(())
    }

    async fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, bytes } => {
                    if let Err(e) = self.socket.send_to(&bytes, to).await {
                        debug!("send to {} failed: {}", to, e);
                    }
                }
                Action::WriteDevice(packet) => {
                    if let Some(device) = &self.device {
                        if !device.write(packet) {
                            trace!("device queue full, packet dropped");
                        }
                    }
                }
            }
        }
    }
}

async fn recv_device(inbound: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
