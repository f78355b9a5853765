//! Protocol state machine.
//!
//! `TunnelCore` turns inbound datagrams, device packets and timer ticks into
//! a list of [`Action`]s. It performs no I/O and never blocks, so the event
//! loop in `server.rs` owns all sockets and the tests can drive it directly.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use phaze_common::helpers::short_hex;
use phaze_core::{
    ip, DecodeError, ErrorCode, HandshakeComplete, HandshakeInit, HandshakeResponse, Packet,
    PacketHeader, PacketType, TunnelAssignment, KEEPALIVE_PROBE, KEEPALIVE_REPLY,
    MAX_PAYLOAD_SIZE, UNASSIGNED_SESSION_ID,
};
use phaze_crypto::{
    derive_session_key, derive_shared_secret, generate_ephemeral_keypair,
    verify_credential_proof, PublicKey, Role, Salt, SessionCipher, SessionError,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::config::ServerConfig;
use crate::identity::IdentityStore;
use crate::limiter::HandshakeLimiter;
use crate::obfuscation::{Obfuscator, PaddingObfuscator};
use crate::pool::IpPool;
use crate::session::{PendingRekey, Session, SessionState, SessionTable, TableError};

/// Minimum spacing of the reminders sent to a client that keeps sealing
/// under the key the server has rotated away from.
const REKEY_ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Something the event loop must do on behalf of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a datagram to a peer.
    Send { to: SocketAddr, bytes: Bytes },
    /// Write an IP packet to the tunnel device.
    WriteDevice(Vec<u8>),
}

/// Why a packet was dropped. Only ever logged.
#[derive(Debug, Error)]
enum DropReason {
    #[error("malformed: {0}")]
    Malformed(#[from] DecodeError),
    #[error("unknown session {0}")]
    UnknownSession(u32),
    #[error("session not established")]
    NotEstablished,
    #[error("unexpected {0:?} in state {1:?}")]
    Unexpected(PacketType, SessionState),
    #[error("source address does not match session")]
    WrongSource,
    #[error("obfuscation framing invalid")]
    Obfuscation,
    #[error("open failed: {0}")]
    Open(SessionError),
    #[error("seal failed: {0}")]
    Seal(SessionError),
    #[error("inner source {0} is not the session's tunnel address")]
    SpoofedSource(IpAddr),
    #[error("no route for {0}")]
    NoRoute(IpAddr),
    #[error("inner packet too large: {0} bytes")]
    Oversized(usize),
    #[error("rekey failed")]
    Rekey,
    #[error("encode failed")]
    Encode,
}

pub struct TunnelCore {
    config: ServerConfig,
    table: Arc<SessionTable>,
    identities: Arc<dyn IdentityStore>,
    obfuscator: Option<Box<dyn Obfuscator>>,
    limiter: HandshakeLimiter,
    device_available: bool,
    relay_only_logged: bool,
}

impl TunnelCore {
    pub fn new(config: &ServerConfig, identities: Arc<dyn IdentityStore>) -> Self {
        let table = SessionTable::new(IpPool::new(config.tunnel_network), config.max_sessions);
        Self::with_table(config, identities, Arc::new(table))
    }

    pub fn with_table(
        config: &ServerConfig,
        identities: Arc<dyn IdentityStore>,
        table: Arc<SessionTable>,
    ) -> Self {
        let obfuscator: Option<Box<dyn Obfuscator>> = config.obfuscation.then(|| {
            Box::new(PaddingObfuscator::new(
                PaddingObfuscator::DEFAULT_MAX_PADDING,
                MAX_PAYLOAD_SIZE,
            )) as Box<dyn Obfuscator>
        });

        Self {
            config: config.clone(),
            table,
            identities,
            obfuscator,
            limiter: HandshakeLimiter::new(config.handshake_rate_per_minute),
            device_available: config.device_enabled,
            relay_only_logged: false,
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn set_device_available(&mut self, available: bool) {
        self.device_available = available;
        if available {
            self.relay_only_logged = false;
        }
    }

    /// Largest IP packet the tunnel carries.
    pub fn max_inner_packet(&self) -> usize {
        let overhead = self.obfuscator.as_ref().map_or(0, |o| o.overhead());
        self.config.max_inner_packet(overhead)
    }

    /// Process one datagram from the network.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Vec<Action> {
        if !PacketHeader::quick_check(datagram) {
            trace!("datagram from {} failed header check", src);
            return Vec::new();
        }

        let result = Packet::decode(datagram)
            .map_err(DropReason::from)
            .and_then(|packet| match packet.packet_type {
                PacketType::HandshakeInit => Ok(self.handle_init(&packet, src, now)),
                PacketType::HandshakeComplete => self.handle_complete(&packet, src, now),
                PacketType::Data => self.handle_data(&packet, src, now),
                PacketType::Keepalive => self.handle_keepalive(&packet, src, now),
                PacketType::Disconnect => self.handle_disconnect(&packet, src, now),
                PacketType::HandshakeResponse | PacketType::Error => {
                    trace!("ignoring {:?} from {}", packet.packet_type, src);
                    Ok(Vec::new())
                }
            });

        result.unwrap_or_else(|reason| {
            debug!("packet from {} dropped: {}", src, reason);
            Vec::new()
        })
    }

    /// Process one IP packet read from the tunnel device.
    pub fn handle_device_packet(&mut self, packet: &[u8], now: Instant) -> Vec<Action> {
        let result = match ip::destination(packet) {
            Some(IpAddr::V4(dst)) => match self.table.route(dst) {
                Some(id) => {
                    let mut actions: Vec<Action> = self.maybe_rekey(id, now).into_iter().collect();
                    self.seal_data(id, packet).map(|action| {
                        actions.push(action);
                        actions
                    })
                }
                None => Err(DropReason::NoRoute(IpAddr::V4(dst))),
            },
            Some(other) => Err(DropReason::NoRoute(other)),
            None => Err(DropReason::Malformed(DecodeError::Malformed("not an ip packet"))),
        };

        result.unwrap_or_else(|reason| {
            trace!("device packet dropped: {}", reason);
            Vec::new()
        })
    }

    /// Periodic maintenance: evict stale sessions, retire old keys, repeat
    /// unanswered rekey offers and start due ones.
    pub fn sweep(&mut self, now: Instant) -> Vec<Action> {
        let report = self
            .table
            .sweep(now, self.config.inactivity_timeout, self.config.rekey_grace);
        for view in &report.evicted {
            info!("session {} evicted after {}s idle", view.id, view.idle_secs);
        }
        self.limiter.prune(now);

        let mut actions: Vec<Action> = report
            .stalled_rekeys
            .iter()
            .filter_map(|&id| {
                debug!("session {} rekey offer unanswered, sending again", id);
                self.table.update(id, resend_offer).flatten()
            })
            .collect();
        actions.extend(
            self.table
                .established_ids()
                .into_iter()
                .filter_map(|id| self.maybe_rekey(id, now)),
        );
        actions
    }

    /// Probe sessions that have been quiet for a keepalive interval.
    pub fn keepalive_tick(&mut self, now: Instant) -> Vec<Action> {
        self.table
            .idle_established(now, self.config.keepalive_interval)
            .into_iter()
            .filter_map(|id| {
                self.table
                    .update(id, |s| sealed_to_peer(s, PacketType::Keepalive, &[KEEPALIVE_PROBE]))
                    .and_then(Result::ok)
            })
            .collect()
    }

    /// Tell every client we are going away and wipe all sessions.
    pub fn shutdown(&mut self, _now: Instant) -> Vec<Action> {
        let mut sessions = self.table.drain();
        let actions: Vec<Action> = sessions
            .iter_mut()
            .filter(|s| s.tunnel_ip.is_some())
            .filter_map(|s| sealed_to_peer(s, PacketType::Disconnect, &[]).ok())
            .collect();
        info!("closed {} sessions", sessions.len());
        actions
    }

    fn reject(&self, to: SocketAddr, session_id: u32, code: ErrorCode) -> Vec<Action> {
        Packet::new(PacketType::Error, session_id, 0, code.encode().to_vec())
            .encode()
            .map(|bytes| vec![Action::Send { to, bytes }])
            .unwrap_or_default()
    }

    fn handle_init(&mut self, packet: &Packet, src: SocketAddr, now: Instant) -> Vec<Action> {
        if !self.limiter.check(src.ip(), now) {
            debug!("handshake from {} rate limited", src);
            return self.reject(src, UNASSIGNED_SESSION_ID, ErrorCode::RateLimited);
        }
        if self.table.is_full() {
            debug!("handshake from {} refused: table full", src);
            return self.reject(src, UNASSIGNED_SESSION_ID, ErrorCode::Capacity);
        }

        let Ok(init) = HandshakeInit::decode(&packet.payload) else {
            return self.reject(src, UNASSIGNED_SESSION_ID, ErrorCode::Malformed);
        };
        let HandshakeInit {
            public_key,
            identity,
            credential_proof,
        } = init;
        let identity = Zeroizing::new(identity);

        if !self.authenticate(&identity, &public_key, &credential_proof) {
            info!("handshake from {} rejected: bad credentials", src);
            return self.reject(src, UNASSIGNED_SESSION_ID, ErrorCode::Unauthorized);
        }

        let (server_private, server_public) = generate_ephemeral_keypair();
        let Ok(shared) = derive_shared_secret(server_private, &PublicKey::from(public_key)) else {
            debug!("handshake from {} used a weak public key", src);
            return self.reject(src, UNASSIGNED_SESSION_ID, ErrorCode::Malformed);
        };
        let Ok((key, salt)) = derive_session_key(&shared, None, 0) else {
            return Vec::new();
        };

        let cipher = SessionCipher::new(key, Role::Server, self.config.replay_window, now);
        let id = match self.table.create(src, &identity, public_key, cipher, now) {
            Ok(id) => id,
            Err(e) => {
                debug!("handshake from {} refused: {}", src, e);
                let code = match e {
                    TableError::Capacity => ErrorCode::Capacity,
                    TableError::PoolExhausted => ErrorCode::PoolExhausted,
                    TableError::IdCollision | TableError::NotFound => return Vec::new(),
                };
                return self.reject(src, UNASSIGNED_SESSION_ID, code);
            }
        };

        let response = HandshakeResponse {
            public_key: server_public.to_bytes(),
            salt: salt.0,
        };
        debug!(
            "session {} awaiting completion from {} (key {})",
            id,
            src,
            short_hex(&public_key)
        );
        match Packet::new(PacketType::HandshakeResponse, id, 0, response.encode()).encode() {
            Ok(bytes) => vec![Action::Send { to: src, bytes }],
            Err(_) => Vec::new(),
        }
    }

    fn authenticate(&self, identity: &str, public_key: &[u8; 32], proof: &[u8]) -> bool {
        let record = self.identities.lookup(identity);
        // Unknown identities still pay for one MAC so timing does not tell
        // them apart from a wrong proof.
        let secret: &[u8] = match &record {
            Some(r) => &r.secret[..],
            None => &[0u8; 32],
        };
        let proof_ok = verify_credential_proof(secret, public_key, identity, proof);
        record.is_some() && !proof.is_empty() && proof_ok
    }

    fn handle_complete(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Action>, DropReason> {
        enum Outcome {
            Confirmed,
            Rejected,
            Rekeyed(u32, Action),
            Repeated(Action),
        }

        let complete = HandshakeComplete::decode(&packet.payload)?;
        let id = packet.session_id;
        let grace = self.config.rekey_grace;

        let outcome = self
            .table
            .update(id, |s| {
                if s.addr != src {
                    return Err(DropReason::WrongSource);
                }
                match s.state {
                    SessionState::AwaitingCompletion => {
                        if complete.public_key != s.peer_public {
                            return Ok(Outcome::Rejected);
                        }
                        match s
                            .cipher
                            .verify_confirmation(packet.sequence, &complete.confirmation, now)
                        {
                            Ok(()) => Ok(Outcome::Confirmed),
                            Err(_) => Ok(Outcome::Rejected),
                        }
                    }
                    SessionState::Connected | SessionState::Rekeying => {
                        // A late copy of an answer already installed: the
                        // client missed the acknowledgement.
                        if s
                            .cipher
                            .verify_confirmation(packet.sequence, &complete.confirmation, now)
                            .is_ok()
                        {
                            s.rekey_ack_at = Some(now);
                            return Ok(Outcome::Repeated(rekey_ack(s)?));
                        }
                        if s.state != SessionState::Rekeying {
                            return Err(DropReason::Unexpected(packet.packet_type, s.state));
                        }

                        // A failed answer ends the round; the next trigger starts another.
                        s.state = SessionState::Connected;
                        let pending = s.pending_rekey.take().ok_or(DropReason::Rekey)?;
                        complete_rekey(s, pending, &complete, packet.sequence, now, grace)?;
                        s.touch(now);
                        s.rekey_ack_at = Some(now);
                        Ok(Outcome::Rekeyed(s.cipher.epoch(), rekey_ack(s)?))
                    }
                    state => Err(DropReason::Unexpected(packet.packet_type, state)),
                }
            })
            .ok_or(DropReason::UnknownSession(id))??;

        match outcome {
            Outcome::Rekeyed(epoch, ack) => {
                debug!("session {} rekeyed to epoch {}", id, epoch);
                Ok(vec![ack])
            }
            Outcome::Repeated(ack) => {
                debug!("session {} repeated its rekey answer", id);
                Ok(vec![ack])
            }
            Outcome::Rejected => {
                info!("session {} failed key confirmation", id);
                self.table.evict(id, now);
                Ok(self.reject(src, id, ErrorCode::Unauthorized))
            }
            Outcome::Confirmed => match self.table.complete(id, now) {
                Ok(tunnel_ip) => {
                    let assignment = TunnelAssignment {
                        tunnel_ip,
                        prefix_len: self.table.prefix_len(),
                        server_ip: self.table.server_ip(),
                    };
                    let bytes = self
                        .table
                        .update(id, |s| {
                            sealed_control(s, PacketType::HandshakeComplete, &assignment.encode())
                        })
                        .ok_or(DropReason::UnknownSession(id))??;
                    info!("session {} connected from {} as {}", id, src, tunnel_ip);
                    Ok(vec![Action::Send { to: src, bytes }])
                }
                Err(TableError::PoolExhausted) => {
                    warn!("session {} refused: tunnel address pool exhausted", id);
                    self.table.evict(id, now);
                    Ok(self.reject(src, id, ErrorCode::PoolExhausted))
                }
                Err(_) => Err(DropReason::UnknownSession(id)),
            },
        }
    }

    fn handle_data(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Action>, DropReason> {
        let id = packet.session_id;
        let obfuscator = self.obfuscator.as_deref();

        let (plaintext, tunnel_ip, ack) = self
            .table
            .update(id, |s| {
                if !s.is_established() {
                    return Err(DropReason::NotEstablished);
                }
                let ciphertext: Cow<'_, [u8]> = match obfuscator {
                    Some(o) => Cow::Owned(
                        o.deobfuscate(&packet.payload)
                            .ok_or(DropReason::Obfuscation)?,
                    ),
                    None => Cow::Borrowed(&packet.payload[..]),
                };
                let plaintext = s
                    .cipher
                    .decrypt(packet.sequence, &ciphertext, now)
                    .map_err(DropReason::Open)?;

                accept_from(s, src, now);
                s.rx_bytes += plaintext.len() as u64;
                let ack = remind_of_switch(s, now);
                Ok((plaintext, s.tunnel_ip, ack))
            })
            .ok_or(DropReason::UnknownSession(id))??;

        if let Some(own) = tunnel_ip {
            match ip::source(&plaintext) {
                Some(IpAddr::V4(inner)) if inner == own => {}
                Some(other) => return Err(DropReason::SpoofedSource(other)),
                None => {
                    return Err(DropReason::Malformed(DecodeError::Malformed(
                        "not an ip packet",
                    )))
                }
            }
        }

        let mut actions: Vec<Action> = ack.into_iter().collect();
        actions.extend(self.maybe_rekey(id, now));

        // Client-to-client traffic never touches the device.
        if let Some(IpAddr::V4(dst)) = ip::destination(&plaintext) {
            if let Some(peer) = self.table.route(dst).filter(|peer| *peer != id) {
                actions.extend(self.maybe_rekey(peer, now));
                actions.push(self.seal_data(peer, &plaintext)?);
                return Ok(actions);
            }
        }

        if self.device_available {
            actions.push(Action::WriteDevice(plaintext));
        } else if !self.relay_only_logged {
            warn!("no tunnel device; dropping traffic not addressed to another client");
            self.relay_only_logged = true;
        }
        Ok(actions)
    }

    fn handle_keepalive(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Action>, DropReason> {
        let id = packet.session_id;
        self.table
            .update(id, |s| {
                if !s.is_established() {
                    return Err(DropReason::NotEstablished);
                }
                let body = s
                    .cipher
                    .decrypt(packet.sequence, &packet.payload, now)
                    .map_err(DropReason::Open)?;
                accept_from(s, src, now);

                // A reply sealed under the current key doubles as the
                // acknowledgement of a finished rekey.
                if body == [KEEPALIVE_PROBE] {
                    Ok(vec![rekey_ack(s)?])
                } else {
                    Ok(remind_of_switch(s, now).into_iter().collect())
                }
            })
            .ok_or(DropReason::UnknownSession(id))?
    }

    fn handle_disconnect(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Action>, DropReason> {
        let id = packet.session_id;
        self.table
            .update(id, |s| {
                if s.addr != src {
                    return Err(DropReason::WrongSource);
                }
                s.cipher
                    .decrypt(packet.sequence, &packet.payload, now)
                    .map(|_| ())
                    .map_err(DropReason::Open)
            })
            .ok_or(DropReason::UnknownSession(id))??;

        self.table.evict(id, now);
        info!("session {} disconnected by client", id);
        Ok(Vec::new())
    }

    /// Seal an IP packet for session `id`.
    fn seal_data(&self, id: u32, plaintext: &[u8]) -> Result<Action, DropReason> {
        if plaintext.len() > self.max_inner_packet() {
            return Err(DropReason::Oversized(plaintext.len()));
        }
        let obfuscator = self.obfuscator.as_deref();

        self.table
            .update(id, |s| {
                if !s.is_established() {
                    return Err(DropReason::NotEstablished);
                }
                let (seq, ciphertext) = s.cipher.encrypt(plaintext).map_err(DropReason::Seal)?;
                let payload = match obfuscator {
                    Some(o) => o.obfuscate(&ciphertext),
                    None => ciphertext,
                };
                let bytes = Packet::new(PacketType::Data, id, seq, payload)
                    .encode()
                    .map_err(|_| DropReason::Encode)?;
                s.tx_bytes += plaintext.len() as u64;
                Ok(Action::Send { to: s.addr, bytes })
            })
            .ok_or(DropReason::UnknownSession(id))?
    }

    /// Start a rekey round if the session's key is due for replacement.
    fn maybe_rekey(&self, id: u32, now: Instant) -> Option<Action> {
        let config = &self.config;
        self.table
            .update(id, |s| {
                if s.state != SessionState::Connected
                    || !s
                        .cipher
                        .needs_rekey(now, config.rekey_bytes, config.rekey_interval)
                {
                    return None;
                }

                let (private, public) = generate_ephemeral_keypair();
                let salt = Salt::random();
                let offer = HandshakeResponse {
                    public_key: public.to_bytes(),
                    salt: salt.0,
                };
                let action =
                    sealed_to_peer(s, PacketType::HandshakeResponse, &offer.encode()).ok()?;

                s.pending_rekey = Some(PendingRekey {
                    private,
                    public: offer.public_key,
                    salt,
                    offered_at: now,
                });
                s.state = SessionState::Rekeying;
                debug!("session {} rekey offered at epoch {}", s.id, s.cipher.epoch());
                Some(action)
            })
            .flatten()
    }
}

/// Authenticated traffic may move the session to a new source address.
fn accept_from(session: &mut Session, src: SocketAddr, now: Instant) {
    if session.addr != src {
        debug!("session {} moved {} -> {}", session.id, session.addr, src);
        session.addr = src;
    }
    session.touch(now);
}

/// The rekey offer of the pending round, sealed again under the current key.
fn resend_offer(session: &mut Session) -> Option<Action> {
    let pending = session.pending_rekey.as_ref()?;
    let offer = HandshakeResponse {
        public_key: pending.public,
        salt: pending.salt.0,
    };
    sealed_to_peer(session, PacketType::HandshakeResponse, &offer.encode()).ok()
}

/// Keepalive reply sealed under the current key. A client holding the key
/// staged switches to it on opening this.
fn rekey_ack(session: &mut Session) -> Result<Action, DropReason> {
    sealed_to_peer(session, PacketType::Keepalive, &[KEEPALIVE_REPLY])
}

/// Acknowledge the rekey again if the client is still sealing under the
/// previous key, at most once per `REKEY_ACK_INTERVAL`.
fn remind_of_switch(session: &mut Session, now: Instant) -> Option<Action> {
    if !session.cipher.awaiting_peer_switch() {
        return None;
    }
    let recent = session
        .rekey_ack_at
        .is_some_and(|at| now.saturating_duration_since(at) < REKEY_ACK_INTERVAL);
    if recent {
        return None;
    }
    session.rekey_ack_at = Some(now);
    rekey_ack(session).ok()
}

fn sealed_control(
    session: &mut Session,
    packet_type: PacketType,
    body: &[u8],
) -> Result<Bytes, DropReason> {
    let (seq, ciphertext) = session.cipher.encrypt(body).map_err(DropReason::Seal)?;
    Packet::new(packet_type, session.id, seq, ciphertext)
        .encode()
        .map_err(|_| DropReason::Encode)
}

fn sealed_to_peer(
    session: &mut Session,
    packet_type: PacketType,
    body: &[u8],
) -> Result<Action, DropReason> {
    let bytes = sealed_control(session, packet_type, body)?;
    Ok(Action::Send {
        to: session.addr,
        bytes,
    })
}

fn complete_rekey(
    session: &mut Session,
    pending: PendingRekey,
    complete: &HandshakeComplete,
    sequence: u32,
    now: Instant,
    grace: Duration,
) -> Result<(), DropReason> {
    let epoch = session
        .cipher
        .epoch()
        .checked_add(1)
        .ok_or(DropReason::Rekey)?;
    let shared = derive_shared_secret(pending.private, &PublicKey::from(complete.public_key))
        .map_err(|_| DropReason::Rekey)?;
    let (key, _) =
        derive_session_key(&shared, Some(pending.salt), epoch).map_err(|_| DropReason::Rekey)?;
    session
        .cipher
        .install_verified(key, sequence, &complete.confirmation, now, grace)
        .map_err(|_| DropReason::Rekey)
}
