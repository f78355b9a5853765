//! Session table.
//!
//! Owns every live session together with the tunnel address pool and the
//! tunnel-IP route map, all behind one lock. Callers get owned snapshots
//! (`SessionView`) or run a closure under the lock; nothing hands out
//! references to session internals.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use phaze_core::UNASSIGNED_SESSION_ID;
use phaze_crypto::{identity_tag, EphemeralPrivateKey, Salt, SessionCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::pool::IpPool;

/// Sessions that have not completed their handshake by then are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts at finding an unused session id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Response sent, waiting for the client's key confirmation
    AwaitingCompletion,
    /// Tunnel up
    Connected,
    /// Tunnel up, server-initiated rekey round outstanding
    Rekeying,
    /// Removed from the table
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("session table is full")]
    Capacity,

    #[error("tunnel address pool exhausted")]
    PoolExhausted,

    #[error("session not found")]
    NotFound,

    #[error("could not find an unused session id")]
    IdCollision,
}

/// Source of candidate session ids.
pub trait SessionIdSource: Send {
    fn next_id(&mut self) -> u32;
}

/// Cryptographically random session ids.
#[derive(Debug, Default)]
pub struct RandomSessionIds;

impl SessionIdSource for RandomSessionIds {
    fn next_id(&mut self) -> u32 {
        OsRng.next_u32()
    }
}

/// Server half of an outstanding rekey round.
#[derive(Debug)]
pub struct PendingRekey {
    pub private: EphemeralPrivateKey,
    /// Public half, repeated when the offer is sent again.
    pub public: [u8; 32],
    pub salt: Salt,
    /// When the offer was last sent.
    pub offered_at: Instant,
}

#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub addr: SocketAddr,
    pub tunnel_ip: Option<Ipv4Addr>,
    pub state: SessionState,
    pub cipher: SessionCipher,
    /// Ephemeral public key the client opened the handshake with.
    pub peer_public: [u8; 32],
    pub identity_tag: [u8; 32],
    identity_claim: Option<Zeroizing<String>>,
    pub pending_rekey: Option<PendingRekey>,
    /// Last time the client was told the server switched keys.
    pub rekey_ack_at: Option<Instant>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl Session {
    /// Handshake authenticated, tunnel usable.
    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Rekeying)
    }

    /// The identity presented at handshake; cleared once the session is
    /// connected.
    pub fn identity_claim(&self) -> Option<&str> {
        self.identity_claim.as_deref().map(String::as_str)
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn view(&self, now: Instant) -> SessionView {
        SessionView {
            id: self.id,
            addr: self.addr,
            tunnel_ip: self.tunnel_ip,
            state: self.state,
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
            bytes_since_rekey: self.cipher.bytes_since_install(),
            key_epoch: self.cipher.epoch(),
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            identity_tag: self.identity_tag,
        }
    }
}

/// Owned snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: u32,
    pub addr: SocketAddr,
    pub tunnel_ip: Option<Ipv4Addr>,
    pub state: SessionState,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub bytes_since_rekey: u64,
    pub key_epoch: u32,
    pub idle_secs: u64,
    #[serde(skip)]
    pub identity_tag: [u8; 32],
}

/// What one sweep removed or reset.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub evicted: Vec<SessionView>,
    pub expired_keys: usize,
    /// Sessions whose rekey offer went unanswered and is due again.
    pub stalled_rekeys: Vec<u32>,
}

struct TableInner {
    sessions: HashMap<u32, Session>,
    pool: IpPool,
    routes: HashMap<Ipv4Addr, u32>,
    ids: Box<dyn SessionIdSource>,
}

impl TableInner {
    fn remove(&mut self, id: u32) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if let Some(ip) = session.tunnel_ip {
            self.routes.remove(&ip);
            self.pool.release(ip);
        }
        session.state = SessionState::Disconnected;
        Some(session)
    }
}

pub struct SessionTable {
    inner: Mutex<TableInner>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(pool: IpPool, max_sessions: usize) -> Self {
        Self::with_id_source(pool, max_sessions, Box::new(RandomSessionIds))
    }

    pub fn with_id_source(
        pool: IpPool,
        max_sessions: usize,
        ids: Box<dyn SessionIdSource>,
    ) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sessions: HashMap::new(),
                pool,
                routes: HashMap::new(),
                ids,
            }),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_sessions
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.inner.lock().pool.server_ip()
    }

    pub fn prefix_len(&self) -> u8 {
        self.inner.lock().pool.prefix_len()
    }

    /// Insert a session in `AwaitingCompletion` under a fresh random id.
    pub fn create(
        &self,
        addr: SocketAddr,
        identity: &str,
        peer_public: [u8; 32],
        cipher: SessionCipher,
        now: Instant,
    ) -> Result<u32, TableError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.sessions.len() >= self.max_sessions {
            return Err(TableError::Capacity);
        }

        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| inner.ids.next_id())
            .find(|id| *id != UNASSIGNED_SESSION_ID && !inner.sessions.contains_key(id))
            .ok_or(TableError::IdCollision)?;

        inner.sessions.insert(
            id,
            Session {
                id,
                addr,
                tunnel_ip: None,
                state: SessionState::AwaitingCompletion,
                cipher,
                peer_public,
                identity_tag: identity_tag(identity),
                identity_claim: Some(Zeroizing::new(identity.to_string())),
                pending_rekey: None,
                rekey_ack_at: None,
                created_at: now,
                last_activity: now,
                rx_bytes: 0,
                tx_bytes: 0,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u32, now: Instant) -> Option<SessionView> {
        self.inner.lock().sessions.get(&id).map(|s| s.view(now))
    }

    /// Run `f` on a session under the table lock.
    pub fn update<R>(&self, id: u32, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.inner.lock().sessions.get_mut(&id).map(f)
    }

    /// Remove a session, release its address and route, and drop its keys.
    pub fn evict(&self, id: u32, now: Instant) -> Option<SessionView> {
        let session = self.inner.lock().remove(id)?;
        Some(session.view(now))
    }

    /// Lease a tunnel address and mark the session `Connected`.
    ///
    /// On pool exhaustion the session is left untouched and the caller is
    /// expected to evict it.
    pub fn complete(&self, id: u32, now: Instant) -> Result<Ipv4Addr, TableError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner.sessions.get_mut(&id).ok_or(TableError::NotFound)?;

        if let Some(ip) = session.tunnel_ip {
            return Ok(ip);
        }

        let ip = inner.pool.allocate().ok_or(TableError::PoolExhausted)?;
        inner.routes.insert(ip, id);
        session.tunnel_ip = Some(ip);
        session.state = SessionState::Connected;
        session.identity_claim = None;
        session.touch(now);
        Ok(ip)
    }

    /// Session owning tunnel address `ip`.
    pub fn route(&self, ip: Ipv4Addr) -> Option<u32> {
        self.inner.lock().routes.get(&ip).copied()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SessionView> {
        let inner = self.inner.lock();
        let mut views: Vec<_> = inner.sessions.values().map(|s| s.view(now)).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    pub fn ids_for_identity(&self, tag: &[u8; 32]) -> Vec<u32> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| &s.identity_tag == tag)
            .map(|s| s.id)
            .collect()
    }

    pub fn established_ids(&self) -> Vec<u32> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_established())
            .map(|s| s.id)
            .collect()
    }

    /// Established sessions that have been quiet for at least `idle`.
    pub fn idle_established(&self, now: Instant, idle: Duration) -> Vec<u32> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_established())
            .filter(|s| now.saturating_duration_since(s.last_activity) >= idle)
            .map(|s| s.id)
            .collect()
    }

    /// Evict idle and stalled sessions, drop expired previous keys and
    /// collect rekey rounds that got no answer within `rekey_grace`. Those
    /// rounds stay pending so a late answer still completes them.
    pub fn sweep(
        &self,
        now: Instant,
        inactivity_timeout: Duration,
        rekey_grace: Duration,
    ) -> SweepReport {
        let mut inner = self.inner.lock();
        let mut report = SweepReport::default();

        let stale: Vec<u32> = inner
            .sessions
            .values()
            .filter(|s| {
                let idle = now.saturating_duration_since(s.last_activity);
                match s.state {
                    SessionState::AwaitingCompletion => {
                        now.saturating_duration_since(s.created_at) >= HANDSHAKE_TIMEOUT
                    }
                    _ => idle > inactivity_timeout,
                }
            })
            .map(|s| s.id)
            .collect();

        for id in stale {
            if let Some(session) = inner.remove(id) {
                report.evicted.push(session.view(now));
            }
        }

        for session in inner.sessions.values_mut() {
            let had_previous = session.cipher.has_previous_key();
            session.cipher.expire_previous(now);
            if had_previous && !session.cipher.has_previous_key() {
                report.expired_keys += 1;
            }

            if let Some(pending) = session
                .pending_rekey
                .as_mut()
                .filter(|p| now.saturating_duration_since(p.offered_at) >= rekey_grace)
            {
                pending.offered_at = now;
                report.stalled_rekeys.push(session.id);
            }
        }

        report
    }

    /// Remove every session, e.g. at shutdown. Key material is wiped when
    /// the returned sessions are dropped.
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.lock();
        let ids: Vec<u32> = inner.sessions.keys().copied().collect();
        ids.into_iter().filter_map(|id| inner.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaze_crypto::{derive_session_key, derive_shared_secret, generate_ephemeral_keypair, Role};

    fn cipher(now: Instant) -> SessionCipher {
        let (a, _) = generate_ephemeral_keypair();
        let (_, b_pub) = generate_ephemeral_keypair();
        let shared = derive_shared_secret(a, &b_pub).unwrap();
        let (key, _) = derive_session_key(&shared, None, 0).unwrap();
        SessionCipher::new(key, Role::Server, 64, now)
    }

    fn table(max: usize) -> SessionTable {
        SessionTable::new(IpPool::new("10.9.0.0/24".parse().unwrap()), max)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    struct FixedIds(Vec<u32>);

    impl SessionIdSource for FixedIds {
        fn next_id(&mut self) -> u32 {
            if self.0.len() > 1 {
                self.0.remove(0)
            } else {
                self.0[0]
            }
        }
    }

    #[test]
    fn test_create_and_complete() {
        let now = Instant::now();
        let table = table(10);

        let id = table.create(addr(1), "alice", [1; 32], cipher(now), now).unwrap();
        assert_ne!(id, 0);

        let view = table.get(id, now).unwrap();
        assert_eq!(view.state, SessionState::AwaitingCompletion);
        assert_eq!(view.tunnel_ip, None);
        assert_eq!(view.identity_tag, identity_tag("alice"));
        assert_eq!(
            table.update(id, |s| s.identity_claim().map(str::to_string)),
            Some(Some("alice".to_string()))
        );

        let ip = table.complete(id, now).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(table.route(ip), Some(id));
        assert_eq!(table.get(id, now).unwrap().state, SessionState::Connected);
        assert_eq!(table.update(id, |s| s.identity_claim().is_none()), Some(true));
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let table = table(2);

        table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        table.create(addr(2), "b", [2; 32], cipher(now), now).unwrap();
        assert_eq!(
            table.create(addr(3), "c", [3; 32], cipher(now), now),
            Err(TableError::Capacity)
        );
        assert_eq!(table.len(), 2);
        assert!(table.is_full());
    }

    #[test]
    fn test_colliding_ids_retry() {
        let now = Instant::now();
        let table = SessionTable::with_id_source(
            IpPool::new("10.9.0.0/24".parse().unwrap()),
            10,
            Box::new(FixedIds(vec![7, 0, 7, 7, 9])),
        );

        let first = table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        let second = table.create(addr(2), "b", [2; 32], cipher(now), now).unwrap();
        assert_eq!(first, 7);
        assert_eq!(second, 9);
        assert_eq!(table.get(7, now).unwrap().addr, addr(1));
        assert_eq!(table.get(9, now).unwrap().addr, addr(2));

        // Only 9 left to offer, and it is taken.
        assert_eq!(
            table.create(addr(3), "c", [3; 32], cipher(now), now),
            Err(TableError::IdCollision)
        );
    }

    #[test]
    fn test_evict_releases_address() {
        let now = Instant::now();
        let table = table(10);

        let id = table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        let ip = table.complete(id, now).unwrap();

        let view = table.evict(id, now).unwrap();
        assert_eq!(view.state, SessionState::Disconnected);
        assert!(table.get(id, now).is_none());
        assert_eq!(table.route(ip), None);
        assert!(table.evict(id, now).is_none());

        let other = table.create(addr(2), "b", [2; 32], cipher(now), now).unwrap();
        assert_eq!(table.complete(other, now).unwrap(), ip);
    }

    #[test]
    fn test_pool_exhaustion() {
        let now = Instant::now();
        let table = SessionTable::new(IpPool::new("10.9.0.0/30".parse().unwrap()), 4);

        let a = table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        let b = table.create(addr(2), "b", [2; 32], cipher(now), now).unwrap();
        table.complete(a, now).unwrap();
        assert_eq!(table.complete(b, now), Err(TableError::PoolExhausted));
        assert_eq!(
            table.get(b, now).unwrap().state,
            SessionState::AwaitingCompletion
        );
        assert_eq!(table.complete(999, now), Err(TableError::NotFound));
    }

    #[test]
    fn test_sweep() {
        let start = Instant::now();
        let table = table(10);
        let timeout = Duration::from_secs(120);
        let grace = Duration::from_secs(10);

        let idle = table.create(addr(1), "a", [1; 32], cipher(start), start).unwrap();
        table.complete(idle, start).unwrap();
        let active = table.create(addr(2), "b", [2; 32], cipher(start), start).unwrap();
        table.complete(active, start).unwrap();
        let pending = table.create(addr(3), "c", [3; 32], cipher(start), start).unwrap();

        let later = start + Duration::from_secs(121);
        table.update(active, |s| s.touch(later - Duration::from_secs(5)));

        let report = table.sweep(later, timeout, grace);
        let evicted: Vec<u32> = report.evicted.iter().map(|v| v.id).collect();
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&idle));
        assert!(evicted.contains(&pending));
        assert!(table.get(active, later).is_some());
    }

    #[test]
    fn test_sweep_reports_stalled_rekey() {
        let now = Instant::now();
        let table = table(10);
        let id = table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        table.complete(id, now).unwrap();

        table.update(id, |s| {
            let (private, public) = generate_ephemeral_keypair();
            s.pending_rekey = Some(PendingRekey {
                private,
                public: public.to_bytes(),
                salt: Salt::random(),
                offered_at: now,
            });
            s.state = SessionState::Rekeying;
        });

        let timeout = Duration::from_secs(120);
        let grace = Duration::from_secs(10);
        let early = table.sweep(now + Duration::from_secs(5), timeout, grace);
        assert!(early.stalled_rekeys.is_empty());

        let due = now + Duration::from_secs(10);
        let report = table.sweep(due, timeout, grace);
        assert_eq!(report.stalled_rekeys, vec![id]);
        assert_eq!(table.get(id, due).unwrap().state, SessionState::Rekeying);
        assert_eq!(
            table.update(id, |s| s.pending_rekey.as_ref().map(|p| p.offered_at)),
            Some(Some(due))
        );

        // Not due again until another grace period has passed.
        let report = table.sweep(due + Duration::from_secs(1), timeout, grace);
        assert!(report.stalled_rekeys.is_empty());
    }

    #[test]
    fn test_idle_established_and_identity_lookup() {
        let now = Instant::now();
        let table = table(10);
        let a = table.create(addr(1), "alice", [1; 32], cipher(now), now).unwrap();
        table.complete(a, now).unwrap();
        let b = table.create(addr(2), "alice", [2; 32], cipher(now), now).unwrap();

        let later = now + Duration::from_secs(30);
        assert_eq!(table.idle_established(later, Duration::from_secs(30)), vec![a]);
        assert_eq!(table.established_ids(), vec![a]);

        let mut ids = table.ids_for_identity(&identity_tag("alice"));
        ids.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(ids, expected);
        assert!(table.ids_for_identity(&identity_tag("bob")).is_empty());
    }

    #[test]
    fn test_drain() {
        let now = Instant::now();
        let table = table(10);
        let a = table.create(addr(1), "a", [1; 32], cipher(now), now).unwrap();
        let ip = table.complete(a, now).unwrap();
        table.create(addr(2), "b", [2; 32], cipher(now), now).unwrap();

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|s| s.state == SessionState::Disconnected));
        assert!(table.is_empty());
        assert_eq!(table.route(ip), None);
    }
}
