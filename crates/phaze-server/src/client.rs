//! Client side of the handshake and data path.
//!
//! `ClientSession` is a sans-I/O driver: feed it datagrams from the server
//! and send whatever it hands back. The integration tests use it as the
//! reference client.

use std::time::{Duration, Instant};

use bytes::Bytes;
use phaze_core::{
    DecodeError, EncodeError, ErrorCode, HandshakeComplete, HandshakeInit, HandshakeResponse,
    Packet, PacketType, TunnelAssignment, KEEPALIVE_PROBE, KEEPALIVE_REPLY,
    UNASSIGNED_SESSION_ID,
};
use phaze_crypto::{
    credential_proof, derive_session_key, derive_shared_secret, generate_ephemeral_keypair,
    CryptoError, EphemeralPrivateKey, PublicKey, ReplayWindow, Role, Salt, SessionCipher,
    SessionError,
};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::DEFAULT_REKEY_GRACE_SECS;
use crate::obfuscation::Obfuscator;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session not connected")]
    NotConnected,

    #[error("handshake already started")]
    AlreadyStarted,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("obfuscation framing invalid")]
    Obfuscation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    AwaitingResponse,
    AwaitingAssignment,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Datagram to send to the server.
    Send(Bytes),
    /// IP packet received through the tunnel.
    Data(Vec<u8>),
    Connected(TunnelAssignment),
    /// The server switched to the key of a rekey round; this epoch now
    /// seals outbound traffic.
    Rekeyed(u32),
    Rejected(ErrorCode),
    /// The server closed the session.
    Disconnected,
}

/// Offer of the rekey round currently staged, and our answer's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RekeyAnswer {
    server_public: [u8; 32],
    salt: [u8; 32],
    public: [u8; 32],
}

pub struct ClientSession {
    identity: Zeroizing<String>,
    secret: Zeroizing<[u8; 32]>,
    state: ClientState,
    session_id: u32,
    private: Option<EphemeralPrivateKey>,
    public: [u8; 32],
    cipher: Option<SessionCipher>,
    assignment: Option<TunnelAssignment>,
    obfuscator: Option<Box<dyn Obfuscator>>,
    rekey_grace: Duration,
    rekey_answer: Option<RekeyAnswer>,
}

impl ClientSession {
    pub fn new(identity: impl Into<String>, secret: [u8; 32]) -> Self {
        Self {
            identity: Zeroizing::new(identity.into()),
            secret: Zeroizing::new(secret),
            state: ClientState::Idle,
            session_id: UNASSIGNED_SESSION_ID,
            private: None,
            public: [0u8; 32],
            cipher: None,
            assignment: None,
            obfuscator: None,
            rekey_grace: Duration::from_secs(DEFAULT_REKEY_GRACE_SECS),
            rekey_answer: None,
        }
    }

    /// Must match the server's obfuscation setting.
    pub fn set_obfuscator(&mut self, obfuscator: Box<dyn Obfuscator>) {
        self.obfuscator = Some(obfuscator);
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn assignment(&self) -> Option<TunnelAssignment> {
        self.assignment
    }

    /// Epoch of the key sealing outbound traffic, once a key has been
    /// derived.
    pub fn epoch(&self) -> Option<u32> {
        self.cipher.as_ref().map(SessionCipher::epoch)
    }

    /// Build the `HandshakeInit` datagram.
    pub fn start(&mut self) -> Result<Bytes, ClientError> {
        if self.state != ClientState::Idle {
            return Err(ClientError::AlreadyStarted);
        }

        let (private, public) = generate_ephemeral_keypair();
        self.public = public.to_bytes();
        let proof = credential_proof(&self.secret[..], &self.public, &self.identity);

        let init = HandshakeInit {
            public_key: self.public,
            identity: self.identity.as_str().to_owned(),
            credential_proof: proof.to_vec(),
        };
        let bytes =
            Packet::new(PacketType::HandshakeInit, UNASSIGNED_SESSION_ID, 0, init.encode()?)
                .encode()?;

        self.private = Some(private);
        self.state = ClientState::AwaitingResponse;
        Ok(bytes)
    }

    /// Process one datagram from the server.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        let packet = Packet::decode(datagram)?;

        if self.state != ClientState::AwaitingResponse && packet.session_id != self.session_id {
            debug!("ignoring packet for session {}", packet.session_id);
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        match (self.state, packet.packet_type) {
            (
                ClientState::AwaitingResponse | ClientState::AwaitingAssignment,
                PacketType::Error,
            ) => {
                let code = ErrorCode::decode(&packet.payload)?;
                self.close();
                Ok(vec![ClientEvent::Rejected(code)])
            }
            (ClientState::AwaitingResponse, PacketType::HandshakeResponse) => {
                self.on_response(&packet, now)
            }
            (ClientState::AwaitingAssignment, PacketType::HandshakeComplete) => {
                let body = self.open(packet.sequence, &packet.payload, now, &mut events)?;
                let assignment = TunnelAssignment::decode(&body)?;
                self.assignment = Some(assignment);
                self.state = ClientState::Connected;
                events.push(ClientEvent::Connected(assignment));
                Ok(events)
            }
            (ClientState::Connected, PacketType::HandshakeResponse) => {
                let body = self.open(packet.sequence, &packet.payload, now, &mut events)?;
                let offer = HandshakeResponse::decode(&body)?;
                events.push(ClientEvent::Send(self.on_rekey(&offer)?));
                Ok(events)
            }
            (ClientState::Connected, PacketType::Data) => {
                let payload = match &self.obfuscator {
                    Some(o) => o
                        .deobfuscate(&packet.payload)
                        .ok_or(ClientError::Obfuscation)?,
                    None => packet.payload.to_vec(),
                };
                let plaintext = self.open(packet.sequence, &payload, now, &mut events)?;
                events.push(ClientEvent::Data(plaintext));
                Ok(events)
            }
            (ClientState::Connected, PacketType::Keepalive) => {
                let body = self.open(packet.sequence, &packet.payload, now, &mut events)?;
                if body == [KEEPALIVE_PROBE] {
                    let reply = self.sealed(PacketType::Keepalive, &[KEEPALIVE_REPLY])?;
                    events.push(ClientEvent::Send(reply));
                }
                Ok(events)
            }
            (ClientState::Connected, PacketType::Disconnect) => {
                self.open(packet.sequence, &packet.payload, now, &mut events)?;
                self.close();
                events.push(ClientEvent::Disconnected);
                Ok(events)
            }
            (state, packet_type) => {
                debug!("ignoring {:?} in state {:?}", packet_type, state);
                Ok(events)
            }
        }
    }

    fn on_response(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        let response = HandshakeResponse::decode(&packet.payload)?;
        let private = self.private.take().ok_or(ClientError::NotConnected)?;

        let shared = derive_shared_secret(private, &PublicKey::from(response.public_key))?;
        let (key, _) = derive_session_key(&shared, Some(Salt(response.salt)), 0)?;
        let mut cipher =
            SessionCipher::new(key, Role::Client, ReplayWindow::DEFAULT_WINDOW_SIZE, now);

        let (seq, confirmation) = cipher.confirmation()?;
        let complete = HandshakeComplete {
            public_key: self.public,
            confirmation,
        };
        let bytes = Packet::new(
            PacketType::HandshakeComplete,
            packet.session_id,
            seq,
            complete.encode()?,
        )
        .encode()?;

        self.session_id = packet.session_id;
        self.cipher = Some(cipher);
        self.state = ClientState::AwaitingAssignment;
        Ok(vec![ClientEvent::Send(bytes)])
    }

    /// Answer a rekey offer. The new key is only staged; outbound traffic
    /// stays on the current key until the server is heard using the new one.
    /// A repeated offer gets the same public key and a fresh confirmation.
    fn on_rekey(&mut self, offer: &HandshakeResponse) -> Result<Bytes, ClientError> {
        let grace = self.rekey_grace;
        let cipher = self.cipher.as_mut().ok_or(ClientError::NotConnected)?;

        let repeated = self.rekey_answer.filter(|answer| {
            answer.server_public == offer.public_key
                && answer.salt == offer.salt
                && cipher.has_staged_key()
        });
        let public = match repeated {
            Some(answer) => answer.public,
            None => {
                let epoch = cipher
                    .epoch()
                    .checked_add(1)
                    .ok_or(CryptoError::SequenceExhausted)?;
                let (private, public) = generate_ephemeral_keypair();
                let shared = derive_shared_secret(private, &PublicKey::from(offer.public_key))?;
                let (key, _) = derive_session_key(&shared, Some(Salt(offer.salt)), epoch)?;
                cipher.stage(key, grace);

                let public = public.to_bytes();
                self.rekey_answer = Some(RekeyAnswer {
                    server_public: offer.public_key,
                    salt: offer.salt,
                    public,
                });
                debug!("session {} staged epoch {}", self.session_id, epoch);
                public
            }
        };

        let (seq, confirmation) = cipher.staged_confirmation()?;
        let complete = HandshakeComplete {
            public_key: public,
            confirmation,
        };
        Ok(Packet::new(
            PacketType::HandshakeComplete,
            self.session_id,
            seq,
            complete.encode()?,
        )
        .encode()?)
    }

    /// Seal an IP packet for the server.
    pub fn seal_data(&mut self, packet: &[u8]) -> Result<Bytes, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let cipher = self.cipher.as_mut().ok_or(ClientError::NotConnected)?;
        let (seq, ciphertext) = cipher.encrypt(packet)?;
        let payload = match &self.obfuscator {
            Some(o) => o.obfuscate(&ciphertext),
            None => ciphertext,
        };
        Ok(Packet::new(PacketType::Data, self.session_id, seq, payload).encode()?)
    }

    /// A keepalive probe the server will answer.
    pub fn keepalive(&mut self) -> Result<Bytes, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.sealed(PacketType::Keepalive, &[KEEPALIVE_PROBE])
    }

    /// Close the session. The returned datagram tells the server.
    pub fn disconnect(&mut self) -> Result<Bytes, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let bytes = self.sealed(PacketType::Disconnect, &[])?;
        self.close();
        Ok(bytes)
    }

    /// Open a payload, reporting a switch to the staged key.
    fn open(
        &mut self,
        sequence: u32,
        payload: &[u8],
        now: Instant,
        events: &mut Vec<ClientEvent>,
    ) -> Result<Vec<u8>, ClientError> {
        let cipher = self.cipher.as_mut().ok_or(ClientError::NotConnected)?;
        let before = cipher.epoch();
        let plaintext = cipher.decrypt(sequence, payload, now)?;

        let epoch = cipher.epoch();
        if epoch != before {
            self.rekey_answer = None;
            debug!("session {} rekeyed to epoch {}", self.session_id, epoch);
            events.push(ClientEvent::Rekeyed(epoch));
        }
        Ok(plaintext)
    }

    fn sealed(&mut self, packet_type: PacketType, body: &[u8]) -> Result<Bytes, ClientError> {
        let cipher = self.cipher.as_mut().ok_or(ClientError::NotConnected)?;
        let (seq, ciphertext) = cipher.encrypt(body)?;
        Ok(Packet::new(packet_type, self.session_id, seq, ciphertext).encode()?)
    }

    fn close(&mut self) {
        self.state = ClientState::Closed;
        self.cipher = None;
        self.private = None;
        self.rekey_answer = None;
    }
}
