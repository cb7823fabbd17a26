//! Session table: handshake state machine, sequence validation and the
//! per-session AEAD keys.
//!
//! A session is owned by one direction of one peer pair. The outbound session
//! to a peer is the one this node initiated and sends on; the inbound session
//! from a peer is the one the peer initiated and this node receives on.
//! Sequence numbers therefore only ever flow one way inside a session.
//!
//! ```text
//! INITIAL ──begin_handshake──▶ HANDSHAKING ──complete_handshake──▶ ESTABLISHED
//!    ▲                             │                                  │
//!    └────── abort / failure ──────┘                 ttl / terminate ─┴─▶ EXPIRED
//! ```
//!
//! Keys are held inside the table and never handed out; callers seal and open
//! through it. Expired sessions are invisible to every lookup and reclaimed by
//! [`SessionTable::sweep_expired`].

use crate::crypto::{generate_challenge, session_aad, EphemeralKeypair, SessionKey};
use crate::message::{HandshakeAck, HandshakeOffer, SealedPayload};
use agentmesh_types::config::SessionConfig;
use agentmesh_types::{MeshError, MeshResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Handshaking,
    Established,
    Expired,
}

/// Which side initiated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub local_id: String,
    pub peer_id: String,
    pub direction: Direction,
    pub state: SessionState,
    /// Next inbound sequence number accepted.
    pub expected_sequence: u64,
    pub max_received_seq: Option<u64>,
    /// Next outbound sequence number assigned.
    pub next_send_sequence: u64,
    pub established_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub ttl_secs: u64,
    pub e2e: bool,
    pub version: Option<String>,
}

/// Fields the initiator puts into its handshake offer.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub session_id: String,
    pub challenge: String,
    pub ephemeral_public_key: Option<String>,
}

/// Fields the responder puts into its handshake ack.
#[derive(Debug, Clone)]
pub struct AcceptedHandshake {
    pub session_id: String,
    pub selected_version: String,
    pub ephemeral_public_key: Option<String>,
    pub authenticator: Option<String>,
    pub e2e: bool,
}

/// Position assigned to an outgoing session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSlot {
    pub session_id: String,
    pub sequence: u64,
    pub encrypted: bool,
}

struct PendingHandshake {
    ephemeral: Option<EphemeralKeypair>,
    challenge: String,
}

struct Session {
    session_id: String,
    peer_id: String,
    direction: Direction,
    state: SessionState,
    expected_sequence: u64,
    max_received_seq: Option<u64>,
    next_send_sequence: u64,
    established_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    e2e: bool,
    version: Option<String>,
    key: Option<SessionKey>,
    remote_ephemeral: Option<String>,
    pending: Option<PendingHandshake>,
}

/// All sessions of the local node.
pub struct SessionTable {
    local_id: String,
    ttl: Duration,
    e2e_enabled: bool,
    supported_versions: Vec<String>,
    sessions: DashMap<String, Session>,
    by_peer: DashMap<(String, Direction), String>,
}

impl SessionTable {
    pub fn new(local_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            local_id: local_id.into(),
            ttl: Duration::seconds(config.ttl_secs.min(i64::MAX as u64) as i64),
            e2e_enabled: config.e2e_enabled,
            supported_versions: config.supported_versions.clone(),
            sessions: DashMap::new(),
            by_peer: DashMap::new(),
        }
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    pub fn e2e_enabled(&self) -> bool {
        self.e2e_enabled
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.state == SessionState::Expired || now - session.last_activity > self.ttl
    }

    fn info_of(&self, s: &Session) -> SessionInfo {
        SessionInfo {
            session_id: s.session_id.clone(),
            local_id: self.local_id.clone(),
            peer_id: s.peer_id.clone(),
            direction: s.direction,
            state: s.state,
            expected_sequence: s.expected_sequence,
            max_received_seq: s.max_received_seq,
            next_send_sequence: s.next_send_sequence,
            established_at: s.established_at,
            last_activity: s.last_activity,
            ttl_secs: self.ttl.num_seconds().max(0) as u64,
            e2e: s.e2e,
            version: s.version.clone(),
        }
    }

    /// Snapshot of a live session.
    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let now = Utc::now();
        let s = self.sessions.get(session_id)?;
        if self.is_expired(&s, now) {
            return None;
        }
        Some(self.info_of(&s))
    }

    /// The live session for `peer` in `direction`, in any non-expired state.
    pub fn lookup(&self, peer_id: &str, direction: Direction) -> Option<SessionInfo> {
        self.lookup_at(peer_id, direction, Utc::now())
    }

    pub fn lookup_at(
        &self,
        peer_id: &str,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Option<SessionInfo> {
        let session_id = self
            .by_peer
            .get(&(peer_id.to_string(), direction))?
            .value()
            .clone();
        let s = self.sessions.get(&session_id)?;
        if self.is_expired(&s, now) {
            return None;
        }
        Some(self.info_of(&s))
    }

    /// The established outbound session to `peer`, if there is one.
    pub fn established(&self, peer_id: &str) -> Option<SessionInfo> {
        self.lookup(peer_id, Direction::Outbound)
            .filter(|s| s.state == SessionState::Established)
    }

    /// Start an outbound handshake, replacing any previous outbound session.
    pub fn begin_handshake(&self, peer_id: &str, e2e: bool) -> PendingOffer {
        self.terminate_peer_direction(peer_id, Direction::Outbound, "re-handshake");

        let session_id = uuid::Uuid::new_v4().to_string();
        let challenge = generate_challenge();
        let ephemeral = e2e.then(EphemeralKeypair::generate);
        let offer = PendingOffer {
            session_id: session_id.clone(),
            challenge: challenge.clone(),
            ephemeral_public_key: ephemeral.as_ref().map(|k| k.public_b64()),
        };
        let now = Utc::now();
        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                peer_id: peer_id.to_string(),
                direction: Direction::Outbound,
                state: SessionState::Handshaking,
                expected_sequence: 0,
                max_received_seq: None,
                next_send_sequence: 0,
                established_at: None,
                last_activity: now,
                e2e,
                version: None,
                key: None,
                remote_ephemeral: None,
                pending: Some(PendingHandshake {
                    ephemeral,
                    challenge,
                }),
            },
        );
        self.by_peer
            .insert((peer_id.to_string(), Direction::Outbound), session_id.clone());
        debug!(peer = %peer_id, session = %session_id, e2e, "Handshake started");
        offer
    }

    /// Finish an outbound handshake with the responder's ack.
    ///
    /// On any failure the pending session is discarded, leaving the peer in
    /// `Initial`.
    pub fn complete_handshake(&self, peer_id: &str, ack: &HandshakeAck) -> MeshResult<SessionInfo> {
        let result = self.try_complete(peer_id, ack);
        if let Err(e) = &result {
            warn!(peer = %peer_id, session = %ack.session_id, error = %e, "Handshake failed");
            self.abort_handshake(peer_id);
        }
        result
    }

    fn try_complete(&self, peer_id: &str, ack: &HandshakeAck) -> MeshResult<SessionInfo> {
        let mut entry = self
            .sessions
            .get_mut(&ack.session_id)
            .ok_or_else(|| MeshError::HandshakeFailed("no pending handshake".into()))?;
        let session = entry.value_mut();
        if session.peer_id != peer_id
            || session.direction != Direction::Outbound
            || session.state != SessionState::Handshaking
        {
            return Err(MeshError::HandshakeFailed(
                "ack does not match a pending handshake".into(),
            ));
        }
        if !self.supported_versions.contains(&ack.selected_version) {
            return Err(MeshError::VersionMismatch {
                local: self.supported_versions.join(","),
                remote: ack.selected_version.clone(),
            });
        }
        let pending = session
            .pending
            .take()
            .ok_or_else(|| MeshError::HandshakeFailed("handshake already completed".into()))?;

        if session.e2e {
            if !ack.e2e_enabled {
                return Err(MeshError::HandshakeFailed(
                    "peer refused end-to-end encryption".into(),
                ));
            }
            let ephemeral = pending
                .ephemeral
                .ok_or_else(|| MeshError::HandshakeFailed("missing local ephemeral key".into()))?;
            let remote = ack
                .ephemeral_public_key
                .as_deref()
                .ok_or_else(|| MeshError::HandshakeFailed("ack carries no ephemeral key".into()))?;
            let remote_bytes = crate::crypto::decode_x25519(remote)?;
            let shared = ephemeral.diffie_hellman(remote)?;
            let key = SessionKey::derive(
                &shared,
                &ephemeral.public_bytes(),
                &remote_bytes,
                &session.session_id,
            )?;
            let tag = ack
                .authenticator
                .as_deref()
                .ok_or_else(|| MeshError::HandshakeFailed("ack carries no authenticator".into()))?;
            if !key.verify_authenticator(&pending.challenge, tag) {
                return Err(MeshError::HandshakeFailed(
                    "key confirmation mismatch".into(),
                ));
            }
            session.key = Some(key);
            session.remote_ephemeral = Some(remote.to_string());
        }

        let now = Utc::now();
        session.state = SessionState::Established;
        session.version = Some(ack.selected_version.clone());
        session.established_at = Some(now);
        session.last_activity = now;
        info!(peer = %peer_id, session = %session.session_id, e2e = session.e2e, "Session established");
        Ok(self.info_of(session))
    }

    /// Drop a pending outbound handshake (timeout or failure).
    pub fn abort_handshake(&self, peer_id: &str) {
        let key = (peer_id.to_string(), Direction::Outbound);
        let Some(session_id) = self.by_peer.get(&key).map(|s| s.value().clone()) else {
            return;
        };
        let removed = self
            .sessions
            .remove_if(&session_id, |_, s| s.state == SessionState::Handshaking);
        if removed.is_some() {
            self.by_peer.remove_if(&key, |_, sid| *sid == session_id);
            debug!(peer = %peer_id, session = %session_id, "Handshake aborted");
        }
    }

    /// Responder side: accept an offer and establish the inbound session.
    pub fn accept_handshake(
        &self,
        peer_id: &str,
        offer: &HandshakeOffer,
    ) -> MeshResult<AcceptedHandshake> {
        if uuid::Uuid::parse_str(&offer.session_id).is_err() {
            return Err(MeshError::HandshakeFailed("session id is not a UUID".into()));
        }
        if let Some(existing) = self.sessions.get(&offer.session_id) {
            if existing.peer_id != peer_id || existing.direction != Direction::Inbound {
                return Err(MeshError::HandshakeFailed("session id already in use".into()));
            }
        }
        let selected_version = offer
            .supported_versions
            .iter()
            .find(|v| self.supported_versions.contains(*v))
            .cloned()
            .ok_or_else(|| MeshError::VersionMismatch {
                local: self.supported_versions.join(","),
                remote: offer.supported_versions.join(","),
            })?;

        let (key, ephemeral_public_key, authenticator) = if offer.e2e_enabled {
            let remote = offer.ephemeral_public_key.as_deref().ok_or_else(|| {
                MeshError::HandshakeFailed("e2e requested without an ephemeral key".into())
            })?;
            let remote_bytes = crate::crypto::decode_x25519(remote)?;
            let ephemeral = EphemeralKeypair::generate();
            let shared = ephemeral.diffie_hellman(remote)?;
            let key = SessionKey::derive(
                &shared,
                &remote_bytes,
                &ephemeral.public_bytes(),
                &offer.session_id,
            )?;
            let tag = key.authenticator(&offer.challenge)?;
            (Some(key), Some(ephemeral.public_b64()), Some(tag))
        } else {
            (None, None, None)
        };

        self.terminate_peer_direction(peer_id, Direction::Inbound, "re-handshake");
        let now = Utc::now();
        self.sessions.insert(
            offer.session_id.clone(),
            Session {
                session_id: offer.session_id.clone(),
                peer_id: peer_id.to_string(),
                direction: Direction::Inbound,
                state: SessionState::Established,
                expected_sequence: 0,
                max_received_seq: None,
                next_send_sequence: 0,
                established_at: Some(now),
                last_activity: now,
                e2e: offer.e2e_enabled,
                version: Some(selected_version.clone()),
                key,
                remote_ephemeral: offer.ephemeral_public_key.clone(),
                pending: None,
            },
        );
        self.by_peer.insert(
            (peer_id.to_string(), Direction::Inbound),
            offer.session_id.clone(),
        );
        info!(peer = %peer_id, session = %offer.session_id, e2e = offer.e2e_enabled, "Accepted session");

        Ok(AcceptedHandshake {
            session_id: offer.session_id.clone(),
            selected_version,
            ephemeral_public_key,
            authenticator,
            e2e: offer.e2e_enabled,
        })
    }

    /// Validate an inbound sequence number and advance on success.
    ///
    /// Exactly `expected_sequence` is accepted. Anything lower is a replay,
    /// anything higher is a gap; both are rejected and nothing is buffered.
    pub fn validate_sequence(&self, session_id: &str, sender_id: &str, sequence: u64) -> MeshResult<()> {
        let now = Utc::now();
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MeshError::SessionNotFound(session_id.to_string()))?;
        let ttl = self.ttl;
        let session = entry.value_mut();
        if session.peer_id != sender_id
            || session.direction != Direction::Inbound
            || session.state != SessionState::Established
            || now - session.last_activity > ttl
        {
            return Err(MeshError::SessionNotFound(session_id.to_string()));
        }

        let expected = session.expected_sequence;
        if sequence != expected {
            warn!(
                peer = %sender_id,
                session = %session_id,
                expected,
                received = sequence,
                "Sequence violation"
            );
            return Err(MeshError::SequenceError {
                expected,
                received: sequence,
            });
        }
        session.expected_sequence = expected + 1;
        session.max_received_seq = Some(session.max_received_seq.map_or(sequence, |m| m.max(sequence)));
        session.last_activity = now;
        Ok(())
    }

    /// Allocate the next outbound position on the established session to `peer`.
    pub fn next_outbound(&self, peer_id: &str) -> MeshResult<OutboundSlot> {
        let now = Utc::now();
        let session_id = self
            .by_peer
            .get(&(peer_id.to_string(), Direction::Outbound))
            .map(|s| s.value().clone())
            .ok_or_else(|| MeshError::SessionNotFound(peer_id.to_string()))?;
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| MeshError::SessionNotFound(session_id.clone()))?;
        let ttl = self.ttl;
        let session = entry.value_mut();
        if session.state != SessionState::Established || now - session.last_activity > ttl {
            return Err(MeshError::SessionNotFound(session_id));
        }
        let sequence = session.next_send_sequence;
        session.next_send_sequence += 1;
        session.last_activity = now;
        Ok(OutboundSlot {
            session_id,
            sequence,
            encrypted: session.key.is_some(),
        })
    }

    /// Encrypt `plaintext` for the given session position.
    pub fn seal(&self, session_id: &str, sequence: u64, plaintext: &[u8]) -> MeshResult<SealedPayload> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| MeshError::SessionNotFound(session_id.to_string()))?;
        let key = session
            .key
            .as_ref()
            .ok_or_else(|| MeshError::Internal(format!("session {session_id} is not encrypted")))?;
        key.seal(plaintext, &session_aad(session_id, sequence))
    }

    /// Decrypt a sealed payload received on `session_id`.
    ///
    /// A failure is fatal for the session: it is terminated before the
    /// error is returned.
    pub fn open(&self, session_id: &str, sequence: u64, sealed: &SealedPayload) -> MeshResult<Vec<u8>> {
        let result = {
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| MeshError::SessionNotFound(session_id.to_string()))?;
            match session.key.as_ref() {
                Some(key) => key.open(sealed, &session_aad(session_id, sequence)),
                None => Err(MeshError::DecryptionFailed),
            }
        };
        if result.is_err() {
            self.terminate(session_id, "decryption failure");
        }
        result
    }

    /// Whether payloads on this session must be sealed.
    pub fn is_encrypted(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.key.is_some())
            .unwrap_or(false)
    }

    /// Non-secret fingerprint of a session key.
    pub fn key_fingerprint(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.key.as_ref().map(|k| k.fingerprint()))
    }

    /// Remote ephemeral public key of an encrypted session.
    pub fn remote_ephemeral(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.remote_ephemeral.clone())
    }

    /// Remove a session. Returns whether it existed.
    pub fn terminate(&self, session_id: &str, reason: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        self.by_peer.remove_if(
            &(session.peer_id.clone(), session.direction),
            |_, sid| sid == session_id,
        );
        info!(
            peer = %session.peer_id,
            session = %session_id,
            reason,
            "Session terminated"
        );
        true
    }

    /// Remove the session to or from `peer` in `direction`.
    pub fn terminate_peer_direction(&self, peer_id: &str, direction: Direction, reason: &str) {
        let session_id = self
            .by_peer
            .get(&(peer_id.to_string(), direction))
            .map(|s| s.value().clone());
        if let Some(session_id) = session_id {
            self.terminate(&session_id, reason);
        }
    }

    /// Remove both sessions with `peer`.
    pub fn terminate_peer(&self, peer_id: &str, reason: &str) {
        self.terminate_peer_direction(peer_id, Direction::Outbound, reason);
        self.terminate_peer_direction(peer_id, Direction::Inbound, reason);
    }

    /// Reclaim sessions idle longer than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| self.is_expired(s.value(), now))
            .map(|s| s.key().clone())
            .collect();
        for session_id in &expired {
            if let Some(mut s) = self.sessions.get_mut(session_id) {
                s.state = SessionState::Expired;
            }
            self.terminate(session_id, "expired");
        }
        expired.len()
    }

    /// Number of sessions held, including not yet swept ones.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of every live session.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Utc::now();
        self.sessions
            .iter()
            .filter(|s| !self.is_expired(s.value(), now))
            .map(|s| self.info_of(s.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::config::PROTOCOL_VERSION;

    fn table(id: &str) -> SessionTable {
        SessionTable::new(id, &SessionConfig::default())
    }

    fn offer_from(pending: &PendingOffer, e2e: bool) -> HandshakeOffer {
        HandshakeOffer {
            session_id: pending.session_id.clone(),
            challenge: pending.challenge.clone(),
            ephemeral_public_key: pending.ephemeral_public_key.clone(),
            supported_versions: vec![PROTOCOL_VERSION.to_string()],
            capabilities: vec![],
            e2e_enabled: e2e,
            identity_public_key: String::new(),
            record: None,
        }
    }

    fn ack_from(accepted: &AcceptedHandshake, challenge: &str) -> HandshakeAck {
        HandshakeAck {
            session_id: accepted.session_id.clone(),
            challenge: challenge.to_string(),
            ephemeral_public_key: accepted.ephemeral_public_key.clone(),
            supported_versions: vec![PROTOCOL_VERSION.to_string()],
            selected_version: accepted.selected_version.clone(),
            capabilities: vec![],
            e2e_enabled: accepted.e2e,
            identity_public_key: String::new(),
            authenticator: accepted.authenticator.clone(),
            record: None,
        }
    }

    /// Runs a full handshake from `a` to `b`. Returns the session id.
    fn establish(a: &SessionTable, b: &SessionTable, e2e: bool) -> String {
        let pending = a.begin_handshake("b", e2e);
        assert_eq!(
            a.lookup("b", Direction::Outbound).unwrap().state,
            SessionState::Handshaking
        );
        let accepted = b.accept_handshake("a", &offer_from(&pending, e2e)).unwrap();
        a.complete_handshake("b", &ack_from(&accepted, &pending.challenge))
            .unwrap();
        pending.session_id
    }

    #[test]
    fn test_e2e_handshake_derives_equal_keys() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, true);
        assert_eq!(a.established("b").unwrap().state, SessionState::Established);
        let fa = a.key_fingerprint(&sid).unwrap();
        let fb = b.key_fingerprint(&sid).unwrap();
        assert_eq!(fa, fb);
        assert!(a.remote_ephemeral(&sid).is_some());
    }

    #[test]
    fn test_sealed_payload_opens_on_peer() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, true);
        let slot = a.next_outbound("b").unwrap();
        assert!(slot.encrypted);
        let sealed = a.seal(&sid, slot.sequence, b"secret plan").unwrap();
        assert_eq!(b.open(&sid, slot.sequence, &sealed).unwrap(), b"secret plan");
    }

    #[test]
    fn test_decryption_failure_tears_down_session() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, true);
        let sealed = a.seal(&sid, 0, b"x").unwrap();
        assert!(matches!(
            b.open(&sid, 1, &sealed),
            Err(MeshError::DecryptionFailed)
        ));
        assert!(b.info(&sid).is_none());
        assert!(b.lookup("a", Direction::Inbound).is_none());
    }

    #[test]
    fn test_sequence_rules() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, false);

        assert!(b.validate_sequence(&sid, "a", 0).is_ok());
        assert_eq!(b.info(&sid).unwrap().expected_sequence, 1);

        let err = b.validate_sequence(&sid, "a", 0).unwrap_err();
        assert!(matches!(
            err,
            MeshError::SequenceError {
                expected: 1,
                received: 0
            }
        ));

        let err = b.validate_sequence(&sid, "a", 6).unwrap_err();
        assert!(matches!(
            err,
            MeshError::SequenceError {
                expected: 1,
                received: 6
            }
        ));
        // Gap was not buffered: 1 is still next.
        assert!(b.validate_sequence(&sid, "a", 1).is_ok());
        assert_eq!(b.info(&sid).unwrap().max_received_seq, Some(1));
    }

    #[test]
    fn test_sequence_from_wrong_sender_rejected() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, false);
        assert!(matches!(
            b.validate_sequence(&sid, "mallory", 0),
            Err(MeshError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_outbound_sequence_increments() {
        let a = table("a");
        let b = table("b");
        establish(&a, &b, false);
        assert_eq!(a.next_outbound("b").unwrap().sequence, 0);
        assert_eq!(a.next_outbound("b").unwrap().sequence, 1);
        assert!(!a.next_outbound("b").unwrap().encrypted);
    }

    #[test]
    fn test_bad_authenticator_reverts_to_initial() {
        let a = table("a");
        let b = table("b");
        let pending = a.begin_handshake("b", true);
        let accepted = b.accept_handshake("a", &offer_from(&pending, true)).unwrap();
        let mut ack = ack_from(&accepted, &pending.challenge);
        ack.authenticator = Some("00".repeat(32));
        assert!(matches!(
            a.complete_handshake("b", &ack),
            Err(MeshError::HandshakeFailed(_))
        ));
        assert!(a.lookup("b", Direction::Outbound).is_none());
        assert!(a.next_outbound("b").is_err());
    }

    #[test]
    fn test_downgrade_refused() {
        let a = table("a");
        let b = table("b");
        let pending = a.begin_handshake("b", true);
        let accepted = b.accept_handshake("a", &offer_from(&pending, true)).unwrap();
        let mut ack = ack_from(&accepted, &pending.challenge);
        ack.e2e_enabled = false;
        assert!(a.complete_handshake("b", &ack).is_err());
    }

    #[test]
    fn test_abort_reverts_to_initial() {
        let a = table("a");
        a.begin_handshake("b", false);
        a.abort_handshake("b");
        assert!(a.lookup("b", Direction::Outbound).is_none());
        assert!(a.is_empty());
    }

    #[test]
    fn test_version_mismatch() {
        let b = table("b");
        let a = table("a");
        let pending = a.begin_handshake("b", false);
        let mut offer = offer_from(&pending, false);
        offer.supported_versions = vec!["9.9".into()];
        assert!(matches!(
            b.accept_handshake("a", &offer),
            Err(MeshError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_expired_session_invisible_and_swept() {
        let a = table("a");
        let b = table("b");
        let sid = establish(&a, &b, false);
        let later = Utc::now() + Duration::seconds(3601);
        assert!(b.lookup_at("a", Direction::Inbound, later).is_none());
        assert_eq!(b.sweep_expired(later), 1);
        assert!(b.info(&sid).is_none());
        assert!(b.is_empty());
    }

    #[test]
    fn test_rehandshake_replaces_outbound() {
        let a = table("a");
        let b = table("b");
        let first = establish(&a, &b, false);
        let second = establish(&a, &b, false);
        assert_ne!(first, second);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(b.info(&first).is_none());
    }
}
