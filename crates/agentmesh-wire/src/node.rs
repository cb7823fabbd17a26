//! The mesh node: one explicitly constructed context per local identity.
//!
//! A [`MeshNode`] owns the authenticator, session table, reassembly buffers,
//! flow controller and peer directory, and answers inbound frames. Several
//! nodes can live in one process; nothing here is global.
//!
//! Inbound frames go through, in order: signature and replay check, recipient
//! check, then per-type handling. Session payloads are sequence-checked,
//! decrypted, reassembled if chunked, decompressed and finally dispatched to
//! the handler registered for their application `msg_type`.

use crate::auth::{Authenticator, Authenticity};
use crate::chunking::Reassembler;
use crate::dht::DhtBackend;
use crate::directory::PeerDirectory;
use crate::flow::FlowController;
use crate::identity::{decode_public_key, peer_id_for, Keypair};
use crate::kademlia::{DhtRpc, KademliaDht};
use crate::message::{
    generate_nonce, msg_types, AckPayload, Delivery, DhtFindRequest, DhtResultPayload,
    DhtStoreRequest, ErrorPayload, HandshakeAck, HandshakeOffer, MessageBody, PingPayload,
    PongPayload, SealedBody, SessionClosePayload, SignedMessage,
};
use crate::record::{Contact, DhtKey, PeerRecord};
use crate::session::{Direction, SessionInfo, SessionTable};
use crate::transport::{serve, FrameHandler, TcpTransport, Transport};
use agentmesh_types::config::PROTOCOL_VERSION;
use agentmesh_types::{MeshConfig, MeshError, MeshResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A delivery handed to an application handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub sender_id: String,
    /// Application message type the handler was registered for.
    pub msg_type: String,
    pub payload: Value,
    /// How the carrying frame was authenticated. Never upgraded.
    pub authenticity: Authenticity,
    /// Session the delivery arrived on; `None` for connectionless frames.
    pub session_id: Option<String>,
}

/// Application callback for one message type.
///
/// The returned value, if any, travels back to the sender in the ack.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> MeshResult<Option<Value>>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<Option<Value>>> + Send,
{
    async fn handle(&self, message: InboundMessage) -> MeshResult<Option<Value>> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MeshResult<Option<Value>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Send `frame` and return the verified response body.
///
/// The response must be signed by `expected_peer` (when given) and addressed
/// to us. An `error` response is turned back into its typed error.
async fn exchange(
    auth: &Authenticator,
    transport: &dyn Transport,
    endpoint: &str,
    expected_peer: Option<&str>,
    frame: &SignedMessage,
    deadline: Duration,
) -> MeshResult<MessageBody> {
    let response = tokio::time::timeout(deadline, transport.request(endpoint, frame))
        .await
        .map_err(|_| {
            MeshError::Timeout(format!("no response from {endpoint} within {deadline:?}"))
        })??;

    if auth.verify_message(&response)? != Authenticity::Verified {
        return Err(MeshError::InvalidSignature);
    }
    if expected_peer.is_some_and(|p| p != response.sender_id)
        || response.recipient_id.as_deref() != Some(auth.peer_id())
    {
        warn!(endpoint = %endpoint, sender = %response.sender_id, "Response from unexpected peer");
        return Err(MeshError::InvalidSignature);
    }
    match response.body()? {
        MessageBody::Error(payload) => Err(payload.into_error()),
        body => Ok(body),
    }
}

/// Errors after which both ends may disagree on the session state.
fn breaks_session(err: &MeshError) -> bool {
    err.is_session_fatal()
        || matches!(
            err,
            MeshError::SequenceError { .. }
                | MeshError::SessionNotFound(_)
                | MeshError::PeerUnreachable(_)
                | MeshError::Timeout(_)
                | MeshError::InvalidSignature
                | MeshError::Replayed(_)
        )
}

/// Kademlia RPCs carried over the mesh envelope.
pub struct WireDhtRpc {
    auth: Arc<Authenticator>,
    transport: Arc<dyn Transport>,
    local: Contact,
    timeout: Duration,
}

impl WireDhtRpc {
    pub fn new(
        auth: Arc<Authenticator>,
        transport: Arc<dyn Transport>,
        local: Contact,
        timeout: Duration,
    ) -> Self {
        Self {
            auth,
            transport,
            local,
            timeout,
        }
    }

    async fn call(&self, to: &Contact, body: MessageBody) -> MeshResult<MessageBody> {
        if to.is_self_consistent() {
            let key = decode_public_key(&to.public_key)?;
            self.auth.keyring().learn_for(&to.peer_id, key)?;
        }
        let frame = self.auth.envelope(Some(to.peer_id.clone()), &body, None)?;
        exchange(
            &self.auth,
            &*self.transport,
            &to.endpoint,
            Some(&to.peer_id),
            &frame,
            self.timeout,
        )
        .await
    }

    fn find_request(&self, key: &DhtKey) -> DhtFindRequest {
        DhtFindRequest {
            origin: self.local.clone(),
            key: key.to_hex(),
        }
    }
}

fn unexpected(body: &MessageBody) -> MeshError {
    MeshError::Serialization(format!("unexpected '{}' response", body.msg_type()))
}

#[async_trait]
impl DhtRpc for WireDhtRpc {
    async fn ping(&self, endpoint: &str) -> MeshResult<Contact> {
        let body = MessageBody::Ping(PingPayload {
            origin: Some(self.local.clone()),
        });
        let frame = self.auth.envelope(None, &body, None)?;
        match exchange(&self.auth, &*self.transport, endpoint, None, &frame, self.timeout).await? {
            MessageBody::Pong(pong) if pong.contact.is_self_consistent() => Ok(pong.contact),
            MessageBody::Pong(_) => Err(MeshError::InvalidSignature),
            other => Err(unexpected(&other)),
        }
    }

    async fn find_node(&self, to: &Contact, key: &DhtKey) -> MeshResult<Vec<Contact>> {
        match self.call(to, MessageBody::DhtFindNode(self.find_request(key))).await? {
            MessageBody::DhtResult(result) => Ok(result.contacts),
            other => Err(unexpected(&other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: &DhtKey) -> MeshResult<DhtResultPayload> {
        match self.call(to, MessageBody::DhtFindValue(self.find_request(key))).await? {
            MessageBody::DhtResult(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    async fn store(&self, to: &Contact, key: &DhtKey, record: &PeerRecord) -> MeshResult<()> {
        let body = MessageBody::DhtStore(DhtStoreRequest {
            origin: self.local.clone(),
            key: key.to_hex(),
            record: record.clone(),
        });
        match self.call(to, body).await? {
            MessageBody::Ack(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

/// A local mesh identity and everything needed to talk to peers.
pub struct MeshNode {
    config: MeshConfig,
    auth: Arc<Authenticator>,
    endpoint: String,
    sessions: SessionTable,
    reassembler: Reassembler,
    flow: FlowController,
    directory: PeerDirectory,
    transport: Arc<dyn Transport>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    request_timeout: Duration,
    handshake_timeout: Duration,
    started: Instant,
}

impl MeshNode {
    /// Build a node backed by a Kademlia DHT that speaks over `transport`.
    pub fn new(
        config: MeshConfig,
        keypair: Keypair,
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<Arc<Self>> {
        let endpoint = endpoint.into();
        let auth = Arc::new(Authenticator::new(keypair, &config.security));
        let local = Contact {
            peer_id: auth.peer_id().to_string(),
            endpoint: endpoint.clone(),
            public_key: auth.keypair().public_key_b64(),
        };
        let rpc = Arc::new(WireDhtRpc::new(
            Arc::clone(&auth),
            Arc::clone(&transport),
            local.clone(),
            Duration::from_secs(config.node.request_timeout_secs),
        ));
        let backend = Arc::new(KademliaDht::new(local, rpc, &config.dht)?);
        Self::build(config, auth, endpoint, transport, backend)
    }

    /// Build a node over an explicit directory backend.
    pub fn with_backend(
        config: MeshConfig,
        keypair: Keypair,
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn DhtBackend>,
    ) -> MeshResult<Arc<Self>> {
        let auth = Arc::new(Authenticator::new(keypair, &config.security));
        Self::build(config, auth, endpoint.into(), transport, backend)
    }

    fn build(
        mut config: MeshConfig,
        auth: Arc<Authenticator>,
        endpoint: String,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn DhtBackend>,
    ) -> MeshResult<Arc<Self>> {
        config.validate()?;
        config.node.advertised_endpoint = Some(endpoint.clone());
        let directory = PeerDirectory::new(Arc::clone(&auth), backend, &config.node, &config.dht);
        info!(peer = %auth.peer_id(), endpoint = %endpoint, "Mesh node created");
        Ok(Arc::new(Self {
            sessions: SessionTable::new(auth.peer_id(), &config.session),
            reassembler: Reassembler::new(&config.chunking),
            flow: FlowController::new(&config.flow),
            request_timeout: Duration::from_secs(config.node.request_timeout_secs),
            handshake_timeout: Duration::from_secs(config.session.handshake_timeout_secs),
            handlers: DashMap::new(),
            started: Instant::now(),
            config,
            auth,
            endpoint,
            directory,
            transport,
        }))
    }

    /// Bind `node.listen_addr`, create a TCP node and start accepting.
    ///
    /// The accept loop stops when `shutdown` flips to `true`.
    pub async fn start_tcp(
        config: MeshConfig,
        keypair: Keypair,
        shutdown: watch::Receiver<bool>,
    ) -> MeshResult<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind(&config.node.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let endpoint = config
            .node
            .advertised_endpoint
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        let transport = Arc::new(TcpTransport::new(Duration::from_secs(
            config.node.request_timeout_secs,
        )));
        let node = Self::new(config, keypair, endpoint, transport)?;
        let handler: Arc<dyn FrameHandler> = node.clone();
        let accept = tokio::spawn(serve(listener, handler, shutdown));
        Ok((node, accept))
    }

    /// Bootstrap into the directory and publish the local record.
    ///
    /// Unreachable bootstrap nodes are not an error.
    pub async fn join(&self) -> MeshResult<PeerRecord> {
        self.directory.bootstrap().await;
        self.directory.register_self().await
    }

    pub fn peer_id(&self) -> &str {
        self.auth.peer_id()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn contact(&self) -> Contact {
        Contact {
            peer_id: self.peer_id().to_string(),
            endpoint: self.endpoint.clone(),
            public_key: self.auth.keypair().public_key_b64(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Route deliveries of `msg_type` to `handler`, replacing any previous one.
    pub fn register_handler(&self, msg_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let msg_type = msg_type.into();
        debug!(msg_type = %msg_type, "Registered handler");
        self.handlers.insert(msg_type, handler);
    }

    pub fn unregister_handler(&self, msg_type: &str) -> bool {
        self.handlers.remove(msg_type).is_some()
    }

    fn local_record(&self) -> Option<PeerRecord> {
        self.directory
            .local_record()
            .filter(|r| !r.is_expired())
            .or_else(|| self.directory.sign_local_record().ok())
    }

    // --- outbound ---

    /// Run the initiator side of the handshake with `record`'s peer.
    ///
    /// On any failure, including the handshake deadline, the pending session
    /// is dropped and the peer is back in `Initial`.
    pub async fn connect(&self, record: &PeerRecord) -> MeshResult<SessionInfo> {
        let peer_id = record.peer_id.as_str();
        let e2e = self.sessions.e2e_enabled();
        let offer = self.sessions.begin_handshake(peer_id, e2e);
        let body = MessageBody::Handshake(HandshakeOffer {
            session_id: offer.session_id.clone(),
            challenge: offer.challenge,
            ephemeral_public_key: offer.ephemeral_public_key,
            supported_versions: self.sessions.supported_versions().to_vec(),
            capabilities: self.config.node.capabilities.clone(),
            e2e_enabled: e2e,
            identity_public_key: self.auth.keypair().public_key_b64(),
            record: self.local_record(),
        });

        let reply = match self.auth.envelope(Some(peer_id.to_string()), &body, None) {
            Ok(frame) => {
                exchange(
                    &self.auth,
                    &*self.transport,
                    &record.endpoint,
                    Some(peer_id),
                    &frame,
                    self.handshake_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let ack = match reply {
            Ok(MessageBody::HandshakeAck(ack)) if ack.session_id == offer.session_id => ack,
            Ok(other) => {
                self.sessions.abort_handshake(peer_id);
                return Err(MeshError::HandshakeFailed(format!(
                    "unexpected '{}' reply to handshake",
                    other.msg_type()
                )));
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Handshake not completed");
                self.sessions.abort_handshake(peer_id);
                if matches!(e, MeshError::PeerUnreachable(_)) {
                    self.directory.registry().mark_unreachable(peer_id);
                }
                return Err(e);
            }
        };

        let info = self.sessions.complete_handshake(peer_id, &ack)?;
        if let Some(remote) = ack.record {
            if remote.peer_id == peer_id {
                if let Err(e) = self.directory.learn(remote) {
                    debug!(peer = %peer_id, error = %e, "Ignoring record from handshake ack");
                }
            }
        }
        self.directory.registry().mark_reachable(peer_id);
        Ok(info)
    }

    /// The established outbound session to `record`'s peer, handshaking if
    /// there is none.
    pub async fn ensure_session(&self, record: &PeerRecord) -> MeshResult<SessionInfo> {
        match self.sessions.established(&record.peer_id) {
            Some(info) => Ok(info),
            None => self.connect(record).await,
        }
    }

    /// Send one body on the outbound session to `record`'s peer.
    ///
    /// The body is sealed when the session is encrypted. A failure that may
    /// leave the two ends out of step terminates the session, so the next
    /// send starts with a fresh handshake.
    pub async fn send_on_session(&self, record: &PeerRecord, body: MessageBody) -> MeshResult<AckPayload> {
        let peer_id = record.peer_id.as_str();
        let result = self.try_send_on_session(record, body).await;
        if let Err(e) = &result {
            if breaks_session(e) {
                self.sessions
                    .terminate_peer_direction(peer_id, Direction::Outbound, "send failed");
            }
            if matches!(e, MeshError::PeerUnreachable(_) | MeshError::Timeout(_)) {
                self.directory.registry().mark_unreachable(peer_id);
            }
        }
        result
    }

    async fn try_send_on_session(&self, record: &PeerRecord, body: MessageBody) -> MeshResult<AckPayload> {
        let peer_id = record.peer_id.as_str();
        let slot = self.sessions.next_outbound(peer_id)?;
        let body = if slot.encrypted {
            let plain = serde_json::to_vec(&SealedBody::from_body(&body)?)?;
            MessageBody::Encrypted(self.sessions.seal(&slot.session_id, slot.sequence, &plain)?)
        } else {
            body
        };
        let frame = self.auth.envelope(
            Some(peer_id.to_string()),
            &body,
            Some((&slot.session_id, slot.sequence)),
        )?;
        self.flow.record_bytes(frame.payload.to_string().len());

        match exchange(
            &self.auth,
            &*self.transport,
            &record.endpoint,
            Some(peer_id),
            &frame,
            self.request_timeout,
        )
        .await?
        {
            MessageBody::Ack(ack) => Ok(ack),
            other => Err(unexpected(&other)),
        }
    }

    /// Tell `record`'s peer our outbound session is over and drop it locally.
    pub async fn close_session(&self, record: &PeerRecord, reason: &str) -> MeshResult<()> {
        let Some(info) = self.sessions.lookup(&record.peer_id, Direction::Outbound) else {
            return Ok(());
        };
        self.sessions.terminate(&info.session_id, reason);
        let body = MessageBody::SessionClose(SessionClosePayload {
            session_id: info.session_id,
            reason: reason.to_string(),
        });
        let frame = self.auth.envelope(Some(record.peer_id.clone()), &body, None)?;
        exchange(
            &self.auth,
            &*self.transport,
            &record.endpoint,
            Some(&record.peer_id),
            &frame,
            self.request_timeout,
        )
        .await
        .map(|_| ())
    }

    // --- inbound ---

    async fn respond(&self, frame: SignedMessage) -> SignedMessage {
        let sender = frame.sender_id.clone();
        let msg_type = frame.msg_type.clone();
        let body = match self.process(frame).await {
            Ok(body) => body,
            Err(e) => {
                debug!(sender = %sender, msg_type = %msg_type, error = %e, "Rejected frame");
                MessageBody::Error(ErrorPayload::from(&e))
            }
        };
        let recipient = (!sender.is_empty()).then_some(sender);
        match self.auth.envelope(recipient.clone(), &body, None) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Failed to build response");
                self.internal_error_frame(recipient)
            }
        }
    }

    fn internal_error_frame(&self, recipient: Option<String>) -> SignedMessage {
        let mut msg = SignedMessage {
            version: PROTOCOL_VERSION.to_string(),
            msg_type: msg_types::ERROR.to_string(),
            sender_id: self.peer_id().to_string(),
            recipient_id: recipient,
            session_id: None,
            sequence_num: None,
            payload: serde_json::json!({"code": 500, "message": "internal error"}),
            timestamp: Utc::now(),
            nonce: generate_nonce(),
            signature: None,
        };
        if let Err(e) = self.auth.sign_message(&mut msg) {
            error!(error = %e, "Failed to sign error response");
        }
        msg
    }

    async fn process(&self, frame: SignedMessage) -> MeshResult<MessageBody> {
        let authenticity = self.auth.verify_message(&frame)?;
        if let Some(recipient) = frame.recipient_id.as_deref() {
            if recipient != self.peer_id() {
                return Err(MeshError::PeerNotFound(format!("{recipient} is not served here")));
            }
        }
        if frame.session_id.is_some() && authenticity != Authenticity::Verified {
            return Err(MeshError::InvalidSignature);
        }

        let sender = frame.sender_id.as_str();
        match frame.body()? {
            MessageBody::Handshake(offer) => self.on_handshake(sender, authenticity, offer),
            MessageBody::Ping(ping) => Ok(self.on_ping(sender, authenticity, ping)),
            MessageBody::DhtStore(req) => {
                self.require_origin(sender, authenticity, &req.origin)?;
                let key = DhtKey::from_hex(&req.key)?;
                self.directory.backend().serve_store(&req.origin, key, req.record)?;
                Ok(MessageBody::Ack(AckPayload::default()))
            }
            MessageBody::DhtFindNode(req) => self.on_dht_find(sender, authenticity, req, false),
            MessageBody::DhtFindValue(req) => self.on_dht_find(sender, authenticity, req, true),
            MessageBody::SessionClose(close) => {
                if self
                    .sessions
                    .info(&close.session_id)
                    .is_some_and(|s| s.peer_id == sender && s.direction == Direction::Inbound)
                {
                    self.sessions.terminate(&close.session_id, &close.reason);
                }
                Ok(MessageBody::Ack(AckPayload::default()))
            }
            body @ (MessageBody::Deliver(_) | MessageBody::Chunk(_) | MessageBody::Encrypted(_)) => {
                self.on_session_payload(&frame, authenticity, body).await
            }
            MessageBody::Opaque { msg_type, .. } => Err(MeshError::UnknownMessageType(msg_type)),
            other => Err(MeshError::Serialization(format!(
                "'{}' is a response, not a request",
                other.msg_type()
            ))),
        }
    }

    fn on_handshake(
        &self,
        sender: &str,
        authenticity: Authenticity,
        offer: HandshakeOffer,
    ) -> MeshResult<MessageBody> {
        if authenticity != Authenticity::Verified {
            return Err(MeshError::HandshakeFailed("handshake must be signed".into()));
        }
        let identity = decode_public_key(&offer.identity_public_key)?;
        if peer_id_for(identity.as_bytes()) != sender {
            return Err(MeshError::HandshakeFailed(
                "identity key does not match sender".into(),
            ));
        }

        let accepted = self.sessions.accept_handshake(sender, &offer)?;
        if let Some(record) = offer.record {
            if record.peer_id == sender {
                let contact = record.contact();
                match self.directory.learn(record) {
                    Ok(()) => self.directory.backend().observe(&contact),
                    Err(e) => warn!(peer = %sender, error = %e, "Handshake carried a bad record"),
                }
            }
        }

        Ok(MessageBody::HandshakeAck(HandshakeAck {
            session_id: accepted.session_id,
            challenge: offer.challenge,
            ephemeral_public_key: accepted.ephemeral_public_key,
            supported_versions: self.sessions.supported_versions().to_vec(),
            selected_version: accepted.selected_version,
            capabilities: self.config.node.capabilities.clone(),
            e2e_enabled: accepted.e2e,
            identity_public_key: self.auth.keypair().public_key_b64(),
            authenticator: accepted.authenticator,
            record: self.local_record(),
        }))
    }

    fn on_ping(&self, sender: &str, authenticity: Authenticity, ping: PingPayload) -> MessageBody {
        if let Some(origin) = ping.origin {
            if authenticity == Authenticity::Verified
                && origin.peer_id == sender
                && origin.is_self_consistent()
            {
                self.directory.backend().observe(&origin);
            }
        }
        MessageBody::Pong(PongPayload {
            contact: self.contact(),
            uptime_secs: self.uptime_secs(),
        })
    }

    fn require_origin(&self, sender: &str, authenticity: Authenticity, origin: &Contact) -> MeshResult<()> {
        if authenticity != Authenticity::Verified
            || origin.peer_id != sender
            || !origin.is_self_consistent()
        {
            return Err(MeshError::InvalidSignature);
        }
        Ok(())
    }

    fn on_dht_find(
        &self,
        sender: &str,
        authenticity: Authenticity,
        req: DhtFindRequest,
        want_value: bool,
    ) -> MeshResult<MessageBody> {
        self.require_origin(sender, authenticity, &req.origin)?;
        let key = DhtKey::from_hex(&req.key)?;
        Ok(MessageBody::DhtResult(
            self.directory.backend().serve_find(&req.origin, &key, want_value),
        ))
    }

    async fn on_session_payload(
        &self,
        frame: &SignedMessage,
        authenticity: Authenticity,
        body: MessageBody,
    ) -> MeshResult<MessageBody> {
        let sender = frame.sender_id.as_str();
        let body = match (frame.session_id.as_deref(), frame.sequence_num) {
            (Some(session_id), Some(sequence)) => {
                self.sessions.validate_sequence(session_id, sender, sequence)?;
                match body {
                    MessageBody::Encrypted(sealed) => {
                        let plain = self.sessions.open(session_id, sequence, &sealed)?;
                        let inner: SealedBody = serde_json::from_slice(&plain)?;
                        inner.into_body()?
                    }
                    _ if self.sessions.is_encrypted(session_id) => {
                        warn!(peer = %sender, session = %session_id, "Plaintext on encrypted session");
                        self.sessions.terminate(session_id, "plaintext on encrypted session");
                        return Err(MeshError::DecryptionFailed);
                    }
                    plain => plain,
                }
            }
            (None, None) => {
                if matches!(body, MessageBody::Encrypted(_)) {
                    return Err(MeshError::SessionNotFound(
                        "encrypted frame outside a session".into(),
                    ));
                }
                body
            }
            _ => {
                return Err(MeshError::Serialization(
                    "session_id and sequence_num must be sent together".into(),
                ))
            }
        };

        let delivery = match body {
            MessageBody::Deliver(delivery) => delivery,
            MessageBody::Chunk(chunk) => match self.reassembler.accept(sender, &chunk)? {
                None => {
                    return Ok(MessageBody::Ack(AckPayload {
                        message_id: None,
                        reply: None,
                        complete: false,
                    }))
                }
                Some(bytes) => serde_json::from_slice::<Delivery>(&bytes)?,
            },
            other => {
                return Err(MeshError::Serialization(format!(
                    "'{}' cannot be carried in a session",
                    other.msg_type()
                )))
            }
        };

        self.dispatch(sender, authenticity, frame.session_id.clone(), delivery)
            .await
    }

    async fn dispatch(
        &self,
        sender: &str,
        authenticity: Authenticity,
        session_id: Option<String>,
        delivery: Delivery,
    ) -> MeshResult<MessageBody> {
        let delivery = delivery.decompress()?;
        let handler = self
            .handlers
            .get(&delivery.msg_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| MeshError::UnknownMessageType(delivery.msg_type.clone()))?;

        let message_id = delivery.message_id.clone();
        debug!(peer = %sender, msg_type = %delivery.msg_type, message = %message_id, "Dispatching delivery");
        let reply = handler
            .handle(InboundMessage {
                message_id: delivery.message_id,
                sender_id: sender.to_string(),
                msg_type: delivery.msg_type,
                payload: delivery.payload,
                authenticity,
                session_id,
            })
            .await?;
        Ok(MessageBody::Ack(AckPayload {
            message_id: Some(message_id),
            reply,
            complete: true,
        }))
    }
}

#[async_trait]
impl FrameHandler for MeshNode {
    async fn handle_frame(&self, frame: SignedMessage) -> SignedMessage {
        self.respond(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{MemoryDht, RecordStore};
    use crate::transport::MemoryTransport;

    fn pair(e2e: bool) -> (MemoryTransport, Arc<MeshNode>, Arc<MeshNode>) {
        let transport = MemoryTransport::new();
        let store = Arc::new(RecordStore::new());
        let mut config = MeshConfig::default();
        config.session.e2e_enabled = e2e;
        let make = |name: &str| {
            let node = MeshNode::with_backend(
                config.clone(),
                Keypair::generate(),
                name,
                Arc::new(transport.clone()),
                Arc::new(MemoryDht::shared(store.clone())),
            )
            .unwrap();
            transport.register(name, &node);
            node
        };
        let a = make("node-a");
        let b = make("node-b");
        (transport, a, b)
    }

    async fn record_of(node: &MeshNode) -> PeerRecord {
        node.directory().register_self().await.unwrap()
    }

    fn echo() -> Arc<dyn MessageHandler> {
        handler_fn(|msg: InboundMessage| async move { Ok(Some(msg.payload)) })
    }

    fn deliver(msg_type: &str, payload: Value) -> MessageBody {
        MessageBody::Deliver(Delivery {
            message_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            payload,
            compressed: false,
        })
    }

    #[tokio::test]
    async fn test_handshake_derives_same_key_on_both_sides() {
        let (_t, a, b) = pair(true);
        let rb = record_of(&b).await;
        let info = a.connect(&rb).await.unwrap();
        assert!(info.e2e);
        let fa = a.sessions().key_fingerprint(&info.session_id).unwrap();
        let fb = b.sessions().key_fingerprint(&info.session_id).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(
            b.sessions().lookup(a.peer_id(), Direction::Inbound).unwrap().session_id,
            info.session_id
        );
        // b learned a's record from the offer.
        assert!(b.directory().registry().get_peer(a.peer_id()).is_some());
    }

    #[tokio::test]
    async fn test_encrypted_delivery_reaches_handler() {
        let (_t, a, b) = pair(true);
        b.register_handler("echo", echo());
        let rb = record_of(&b).await;
        a.ensure_session(&rb).await.unwrap();
        let ack = a
            .send_on_session(&rb, deliver("echo", serde_json::json!({"q": "ping"})))
            .await
            .unwrap();
        assert!(ack.complete);
        assert_eq!(ack.reply.unwrap()["q"], "ping");
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported() {
        let (_t, a, b) = pair(false);
        let rb = record_of(&b).await;
        a.connect(&rb).await.unwrap();
        let err = a
            .send_on_session(&rb, deliver("nobody.home", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownMessageType(_)));
        // Not a session-breaking error.
        assert!(a.sessions().established(b.peer_id()).is_some());
    }

    #[tokio::test]
    async fn test_handshake_to_offline_peer_reverts() {
        let (t, a, b) = pair(true);
        let rb = record_of(&b).await;
        t.set_offline("node-b", true);
        let err = a.connect(&rb).await.unwrap_err();
        assert!(matches!(err, MeshError::PeerUnreachable(_)));
        assert!(a.sessions().lookup(b.peer_id(), Direction::Outbound).is_none());
    }

    #[tokio::test]
    async fn test_unsigned_frame_rejected() {
        let (_t, a, b) = pair(false);
        let frame = SignedMessage::new(a.peer_id(), None, &deliver("echo", Value::Null)).unwrap();
        let response = b.handle_frame(frame).await;
        match response.body().unwrap() {
            MessageBody::Error(e) => assert_eq!(e.code, 401),
            other => panic!("Expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_legacy_frame_flagged() {
        let transport = MemoryTransport::new();
        let mut config = MeshConfig::default();
        config.security.allow_unsigned_legacy = true;
        let b = MeshNode::with_backend(
            config,
            Keypair::generate(),
            "node-b",
            Arc::new(transport),
            Arc::new(MemoryDht::new()),
        )
        .unwrap();
        b.register_handler(
            "legacy",
            handler_fn(|msg: InboundMessage| async move {
                Ok(Some(serde_json::json!(msg.authenticity == Authenticity::UnsignedLegacy)))
            }),
        );
        let frame = SignedMessage::new("old-peer", None, &deliver("legacy", Value::Null)).unwrap();
        match b.handle_frame(frame).await.body().unwrap() {
            MessageBody::Ack(ack) => assert_eq!(ack.reply, Some(serde_json::json!(true))),
            other => panic!("Expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_for_someone_else_rejected() {
        let (_t, a, b) = pair(false);
        // Introduce a to b first so the signature itself is accepted.
        a.connect(&record_of(&b).await).await.unwrap();
        let frame = a
            .auth()
            .envelope(Some("f".repeat(64)), &deliver("echo", Value::Null), None)
            .unwrap();
        match b.handle_frame(frame).await.body().unwrap() {
            MessageBody::Error(e) => assert_eq!(e.code, 404),
            other => panic!("Expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_session_removes_both_ends() {
        let (_t, a, b) = pair(false);
        let rb = record_of(&b).await;
        a.connect(&rb).await.unwrap();
        a.close_session(&rb, "done").await.unwrap();
        assert!(a.sessions().lookup(b.peer_id(), Direction::Outbound).is_none());
        assert!(b.sessions().lookup(a.peer_id(), Direction::Inbound).is_none());
    }
}
