//! agentmesh wire protocol: secure peer-to-peer messaging between agents.
//!
//! Every frame is signed with the sender's Ed25519 key and checked against a
//! replay window. Peers open encrypted sessions (X25519 + HKDF + AES-256-GCM)
//! with strictly ordered sequence numbers, large payloads are chunked, and
//! sends are throttled per priority class.
//!
//! ## Architecture
//!
//! - **MeshNode**: local endpoint; answers frames and opens sessions
//! - **Router**: direct, broadcast, multicast and anycast delivery with dedup
//! - **PeerDirectory**: signed peer records over a Kademlia DHT plus a local registry
//! - **Transport**: TCP or in-process request/response exchange
//! - **Maintenance**: periodic sweeps and congestion monitoring

pub mod auth;
pub mod chunking;
pub mod crypto;
pub mod dedup;
pub mod dht;
pub mod directory;
pub mod flow;
pub mod identity;
pub mod kademlia;
pub mod maintenance;
pub mod message;
pub mod node;
pub mod record;
pub mod registry;
pub mod replay;
pub mod router;
pub mod session;
pub mod transport;

pub use auth::{Authenticator, Authenticity};
pub use directory::PeerDirectory;
pub use flow::{FlowController, Priority};
pub use identity::{peer_id_for, Keypair};
pub use maintenance::Maintenance;
pub use message::{MessageBody, SignedMessage};
pub use node::{handler_fn, InboundMessage, MeshNode, MessageHandler};
pub use record::{Contact, PeerRecord, PeerSummary};
pub use router::{AnycastTarget, DeliveryReport, DeliveryStrategy, OutboundMessage, Router};
pub use session::{Direction, SessionInfo, SessionState};
pub use transport::{MemoryTransport, TcpTransport, Transport};
