//! Request/response transports.
//!
//! Every request frame gets exactly one response frame. [`TcpTransport`] opens
//! a connection per exchange and speaks length-prefixed JSON; [`serve`] is the
//! matching accept loop. [`MemoryTransport`] routes frames between nodes in
//! the same process, still going through the frame codec.

use crate::message::{decode_frame, decode_length, encode_frame, SignedMessage, MAX_FRAME_SIZE};
use agentmesh_types::{MeshError, MeshResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sends one frame to an endpoint and returns the peer's response frame.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, endpoint: &str, frame: &SignedMessage) -> MeshResult<SignedMessage>;
}

/// Produces the response to an inbound frame.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, frame: SignedMessage) -> SignedMessage;
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_frame<W>(writer: &mut W, msg: &SignedMessage) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message. `Ok(None)` means the peer closed the stream
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> MeshResult<Option<SignedMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MeshError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::MessageTooLarge {
            size: len as u64,
            max: MAX_FRAME_SIZE as u64,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_frame(&body).map(Some)
}

/// TCP transport: one connection per exchange, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, endpoint: &str, frame: &SignedMessage) -> MeshResult<SignedMessage> {
        let stream = TcpStream::connect(endpoint).await?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, frame).await?;
        read_frame(&mut reader)
            .await?
            .ok_or_else(|| MeshError::PeerUnreachable(format!("{endpoint}: connection closed")))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, endpoint: &str, frame: &SignedMessage) -> MeshResult<SignedMessage> {
        match tokio::time::timeout(self.timeout, self.exchange(endpoint, frame)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(MeshError::Io(e))) => Err(MeshError::PeerUnreachable(format!("{endpoint}: {e}"))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MeshError::PeerUnreachable(format!(
                "{endpoint}: no response within {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Listening for peers");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(remote = %addr, "Accepted connection");
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = connection_loop(stream, addr, &*handler).await {
                            debug!(remote = %addr, error = %e, "Connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Listener stopped");
                    return;
                }
            }
        }
    }
}

async fn connection_loop(
    stream: TcpStream,
    addr: SocketAddr,
    handler: &dyn FrameHandler,
) -> MeshResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(remote = %addr, error = %e, "Dropping connection after bad frame");
                return Err(e);
            }
        };
        let response = handler.handle_frame(frame).await;
        write_frame(&mut writer, &response).await?;
    }
}

/// In-process transport keyed by endpoint name.
///
/// Handlers are held weakly so a node registered here can still be dropped.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    endpoints: Arc<DashMap<String, Weak<dyn FrameHandler>>>,
    offline: Arc<DashMap<String, ()>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: FrameHandler + 'static>(&self, endpoint: impl Into<String>, handler: &Arc<H>) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let weak: Weak<dyn FrameHandler> = weak;
        self.endpoints.insert(endpoint.into(), weak);
    }

    pub fn unregister(&self, endpoint: &str) {
        self.endpoints.remove(endpoint);
    }

    /// Make an endpoint refuse every request until brought back.
    pub fn set_offline(&self, endpoint: &str, offline: bool) {
        if offline {
            self.offline.insert(endpoint.to_string(), ());
        } else {
            self.offline.remove(endpoint);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, endpoint: &str, frame: &SignedMessage) -> MeshResult<SignedMessage> {
        if self.offline.contains_key(endpoint) {
            return Err(MeshError::PeerUnreachable(format!("{endpoint}: offline")));
        }
        let handler = self
            .endpoints
            .get(endpoint)
            .and_then(|h| h.value().upgrade())
            .ok_or_else(|| MeshError::PeerUnreachable(format!("{endpoint}: no such endpoint")))?;

        let bytes = encode_frame(frame)?;
        let inbound = decode_frame(&bytes[4..])?;
        let response = handler.handle_frame(inbound).await;
        let bytes = encode_frame(&response)?;
        decode_frame(&bytes[4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, PingPayload};

    /// Answers every frame with itself, sender swapped.
    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle_frame(&self, mut frame: SignedMessage) -> SignedMessage {
            frame.sender_id = "echo".to_string();
            frame
        }
    }

    fn ping() -> SignedMessage {
        SignedMessage::new("client", None, &MessageBody::Ping(PingPayload::default())).unwrap()
    }

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let transport = MemoryTransport::new();
        let echo = Arc::new(Echo);
        transport.register("node-a", &echo);
        let response = transport.request("node-a", &ping()).await.unwrap();
        assert_eq!(response.sender_id, "echo");
    }

    #[tokio::test]
    async fn test_memory_transport_offline_and_unknown() {
        let transport = MemoryTransport::new();
        let echo = Arc::new(Echo);
        transport.register("node-a", &echo);
        transport.set_offline("node-a", true);
        assert!(matches!(
            transport.request("node-a", &ping()).await,
            Err(MeshError::PeerUnreachable(_))
        ));
        transport.set_offline("node-a", false);
        assert!(transport.request("node-a", &ping()).await.is_ok());
        assert!(matches!(
            transport.request("node-b", &ping()).await,
            Err(MeshError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unreachable() {
        let transport = MemoryTransport::new();
        let echo = Arc::new(Echo);
        transport.register("node-a", &echo);
        drop(echo);
        assert!(matches!(
            transport.request("node-a", &ping()).await,
            Err(MeshError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::new(Echo), rx));

        let transport = TcpTransport::new(Duration::from_secs(5));
        let response = transport.request(&addr.to_string(), &ping()).await.unwrap();
        assert_eq!(response.sender_id, "echo");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let transport = TcpTransport::new(Duration::from_secs(2));
        let err = transport
            .request(&format!("127.0.0.1:{port}"), &ping())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, MeshError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_clean_close_reads_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }
}
