//! Splitting oversized deliveries into chunks and reassembling them.
//!
//! Incomplete buffers are never delivered. Once a buffer is older than the
//! configured maximum age it is dropped, whether or not more fragments are
//! still on the way.
//!
//! Memory held for one sender is bounded: a fragment may not exceed the
//! configured chunk size, a buffer may not grow past the payload limit, and a
//! sender may only keep a fixed number of buffers open.

use crate::message::ChunkEnvelope;
use agentmesh_types::config::ChunkingConfig;
use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Split `payload` into ordered fragments of at most `chunk_size` bytes.
///
/// An empty payload still yields one (empty) chunk.
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<ChunkEnvelope> {
    let chunk_size = chunk_size.max(1);
    let chunk_id = uuid::Uuid::new_v4().to_string();
    let parts: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };
    let total_chunks = parts.len() as u32;
    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| ChunkEnvelope {
            chunk_id: chunk_id.clone(),
            index: index as u32,
            total_chunks,
            data: BASE64.encode(part),
        })
        .collect()
}

/// Fragments received so far for one chunked payload.
#[derive(Debug)]
pub struct ChunkBuffer {
    pub chunk_id: String,
    pub total_chunks: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
    pub created_at: DateTime<Utc>,
}

impl ChunkBuffer {
    fn new(chunk_id: String, total_chunks: u32, now: DateTime<Utc>) -> Self {
        Self {
            chunk_id,
            total_chunks,
            parts: BTreeMap::new(),
            bytes: 0,
            created_at: now,
        }
    }

    /// Every index in `[0, total_chunks)` is present.
    pub fn is_complete(&self) -> bool {
        self.parts.len() as u64 == self.total_chunks as u64
            && self.parts.keys().all(|i| *i < self.total_chunks)
    }

    pub fn received(&self) -> usize {
        self.parts.len()
    }

    /// Bytes held so far.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn assemble(self) -> Vec<u8> {
        let len = self.parts.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for part in self.parts.into_values() {
            out.extend_from_slice(&part);
        }
        out
    }
}

/// Concurrent reassembly table keyed by `(sender_id, chunk_id)`.
#[derive(Debug)]
pub struct Reassembler {
    buffers: DashMap<(String, String), ChunkBuffer>,
    max_age: Duration,
    max_chunks: u32,
    max_fragment_bytes: usize,
    max_payload_bytes: usize,
    max_pending_per_sender: usize,
}

impl Reassembler {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            buffers: DashMap::new(),
            max_age: Duration::seconds(config.buffer_max_age_secs.min(i64::MAX as u64) as i64),
            max_chunks: config.max_chunks,
            max_fragment_bytes: config.chunk_size_bytes,
            max_payload_bytes: config.max_payload_bytes,
            max_pending_per_sender: config.max_pending_per_sender,
        }
    }

    fn pending_for(&self, sender_id: &str) -> usize {
        self.buffers.iter().filter(|e| e.key().0 == sender_id).count()
    }

    /// Accept one fragment. Returns the full payload once the last one arrives.
    pub fn accept(&self, sender_id: &str, chunk: &ChunkEnvelope) -> MeshResult<Option<Vec<u8>>> {
        self.accept_at(sender_id, chunk, Utc::now())
    }

    pub fn accept_at(
        &self,
        sender_id: &str,
        chunk: &ChunkEnvelope,
        now: DateTime<Utc>,
    ) -> MeshResult<Option<Vec<u8>>> {
        if chunk.total_chunks == 0 || chunk.total_chunks > self.max_chunks {
            return Err(MeshError::Serialization(format!(
                "chunk {}: total_chunks {} outside 1..={}",
                chunk.chunk_id, chunk.total_chunks, self.max_chunks
            )));
        }
        if chunk.index >= chunk.total_chunks {
            return Err(MeshError::Serialization(format!(
                "chunk {}: index {} >= total {}",
                chunk.chunk_id, chunk.index, chunk.total_chunks
            )));
        }
        let data = BASE64.decode(&chunk.data).map_err(|e| {
            MeshError::Serialization(format!("chunk {}: invalid base64: {e}", chunk.chunk_id))
        })?;
        if data.len() > self.max_fragment_bytes {
            warn!(
                sender = %sender_id,
                chunk_id = %chunk.chunk_id,
                size = data.len(),
                "Oversized chunk fragment"
            );
            return Err(MeshError::MessageTooLarge {
                size: data.len() as u64,
                max: self.max_fragment_bytes as u64,
            });
        }

        let key = (sender_id.to_string(), chunk.chunk_id.clone());
        // Counted before taking the entry lock; iterating while holding a
        // shard guard would deadlock.
        if !self.buffers.contains_key(&key)
            && self.pending_for(sender_id) >= self.max_pending_per_sender
        {
            warn!(
                sender = %sender_id,
                chunk_id = %chunk.chunk_id,
                limit = self.max_pending_per_sender,
                "Too many open chunk buffers"
            );
            return Err(MeshError::RateLimited(format!(
                "{sender_id} has {} chunked payloads in flight",
                self.max_pending_per_sender
            )));
        }
        let mut buffer = match self.buffers.entry(key) {
            Entry::Occupied(existing) => existing,
            Entry::Vacant(slot) => slot.insert_entry(ChunkBuffer::new(
                chunk.chunk_id.clone(),
                chunk.total_chunks,
                now,
            )),
        };

        if now - buffer.get().created_at > self.max_age {
            let chunk_id = chunk.chunk_id.clone();
            buffer.remove();
            warn!(sender = %sender_id, chunk_id = %chunk_id, "Chunk arrived for stale buffer");
            return Err(MeshError::ChunkTimeout(chunk_id));
        }
        if buffer.get().total_chunks != chunk.total_chunks {
            return Err(MeshError::Serialization(format!(
                "chunk {}: total_chunks changed from {} to {}",
                chunk.chunk_id,
                buffer.get().total_chunks,
                chunk.total_chunks
            )));
        }

        if !buffer.get().parts.contains_key(&chunk.index) {
            let held = buffer.get().bytes + data.len();
            if held > self.max_payload_bytes {
                let chunk_id = chunk.chunk_id.clone();
                buffer.remove();
                warn!(sender = %sender_id, chunk_id = %chunk_id, held, "Chunked payload too large");
                return Err(MeshError::MessageTooLarge {
                    size: held as u64,
                    max: self.max_payload_bytes as u64,
                });
            }
            let slot = buffer.get_mut();
            slot.bytes = held;
            slot.parts.insert(chunk.index, data);
        }
        if !buffer.get().is_complete() {
            debug!(
                sender = %sender_id,
                chunk_id = %chunk.chunk_id,
                received = buffer.get().received(),
                total = chunk.total_chunks,
                "Buffered chunk"
            );
            return Ok(None);
        }

        let (_, complete) = buffer.remove_entry();
        debug!(sender = %sender_id, chunk_id = %chunk.chunk_id, "Chunked payload reassembled");
        Ok(Some(complete.assemble()))
    }

    /// Drop buffers older than the maximum age. Returns their chunk ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut dropped = Vec::new();
        self.buffers.retain(|(sender, chunk_id), buffer| {
            let stale = now - buffer.created_at > self.max_age;
            if stale {
                warn!(
                    sender = %sender,
                    chunk_id = %chunk_id,
                    received = buffer.received(),
                    total = buffer.total_chunks,
                    "Dropping incomplete chunk buffer"
                );
                dropped.push(chunk_id.clone());
            }
            !stale
        });
        dropped
    }

    /// Number of incomplete buffers.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
