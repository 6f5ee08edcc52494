//! Out-of-band delivery of large response bodies.
//!
//! The producer writes a 4-byte little-endian length, that many bytes of JSON
//! metadata (`{"status": .., "headers": {..}}`), then the raw body until it
//! closes its end. Conduits are keyed by streaming id and live in a registry
//! with its own lock.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tracing::debug;

use crate::error::StreamError;
use crate::protocol::Headers;

/// In-memory buffer between the ingesting producer and the waiting consumer.
pub const CONDUIT_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata records larger than this are rejected.
pub const MAX_METADATA_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
}

/// Builds the length-prefixed metadata header that precedes a streamed body.
pub fn encode_header(metadata: &StreamMetadata) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(metadata)?;
    let mut header = BytesMut::with_capacity(4 + json.len());
    header.put_u32_le(json.len() as u32);
    header.put_slice(&json);
    Ok(header.freeze())
}

/// Reads the length-prefixed metadata header, leaving `reader` positioned at
/// the first body byte.
pub async fn read_metadata<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StreamMetadata, StreamError> {
    let len = reader.read_u32_le().await.map_err(StreamError::Truncated)?;
    if len > MAX_METADATA_SIZE {
        return Err(StreamError::MetadataTooLarge(len));
    }
    let mut json = vec![0; len as usize];
    reader
        .read_exact(&mut json)
        .await
        .map_err(StreamError::Truncated)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Registry of open conduits, keyed by streaming id.
#[derive(Default)]
pub struct StreamRegistry {
    producers: Mutex<HashMap<String, DuplexStream>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DuplexStream>> {
        self.producers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Opens a conduit for `id` and returns its consuming end.
    ///
    /// The conduit is deregistered when the consumer is dropped.
    pub fn open(self: &Arc<Self>, id: impl Into<String>) -> StreamConsumer {
        let id = id.into();
        let (producer, consumer) = tokio::io::duplex(CONDUIT_BUFFER_SIZE);
        self.lock().insert(id.clone(), producer);
        StreamConsumer {
            id,
            reader: consumer,
            registry: Arc::clone(self),
        }
    }

    /// Claims the producing end of `id`. Each conduit has a single producer,
    /// so a second claim returns `None`.
    pub fn take_producer(&self, id: &str) -> Option<DuplexStream> {
        self.lock().remove(id)
    }

    /// Closes the conduit if it is still registered. Safe to call repeatedly.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!(streaming_id = %id, "Closed unclaimed stream conduit");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consuming end of a conduit.
pub struct StreamConsumer {
    id: String,
    reader: DuplexStream,
    registry: Arc<StreamRegistry>,
}

impl StreamConsumer {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl AsyncRead for StreamConsumer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
