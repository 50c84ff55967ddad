// The consumed stream-source contract.
//
// A stream source is anything that can fan encoded media out to registered
// consumers: the in-process hub here, or a remote transport elsewhere in
// the gateway. Consumers receive chunks over a bounded channel; a full
// channel drops chunks rather than backpressuring the source.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RecordError;

pub type ChunkSender = mpsc::Sender<Bytes>;
pub type ChunkReceiver = mpsc::Receiver<Bytes>;

/// Default capacity for consumer chunk channels. Large enough for normal
/// operation; when full, new chunks are dropped for that consumer.
pub const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Which tracks of a stream a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackFilter {
    All,
    VideoOnly,
    AudioOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub id: Uuid,
    pub stream_name: String,
    pub filter: TrackFilter,
}

impl ConsumerInfo {
    #[must_use]
    pub fn new(stream_name: impl Into<String>, filter: TrackFilter) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_name: stream_name.into(),
            filter,
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("stream is offline: {0}")]
    Offline(String),

    #[error("consumer already registered: {0}")]
    AlreadyRegistered(Uuid),

    #[error("source disconnected")]
    Disconnected,
}

/// Write sink for a consumer's transfer loop. Implemented by the segment
/// ring; kept as a seam so transfer loops can be exercised against fakes.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, chunk: Bytes) -> Result<usize, RecordError>;
}

/// A live, named media stream that accepts subscriber consumers.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Register a consumer's chunk channel. Chunks flow until the consumer
    /// is removed or the channel is dropped.
    async fn add_consumer(&self, info: ConsumerInfo, sender: ChunkSender)
        -> Result<(), SourceError>;

    async fn remove_consumer(&self, id: Uuid);
}

/// A subscriber that pulls encoded chunks and delivers them to a sink.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    fn info(&self) -> &ConsumerInfo;

    /// Pump chunks into `sink` until stopped or the source disconnects.
    /// Blocks for the lifetime of the subscription; returns bytes written.
    async fn transfer_to(&self, sink: Arc<dyn ChunkSink>) -> Result<u64, SourceError>;

    /// Restart container-header generation on the next output without
    /// tearing down the subscription.
    fn reset_header(&self);

    async fn stop(&self);
}
