// In-process live stream hub.
//
// Named streams fan encoded chunks out to registered consumers over
// bounded channels. The transport layer publishes into a stream and flips
// it online; consumers whose channels fill up lose chunks rather than
// backpressuring the publisher, and consumers whose channels close are
// dropped on the next publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::source::{ChunkSender, ConsumerInfo, SourceError, StreamSource};

pub struct LiveStreamHub {
    streams: DashMap<String, Arc<LiveStream>>,
}

impl LiveStreamHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str, url: &str) -> Arc<LiveStream> {
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LiveStream::new(name, url)))
            .clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<LiveStream>> {
        self.streams.get(name).map(|s| Arc::clone(&s))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for LiveStreamHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LiveStream {
    name: String,
    url: String,
    online: AtomicBool,
    consumers: DashMap<Uuid, ChunkSender>,
}

impl LiveStream {
    fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            online: AtomicBool::new(false),
            consumers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Transport layer marks the stream producible/unproducible.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Fan one chunk out to every registered consumer. `Bytes` clones are
    /// reference-counted, so fan-out never copies payloads.
    pub fn publish(&self, chunk: &Bytes) {
        self.consumers.retain(|id, sender| {
            match sender.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this chunk for it, keep the rest flowing.
                    trace!(stream = %self.name, consumer = %id, "consumer channel full, chunk dropped");
                    true
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                    debug!(stream = %self.name, consumer = %id, "consumer gone, removing");
                    false
                }
            }
        });
    }
}

#[async_trait]
impl StreamSource for LiveStream {
    async fn add_consumer(
        &self,
        info: ConsumerInfo,
        sender: ChunkSender,
    ) -> Result<(), SourceError> {
        if !self.is_online() {
            return Err(SourceError::Offline(self.name.clone()));
        }
        if self.consumers.contains_key(&info.id) {
            return Err(SourceError::AlreadyRegistered(info.id));
        }
        debug!(stream = %self.name, consumer = %info.id, filter = ?info.filter, "consumer added");
        self.consumers.insert(info.id, sender);
        Ok(())
    }

    async fn remove_consumer(&self, id: Uuid) {
        if self.consumers.remove(&id).is_none() {
            warn!(stream = %self.name, consumer = %id, "removing unknown consumer");
        }
    }
}
