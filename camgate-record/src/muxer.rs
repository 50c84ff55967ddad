// Header-caching consumer: the recording side of the opaque multiplexer.
//
// Container internals live elsewhere in the gateway; for recording, what
// matters is that every segment file starts independently playable. The
// first chunk of a stream is its container init section; this consumer
// caches it and re-emits it after a header reset, the same way cached
// prior data is replayed to a late subscriber.
//
// A header reset is an internal flag consumed by the transfer loop on its
// next chunk; nothing is torn down and no subscription is replaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::{ChunkReceiver, ChunkSink, ConsumerInfo, SourceError, StreamConsumer};

pub struct HeaderCachingConsumer {
    info: ConsumerInfo,
    rx: Mutex<ChunkReceiver>,
    header: parking_lot::Mutex<Option<Bytes>>,
    reset_pending: AtomicBool,
    stop: CancellationToken,
}

impl HeaderCachingConsumer {
    #[must_use]
    pub fn new(info: ConsumerInfo, rx: ChunkReceiver) -> Self {
        Self {
            info,
            rx: Mutex::new(rx),
            header: parking_lot::Mutex::new(None),
            reset_pending: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    /// Decide what precedes `chunk` on the way out: the cached header if a
    /// reset is pending, nothing otherwise. The first chunk ever seen IS
    /// the header and only gets cached.
    fn header_to_emit(&self, chunk: &Bytes) -> Option<Bytes> {
        let mut header = self.header.lock();
        if header.is_none() {
            *header = Some(chunk.clone());
            self.reset_pending.store(false, Ordering::Release);
            return None;
        }
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            return header.clone();
        }
        None
    }
}

#[async_trait]
impl StreamConsumer for HeaderCachingConsumer {
    fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    async fn transfer_to(&self, sink: Arc<dyn ChunkSink>) -> Result<u64, SourceError> {
        let mut rx = self.rx.lock().await;
        let mut written = 0u64;

        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    debug!(consumer = %self.info.id, "transfer stopped");
                    return Ok(written);
                }
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else {
                        debug!(consumer = %self.info.id, "source channel closed");
                        return Err(SourceError::Disconnected);
                    };

                    if let Some(header) = self.header_to_emit(&chunk) {
                        match sink.write_chunk(header).await {
                            Ok(n) => written += n as u64,
                            Err(e) => {
                                warn!(consumer = %self.info.id, "header write failed: {e}");
                            }
                        }
                    }

                    match sink.write_chunk(chunk).await {
                        Ok(n) => written += n as u64,
                        // The sink may have no open segment for this window;
                        // recording resumes at the next rotation.
                        Err(e) => warn!(consumer = %self.info.id, "chunk dropped: {e}"),
                    }
                }
            }
        }
    }

    fn reset_header(&self) {
        self.reset_pending.store(true, Ordering::Release);
    }

    async fn stop(&self) {
        self.stop.cancel();
    }
}
