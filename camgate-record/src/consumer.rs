// Consumer adapter: bridges one recording session to its stream source.
//
// Attach retries on a fixed backoff. A camera that is offline at boot
// must eventually be recorded without operator action, so the default is
// to retry forever; a configured attempt cap turns that into a bounded
// policy. After attach, a single transfer task is the sole writer into
// the ring. Ring switch events arrive over a channel and flip the
// consumer's header flag; the subscription itself is never replaced, so
// no samples are lost around rotations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::muxer::HeaderCachingConsumer;
use crate::ring::SegmentRing;
use crate::source::{
    ChunkSink, ConsumerInfo, StreamConsumer, StreamSource, TrackFilter, CHUNK_CHANNEL_CAPACITY,
};

#[derive(Debug, Clone)]
pub struct AdapterPolicy {
    /// Fixed delay between attach attempts.
    pub backoff: Duration,
    /// Attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for AdapterPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

pub struct ConsumerAdapter {
    inner: Arc<AdapterInner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct AdapterInner {
    stream_name: String,
    filter: TrackFilter,
    source: Arc<dyn StreamSource>,
    ring: Arc<SegmentRing>,
    policy: AdapterPolicy,
    cancel: CancellationToken,
}

impl ConsumerAdapter {
    /// Spawn the attach/transfer cycle. Returns immediately; attach
    /// failures never block the caller.
    pub fn start(
        stream_name: impl Into<String>,
        filter: TrackFilter,
        source: Arc<dyn StreamSource>,
        ring: Arc<SegmentRing>,
        policy: AdapterPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let inner = Arc::new(AdapterInner {
            stream_name: stream_name.into(),
            filter,
            source,
            ring,
            policy,
            cancel,
        });

        let task = tokio::spawn(run(Arc::clone(&inner)));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// End the transfer task and remove the consumer from the source.
    /// Used when superseding an adapter or shutting the session down,
    /// never on ordinary rotations.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(stream = %self.inner.stream_name, "adapter task ended abnormally: {e}");
            }
        }
    }
}

async fn run(inner: Arc<AdapterInner>) {
    let Some(consumer) = attach(&inner).await else {
        return;
    };

    // Rotation -> header reset, off the rotation task.
    let mut switch_rx = inner.ring.subscribe_switch();
    let reset_cancel = inner.cancel.child_token();
    let reset_task = {
        let consumer = Arc::clone(&consumer);
        let cancel = reset_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = switch_rx.recv() => match event {
                        Ok(_) => consumer.reset_header(),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "switch events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    };

    info!(stream = %inner.stream_name, "transfer started");
    let sink = Arc::clone(&inner.ring) as Arc<dyn ChunkSink>;
    let result = tokio::select! {
        () = inner.cancel.cancelled() => {
            consumer.stop().await;
            Ok(0)
        }
        r = consumer.transfer_to(sink) => r,
    };
    match result {
        Ok(bytes) => info!(stream = %inner.stream_name, bytes, "transfer ended"),
        Err(e) => warn!(stream = %inner.stream_name, "transfer ended: {e}"),
    }

    inner.source.remove_consumer(consumer.info().id).await;
    reset_cancel.cancel();
    if let Err(e) = reset_task.await {
        warn!(stream = %inner.stream_name, "reset listener ended abnormally: {e}");
    }
}

/// Attach with fixed backoff. Returns `None` when cancelled or when the
/// configured attempt cap is reached.
async fn attach(inner: &AdapterInner) -> Option<Arc<HeaderCachingConsumer>> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let info = ConsumerInfo::new(inner.stream_name.clone(), inner.filter);
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        match inner.source.add_consumer(info.clone(), tx).await {
            Ok(()) => {
                info!(stream = %inner.stream_name, attempt, "recording consumer attached");
                return Some(Arc::new(HeaderCachingConsumer::new(info, rx)));
            }
            Err(e) => {
                warn!(
                    stream = %inner.stream_name,
                    attempt,
                    "failed to add recording consumer: {e}"
                );
                if let Some(max) = inner.policy.max_attempts {
                    if attempt >= max {
                        error!(stream = %inner.stream_name, "giving up after {max} attach attempts");
                        return None;
                    }
                }
                tokio::select! {
                    () = inner.cancel.cancelled() => return None,
                    () = time::sleep(inner.policy.backoff) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{Clock, RingOptions};
    use crate::source::{ChunkSender, SourceError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use tempfile::tempdir;
    use uuid::Uuid;

    /// Source that rejects the first `fail_first` attach attempts, then
    /// hands chunks from the test to the registered consumer.
    struct FlakySource {
        fail_first: u32,
        attempts: AtomicU32,
        removed: AtomicU32,
        sender: parking_lot::Mutex<Option<ChunkSender>>,
    }

    impl FlakySource {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                attempts: AtomicU32::new(0),
                removed: AtomicU32::new(0),
                sender: parking_lot::Mutex::new(None),
            })
        }

        async fn publish(&self, chunk: &'static [u8]) {
            let sender = self.sender.lock().clone().expect("consumer attached");
            sender.send(Bytes::from_static(chunk)).await.expect("send");
        }
    }

    #[async_trait]
    impl StreamSource for FlakySource {
        async fn add_consumer(
            &self,
            info: ConsumerInfo,
            sender: ChunkSender,
        ) -> Result<(), SourceError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                return Err(SourceError::Offline(info.stream_name));
            }
            *self.sender.lock() = Some(sender);
            Ok(())
        }

        async fn remove_consumer(&self, _id: Uuid) {
            self.removed.fetch_add(1, Ordering::SeqCst);
            *self.sender.lock() = None;
        }
    }

    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let shared = Arc::clone(&offset);
        let clock: Clock = Arc::new(move || {
            Utc.timestamp_opt(1_767_614_400 + shared.load(Ordering::SeqCst), 0)
                .single()
                .expect("valid timestamp")
        });
        (clock, offset)
    }

    async fn ring_in(dir: &std::path::Path) -> (Arc<SegmentRing>, Arc<AtomicI64>) {
        let (clock, ticks) = manual_clock();
        let ring = SegmentRing::open(
            RingOptions::new(dir, 3, Duration::from_secs(10)).with_clock(clock),
        )
        .await
        .expect("open ring");
        (ring, ticks)
    }

    fn policy(backoff_ms: u64, max_attempts: Option<u32>) -> AdapterPolicy {
        AdapterPolicy {
            backoff: Duration::from_millis(backoff_ms),
            max_attempts,
        }
    }

    fn read_files_sorted(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| {
                (
                    e.file_name().to_string_lossy().into_owned(),
                    std::fs::read(e.path()).expect("read file"),
                )
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_attach_retries_then_transfers_once() {
        let tmp = tempdir().expect("tempdir");
        let (ring, _ticks) = ring_in(tmp.path()).await;
        ring.advance().await;

        let source = FlakySource::new(2);
        let started = std::time::Instant::now();
        let adapter = ConsumerAdapter::start(
            "cam1",
            TrackFilter::All,
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&ring),
            policy(50, None),
            CancellationToken::new(),
        );

        // Two failures, each followed by the fixed backoff.
        while source.sender.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(started.elapsed() < Duration::from_secs(2), "attach never succeeded");
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);

        source.publish(b"init").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let files = read_files_sorted(tmp.path());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, b"init");

        adapter.stop().await;
        assert_eq!(source.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_gives_up_at_configured_cap() {
        let tmp = tempdir().expect("tempdir");
        let (ring, _ticks) = ring_in(tmp.path()).await;

        let source = FlakySource::new(u32::MAX);
        let adapter = ConsumerAdapter::start(
            "cam1",
            TrackFilter::All,
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&ring),
            policy(10, Some(3)),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_rotation_resets_header_without_reattach() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = ring_in(tmp.path()).await;
        ring.advance().await;

        let source = FlakySource::new(0);
        let adapter = ConsumerAdapter::start(
            "cam1",
            TrackFilter::All,
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&ring),
            policy(10, None),
            CancellationToken::new(),
        );

        while source.sender.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        source.publish(b"init|").await;
        source.publish(b"frame-a|").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        source.publish(b"frame-b|").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let files = read_files_sorted(tmp.path());
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].1, b"init|frame-a|");
        // New segment starts with the re-emitted header: independently playable.
        assert_eq!(files[1].1, b"init|frame-b|");

        // One attach for the whole run: rotations never re-subscribe.
        assert_eq!(source.attempts.load(Ordering::SeqCst), 1);

        adapter.stop().await;
        assert_eq!(source.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_cleanly() {
        let tmp = tempdir().expect("tempdir");
        let (ring, _ticks) = ring_in(tmp.path()).await;

        let source = FlakySource::new(u32::MAX);
        let cancel = CancellationToken::new();
        let adapter = ConsumerAdapter::start(
            "cam1",
            TrackFilter::All,
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&ring),
            policy(60_000, None),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter.stop().await;
        // Never attached, so there is nothing to remove.
        assert_eq!(source.removed.load(Ordering::SeqCst), 0);
    }
}
