// Segment ring: a fixed-size circular set of on-disk segment slots.
//
// Rotation protocol:
// - One fixed-interval timer task per ring calls advance(); the first tick
//   opens the initial segment.
// - advance() pre-opens the next file OUTSIDE the ring lock, then swaps it
//   in under the lock; the lock is held only across the index update and
//   handle swap. Deleting the reclaimed slot's old file goes through a
//   supervised cleanup worker so slow filesystems never delay rotation.
// - write() tries the lock without blocking. If a rotation holds it, the
//   writer falls back to the previous slot under a blocking acquisition:
//   a few trailing bytes may land one slot behind the nominal boundary,
//   which keeps the live transfer loop from ever stalling on rotation.
//   This is the one sanctioned locking policy for the write path.
//
// Slot handles stay open until their slot comes around again, so the
// previous-slot fallback always has an open file to land in. Reclaiming a
// slot drops the old handle before its file is removed; ownership makes a
// double-close impossible.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RecordError, Result};
use crate::naming::SegmentWindow;
use crate::source::ChunkSink;

/// Capacity of the switch-notification channel; consumers that lag simply
/// miss intermediate rotations.
const SWITCH_CHANNEL_CAPACITY: usize = 16;

/// Wall clock used for segment naming. Injectable so rotation tests can
/// step virtual seconds instead of sleeping through real windows.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Published after every advance, off the rotation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    /// Total advances so far (1 = the initial segment).
    pub rotation: u64,
    /// Slot index that became the write target.
    pub index: usize,
}

pub struct RingOptions {
    pub dir: PathBuf,
    pub num_segments: usize,
    pub segment_duration: Duration,
    pub utc_offset: Option<FixedOffset>,
    clock: Clock,
}

impl RingOptions {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, num_segments: usize, segment_duration: Duration) -> Self {
        Self {
            dir: dir.into(),
            num_segments,
            segment_duration,
            utc_offset: None,
            clock: Arc::new(Utc::now),
        }
    }

    #[must_use]
    pub fn with_utc_offset(mut self, offset: Option<FixedOffset>) -> Self {
        self.utc_offset = offset;
        self
    }

    /// Pin the wall clock used for naming windows.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

struct SegmentSlot {
    file: Option<File>,
    window: Option<SegmentWindow>,
}

impl SegmentSlot {
    const fn empty() -> Self {
        Self {
            file: None,
            window: None,
        }
    }
}

struct RingState {
    slots: Vec<SegmentSlot>,
    current: usize,
    rotations: u64,
    closed: bool,
}

impl RingState {
    fn prev_index(&self) -> usize {
        (self.current + self.slots.len() - 1) % self.slots.len()
    }

    async fn append(&mut self, idx: usize, chunk: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(RecordError::RingClosed);
        }
        let Some(file) = self.slots[idx].file.as_mut() else {
            return Err(RecordError::NoOpenSegment);
        };
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(chunk.len())
    }
}

struct CleanupRequest {
    in_progress: PathBuf,
    finalized: PathBuf,
}

pub struct SegmentRing {
    dir: PathBuf,
    num_segments: usize,
    segment_duration: Duration,
    utc_offset: Option<FixedOffset>,
    clock: Clock,
    state: Mutex<RingState>,
    switch_tx: broadcast::Sender<SwitchEvent>,
    cleanup_tx: mpsc::UnboundedSender<CleanupRequest>,
    cleanup_progress: watch::Receiver<u64>,
}

impl SegmentRing {
    /// Create the storage directory and an empty ring. No segment file is
    /// opened until the first advance.
    pub async fn open(opts: RingOptions) -> Result<Arc<Self>> {
        if opts.num_segments == 0 {
            return Err(RecordError::Misconfigured("num_segments must be >= 1"));
        }

        tokio::fs::create_dir_all(&opts.dir).await?;

        let mut slots = Vec::with_capacity(opts.num_segments);
        slots.resize_with(opts.num_segments, SegmentSlot::empty);

        let (switch_tx, _) = broadcast::channel(SWITCH_CHANNEL_CAPACITY);
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let (progress_tx, cleanup_progress) = watch::channel(0u64);
        tokio::spawn(cleanup_worker(cleanup_rx, progress_tx));

        Ok(Arc::new(Self {
            num_segments: opts.num_segments,
            segment_duration: opts.segment_duration,
            utc_offset: opts.utc_offset,
            clock: opts.clock,
            state: Mutex::new(RingState {
                slots,
                // First advance lands on slot 0.
                current: opts.num_segments - 1,
                rotations: 0,
                closed: false,
            }),
            switch_tx,
            cleanup_tx,
            cleanup_progress,
            dir: opts.dir,
        }))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        self.segment_duration
    }

    pub async fn rotations(&self) -> u64 {
        self.state.lock().await.rotations
    }

    pub async fn current_index(&self) -> usize {
        self.state.lock().await.current
    }

    /// Switch notifications; each advance publishes the new slot index.
    #[must_use]
    pub fn subscribe_switch(&self) -> broadcast::Receiver<SwitchEvent> {
        self.switch_tx.subscribe()
    }

    /// Count of processed slot cleanups; lets callers wait for deletions
    /// instead of racing an untracked background action.
    #[must_use]
    pub fn cleanup_progress(&self) -> watch::Receiver<u64> {
        self.cleanup_progress.clone()
    }

    /// Rotate to the next slot. Opening the new file happens before the
    /// lock is taken; failure to open is logged and the index advances
    /// anyway; losing one window of recording beats halting rotation.
    pub async fn advance(&self) -> u64 {
        let window = SegmentWindow::starting_at(
            (self.clock)(),
            self.segment_duration,
            self.utc_offset,
        );
        let path = self.dir.join(window.in_progress_name());

        let file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                error!(path = %path.display(), "failed to open new segment file: {e}");
                None
            }
        };

        let (rotation, index, reclaimed) = {
            let mut st = self.state.lock().await;
            if st.closed {
                return st.rotations;
            }
            let next = (st.current + 1) % self.num_segments;
            let fresh = SegmentSlot {
                file,
                window: Some(window.clone()),
            };
            let reclaimed = mem::replace(&mut st.slots[next], fresh);
            st.current = next;
            st.rotations += 1;
            (st.rotations, next, reclaimed)
        };

        // Drop the reclaimed handle before its file is removed.
        drop(reclaimed.file);
        if let Some(old) = reclaimed.window {
            if old.stamp() == window.stamp() {
                // Identical second-precision window: the old names point at
                // the file just opened. Never delete the write target.
                warn!(
                    dir = %self.dir.display(),
                    stamp = %old.stamp(),
                    "segment window collision on reuse, skipping delete"
                );
            } else {
                let request = CleanupRequest {
                    in_progress: self.dir.join(old.in_progress_name()),
                    finalized: self.dir.join(old.finalized_name()),
                };
                if self.cleanup_tx.send(request).is_err() {
                    warn!(dir = %self.dir.display(), "cleanup worker is gone, old segment not removed");
                }
            }
        }

        debug!(rotation, index, dir = %self.dir.display(), "rotated to segment slot");
        let _ = self.switch_tx.send(SwitchEvent { rotation, index });
        rotation
    }

    /// Append to the logically current slot.
    ///
    /// Non-blocking lock attempt first; when a rotation is mid-swap the
    /// chunk lands in the previous slot under a blocking acquisition. A
    /// chunk is written to exactly one file and is never silently dropped:
    /// every failure surfaces as an error.
    pub async fn write(&self, chunk: &[u8]) -> Result<usize> {
        match self.state.try_lock() {
            Ok(mut st) => {
                let idx = st.current;
                st.append(idx, chunk).await
            }
            Err(_) => {
                let mut st = self.state.lock().await;
                let idx = st.prev_index();
                st.append(idx, chunk).await
            }
        }
    }

    /// Spawn the rotation timer for this ring. Fixed interval: a slow
    /// advance stretches its segment instead of making the timer catch up.
    /// Cancelling the token flushes and closes every open handle.
    pub fn start_rotation(self: &Arc<Self>, cancel: CancellationToken) -> RotationHandle {
        let ring = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(ring.segment_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ring.advance().await;
                    }
                    () = cancel.cancelled() => {
                        ring.close().await;
                        info!(dir = %ring.dir.display(), "rotation stopped");
                        break;
                    }
                }
            }
        });
        RotationHandle { task }
    }

    /// Flush and close every open handle and refuse further writes.
    pub async fn close(&self) {
        let files: Vec<(usize, File)> = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
            st.slots
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, slot)| slot.file.take().map(|file| (idx, file)))
                .collect()
        };

        for (idx, mut file) in files {
            if let Err(e) = file.flush().await {
                warn!(slot = idx, "flush on close failed: {e}");
            }
            if let Err(e) = file.sync_all().await {
                warn!(slot = idx, "sync on close failed: {e}");
            }
        }
    }
}

#[async_trait::async_trait]
impl ChunkSink for SegmentRing {
    async fn write_chunk(&self, chunk: Bytes) -> Result<usize> {
        self.write(&chunk).await
    }
}

pub struct RotationHandle {
    task: tokio::task::JoinHandle<()>,
}

impl RotationHandle {
    /// Wait for the rotation task to wind down after cancellation.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            warn!("rotation task ended abnormally: {e}");
        }
    }
}

/// Deletes reclaimed slot files. The slot's prior file may already have
/// been renamed by the finalize job or removed by the retention sweep, so
/// both names are tried and "not found" is not an error.
async fn cleanup_worker(
    mut rx: mpsc::UnboundedReceiver<CleanupRequest>,
    progress: watch::Sender<u64>,
) {
    let mut processed = 0u64;
    while let Some(request) = rx.recv().await {
        remove_either(&request.in_progress, &request.finalized).await;
        processed += 1;
        let _ = progress.send(processed);
    }
}

async fn remove_either(in_progress: &Path, finalized: &Path) {
    for path in [in_progress, finalized] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed reused segment file");
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), "failed to remove reused segment file: {e}");
                return;
            }
        }
    }
    // Already finalized and swept, or never opened. Nothing to do.
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    const BASE_SECS: i64 = 1_767_614_400; // 2026-01-05 12:00:00 UTC

    /// Manual clock: tests step virtual seconds between advances so each
    /// rotation gets a distinct second-precision window.
    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let shared = Arc::clone(&offset);
        let clock: Clock = Arc::new(move || {
            Utc.timestamp_opt(BASE_SECS + shared.load(Ordering::SeqCst), 0)
                .single()
                .expect("valid timestamp")
        });
        (clock, offset)
    }

    async fn open_ring(
        dir: &Path,
        num_segments: usize,
        duration: Duration,
    ) -> (Arc<SegmentRing>, Arc<AtomicI64>) {
        let (clock, ticks) = manual_clock();
        let ring = SegmentRing::open(
            RingOptions::new(dir, num_segments, duration).with_clock(clock),
        )
        .await
        .expect("open ring");
        (ring, ticks)
    }

    fn segment_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn wait_for_cleanups(ring: &SegmentRing, count: u64) {
        let mut progress = ring.cleanup_progress();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *progress.borrow() < count {
                progress.changed().await.expect("cleanup worker alive");
            }
        })
        .await
        .expect("cleanup should finish");
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("north").join("cam1");
        let (_ring, _) = open_ring(&dir, 3, Duration::from_secs(10)).await;
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_open_fails_when_directory_cannot_be_created() {
        let tmp = tempdir().expect("tempdir");
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write blocker");

        let result = SegmentRing::open(RingOptions::new(
            blocker.join("cam1"),
            3,
            Duration::from_secs(10),
        ))
        .await;
        assert!(matches!(result, Err(RecordError::Storage(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_zero_slots() {
        let tmp = tempdir().expect("tempdir");
        let result =
            SegmentRing::open(RingOptions::new(tmp.path(), 0, Duration::from_secs(10))).await;
        assert!(matches!(result, Err(RecordError::Misconfigured(_))));
    }

    #[tokio::test]
    async fn test_slot_sequence_is_strictly_mod_n() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        for k in 0..7u64 {
            ticks.store(k as i64 * 10, Ordering::SeqCst);
            let rotation = ring.advance().await;
            assert_eq!(rotation, k + 1);
            assert_eq!(ring.current_index().await, (k as usize) % 3);
        }
    }

    #[tokio::test]
    async fn test_ring_never_holds_more_files_than_slots() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        for k in 0..8i64 {
            ticks.store(k * 10, Ordering::SeqCst);
            ring.advance().await;
        }
        // Advances 4..=8 each reclaimed a previously used slot.
        wait_for_cleanups(&ring, 5).await;

        assert_eq!(segment_files(tmp.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_reuse_deletes_file_from_n_rotations_earlier() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        ring.advance().await;
        let first = segment_files(tmp.path())
            .first()
            .cloned()
            .expect("first segment");

        for k in 1..=3i64 {
            ticks.store(k * 10, Ordering::SeqCst);
            ring.advance().await;
        }
        wait_for_cleanups(&ring, 1).await;

        let names = segment_files(tmp.path());
        assert_eq!(names.len(), 3);
        assert!(
            !names.contains(&first),
            "the file from 3 rotations earlier should be gone"
        );
    }

    #[tokio::test]
    async fn test_filenames_strictly_increase_by_start() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 5, Duration::from_secs(10)).await;

        let mut stamps = Vec::new();
        for k in 0..5i64 {
            ticks.store(k * 10, Ordering::SeqCst);
            ring.advance().await;
            let mut names = segment_files(tmp.path());
            names.retain(|n| !stamps.contains(n));
            assert_eq!(names.len(), 1);
            stamps.push(names.remove(0));
        }

        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[tokio::test]
    async fn test_reuse_tolerates_externally_finalized_file() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 2, Duration::from_secs(10)).await;

        ring.advance().await;
        let in_progress = segment_files(tmp.path()).remove(0);
        // Finalize job renamed the segment while the ring rotated on.
        let finalized = in_progress
            .trim_start_matches('.')
            .replace("_raw.mp4", ".mp4");
        std::fs::rename(tmp.path().join(&in_progress), tmp.path().join(&finalized))
            .expect("rename");

        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;
        ticks.store(20, Ordering::SeqCst);
        ring.advance().await; // reclaims slot 0 -> deletes the finalized name
        wait_for_cleanups(&ring, 1).await;

        let names = segment_files(tmp.path());
        assert!(!names.contains(&finalized));
    }

    #[tokio::test]
    async fn test_reuse_tolerates_already_removed_file() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 2, Duration::from_secs(10)).await;

        ring.advance().await;
        let first = segment_files(tmp.path()).remove(0);
        // Retention sweep got there first.
        std::fs::remove_file(tmp.path().join(&first)).expect("remove");

        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;
        ticks.store(20, Ordering::SeqCst);
        ring.advance().await;
        // Must complete without stalling the worker.
        wait_for_cleanups(&ring, 1).await;
    }

    #[tokio::test]
    async fn test_write_before_first_advance_errors() {
        let tmp = tempdir().expect("tempdir");
        let (ring, _) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        assert!(matches!(
            ring.write(b"data").await,
            Err(RecordError::NoOpenSegment)
        ));
    }

    #[tokio::test]
    async fn test_write_lands_in_current_segment() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        ring.advance().await;
        ring.write(b"first-segment").await.expect("write");
        let first = segment_files(tmp.path()).remove(0);

        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;
        ring.write(b"second-segment").await.expect("write");

        let first_contents = std::fs::read(tmp.path().join(&first)).expect("read");
        assert_eq!(first_contents, b"first-segment");

        let names = segment_files(tmp.path());
        let second = names.iter().find(|n| **n != first).expect("second file");
        let second_contents = std::fs::read(tmp.path().join(second)).expect("read");
        assert_eq!(second_contents, b"second-segment");
    }

    #[tokio::test]
    async fn test_advance_survives_open_failure() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("cam1");
        let (ring, ticks) = open_ring(&dir, 3, Duration::from_secs(10)).await;

        ring.advance().await;
        // Storage yanked out from under the ring.
        std::fs::remove_dir_all(&dir).expect("remove dir");

        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;
        assert_eq!(ring.rotations().await, 2);
        assert_eq!(ring.current_index().await, 1);
        // The lost window records nothing, but surfaces an error.
        assert!(matches!(
            ring.write(b"data").await,
            Err(RecordError::NoOpenSegment)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_land_whole_in_one_file() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 4, Duration::from_secs(10)).await;
        ring.advance().await;

        let writer_ring = Arc::clone(&ring);
        let writer = tokio::spawn(async move {
            for i in 0..200u32 {
                let chunk = format!("|chunk-{i:04}|");
                writer_ring.write(chunk.as_bytes()).await.expect("write");
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        for k in 1..=3i64 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ticks.store(k * 10, Ordering::SeqCst);
            ring.advance().await;
        }
        writer.await.expect("writer");

        let mut all = String::new();
        let mut per_file_ok = true;
        for name in segment_files(tmp.path()) {
            let contents =
                String::from_utf8(std::fs::read(tmp.path().join(&name)).expect("read"))
                    .expect("utf8");
            // Every file must contain only whole chunks.
            per_file_ok &= contents.len() % 12 == 0;
            all.push_str(&contents);
        }
        assert!(per_file_ok, "a chunk was split across segment files");

        for i in 0..200u32 {
            let chunk = format!("|chunk-{i:04}|");
            assert_eq!(
                all.matches(&chunk).count(),
                1,
                "{chunk} must land exactly once"
            );
        }
    }

    #[tokio::test]
    async fn test_close_stops_writes_and_rotation() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;

        ring.advance().await;
        ring.write(b"data").await.expect("write");
        ring.close().await;

        assert!(matches!(
            ring.write(b"late").await,
            Err(RecordError::RingClosed)
        ));

        ticks.store(10, Ordering::SeqCst);
        assert_eq!(ring.advance().await, 1, "closed ring must not rotate");
        // Closing twice is a no-op.
        ring.close().await;
    }

    #[tokio::test]
    async fn test_switch_events_follow_advances() {
        let tmp = tempdir().expect("tempdir");
        let (ring, ticks) = open_ring(tmp.path(), 3, Duration::from_secs(10)).await;
        let mut events = ring.subscribe_switch();

        ring.advance().await;
        ticks.store(10, Ordering::SeqCst);
        ring.advance().await;

        assert_eq!(
            events.recv().await.expect("event"),
            SwitchEvent { rotation: 1, index: 0 }
        );
        assert_eq!(
            events.recv().await.expect("event"),
            SwitchEvent { rotation: 2, index: 1 }
        );
    }

    #[tokio::test]
    async fn test_rotation_timer_drives_ring() {
        let tmp = tempdir().expect("tempdir");
        let (ring, _ticks) = open_ring(tmp.path(), 3, Duration::from_millis(100)).await;

        let cancel = CancellationToken::new();
        let handle = ring.start_rotation(cancel.clone());

        // Ticks at 0, 100, 200, 300 ms: three timer rotations after the
        // initial segment, and slot 0 reused exactly once.
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.stopped().await;

        assert_eq!(ring.rotations().await, 4);
        assert_eq!(ring.current_index().await, 0);
        assert!(matches!(
            ring.write(b"late").await,
            Err(RecordError::RingClosed)
        ));
    }
}
