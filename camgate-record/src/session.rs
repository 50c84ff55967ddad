// Recording sessions and the registry that owns them.
//
// The registry is an explicit object constructed by the supervisor and
// handed by reference to whoever needs to look sessions up (the HTTP
// status endpoint does), never a process-wide global.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::consumer::{AdapterPolicy, ConsumerAdapter};
use crate::ring::{RotationHandle, SegmentRing};
use crate::source::{StreamSource, TrackFilter};

/// One stream being continuously recorded: its ring, its rotation timer
/// and its consumer adapter, torn down together through one token.
pub struct RecordingSession {
    name: String,
    filter: TrackFilter,
    ring: Arc<SegmentRing>,
    adapter: ConsumerAdapter,
    rotation: Mutex<Option<RotationHandle>>,
    cancel: CancellationToken,
}

impl RecordingSession {
    /// Start rotation and the consumer adapter for `ring`.
    pub fn start(
        name: impl Into<String>,
        filter: TrackFilter,
        source: Arc<dyn StreamSource>,
        ring: Arc<SegmentRing>,
        policy: AdapterPolicy,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let name = name.into();
        let rotation = ring.start_rotation(cancel.clone());
        let adapter = ConsumerAdapter::start(
            name.clone(),
            filter,
            source,
            Arc::clone(&ring),
            policy,
            cancel.clone(),
        );

        info!(stream = %name, dir = %ring.dir().display(), "recording session started");
        Arc::new(Self {
            name,
            filter,
            ring,
            adapter,
            rotation: Mutex::new(Some(rotation)),
            cancel,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ring(&self) -> &Arc<SegmentRing> {
        &self.ring
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            name: self.name.clone(),
            filter: self.filter,
            directory: self.ring.dir().display().to_string(),
            rotations: self.ring.rotations().await,
            current_slot: self.ring.current_index().await,
        }
    }

    /// Stop the rotation timer, detach the consumer and close every open
    /// segment handle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.adapter.stop().await;
        if let Some(rotation) = self.rotation.lock().await.take() {
            rotation.stopped().await;
        }
        info!(stream = %self.name, "recording session stopped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub filter: TrackFilter,
    pub directory: String,
    pub rotations: u64,
    pub current_slot: usize,
}

/// Active recordings, keyed by stream name.
pub struct RecordingRegistry {
    sessions: DashMap<String, Arc<RecordingSession>>,
}

impl RecordingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Arc<RecordingSession>) {
        self.sessions.insert(session.name().to_string(), session);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RecordingSession>> {
        self.sessions.get(name).map(|s| Arc::clone(&s))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let sessions: Vec<Arc<RecordingSession>> =
            self.sessions.iter().map(|s| Arc::clone(&s)).collect();
        let mut statuses = Vec::with_capacity(sessions.len());
        for session in sessions {
            statuses.push(session.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<RecordingSession>> =
            self.sessions.iter().map(|s| Arc::clone(&s)).collect();
        for session in sessions {
            session.shutdown().await;
        }
        self.sessions.clear();
    }
}

impl Default for RecordingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
