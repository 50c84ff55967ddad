// Recording supervisor: wires configured streams to recorder sessions.
//
// Runs once at startup. Each structured stream entry gets a (ring,
// adapter) pair; scalar entries are passthrough-only and skipped. Session
// starts are staggered so the per-session rotation timers do not all hit
// storage at the same instant. A failure on one stream never stops the
// others from starting.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use camgate_core::{RecordSettings, StreamConfig, StreamEntry};

use crate::consumer::AdapterPolicy;
use crate::error::Result;
use crate::hub::LiveStreamHub;
use crate::naming;
use crate::ring::{RingOptions, SegmentRing};
use crate::session::{RecordingRegistry, RecordingSession};
use crate::source::{StreamSource, TrackFilter};

pub struct RecordingSupervisor {
    settings: RecordSettings,
    hub: Arc<LiveStreamHub>,
    registry: Arc<RecordingRegistry>,
    cancel: CancellationToken,
}

impl RecordingSupervisor {
    #[must_use]
    pub fn new(
        settings: RecordSettings,
        hub: Arc<LiveStreamHub>,
        registry: Arc<RecordingRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            hub,
            registry,
            cancel,
        }
    }

    /// Build and start one session per recordable stream entry. Returns
    /// the number of sessions started.
    pub async fn start(&self, streams: &BTreeMap<String, StreamEntry>) -> usize {
        let mut started = 0usize;
        for (name, entry) in streams {
            let StreamEntry::Device(stream) = entry else {
                debug!(stream = %name, "skipping scalar stream entry");
                continue;
            };

            if started > 0 {
                // Offset the rotation timers between streams.
                time::sleep(self.settings.start_stagger).await;
            }

            match self.start_session(name, stream).await {
                Ok(session) => {
                    self.registry.insert(session);
                    started += 1;
                }
                Err(e) => {
                    error!(stream = %name, "failed to start recording session: {e}");
                }
            }
        }

        info!(sessions = started, "recording supervisor finished startup");
        started
    }

    async fn start_session(
        &self,
        name: &str,
        stream: &StreamConfig,
    ) -> Result<Arc<RecordingSession>> {
        let dir = naming::stream_dir(
            &self.settings.base_path,
            name,
            stream.device_name.as_deref(),
        );

        let ring = SegmentRing::open(
            RingOptions::new(dir, self.settings.num_segments, self.settings.segment_duration)
                .with_utc_offset(self.settings.utc_offset),
        )
        .await?;

        let source = self.hub.get_or_create(name, &stream.url);
        let policy = AdapterPolicy {
            backoff: self.settings.attach_backoff,
            max_attempts: self.settings.attach_max_attempts,
        };

        Ok(RecordingSession::start(
            name,
            TrackFilter::All,
            source as Arc<dyn StreamSource>,
            ring,
            policy,
            self.cancel.child_token(),
        ))
    }
}
