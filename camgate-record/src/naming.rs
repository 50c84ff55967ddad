// Segment naming and per-stream storage paths.
//
// On-disk contract:
// - in-progress segment:  {base}/{group}/{stream}/.{start}_{end}_raw.mp4
// - finalized segment:    {base}/{group}/{stream}/{start}_{end}.mp4
//
// The finalize job (external) strips the in-progress marker once a segment
// has been rotated away from; both names must be derivable from a window so
// slot reuse can delete whichever form is still on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Fixed, sortable, second-precision timestamp rendering.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";

const IN_PROGRESS_SUFFIX: &str = "_raw.mp4";
const FINALIZED_SUFFIX: &str = ".mp4";

/// The time window covered by one segment file, in the naming timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentWindow {
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
}

impl SegmentWindow {
    /// Window starting at `start` and spanning `duration`, rendered in
    /// `offset` (UTC when absent).
    #[must_use]
    pub fn starting_at(
        start: DateTime<Utc>,
        duration: Duration,
        offset: Option<FixedOffset>,
    ) -> Self {
        let span = chrono::Duration::from_std(duration).unwrap_or_default();
        let offset = offset.unwrap_or_else(|| Utc.fix());
        let start = start.with_timezone(&offset);
        Self {
            start,
            end: start + span,
        }
    }

    #[must_use]
    pub fn start(&self) -> DateTime<FixedOffset> {
        self.start
    }

    /// `{start}_{end}` portion shared by both filename forms.
    #[must_use]
    pub fn stamp(&self) -> String {
        format!(
            "{}_{}",
            self.start.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT)
        )
    }

    /// Hidden name the ring writes into: `.{start}_{end}_raw.mp4`.
    #[must_use]
    pub fn in_progress_name(&self) -> String {
        format!(".{}{}", self.stamp(), IN_PROGRESS_SUFFIX)
    }

    /// Player-visible name the finalize job renames to: `{start}_{end}.mp4`.
    #[must_use]
    pub fn finalized_name(&self) -> String {
        format!("{}{}", self.stamp(), FINALIZED_SUFFIX)
    }
}

/// Replace path separators so a device name can never escape its directory,
/// and strip a leading dot so it cannot masquerade as an in-progress file.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    cleaned.trim_start_matches('.').trim().to_string()
}

/// Storage directory for one stream.
///
/// Device names carry an address portion followed by a device label
/// ("ул. Восход, 26/1 doorbell"); the address groups all devices of one
/// site under a common directory. Names without a separable address (or
/// streams without a device name) sit directly under the base path.
#[must_use]
pub fn stream_dir(base: &Path, stream_name: &str, device_name: Option<&str>) -> PathBuf {
    let group = device_name.and_then(|name| {
        let trimmed = name.trim();
        trimmed
            .rsplit_once(char::is_whitespace)
            .map(|(address, _label)| sanitize_component(address))
            .filter(|g| !g.is_empty())
    });

    let mut dir = base.to_path_buf();
    if let Some(group) = group {
        dir.push(group);
    }
    dir.push(sanitize_component(stream_name));
    dir
}
