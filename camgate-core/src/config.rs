use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub record: RecordConfig,
    pub streams: BTreeMap<String, StreamEntry>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

/// One entry under `streams:`.
///
/// Entries are either a bare source URL (scalar) or a structured device
/// description. Only structured entries are recorded; scalars exist for
/// passthrough-only streams handled elsewhere in the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEntry {
    Url(String),
    Device(StreamConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Recording configuration, as read from file/env.
///
/// Raw string form; `Config::validate_record()` turns it into a parsed
/// [`RecordSettings`] and rejects anything missing or malformed. There is
/// no sensible default for `base_path`, `segment_duration` or
/// `num_segments`, so empty values fail validation rather than filling in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub base_path: String,
    pub segment_duration: String,
    pub num_segments: usize,
    /// Fixed UTC offset used for segment filenames, e.g. "+03:00".
    pub utc_offset: Option<String>,
    /// External command invoked with the base path to finalize closed
    /// segments into their player-compatible form.
    pub finalize_command: Option<String>,
    pub retention_grace: String,
    pub sweep_interval: String,
    pub start_stagger: String,
    pub attach_backoff: String,
    /// Attach attempts before giving up. Absent means retry forever.
    pub attach_max_attempts: Option<u32>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            segment_duration: String::new(),
            num_segments: 0,
            utc_offset: None,
            finalize_command: None,
            retention_grace: "5m".to_string(),
            sweep_interval: "5m".to_string(),
            start_stagger: "2s".to_string(),
            attach_backoff: "30s".to_string(),
            attach_max_attempts: None,
        }
    }
}

/// Validated, parsed recording settings.
#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub base_path: PathBuf,
    pub segment_duration: Duration,
    pub num_segments: usize,
    pub utc_offset: Option<FixedOffset>,
    pub finalize_command: Option<String>,
    pub retention_grace: Duration,
    pub sweep_interval: Duration,
    pub start_stagger: Duration,
    pub attach_backoff: Duration,
    pub attach_max_attempts: Option<u32>,
}

impl RecordSettings {
    /// Age beyond which a segment file cannot belong to any live ring:
    /// the full ring span plus the crash-recovery grace.
    #[must_use]
    pub fn retention_window(&self) -> Duration {
        self.segment_duration * self.num_segments as u32 + self.retention_grace
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 1984,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CAMGATE_RECORD_BASE_PATH, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CAMGATE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Validate the `record` section and parse it into [`RecordSettings`].
    ///
    /// The top-level recording values have no per-stream fallback, so a
    /// missing or malformed value is fatal to the recording subsystem.
    pub fn validate_record(&self) -> Result<RecordSettings> {
        let r = &self.record;

        if r.base_path.is_empty() {
            return Err(Error::invalid_record("base_path", "must not be empty"));
        }

        if r.segment_duration.is_empty() {
            return Err(Error::invalid_record("segment_duration", "must be set"));
        }
        let segment_duration = parse_duration("segment_duration", &r.segment_duration)?;
        if segment_duration.is_zero() {
            return Err(Error::invalid_record(
                "segment_duration",
                "must be a positive duration",
            ));
        }

        if r.num_segments < 1 {
            return Err(Error::invalid_record("num_segments", "must be >= 1"));
        }

        let utc_offset = match &r.utc_offset {
            Some(raw) => Some(raw.parse::<FixedOffset>().map_err(|e| {
                Error::invalid_record("utc_offset", format!("{raw:?}: {e}"))
            })?),
            None => None,
        };

        Ok(RecordSettings {
            base_path: PathBuf::from(&r.base_path),
            segment_duration,
            num_segments: r.num_segments,
            utc_offset,
            finalize_command: r.finalize_command.clone(),
            retention_grace: parse_duration("retention_grace", &r.retention_grace)?,
            sweep_interval: parse_duration("sweep_interval", &r.sweep_interval)?,
            start_stagger: parse_duration("start_stagger", &r.start_stagger)?,
            attach_backoff: parse_duration("attach_backoff", &r.attach_backoff)?,
            attach_max_attempts: r.attach_max_attempts,
        })
    }
}

fn parse_duration(field: &'static str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw)
        .map_err(|e| Error::invalid_record(field, format!("{raw:?}: {e}")))
}
