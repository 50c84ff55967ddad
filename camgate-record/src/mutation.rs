// Stream-mutation message contract.
//
// The only externally observable mutation path to the recorded stream
// list is a queue message adding or removing one `streams.<guid>` entry.
// The queue transport and the YAML merge/restart live outside this crate;
// what matters here is strict validation: a partial message is rejected
// and leaves the store untouched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use camgate_core::StreamConfig;

const REQUIRED_FIELDS: [&str; 4] = ["action", "guid", "url", "device_name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMutation {
    pub action: MutationAction,
    pub guid: String,
    pub url: String,
    pub device_name: String,
}

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream mutation must specify '{0}'")]
    MissingField(&'static str),
}

impl StreamMutation {
    /// Parse and validate one queue message. Every required field must be
    /// present; the missing field is named so the rejection log is usable.
    pub fn parse(raw: &[u8]) -> Result<Self, MutationError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        for field in REQUIRED_FIELDS {
            if value.get(field).is_none() {
                return Err(MutationError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The `streams.<guid>` entry an `add` merges into the config store.
    #[must_use]
    pub fn stream_entry(&self) -> (String, StreamConfig) {
        (
            self.guid.clone(),
            StreamConfig {
                url: self.url.clone(),
                device_name: Some(self.device_name.clone()),
            },
        )
    }
}
