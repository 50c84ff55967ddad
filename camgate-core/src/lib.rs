pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, LoggingConfig, RecordConfig, RecordSettings, ServerConfig, StreamConfig, StreamEntry,
};
pub use error::{Error, Result};
