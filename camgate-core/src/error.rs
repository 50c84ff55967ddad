use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("record.{field} is invalid: {reason}")]
    InvalidRecordConfig {
        field: &'static str,
        reason: String,
    },

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_record(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRecordConfig {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
