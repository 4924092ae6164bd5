use std::path::PathBuf;
use thiserror::Error;

/// Reasons an inbound message is rejected by the router. None of these
/// are fatal; the message is logged and dropped.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no route for topic '{0}'")]
    UnknownTopic(String),

    #[error("payload is not valid utf-8")]
    Utf8,

    #[error("invalid json: {0}")]
    Json(String),

    #[error("expected {expected} fields, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("field '{field}' is not a number: {raw:?}")]
    Number { field: &'static str, raw: String },

    #[error("field '{field}' is not finite")]
    NonFinite { field: &'static str },

    #[error("camera message has no image")]
    MissingImage,

    #[error("invalid base64 image: {0}")]
    Base64(String),
}

/// Failures while driving a digital output line.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to open output line '{label}' on pin {pin}: {reason}")]
    Open {
        label: String,
        pin: u8,
        reason: String,
    },

    #[error("failed to write output line '{label}': {reason}")]
    Write { label: String, reason: String },

    #[error("driver '{0}' is not available in this build")]
    DriverUnavailable(&'static str),
}

/// Failures inside the frame archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("archive queue is full, frame dropped")]
    QueueFull,

    #[error("archive worker has stopped")]
    WorkerStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate the config file {0:?}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Parse(#[from] config::ConfigError),

    #[error("{field} is out of range")]
    OutOfRange { field: &'static str },

    #[error("invalid band for {channel}: low {low} high {high}")]
    InvalidBand {
        channel: String,
        low: f64,
        high: f64,
    },
}

/// Failures that abort startup. Once running nothing is fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
