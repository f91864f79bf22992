use std::time::Duration;

/// Failures of the link to a single instrument.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("transport is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No candidate endpoint identified as the requested instrument.
    #[error("{instrument} not found on any candidate endpoint")]
    NotDetected { instrument: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed reply {raw:?}: {reason}")]
    ReadParse { raw: String, reason: String },
    #[error("no valid reading after {attempts} attempts ({last})")]
    ReadExhausted { attempts: u32, last: String },
    #[error("cleanup step `{step}` failed: {reason}")]
    Cleanup { step: &'static str, reason: String },
    #[error("csv log: {0}")]
    Csv(#[from] csv::Error),
    #[error("plot: {0}")]
    Plot(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn cleanup(step: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Cleanup {
            step,
            reason: err.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
