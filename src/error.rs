use std::io;

/// Errors from the platform layer and from configuration.
///
/// The scheduling core itself never fails: misses and exhaustion are
/// reported through `Option`s and sentinel ids.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("platform I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration ({field}): {reason}")]
    InvalidConfiguration {
        field: &'static str,
        reason: &'static str,
    },
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
