//! Engine error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the job engine and its backing services.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced job id has no record.
    #[error("cannot find job with id {0}")]
    NotFound(String),

    /// The job input was not valid base64.
    #[error("invalid job input: {0}")]
    Input(#[from] base64::DecodeError),

    /// Creating the file-pipe file failed.
    #[error("could not create pipe file {path}")]
    PipeSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the file-pipe output failed.
    #[error("could not read pipe file {path}")]
    OutputRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executor refused to start the step.
    #[error("could not start job step: {error}")]
    ExecutorStart { error: anyhow::Error },

    /// The step ran but its exit indicated failure. Carries whatever output
    /// was captured so the caller can still persist it.
    #[error("job step failed: {error}")]
    StepFailed {
        output: Vec<u8>,
        error: anyhow::Error,
    },

    /// The executor could not stop a timed-out step.
    #[error("could not stop job step: {error}")]
    ExecutorStop { error: anyhow::Error },

    /// The step exceeded its configured timeout.
    #[error("job step timed out")]
    Timeout,

    /// Store-level failure, surfaced verbatim.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}
