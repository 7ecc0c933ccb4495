//! Step executor contract — lifecycle of one containerized step.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::models::job::Job;

/// Stdin stream handed to a step.
pub type StepInput = Box<dyn AsyncRead + Send + Unpin>;

/// Sink receiving one of a step's output streams. Owned by the executor
/// after `start`; closed when the step's process exits.
pub type StepSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Container-runtime contract for running a single job step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Launch the step at `step_index`, wired to the supplied streams.
    async fn start(
        &self,
        job: &Job,
        step_index: usize,
        stdin: StepInput,
        stdout: StepSink,
        stderr: StepSink,
    ) -> anyhow::Result<()>;

    /// Block until the step's process exits; `Err` iff the exit indicates
    /// failure.
    async fn inspect(&self, job: &Job) -> anyhow::Result<()>;

    /// Request immediate termination of the step.
    async fn stop(&self, job: &Job) -> anyhow::Result<()>;

    /// Release transient state held for the step.
    async fn clean_up(&self, job: &Job) -> anyhow::Result<()>;
}
