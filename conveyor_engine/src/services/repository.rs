//! Job repository contract — persistence, log append, and pub/sub events.

use async_trait::async_trait;

use crate::models::error::EngineError;
use crate::models::job::{Job, JobLog};

/// Persistence and event contract consumed by the engine.
///
/// Field updates publish on the channel `<jobId>:<field>`; transient events
/// publish on `<jobId>:<kind>` in the same namespace.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// List all known jobs by id; other attributes are left unfilled.
    async fn all(&self) -> Result<Vec<Job>, EngineError>;

    /// Hydrate a job's persisted metadata, or fail with not-found.
    async fn get(&self, job_id: &str) -> Result<Job, EngineError>;

    /// Assign a fresh id, register the job in the active index, and store
    /// the initial record fields.
    async fn create(&self, job: &mut Job) -> Result<(), EngineError>;

    /// Set one named field, then publish the new value on `<jobId>:<field>`.
    async fn update(&self, job_id: &str, field: &str, value: &str) -> Result<(), EngineError>;

    /// Publish a transient event; nothing is persisted.
    async fn publish_message(
        &self,
        job_id: &str,
        kind: &str,
        payload: &str,
    ) -> Result<(), EngineError>;

    /// Persist the final captured output.
    async fn set_output(&self, job_id: &str, value: &str) -> Result<(), EngineError>;

    /// Append one line to the job's log.
    async fn append_log_line(&self, job_id: &str, line: &str) -> Result<(), EngineError>;

    /// Read log lines from `index` onward.
    async fn get_job_log(&self, job_id: &str, index: usize) -> Result<JobLog, EngineError>;

    /// Remove the job from the active index, keeping its record and log.
    async fn delete_from_index(&self, job_id: &str) -> Result<(), EngineError>;

    /// Remove the job from the index and delete its record and log.
    async fn delete(&self, job_id: &str) -> Result<(), EngineError>;
}
