//! Redis-backed job repository.
//!
//! Layout: the active index is a list at `<jobsKey>`; each job record is a
//! hash at `<jobsKey>:<jobId>`; each log is a list at `<jobsKey>:<jobId>:log`.
//! Every field update is followed by a publish on `<jobId>:<field>`, so
//! subscribers see changes as they land.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::EngineConfig;
use crate::models::error::EngineError;
use crate::models::job::{
    Job, JobLog, FIELD_COMPLETED_STEPS, FIELD_CREATED_AT, FIELD_FINISHED_IN, FIELD_OUTPUT,
    FIELD_STATUS, FIELD_TOTAL_STEPS,
};
use crate::services::repository::JobRepository;

pub struct RedisJobRepository {
    conn: ConnectionManager,
    jobs_key: String,
    key_ttl: u64,
}

impl RedisJobRepository {
    /// Connect to the Redis endpoint named by the configuration.
    pub async fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!(url = %config.redis_url, jobs_key = %config.jobs_key, "Connected to Redis");

        Ok(Self {
            conn,
            jobs_key: config.jobs_key.clone(),
            key_ttl: config.key_ttl,
        })
    }
}

#[async_trait]
impl JobRepository for RedisJobRepository {
    async fn all(&self) -> Result<Vec<Job>, EngineError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(&self.jobs_key, 0, -1).await?;

        Ok(ids
            .into_iter()
            .map(|id| Job {
                id,
                ..Job::default()
            })
            .collect())
    }

    async fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> =
            conn.hgetall(job_key(&self.jobs_key, job_id)).await?;

        if record.is_empty() {
            return Err(EngineError::NotFound(job_id.to_string()));
        }

        let parse_or = |field: &str| record.get(field).and_then(|v| v.parse().ok());

        Ok(Job {
            id: job_id.to_string(),
            steps_completed: parse_or(FIELD_COMPLETED_STEPS).unwrap_or(0),
            total_steps: parse_or(FIELD_TOTAL_STEPS).unwrap_or(0),
            finished_in: record
                .get(FIELD_FINISHED_IN)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            status: record.get(FIELD_STATUS).cloned().unwrap_or_default(),
            created_at: record.get(FIELD_CREATED_AT).cloned().unwrap_or_default(),
            output: record.get(FIELD_OUTPUT).cloned().unwrap_or_default(),
            ..Job::default()
        })
    }

    async fn create(&self, job: &mut Job) -> Result<(), EngineError> {
        job.id = pseudo_uuid();
        job.total_steps = job.steps.len();

        let mut conn = self.conn.clone();
        let key = job_key(&self.jobs_key, &job.id);

        let _: () = conn.rpush(&self.jobs_key, &job.id).await?;

        let fields = [
            (FIELD_TOTAL_STEPS, job.steps.len().to_string()),
            (FIELD_COMPLETED_STEPS, "0".to_string()),
            (FIELD_STATUS, String::new()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;

        if self.key_ttl > 0 {
            let _: () = conn.expire(&key, self.key_ttl as i64).await?;
        }

        Ok(())
    }

    async fn update(&self, job_id: &str, field: &str, value: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(job_key(&self.jobs_key, job_id), field, value)
            .await?;
        let _: () = conn.publish(format!("{job_id}:{field}"), value).await?;
        Ok(())
    }

    async fn publish_message(
        &self,
        job_id: &str,
        kind: &str,
        payload: &str,
    ) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(format!("{job_id}:{kind}"), payload).await?;
        Ok(())
    }

    async fn set_output(&self, job_id: &str, value: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(job_key(&self.jobs_key, job_id), FIELD_OUTPUT, value)
            .await?;
        Ok(())
    }

    async fn append_log_line(&self, job_id: &str, line: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let key = job_log_key(&self.jobs_key, job_id);
        let _: () = conn.rpush(&key, line).await?;

        if self.key_ttl > 0 {
            let _: () = conn.expire(&key, self.key_ttl as i64).await?;
        }

        Ok(())
    }

    async fn get_job_log(&self, job_id: &str, index: usize) -> Result<JobLog, EngineError> {
        let mut conn = self.conn.clone();
        let lines: Vec<String> = conn
            .lrange(job_log_key(&self.jobs_key, job_id), index as isize, -1)
            .await?;
        Ok(JobLog { lines })
    }

    async fn delete_from_index(&self, job_id: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(&self.jobs_key, 0, job_id).await?;
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<(), EngineError> {
        self.delete_from_index(job_id).await?;

        let mut conn = self.conn.clone();
        let _: () = conn.del(job_key(&self.jobs_key, job_id)).await?;
        let _: () = conn.del(job_log_key(&self.jobs_key, job_id)).await?;
        Ok(())
    }
}

fn job_key(jobs_key: &str, job_id: &str) -> String {
    format!("{jobs_key}:{job_id}")
}

fn job_log_key(jobs_key: &str, job_id: &str) -> String {
    format!("{jobs_key}:{job_id}:log")
}

/// 16 random bytes rendered in the 8-4-4-4-12 uppercase hex form used for
/// job ids.
fn pseudo_uuid() -> String {
    let b: [u8; 16] = rand::random();
    let hex = |bytes: &[u8]| -> String { bytes.iter().map(|b| format!("{b:02X}")).collect() };

    format!(
        "{}-{}-{}-{}-{}",
        hex(&b[0..4]),
        hex(&b[4..6]),
        hex(&b[6..8]),
        hex(&b[8..10]),
        hex(&b[10..16])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_under_the_jobs_key() {
        assert_eq!(job_key("jobs", "AB-12"), "jobs:AB-12");
        assert_eq!(job_log_key("jobs", "AB-12"), "jobs:AB-12:log");
    }

    #[test]
    fn pseudo_uuid_has_the_wire_format() {
        let id = pseudo_uuid();
        assert_eq!(id.len(), 36);
        for (i, c) in id.chars().enumerate() {
            if matches!(i, 8 | 13 | 18 | 23) {
                assert_eq!(c, '-');
            } else {
                assert!(c.is_ascii_hexdigit() && !c.is_ascii_lowercase());
            }
        }
    }

    #[test]
    fn pseudo_uuids_do_not_collide() {
        assert_ne!(pseudo_uuid(), pseudo_uuid());
    }
}
