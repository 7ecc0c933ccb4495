//! Job lifecycle service — creation, lookup, and pipeline execution.
//!
//! `execute` drives the job state machine: it marks the job running, runs
//! each step with the previous step's output as stdin, publishes progress
//! after every step, and records timing and terminal status. The first step
//! error aborts the remaining steps and becomes the return value; output
//! captured up to that point is still persisted.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;

use crate::config::EngineConfig;
use crate::metrics;
use crate::models::error::EngineError;
use crate::models::job::{
    Job, JobLog, EVENT_EXECUTE_STEP, FIELD_COMPLETED_STEPS, FIELD_CREATED_AT, FIELD_FINISHED_IN,
    FIELD_STATUS, STATUS_COMPLETE, STATUS_ERROR, STATUS_RUNNING,
};
use crate::services::repository::JobRepository;
use crate::services::step_executor::{StepExecutor, StepInput};
use crate::services::step_runner;

pub struct JobService {
    repository: Arc<dyn JobRepository>,
    executor: Arc<dyn StepExecutor>,
    remove_done: bool,
}

impl JobService {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        executor: Arc<dyn StepExecutor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repository,
            executor,
            remove_done: config.remove_done,
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Job>, EngineError> {
        self.repository.all().await
    }

    pub async fn get_by_id(&self, job_id: &str) -> Result<Job, EngineError> {
        self.repository.get(job_id).await
    }

    pub async fn create(&self, job: &mut Job) -> Result<(), EngineError> {
        self.repository.create(job).await
    }

    pub async fn get_log(&self, job: &Job, index: usize) -> Result<JobLog, EngineError> {
        self.repository.get_job_log(&job.id, index).await
    }

    pub async fn delete(&self, job: &Job) -> Result<(), EngineError> {
        self.repository.delete(&job.id).await
    }

    /// Run all steps in order. Returns the first step error, after terminal
    /// bookkeeping has been recorded.
    pub async fn execute(&self, job: &mut Job) -> Result<(), EngineError> {
        let started = Instant::now();
        self.update_field(&job.id, FIELD_STATUS, STATUS_RUNNING).await;
        self.update_field(&job.id, FIELD_CREATED_AT, &Utc::now().to_rfc3339())
            .await;

        tracing::info!(job_id = %job.id, steps = job.steps.len(), "Executing job");

        let mut result = Ok(());
        let mut capture: Option<Vec<u8>> = None;

        if !job.input.is_empty() {
            match BASE64.decode(job.input.as_bytes()) {
                Ok(decoded) => capture = Some(decoded),
                Err(error) => result = Err(EngineError::Input(error)),
            }
        }

        if result.is_ok() {
            for index in 0..job.steps.len() {
                let step_started = Instant::now();
                let source = job.steps[index].source.clone();

                if let Err(error) = self
                    .repository
                    .publish_message(&job.id, EVENT_EXECUTE_STEP, &source)
                    .await
                {
                    tracing::warn!(job_id = %job.id, %error, "could not publish step event");
                }

                let stdin: StepInput = match capture.take() {
                    Some(bytes) => Box::new(Cursor::new(bytes)),
                    None => Box::new(tokio::io::empty()),
                };

                match step_runner::run_step(
                    self.repository.clone(),
                    self.executor.as_ref(),
                    job,
                    index,
                    stdin,
                )
                .await
                {
                    Ok(output) => {
                        capture = Some(output);
                        job.steps_completed += 1;
                        self.update_field(&job.id, FIELD_COMPLETED_STEPS, &(index + 1).to_string())
                            .await;
                        metrics::step_duration(&source, step_started.elapsed().as_secs_f64());
                        tracing::info!(job_id = %job.id, step = index, source = %source, "Step complete");
                    }
                    Err(mut error) => {
                        // A failed step may still have produced output worth
                        // keeping for diagnostics.
                        if let EngineError::StepFailed { output, .. } = &mut error {
                            capture = Some(std::mem::take(output));
                        }
                        tracing::warn!(job_id = %job.id, step = index, %error, "Step failed");
                        result = Err(error);
                        break;
                    }
                }
            }
        }

        let status = if result.is_ok() {
            STATUS_COMPLETE
        } else {
            STATUS_ERROR
        };

        if let Some(output) = capture {
            if !output.is_empty() {
                let text = String::from_utf8_lossy(&output);
                if let Err(error) = self.repository.set_output(&job.id, &text).await {
                    tracing::warn!(job_id = %job.id, %error, "could not persist job output");
                }
            }
        }

        let finished_in = started.elapsed().as_secs_f64();
        self.update_field(&job.id, FIELD_FINISHED_IN, &format!("{finished_in:.6}"))
            .await;
        self.update_field(&job.id, FIELD_STATUS, status).await;

        metrics::job_status_changed(status);
        metrics::job_duration(finished_in);
        tracing::info!(
            job_id = %job.id,
            status,
            steps_completed = job.steps_completed,
            finished_in,
            "Job finished"
        );

        if self.remove_done {
            if let Err(error) = self.repository.delete_from_index(&job.id).await {
                tracing::warn!(job_id = %job.id, %error, "could not remove job from index");
            }
        }

        result
    }

    /// Persist one field; bookkeeping failures are logged, never fatal.
    async fn update_field(&self, job_id: &str, field: &str, value: &str) {
        if let Err(error) = self.repository.update(job_id, field, value).await {
            tracing::warn!(job_id = %job_id, field, %error, "could not persist job field");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::Step;
    use crate::services::test_support::{MemoryRepository, ScriptedExecutor, StepProgram};

    fn service_with(
        programs: Vec<StepProgram>,
        remove_done: bool,
    ) -> (JobService, Arc<MemoryRepository>, Arc<ScriptedExecutor>) {
        let repository = Arc::new(MemoryRepository::default());
        let executor = Arc::new(ScriptedExecutor::new(programs));
        let config = EngineConfig {
            redis_url: String::new(),
            docker_host: String::new(),
            jobs_key: "jobs".to_string(),
            key_ttl: 0,
            remove_done,
        };
        let service = JobService::new(repository.clone(), executor.clone(), &config);
        (service, repository, executor)
    }

    fn job_with_steps(id: &str, steps: Vec<Step>) -> Job {
        Job {
            id: id.to_string(),
            steps,
            ..Job::default()
        }
    }

    fn stdout_step(source: &str) -> Step {
        Step {
            source: source.to_string(),
            ..Step::default()
        }
    }

    #[tokio::test]
    async fn single_step_job_completes() {
        let (service, repository, _) = service_with(
            vec![StepProgram::Emit {
                stdout: "hello\n",
                stderr: "",
                exit: 0,
            }],
            false,
        );
        let mut job = job_with_steps("JOB-ECHO", vec![stdout_step("test/echo")]);

        service.execute(&mut job).await.unwrap();

        assert_eq!(job.steps_completed, 1);
        assert_eq!(
            repository.field("JOB-ECHO", FIELD_STATUS).await.as_deref(),
            Some("complete")
        );
        assert_eq!(
            repository
                .field("JOB-ECHO", FIELD_COMPLETED_STEPS)
                .await
                .as_deref(),
            Some("1")
        );
        assert_eq!(
            repository.field("JOB-ECHO", "output").await.as_deref(),
            Some("hello\n")
        );
        let finished: f64 = repository
            .field("JOB-ECHO", FIELD_FINISHED_IN)
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert!(finished >= 0.0);
    }

    #[tokio::test]
    async fn two_step_pipeline_chains_output_into_stdin() {
        let (service, repository, _) = service_with(
            vec![
                StepProgram::Emit {
                    stdout: "ab\ncd\n",
                    stderr: "",
                    exit: 0,
                },
                StepProgram::Uppercase,
            ],
            false,
        );
        let mut job = job_with_steps(
            "JOB-CHAIN",
            vec![stdout_step("test/emit"), stdout_step("test/upper")],
        );

        service.execute(&mut job).await.unwrap();

        assert_eq!(job.steps_completed, 2);
        assert_eq!(
            repository.field("JOB-CHAIN", "output").await.as_deref(),
            Some("AB\nCD\n")
        );

        // All log lines of a step land before any line of the next step.
        assert_eq!(
            repository.lines("JOB-CHAIN").await,
            vec!["ab", "cd", "AB", "CD"]
        );

        // Progress publishes strictly increase, and the completedSteps update
        // for a step precedes the executeStep event for the next one.
        let ops = repository.ops().await;
        let position = |op: &str| {
            ops.iter()
                .position(|candidate| candidate == op)
                .unwrap_or_else(|| panic!("missing op {op:?} in {ops:?}"))
        };
        let first_event = position("publish executeStep=test/emit");
        let first_done = position("update completedSteps=1");
        let second_event = position("publish executeStep=test/upper");
        let second_done = position("update completedSteps=2");
        assert!(first_event < first_done);
        assert!(first_done < second_event);
        assert!(second_event < second_done);
    }

    #[tokio::test]
    async fn finished_in_is_persisted_before_terminal_status() {
        let (service, repository, _) = service_with(
            vec![StepProgram::Emit {
                stdout: "x\n",
                stderr: "",
                exit: 0,
            }],
            false,
        );
        let mut job = job_with_steps("JOB-ORDER", vec![stdout_step("test/echo")]);

        service.execute(&mut job).await.unwrap();

        let ops = repository.ops().await;
        let finished = ops
            .iter()
            .position(|op| op.starts_with("update finishedIn="))
            .unwrap();
        let status = ops
            .iter()
            .position(|op| op == "update status=complete")
            .unwrap();
        assert!(finished < status);
    }

    #[tokio::test]
    async fn input_is_base64_decoded_into_the_first_step() {
        let (service, repository, _) = service_with(vec![StepProgram::Uppercase], false);
        let mut job = job_with_steps("JOB-INPUT", vec![stdout_step("test/upper")]);
        job.input = BASE64.encode("ab\ncd\n");

        service.execute(&mut job).await.unwrap();

        assert_eq!(
            repository.field("JOB-INPUT", "output").await.as_deref(),
            Some("AB\nCD\n")
        );
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_step_runs() {
        let (service, repository, _) = service_with(vec![StepProgram::Uppercase], false);
        let mut job = job_with_steps("JOB-BADINPUT", vec![stdout_step("test/upper")]);
        job.input = "%%not-base64%%".to_string();

        let result = service.execute(&mut job).await;

        assert!(matches!(result, Err(EngineError::Input(_))));
        assert_eq!(job.steps_completed, 0);
        assert_eq!(
            repository
                .field("JOB-BADINPUT", FIELD_STATUS)
                .await
                .as_deref(),
            Some("error")
        );
        let ops = repository.ops().await;
        assert!(!ops.iter().any(|op| op.starts_with("publish executeStep")));
    }

    #[tokio::test]
    async fn failed_step_sets_error_status_and_keeps_partial_output() {
        let (service, repository, _) = service_with(
            vec![StepProgram::Emit {
                stdout: "partial\n",
                stderr: "",
                exit: 1,
            }],
            false,
        );
        let mut job = job_with_steps("JOB-FAIL", vec![stdout_step("test/flaky")]);

        let result = service.execute(&mut job).await;

        assert!(matches!(result, Err(EngineError::StepFailed { .. })));
        assert_eq!(job.steps_completed, 0);
        assert_eq!(
            repository.field("JOB-FAIL", FIELD_STATUS).await.as_deref(),
            Some("error")
        );
        assert_eq!(
            repository.field("JOB-FAIL", "output").await.as_deref(),
            Some("partial\n")
        );
        let ops = repository.ops().await;
        assert!(!ops.iter().any(|op| op.starts_with("update completedSteps")));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_step_ends_the_job_with_an_error() {
        let (service, repository, executor) = service_with(vec![StepProgram::Hang], false);
        let mut step = stdout_step("test/sleepy");
        step.timeout = 1;
        let mut job = job_with_steps("JOB-TIMEOUT", vec![step, stdout_step("test/never")]);

        let result = service.execute(&mut job).await;

        assert!(matches!(result, Err(EngineError::Timeout)));
        assert_eq!(job.steps_completed, 0);
        assert_eq!(executor.stop_count(), 1);
        assert_eq!(
            repository
                .field("JOB-TIMEOUT", FIELD_STATUS)
                .await
                .as_deref(),
            Some("error")
        );
        // The second step never started.
        let ops = repository.ops().await;
        assert!(!ops.iter().any(|op| op == "publish executeStep=test/never"));
    }

    #[tokio::test]
    async fn remove_done_clears_the_index_on_both_outcomes() {
        for (programs, expect_err) in [
            (
                vec![StepProgram::Emit {
                    stdout: "ok\n",
                    stderr: "",
                    exit: 0,
                }],
                false,
            ),
            (
                vec![StepProgram::Emit {
                    stdout: "",
                    stderr: "boom\n",
                    exit: 1,
                }],
                true,
            ),
        ] {
            let (service, repository, _) = service_with(programs, true);
            let mut job = job_with_steps("JOB-REMOVE", vec![stdout_step("test/any")]);

            let result = service.execute(&mut job).await;

            assert_eq!(result.is_err(), expect_err);
            let ops = repository.ops().await;
            assert_eq!(ops.last().map(String::as_str), Some("deleteFromIndex"));
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_the_initial_record() {
        let (service, _, _) = service_with(vec![], false);
        let mut job = job_with_steps("", vec![stdout_step("a"), stdout_step("b")]);

        service.create(&mut job).await.unwrap();
        let stored = service.get_by_id(&job.id).await.unwrap();

        assert_eq!(stored.id, job.id);
        assert_eq!(stored.status, "");
        assert_eq!(stored.steps_completed, 0);
        assert_eq!(stored.total_steps, 2);
    }

    #[tokio::test]
    async fn delete_then_get_reports_not_found() {
        let (service, _, _) = service_with(vec![], false);
        let mut job = job_with_steps("", vec![stdout_step("a")]);

        service.create(&mut job).await.unwrap();
        service.delete(&job).await.unwrap();

        let result = service.get_by_id(&job.id).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
