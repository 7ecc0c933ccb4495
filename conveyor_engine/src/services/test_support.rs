//! Shared stub backends for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::models::error::EngineError;
use crate::models::job::{
    Job, JobLog, FIELD_COMPLETED_STEPS, FIELD_STATUS, FIELD_TOTAL_STEPS,
};
use crate::services::repository::JobRepository;
use crate::services::step_executor::{StepExecutor, StepInput, StepSink};

/// In-memory repository that records every operation in arrival order, so
/// tests can assert on bookkeeping sequences.
#[derive(Default)]
pub(crate) struct MemoryRepository {
    pub records: Mutex<HashMap<String, HashMap<String, String>>>,
    pub logs: Mutex<HashMap<String, Vec<String>>>,
    pub index: Mutex<Vec<String>>,
    /// Updates, publishes, output writes, and deletions, in arrival order.
    pub ops: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl MemoryRepository {
    pub async fn field(&self, job_id: &str, field: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(job_id)
            .and_then(|record| record.get(field))
            .cloned()
    }

    pub async fn ops(&self) -> Vec<String> {
        self.ops.lock().await.clone()
    }

    /// Log lines of `job_id`, in arrival order.
    pub async fn lines(&self, job_id: &str) -> Vec<String> {
        self.logs.lock().await.get(job_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn all(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self
            .index
            .lock()
            .await
            .iter()
            .map(|id| Job {
                id: id.clone(),
                ..Job::default()
            })
            .collect())
    }

    async fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        let records = self.records.lock().await;
        let record = records
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;

        let parse_or = |field: &str| record.get(field).and_then(|v| v.parse().ok());

        Ok(Job {
            id: job_id.to_string(),
            steps_completed: parse_or(FIELD_COMPLETED_STEPS).unwrap_or(0),
            total_steps: parse_or(FIELD_TOTAL_STEPS).unwrap_or(0),
            status: record.get(FIELD_STATUS).cloned().unwrap_or_default(),
            ..Job::default()
        })
    }

    async fn create(&self, job: &mut Job) -> Result<(), EngineError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        job.id = format!("JOB-{n}");
        job.total_steps = job.steps.len();

        self.index.lock().await.push(job.id.clone());
        self.records.lock().await.insert(
            job.id.clone(),
            HashMap::from([
                (FIELD_TOTAL_STEPS.to_string(), job.steps.len().to_string()),
                (FIELD_COMPLETED_STEPS.to_string(), "0".to_string()),
                (FIELD_STATUS.to_string(), String::new()),
            ]),
        );
        Ok(())
    }

    async fn update(&self, job_id: &str, field: &str, value: &str) -> Result<(), EngineError> {
        self.records
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        self.ops.lock().await.push(format!("update {field}={value}"));
        Ok(())
    }

    async fn publish_message(
        &self,
        _job_id: &str,
        kind: &str,
        payload: &str,
    ) -> Result<(), EngineError> {
        self.ops.lock().await.push(format!("publish {kind}={payload}"));
        Ok(())
    }

    async fn set_output(&self, job_id: &str, value: &str) -> Result<(), EngineError> {
        self.records
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .insert("output".to_string(), value.to_string());
        self.ops.lock().await.push(format!("output {value}"));
        Ok(())
    }

    async fn append_log_line(&self, job_id: &str, line: &str) -> Result<(), EngineError> {
        self.logs
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn get_job_log(&self, job_id: &str, index: usize) -> Result<JobLog, EngineError> {
        let logs = self.logs.lock().await;
        let lines = logs
            .get(job_id)
            .map(|lines| lines.iter().skip(index).cloned().collect())
            .unwrap_or_default();
        Ok(JobLog { lines })
    }

    async fn delete_from_index(&self, job_id: &str) -> Result<(), EngineError> {
        self.index.lock().await.retain(|id| id != job_id);
        self.ops.lock().await.push("deleteFromIndex".to_string());
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<(), EngineError> {
        self.delete_from_index(job_id).await?;
        self.records.lock().await.remove(job_id);
        self.logs.lock().await.remove(job_id);
        self.ops.lock().await.push("delete".to_string());
        Ok(())
    }
}

/// What the next started step should do.
pub(crate) enum StepProgram {
    /// Write the given bytes to stdout/stderr, then exit with the code.
    Emit {
        stdout: &'static str,
        stderr: &'static str,
        exit: i32,
    },
    /// Read stdin to EOF, uppercase it, write it to stdout, exit 0.
    Uppercase,
    /// Write the bytes to the job's file-pipe path, exit 0.
    WriteFile(&'static [u8]),
    /// Never exit until stopped.
    Hang,
    /// Refuse to start.
    RefuseStart,
}

/// Executor stub that plays one scripted program per started step.
pub(crate) struct ScriptedExecutor {
    programs: Mutex<VecDeque<StepProgram>>,
    running: Mutex<HashMap<String, JoinHandle<i32>>>,
    stops: AtomicUsize,
    clean_ups: AtomicUsize,
    fail_stop: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new(programs: Vec<StepProgram>) -> Self {
        Self {
            programs: Mutex::new(programs.into()),
            running: Mutex::new(HashMap::new()),
            stops: AtomicUsize::new(0),
            clean_ups: AtomicUsize::new(0),
            fail_stop: AtomicBool::new(false),
        }
    }

    pub fn with_failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn clean_up_count(&self) -> usize {
        self.clean_ups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn start(
        &self,
        job: &Job,
        step_index: usize,
        mut stdin: StepInput,
        mut stdout: StepSink,
        mut stderr: StepSink,
    ) -> anyhow::Result<()> {
        let program = self
            .programs
            .lock()
            .await
            .pop_front()
            .expect("no scripted program left");
        let pipe_path = job.step_pipe_path(step_index);

        let handle = match program {
            StepProgram::RefuseStart => bail!("image pull failed"),
            StepProgram::Emit {
                stdout: out,
                stderr: err,
                exit,
            } => tokio::spawn(async move {
                drop(stdin);
                let _ = stdout.write_all(out.as_bytes()).await;
                let _ = stderr.write_all(err.as_bytes()).await;
                exit
            }),
            StepProgram::Uppercase => tokio::spawn(async move {
                let mut input = String::new();
                let _ = stdin.read_to_string(&mut input).await;
                let _ = stdout.write_all(input.to_uppercase().as_bytes()).await;
                drop(stderr);
                0
            }),
            StepProgram::WriteFile(bytes) => tokio::spawn(async move {
                // Write before releasing the sinks: the runner reads the
                // file as soon as both captures see EOF.
                let code = match tokio::fs::write(&pipe_path, bytes).await {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                drop((stdin, stdout, stderr));
                code
            }),
            StepProgram::Hang => tokio::spawn(async move {
                let _hold = (stdin, stdout, stderr);
                std::future::pending::<()>().await;
                0
            }),
        };

        self.running.lock().await.insert(job.id.clone(), handle);
        Ok(())
    }

    async fn inspect(&self, job: &Job) -> anyhow::Result<()> {
        let handle = self
            .running
            .lock()
            .await
            .remove(&job.id)
            .expect("inspect without start");
        match handle.await {
            Ok(0) => Ok(()),
            Ok(code) => bail!("step exited with status {code}"),
            Err(_) => bail!("step program aborted"),
        }
    }

    async fn stop(&self, job: &Job) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            bail!("no such container");
        }
        if let Some(handle) = self.running.lock().await.remove(&job.id) {
            handle.abort();
        }
        Ok(())
    }

    async fn clean_up(&self, _job: &Job) -> anyhow::Result<()> {
        self.clean_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
