//! Runs one job step: pipe setup, concurrent stream capture, timeout
//! enforcement, and output artifact collection.
//!
//! Each of a step's two output streams is read line-by-line by its own
//! capture task. Every line lands in the job's durable log; lines from the
//! stream selected by the step's piping discipline also accumulate in the
//! step's output buffer, subject to delimiter gating. The next step begins
//! only after both capture tasks have drained, so all log lines of step `i`
//! are appended before any line of step `i + 1`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, ReadHalf, SimplexStream};

use crate::models::error::EngineError;
use crate::models::job::{Job, StepPipe};
use crate::services::repository::JobRepository;
use crate::services::step_executor::{StepExecutor, StepInput};

/// Pipe buffer between the executor and a capture task.
const PIPE_BUFFER: usize = 64 * 1024;

/// What a capture task does with each line beyond logging it.
enum CaptureMode {
    /// Log only.
    Log,
    /// Forward every line into the output buffer.
    Forward,
    /// Forward only lines strictly between the delimiter lines.
    Delimited { begin: String, end: String },
}

/// Run the step at `step_index` with `stdin`, returning the step's output
/// artifact. An inspect failure returns `StepFailed` carrying the artifact
/// collected so far.
pub(crate) async fn run_step(
    repository: Arc<dyn JobRepository>,
    executor: &dyn StepExecutor,
    job: &Job,
    step_index: usize,
    stdin: StepInput,
) -> Result<Vec<u8>, EngineError> {
    let pipe_path = job.steps[step_index]
        .uses_file_pipe()
        .then(|| job.step_pipe_path(step_index));

    if let Some(path) = &pipe_path {
        // Pre-create the file the step will write to; only its contents
        // matter, the handle is dropped immediately.
        tokio::fs::File::create(path)
            .await
            .map_err(|source| EngineError::PipeSetup {
                path: path.clone(),
                source,
            })?;
    }

    let result = start_and_run(repository, executor, job, step_index, stdin).await;

    if let Some(path) = &pipe_path {
        let _ = tokio::fs::remove_file(path).await;
    }

    result
}

async fn start_and_run(
    repository: Arc<dyn JobRepository>,
    executor: &dyn StepExecutor,
    job: &Job,
    step_index: usize,
    stdin: StepInput,
) -> Result<Vec<u8>, EngineError> {
    let (out_reader, out_writer) = tokio::io::simplex(PIPE_BUFFER);
    let (err_reader, err_writer) = tokio::io::simplex(PIPE_BUFFER);

    executor
        .start(job, step_index, stdin, Box::new(out_writer), Box::new(err_writer))
        .await
        .map_err(|error| EngineError::ExecutorStart { error })?;

    let result = drive_captures(repository, executor, job, step_index, out_reader, err_reader).await;

    if let Err(error) = executor.clean_up(job).await {
        tracing::warn!(job_id = %job.id, step = step_index, %error, "step clean-up failed");
    }

    result
}

async fn drive_captures(
    repository: Arc<dyn JobRepository>,
    executor: &dyn StepExecutor,
    job: &Job,
    step_index: usize,
    out_reader: ReadHalf<SimplexStream>,
    err_reader: ReadHalf<SimplexStream>,
) -> Result<Vec<u8>, EngineError> {
    let step = &job.steps[step_index];

    let (out_mode, err_mode) = match &step.pipe {
        StepPipe::Stdout => (CaptureMode::Forward, CaptureMode::Log),
        StepPipe::Stderr => (CaptureMode::Log, CaptureMode::Forward),
        StepPipe::File => (CaptureMode::Log, CaptureMode::Log),
        StepPipe::Delimited {
            begin_delimiter,
            end_delimiter,
        } => (
            CaptureMode::Delimited {
                begin: begin_delimiter.clone(),
                end: end_delimiter.clone(),
            },
            CaptureMode::Log,
        ),
    };

    let out_task = tokio::spawn(capture(repository.clone(), job.id.clone(), out_mode, out_reader));
    let err_task = tokio::spawn(capture(repository, job.id.clone(), err_mode, err_reader));

    let drained = async move {
        let out = out_task.await.unwrap_or_default();
        let err = err_task.await.unwrap_or_default();
        (out, err)
    };

    let (out_buf, err_buf) = if step.timeout > 0 {
        match tokio::time::timeout(Duration::from_secs(step.timeout), drained).await {
            Ok(buffers) => buffers,
            Err(_) => {
                // The abandoned capture tasks keep draining until the stop
                // closes the pipes.
                executor
                    .stop(job)
                    .await
                    .map_err(|error| EngineError::ExecutorStop { error })?;
                return Err(EngineError::Timeout);
            }
        }
    } else {
        drained.await
    };

    let artifact = match &step.pipe {
        StepPipe::Stdout | StepPipe::Delimited { .. } => out_buf,
        StepPipe::Stderr => err_buf,
        StepPipe::File => {
            let path = job.step_pipe_path(step_index);
            tokio::fs::read(&path)
                .await
                .map_err(|source| EngineError::OutputRead { path, source })?
        }
    };

    match executor.inspect(job).await {
        Ok(()) => Ok(artifact),
        Err(error) => Err(EngineError::StepFailed {
            output: artifact,
            error,
        }),
    }
}

/// Read `reader` line-by-line until EOF. Every line goes to the debug log
/// and the job's durable log; forwarded lines accumulate in the returned
/// buffer with a trailing newline. Read errors end the capture silently —
/// they indicate pipe closure by the producer.
async fn capture(
    repository: Arc<dyn JobRepository>,
    job_id: String,
    mode: CaptureMode,
    reader: ReadHalf<SimplexStream>,
) -> Vec<u8> {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    let mut captured = Vec::new();
    // Delimited capture starts closed; a begin delimiter opens it.
    let mut gate_open = false;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        tracing::debug!(job_id = %job_id, "{line}");
        if let Err(error) = repository.append_log_line(&job_id, &line).await {
            tracing::warn!(job_id = %job_id, %error, "could not append log line");
        }

        match &mode {
            CaptureMode::Log => {}
            CaptureMode::Forward => {
                captured.extend_from_slice(line.as_bytes());
                captured.push(b'\n');
            }
            CaptureMode::Delimited { begin, end } => {
                // The end check precedes the forward decision and the begin
                // check follows it, so neither delimiter line is forwarded.
                if line == *end {
                    gate_open = false;
                }
                if gate_open {
                    captured.extend_from_slice(line.as_bytes());
                    captured.push(b'\n');
                }
                if line == *begin {
                    gate_open = true;
                }
            }
        }
    }

    captured
}
