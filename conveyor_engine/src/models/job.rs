//! Job and step definitions — a job is a linear pipeline of containerized
//! steps, each handing its output to the next step's stdin.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_ERROR: &str = "error";

pub const FIELD_STATUS: &str = "status";
pub const FIELD_COMPLETED_STEPS: &str = "completedSteps";
pub const FIELD_TOTAL_STEPS: &str = "totalSteps";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_FINISHED_IN: &str = "finishedIn";
pub const FIELD_OUTPUT: &str = "output";

/// Transient event published when a step begins; the payload is the step's
/// image source.
pub const EVENT_EXECUTE_STEP: &str = "executeStep";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    /// Base64-encoded octets delivered as stdin to the first step; empty
    /// means no input.
    pub input: String,
    /// Empty before first execution, then one of running/complete/error.
    pub status: String,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub created_at: String,
    /// Seconds from `created_at` to terminal status.
    pub finished_in: f64,
    /// Captured output of the last step.
    pub output: String,
}

impl Job {
    /// Host path of the file-pipe file for the step at `index`.
    pub fn step_pipe_path(&self, index: usize) -> PathBuf {
        std::env::temp_dir().join(format!("conveyor-{}-{}", self.id, index))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    pub name: String,
    /// Container image reference.
    pub source: String,
    pub command: Vec<String>,
    pub environment: Vec<EnvVar>,
    pub working_dir: Option<String>,
    /// Seconds before the step is stopped; 0 means unbounded.
    pub timeout: u64,
    pub pipe: StepPipe,
}

impl Step {
    pub fn uses_file_pipe(&self) -> bool {
        matches!(self.pipe, StepPipe::File)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub variable: String,
    pub value: String,
}

/// How a step's output reaches the next step's stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepPipe {
    /// Stdout is piped onward.
    #[default]
    Stdout,
    /// Stderr is piped onward; stdout goes only to the log.
    Stderr,
    /// The step writes its output to a pre-created file.
    File,
    /// Only stdout lines strictly between the delimiter lines are piped
    /// onward; the delimiter lines themselves are not.
    #[serde(rename_all = "camelCase")]
    Delimited {
        begin_delimiter: String,
        end_delimiter: String,
    },
}

/// Projection of a job's log from a start index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLog {
    pub lines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_pipe_defaults_to_stdout() {
        let step: Step = serde_json::from_str(r#"{"source": "alpine"}"#).unwrap();
        assert_eq!(step.pipe, StepPipe::Stdout);
        assert_eq!(step.timeout, 0);
    }

    #[test]
    fn parses_delimited_pipe() {
        let json = r#"{
            "name": "extract",
            "source": "alpine",
            "command": ["sh", "-c", "cat data"],
            "environment": [{"variable": "MODE", "value": "fast"}],
            "timeout": 30,
            "pipe": {"delimited": {"beginDelimiter": "<<START>>", "endDelimiter": "<<END>>"}}
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(
            step.pipe,
            StepPipe::Delimited {
                begin_delimiter: "<<START>>".to_string(),
                end_delimiter: "<<END>>".to_string(),
            }
        );
        assert_eq!(step.environment[0].variable, "MODE");
    }

    #[test]
    fn parses_job_with_unit_pipe_variants() {
        let json = r#"{
            "name": "demo",
            "input": "aGVsbG8=",
            "steps": [
                {"source": "emit", "pipe": "stderr"},
                {"source": "collect", "pipe": "file"}
            ]
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.steps.len(), 2);
        assert_eq!(job.steps[0].pipe, StepPipe::Stderr);
        assert!(job.steps[1].uses_file_pipe());
        assert_eq!(job.status, "");
    }

    #[test]
    fn pipe_path_is_unique_per_step() {
        let job = Job {
            id: "AABB-1".to_string(),
            ..Job::default()
        };
        let first = job.step_pipe_path(0);
        let second = job.step_pipe_path(1);
        assert_ne!(first, second);
        assert!(first.to_string_lossy().contains("conveyor-AABB-1-0"));
    }
}
