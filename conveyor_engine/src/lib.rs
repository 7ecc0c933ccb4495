//! Conveyor — containerized pipeline job execution engine.
//!
//! Executes multi-step data-processing jobs as pipelines of containerized
//! commands, streaming the stdout of each step into the stdin of the next.
//! Job state (status, progress, log, final output) lives in Redis so that
//! multiple clients can observe progress concurrently.
//!
//! The engine drives each job through a bounded state machine, captures
//! stdout/stderr concurrently line-by-line, enforces per-step timeouts, and
//! records terminal status. The container runtime and the store are consumed
//! through the `StepExecutor` and `JobRepository` traits, so the engine runs
//! unchanged against stub backends.

pub mod config;
pub mod metrics;
pub mod models;
pub mod services;
