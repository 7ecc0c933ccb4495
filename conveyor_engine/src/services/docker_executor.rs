//! Docker-backed step executor.
//!
//! Each step runs in its own container, attached so the engine can feed
//! stdin and stream stdout/stderr. Missing images are pulled on demand.
//! File-pipe steps get the per-step host file bind-mounted at `/tmp/pipe`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::job::Job;
use crate::services::step_executor::{StepExecutor, StepInput, StepSink};

/// Container path where a file-pipe step writes its output.
pub const FILE_PIPE_MOUNT: &str = "/tmp/pipe";

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerStepExecutor {
    docker: Docker,
    /// Container id per running job.
    containers: Mutex<HashMap<String, String>>,
}

impl DockerStepExecutor {
    /// Connect to the Docker daemon at `docker_host`.
    pub fn new(docker_host: &str) -> anyhow::Result<Self> {
        let docker = if docker_host.starts_with("unix://") {
            Docker::connect_with_unix(docker_host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(docker_host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        }
        .with_context(|| format!("connecting to Docker at {docker_host}"))?;

        Ok(Self {
            docker,
            containers: Mutex::new(HashMap::new()),
        })
    }

    async fn container_id(&self, job: &Job) -> anyhow::Result<String> {
        self.containers
            .lock()
            .await
            .get(&job.id)
            .cloned()
            .ok_or_else(|| anyhow!("no container registered for job {}", job.id))
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        tracing::info!(image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = pull.next().await {
            progress.with_context(|| format!("pulling image {image}"))?;
        }

        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .context("removing step container")?;
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for DockerStepExecutor {
    async fn start(
        &self,
        job: &Job,
        step_index: usize,
        mut stdin: StepInput,
        mut stdout: StepSink,
        mut stderr: StepSink,
    ) -> anyhow::Result<()> {
        let step = job
            .steps
            .get(step_index)
            .ok_or_else(|| anyhow!("job {} has no step {step_index}", job.id))?;

        let env: Vec<String> = step
            .environment
            .iter()
            .map(|e| format!("{}={}", e.variable, e.value))
            .collect();

        let host_config = step.uses_file_pipe().then(|| HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                job.step_pipe_path(step_index).display(),
                FILE_PIPE_MOUNT
            )]),
            ..Default::default()
        });

        let config = Config {
            image: Some(step.source.clone()),
            cmd: (!step.command.is_empty()).then(|| step.command.clone()),
            env: Some(env),
            working_dir: step.working_dir.clone(),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            host_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("conveyor-{}-{}", job.id, step_index),
            platform: None,
        };

        let created = match self
            .docker
            .create_container(Some(options.clone()), config.clone())
            .await
        {
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                self.pull_image(&step.source).await?;
                self.docker.create_container(Some(options), config).await
            }
            other => other,
        }
        .with_context(|| format!("creating container for image {}", step.source))?;
        let container_id = created.id;

        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = match self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
        {
            Ok(attached) => attached,
            Err(error) => {
                let _ = self.remove_container(&container_id).await;
                return Err(error).context("attaching to step container");
            }
        };
        let AttachContainerResults {
            mut output,
            mut input,
        } = attached;

        if let Err(error) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove_container(&container_id).await;
            return Err(error)
                .with_context(|| format!("starting container for image {}", step.source));
        }

        tracing::debug!(job_id = %job.id, step = step_index, container_id = %container_id, "Step container started");
        self.containers
            .lock()
            .await
            .insert(job.id.clone(), container_id);

        // Feed stdin until the previous step's output is exhausted, then
        // close so the step sees EOF.
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin, &mut input).await;
            let _ = input.shutdown().await;
        });

        // Demux attach frames into the caller's sinks. Dropping the sinks
        // when the stream ends is what signals EOF to the capture tasks.
        tokio::spawn(async move {
            while let Some(frame) = output.next().await {
                let written = match frame {
                    Ok(LogOutput::StdOut { message }) => stdout.write_all(&message).await,
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(_) => Ok(()),
                    Err(_) => break,
                };
                if written.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn inspect(&self, job: &Job) -> anyhow::Result<()> {
        let container_id = self.container_id(job).await?;

        let mut wait = Box::pin(
            self.docker
                .wait_container(&container_id, None::<WaitContainerOptions<String>>),
        );

        match wait.next().await {
            Some(Ok(response)) if response.status_code == 0 => Ok(()),
            Some(Ok(response)) => bail!("step exited with status {}", response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                bail!("step exited with status {code}")
            }
            Some(Err(error)) => Err(error).context("waiting for step container"),
            None => bail!("container wait stream ended without a response"),
        }
    }

    async fn stop(&self, job: &Job) -> anyhow::Result<()> {
        let container_id = self.container_id(job).await?;
        self.docker
            .stop_container(&container_id, Some(StopContainerOptions { t: 0 }))
            .await
            .context("stopping step container")?;
        Ok(())
    }

    async fn clean_up(&self, job: &Job) -> anyhow::Result<()> {
        let container_id = match self.containers.lock().await.remove(&job.id) {
            Some(id) => id,
            None => return Ok(()),
        };
        self.remove_container(&container_id).await
    }
}
