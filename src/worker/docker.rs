//! Docker-backed worker executor (feature = "docker").
//!
//! One ephemeral container per stage invocation: the prompt is written
//! into the bind-mounted workspace, the container receives its identity
//! through the environment, and the executor waits for the container to
//! exit, collecting its logs for the structured result. A reaper guard
//! force-removes the container if the execute future is dropped mid-run
//! (timeout or abort), so no unit outlives its worker run.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::errors::WorkerError;
use crate::settings::WorkerSettings;
use crate::worker::process::parse_result_line;
use crate::worker::{WorkerExecutor, WorkerOutput, WorkerSpec};

pub struct DockerExecutor {
    docker: Docker,
    image: String,
    network: Option<String>,
}

impl DockerExecutor {
    pub fn new(settings: &WorkerSettings) -> Result<Self, WorkerError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            WorkerError::SpawnFailed {
                role: "any".into(),
                reason: format!("docker daemon unreachable: {e}"),
            }
        })?;
        Ok(Self {
            docker,
            image: settings.image.clone(),
            network: settings.network.clone(),
        })
    }

    fn spawn_err(&self, spec: &WorkerSpec, e: impl std::fmt::Display) -> WorkerError {
        WorkerError::SpawnFailed {
            role: spec.role.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Force-removes the container when dropped while armed. Disarmed on the
/// normal path after the explicit removal.
struct ContainerReaper {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerReaper {
    fn arm(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerReaper {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let name = self.name.clone();
        warn!(container = %name, "reaping worker container");
        tokio::spawn(async move {
            let _ = docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        });
    }
}

fn build_env(spec: &WorkerSpec, prompt_file: &str) -> Vec<String> {
    vec![
        format!("VANGUARD_RUN_ID={}", spec.run_id),
        format!("VANGUARD_ROLE={}", spec.role),
        format!("VANGUARD_STAGE={}", spec.stage),
        format!("VANGUARD_PROMPT_FILE={prompt_file}"),
        "VANGUARD_WORKSPACE=/workspace".to_string(),
    ]
}

#[async_trait]
impl WorkerExecutor for DockerExecutor {
    async fn execute(&self, spec: &WorkerSpec) -> Result<WorkerOutput, WorkerError> {
        // The prompt travels through the bind mount, not the environment.
        let prompt_dir = spec.workspace.join(".vanguard-prompts");
        std::fs::create_dir_all(&prompt_dir)?;
        let prompt_path: PathBuf = prompt_dir.join(format!("{}.md", spec.run_id));
        std::fs::write(
            &prompt_path,
            format!("{}\n\n{}", spec.instructions, spec.context),
        )?;
        let prompt_in_container = format!("/workspace/.vanguard-prompts/{}.md", spec.run_id);

        let name = format!("vanguard-worker-{}", spec.run_id);
        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/workspace:rw", spec.workspace.display())]),
            network_mode: self.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.image.clone()),
            env: Some(build_env(spec, &prompt_in_container)),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| self.spawn_err(spec, e))?;
        let mut reaper = ContainerReaper::arm(self.docker.clone(), name.clone());

        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| self.spawn_err(spec, e))?;
        debug!(container = %name, image = %self.image, "worker container started");

        let mut wait = self
            .docker
            .wait_container(&name, None::<WaitContainerOptions<String>>);
        let status_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // The wait stream reports nonzero exits as errors on some
            // daemon versions; the logs still tell us what happened.
            Some(Err(_)) | None => -1,
        };

        let mut logs = self.docker.logs(
            &name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );
        let mut raw_output = String::new();
        while let Some(chunk) = logs.next().await {
            if let Ok(chunk) = chunk {
                raw_output.push_str(&chunk.to_string());
            }
        }

        reaper.disarm();
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        let _ = std::fs::remove_file(&prompt_path);

        if let Some(result) = parse_result_line(&raw_output) {
            return Ok(WorkerOutput {
                success: result.success,
                summary: result.summary,
                artifacts: result.artifacts,
                error: result.error,
                raw_output,
            });
        }

        let success = status_code == 0;
        Ok(WorkerOutput {
            success,
            summary: String::new(),
            artifacts: Vec::new(),
            error: if success {
                None
            } else {
                Some(format!("container exited with status {status_code}"))
            },
            raw_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use std::time::Duration;

    #[test]
    fn env_carries_run_identity() {
        let spec = WorkerSpec {
            run_id: "run_abc".into(),
            role: Stage::Review.role(),
            stage: Stage::Review,
            instructions: String::new(),
            context: String::new(),
            workspace: PathBuf::from("/ws"),
            timeout: Duration::from_secs(1),
        };
        let env = build_env(&spec, "/workspace/.vanguard-prompts/run_abc.md");
        assert!(env.contains(&"VANGUARD_RUN_ID=run_abc".to_string()));
        assert!(env.contains(&"VANGUARD_ROLE=reviewer".to_string()));
        assert!(env.contains(&"VANGUARD_STAGE=review".to_string()));
    }
}
