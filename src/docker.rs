//! Container driver backed by the Docker Engine API.
//!
//! The rest of the crate treats this module as opaque: [`Docker::run`]
//! pulls, creates and starts a container for a task config,
//! [`Docker::stop`] stops and removes one, and [`Docker::inspect`] returns
//! the engine's current description of one.

use std::collections::HashMap;
use std::io::Write;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, HostConfig, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use futures_util::stream::StreamExt;
use thiserror::Error;

use crate::task::{RestartPolicy, Task};

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("unable to connect to the docker daemon: {0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("error pulling image {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("error creating container from image {image}: {source}")]
    Create {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("error starting container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("error stopping container {id}: {source}")]
    Stop {
        id: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("error removing container {id}: {source}")]
    Remove {
        id: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("error inspecting container {id}: {source}")]
    Inspect {
        id: String,
        #[source]
        source: bollard::errors::Error,
    },
}

/// Everything the driver needs to run one task as a container.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub name: String,
    pub image: String,
    /// Fractional cores, converted to nano-CPUs for the engine.
    pub cpu: f64,
    /// Bytes.
    pub memory: i64,
    /// Bytes.
    pub disk: i64,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    /// Port/protocol pairs, e.g. "80/tcp".
    pub exposed_ports: Vec<String>,
    pub restart_policy: RestartPolicy,
}

impl TaskConfig {
    pub fn from_task(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            image: task.image.clone(),
            cpu: task.cpu,
            memory: task.memory,
            disk: task.disk,
            exposed_ports: task.exposed_ports.clone(),
            restart_policy: task.restart_policy,
            ..Default::default()
        }
    }
}

/// Outcome of a successful driver action.
#[derive(Debug, Clone)]
pub struct DriverResult {
    pub container_id: Option<String>,
    pub action: String,
    pub result: String,
}

/// Handle to the local Docker Engine.
#[derive(Debug, Clone)]
pub struct Docker {
    client: bollard::Docker,
}

impl Docker {
    pub fn new() -> Result<Self, DockerError> {
        let client = bollard::Docker::connect_with_unix_defaults().map_err(DockerError::Connect)?;
        Ok(Self { client })
    }

    /// Pull the image, create and start a container, then drain its current
    /// logs to stdout/stderr.
    pub async fn run(&self, config: &TaskConfig) -> Result<DriverResult, DockerError> {
        tracing::info!(image = %config.image, "pulling image");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(image = %config.image, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(DockerError::Pull {
                        image: config.image.clone(),
                        source: e,
                    });
                }
            }
        }

        let host_config = HostConfig {
            restart_policy: Some(restart_policy(config.restart_policy)),
            memory: Some(config.memory),
            nano_cpus: Some((config.cpu * 1_000_000_000.0) as i64),
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = config
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            tty: Some(false),
            env: Some(config.env.clone()),
            cmd: if config.cmd.is_empty() {
                None
            } else {
                Some(config.cmd.clone())
            },
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: config.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|e| DockerError::Create {
                image: config.image.clone(),
                source: e,
            })?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::Start {
                id: created.id.clone(),
                source: e,
            })?;
        tracing::info!(container_id = %created.id, name = %config.name, "container started");

        self.drain_logs(&created.id).await;

        Ok(DriverResult {
            container_id: Some(created.id),
            action: "start".to_string(),
            result: "success".to_string(),
        })
    }

    /// Stop the container, then remove it along with its volumes.
    pub async fn stop(&self, container_id: &str) -> Result<DriverResult, DockerError> {
        tracing::info!(container_id = %container_id, "stopping container");
        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(|e| DockerError::Stop {
                id: container_id.to_string(),
                source: e,
            })?;

        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: false,
                    link: false,
                }),
            )
            .await
            .map_err(|e| DockerError::Remove {
                id: container_id.to_string(),
                source: e,
            })?;

        Ok(DriverResult {
            container_id: Some(container_id.to_string()),
            action: "stop".to_string(),
            result: "success".to_string(),
        })
    }

    pub async fn inspect(
        &self,
        container_id: &str,
    ) -> Result<ContainerInspectResponse, DockerError> {
        self.client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DockerError::Inspect {
                id: container_id.to_string(),
                source: e,
            })
    }

    /// Copy whatever the container has logged so far to our stdout/stderr.
    /// Log-stream failures are not failures of the task.
    async fn drain_logs(&self, container_id: &str) {
        let mut logs = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdErr { message }) => {
                    let _ = std::io::stderr().write_all(&message);
                }
                Ok(output) => {
                    let _ = std::io::stdout().write_all(&output.into_bytes());
                }
                Err(e) => {
                    tracing::warn!(container_id = %container_id, error = %e, "log stream ended with error");
                    break;
                }
            }
        }
    }
}

fn restart_policy(policy: RestartPolicy) -> DockerRestartPolicy {
    let name = match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    };
    DockerRestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}
