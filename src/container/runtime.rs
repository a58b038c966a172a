use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::StartExecResults;
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::machine::PortPair;
use crate::errors::ContainerError;
use crate::sandbox::ExecOutcome;
use crate::sandbox::executor::MAX_OUTPUT_BYTES;

/// Where the sandbox directory is mounted inside the container.
pub const CONTAINER_WORKDIR: &str = "/app";
/// Ports the dev servers listen on inside the container.
pub const FRONTEND_CONTAINER_PORT: u16 = 5173;
pub const BACKEND_CONTAINER_PORT: u16 = 3001;

/// Everything needed to provision one session container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub sandbox_dir: PathBuf,
    pub ports: PortPair,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub env: Vec<String>,
}

/// Control surface of the external container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start an idle container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Run a command to completion inside the container.
    async fn exec(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, ContainerError>;

    /// Start a long-running command and stream its output line by line.
    async fn exec_stream(
        &self,
        container_id: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<mpsc::Receiver<String>, ContainerError>;

    /// Stop the dev processes but keep the container.
    async fn stop_processes(&self, container_id: &str) -> Result<(), ContainerError>;

    /// Stop and remove the container. Missing containers are not an error.
    async fn destroy(&self, container_id: &str) -> Result<(), ContainerError>;

    /// Whether something answers HTTP on the given host port.
    async fn http_ready(&self, port: u16) -> bool {
        probe_http(port).await
    }
}

/// A dev server counts as up once it answers with anything but a 5xx.
pub async fn probe_http(port: u16) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    match client.get(format!("http://127.0.0.1:{}/", port)).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

/// `ContainerRuntime` backed by the local Docker engine.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_err)?;
        Ok(Self { docker })
    }

    /// Check the engine answers before accepting work.
    pub async fn ping(&self) -> Result<(), ContainerError> {
        self.docker.ping().await.map_err(docker_err)?;
        Ok(())
    }

    async fn start_exec_output(
        &self,
        container_id: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<(String, StartExecResults), ContainerError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                ExecConfig {
                    cmd: Some(argv),
                    env: if env.is_empty() { None } else { Some(env) },
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(CONTAINER_WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_err)?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(docker_err)?;
        Ok((exec.id, started))
    }
}

fn docker_err(e: bollard::errors::Error) -> ContainerError {
    ContainerError::Docker(e.to_string())
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

fn binding(host_port: u16) -> Option<Vec<PortBinding>> {
    Some(vec![PortBinding {
        host_ip: Some("127.0.0.1".to_string()),
        host_port: Some(host_port.to_string()),
    }])
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(port_key(FRONTEND_CONTAINER_PORT), binding(spec.ports.frontend));
        port_bindings.insert(port_key(BACKEND_CONTAINER_PORT), binding(spec.ports.backend));

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    spec.sandbox_dir.display(),
                    CONTAINER_WORKDIR
                )]),
                port_bindings: Some(port_bindings),
                memory: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(docker_err)?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.destroy(&created.id).await;
            return Err(docker_err(e));
        }
        debug!(container = %created.id, name = %spec.name, "container started");
        Ok(created.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, ContainerError> {
        let started = Instant::now();
        let (exec_id, results) = self.start_exec_output(container_id, argv, Vec::new()).await?;
        let StartExecResults::Attached { mut output, .. } = results else {
            return Err(ContainerError::Docker("exec started detached".to_string()));
        };

        let mut outcome = ExecOutcome::default();
        let collect = async {
            while let Some(item) = output.next().await {
                let (target, message) = match item {
                    Ok(LogOutput::StdOut { message }) => (&mut outcome.stdout, message),
                    Ok(LogOutput::StdErr { message }) => (&mut outcome.stderr, message),
                    Ok(_) => continue,
                    Err(e) => return Err(docker_err(e)),
                };
                if target.len() < MAX_OUTPUT_BYTES {
                    target.push_str(&String::from_utf8_lossy(&message));
                } else {
                    outcome.truncated = true;
                }
            }
            Ok(())
        };

        let finished = tokio::select! {
            res = collect => { res?; true }
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(timeout) => false,
        };
        outcome.duration = started.elapsed();
        if !finished {
            outcome.cancelled = cancel.is_cancelled();
            outcome.timed_out = !outcome.cancelled;
            return Ok(outcome);
        }

        let inspect = self.docker.inspect_exec(&exec_id).await.map_err(docker_err)?;
        outcome.exit_code = inspect.exit_code.map(|c| c as i32);
        Ok(outcome)
    }

    async fn exec_stream(
        &self,
        container_id: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<mpsc::Receiver<String>, ContainerError> {
        let (_, results) = self.start_exec_output(container_id, argv, env).await?;
        let StartExecResults::Attached { mut output, .. } = results else {
            return Err(ContainerError::Docker("exec started detached".to_string()));
        };

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut pending = String::new();
            while let Some(item) = output.next().await {
                let chunk = match item {
                    Ok(out) => out.to_string(),
                    Err(e) => {
                        warn!(error = %e, "dev process log stream ended with error");
                        break;
                    }
                };
                pending.push_str(&chunk);
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    if tx.send(line.trim_end().to_string()).await.is_err() {
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                let _ = tx.send(pending).await;
            }
        });
        Ok(rx)
    }

    async fn stop_processes(&self, container_id: &str) -> Result<(), ContainerError> {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "kill -TERM -1 2>/dev/null || true".to_string(),
        ];
        self.exec(
            container_id,
            argv,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> Result<(), ContainerError> {
        let _ = self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(5).build()),
            )
            .await;
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_err(e)),
        }
    }
}
