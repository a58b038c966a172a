use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::runtime::ContainerRuntime;
use crate::errors::ExecError;
use crate::sandbox::{CommandKind, CommandRunner, ExecOutcome, parse_command};

/// Runs whitelisted commands inside a session's container rather than on
/// the host. Same whitelist and timeouts as `LocalExecutor`.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
}

impl ContainerExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_id: impl Into<String>) -> Self {
        Self {
            runtime,
            container_id: container_id.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ContainerExecutor {
    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutcome, ExecError> {
        let parsed = parse_command(command)?;
        let timeout = CommandKind::classify(&parsed).timeout();
        self.runtime
            .exec(&self.container_id, parsed.argv(), timeout, cancel)
            .await
            .map_err(|e| ExecError::Container(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mock::MockRuntime;

    #[tokio::test]
    async fn test_whitelist_applies_before_container() {
        let runtime = Arc::new(MockRuntime::default());
        let exec = ContainerExecutor::new(runtime.clone(), "c1");
        let cancel = CancellationToken::new();

        assert!(matches!(
            exec.run("bash -c 'rm -rf /'", &cancel).await,
            Err(ExecError::NotAllowed(_))
        ));
        let out = exec.run("npm install", &cancel).await.unwrap();
        assert!(out.success());
        assert_eq!(runtime.exec_calls(), vec!["npm install".to_string()]);
    }
}
