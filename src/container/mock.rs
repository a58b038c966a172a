//! In-memory `ContainerRuntime` used by tests. Records every call.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::runtime::{ContainerRuntime, ContainerSpec};
use crate::errors::ContainerError;
use crate::sandbox::ExecOutcome;

pub struct MockRuntime {
    create_error: Option<String>,
    install_exit_code: i32,
    http_ready: bool,
    created: AtomicUsize,
    execs: Mutex<Vec<String>>,
    stops: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    /// Keeps dev-process output channels open.
    streams: Mutex<Vec<mpsc::Sender<String>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            create_error: None,
            install_exit_code: 0,
            http_ready: true,
            created: AtomicUsize::new(0),
            execs: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        }
    }
}

impl MockRuntime {
    /// Every `create` fails with a Docker error carrying `message`.
    pub fn failing_create(message: impl Into<String>) -> Self {
        Self {
            create_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// `npm install` exits with `code`.
    pub fn failing_install(code: i32) -> Self {
        Self {
            install_exit_code: code,
            ..Self::default()
        }
    }

    /// The dev server never answers HTTP.
    pub fn never_http_ready() -> Self {
        Self {
            http_ready: false,
            ..Self::default()
        }
    }

    pub fn exec_calls(&self) -> Vec<String> {
        self.execs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        if let Some(e) = &self.create_error {
            return Err(ContainerError::Docker(e.clone()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{}", spec.name, n))
    }

    async fn exec(
        &self,
        _container_id: &str,
        argv: Vec<String>,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<ExecOutcome, ContainerError> {
        let line = argv.join(" ");
        let exit_code = if line == "npm install" {
            self.install_exit_code
        } else {
            0
        };
        self.execs.lock().unwrap_or_else(|e| e.into_inner()).push(line);
        Ok(ExecOutcome {
            exit_code: Some(exit_code),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "npm ERR! code E404".to_string()
            },
            ..ExecOutcome::default()
        })
    }

    async fn exec_stream(
        &self,
        _container_id: &str,
        argv: Vec<String>,
        _env: Vec<String>,
    ) -> Result<mpsc::Receiver<String>, ContainerError> {
        let (tx, rx) = mpsc::channel(16);
        if argv.iter().any(|a| a == "vite") {
            let _ = tx.send("  VITE v5.4.0  ready in 210 ms".to_string()).await;
        } else {
            let _ = tx.send("Server listening on 3001".to_string()).await;
        }
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        Ok(rx)
    }

    async fn stop_processes(&self, _container_id: &str) -> Result<(), ContainerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> Result<(), ContainerError> {
        self.destroyed.lock().unwrap_or_else(|e| e.into_inner()).push(container_id.to_string());
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn http_ready(&self, _port: u16) -> bool {
        self.http_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::machine::PortPair;

    #[tokio::test]
    async fn test_builders_configure_failures() {
        let spec = ContainerSpec {
            name: "appforge-test".into(),
            image: "node:20-alpine".into(),
            sandbox_dir: "/tmp/appforge-test".into(),
            ports: PortPair {
                frontend: 5173,
                backend: 3001,
            },
            memory_bytes: None,
            nano_cpus: None,
            env: vec![],
        };
        let runtime = MockRuntime::failing_create("no such image");
        assert!(matches!(runtime.create(&spec).await, Err(ContainerError::Docker(m)) if m == "no such image"));
        assert_eq!(runtime.created(), 0);

        let runtime = MockRuntime::failing_install(1);
        let out = runtime
            .exec("c", vec!["npm".into(), "install".into()], Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert_eq!(runtime.exec_calls(), vec!["npm install".to_string()]);

        assert!(!MockRuntime::never_http_ready().http_ready(5173).await);
        assert!(MockRuntime::default().http_ready(5173).await);
    }
}
