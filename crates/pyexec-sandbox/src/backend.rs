//! Execution backends
//!
//! A backend runs the scope's runner script in some isolated process and
//! hands back the captured output. Backends know nothing about outcomes;
//! classification happens in [`crate::outcome::classify`].

use crate::error::SandboxError;
use crate::outcome::ProcessOutput;
use crate::scope::{ExecutionScope, RUNNER_FILE};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use ulid::Ulid;

/// Runs the runner script of a scope
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logs and metadata
    fn name(&self) -> &str;

    /// Run `_runner.py` inside `scope`, killed after `timeout`
    ///
    /// # Errors
    /// Returns `SandboxError::Spawn` if the process cannot be started.
    async fn run(&self, scope: &ExecutionScope, timeout: Duration) -> Result<ProcessOutput, SandboxError>;
}

/// Spawn `command` and wait for it, bounded by `timeout`
///
/// The child is spawned with `kill_on_drop`, so dropping the wait future
/// (on timeout or when the caller is cancelled) kills the process.
async fn run_with_timeout(
    mut command: Command,
    program: &str,
    timeout: Duration,
) -> Result<ProcessOutput, SandboxError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command
        .spawn()
        .map_err(|e| SandboxError::spawn_error(program, e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            elapsed: started.elapsed(),
        }),
        Ok(Err(e)) => Err(SandboxError::spawn_error(program, e)),
        Err(_) => {
            tracing::warn!(program, timeout_secs = timeout.as_secs_f64(), "execution timed out, process killed");
            Ok(ProcessOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                elapsed: started.elapsed(),
            })
        }
    }
}

/// Sub-process on the host interpreter
#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    python: String,
    env_allowlist: Vec<String>,
}

impl LocalProcessBackend {
    /// Backend using `python` with an empty environment
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            env_allowlist: Vec::new(),
        }
    }

    /// Pass these host variables through to the child
    #[must_use]
    pub fn with_env_allowlist(mut self, vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_allowlist = vars.into_iter().map(Into::into).collect();
        self
    }

    /// Interpreter path
    #[inline]
    #[must_use]
    pub fn python(&self) -> &str {
        &self.python
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        "local"
    }

    #[tracing::instrument(skip(self, scope), fields(scope = %scope.id()))]
    async fn run(&self, scope: &ExecutionScope, timeout: Duration) -> Result<ProcessOutput, SandboxError> {
        let mut command = Command::new(&self.python);
        command.arg(RUNNER_FILE).current_dir(scope.root()).env_clear();
        for var in &self.env_allowlist {
            if let Some(value) = std::env::var_os(var) {
                command.env(var, value);
            }
        }
        command
            .env("MPLBACKEND", "Agg")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1");

        run_with_timeout(command, &self.python, timeout).await
    }
}

/// Container run through a docker-compatible engine
///
/// The scope is bind-mounted at `/workspace`. A guard issues
/// `<engine> kill` if the run is abandoned, since killing the engine
/// client does not always stop the container.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    engine: String,
    image: String,
    python: String,
    network: Option<String>,
    env_allowlist: Vec<String>,
}

/// Mount point of the scope inside the container
pub const CONTAINER_WORKDIR: &str = "/workspace";

impl ContainerBackend {
    /// Backend running `image` with `engine`
    pub fn new(engine: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            image: image.into(),
            python: "python3".to_string(),
            network: None,
            env_allowlist: Vec::new(),
        }
    }

    /// Interpreter inside the image
    #[must_use]
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Container network (`none` to disable networking)
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Pass these host variables through to the container
    #[must_use]
    pub fn with_env_allowlist(mut self, vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_allowlist = vars.into_iter().map(Into::into).collect();
        self
    }

    /// Engine arguments for one run
    fn run_args(&self, scope: &ExecutionScope, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", scope.root().display()),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            "-e".to_string(),
            "MPLBACKEND=Agg".to_string(),
            "-e".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        for var in &self.env_allowlist {
            args.push("-e".to_string());
            args.push(var.clone());
        }
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.push(self.image.clone());
        args.push(self.python.clone());
        args.push(RUNNER_FILE.to_string());
        args
    }
}

/// Container name for one run: scope id plus a per-run ULID
///
/// `--rm` removal is asynchronous, so reusing a name across attempts can
/// collide with a container that is still being torn down.
fn container_name(scope: &ExecutionScope) -> String {
    format!(
        "pyexec-{}-{}",
        scope.id().to_string().to_lowercase(),
        Ulid::new().to_string().to_lowercase()
    )
}

/// Kills a named container unless disarmed
struct ContainerKillGuard {
    engine: String,
    name: String,
    armed: bool,
}

impl ContainerKillGuard {
    fn new(engine: &str, name: &str) -> Self {
        Self {
            engine: engine.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn kill_command(&self) -> Command {
        let mut command = Command::new(&self.engine);
        command
            .args(["kill", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    /// Kill now and wait for the engine to answer
    async fn kill(mut self) {
        self.disarm();
        report_kill(&self.name, self.kill_command().status().await);
    }
}

fn report_kill(name: &str, status: std::io::Result<std::process::ExitStatus>) {
    match status {
        Ok(status) if status.success() => tracing::debug!(container = name, "container killed"),
        // Non-zero usually means the container already exited
        Ok(status) => tracing::debug!(container = name, ?status, "container kill returned non-zero"),
        Err(e) => tracing::warn!(container = name, error = %e, "failed to run container kill"),
    }
}

impl Drop for ContainerKillGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(container = %self.name, "killing abandoned container");
        let mut command = self.kill_command();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { report_kill(&name, command.status().await) });
            }
            Err(_) => {
                let status = std::process::Command::new(&self.engine)
                    .args(["kill", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                report_kill(&name, status);
            }
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    #[tracing::instrument(skip(self, scope), fields(scope = %scope.id(), image = %self.image))]
    async fn run(&self, scope: &ExecutionScope, timeout: Duration) -> Result<ProcessOutput, SandboxError> {
        let container_name = container_name(scope);
        let mut command = Command::new(&self.engine);
        command.args(self.run_args(scope, &container_name)).env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        for var in &self.env_allowlist {
            if let Some(value) = std::env::var_os(var) {
                command.env(var, value);
            }
        }

        let mut guard = ContainerKillGuard::new(&self.engine, &container_name);
        let output = run_with_timeout(command, &self.engine, timeout).await?;
        if output.timed_out {
            guard.kill().await;
        } else {
            guard.disarm();
        }
        Ok(output)
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Host interpreter
    Local {
        /// Interpreter path
        #[serde(default = "default_python")]
        python: String,
    },
    /// Docker-compatible container
    Container {
        /// Engine binary (`docker`, `podman`)
        #[serde(default = "default_engine")]
        engine: String,
        /// Image with the facility Python environment
        image: String,
        /// Interpreter inside the image
        #[serde(default = "default_python")]
        python: String,
        /// Container network
        #[serde(default)]
        network: Option<String>,
    },
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_engine() -> String {
    "docker".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local {
            python: default_python(),
        }
    }
}

impl BackendConfig {
    /// Check the configuration is usable
    ///
    /// # Errors
    /// Returns `SandboxError::InvalidBackend` on empty program names.
    pub fn validate(&self) -> Result<(), SandboxError> {
        match self {
            Self::Local { python } if python.trim().is_empty() => {
                Err(SandboxError::InvalidBackend("local python path is empty".into()))
            }
            Self::Container { engine, image, python, .. } => {
                if engine.trim().is_empty() {
                    return Err(SandboxError::InvalidBackend("container engine is empty".into()));
                }
                if image.trim().is_empty() {
                    return Err(SandboxError::InvalidBackend("container image is empty".into()));
                }
                if python.trim().is_empty() {
                    return Err(SandboxError::InvalidBackend("container python path is empty".into()));
                }
                Ok(())
            }
            Self::Local { .. } => Ok(()),
        }
    }

    /// Instantiate the backend
    ///
    /// # Errors
    /// Returns `SandboxError::InvalidBackend` if validation fails.
    pub fn build(&self, env_allowlist: &[String]) -> Result<Arc<dyn ExecutionBackend>, SandboxError> {
        self.validate()?;
        let backend: Arc<dyn ExecutionBackend> = match self {
            Self::Local { python } => {
                Arc::new(LocalProcessBackend::new(python).with_env_allowlist(env_allowlist.iter().cloned()))
            }
            Self::Container {
                engine,
                image,
                python,
                network,
            } => {
                let mut backend = ContainerBackend::new(engine, image)
                    .with_python(python)
                    .with_env_allowlist(env_allowlist.iter().cloned());
                if let Some(network) = network {
                    backend = backend.with_network(network);
                }
                Arc::new(backend)
            }
        };
        Ok(backend)
    }
}
