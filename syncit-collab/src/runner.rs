//! Code execution gateway.
//!
//! Runs a file's current content in a throwaway container and reports the
//! outcome as a typed result. A failed run is an error value with a kind
//! ([`RunError`]), never a message folded into the program output.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::registry::SessionRegistry;
use crate::session::FileId;
use crate::storage::{PersistenceError, PersistenceGateway};

/// Upper bound on the cleanup `docker kill` after a timed-out run.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Source code plus the extension that selects its toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub code: String,
    pub extension: String,
}

/// Captured result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Why a run did not produce output.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unsupported language for extension `{0}`")]
    UnsupportedLanguage(String),
    #[error("failed to launch executor: {0}")]
    Launch(#[from] std::io::Error),
    #[error("run exceeded {0:?}")]
    Timeout(Duration),
    #[error("could not load source: {0}")]
    Persistence(#[from] PersistenceError),
}

impl RunError {
    /// Stable name of the failure kind, for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::Launch(_) => "launch",
            Self::Timeout(_) => "timeout",
            Self::Persistence(_) => "persistence",
        }
    }
}

/// Languages the executor knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
    Ruby,
    Go,
}

impl Language {
    /// Map a file extension (with or without the leading dot).
    pub fn from_extension(extension: &str) -> Option<Self> {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(Self::Python),
            "js" => Some(Self::JavaScript),
            "java" => Some(Self::Java),
            "cpp" | "cc" | "cxx" | "c" => Some(Self::Cpp),
            "rb" => Some(Self::Ruby),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    pub fn image(self) -> &'static str {
        match self {
            Self::Python => "python:3.12-alpine",
            Self::JavaScript => "node:20-alpine",
            Self::Java => "eclipse-temurin:21-jdk-alpine",
            Self::Cpp => "gcc:13",
            Self::Ruby => "ruby:3.3-alpine",
            Self::Go => "golang:1.22-alpine",
        }
    }

    /// Shell command run inside the container; the source arrives on stdin.
    pub fn command(self) -> &'static str {
        match self {
            Self::Python => "cat > main.py && python3 main.py",
            Self::JavaScript => "cat > main.js && node main.js",
            Self::Java => "cat > Main.java && java Main.java",
            Self::Cpp => "cat > main.cpp && g++ -O1 -o main main.cpp && ./main",
            Self::Ruby => "cat > main.rb && ruby main.rb",
            Self::Go => "cat > main.go && go run main.go",
        }
    }
}

/// Something that can execute a [`RunRequest`].
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &RunRequest) -> Result<RunOutput, RunError>;
}

/// Docker executor configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker CLI binary
    pub docker_bin: String,
    /// Wall-clock limit per run
    pub timeout: Duration,
    /// Container memory limit (docker `--memory` syntax)
    pub memory_limit: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            timeout: Duration::from_secs(10),
            memory_limit: "256m".to_string(),
        }
    }
}

/// Runs code with `docker run --rm -i --network none`.
pub struct DockerExecutor {
    config: DockerConfig,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the docker binary for `language`.
    ///
    /// `name` labels the container so a timed-out run can be killed on the
    /// daemon, not just in the local CLI.
    pub fn docker_args(&self, language: Language, name: &str) -> Vec<String> {
        [
            "run",
            "--rm",
            "-i",
            "--name",
            name,
            "--network",
            "none",
            "--memory",
            self.config.memory_limit.as_str(),
            "--workdir",
            "/tmp",
            language.image(),
            "sh",
            "-c",
            language.command(),
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn kill_container(&self, name: &str) {
        let kill = Command::new(&self.config.docker_bin)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(KILL_TIMEOUT, kill).await {
            Ok(Ok(status)) if status.success() => log::debug!("Killed container {name}"),
            Ok(Ok(status)) => log::warn!("docker kill {name} exited with {status}"),
            Ok(Err(e)) => log::warn!("Failed to run docker kill {name}: {e}"),
            Err(_) => log::warn!("docker kill {name} did not finish in {KILL_TIMEOUT:?}"),
        }
    }
}

#[async_trait]
impl CodeExecutor for DockerExecutor {
    async fn execute(&self, request: &RunRequest) -> Result<RunOutput, RunError> {
        let language = Language::from_extension(&request.extension)
            .ok_or_else(|| RunError::UnsupportedLanguage(request.extension.clone()))?;

        let name = format!("syncit-run-{}", Uuid::new_v4());
        let mut child = Command::new(&self.config.docker_bin)
            .args(self.docker_args(language, &name))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // The stdin write is covered by the timeout as well.
        let stdin = child.stdin.take();
        let code = request.code.as_bytes();
        let run = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(code).await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.config.timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                log::warn!("Run {name} exceeded {:?}, killing it", self.config.timeout);
                self.kill_container(&name).await;
                return Err(RunError::Timeout(self.config.timeout));
            }
        };

        log::debug!(
            "Run finished ({language:?}, exit {:?}, {} bytes stdout)",
            output.status.code(),
            output.stdout.len()
        );

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Runs a file by id, preferring unsaved content from a live session.
pub struct CodeRunner {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn PersistenceGateway>,
    executor: Arc<dyn CodeExecutor>,
}

impl CodeRunner {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn PersistenceGateway>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
        }
    }

    pub async fn run(&self, id: FileId, extension: &str) -> Result<RunOutput, RunError> {
        let code = match self.registry.get(id).await {
            Some(session) => session.snapshot().await,
            None => self.store.load_content(id).await?,
        };

        log::info!("Running file {id} as `{extension}` ({} bytes)", code.len());
        let request = RunRequest {
            code,
            extension: extension.to_string(),
        };
        self.executor.execute(&request).await
    }
}
