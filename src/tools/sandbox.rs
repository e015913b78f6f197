//! Sandbox capability
//!
//! Isolated execution for untrusted evolved code. The contract enforces
//! no-network and resource caps; the bundled process runner is for local
//! development, production deployments plug in a container runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::SandboxLimits;
use crate::error::{AgencyError, AgencyResult};

/// One sandboxed execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub code: String,
    pub limits: SandboxLimits,
}

impl SandboxRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Result of a sandboxed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SandboxResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Isolated code execution capability.
#[async_trait]
pub trait SandboxCapability: Send + Sync {
    async fn execute_code(&self, request: SandboxRequest) -> AgencyResult<SandboxResult>;
}

/// Local process sandbox: a syntax/compile probe with a hard timeout.
///
/// Resource caps beyond the timeout are the container runtime's job;
/// this runner refuses to execute when networking is requested enabled.
pub struct ProcessSandbox {
    interpreter: String,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxCapability for ProcessSandbox {
    async fn execute_code(&self, request: SandboxRequest) -> AgencyResult<SandboxResult> {
        if !request.limits.network_disabled {
            return Err(AgencyError::Validation(
                "sandbox runs must have networking disabled".to_string(),
            ));
        }

        let dir = tempfile::tempdir()
            .map_err(|e| AgencyError::provider("sandbox", e.to_string()))?;
        let path = dir.path().join("candidate.py");
        tokio::fs::write(&path, &request.code)
            .await
            .map_err(|e| AgencyError::provider("sandbox", e.to_string()))?;

        // Byte-compile only: validates the variant without running it
        let child = tokio::process::Command::new(&self.interpreter)
            .arg("-m")
            .arg("py_compile")
            .arg(&path)
            .output();

        let output = tokio::time::timeout(Duration::from_secs(request.limits.timeout_secs), child)
            .await
            .map_err(|_| {
                warn!("sandbox timed out after {}s", request.limits.timeout_secs);
                AgencyError::provider("sandbox", "execution timed out")
            })?
            .map_err(|e| AgencyError::provider("sandbox", e.to_string()))?;

        Ok(SandboxResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Scripted sandbox for tests: replays configured results.
pub struct ScriptedSandbox {
    results: tokio::sync::Mutex<std::collections::VecDeque<SandboxResult>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<SandboxResult>) -> Self {
        Self {
            results: tokio::sync::Mutex::new(results.into_iter().collect()),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![])
    }
}

#[async_trait]
impl SandboxCapability for ScriptedSandbox {
    async fn execute_code(&self, _request: SandboxRequest) -> AgencyResult<SandboxResult> {
        Ok(self.results.lock().await.pop_front().unwrap_or(SandboxResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_enabled_requests_are_rejected() {
        let sandbox = ProcessSandbox::new();
        let mut limits = SandboxLimits::default();
        limits.network_disabled = false;
        let err = sandbox
            .execute_code(SandboxRequest::new("print('x')").with_limits(limits))
            .await
            .err()
            .expect("must reject");
        assert!(matches!(err, AgencyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_scripted_sandbox_defaults_to_success() {
        let sandbox = ScriptedSandbox::passing();
        let result = sandbox
            .execute_code(SandboxRequest::new("anything"))
            .await
            .unwrap();
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_scripted_sandbox_replays_failures() {
        let sandbox = ScriptedSandbox::new(vec![SandboxResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "SyntaxError".to_string(),
        }]);
        let result = sandbox
            .execute_code(SandboxRequest::new("def broken(:"))
            .await
            .unwrap();
        assert!(!result.succeeded());
        assert!(result.stderr.contains("SyntaxError"));
    }
}
