//! Agent invocation via the CLI binary.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::process::Command;

use super::{AgentInvoker, AgentOutcome, PromptConfig, extract_outcome};

/// Configuration for the agent CLI subprocess.
#[derive(Debug, Clone)]
pub struct CliAgentConfig {
    /// Agent binary name or path.
    pub binary: String,
    /// Hard wall-clock limit for one invocation.
    pub timeout_secs: u64,
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            timeout_secs: 600,
        }
    }
}

/// Invokes the agent as a one-shot subprocess in print mode and parses
/// its JSON result from stdout.
pub struct CliAgent {
    config: CliAgentConfig,
}

impl CliAgent {
    pub fn new(config: CliAgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentInvoker for CliAgent {
    async fn invoke(&self, config: PromptConfig) -> Result<AgentOutcome> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(config.max_turns.to_string())
            .arg("--permission-mode")
            .arg(&config.permission_mode);

        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg(&config.prompt);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(key) = &config.api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "invoking agent binary {} (max_turns={}, permission_mode={})",
            self.config.binary, config.max_turns, config.permission_mode
        );

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "agent invocation timed out after {}s",
                self.config.timeout_secs
            )
        })?
        .context("spawning agent process")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("agent process exited with {}", output.status);
            bail!(
                "agent process failed with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let payload: Value = serde_json::from_str(stdout.trim())
            .context("parsing agent result JSON from stdout")?;

        Ok(extract_outcome(&payload))
    }
}
