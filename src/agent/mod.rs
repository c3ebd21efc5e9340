//! Coding-agent invocation.
//!
//! The worker talks to the agent through [`AgentInvoker`], so tests can
//! substitute a scripted agent and the CLI binary stays an
//! implementation detail of [`cli::CliAgent`].

pub mod cli;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One prompt handed to the agent for a single turn.
#[derive(Debug, Clone)]
pub struct PromptConfig {
    pub prompt: String,
    /// Working directory for the agent process, when a workspace exists.
    pub working_dir: Option<std::path::PathBuf>,
    pub max_turns: i64,
    pub permission_mode: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/// Token usage reported by the agent for one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
    /// Set when the agent stopped because it exhausted its internal
    /// turn budget rather than finishing.
    pub hit_internal_turn_cap: bool,
}

/// A single-turn coding agent.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, config: PromptConfig) -> anyhow::Result<AgentOutcome>;
}

/// Extract an [`AgentOutcome`] from the agent's JSON result payload.
///
/// The response text is taken from the first shape that yields one:
/// a top-level `result` string, then typed text blocks under
/// `message.content` or `content`, then a synthesized placeholder so a
/// structurally odd payload still produces a visible response.
pub fn extract_outcome(payload: &Value) -> AgentOutcome {
    let text = payload
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            let blocks = payload
                .get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| payload.get("content"))?;
            collect_text_blocks(blocks)
        })
        .unwrap_or_else(|| "Agent returned a response in an unrecognized format.".to_string());

    let usage = payload
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    let cost_usd = payload.get("total_cost_usd").and_then(Value::as_f64);
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let hit_internal_turn_cap = payload
        .get("subtype")
        .and_then(Value::as_str)
        .map(|s| s == "error_max_turns")
        .unwrap_or(false);

    AgentOutcome {
        text,
        usage,
        cost_usd,
        model,
        hit_internal_turn_cap,
    }
}

fn collect_text_blocks(blocks: &Value) -> Option<String> {
    let items = blocks.as_array()?;
    let parts: Vec<&str> = items
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
