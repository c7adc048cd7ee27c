// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic. Stage agents
// depend on these narrow capabilities, never on the orchestrator itself.

use anyhow::Result;
use async_trait::async_trait;

// =============================================================================
// Reasoner (generic LLM capabilities)
// =============================================================================

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Complete a prompt (returns raw text response).
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Complete a prompt expecting a JSON response (returns the raw JSON
    /// string; callers parse with `serde_json`).
    async fn complete_json(&self, prompt: &str) -> Result<String> {
        self.complete(prompt).await
    }
}

// =============================================================================
// Embedder
// =============================================================================

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch. Default maps over [`Embedder::embed`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Embedding dimension, used for schema checks.
    fn dimension(&self) -> usize;
}

// =============================================================================
// ToolProvider (external tools: search, fetch, parse)
// =============================================================================

#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Run a named external tool with a JSON argument payload.
    async fn invoke(&self, tool: &str, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Tool provider for deployments with no external tools wired up.
pub struct NoTools;

#[async_trait]
impl ToolProvider for NoTools {
    async fn invoke(&self, tool: &str, _args: serde_json::Value) -> Result<serde_json::Value> {
        anyhow::bail!("no tool provider configured (requested {tool})")
    }
}
