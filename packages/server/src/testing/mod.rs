// Mock implementations for testing
//
// Scripted reasoner and a deterministic embedder, injectable wherever the
// capability traits are expected. Used by the scenario tests against the
// in-memory kernel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::common::content_hash;
use crate::kernel::traits::{Embedder, Reasoner};

// =============================================================================
// MockReasoner
// =============================================================================

/// Scripted reasoner: returns queued responses in order, then the default.
/// Records every prompt it sees.
pub struct MockReasoner {
    responses: Mutex<VecDeque<String>>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoner {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: "{\"blocks\": [], \"context_items\": []}".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next scripted response.
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().expect("mock poisoned").push_back(response.into());
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Prompts seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock poisoned").clone()
    }
}

impl Default for MockReasoner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().expect("mock poisoned").push(prompt.to_string());
        Ok(self
            .responses
            .lock()
            .expect("mock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone()))
    }
}

// =============================================================================
// MockEmbedder
// =============================================================================

/// Deterministic embedder: the vector is a pure function of the normalized
/// text, so identical content always lands at cosine similarity 1.0 and
/// unrelated content far apart.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self { dimension: 16 }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let hash = content_hash(text);
        let bytes = hash.as_bytes();
        // Signed components keep unrelated texts near cosine zero.
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let chunk = &bytes[i * 4..(i + 1) * 4];
                let mixed = chunk
                    .iter()
                    .enumerate()
                    .fold(0u32, |acc, (j, b)| acc.wrapping_mul(31).wrapping_add(*b as u32 + j as u32));
                (mixed % 1009) as f32 / 1009.0 - 0.5
            })
            .collect();
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-6 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// A reasoner that always fails, for retry-path tests.
pub struct FailingReasoner;

#[async_trait]
impl Reasoner for FailingReasoner {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        anyhow::bail!("reasoner unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::baskets::cosine_similarity;

    #[tokio::test]
    async fn identical_text_embeds_identically() {
        let embedder = MockEmbedder::new();
        let a = embedder.embed("Reduce MTTR below 10 minutes").await.unwrap();
        let b = embedder.embed("reduce mttr below 10 minutes!").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn scripted_responses_come_back_in_order() {
        let reasoner = MockReasoner::new();
        reasoner.push_response("first");
        reasoner.push_response("second");
        assert_eq!(reasoner.complete("a").await.unwrap(), "first");
        assert_eq!(reasoner.complete("b").await.unwrap(), "second");
        assert_eq!(
            reasoner.complete("c").await.unwrap(),
            "{\"blocks\": [], \"context_items\": []}"
        );
        assert_eq!(reasoner.prompts().len(), 3);
    }
}
