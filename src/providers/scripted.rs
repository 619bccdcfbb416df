//! Scripted oracle
//!
//! Serves queued canned responses, split into chunks to exercise the
//! streaming path. Used by tests and offline dry runs.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::brain::oracle::{ChunkStream, Oracle};
use crate::brain::router::ModelTier;
use crate::core::error::{MaestroError, Result};

/// Oracle backed by pre-seeded responses
pub struct ScriptedOracle {
    translations: Mutex<VecDeque<String>>,
    reflections: Mutex<VecDeque<String>>,
    /// Tiers that fail on every call, for fallback tests
    failing_tiers: Vec<ModelTier>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            translations: Mutex::new(VecDeque::new()),
            reflections: Mutex::new(VecDeque::new()),
            failing_tiers: Vec::new(),
        }
    }

    pub fn with_failing_tiers(mut self, tiers: Vec<ModelTier>) -> Self {
        self.failing_tiers = tiers;
        self
    }

    pub async fn push_translation(&self, response: impl Into<String>) {
        self.translations.lock().await.push_back(response.into());
    }

    pub async fn push_reflection(&self, response: impl Into<String>) {
        self.reflections.lock().await.push_back(response.into());
    }

    fn chunked(text: String) -> ChunkStream {
        let chunks: Vec<Result<String>> = text
            .as_bytes()
            .chunks(16)
            .map(|c| Ok(String::from_utf8_lossy(c).to_string()))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    fn check_tier(&self, tier: ModelTier) -> Result<()> {
        if self.failing_tiers.contains(&tier) {
            Err(MaestroError::translation(format!(
                "scripted failure for tier {}",
                tier
            )))
        } else {
            Ok(())
        }
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn translate(&self, _prompt: &str, tier: ModelTier) -> Result<ChunkStream> {
        self.check_tier(tier)?;
        let response = self
            .translations
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| MaestroError::translation("scripted oracle has no queued translation"))?;
        Ok(Self::chunked(response))
    }

    async fn reflect(&self, _prompt: &str, tier: ModelTier) -> Result<ChunkStream> {
        self.check_tier(tier)?;
        let response = self
            .reflections
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| MaestroError::translation("scripted oracle has no queued reflection"))?;
        Ok(Self::chunked(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::oracle::collect_stream;
    use crate::execution::cancel::CancellationToken;

    #[tokio::test]
    async fn test_queued_responses_in_order() {
        let oracle = ScriptedOracle::new();
        oracle.push_translation("first").await;
        oracle.push_translation("second").await;

        let a = oracle.translate("p", ModelTier::Local).await.unwrap();
        let b = oracle.translate("p", ModelTier::Local).await.unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(collect_stream(a, &cancel).await.unwrap(), "first");
        assert_eq!(collect_stream(b, &cancel).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_empty_queue_errors() {
        let oracle = ScriptedOracle::new();
        assert!(oracle.translate("p", ModelTier::Local).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_tier() {
        let oracle = ScriptedOracle::new().with_failing_tiers(vec![ModelTier::Local]);
        oracle.push_translation("x").await;
        assert!(oracle.translate("p", ModelTier::Local).await.is_err());
        assert!(oracle.translate("p", ModelTier::Cheap).await.is_ok());
    }
}
