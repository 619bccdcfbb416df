//! Oracle interface
//!
//! The LLM backend is an oracle with two streamed operations: `translate`
//! (utterance to Intent JSON) and `reflect` (goal evaluation). Streams are
//! finite, non-restartable chunk sequences; callers consume to completion
//! before parsing. A consumption interrupted by cancellation yields an
//! error so the caller never caches a partial translation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::brain::router::ModelTier;
use crate::core::error::{MaestroError, Result};
use crate::execution::cancel::CancellationToken;

/// Finite sequence of text chunks from a streaming oracle call
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// LLM backend abstraction
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    /// Translate a prompt into Intent JSON, streamed.
    async fn translate(&self, prompt: &str, tier: ModelTier) -> Result<ChunkStream>;

    /// Reflect on goal achievement, streamed.
    async fn reflect(&self, prompt: &str, tier: ModelTier) -> Result<ChunkStream>;

    /// Describe an image for vision-assisted steps. Optional.
    async fn describe_image(&self, _image_base64: &str, _prompt: &str) -> Result<String> {
        Err(MaestroError::internal(
            "oracle",
            "image description is not supported by this backend",
        ))
    }
}

/// Drain a chunk stream to completion.
///
/// Cancellation mid-stream aborts with an error; the partial buffer is
/// discarded so it can never reach caches or metrics.
pub async fn collect_stream(mut stream: ChunkStream, cancel: &CancellationToken) -> Result<String> {
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        cancel.check()?;
        buffer.push_str(&chunk?);
    }
    Ok(buffer)
}

/// Crude token estimate for accounting (about 4 chars per token)
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Prompt instructing the oracle to emit the Intent JSON shape.
pub fn translation_prompt(utterance: &str, context: &str, observations: &[String]) -> String {
    let mut prompt = String::from(
        "Translate the user's request into a JSON execution plan.\n\n\
         Respond with a single JSON object of this exact shape:\n\
         {\n\
           \"goal\": \"short description of the goal\",\n\
           \"steps\": [\n\
             {\"tool\": \"FileOps\", \"action\": \"scan\", \"args\": {\"path\": \"...\"}, \"risk\": 0}\n\
           ]\n\
         }\n\n\
         Risk levels: 0 read-only, 1 safe create/move, 2 overwrite, 3 destructive.\n\n",
    );

    if !context.is_empty() {
        prompt.push_str(&format!("Context:\n{}\n\n", context));
    }
    if !observations.is_empty() {
        prompt.push_str("Previous observations:\n");
        for obs in observations.iter().rev().take(5).rev() {
            prompt.push_str(&format!("- {}\n", obs));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("Request: {}", utterance));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::cancel::CancelReason;

    fn stream_of(chunks: Vec<&'static str>) -> ChunkStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(c.to_string())),
        ))
    }

    #[tokio::test]
    async fn test_collect_accumulates_chunks() {
        let stream = stream_of(vec!["{\"goal\"", ": \"x\"}"]);
        let text = collect_stream(stream, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "{\"goal\": \"x\"}");
    }

    #[tokio::test]
    async fn test_cancelled_stream_discards_buffer() {
        let cancel = CancellationToken::new();
        cancel.cancel(CancelReason::UserRequested);

        let stream = stream_of(vec!["partial"]);
        let err = collect_stream(stream, &cancel).await.unwrap_err();
        assert!(matches!(err, MaestroError::Cancelled));
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_prompt_appends_last_five_observations() {
        let observations: Vec<String> = (0..8).map(|i| format!("obs {}", i)).collect();
        let prompt = translation_prompt("do it", "", &observations);
        assert!(prompt.contains("obs 7"));
        assert!(prompt.contains("obs 3"));
        assert!(!prompt.contains("obs 2"));
    }
}
