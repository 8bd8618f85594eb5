//! The provider adapter trait. The core never performs HTTP itself; it
//! consumes an abstract stream of chunks and cancels by dropping it.

use crate::types::{ProviderRequest, StreamChunk};
use clockwork_core::Message;
use futures::Stream;
use std::pin::Pin;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry policy should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_) | Self::RateLimited { .. } | Self::StreamError(_)
        )
    }
}

/// Stream of response chunks from one provider call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<StreamChunk>> + Send>>;

/// Capability set a provider adapter exposes to the loop.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streaming completion. The caller cancels by dropping the
    /// returned stream.
    async fn stream(&self, request: ProviderRequest) -> ProviderResult<ChunkStream>;

    /// Optional precise token count for the compactor. `None` means the
    /// caller falls back to estimation.
    async fn count_tokens(&self, _model: &str, _messages: &[Message]) -> Option<u32> {
        None
    }

    /// Context window of a model, when the adapter knows it.
    fn context_window(&self, _model: &str) -> Option<u32> {
        None
    }
}
