//! Context compaction: shrink the conversation when it nears the model
//! window, either by dropping old turns or by summarising them.

use clockwork_core::{Content, Message, Role};
use clockwork_llm::{ProviderAdapter, ProviderRequest};
use clockwork_tree::CompactionReport;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

const CHARS_PER_TOKEN: f32 = 4.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Drop the oldest turns, keeping the system message and the most
    /// recent ones.
    SlidingWindow,
    /// Replace the dropped prefix with one assistant message summarising
    /// it, produced by the provider.
    SummariseTail,
}

#[derive(Clone, Debug)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategy,
    /// Estimated-token threshold that arms a compaction pass.
    pub threshold_tokens: usize,
    /// Most recent messages always preserved.
    pub keep_recent: usize,
}

impl CompactionConfig {
    pub fn sliding_window(threshold_tokens: usize, keep_recent: usize) -> Self {
        Self {
            strategy: CompactionStrategy::SlidingWindow,
            threshold_tokens,
            keep_recent,
        }
    }

    pub fn summarise_tail(threshold_tokens: usize, keep_recent: usize) -> Self {
        Self {
            strategy: CompactionStrategy::SummariseTail,
            threshold_tokens,
            keep_recent,
        }
    }
}

pub struct ContextCompactor {
    config: CompactionConfig,
    total_saved: AtomicUsize,
}

impl ContextCompactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            total_saved: AtomicUsize::new(0),
        }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &Message) -> usize {
        let content = match &message.content {
            Content::Text(s) => s.len(),
            Content::Parts(_) => message.content.text().len(),
        };
        (content as f32 / CHARS_PER_TOKEN).ceil() as usize + 10
    }

    pub fn conversation_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Self::message_tokens).sum()
    }

    /// Compact `messages` in place when over threshold. Returns the report
    /// to record on the tree, or `None` when nothing changed.
    pub async fn maybe_compact(
        &self,
        provider: &dyn ProviderAdapter,
        model: &str,
        messages: &mut Vec<Message>,
    ) -> Option<CompactionReport> {
        let tokens_before = match provider.count_tokens(model, messages).await {
            Some(n) => n as usize,
            None => Self::conversation_tokens(messages),
        };
        if tokens_before <= self.config.threshold_tokens {
            return None;
        }
        let messages_before = messages.len();

        // System message (index 0 by convention) survives every strategy.
        let system_count = usize::from(matches!(
            messages.first(),
            Some(Message {
                role: Role::System,
                ..
            })
        ));
        let keep_from = messages
            .len()
            .saturating_sub(self.config.keep_recent)
            .max(system_count);
        if keep_from <= system_count {
            return None;
        }

        let dropped: Vec<Message> = messages.drain(system_count..keep_from).collect();
        debug!(dropped = dropped.len(), "compacting conversation");

        if self.config.strategy == CompactionStrategy::SummariseTail {
            if let Some(summary) = summarise(provider, model, &dropped).await {
                messages.insert(
                    system_count,
                    Message::assistant(format!("Summary of the earlier conversation:\n{summary}")),
                );
            }
        }

        let tokens_after = Self::conversation_tokens(messages);
        let saved = tokens_before.saturating_sub(tokens_after);
        let total_saved = self.total_saved.fetch_add(saved, Ordering::Relaxed) + saved;
        info!(
            tokens_before,
            tokens_after,
            total_saved,
            "conversation compacted"
        );
        Some(CompactionReport {
            tokens_before,
            tokens_after,
            messages_before,
            messages_after: messages.len(),
            total_saved,
        })
    }

    pub fn total_saved(&self) -> usize {
        self.total_saved.load(Ordering::Relaxed)
    }
}

/// Ask the provider for a summary of the dropped prefix. Failures degrade
/// to plain truncation.
async fn summarise(
    provider: &dyn ProviderAdapter,
    model: &str,
    dropped: &[Message],
) -> Option<String> {
    let transcript = dropped
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            format!("{role}: {}", m.content.text())
        })
        .collect::<Vec<_>>()
        .join("\n");

    let request = ProviderRequest {
        model: model.to_string(),
        messages: vec![Message::user(format!(
            "Summarise the following conversation prefix in a few sentences, \
             keeping every fact a later turn might need:\n\n{transcript}"
        ))],
        ..Default::default()
    };

    let mut stream = provider.stream(request).await.ok()?;
    let mut summary = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => summary.push_str(&chunk.text),
            Err(_) => return None,
        }
    }
    if summary.trim().is_empty() {
        None
    } else {
        Some(summary)
    }
}
