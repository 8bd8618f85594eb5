//! Tree events. Every mutation emits exactly one, globally ordered by
//! `event_id` within one tree.

use chrono::{DateTime, Utc};
use clockwork_core::{InvocationId, NodeId, Usage};

#[derive(Clone, Debug)]
pub struct TreeEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: TreeEventKind,
}

#[derive(Clone, Debug)]
pub enum TreeEventKind {
    LlmCallStart {
        node_id: NodeId,
        model: String,
        iteration: u32,
    },
    LlmCallStream {
        node_id: NodeId,
        text: String,
    },
    LlmCallComplete {
        node_id: NodeId,
        finish_reason: Option<String>,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
    },
    LlmCallError {
        node_id: NodeId,
        error: String,
        /// True when a later retry attempt succeeded; the node stays open.
        recovered: bool,
    },
    GadgetCall {
        node_id: NodeId,
        invocation_id: InvocationId,
        name: String,
    },
    GadgetStart {
        node_id: NodeId,
    },
    GadgetComplete {
        node_id: NodeId,
        result: String,
    },
    GadgetError {
        node_id: NodeId,
        error: String,
    },
    GadgetSkipped {
        node_id: NodeId,
        reason: String,
    },
    /// Free text emitted outside gadget blocks, tied to the open LLM call.
    Text {
        node_id: Option<NodeId>,
        text: String,
    },
    Compaction(CompactionReport),
}

impl TreeEventKind {
    /// Stable discriminant used for filtered listener registration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LlmCallStart { .. } => "llm_call_start",
            Self::LlmCallStream { .. } => "llm_call_stream",
            Self::LlmCallComplete { .. } => "llm_call_complete",
            Self::LlmCallError { .. } => "llm_call_error",
            Self::GadgetCall { .. } => "gadget_call",
            Self::GadgetStart { .. } => "gadget_start",
            Self::GadgetComplete { .. } => "gadget_complete",
            Self::GadgetError { .. } => "gadget_error",
            Self::GadgetSkipped { .. } => "gadget_skipped",
            Self::Text { .. } => "text",
            Self::Compaction { .. } => "compaction",
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::LlmCallStart { node_id, .. }
            | Self::LlmCallStream { node_id, .. }
            | Self::LlmCallComplete { node_id, .. }
            | Self::LlmCallError { node_id, .. }
            | Self::GadgetCall { node_id, .. }
            | Self::GadgetStart { node_id }
            | Self::GadgetComplete { node_id, .. }
            | Self::GadgetError { node_id, .. }
            | Self::GadgetSkipped { node_id, .. } => Some(node_id),
            Self::Text { node_id, .. } => node_id.as_ref(),
            Self::Compaction(_) => None,
        }
    }
}

/// Before/after shape of one compaction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_before: usize,
    pub messages_after: usize,
    /// Tokens saved across every compaction so far in this loop.
    pub total_saved: usize,
}
