//! Typed tree nodes. The arena maps opaque ids to nodes; parent/child
//! relations are ids, never owning references.

use chrono::{DateTime, Utc};
use clockwork_core::{InvocationId, MediaOutput, Message, NodeId, Usage};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a gadget node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GadgetState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl GadgetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for GadgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a gadget was skipped without running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A declared dependency failed or was itself skipped.
    FailedDependency(InvocationId),
    /// The call sits on a dependency cycle.
    CyclicDependency,
    /// A declared dependency names no call in the batch.
    UnknownDependency(InvocationId),
    /// An earlier failure halted the batch before this call started.
    BatchHalted(InvocationId),
    /// The loop was cancelled before this call started.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedDependency(id) => write!(f, "failed_dependency:{id}"),
            Self::CyclicDependency => write!(f, "cyclic_dependency"),
            Self::UnknownDependency(id) => write!(f, "unknown_dependency:{id}"),
            Self::BatchHalted(id) => write!(f, "batch_halted:{id}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One LLM call. Root nodes are the loop's own calls; non-root ones belong
/// to subagent gadgets.
#[derive(Clone, Debug)]
pub struct LlmCallNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub depth: usize,
    pub path: Vec<NodeId>,
    /// 1-based loop iteration that opened this call.
    pub iteration: u32,
    pub model: String,
    pub request_messages: Vec<Message>,
    pub response_text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
    pub children: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LlmCallNode {
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One gadget invocation.
#[derive(Clone, Debug)]
pub struct GadgetNode {
    pub id: NodeId,
    /// Always the owning LLM call.
    pub parent: NodeId,
    pub depth: usize,
    pub path: Vec<NodeId>,
    pub invocation_id: InvocationId,
    pub name: String,
    pub parameters: serde_json::Value,
    pub dependencies: Vec<InvocationId>,
    pub state: GadgetState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub failed_dependency: Option<InvocationId>,
    pub execution_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub media: Vec<MediaOutput>,
    /// True iff any child is an LLM call.
    pub is_subagent: bool,
    pub children: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields the caller supplies when registering a gadget node.
#[derive(Clone, Debug)]
pub struct GadgetSeed {
    pub invocation_id: InvocationId,
    pub name: String,
    pub parameters: serde_json::Value,
    pub dependencies: Vec<InvocationId>,
}

/// Discriminated node union stored in the arena.
#[derive(Clone, Debug)]
pub enum Node {
    LlmCall(LlmCallNode),
    Gadget(GadgetNode),
}

impl Node {
    pub fn id(&self) -> &NodeId {
        match self {
            Node::LlmCall(n) => &n.id,
            Node::Gadget(n) => &n.id,
        }
    }

    pub fn parent(&self) -> Option<&NodeId> {
        match self {
            Node::LlmCall(n) => n.parent.as_ref(),
            Node::Gadget(n) => Some(&n.parent),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Node::LlmCall(n) => n.depth,
            Node::Gadget(n) => n.depth,
        }
    }

    pub fn path(&self) -> &[NodeId] {
        match self {
            Node::LlmCall(n) => &n.path,
            Node::Gadget(n) => &n.path,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match self {
            Node::LlmCall(n) => &n.children,
            Node::Gadget(n) => &n.children,
        }
    }

    pub fn cost_usd(&self) -> Option<f64> {
        match self {
            Node::LlmCall(n) => n.cost_usd,
            Node::Gadget(n) => n.cost_usd,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Node::LlmCall(n) => n.is_terminal(),
            Node::Gadget(n) => n.state.is_terminal(),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Node::LlmCall(n) => n.completed_at,
            Node::Gadget(n) => n.completed_at,
        }
    }

    pub fn as_llm_call(&self) -> Option<&LlmCallNode> {
        match self {
            Node::LlmCall(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_gadget(&self) -> Option<&GadgetNode> {
        match self {
            Node::Gadget(n) => Some(n),
            _ => None,
        }
    }
}
