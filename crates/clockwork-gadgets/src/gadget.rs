//! The Gadget trait and the execution context handed to every invocation.

use crate::registry::GadgetRegistry;
use crate::schema::Schema;
use clockwork_core::{InvocationId, MediaOutput, NodeId};
use clockwork_llm::ProviderAdapter;
use clockwork_tree::ExecutionTree;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a gadget hands back to the executor. Control flow that the source
/// of this design expressed as exceptions is tagged here instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GadgetReply {
    /// Normal result text, fed to the model as the next user turn.
    Output(String),
    /// The task is done; the agent loop ends with this message.
    Complete(String),
    /// The gadget needs an answer from the human-input collaborator; the
    /// answer becomes the invocation's result.
    NeedsHuman(String),
}

/// The gadget capability set.
///
/// A gadget is a named, schema-typed operation callable by the LLM through
/// markers. `execute` failures are opaque to the engine and surface as
/// `status=error` result text.
#[async_trait::async_trait]
pub trait Gadget: Send + Sync {
    /// Unique name, matched case-insensitively by the registry.
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// Input schema; the executor validates parsed parameters against it.
    fn schema(&self) -> Arc<dyn Schema>;

    /// Per-call timeout override. `None` defers to the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run one validated invocation.
    async fn execute(&self, parameters: Value, ctx: &GadgetContext) -> anyhow::Result<GadgetReply>;
}

/// Loop-level settings a gadget may read.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: Option<f32>,
}

/// Overrides applied when a gadget spawns a nested agent loop.
#[derive(Clone, Debug, Default)]
pub struct SubagentOverrides {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
}

/// Per-invocation context. Exposes cost/media reporting, the owning loop's
/// settings, the cancellation signal, and a child tree view plus provider
/// and registry handles so subagent gadgets can mount a nested loop under
/// their own node.
pub struct GadgetContext {
    invocation_id: InvocationId,
    node_id: NodeId,
    tree: ExecutionTree,
    cancel: CancellationToken,
    agent: AgentSettings,
    subagent: SubagentOverrides,
    provider: Option<Arc<dyn ProviderAdapter>>,
    registry: Option<Arc<GadgetRegistry>>,
    cost_usd: Mutex<f64>,
    media: Mutex<Vec<MediaOutput>>,
}

impl GadgetContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invocation_id: InvocationId,
        node_id: NodeId,
        tree: ExecutionTree,
        cancel: CancellationToken,
        agent: AgentSettings,
        subagent: SubagentOverrides,
        provider: Option<Arc<dyn ProviderAdapter>>,
        registry: Option<Arc<GadgetRegistry>>,
    ) -> Self {
        Self {
            invocation_id,
            node_id,
            tree,
            cancel,
            agent,
            subagent,
            provider,
            registry,
            cost_usd: Mutex::new(0.0),
            media: Mutex::new(Vec::new()),
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Loop settings (model, temperature) of the owning agent.
    pub fn agent(&self) -> &AgentSettings {
        &self.agent
    }

    /// Configured overrides for nested agent loops.
    pub fn subagent_overrides(&self) -> &SubagentOverrides {
        &self.subagent
    }

    /// Tree view rooted under this gadget's node. LLM calls and gadgets a
    /// nested loop records here appear as children of this invocation.
    pub fn child_tree(&self) -> ExecutionTree {
        self.tree
            .child_view(&self.node_id)
            .expect("gadget node exists for the lifetime of its context")
    }

    pub fn provider(&self) -> Option<Arc<dyn ProviderAdapter>> {
        self.provider.clone()
    }

    pub fn registry(&self) -> Option<Arc<GadgetRegistry>> {
        self.registry.clone()
    }

    /// Cancellation signal of the owning loop. Long-running gadgets should
    /// return promptly once it trips.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Add to this invocation's reported cost.
    pub fn report_cost(&self, usd: f64) {
        *self.cost_usd.lock().unwrap() += usd;
    }

    /// Attach a media artifact to this invocation's node.
    pub fn attach_media(&self, media: MediaOutput) {
        self.media.lock().unwrap().push(media);
    }

    /// Total cost reported so far.
    pub fn reported_cost(&self) -> f64 {
        *self.cost_usd.lock().unwrap()
    }

    /// Media attached so far (drains the buffer).
    pub fn take_media(&self) -> Vec<MediaOutput> {
        std::mem::take(&mut *self.media.lock().unwrap())
    }
}
