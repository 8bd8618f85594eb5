//! Arena-backed execution tree with single-writer mutation discipline and
//! an ordered event broadcast (synchronous listeners + async pull streams).

use crate::event::{CompactionReport, TreeEvent, TreeEventKind};
use crate::node::{GadgetNode, GadgetSeed, GadgetState, LlmCallNode, Node, SkipReason};
use chrono::Utc;
use clockwork_core::{InvocationId, MediaOutput, Message, NodeId, Usage};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("parent not found: {0}")]
    ParentNotFound(NodeId),

    #[error("a gadget's parent must be an LLM call: {0}")]
    ParentNotLlmCall(NodeId),

    #[error("a subtree view's parent must be a gadget: {0}")]
    ParentNotGadget(NodeId),

    #[error("node already terminal: {0}")]
    AlreadyTerminal(NodeId),

    #[error("node is not a gadget: {0}")]
    NotAGadget(NodeId),

    #[error("node is not an LLM call: {0}")]
    NotAnLlmCall(NodeId),

    #[error("gadget is not pending: {0}")]
    NotPending(NodeId),

    #[error("duplicate invocation id: {0}")]
    DuplicateInvocationId(InvocationId),
}

/// Terminal fields recorded when a gadget finishes.
#[derive(Clone, Debug)]
pub struct GadgetCompletion {
    pub outcome: Result<String, String>,
    pub execution_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub media: Vec<MediaOutput>,
}

impl GadgetCompletion {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            outcome: Ok(result.into()),
            execution_ms: None,
            cost_usd: None,
            media: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: Err(error.into()),
            execution_ms: None,
            cost_usd: None,
            media: Vec::new(),
        }
    }

    pub fn with_elapsed_ms(mut self, ms: u64) -> Self {
        self.execution_ms = Some(ms);
        self
    }

    pub fn with_cost(mut self, usd: f64) -> Self {
        self.cost_usd = Some(usd);
        self
    }

    pub fn with_media(mut self, media: Vec<MediaOutput>) -> Self {
        self.media = media;
        self
    }
}

/// Node-type filter for descendant queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeFilter {
    Any,
    LlmCalls,
    Gadgets,
}

impl NodeFilter {
    fn matches(&self, node: &Node) -> bool {
        match self {
            Self::Any => true,
            Self::LlmCalls => matches!(node, Node::LlmCall(_)),
            Self::Gadgets => matches!(node, Node::Gadget(_)),
        }
    }
}

type ListenerFn = Arc<dyn Fn(&TreeEvent) + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    /// `None` registers a wildcard listener, notified after filtered ones.
    kind: Option<&'static str>,
    callback: ListenerFn,
}

struct TreeState {
    nodes: HashMap<NodeId, Node>,
    roots: Vec<NodeId>,
    invocation_index: HashMap<InvocationId, NodeId>,
    next_event_id: u64,
    next_listener_id: u64,
    complete: bool,
}

struct Shared {
    state: Mutex<TreeState>,
    pending: Mutex<VecDeque<TreeEvent>>,
    dispatch_gate: Mutex<()>,
    listeners: Mutex<Vec<ListenerEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TreeEvent>>>,
}

/// Handle onto one execution tree. Cloning shares the backing store;
/// [`ExecutionTree::child_view`] produces a handle whose new roots attach
/// under a gadget node while events keep flowing through the one broadcast.
#[derive(Clone)]
pub struct ExecutionTree {
    shared: Arc<Shared>,
    base_depth: usize,
    parent: Option<NodeId>,
}

impl Default for ExecutionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeState {
                    nodes: HashMap::new(),
                    roots: Vec::new(),
                    invocation_index: HashMap::new(),
                    next_event_id: 1,
                    next_listener_id: 1,
                    complete: false,
                }),
                pending: Mutex::new(VecDeque::new()),
                dispatch_gate: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
            base_depth: 0,
            parent: None,
        }
    }

    /// Whether this handle is the root view (the one that may `complete()`).
    pub fn is_root_view(&self) -> bool {
        self.parent.is_none() && self.base_depth == 0
    }

    pub fn base_depth(&self) -> usize {
        self.base_depth
    }

    pub fn parent_node_id(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    /// View of the same store whose new roots attach under `parent` (which
    /// must be a gadget node).
    pub fn child_view(&self, parent: &NodeId) -> Result<ExecutionTree, TreeError> {
        let state = self.shared.state.lock().unwrap();
        let node = state
            .nodes
            .get(parent)
            .ok_or_else(|| TreeError::ParentNotFound(parent.clone()))?;
        let Node::Gadget(gadget) = node else {
            return Err(TreeError::ParentNotGadget(parent.clone()));
        };
        Ok(ExecutionTree {
            shared: Arc::clone(&self.shared),
            base_depth: gadget.depth + 1,
            parent: Some(parent.clone()),
        })
    }

    // -----------------------------------------------------------------
    // Mutations. Each emits exactly one event.
    // -----------------------------------------------------------------

    pub fn add_llm_call(
        &self,
        model: &str,
        iteration: u32,
        request_messages: Vec<Message>,
    ) -> Result<NodeId, TreeError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            let (id, parent, depth, parent_path) = match &self.parent {
                None => {
                    let n = state
                        .roots
                        .iter()
                        .filter(|r| matches!(state.nodes.get(*r), Some(Node::LlmCall(_))))
                        .count();
                    (
                        NodeId::new(format!("llm_{}", n + 1)),
                        None,
                        self.base_depth,
                        Vec::new(),
                    )
                }
                Some(parent_id) => {
                    let parent = state
                        .nodes
                        .get(parent_id)
                        .ok_or_else(|| TreeError::ParentNotFound(parent_id.clone()))?;
                    let Node::Gadget(gadget) = parent else {
                        return Err(TreeError::ParentNotGadget(parent_id.clone()));
                    };
                    let n = gadget.children.len();
                    (
                        NodeId::new(format!("{}_llm_{}", parent_id, n + 1)),
                        Some(parent_id.clone()),
                        gadget.depth + 1,
                        gadget.path.clone(),
                    )
                }
            };

            let mut path = parent_path;
            path.push(id.clone());
            let node = LlmCallNode {
                id: id.clone(),
                parent: parent.clone(),
                depth,
                path,
                iteration,
                model: model.to_string(),
                request_messages,
                response_text: String::new(),
                finish_reason: None,
                usage: None,
                cost_usd: None,
                error: None,
                children: Vec::new(),
                created_at: Utc::now(),
                completed_at: None,
            };
            state.nodes.insert(id.clone(), Node::LlmCall(node));
            match parent {
                None => state.roots.push(id.clone()),
                Some(parent_id) => {
                    if let Some(Node::Gadget(g)) = state.nodes.get_mut(&parent_id) {
                        g.children.push(id.clone());
                        g.is_subagent = true;
                    }
                }
            }

            let kind = TreeEventKind::LlmCallStart {
                node_id: id.clone(),
                model: model.to_string(),
                iteration,
            };
            self.queue_event(&mut state, kind);
            drop(state);
            self.dispatch();
            return Ok(id);
        }
    }

    pub fn append_llm_response(&self, id: &NodeId, text: &str) -> Result<(), TreeError> {
        self.mutate_llm(id, |node| {
            if node.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            node.response_text.push_str(text);
            Ok(TreeEventKind::LlmCallStream {
                node_id: node.id.clone(),
                text: text.to_string(),
            })
        })
    }

    pub fn complete_llm_call(
        &self,
        id: &NodeId,
        finish_reason: Option<String>,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
    ) -> Result<(), TreeError> {
        self.mutate_llm(id, |node| {
            if node.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            node.finish_reason = finish_reason.clone();
            node.usage = usage.clone();
            node.cost_usd = cost_usd;
            node.completed_at = Some(Utc::now());
            Ok(TreeEventKind::LlmCallComplete {
                node_id: node.id.clone(),
                finish_reason,
                usage,
                cost_usd,
            })
        })
    }

    pub fn fail_llm_call(&self, id: &NodeId, error: &str) -> Result<(), TreeError> {
        self.mutate_llm(id, |node| {
            if node.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            node.error = Some(error.to_string());
            node.completed_at = Some(Utc::now());
            Ok(TreeEventKind::LlmCallError {
                node_id: node.id.clone(),
                error: error.to_string(),
                recovered: false,
            })
        })
    }

    /// Record a provider failure that a later retry attempt recovered from.
    /// The node stays open; the event carries `recovered=true`.
    pub fn retry_llm_call(&self, id: &NodeId, error: &str) -> Result<(), TreeError> {
        self.mutate_llm(id, |node| {
            if node.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            Ok(TreeEventKind::LlmCallError {
                node_id: node.id.clone(),
                error: error.to_string(),
                recovered: true,
            })
        })
    }

    pub fn add_gadget(&self, parent: &NodeId, seed: GadgetSeed) -> Result<NodeId, TreeError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.invocation_index.contains_key(&seed.invocation_id) {
            return Err(TreeError::DuplicateInvocationId(seed.invocation_id));
        }
        let parent_node = state
            .nodes
            .get(parent)
            .ok_or_else(|| TreeError::ParentNotFound(parent.clone()))?;
        let Node::LlmCall(llm) = parent_node else {
            return Err(TreeError::ParentNotLlmCall(parent.clone()));
        };
        let n = llm.children.len();
        let id = NodeId::new(format!("{}_gadget_{}_{}", parent, seed.invocation_id, n + 1));
        let mut path = llm.path.clone();
        path.push(id.clone());
        let depth = llm.depth + 1;

        let node = GadgetNode {
            id: id.clone(),
            parent: parent.clone(),
            depth,
            path,
            invocation_id: seed.invocation_id.clone(),
            name: seed.name.clone(),
            parameters: seed.parameters,
            dependencies: seed.dependencies,
            state: GadgetState::Pending,
            result: None,
            error: None,
            failed_dependency: None,
            execution_ms: None,
            cost_usd: None,
            media: Vec::new(),
            is_subagent: false,
            children: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        state.nodes.insert(id.clone(), Node::Gadget(node));
        state
            .invocation_index
            .insert(seed.invocation_id.clone(), id.clone());
        if let Some(Node::LlmCall(llm)) = state.nodes.get_mut(parent) {
            llm.children.push(id.clone());
        }

        let kind = TreeEventKind::GadgetCall {
            node_id: id.clone(),
            invocation_id: seed.invocation_id,
            name: seed.name,
        };
        self.queue_event(&mut state, kind);
        drop(state);
        self.dispatch();
        Ok(id)
    }

    pub fn start_gadget(&self, id: &NodeId) -> Result<(), TreeError> {
        self.mutate_gadget(id, |node| {
            if node.state != GadgetState::Pending {
                return Err(TreeError::NotPending(node.id.clone()));
            }
            node.state = GadgetState::Running;
            Ok(TreeEventKind::GadgetStart {
                node_id: node.id.clone(),
            })
        })
    }

    pub fn complete_gadget(
        &self,
        id: &NodeId,
        completion: GadgetCompletion,
    ) -> Result<(), TreeError> {
        self.mutate_gadget(id, |node| {
            if node.state.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            node.execution_ms = completion.execution_ms;
            node.cost_usd = completion.cost_usd;
            node.media = completion.media.clone();
            node.completed_at = Some(Utc::now());
            match completion.outcome {
                Ok(result) => {
                    node.state = GadgetState::Completed;
                    node.result = Some(result.clone());
                    Ok(TreeEventKind::GadgetComplete {
                        node_id: node.id.clone(),
                        result,
                    })
                }
                Err(error) => {
                    node.state = GadgetState::Failed;
                    node.error = Some(error.clone());
                    Ok(TreeEventKind::GadgetError {
                        node_id: node.id.clone(),
                        error,
                    })
                }
            }
        })
    }

    pub fn skip_gadget(&self, id: &NodeId, reason: SkipReason) -> Result<(), TreeError> {
        self.mutate_gadget(id, |node| {
            if node.state.is_terminal() {
                return Err(TreeError::AlreadyTerminal(node.id.clone()));
            }
            node.state = GadgetState::Skipped;
            if let SkipReason::FailedDependency(dep) = &reason {
                node.failed_dependency = Some(dep.clone());
            }
            node.completed_at = Some(Utc::now());
            Ok(TreeEventKind::GadgetSkipped {
                node_id: node.id.clone(),
                reason: reason.to_string(),
            })
        })
    }

    /// Pure notification tied to the currently open LLM call of this view.
    pub fn emit_text(&self, text: &str) {
        let node_id = self.current_llm_call().map(|n| n.id);
        self.emit_text_on(node_id, text);
    }

    /// Pure notification tied to an explicit node (or none).
    pub fn emit_text_on(&self, node_id: Option<NodeId>, text: &str) {
        let mut state = self.shared.state.lock().unwrap();
        let kind = TreeEventKind::Text {
            node_id,
            text: text.to_string(),
        };
        self.queue_event(&mut state, kind);
        drop(state);
        self.dispatch();
    }

    /// Record one compaction pass.
    pub fn note_compaction(&self, report: CompactionReport) {
        let mut state = self.shared.state.lock().unwrap();
        self.queue_event(&mut state, TreeEventKind::Compaction(report));
        drop(state);
        self.dispatch();
    }

    /// Mark the tree complete. Pull streams drain their queues and
    /// terminate. A no-op on subtree views.
    pub fn complete(&self) {
        if !self.is_root_view() {
            debug!("complete() ignored on subtree view");
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.complete {
                return;
            }
            state.complete = true;
        }
        self.dispatch();
        self.shared.subscribers.lock().unwrap().clear();
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().unwrap().complete
    }

    // -----------------------------------------------------------------
    // Listeners and pull streams
    // -----------------------------------------------------------------

    /// Register a listener for one event kind (e.g. `"gadget_complete"`).
    /// Listeners run synchronously in registration order; wildcard listeners
    /// (see [`ExecutionTree::on_any`]) always run after filtered ones.
    pub fn on(
        &self,
        kind: &'static str,
        callback: impl Fn(&TreeEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.register_listener(Some(kind), Arc::new(callback))
    }

    /// Register a wildcard listener.
    pub fn on_any(&self, callback: impl Fn(&TreeEvent) + Send + Sync + 'static) -> u64 {
        self.register_listener(None, Arc::new(callback))
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn register_listener(&self, kind: Option<&'static str>, callback: ListenerFn) -> u64 {
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            id
        };
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push(ListenerEntry { id, kind, callback });
        id
    }

    /// Async pull stream over events emitted after this call. Terminates
    /// once the tree completes and the queue drains.
    pub fn events(&self) -> TreeEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let complete = self.shared.state.lock().unwrap().complete;
        if !complete {
            self.shared.subscribers.lock().unwrap().push(tx);
        }
        TreeEventStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.shared.state.lock().unwrap().nodes.get(id).cloned()
    }

    pub fn get_children(&self, id: &NodeId) -> Vec<Node> {
        let state = self.shared.state.lock().unwrap();
        state
            .nodes
            .get(id)
            .map(|n| {
                n.children()
                    .iter()
                    .filter_map(|c| state.nodes.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn get_ancestors(&self, id: &NodeId) -> Vec<Node> {
        let state = self.shared.state.lock().unwrap();
        let mut out = Vec::new();
        let mut current = state.nodes.get(id).and_then(|n| n.parent().cloned());
        while let Some(pid) = current {
            match state.nodes.get(&pid) {
                Some(node) => {
                    current = node.parent().cloned();
                    out.push(node.clone());
                }
                None => break,
            }
        }
        out
    }

    /// Descendants in depth-first order, optionally filtered by node type.
    pub fn get_descendants(&self, id: &NodeId, filter: NodeFilter) -> Vec<Node> {
        let state = self.shared.state.lock().unwrap();
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = state
            .nodes
            .get(id)
            .map(|n| n.children().iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(node) = state.nodes.get(&next) {
                stack.extend(node.children().iter().rev().cloned());
                if filter.matches(node) {
                    out.push(node.clone());
                }
            }
        }
        out
    }

    pub fn get_node_by_invocation_id(&self, invocation_id: &InvocationId) -> Option<Node> {
        let state = self.shared.state.lock().unwrap();
        state
            .invocation_index
            .get(invocation_id)
            .and_then(|id| state.nodes.get(id))
            .cloned()
    }

    /// Root ids of this view (children of the view's parent gadget, or the
    /// tree roots for the root view).
    pub fn roots(&self) -> Vec<NodeId> {
        let state = self.shared.state.lock().unwrap();
        match &self.parent {
            None => state.roots.clone(),
            Some(p) => state
                .nodes
                .get(p)
                .map(|n| n.children().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Most recently opened, still-incomplete LLM call among this view's
    /// roots. Used as the default parent for new gadget nodes.
    pub fn current_llm_call(&self) -> Option<LlmCallNode> {
        let roots = self.roots();
        let state = self.shared.state.lock().unwrap();
        roots.iter().rev().find_map(|id| match state.nodes.get(id) {
            Some(Node::LlmCall(n)) if !n.is_terminal() => Some(n.clone()),
            _ => None,
        })
    }

    // -----------------------------------------------------------------
    // Aggregations. Sums cover the node itself plus completed descendants
    // whose cost/usage fields are set.
    // -----------------------------------------------------------------

    pub fn subtree_cost(&self, id: &NodeId) -> f64 {
        let mut total = self
            .get_node(id)
            .filter(|n| n.is_terminal())
            .and_then(|n| n.cost_usd())
            .unwrap_or(0.0);
        for node in self.get_descendants(id, NodeFilter::Any) {
            if node.is_terminal() {
                total += node.cost_usd().unwrap_or(0.0);
            }
        }
        total
    }

    pub fn total_cost(&self) -> f64 {
        self.roots().iter().map(|r| self.subtree_cost(r)).sum()
    }

    pub fn subtree_usage(&self, id: &NodeId) -> Usage {
        let mut total = Usage::default();
        let mut add = |node: &Node| {
            if let Node::LlmCall(n) = node {
                if n.is_terminal() {
                    if let Some(usage) = &n.usage {
                        total.add(usage);
                    }
                }
            }
        };
        if let Some(node) = self.get_node(id) {
            add(&node);
        }
        for node in self.get_descendants(id, NodeFilter::LlmCalls) {
            add(&node);
        }
        total
    }

    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for root in self.roots() {
            total.add(&self.subtree_usage(&root));
        }
        total
    }

    pub fn subtree_media(&self, id: &NodeId) -> Vec<MediaOutput> {
        let mut out = Vec::new();
        let mut collect = |node: &Node| {
            if let Node::Gadget(g) = node {
                out.extend(g.media.iter().cloned());
            }
        };
        if let Some(node) = self.get_node(id) {
            collect(&node);
        }
        for node in self.get_descendants(id, NodeFilter::Gadgets) {
            collect(&node);
        }
        out
    }

    /// Whether the node and every descendant reached a terminal state.
    pub fn subtree_complete(&self, id: &NodeId) -> bool {
        match self.get_node(id) {
            None => false,
            Some(node) if !node.is_terminal() => false,
            Some(_) => self
                .get_descendants(id, NodeFilter::Any)
                .iter()
                .all(|n| n.is_terminal()),
        }
    }

    // -----------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------

    fn mutate_llm(
        &self,
        id: &NodeId,
        f: impl FnOnce(&mut LlmCallNode) -> Result<TreeEventKind, TreeError>,
    ) -> Result<(), TreeError> {
        let mut state = self.shared.state.lock().unwrap();
        let kind = match state.nodes.get_mut(id) {
            None => return Err(TreeError::NodeNotFound(id.clone())),
            Some(Node::Gadget(_)) => return Err(TreeError::NotAnLlmCall(id.clone())),
            Some(Node::LlmCall(node)) => f(node)?,
        };
        self.queue_event(&mut state, kind);
        drop(state);
        self.dispatch();
        Ok(())
    }

    fn mutate_gadget(
        &self,
        id: &NodeId,
        f: impl FnOnce(&mut GadgetNode) -> Result<TreeEventKind, TreeError>,
    ) -> Result<(), TreeError> {
        let mut state = self.shared.state.lock().unwrap();
        let kind = match state.nodes.get_mut(id) {
            None => return Err(TreeError::NodeNotFound(id.clone())),
            Some(Node::LlmCall(_)) => return Err(TreeError::NotAGadget(id.clone())),
            Some(Node::Gadget(node)) => f(node)?,
        };
        self.queue_event(&mut state, kind);
        drop(state);
        self.dispatch();
        Ok(())
    }

    fn queue_event(&self, state: &mut TreeState, kind: TreeEventKind) {
        let event = TreeEvent {
            event_id: state.next_event_id,
            timestamp: Utc::now(),
            kind,
        };
        state.next_event_id += 1;
        self.shared.pending.lock().unwrap().push_back(event);
    }

    /// Drain the pending queue through listeners and subscribers. A single
    /// dispatcher runs at a time; a listener that mutates the tree enqueues
    /// its event and the outer drain delivers it before any later one, so
    /// emissions are never re-entrant.
    fn dispatch(&self) {
        loop {
            {
                let Ok(_gate) = self.shared.dispatch_gate.try_lock() else {
                    return;
                };
                loop {
                    let event = { self.shared.pending.lock().unwrap().pop_front() };
                    let Some(event) = event else { break };

                    let listeners: Vec<ListenerEntry> =
                        self.shared.listeners.lock().unwrap().clone();
                    let kind = event.kind.name();
                    for entry in listeners.iter().filter(|l| l.kind == Some(kind)) {
                        (entry.callback)(&event);
                    }
                    for entry in listeners.iter().filter(|l| l.kind.is_none()) {
                        (entry.callback)(&event);
                    }

                    let subscribers: Vec<mpsc::UnboundedSender<TreeEvent>> =
                        self.shared.subscribers.lock().unwrap().clone();
                    for tx in subscribers {
                        let _ = tx.send(event.clone());
                    }
                }
            }
            // An emitter that lost the gate race may have queued after the
            // drain finished; pick its event up rather than leaving it.
            if self.shared.pending.lock().unwrap().is_empty() {
                return;
            }
        }
    }
}

/// Async pull iterator over tree events. Backed by an unbounded queue;
/// pulling consumers are woken in FIFO order.
pub struct TreeEventStream {
    inner: UnboundedReceiverStream<TreeEvent>,
}

impl TreeEventStream {
    pub async fn recv(&mut self) -> Option<TreeEvent> {
        use tokio_stream::StreamExt;
        self.inner.next().await
    }
}

impl futures::Stream for TreeEventStream {
    type Item = TreeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
