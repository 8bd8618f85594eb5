//! The agent loop driver: iteration control, history assembly, text-only
//! handling, gadget batches, and cancellation.

use crate::compact::ContextCompactor;
use crate::config::{HookDecision, LoopConfig, TextOnlyAction, TextOnlyPolicy};
use crate::executor::GadgetExecutor;
use crate::parser::{render_block, ParserEvent, StreamParser};
use crate::plan;
use crate::scheduler::Scheduler;
use clockwork_core::{
    format_gadget_result, InvocationId, Message, NodeId, ParsedGadgetCall, Usage,
};
use clockwork_gadgets::{AgentSettings, ApprovalHandler, GadgetRegistry, HumanInputHandler};
use clockwork_llm::{ProviderAdapter, ProviderError, ProviderRequest};
use clockwork_tree::{ExecutionTree, GadgetCompletion, GadgetSeed, SkipReason, TreeError};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Why the loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A gadget signalled task completion with this message.
    TaskComplete(String),
    /// The text-only policy ended the loop.
    TextOnly,
    MaxIterations,
    Cancelled,
    /// The `before_llm_call` hook skipped the turn.
    HookSkipped,
}

#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub stop: StopReason,
    pub iterations: u32,
    pub final_text: Option<String>,
}

/// One agent loop bound to an execution tree (the root view, or a child
/// view when this loop serves a subagent gadget).
pub struct AgentLoop {
    provider: Arc<dyn ProviderAdapter>,
    registry: Arc<GadgetRegistry>,
    config: LoopConfig,
    tree: ExecutionTree,
    cancel: CancellationToken,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    human_input: Option<Arc<dyn HumanInputHandler>>,
    compactor: Option<ContextCompactor>,
    conversation: Mutex<Vec<Message>>,
    injected: Mutex<Vec<String>>,
    last_llm: Mutex<Option<NodeId>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        registry: Arc<GadgetRegistry>,
        config: LoopConfig,
    ) -> Self {
        let compactor = config.compaction.clone().map(ContextCompactor::new);
        Self {
            provider,
            registry,
            config,
            tree: ExecutionTree::new(),
            cancel: CancellationToken::new(),
            approval_handler: None,
            human_input: None,
            compactor,
            conversation: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
            last_llm: Mutex::new(None),
        }
    }

    /// Bind the loop to an existing tree view. Subagent gadgets pass the
    /// child view of their own node so nested calls attach under it.
    pub fn with_tree(mut self, tree: ExecutionTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    pub fn with_human_input(mut self, handler: Arc<dyn HumanInputHandler>) -> Self {
        self.human_input = Some(handler);
        self
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Trip the loop's cancellation signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Queue a user message between turns. It joins the conversation at the
    /// next iteration boundary and surfaces as a `text` event on the last
    /// LLM-call node.
    pub fn inject_user_message(&self, text: impl Into<String>) {
        let text = text.into();
        self.injected.lock().unwrap().push(text.clone());
        let last = self.last_llm.lock().unwrap().clone();
        self.tree.emit_text_on(last, &text);
    }

    /// Snapshot of the conversation history.
    pub fn conversation(&self) -> Vec<Message> {
        self.conversation.lock().unwrap().clone()
    }

    /// Drive the loop to termination, starting from one user prompt.
    pub async fn run(&self, prompt: impl Into<String>) -> Result<LoopOutcome, LoopError> {
        let result = self.run_inner(prompt.into()).await;
        // The tree completes when its owning loop ends; child views no-op.
        self.tree.complete();
        result
    }

    async fn run_inner(&self, prompt: String) -> Result<LoopOutcome, LoopError> {
        self.conversation.lock().unwrap().push(Message::user(prompt));

        let executor = Arc::new(GadgetExecutor::new(
            self.registry.clone(),
            self.config.approvals.clone(),
            self.approval_handler.clone(),
            self.human_input.clone(),
            self.config.default_gadget_timeout,
            AgentSettings {
                model: self.config.model.clone(),
                temperature: self.config.temperature,
            },
            self.config.subagent.clone(),
            Some(self.provider.clone()),
        ));
        let scheduler = Scheduler::new(
            executor,
            self.config.stop_on_gadget_error,
            self.config.concurrency,
            self.config.should_continue_after_error.clone(),
        );

        let mut iteration: u32 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.outcome(StopReason::Cancelled, iteration, None));
            }
            debug!(iteration, "starting loop iteration");

            self.drain_injected();
            self.maybe_compact().await;

            let mut request = ProviderRequest {
                model: self.config.model.clone(),
                messages: self.conversation.lock().unwrap().clone(),
                system: self.config.system_prompt.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            // Trailing messages are ephemeral: request-only, never persisted.
            if let Some(trailing) = &self.config.trailing_message {
                if let Some(text) = trailing.render(iteration) {
                    request.messages.push(Message::user(text));
                }
            }

            if let Some(hook) = &self.config.before_llm_call {
                match hook(&request) {
                    HookDecision::Proceed => {}
                    HookDecision::ProceedWith(messages) => request.messages = messages,
                    HookDecision::Skip => {
                        debug!("before_llm_call hook skipped the turn");
                        return Ok(self.outcome(StopReason::HookSkipped, iteration, None));
                    }
                }
            }

            let node = self
                .tree
                .add_llm_call(&self.config.model, iteration, request.messages.clone())?;
            *self.last_llm.lock().unwrap() = Some(node.clone());

            let mut stream = match self.open_stream(&request, &node).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = self.tree.fail_llm_call(&node, &err.to_string());
                    return Err(LoopError::Provider(err));
                }
            };

            let stream_cancel = CancellationToken::new();
            let mut parser = StreamParser::new(self.config.markers.clone());
            let mut free_text = String::new();
            let mut raw_response = String::new();
            let mut calls: Vec<ParsedGadgetCall> = Vec::new();
            let mut node_map: HashMap<InvocationId, NodeId> = HashMap::new();
            let mut usage: Option<Usage> = None;
            let mut finish_reason: Option<String> = None;
            let mut cancelled = false;

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    chunk = stream.next() => match chunk {
                        Some(Ok(chunk)) => {
                            if !chunk.text.is_empty() {
                                raw_response.push_str(&chunk.text);
                                self.tree.append_llm_response(&node, &chunk.text)?;
                                for event in parser.feed(&chunk.text) {
                                    self.handle_parser_event(
                                        event,
                                        &node,
                                        &mut free_text,
                                        &mut calls,
                                        &mut node_map,
                                    )?;
                                }
                            }
                            if let Some(u) = chunk.usage {
                                usage = Some(u);
                            }
                            if let Some(reason) = chunk.finish_reason {
                                finish_reason = Some(reason);
                            }
                        }
                        Some(Err(err)) => {
                            let _ = self.tree.fail_llm_call(&node, &err.to_string());
                            return Err(LoopError::Provider(err));
                        }
                        None => break,
                    }
                }
            }
            drop(stream);

            if cancelled {
                info!(iteration, "loop cancelled mid-stream");
                let _ = self.tree.fail_llm_call(&node, "cancelled");
                for gadget_node in node_map.values() {
                    let _ = self.tree.skip_gadget(gadget_node, SkipReason::Cancelled);
                }
                return Ok(self.outcome(StopReason::Cancelled, iteration, None));
            }

            for event in parser.finish() {
                self.handle_parser_event(event, &node, &mut free_text, &mut calls, &mut node_map)?;
            }

            // Synthetic wrapper call keeps history gadget-centric; its node
            // must exist before the LLM call closes.
            let synth = match (&self.config.text_wrapper, calls.is_empty()) {
                (Some(wrapper), false) if !free_text.trim().is_empty() => {
                    let call = ParsedGadgetCall::new(
                        wrapper.gadget_name.clone(),
                        InvocationId::generate(),
                    )
                    .with_parameters((wrapper.parameter_mapping)(&free_text));
                    let result = (wrapper.result_mapping)(&free_text);
                    let synth_node = self.tree.add_gadget(
                        &node,
                        GadgetSeed {
                            invocation_id: call.invocation_id.clone(),
                            name: call.name.clone(),
                            parameters: call.parameters.clone().unwrap_or_default(),
                            dependencies: Vec::new(),
                        },
                    )?;
                    Some((call, synth_node, result))
                }
                _ => None,
            };

            let cost = match (&self.config.pricing, &usage) {
                (Some(pricing), Some(usage)) => Some(pricing.cost(usage)),
                _ => None,
            };
            self.tree
                .complete_llm_call(&node, finish_reason.clone(), usage.clone(), cost)?;

            if calls.is_empty() {
                self.conversation
                    .lock()
                    .unwrap()
                    .push(Message::assistant(free_text.clone()));
                let action = match &self.config.text_only {
                    TextOnlyPolicy::Terminate => TextOnlyAction::Terminate,
                    TextOnlyPolicy::Acknowledge => TextOnlyAction::Acknowledge,
                    TextOnlyPolicy::WaitForInput => TextOnlyAction::WaitForInput,
                    TextOnlyPolicy::Custom(f) => f(&free_text),
                };
                match action {
                    TextOnlyAction::Terminate => {
                        return Ok(self.outcome(
                            StopReason::TextOnly,
                            iteration,
                            Some(free_text),
                        ));
                    }
                    TextOnlyAction::Acknowledge => {}
                    TextOnlyAction::WaitForInput => match &self.human_input {
                        Some(handler) => match handler.ask(&free_text).await {
                            Some(answer) => {
                                self.conversation.lock().unwrap().push(Message::user(answer));
                            }
                            None => {
                                return Ok(self.outcome(
                                    StopReason::TextOnly,
                                    iteration,
                                    Some(free_text),
                                ));
                            }
                        },
                        None => {
                            warn!("wait_for_input policy with no human-input collaborator");
                            return Ok(self.outcome(
                                StopReason::TextOnly,
                                iteration,
                                Some(free_text),
                            ));
                        }
                    },
                }
            } else {
                let assistant_content = match &synth {
                    Some((call, _, _)) => {
                        let mut content = render_block(call, &self.config.markers);
                        for real in &calls {
                            content.push_str(&render_block(real, &self.config.markers));
                        }
                        content
                    }
                    None => raw_response.clone(),
                };
                self.conversation
                    .lock()
                    .unwrap()
                    .push(Message::assistant(assistant_content));

                if let Some((call, synth_node, result)) = &synth {
                    let _ = self
                        .tree
                        .complete_gadget(synth_node, GadgetCompletion::success(result.clone()));
                    self.conversation.lock().unwrap().push(Message::user(
                        format_gadget_result(
                            &call.name,
                            call.invocation_id.as_str(),
                            &Ok(result.clone()),
                        ),
                    ));
                }

                let batch = scheduler
                    .run(
                        plan::plan(calls.clone()),
                        &node_map,
                        &self.tree,
                        &self.cancel,
                        Some(stream_cancel),
                    )
                    .await;

                {
                    let mut conversation = self.conversation.lock().unwrap();
                    for record in &batch.records {
                        conversation.push(Message::user(format_gadget_result(
                            &record.name,
                            record.invocation_id.as_str(),
                            &record.outcome,
                        )));
                    }
                }

                if let Some(message) = batch.completion {
                    info!(iteration, "gadget signalled task completion");
                    return Ok(self.outcome(
                        StopReason::TaskComplete(message.clone()),
                        iteration,
                        Some(message),
                    ));
                }
                if self.cancel.is_cancelled() {
                    return Ok(self.outcome(StopReason::Cancelled, iteration, None));
                }
            }

            if iteration >= self.config.max_iterations {
                info!(iteration, "max iterations reached");
                return Ok(self.outcome(StopReason::MaxIterations, iteration, None));
            }
            iteration += 1;
        }
    }

    /// Open the provider stream, retrying transient failures per the retry
    /// policy. Recovered attempts emit `llm_call_error { recovered: true }`.
    async fn open_stream(
        &self,
        request: &ProviderRequest,
        node: &NodeId,
    ) -> Result<clockwork_llm::ChunkStream, ProviderError> {
        let mut attempt: u32 = 1;
        loop {
            match self.provider.stream(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if err.is_retryable() && self.config.retry.should_retry(attempt) {
                        let _ = self.tree.retry_llm_call(node, &err.to_string());
                        self.config.retry.wait(attempt).await;
                        attempt += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn handle_parser_event(
        &self,
        event: ParserEvent,
        node: &NodeId,
        free_text: &mut String,
        calls: &mut Vec<ParsedGadgetCall>,
        node_map: &mut HashMap<InvocationId, NodeId>,
    ) -> Result<(), LoopError> {
        match event {
            ParserEvent::Text(text) => {
                free_text.push_str(&text);
                self.tree.emit_text_on(Some(node.clone()), &text);
            }
            ParserEvent::Block(mut call) => {
                if self
                    .tree
                    .get_node_by_invocation_id(&call.invocation_id)
                    .is_some()
                {
                    // Ids are unique within a tree; demote the collision to
                    // a parse error under a fresh id so the model hears
                    // about it.
                    let taken = call.invocation_id.clone();
                    call.invocation_id = InvocationId::generate();
                    call = call
                        .with_parse_error(format!("duplicate invocation id \"{taken}\""));
                }
                let gadget_node = self.tree.add_gadget(
                    node,
                    GadgetSeed {
                        invocation_id: call.invocation_id.clone(),
                        name: call.name.clone(),
                        parameters: call.parameters.clone().unwrap_or_default(),
                        dependencies: call.dependencies.clone(),
                    },
                )?;
                node_map.insert(call.invocation_id.clone(), gadget_node);
                calls.push(call);
            }
            ParserEvent::End { reason } => {
                debug!(?reason, "parser stream ended");
            }
        }
        Ok(())
    }

    fn drain_injected(&self) {
        let injected: Vec<String> = std::mem::take(&mut *self.injected.lock().unwrap());
        if injected.is_empty() {
            return;
        }
        let mut conversation = self.conversation.lock().unwrap();
        for text in injected {
            conversation.push(Message::user(text));
        }
    }

    async fn maybe_compact(&self) {
        let Some(compactor) = &self.compactor else {
            return;
        };
        let mut messages = self.conversation.lock().unwrap().clone();
        if let Some(report) = compactor
            .maybe_compact(self.provider.as_ref(), &self.config.model, &mut messages)
            .await
        {
            *self.conversation.lock().unwrap() = messages;
            self.tree.note_compaction(report);
        }
    }

    fn outcome(&self, stop: StopReason, iterations: u32, final_text: Option<String>) -> LoopOutcome {
        LoopOutcome {
            stop,
            iterations,
            final_text,
        }
    }
}
