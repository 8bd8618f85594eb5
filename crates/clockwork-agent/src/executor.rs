//! Per-invocation gadget execution: registry lookup, schema validation,
//! approval gate, timeout race, human-input round-trip, and error
//! classification. Results land in the execution tree.

use clockwork_core::{GadgetError, NodeId, ParsedGadgetCall};
use clockwork_gadgets::{
    AgentSettings, ApprovalConfig, ApprovalHandler, ApprovalMode, ApprovalResponse, GadgetContext,
    GadgetRegistry, GadgetReply, HumanInputHandler, SubagentOverrides,
};
use clockwork_llm::ProviderAdapter;
use clockwork_tree::{ExecutionTree, GadgetCompletion};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one executed (or refused) invocation.
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub outcome: Result<String, GadgetError>,
    /// Task-completion message when the gadget signalled the loop to end.
    pub breaks_loop: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionRecord {
    fn refused(error: GadgetError) -> Self {
        Self {
            outcome: Err(error),
            breaks_loop: None,
            elapsed_ms: 0,
        }
    }
}

pub struct GadgetExecutor {
    registry: Arc<GadgetRegistry>,
    approvals: ApprovalConfig,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    human_input: Option<Arc<dyn HumanInputHandler>>,
    default_timeout: Option<Duration>,
    agent: AgentSettings,
    subagent: SubagentOverrides,
    provider: Option<Arc<dyn ProviderAdapter>>,
    /// Names the user answered `always` for in this session.
    granted: DashMap<String, ()>,
}

impl GadgetExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<GadgetRegistry>,
        approvals: ApprovalConfig,
        approval_handler: Option<Arc<dyn ApprovalHandler>>,
        human_input: Option<Arc<dyn HumanInputHandler>>,
        default_timeout: Option<Duration>,
        agent: AgentSettings,
        subagent: SubagentOverrides,
        provider: Option<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self {
            registry,
            approvals,
            approval_handler,
            human_input,
            default_timeout,
            agent,
            subagent,
            provider,
            granted: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<GadgetRegistry> {
        &self.registry
    }

    /// Run one call end to end, recording start/terminal state on its tree
    /// node. A call refused before execution (parse error, unknown name,
    /// validation failure, denial) never emits `gadget_start`.
    pub async fn execute(
        &self,
        call: &ParsedGadgetCall,
        node_id: &NodeId,
        tree: &ExecutionTree,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        if let Some(error) = &call.parse_error {
            return self.refuse(tree, node_id, GadgetError::Parse(error.clone()));
        }

        let Some(gadget) = self.registry.get(&call.name) else {
            let error = GadgetError::registry(&call.name, &self.registry.names());
            return self.refuse(tree, node_id, error);
        };

        let raw = call
            .parameters
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let parameters = match gadget.schema().validate(&raw) {
            Ok(parameters) => parameters,
            Err(issues) => {
                let error =
                    GadgetError::validation(issues.into_iter().map(|i| (i.path, i.message)));
                return self.refuse(tree, node_id, error);
            }
        };

        if let Err(error) = self.check_approval(&call.name, &parameters).await {
            return self.refuse(tree, node_id, error);
        }

        if tree.start_gadget(node_id).is_err() {
            return ExecutionRecord::refused(GadgetError::Execution(
                "gadget node is not pending".to_string(),
            ));
        }
        debug!(gadget = %call.name, invocation = %call.invocation_id, "executing gadget");

        let ctx = GadgetContext::new(
            call.invocation_id.clone(),
            node_id.clone(),
            tree.clone(),
            cancel.clone(),
            self.agent.clone(),
            self.subagent.clone(),
            self.provider.clone(),
            Some(self.registry.clone()),
        );

        let timeout = gadget.timeout().or(self.default_timeout);
        let started = Instant::now();

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GadgetError::Cancelled),
            result = run_with_timeout(timeout, gadget.execute(parameters, &ctx)) => result,
        };

        let reply = match reply {
            Ok(GadgetReply::NeedsHuman(question)) => match &self.human_input {
                Some(handler) => match handler.ask(&question).await {
                    Some(answer) => Ok(GadgetReply::Output(answer)),
                    None => Err(GadgetError::Execution("human input cancelled".to_string())),
                },
                None => Err(GadgetError::NoHumanInput),
            },
            other => other,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let cost = ctx.reported_cost();
        let media = ctx.take_media();

        let (outcome, breaks_loop) = match reply {
            Ok(GadgetReply::Output(result)) => (Ok(result), None),
            Ok(GadgetReply::Complete(message)) => (Ok(message.clone()), Some(message)),
            Ok(GadgetReply::NeedsHuman(_)) => unreachable!("handled above"),
            Err(error) => (Err(error), None),
        };

        let mut completion = match &outcome {
            Ok(result) => GadgetCompletion::success(result.clone()),
            Err(error) => GadgetCompletion::failure(error.to_string()),
        }
        .with_elapsed_ms(elapsed_ms)
        .with_media(media);
        if cost > 0.0 {
            completion = completion.with_cost(cost);
        }
        let _ = tree.complete_gadget(node_id, completion);

        info!(
            gadget = %call.name,
            invocation = %call.invocation_id,
            elapsed_ms,
            ok = outcome.is_ok(),
            "gadget finished"
        );
        ExecutionRecord {
            outcome,
            breaks_loop,
            elapsed_ms,
        }
    }

    async fn check_approval(&self, name: &str, parameters: &Value) -> Result<(), GadgetError> {
        let key = name.to_ascii_lowercase();
        match self.approvals.resolve(name) {
            ApprovalMode::Allowed => Ok(()),
            ApprovalMode::Denied => Err(GadgetError::ApprovalDenied(
                "denied by configuration".to_string(),
            )),
            ApprovalMode::ApprovalRequired => {
                if self.granted.contains_key(&key) {
                    return Ok(());
                }
                let Some(handler) = &self.approval_handler else {
                    return Err(GadgetError::ApprovalDenied(
                        "approval required but no interactive approver is available".to_string(),
                    ));
                };
                match handler.request_approval(name, parameters).await {
                    ApprovalResponse::Yes => Ok(()),
                    ApprovalResponse::Always => {
                        self.granted.insert(key, ());
                        Ok(())
                    }
                    ApprovalResponse::No | ApprovalResponse::Cancel => {
                        Err(GadgetError::ApprovalDenied("denied by user".to_string()))
                    }
                }
            }
        }
    }

    /// Close the node with an error without ever starting it.
    fn refuse(&self, tree: &ExecutionTree, node_id: &NodeId, error: GadgetError) -> ExecutionRecord {
        debug!(node = %node_id, %error, "gadget refused");
        let _ = tree.complete_gadget(node_id, GadgetCompletion::failure(error.to_string()));
        ExecutionRecord::refused(error)
    }
}

async fn run_with_timeout(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = anyhow::Result<GadgetReply>>,
) -> Result<GadgetReply, GadgetError> {
    match timeout {
        None => fut.await.map_err(|e| GadgetError::Execution(e.to_string())),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| GadgetError::Execution(e.to_string())),
            Err(_) => Err(GadgetError::Timeout(limit.as_millis() as u64)),
        },
    }
}
