//! Batch scheduler: runs one LLM response's calls concurrently as their
//! dependencies settle, skipping descendants of failures and honouring the
//! stop-on-error policy.

use crate::executor::GadgetExecutor;
use crate::plan::{ExecutionPlan, PlanBlocker};
use clockwork_core::{GadgetError, InvocationId, NodeId};
use clockwork_tree::{ExecutionTree, SkipReason};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-error override of the stop-on-error flag.
pub type ContinueAfterError = Arc<dyn Fn(&GadgetError) -> bool + Send + Sync>;

/// Result of one call in the batch, in original emission order.
#[derive(Clone, Debug)]
pub struct GadgetRecord {
    pub invocation_id: InvocationId,
    pub name: String,
    pub outcome: Result<String, GadgetError>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub records: Vec<GadgetRecord>,
    /// Task-completion message, when a gadget signalled the loop to end.
    pub completion: Option<String>,
}

struct BatchState {
    /// invocation id -> success flag, for every settled call.
    finished: HashMap<InvocationId, bool>,
    /// First failure that halted the batch, when stop-on-error tripped.
    halted: Option<InvocationId>,
    completion: Option<String>,
}

struct BatchShared {
    state: Mutex<BatchState>,
    notify: Notify,
}

pub struct Scheduler {
    executor: Arc<GadgetExecutor>,
    stop_on_gadget_error: bool,
    concurrency: Option<usize>,
    should_continue: Option<ContinueAfterError>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<GadgetExecutor>,
        stop_on_gadget_error: bool,
        concurrency: Option<usize>,
        should_continue: Option<ContinueAfterError>,
    ) -> Self {
        Self {
            executor,
            stop_on_gadget_error,
            concurrency,
            should_continue,
        }
    }

    /// Run the plan. `nodes` maps each call's invocation id to its pending
    /// tree node. `stream_cancel`, when present, is tripped on the first
    /// halting failure so an overlapped provider stream stops emitting
    /// further blocks.
    pub async fn run(
        &self,
        plan: ExecutionPlan,
        nodes: &HashMap<InvocationId, NodeId>,
        tree: &ExecutionTree,
        cancel: &CancellationToken,
        stream_cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let shared = Arc::new(BatchShared {
            state: Mutex::new(BatchState {
                finished: HashMap::new(),
                halted: None,
                completion: None,
            }),
            notify: Notify::new(),
        });
        let semaphore = self
            .concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut records: Vec<Option<GadgetRecord>> = vec![None; plan.calls.len()];
        let mut tasks: JoinSet<(usize, GadgetRecord)> = JoinSet::new();

        // Settle blocked calls first so their dependents skip transitively.
        for (index, planned) in plan.calls.iter().enumerate() {
            let Some(blocker) = &planned.blocker else {
                continue;
            };
            let id = planned.call.invocation_id.clone();
            let node = nodes.get(&id);
            let outcome = match blocker {
                PlanBlocker::UnknownDependency(missing) => {
                    if let Some(node) = node {
                        let _ = tree
                            .skip_gadget(node, SkipReason::UnknownDependency(missing.clone()));
                    }
                    Err(GadgetError::DependencyFailed(missing.to_string()))
                }
                PlanBlocker::Cycle => {
                    if let Some(node) = node {
                        let _ = tree.skip_gadget(node, SkipReason::CyclicDependency);
                    }
                    let first_dep = planned
                        .call
                        .dependencies
                        .first()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| id.to_string());
                    Err(GadgetError::DependencyFailed(first_dep))
                }
                PlanBlocker::DuplicateId => {
                    if let Some(node) = node {
                        let _ = tree.skip_gadget(
                            node,
                            SkipReason::FailedDependency(id.clone()),
                        );
                    }
                    Err(GadgetError::Parse(format!(
                        "duplicate invocation id \"{id}\" in one response"
                    )))
                }
            };
            debug!(invocation = %id, ?blocker, "call blocked at planning");
            shared.state.lock().unwrap().finished.insert(id.clone(), false);
            records[index] = Some(GadgetRecord {
                invocation_id: id,
                name: planned.call.name.clone(),
                outcome,
            });
        }
        shared.notify.notify_waiters();

        for (index, planned) in plan
            .calls
            .iter()
            .enumerate()
            .filter(|(_, p)| p.blocker.is_none())
        {
            let call = planned.call.clone();
            let Some(node) = nodes.get(&call.invocation_id).cloned() else {
                continue;
            };
            let shared = Arc::clone(&shared);
            let executor = Arc::clone(&self.executor);
            let tree = tree.clone();
            let cancel = cancel.clone();
            let stream_cancel = stream_cancel.clone();
            let semaphore = semaphore.clone();
            let stop_on_error = self.stop_on_gadget_error;
            let should_continue = self.should_continue.clone();

            tasks.spawn(async move {
                let record = run_one(
                    call,
                    node,
                    shared,
                    executor,
                    tree,
                    cancel,
                    stream_cancel,
                    semaphore,
                    stop_on_error,
                    should_continue,
                )
                .await;
                (index, record)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, record)) => records[index] = Some(record),
                Err(err) => warn!(%err, "scheduler task panicked"),
            }
        }

        let state = shared.state.lock().unwrap();
        BatchOutcome {
            records: records.into_iter().flatten().collect(),
            completion: state.completion.clone(),
        }
    }
}

/// One call's lifecycle inside the batch: wait for dependencies, run, and
/// publish the result.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    call: clockwork_core::ParsedGadgetCall,
    node: NodeId,
    shared: Arc<BatchShared>,
    executor: Arc<GadgetExecutor>,
    tree: ExecutionTree,
    cancel: CancellationToken,
    stream_cancel: Option<CancellationToken>,
    semaphore: Option<Arc<Semaphore>>,
    stop_on_error: bool,
    should_continue: Option<ContinueAfterError>,
) -> GadgetRecord {
    let id = call.invocation_id.clone();

    enum Gate {
        Run,
        Skip(SkipReason, GadgetError),
        Wait,
    }

    loop {
        // Register interest before reading state so a wake-up between the
        // check and the await is not lost.
        let wait = shared.notify.notified();
        tokio::pin!(wait);
        wait.as_mut().enable();
        let gate = {
            let state = shared.state.lock().unwrap();
            if cancel.is_cancelled() {
                Gate::Skip(SkipReason::Cancelled, GadgetError::Cancelled)
            } else if let Some(failed) = call
                .dependencies
                .iter()
                .find(|d| state.finished.get(*d) == Some(&false))
            {
                Gate::Skip(
                    SkipReason::FailedDependency((*failed).clone()),
                    GadgetError::DependencyFailed(failed.to_string()),
                )
            } else if let Some(failed) = state.halted.as_ref() {
                Gate::Skip(
                    SkipReason::BatchHalted(failed.clone()),
                    GadgetError::DependencyFailed(failed.to_string()),
                )
            } else if call
                .dependencies
                .iter()
                .all(|d| state.finished.get(d) == Some(&true))
            {
                Gate::Run
            } else {
                Gate::Wait
            }
        };

        match gate {
            Gate::Wait => {
                tokio::select! {
                    _ = &mut wait => {}
                    _ = cancel.cancelled() => {}
                }
            }
            Gate::Skip(reason, error) => {
                let _ = tree.skip_gadget(&node, reason);
                settle(&shared, &id, false);
                return GadgetRecord {
                    invocation_id: id,
                    name: call.name,
                    outcome: Err(error),
                };
            }
            Gate::Run => break,
        }
    }

    let _permit = match &semaphore {
        Some(semaphore) => semaphore.acquire().await.ok(),
        None => None,
    };

    let record = executor.execute(&call, &node, &tree, &cancel).await;

    let success = record.outcome.is_ok();
    {
        let mut state = shared.state.lock().unwrap();
        state.finished.insert(id.clone(), success);
        if let Some(message) = &record.breaks_loop {
            state.completion.get_or_insert_with(|| message.clone());
        }
        if let Err(error) = &record.outcome {
            let continue_anyway = match &should_continue {
                Some(callback) => callback(error),
                None => !stop_on_error,
            };
            if !continue_anyway && state.halted.is_none() {
                debug!(invocation = %id, "first failure halts the batch");
                state.halted = Some(id.clone());
                if let Some(token) = &stream_cancel {
                    token.cancel();
                }
            }
        }
    }
    shared.notify.notify_waiters();

    GadgetRecord {
        invocation_id: id,
        name: call.name,
        outcome: record.outcome,
    }
}

fn settle(shared: &BatchShared, id: &InvocationId, success: bool) {
    shared
        .state
        .lock()
        .unwrap()
        .finished
        .insert(id.clone(), success);
    shared.notify.notify_waiters();
}
