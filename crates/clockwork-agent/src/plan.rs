//! Invocation planner: orders one batch of parsed calls by declared
//! dependencies, flagging unknown dependencies, duplicates, and cycles.

use clockwork_core::{InvocationId, ParsedGadgetCall};
use std::collections::{HashMap, HashSet, VecDeque};

/// Why a planned call must not execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanBlocker {
    /// A declared dependency names no call in this batch.
    UnknownDependency(InvocationId),
    /// The call sits on a dependency cycle.
    Cycle,
    /// An earlier call in the batch already claimed this invocation id.
    DuplicateId,
}

#[derive(Clone, Debug)]
pub struct PlannedCall {
    pub call: ParsedGadgetCall,
    pub blocker: Option<PlanBlocker>,
}

impl PlannedCall {
    pub fn is_runnable(&self) -> bool {
        self.blocker.is_none()
    }
}

/// Dependency-aware execution plan over one LLM response's calls, in their
/// original emission order.
#[derive(Clone, Debug, Default)]
pub struct ExecutionPlan {
    pub calls: Vec<PlannedCall>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Build the plan: verify every declared dependency exists in the batch,
/// then run Kahn's algorithm over the remaining calls; whatever survives
/// with edges left is cyclic.
pub fn plan(calls: Vec<ParsedGadgetCall>) -> ExecutionPlan {
    let mut planned: Vec<PlannedCall> = Vec::with_capacity(calls.len());
    let mut seen: HashSet<InvocationId> = HashSet::new();
    for call in calls {
        let blocker = if seen.contains(&call.invocation_id) {
            Some(PlanBlocker::DuplicateId)
        } else {
            seen.insert(call.invocation_id.clone());
            None
        };
        planned.push(PlannedCall { call, blocker });
    }

    let ids: HashSet<InvocationId> = planned
        .iter()
        .filter(|p| p.blocker.is_none())
        .map(|p| p.call.invocation_id.clone())
        .collect();

    for p in planned.iter_mut().filter(|p| p.blocker.is_none()) {
        if let Some(missing) = p.call.dependencies.iter().find(|d| !ids.contains(d)) {
            p.blocker = Some(PlanBlocker::UnknownDependency(missing.clone()));
        }
    }

    // Kahn over the unblocked calls. Edges to blocked calls are ignored:
    // those resolve to immediate failures at scheduling time.
    let good: HashSet<InvocationId> = planned
        .iter()
        .filter(|p| p.blocker.is_none())
        .map(|p| p.call.invocation_id.clone())
        .collect();

    let mut indegree: HashMap<InvocationId, usize> = HashMap::new();
    let mut dependents: HashMap<InvocationId, Vec<InvocationId>> = HashMap::new();
    for p in planned.iter().filter(|p| p.blocker.is_none()) {
        let id = &p.call.invocation_id;
        let in_batch_deps = p
            .call
            .dependencies
            .iter()
            .filter(|d| good.contains(*d))
            .count();
        indegree.insert(id.clone(), in_batch_deps);
        for dep in p.call.dependencies.iter().filter(|d| good.contains(*d)) {
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut queue: VecDeque<InvocationId> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut resolved = 0usize;
    while let Some(id) = queue.pop_front() {
        resolved += 1;
        if let Some(next) = dependents.get(&id) {
            for dependent in next {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
    }

    if resolved < indegree.len() {
        for p in planned.iter_mut() {
            if p.blocker.is_none() && indegree.get(&p.call.invocation_id).copied().unwrap_or(0) > 0
            {
                p.blocker = Some(PlanBlocker::Cycle);
            }
        }
    }

    ExecutionPlan { calls: planned }
}
