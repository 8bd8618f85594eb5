//! The execution tree: single source of truth for the hierarchical state of
//! LLM calls and gadget invocations, with an ordered event broadcast.

pub mod event;
pub mod node;
pub mod tree;

pub use event::{CompactionReport, TreeEvent, TreeEventKind};
pub use node::{GadgetNode, GadgetSeed, GadgetState, LlmCallNode, Node, SkipReason};
pub use tree::{ExecutionTree, GadgetCompletion, NodeFilter, TreeError, TreeEventStream};
