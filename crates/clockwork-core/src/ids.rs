//! Opaque identifiers for tree nodes and gadget invocations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifier of one execution-tree node. The encoded string carries the
/// parent chain (`llm_1`, `llm_1_gadget_calc_2`) for debuggability only;
/// consumers must treat it as opaque.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier the LLM chose for one gadget invocation (or an auto-generated
/// one when the marker carried none). Unique within one tree.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(Arc<str>);

impl InvocationId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Generate an id for a marker that omitted one.
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("auto_{}", &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InvocationId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for InvocationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
