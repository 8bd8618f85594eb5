//! Approval-mode resolution and the interactive collaborator traits.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-gadget approval policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    Allowed,
    Denied,
    ApprovalRequired,
}

/// Gadget names that require approval unless explicitly overridden.
const DANGEROUS_NAMES: &[&str] = &["runcommand", "writefile", "editfile"];

/// `{default_mode, name -> mode}` with case-insensitive lookup.
#[derive(Clone, Debug)]
pub struct ApprovalConfig {
    default_mode: ApprovalMode,
    overrides: HashMap<String, ApprovalMode>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_mode: ApprovalMode::Allowed,
            overrides: HashMap::new(),
        }
    }
}

impl ApprovalConfig {
    pub fn new(default_mode: ApprovalMode) -> Self {
        Self {
            default_mode,
            overrides: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, name: &str, mode: ApprovalMode) -> Self {
        self.overrides.insert(name.to_ascii_lowercase(), mode);
        self
    }

    pub fn set_mode(&mut self, name: &str, mode: ApprovalMode) {
        self.overrides.insert(name.to_ascii_lowercase(), mode);
    }

    /// Resolve the mode for a gadget. Explicit overrides win; dangerous
    /// names default to approval-required; everything else gets the
    /// configured default.
    pub fn resolve(&self, name: &str) -> ApprovalMode {
        let key = name.to_ascii_lowercase();
        if let Some(mode) = self.overrides.get(&key) {
            return *mode;
        }
        if DANGEROUS_NAMES.contains(&key.as_str()) {
            return ApprovalMode::ApprovalRequired;
        }
        self.default_mode
    }
}

/// Answer from the approval collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalResponse {
    Yes,
    No,
    /// Approve and stop asking for this gadget for the rest of the loop.
    Always,
    Cancel,
}

/// Interactive approval collaborator. Absent (piped I/O), approval-required
/// gadgets are denied with a diagnostic.
#[async_trait::async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, gadget_name: &str, parameters: &Value) -> ApprovalResponse;
}

/// Human-input collaborator for gadget round-trips and the `wait_for_input`
/// text-only policy. `None` means the human cancelled.
#[async_trait::async_trait]
pub trait HumanInputHandler: Send + Sync {
    async fn ask(&self, question: &str) -> Option<String>;
}
