//! The gadget error taxonomy. These never abort the loop; their Display
//! rendering becomes the gadget's result text in the next user turn.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GadgetError {
    #[error("status=error; unknown gadget \"{name}\"; available: {available}")]
    Registry { name: String, available: String },

    #[error("status=error; malformed gadget block: {0}")]
    Parse(String),

    #[error("status=error; invalid parameters: {0}")]
    Validation(String),

    #[error("status=denied; {0}")]
    ApprovalDenied(String),

    #[error("status=error; timed out after {0}ms")]
    Timeout(u64),

    #[error("status=error; {0}")]
    Execution(String),

    #[error("status=error; no human-input collaborator installed")]
    NoHumanInput,

    #[error("status=skipped; failed_dependency={0}")]
    DependencyFailed(String),

    #[error("status=error; cancelled")]
    Cancelled,
}

impl GadgetError {
    pub fn registry(name: impl Into<String>, available: &[&str]) -> Self {
        Self::Registry {
            name: name.into(),
            available: available.join(", "),
        }
    }

    /// Join schema issues into one Validation error.
    pub fn validation(issues: impl IntoIterator<Item = (String, String)>) -> Self {
        let rendered = issues
            .into_iter()
            .map(|(path, message)| {
                if path.is_empty() {
                    message
                } else {
                    format!("{path}: {message}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::Validation(rendered)
    }

    /// Whether the error represents a dependency/scheduling skip rather than
    /// an attempted execution.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::DependencyFailed(_))
    }
}

/// Render one gadget result the way the loop feeds it back to the model.
pub fn format_gadget_result(
    name: &str,
    invocation_id: &str,
    outcome: &Result<String, GadgetError>,
) -> String {
    match outcome {
        Ok(result) => format!("Result: {result}"),
        Err(err) => format!("Gadget \"{name}\" ({invocation_id}): {err}"),
    }
}
