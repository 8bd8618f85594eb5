//! Parsed gadget calls and the marker wire format they come from.

use crate::ids::InvocationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The literal byte prefixes delimiting a gadget block inside the model's
/// text stream. All three are configurable; defaults match the wire format:
///
/// ```text
/// !!!GADGET_START:Calc:calc_1
/// !!!ARG:op
/// add
/// !!!ARG:a
/// 5
/// !!!GADGET_END
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkerConfig {
    pub start_prefix: String,
    pub arg_prefix: String,
    pub end_marker: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start_prefix: "!!!GADGET_START:".to_string(),
            arg_prefix: "!!!ARG:".to_string(),
            end_marker: "!!!GADGET_END".to_string(),
        }
    }
}

/// Raw-parameter key holding block text seen before the first arg marker.
pub const PRELUDE_KEY: &str = "__prelude__";
/// Raw-parameter key listing pointers that were written more than once.
pub const DUPLICATES_KEY: &str = "__duplicates__";

/// One gadget invocation extracted from an LLM response.
///
/// `parameters` is the nested value assembled from the slash-delimited
/// pointers and is absent exactly when `parse_error` is present. All leaves
/// are strings; numeric and boolean coercion happens at schema validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParsedGadgetCall {
    pub name: String,
    pub invocation_id: InvocationId,
    /// Pointer -> raw value text, plus `__prelude__`/`__duplicates__`
    /// diagnostics where applicable.
    pub parameters_raw: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<InvocationId>,
}

impl ParsedGadgetCall {
    pub fn new(name: impl Into<String>, invocation_id: impl Into<InvocationId>) -> Self {
        Self {
            name: name.into(),
            invocation_id: invocation_id.into(),
            parameters_raw: BTreeMap::new(),
            parameters: Some(serde_json::Value::Object(Default::default())),
            parse_error: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_dependencies(
        mut self,
        deps: impl IntoIterator<Item = impl Into<InvocationId>>,
    ) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parse_error(mut self, error: impl Into<String>) -> Self {
        self.parse_error = Some(error.into());
        self.parameters = None;
        self
    }
}
