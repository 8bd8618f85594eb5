//! Loop configuration: policies, hooks, and builder-style setters.

use crate::compact::CompactionConfig;
use crate::scheduler::ContinueAfterError;
use clockwork_core::{MarkerConfig, Message};
use clockwork_gadgets::{ApprovalConfig, SubagentOverrides};
use clockwork_llm::{ModelPricing, ProviderRequest, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// What the loop does when the model replies with free text and no gadget
/// blocks.
#[derive(Clone)]
pub enum TextOnlyPolicy {
    /// End the loop.
    Terminate,
    /// Keep the assistant turn and run another iteration.
    Acknowledge,
    /// Ask the human-input collaborator with the assistant text as the
    /// question; the answer becomes the next user message.
    WaitForInput,
    /// Delegate the decision per response.
    Custom(Arc<dyn Fn(&str) -> TextOnlyAction + Send + Sync>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextOnlyAction {
    Terminate,
    Acknowledge,
    WaitForInput,
}

/// An ephemeral message appended to each request and never persisted.
#[derive(Clone)]
pub enum TrailingMessage {
    Static(String),
    /// Called with the iteration number; `None` skips the message this turn.
    Dynamic(Arc<dyn Fn(u32) -> Option<String> + Send + Sync>),
}

impl TrailingMessage {
    pub(crate) fn render(&self, iteration: u32) -> Option<String> {
        match self {
            Self::Static(text) => Some(text.clone()),
            Self::Dynamic(f) => f(iteration),
        }
    }
}

/// Decision of the `before_llm_call` hook.
pub enum HookDecision {
    Proceed,
    /// Proceed with replacement request messages.
    ProceedWith(Vec<Message>),
    /// Do not issue the request; the loop ends.
    Skip,
}

pub type BeforeLlmCall = Arc<dyn Fn(&ProviderRequest) -> HookDecision + Send + Sync>;

/// Rewrites a text-with-gadgets response so history stays gadget-centric:
/// the free text becomes a synthetic call to `gadget_name` with a
/// pre-synthesised result.
#[derive(Clone)]
pub struct TextWrapperConfig {
    pub gadget_name: String,
    pub parameter_mapping: Arc<dyn Fn(&str) -> Value + Send + Sync>,
    pub result_mapping: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

#[derive(Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    pub markers: MarkerConfig,
    pub stop_on_gadget_error: bool,
    pub concurrency: Option<usize>,
    pub default_gadget_timeout: Option<Duration>,
    pub text_only: TextOnlyPolicy,
    pub text_wrapper: Option<TextWrapperConfig>,
    pub trailing_message: Option<TrailingMessage>,
    pub before_llm_call: Option<BeforeLlmCall>,
    pub should_continue_after_error: Option<ContinueAfterError>,
    pub approvals: ApprovalConfig,
    pub subagent: SubagentOverrides,
    pub pricing: Option<ModelPricing>,
    pub retry: RetryPolicy,
    pub compaction: Option<CompactionConfig>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: Some(8192),
            max_iterations: 25,
            markers: MarkerConfig::default(),
            stop_on_gadget_error: true,
            concurrency: None,
            default_gadget_timeout: None,
            text_only: TextOnlyPolicy::Terminate,
            text_wrapper: None,
            trailing_message: None,
            before_llm_call: None,
            should_continue_after_error: None,
            approvals: ApprovalConfig::default(),
            subagent: SubagentOverrides::default(),
            pricing: None,
            retry: RetryPolicy::none(),
            compaction: None,
        }
    }
}

impl LoopConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_markers(mut self, markers: MarkerConfig) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_text_only(mut self, policy: TextOnlyPolicy) -> Self {
        self.text_only = policy;
        self
    }

    pub fn with_text_wrapper(mut self, wrapper: TextWrapperConfig) -> Self {
        self.text_wrapper = Some(wrapper);
        self
    }

    pub fn with_trailing_message(mut self, trailing: TrailingMessage) -> Self {
        self.trailing_message = Some(trailing);
        self
    }

    pub fn with_before_llm_call(mut self, hook: BeforeLlmCall) -> Self {
        self.before_llm_call = Some(hook);
        self
    }

    pub fn with_stop_on_gadget_error(mut self, stop: bool) -> Self {
        self.stop_on_gadget_error = stop;
        self
    }

    pub fn with_concurrency(mut self, cap: usize) -> Self {
        self.concurrency = Some(cap);
        self
    }

    pub fn with_default_gadget_timeout(mut self, timeout: Duration) -> Self {
        self.default_gadget_timeout = Some(timeout);
        self
    }

    pub fn with_approvals(mut self, approvals: ApprovalConfig) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_subagent_overrides(mut self, overrides: SubagentOverrides) -> Self {
        self.subagent = overrides;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = Some(compaction);
        self
    }
}
