//! Shared fixtures: a scripted provider with canned chunk sequences, and
//! small gadgets exercising each executor path.
#![allow(dead_code)]

use async_stream::stream;
use clockwork_core::Usage;
use clockwork_gadgets::{
    ApprovalHandler, ApprovalResponse, FieldKind, FieldSpec, Gadget, GadgetContext, GadgetReply,
    HumanInputHandler, ObjectSchema, Schema,
};
use clockwork_llm::{
    ChunkStream, ProviderAdapter, ProviderError, ProviderRequest, ProviderResult, StreamChunk,
};
use clockwork_tree::{ExecutionTree, TreeEvent};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One canned provider response.
#[derive(Clone, Debug)]
pub enum Script {
    /// Stream these text chunks, then a final usage-bearing done chunk.
    Chunks(Vec<String>),
    /// Fail the stream call outright.
    Error(String),
}

pub fn chunks(parts: &[&str]) -> Script {
    Script::Chunks(parts.iter().map(|s| s.to_string()).collect())
}

/// Deterministic provider: each `stream` call consumes the next script.
/// Exhausted scripts fall back to a bare "done" response.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            chunk_delay: None,
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, _request: ProviderRequest) -> ProviderResult<ChunkStream> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| chunks(&["done"]));
        let delay = self.chunk_delay;
        match script {
            Script::Error(message) => Err(ProviderError::RequestFailed(message)),
            Script::Chunks(parts) => Ok(Box::pin(stream! {
                for part in parts {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    yield Ok(StreamChunk::text(part));
                }
                yield Ok(StreamChunk::done(
                    "end_turn",
                    Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                        cached_input_tokens: None,
                    },
                ));
            })),
        }
    }
}

/// Marker block in canonical wire form.
pub fn block(name: &str, id: &str, args: &[(&str, &str)], deps: &[&str]) -> String {
    let mut out = format!("!!!GADGET_START:{name}:{id}\n");
    for (pointer, value) in args {
        out.push_str(&format!("!!!ARG:{pointer}\n{value}\n"));
    }
    for (i, dep) in deps.iter().enumerate() {
        out.push_str(&format!("!!!ARG:dependencies/{i}\n{dep}\n"));
    }
    out.push_str("!!!GADGET_END\n");
    out
}

/// Record every tree event for later assertions.
pub fn record_events(tree: &ExecutionTree) -> Arc<Mutex<Vec<TreeEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    tree.on_any(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

pub fn event_names(events: &Arc<Mutex<Vec<TreeEvent>>>) -> Vec<&'static str> {
    events.lock().unwrap().iter().map(|e| e.kind.name()).collect()
}

// ===========================================================================
// Gadgets
// ===========================================================================

pub struct CalcGadget;

#[async_trait::async_trait]
impl Gadget for CalcGadget {
    fn name(&self) -> &str {
        "Calc"
    }

    fn description(&self) -> &str {
        "Integer arithmetic on two operands."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::new(vec![
            FieldSpec::required("op", FieldKind::Text, "add or mul"),
            FieldSpec::required("a", FieldKind::Integer, ""),
            FieldSpec::required("b", FieldKind::Integer, ""),
        ]))
    }

    async fn execute(&self, parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        let a = parameters["a"].as_i64().unwrap_or_default();
        let b = parameters["b"].as_i64().unwrap_or_default();
        let result = match parameters["op"].as_str() {
            Some("add") => a + b,
            Some("mul") => a * b,
            other => anyhow::bail!("unknown op {:?}", other),
        };
        Ok(GadgetReply::Output(result.to_string()))
    }
}

pub struct EchoGadget;

#[async_trait::async_trait]
impl Gadget for EchoGadget {
    fn name(&self) -> &str {
        "Echo"
    }

    fn description(&self) -> &str {
        "Echo the text parameter."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::new(vec![FieldSpec::required(
            "text",
            FieldKind::Text,
            "",
        )]))
    }

    async fn execute(&self, parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        Ok(GadgetReply::Output(
            parameters["text"].as_str().unwrap_or_default().to_string(),
        ))
    }
}

/// Sleeps for `sleep_ms`; optionally carries its own timeout.
pub struct SleepGadget {
    pub name: &'static str,
    pub sleep_ms: u64,
    pub timeout_ms: Option<u64>,
}

#[async_trait::async_trait]
impl Gadget for SleepGadget {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Sleep for a while."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::default())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    async fn execute(&self, _parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Ok(GadgetReply::Output("slept".to_string()))
    }
}

pub struct FailGadget;

#[async_trait::async_trait]
impl Gadget for FailGadget {
    fn name(&self) -> &str {
        "Fail"
    }

    fn description(&self) -> &str {
        "Always fails."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::default())
    }

    async fn execute(&self, _parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        anyhow::bail!("boom")
    }
}

/// Signals task completion.
pub struct FinishGadget;

#[async_trait::async_trait]
impl Gadget for FinishGadget {
    fn name(&self) -> &str {
        "Finish"
    }

    fn description(&self) -> &str {
        "End the task."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::new(vec![FieldSpec::optional(
            "message",
            FieldKind::Text,
            "",
        )]))
    }

    async fn execute(&self, parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        Ok(GadgetReply::Complete(
            parameters["message"]
                .as_str()
                .unwrap_or("task complete")
                .to_string(),
        ))
    }
}

/// Asks the human-input collaborator a question.
pub struct AskGadget;

#[async_trait::async_trait]
impl Gadget for AskGadget {
    fn name(&self) -> &str {
        "Ask"
    }

    fn description(&self) -> &str {
        "Ask the human a question."
    }

    fn schema(&self) -> Arc<dyn Schema> {
        Arc::new(ObjectSchema::new(vec![FieldSpec::required(
            "question",
            FieldKind::Text,
            "",
        )]))
    }

    async fn execute(&self, parameters: Value, _ctx: &GadgetContext) -> anyhow::Result<GadgetReply> {
        Ok(GadgetReply::NeedsHuman(
            parameters["question"].as_str().unwrap_or_default().to_string(),
        ))
    }
}

// ===========================================================================
// Collaborators
// ===========================================================================

pub struct ScriptedHuman {
    answers: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedHuman {
    pub fn new(answers: Vec<Option<&str>>) -> Self {
        Self {
            answers: Mutex::new(
                answers
                    .into_iter()
                    .map(|a| a.map(|s| s.to_string()))
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl HumanInputHandler for ScriptedHuman {
    async fn ask(&self, _question: &str) -> Option<String> {
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

pub struct ScriptedApprover {
    pub response: ApprovalResponse,
    pub calls: Mutex<usize>,
}

impl ScriptedApprover {
    pub fn new(response: ApprovalResponse) -> Self {
        Self {
            response,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ApprovalHandler for ScriptedApprover {
    async fn request_approval(&self, _gadget_name: &str, _parameters: &Value) -> ApprovalResponse {
        *self.calls.lock().unwrap() += 1;
        self.response
    }
}
