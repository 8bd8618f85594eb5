//! Incremental marker parser. Extracts gadget blocks from a chunked text
//! stream while forwarding free text verbatim at chunk granularity.
//!
//! Markers are line-anchored. A partial trailing line that could still turn
//! into a start marker is held back; everything else flows through as text
//! the moment it arrives.

use clockwork_core::call::{DUPLICATES_KEY, PRELUDE_KEY};
use clockwork_core::{InvocationId, MarkerConfig, ParsedGadgetCall};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Why the stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    Complete,
    /// The stream stopped inside an unterminated gadget block; the partial
    /// block is discarded.
    Truncated,
}

#[derive(Clone, Debug)]
pub enum ParserEvent {
    /// Free text outside any block, byte-exact.
    Text(String),
    /// One completed gadget block.
    Block(ParsedGadgetCall),
    End {
        reason: EndReason,
    },
}

#[derive(Default)]
struct BlockState {
    name: String,
    invocation_id: Option<String>,
    raw: BTreeMap<String, String>,
    duplicates: Vec<String>,
    prelude: String,
    /// Pointer and value accumulator of the arg being collected.
    current: Option<(String, String)>,
    error: Option<String>,
}

enum State {
    Outside,
    Inside(BlockState),
}

/// Streaming state machine over one LLM response.
pub struct StreamParser {
    markers: MarkerConfig,
    state: State,
    /// Unprocessed tail of the current (incomplete) line.
    buf: String,
    /// The current partial line was already forwarded as text; the rest of
    /// it (up to the newline) needs no marker check.
    line_flushed: bool,
    finished: bool,
}

impl StreamParser {
    pub fn new(markers: MarkerConfig) -> Self {
        Self {
            markers,
            state: State::Outside,
            buf: String::new(),
            line_flushed: false,
            finished: false,
        }
    }

    /// Feed one chunk, returning the events it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParserEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buf.push_str(chunk);

        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            self.process_line(line, &mut out);
        }

        // Decide what to do with the trailing partial line.
        if matches!(self.state, State::Outside) && !self.buf.is_empty() {
            if self.line_flushed || !self.could_be_start(&self.buf) {
                out.push(ParserEvent::Text(std::mem::take(&mut self.buf)));
                self.line_flushed = true;
            }
        }
        out
    }

    /// Signal end of stream. Emits any held text and the `End` event.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        match std::mem::replace(&mut self.state, State::Outside) {
            State::Outside => {
                if !self.buf.is_empty() {
                    if !self.line_flushed && self.buf.starts_with(&self.markers.start_prefix) {
                        // an unterminated start marker opens a block that
                        // never completed
                        debug!("stream ended on an incomplete start marker");
                        self.buf.clear();
                        out.push(ParserEvent::End {
                            reason: EndReason::Truncated,
                        });
                        return out;
                    }
                    out.push(ParserEvent::Text(std::mem::take(&mut self.buf)));
                }
                out.push(ParserEvent::End {
                    reason: EndReason::Complete,
                });
            }
            State::Inside(mut block) => {
                // The end marker is valid without a trailing newline.
                if self.buf.trim_end() == self.markers.end_marker {
                    self.buf.clear();
                    Self::close_current_arg(&mut block);
                    out.push(ParserEvent::Block(Self::finalize_block(&mut block)));
                    out.push(ParserEvent::End {
                        reason: EndReason::Complete,
                    });
                } else {
                    debug!(gadget = %block.name, "stream truncated mid-block");
                    self.buf.clear();
                    out.push(ParserEvent::End {
                        reason: EndReason::Truncated,
                    });
                }
            }
        }
        out
    }

    fn could_be_start(&self, partial: &str) -> bool {
        let start = &self.markers.start_prefix;
        start.starts_with(partial) || partial.starts_with(start.as_str())
    }

    fn process_line(&mut self, line: String, out: &mut Vec<ParserEvent>) {
        match &mut self.state {
            State::Outside => {
                if self.line_flushed {
                    // tail of a line already forwarded
                    self.line_flushed = false;
                    out.push(ParserEvent::Text(line));
                    return;
                }
                if let Some(rest) = line.strip_prefix(&self.markers.start_prefix) {
                    let header = rest.trim_end_matches(['\r', '\n']);
                    let (name, invocation_id) = match header.split_once(':') {
                        Some((name, id)) => (name.to_string(), Some(id.to_string())),
                        None => (header.to_string(), None),
                    };
                    let mut block = BlockState {
                        name,
                        invocation_id,
                        ..Default::default()
                    };
                    if block.name.is_empty() {
                        block.error = Some("empty gadget name in start marker".to_string());
                    }
                    self.state = State::Inside(block);
                } else {
                    out.push(ParserEvent::Text(line));
                }
            }
            State::Inside(block) => {
                let stripped = line.trim_end_matches(['\r', '\n']);
                if stripped.trim_end() == self.markers.end_marker {
                    Self::close_current_arg(block);
                    let mut done = std::mem::take(block);
                    self.state = State::Outside;
                    out.push(ParserEvent::Block(Self::finalize_block(&mut done)));
                } else if let Some(pointer) = stripped.strip_prefix(&self.markers.arg_prefix) {
                    Self::close_current_arg(block);
                    if pointer.is_empty() {
                        block.error = Some("empty arg pointer".to_string());
                    }
                    block.current = Some((pointer.to_string(), String::new()));
                } else if let Some((_, value)) = &mut block.current {
                    value.push_str(&line);
                } else {
                    block.prelude.push_str(&line);
                }
            }
        }
    }

    fn close_current_arg(block: &mut BlockState) {
        if let Some((pointer, mut value)) = block.current.take() {
            // The newline separating the value from the next marker belongs
            // to the wire format, not the value.
            if value.ends_with('\n') {
                value.pop();
                if value.ends_with('\r') {
                    value.pop();
                }
            }
            if block.raw.insert(pointer.clone(), value).is_some() {
                block.duplicates.push(pointer);
            }
        }
    }

    fn finalize_block(block: &mut BlockState) -> ParsedGadgetCall {
        let invocation_id = match block.invocation_id.take() {
            Some(id) if !id.is_empty() => InvocationId::new(id),
            _ => InvocationId::generate(),
        };
        let mut call = ParsedGadgetCall::new(block.name.clone(), invocation_id);
        call.parameters_raw = std::mem::take(&mut block.raw);
        if !block.prelude.is_empty() {
            debug!(gadget = %call.name, "discarding block text before first arg marker");
            call.parameters_raw
                .insert(PRELUDE_KEY.to_string(), std::mem::take(&mut block.prelude));
        }
        if !block.duplicates.is_empty() {
            call.parameters_raw
                .insert(DUPLICATES_KEY.to_string(), block.duplicates.join(", "));
        }

        if let Some(error) = block.error.take() {
            return call.with_parse_error(error);
        }

        let mut parameters = Value::Object(Map::new());
        for (pointer, value) in &call.parameters_raw {
            if pointer.starts_with("__") {
                continue;
            }
            insert_pointer(&mut parameters, pointer, value);
        }
        call.dependencies = extract_dependencies(&mut parameters);
        call.parameters = Some(parameters);
        call
    }
}

/// Set the leaf at a slash-delimited pointer, creating objects and (for
/// numeric segments) null-padded arrays along the way. Last write wins on
/// conflicting shapes.
fn insert_pointer(root: &mut Value, pointer: &str, value: &str) {
    let segments: Vec<&str> = pointer.split('/').collect();
    let mut cursor = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match segment.parse::<usize>() {
            Ok(index) => {
                if !cursor.is_array() {
                    *cursor = Value::Array(Vec::new());
                }
                let arr = cursor.as_array_mut().expect("just ensured array");
                while arr.len() <= index {
                    arr.push(Value::Null);
                }
                if last {
                    arr[index] = Value::String(value.to_string());
                    return;
                }
                cursor = &mut arr[index];
            }
            Err(_) => {
                if !cursor.is_object() {
                    *cursor = Value::Object(Map::new());
                }
                let obj = cursor.as_object_mut().expect("just ensured object");
                if last {
                    obj.insert(segment.to_string(), Value::String(value.to_string()));
                    return;
                }
                cursor = obj
                    .entry(segment.to_string())
                    .or_insert(Value::Null);
            }
        }
    }
}

/// Pull `dependencies` out of the assembled parameters. Accepts an array of
/// ids (`dependencies/0`, `dependencies/1`, ...) or one comma-separated
/// string.
fn extract_dependencies(parameters: &mut Value) -> Vec<InvocationId> {
    let Some(obj) = parameters.as_object_mut() else {
        return Vec::new();
    };
    match obj.remove("dependencies") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(InvocationId::new)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(InvocationId::new)
            .collect(),
        Some(_) => Vec::new(),
    }
}

/// Render one call back into marker wire format; the inverse of the parser
/// for canonical blocks. Falls back to flattening `parameters` when the
/// call carries no raw pointers (synthetic calls).
pub fn render_block(call: &ParsedGadgetCall, markers: &MarkerConfig) -> String {
    let mut out = format!(
        "{}{}:{}\n",
        markers.start_prefix, call.name, call.invocation_id
    );
    let mut pointers: Vec<(String, String)> = call
        .parameters_raw
        .iter()
        .filter(|(k, _)| !k.starts_with("__"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if pointers.is_empty() {
        if let Some(parameters) = &call.parameters {
            flatten_value("", parameters, &mut pointers);
        }
        for (i, dep) in call.dependencies.iter().enumerate() {
            pointers.push((format!("dependencies/{i}"), dep.to_string()));
        }
    }
    for (pointer, value) in pointers {
        out.push_str(&markers.arg_prefix);
        out.push_str(&pointer);
        out.push('\n');
        out.push_str(&value);
        out.push('\n');
    }
    out.push_str(&markers.end_marker);
    out.push('\n');
    out
}

fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}/{k}")
                };
                flatten_value(&path, v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_value(&format!("{prefix}/{i}"), v, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Null => {}
        other => out.push((prefix.to_string(), other.to_string())),
    }
}
