//! Streaming helpers shared by the backends

use crate::llm::ToolCallFragment;
use crate::tools::ToolCall;
use std::collections::BTreeMap;

/// Reassembles tool calls from streamed fragments keyed by index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: ToolCallFragment) {
        let entry = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            entry.name = name;
        }
        entry.arguments.push_str(&fragment.arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete calls in index order.
    ///
    /// Arguments that are not valid JSON are kept as a raw string so schema
    /// validation can report them back to the model.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| {
                let arguments = parse_arguments(&call.arguments);
                let id = call.id.unwrap_or_else(generate_call_id);
                ToolCall::with_id(id, call.name, arguments)
            })
            .collect()
    }
}

/// Parse a JSON-encoded arguments string; empty means no arguments.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Id for tool calls from backends that do not assign one
pub fn generate_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
