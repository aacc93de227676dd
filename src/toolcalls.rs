//! Tool-call normalization.
//!
//! Backends emit function-call payloads in several shapes: the strict OpenAI
//! `{id, type, function: {name, arguments}}` form, a relaxed form with
//! `name`/`arguments` at the top level, arguments as objects instead of
//! JSON-encoded strings, and (when streaming) argument text split into
//! fragments addressed by a positional index. Everything here reshapes that
//! into the strict form without ever failing the request: unusable entries
//! are dropped, non-JSON argument text is rewrapped, and every repair is
//! counted by stage and reason.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const STAGE_NORMALIZE: &str = "normalize";
pub const STAGE_STREAM_FINALIZE: &str = "stream_finalize";

pub fn note_malformed(stage: &'static str, reason: &'static str) {
    tracing::warn!(stage, reason, "malformed tool call data");
    metrics::counter!(
        "modelgate_tool_calls_malformed_total",
        "stage" => stage,
        "reason" => reason
    )
    .increment(1);
}

pub fn note_fallback(stage: &'static str, action: &'static str) {
    metrics::counter!(
        "modelgate_tool_calls_fallback_total",
        "stage" => stage,
        "action" => action
    )
    .increment(1);
}

fn synth_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().to_string().replace("-", ""))
}

/// Extracts `(name, arguments)` from either the strict nested shape or the
/// relaxed shape where they sit at the top level of the entry.
fn extract_function(entry: &Value) -> (Option<String>, Option<Value>) {
    if let Some(function) = entry.get("function") {
        if let Some(obj) = function.as_object() {
            let name = obj
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            return (name, obj.get("arguments").cloned());
        }
        // A stringified function object shows up from some backends.
        if let Some(raw) = function.as_str() {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) {
                let name = obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                return (name, obj.get("arguments").cloned());
            }
            return (Some(raw.to_string()), entry.get("arguments").cloned());
        }
        return (None, None);
    }
    let name = entry
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    (name, entry.get("arguments").cloned())
}

enum ArgumentOutcome {
    /// Final JSON-encoded argument string, plus whether a fallback applied.
    Keep(String),
    Wrapped(String),
    ExplicitEmpty,
    Missing,
}

fn resolve_arguments(raw: Option<&Value>) -> ArgumentOutcome {
    match raw {
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                ArgumentOutcome::ExplicitEmpty
            } else if serde_json::from_str::<Value>(s).is_ok() {
                ArgumentOutcome::Keep(s.clone())
            } else {
                ArgumentOutcome::Wrapped(json!({ "input": s }).to_string())
            }
        }
        Some(Value::Object(map)) => {
            if map.is_empty() {
                ArgumentOutcome::ExplicitEmpty
            } else {
                ArgumentOutcome::Keep(Value::Object(map.clone()).to_string())
            }
        }
        Some(Value::Null) | None => ArgumentOutcome::Missing,
        Some(other) => ArgumentOutcome::Wrapped(json!({ "input": other.to_string() }).to_string()),
    }
}

/// Buffered-mode normalization. Every surviving entry comes out as
/// `{id, type: "function", index, function: {name, arguments}}` with
/// `arguments` a JSON-encoded string. Idempotent: feeding the output back in
/// reproduces it.
pub fn normalize_tool_calls(raw: &Value, stage: &'static str) -> Vec<Value> {
    let Some(entries) = raw.as_array() else {
        note_malformed(stage, "not_a_list");
        return Vec::new();
    };
    let mut normalized = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        if !entry.is_object() {
            note_malformed(stage, "call_not_object");
            continue;
        }
        let (name, arguments) = extract_function(entry);
        let name = match name {
            Some(n) if !n.trim().is_empty() => n,
            _ => {
                note_malformed(stage, "missing_name");
                continue;
            }
        };
        let arguments = match resolve_arguments(arguments.as_ref()) {
            ArgumentOutcome::Keep(s) => s,
            ArgumentOutcome::Wrapped(s) => {
                note_fallback(stage, "wrapped_input");
                s
            }
            ArgumentOutcome::ExplicitEmpty => "{}".to_string(),
            ArgumentOutcome::Missing => {
                note_malformed(stage, "arguments_missing");
                note_fallback(stage, "drop_tool_call");
                continue;
            }
        };
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(synth_call_id);
        let index = entry
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(position as u64);
        normalized.push(json!({
            "id": id,
            "type": "function",
            "index": index,
            "function": { "name": name, "arguments": arguments }
        }));
    }
    normalized
}

/// One in-flight tool call inside a streamed response.
#[derive(Debug, Default)]
struct Accumulator {
    id: Option<String>,
    name: String,
    arguments: String,
    explicit_empty: bool,
}

/// Request-scoped accumulation state for one streamed response. Fragments are
/// keyed by their positional index; within an index the argument buffer grows
/// in arrival order. This value travels with the stream task and is never
/// shared across requests.
#[derive(Debug, Default)]
pub struct ToolCallAccumulators {
    slots: BTreeMap<u64, Accumulator>,
}

impl ToolCallAccumulators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Absorbs one chunk's `tool_calls` delta array. Both the nested and the
    /// relaxed top-level shapes are accepted, and may mix across indices.
    pub fn absorb(&mut self, deltas: &Value) {
        let Some(entries) = deltas.as_array() else {
            return;
        };
        for entry in entries {
            if !entry.is_object() {
                continue;
            }
            let index = entry.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let (name, piece) = extract_function(entry);
            let slot = self.slots.entry(index).or_default();
            if slot.id.is_none() {
                if let Some(id) = entry.get("id").and_then(|v| v.as_str()) {
                    if !id.is_empty() {
                        slot.id = Some(id.to_string());
                    }
                }
            }
            if slot.name.is_empty() {
                if let Some(name) = name {
                    if !name.trim().is_empty() {
                        slot.name = name;
                    }
                }
            }
            match piece {
                Some(Value::String(fragment)) => {
                    if fragment.is_empty() {
                        slot.explicit_empty = true;
                    } else {
                        let trimmed = fragment.trim();
                        // A fragment that is already one complete JSON object
                        // replaces whatever partial text came before it.
                        if trimmed.starts_with('{')
                            && trimmed.ends_with('}')
                            && serde_json::from_str::<Value>(trimmed).is_ok()
                        {
                            slot.arguments = trimmed.to_string();
                        } else {
                            slot.arguments.push_str(&fragment);
                        }
                    }
                }
                Some(Value::Object(map)) => {
                    if map.is_empty() {
                        slot.explicit_empty = true;
                    } else {
                        slot.arguments = Value::Object(map).to_string();
                    }
                }
                _ => {}
            }
        }
    }

    /// Finalizes all accumulated calls, in index order, applying the same
    /// validation and repair rules as buffered normalization.
    pub fn finalize(self) -> Vec<Value> {
        let mut finalized = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots {
            if slot.name.trim().is_empty() {
                note_malformed(STAGE_STREAM_FINALIZE, "missing_name");
                continue;
            }
            let arguments = if slot.arguments.trim().is_empty() {
                if slot.explicit_empty {
                    note_fallback(STAGE_STREAM_FINALIZE, "explicit_empty");
                    "{}".to_string()
                } else {
                    note_malformed(STAGE_STREAM_FINALIZE, "arguments_missing");
                    continue;
                }
            } else if serde_json::from_str::<Value>(&slot.arguments).is_ok() {
                slot.arguments
            } else {
                note_fallback(STAGE_STREAM_FINALIZE, "wrapped_input");
                json!({ "input": slot.arguments }).to_string()
            };
            finalized.push(json!({
                "id": slot.id.unwrap_or_else(synth_call_id),
                "type": "function",
                "index": index,
                "function": { "name": slot.name, "arguments": arguments }
            }));
        }
        finalized
    }
}

/// Process-wide bounded ring of raw tool-call fragments, kept for diagnosis
/// through the admin debug endpoint. Initialized once at startup; only the
/// explicit `clear` operation empties it.
#[derive(Clone)]
pub struct DebugBuffer {
    entries: Arc<Mutex<VecDeque<Value>>>,
    capacity: usize,
}

impl DebugBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, source: &str, model: Option<&str>, payload: &Value, raw: Option<&str>) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "source": source,
            "model": model,
            "payload": payload,
        });
        if let Some(raw) = raw {
            entry["raw"] = Value::String(raw.to_string());
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The most recent `limit` entries, oldest first.
    pub fn snapshot(&self, limit: usize) -> Vec<Value> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
