// Batch wire format: chunking, request body and per-command result parsing.

use crate::command::Command;
use crate::envelope::{PageCursor, Pagination, ResponseTime, ResultEnvelope};
use crate::error::ApiError;
use crate::query::command_line;
use serde_json::{Map, Value};

/// Server-side limit on commands in one physical batch
pub const MAX_BATCH_SIZE: usize = 50;

/// Method name of the batch endpoint
pub const BATCH_METHOD: &str = "batch";

/// Split entries into chunks of at most `size`, preserving order
pub fn chunk_entries(entries: Vec<(String, Command)>, size: usize) -> Vec<Vec<(String, Command)>> {
    let size = size.clamp(1, MAX_BATCH_SIZE);
    let mut chunks = Vec::with_capacity(entries.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for entry in entries {
        current.push(entry);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// One physical batch request.
///
/// Entries keep their batch-wide names; positional chunks are sent as an
/// array and addressed by chunk-local index on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchChunk {
    pub halt: bool,
    pub positional: bool,
    pub entries: Vec<(String, Command)>,
}

impl BatchChunk {
    pub fn new(entries: Vec<(String, Command)>, halt: bool, positional: bool) -> Self {
        Self {
            halt,
            positional,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of entry `index` as the server sees it; `None` past the end
    pub fn wire_name(&self, index: usize) -> Option<String> {
        let (name, _) = self.entries.get(index)?;
        Some(if self.positional {
            index.to_string()
        } else {
            name.clone()
        })
    }

    /// `{halt, cmd}` request body
    pub fn body(&self) -> Value {
        let cmd = if self.positional {
            Value::Array(
                self.entries
                    .iter()
                    .map(|(_, c)| Value::String(command_line(&c.method, &c.params)))
                    .collect(),
            )
        } else {
            let mut map = Map::with_capacity(self.entries.len());
            for (name, c) in &self.entries {
                map.insert(
                    name.clone(),
                    Value::String(command_line(&c.method, &c.params)),
                );
            }
            Value::Object(map)
        };
        serde_json::json!({
            "halt": if self.halt { 1 } else { 0 },
            "cmd": cmd,
        })
    }

    /// Split a batch response into per-command envelopes
    pub fn parse_response(&self, status: u16, payload: &Value) -> ChunkOutcome {
        if let Some(err) = ApiError::from_payload(payload) {
            let err = err.with_status(status);
            return ChunkOutcome {
                results: self
                    .entries
                    .iter()
                    .map(|(name, _)| {
                        (
                            name.clone(),
                            ResultEnvelope::failure(vec![err.clone().with_command(name.as_str())])
                                .with_status(status),
                        )
                    })
                    .collect(),
                skipped: Vec::new(),
            };
        }

        let body = payload.get("result").unwrap_or(&Value::Null);
        let results = body.get("result").unwrap_or(&Value::Null);
        let errors = body.get("result_error").unwrap_or(&Value::Null);
        let totals = body.get("result_total").unwrap_or(&Value::Null);
        let nexts = body.get("result_next").unwrap_or(&Value::Null);
        let times = body.get("result_time").unwrap_or(&Value::Null);

        let any_error = match errors {
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => false,
        };

        let mut outcome = ChunkOutcome::default();
        for (index, (name, _)) in self.entries.iter().enumerate() {
            let wire = self.wire_name(index).unwrap_or_else(|| name.clone());
            let time = pick(times, &wire, index)
                .and_then(|t| serde_json::from_value::<ResponseTime>(t.clone()).ok());

            if let Some(err) = pick(errors, &wire, index) {
                let api_err = ApiError::from_payload(err)
                    .or_else(|| {
                        err.as_str()
                            .map(|s| ApiError::new("BATCH_COMMAND_ERROR", s))
                    })
                    .unwrap_or_else(|| ApiError::new("BATCH_COMMAND_ERROR", err.to_string()));
                outcome.results.push((
                    name.clone(),
                    ResultEnvelope::failure(vec![api_err.with_status(status).with_command(name.as_str())])
                        .with_time(time)
                        .with_status(status),
                ));
                continue;
            }

            match pick(results, &wire, index) {
                Some(data) => {
                    let pagination = Pagination {
                        total: pick(totals, &wire, index).and_then(Value::as_u64),
                        next: pick(nexts, &wire, index).and_then(|n| match n {
                            Value::Number(n) => n.as_u64().map(PageCursor::Offset),
                            Value::String(s) => s.parse().ok().map(PageCursor::Offset),
                            _ => None,
                        }),
                    };
                    outcome.results.push((
                        name.clone(),
                        ResultEnvelope::success(data.clone())
                            .with_time(time)
                            .with_pagination(pagination)
                            .with_status(status),
                    ));
                }
                None if any_error && self.halt => outcome.skipped.push(name.clone()),
                None => outcome.results.push((
                    name.clone(),
                    ResultEnvelope::success(Value::Null)
                        .with_time(time)
                        .with_status(status),
                )),
            }
        }
        outcome
    }
}

/// Look up an entry by wire name in an object, or by index in an array
fn pick<'a>(container: &'a Value, key: &str, index: usize) -> Option<&'a Value> {
    match container {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(index),
        _ => None,
    }
}

/// Parsed outcome of one physical batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub results: Vec<(String, ResultEnvelope)>,
    /// Commands the server did not run because an earlier one halted the chunk
    pub skipped: Vec<String>,
}

impl ChunkOutcome {
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|(_, env)| !env.is_success())
    }
}
