// Batch engine
// Runs named or positional command sets as one or more physical `batch`
// requests. Chunks go out strictly in sequence: references into earlier
// chunks are substituted client-side, references inside a chunk are left
// for the server.

use crate::client::{decode_payload, B24Client, CallOptions};
use b24_core::{
    chunk_entries, resolve_command, validate_references, ApiError, ApiVersion, B24Error,
    BatchChunk, BatchCommands, Command, KnownResults, Resolution, ResultEnvelope, BATCH_METHOD,
};
use b24_transport::HttpRequest;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Stop sending chunks after the first chunk with a failed command
    pub halt_on_error: bool,
    /// Keep per-command envelopes instead of bare successful results
    pub return_ajax_result: bool,
    /// Applies to each physical `batch` request, limiter wait included
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    pub fn halt_on_error() -> Self {
        Self {
            halt_on_error: true,
            ..Default::default()
        }
    }

    pub fn envelopes(mut self) -> Self {
        self.return_ajax_result = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            ..Default::default()
        }
    }
}

/// Aggregate batch result keyed by command name (`"0"`, `"1"`, ... for
/// positional batches), in declaration order
#[derive(Debug, Clone, PartialEq)]
pub enum BatchData {
    Envelopes(IndexMap<String, ResultEnvelope>),
    /// Successful results only
    Raw(IndexMap<String, Value>),
}

impl BatchData {
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            BatchData::Envelopes(map) => map.get(name).and_then(|e| e.data()),
            BatchData::Raw(map) => map.get(name),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchData::Envelopes(map) => map.len(),
            BatchData::Raw(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl B24Client {
    /// Execute a batch, chunked by `max_batch_size`.
    ///
    /// References are validated before anything is sent. The aggregate is
    /// not successful if any command failed; each error names its command.
    pub async fn call_batch(
        &self,
        commands: impl Into<BatchCommands>,
        options: BatchOptions,
    ) -> Result<ResultEnvelope<BatchData>, B24Error> {
        let commands = commands.into();
        let positional = commands.is_positional();
        let entries = commands.into_entries();
        for (_, command) in &entries {
            command.validate()?;
        }
        validate_references(&entries)?;

        let chunks = chunk_entries(entries, self.config().max_batch_size);
        let chunk_count = chunks.len();
        let mut known: KnownResults = HashMap::new();
        let mut results: IndexMap<String, ResultEnvelope> = IndexMap::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut accepted: Vec<(String, Command)> = Vec::with_capacity(chunk.len());
            let mut blocked = false;

            for (name, command) in chunk {
                let resolution = {
                    let local_name = |target: &str| {
                        accepted.iter().position(|(n, _)| n == target).map(|i| {
                            if positional {
                                i.to_string()
                            } else {
                                target.to_string()
                            }
                        })
                    };
                    resolve_command(&command, &known, &local_name)?
                };
                match resolution {
                    Resolution::Ready(resolved) => accepted.push((name, resolved)),
                    Resolution::Blocked { target } => {
                        debug!(command = %name, %target, "Skipping command with failed reference");
                        blocked = true;
                        known.insert(name.clone(), None);
                        let err = ApiError::unresolved_reference(&target).with_command(name.as_str());
                        results.insert(name, ResultEnvelope::failure(vec![err]));
                    }
                }
            }

            let mut failed = blocked;
            if !accepted.is_empty() {
                let chunk = BatchChunk::new(accepted, options.halt_on_error, positional);
                debug!(chunk = index + 1, of = chunk_count, commands = chunk.len(), "Sending batch chunk");
                let outcome = self.send_chunk(&chunk, &options.call_options()).await?;

                failed |= outcome.has_failures() || !outcome.skipped.is_empty();
                for name in outcome.skipped {
                    known.insert(name, None);
                }
                for (name, envelope) in outcome.results {
                    let value = envelope
                        .is_success()
                        .then(|| envelope.data().cloned().unwrap_or(Value::Null));
                    known.insert(name.clone(), value);
                    results.insert(name, envelope);
                }
            }

            if failed && options.halt_on_error {
                if index + 1 < chunk_count {
                    warn!(
                        chunk = index + 1,
                        remaining = chunk_count - index - 1,
                        "Batch halted on error"
                    );
                }
                break;
            }
        }

        let errors: Vec<ApiError> = results
            .values()
            .flat_map(|env| env.errors().iter().cloned())
            .collect();
        let data = if options.return_ajax_result {
            BatchData::Envelopes(results)
        } else {
            BatchData::Raw(
                results
                    .into_iter()
                    .filter(|(_, env)| env.is_success())
                    .filter_map(|(name, env)| env.into_data().map(|d| (name, d)))
                    .collect(),
            )
        };
        Ok(ResultEnvelope::partial(data, errors))
    }

    /// Positional batch whose successful results are flattened in input
    /// order: array results are spliced, other values pushed
    pub async fn call_batch_by_chunk(
        &self,
        commands: Vec<Command>,
        halt_on_error: bool,
    ) -> Result<ResultEnvelope<Vec<Value>>, B24Error> {
        let options = BatchOptions {
            halt_on_error,
            return_ajax_result: true,
            ..Default::default()
        };
        let aggregate = self
            .call_batch(BatchCommands::Positional(commands), options)
            .await?;

        Ok(aggregate.map(|data| {
            let mut items = Vec::new();
            if let BatchData::Envelopes(envelopes) = data {
                for envelope in envelopes.into_values().filter(|e| e.is_success()) {
                    match envelope.into_data() {
                        Some(Value::Array(values)) => items.extend(values),
                        Some(Value::Null) | None => {}
                        Some(value) => items.push(value),
                    }
                }
            }
            items
        }))
    }

    async fn send_chunk(
        &self,
        chunk: &BatchChunk,
        options: &CallOptions,
    ) -> Result<b24_core::ChunkOutcome, B24Error> {
        let mut body = chunk.body();
        if let (Some(token), Value::Object(map)) =
            (self.config().credentials.access_token(), &mut body)
        {
            map.insert("auth".to_string(), Value::from(token));
        }

        // batch lines are v2 method calls whatever the default version is
        let url = ApiVersion::V2.endpoint(self.config().credentials.base_url(), BATCH_METHOD);
        let response = self.send(HttpRequest::post_json(url, &body)?, options).await?;
        let payload = decode_payload(&response)?;
        let outcome = chunk.parse_response(response.status, &payload);

        self.observe_errors(
            response.status,
            outcome.results.iter().flat_map(|(_, env)| env.errors()),
        );
        Ok(outcome)
    }
}
