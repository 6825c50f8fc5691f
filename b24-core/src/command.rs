use crate::error::B24Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single REST call: method name plus its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl Command {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Command without parameters
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, empty_params())
    }

    pub fn validate(&self) -> Result<(), B24Error> {
        if self.method.trim().is_empty() {
            return Err(B24Error::configuration("command method must not be empty"));
        }
        match self.params {
            Value::Object(_) | Value::Null => Ok(()),
            _ => Err(B24Error::configuration(format!(
                "params of '{}' must be an object",
                self.method
            ))),
        }
    }
}

/// Commands of one logical batch.
///
/// Named batches address results by name; positional batches by the
/// command's index in the input.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCommands {
    Named(IndexMap<String, Command>),
    Positional(Vec<Command>),
}

impl BatchCommands {
    pub fn len(&self) -> usize {
        match self {
            BatchCommands::Named(map) => map.len(),
            BatchCommands::Positional(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_positional(&self) -> bool {
        matches!(self, BatchCommands::Positional(_))
    }

    /// Flatten into `(name, command)` pairs in execution order
    pub fn into_entries(self) -> Vec<(String, Command)> {
        match self {
            BatchCommands::Named(map) => map.into_iter().collect(),
            BatchCommands::Positional(list) => list
                .into_iter()
                .enumerate()
                .map(|(i, cmd)| (i.to_string(), cmd))
                .collect(),
        }
    }
}

impl From<Vec<Command>> for BatchCommands {
    fn from(list: Vec<Command>) -> Self {
        BatchCommands::Positional(list)
    }
}

impl From<IndexMap<String, Command>> for BatchCommands {
    fn from(map: IndexMap<String, Command>) -> Self {
        BatchCommands::Named(map)
    }
}

impl<const N: usize> From<[(&str, Command); N]> for BatchCommands {
    fn from(entries: [(&str, Command); N]) -> Self {
        BatchCommands::Named(
            entries
                .into_iter()
                .map(|(name, cmd)| (name.to_string(), cmd))
                .collect(),
        )
    }
}
