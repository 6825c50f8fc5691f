// Subscriber registry.
// Callbacks are cloned out of the lock before they run, so a callback may
// subscribe or unsubscribe without deadlocking.

use crate::message::{MessageKind, PushMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&PushMessage) -> Result<(), CallbackError> + Send + Sync>;

/// Selects messages by module, command and sender kind; `None` matches
/// anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub module_id: Option<String>,
    pub command: Option<String>,
    pub kind: Option<MessageKind>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn module(module_id: impl Into<String>) -> Self {
        Self {
            module_id: Some(module_id.into()),
            ..Self::default()
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Only messages published by `kind`, e.g. backend events without
    /// client-to-client traffic
    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, message: &PushMessage) -> bool {
        self.module_id
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(&message.module_id))
            && self.command.as_deref().is_none_or(|c| c == message.command)
            && self.kind.is_none_or(|k| k == message.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Result of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry {
    filter: SubscriptionFilter,
    callback: Callback,
}

#[derive(Default)]
pub struct Subscriptions {
    next_id: AtomicU64,
    // ordered by id, so delivery follows subscription order
    entries: RwLock<BTreeMap<SubscriptionId, Entry>>,
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("count", &self.len())
            .finish()
    }
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, filter: SubscriptionFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&PushMessage) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                id,
                Entry {
                    filter,
                    callback: Arc::new(callback),
                },
            );
        }
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, message: &PushMessage) -> DispatchReport {
        let matching: Vec<(SubscriptionId, Callback)> = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, e)| e.filter.matches(message))
                .map(|(id, e)| (*id, e.callback.clone()))
                .collect(),
            Err(_) => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for (id, callback) in matching {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscription = ?id, command = %message.command, "Subscriber failed: {}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(subscription = ?id, command = %message.command, "Subscriber panicked");
                    report.failed += 1;
                }
            }
        }
        trace!(
            module_id = %message.module_id,
            command = %message.command,
            delivered = report.delivered,
            failed = report.failed,
            "Dispatched push message"
        );
        report
    }
}
