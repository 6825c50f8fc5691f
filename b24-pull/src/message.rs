// Decoded push messages and the per-session delivery gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Published by the portal backend
    Server,
    /// Published by another client
    Client,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub kind: MessageKind,
    pub id: String,
}

/// One event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub kind: MessageKind,
    /// Server message id, also the resume cursor (`mid`)
    pub id: String,
    pub module_id: String,
    pub command: String,
    pub params: Value,
    pub extra: Value,
    pub sender: Option<SenderInfo>,
    pub created: Option<DateTime<Utc>>,
    /// Seconds after `created` the message stays valid; 0 means no limit
    pub expiry: u32,
}

impl PushMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.created {
            Some(created) if self.expiry > 0 => {
                created + chrono::Duration::seconds(i64::from(self.expiry)) < now
            }
            _ => false,
        }
    }
}

/// Online state reported for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: String,
    pub is_private: bool,
    pub is_online: bool,
}

/// Everything a single frame can carry
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    Message(PushMessage),
    ChannelStats(Vec<ChannelStatus>),
    ServerStats(Value),
}

/// A channel to publish to or query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub signature: Option<String>,
}

impl ChannelRef {
    pub fn public(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_private: false,
            signature: None,
        }
    }
}

/// Message published through the push server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub receivers: Vec<ChannelRef>,
    pub body: Value,
    pub expiry: u32,
}

/// Drops messages that expired in transit or were already delivered in this
/// session. Remembers the last `window` ids.
#[derive(Debug)]
pub struct DeliveryGate {
    window: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Why a message was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    Expired,
    Duplicate,
}

impl DeliveryGate {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn admit(&mut self, message: &PushMessage, now: DateTime<Utc>) -> Result<(), Rejected> {
        if message.is_expired(now) {
            return Err(Rejected::Expired);
        }
        if message.id.is_empty() {
            return Ok(());
        }
        if !self.seen.insert(message.id.clone()) {
            return Err(Rejected::Duplicate);
        }
        self.order.push_back(message.id.clone());
        if self.order.len() > self.window {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        Ok(())
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Channel ids travel as raw bytes; hex ids are packed, anything else is
/// sent as-is
pub(crate) fn from_hex(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() % 2 != 0 || !bytes.iter().all(u8::is_ascii_hexdigit) {
        return bytes.to_vec();
    }
    bytes
        .chunks(2)
        .filter_map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn message(id: &str, created: Option<i64>, expiry: u32) -> PushMessage {
        PushMessage {
            kind: MessageKind::Server,
            id: id.to_string(),
            module_id: "im".to_string(),
            command: "messageChat".to_string(),
            params: json!({}),
            extra: json!({}),
            sender: None,
            created: created.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            expiry,
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        assert!(message("a", Some(900), 60).is_expired(now));
        assert!(!message("a", Some(990), 60).is_expired(now));
        assert!(!message("a", Some(0), 0).is_expired(now));
        assert!(!message("a", None, 60).is_expired(now));
    }

    #[test]
    fn test_gate_drops_duplicates_within_window() {
        let now = Utc::now();
        let mut gate = DeliveryGate::new(2);
        assert_eq!(gate.admit(&message("a", None, 0), now), Ok(()));
        assert_eq!(gate.admit(&message("a", None, 0), now), Err(Rejected::Duplicate));
        assert_eq!(gate.admit(&message("b", None, 0), now), Ok(()));
        assert_eq!(gate.admit(&message("c", None, 0), now), Ok(()));
        // "a" fell out of the window
        assert_eq!(gate.admit(&message("a", None, 0), now), Ok(()));
    }

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(from_hex("0aff"), vec![0x0a, 0xff]);
        assert_eq!(to_hex(&[0x0a, 0xff]), "0aff");
        assert_eq!(from_hex("not-hex"), b"not-hex".to_vec());
    }
}
