// Frame codec bound to one schema version.
// Binary frames are protobuf `ResponseBatch`es; text frames are the JSON
// mode delimited by `#!NGINXNMS!#`.

use crate::message::{
    from_hex, to_hex, ChannelRef, ChannelStatus, MessageKind, OutboundMessage, PullEvent,
    PushMessage, SenderInfo,
};
use crate::schema::{self, request, response, SenderType};
use b24_transport::ChannelFrame;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

/// Delimiter around each JSON message in text mode
pub const TEXT_DELIMITER: &str = "#!NGINXNMS!#";

/// First server generation that speaks protobuf
pub const PROTOBUF_SERVER_VERSION: u32 = 4;

/// Frame format spoken on one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// JSON messages wrapped in text delimiters
    Text,
    /// Protobuf `RequestBatch` / `ResponseBatch`
    #[default]
    Protobuf,
}

impl SchemaVersion {
    /// Schema for a server generation as reported by `pull.config.get`
    pub fn for_server(version: u32) -> Self {
        if version >= PROTOBUF_SERVER_VERSION {
            SchemaVersion::Protobuf
        } else {
            SchemaVersion::Text
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{frame} frame received on a {schema:?} connection")]
    SchemaMismatch {
        schema: SchemaVersion,
        frame: &'static str,
    },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("{0} is not supported by the {1:?} schema")]
    Unsupported(&'static str, SchemaVersion),
}

/// Message body inside both frame formats
#[derive(Debug, Deserialize)]
struct Body {
    #[serde(default)]
    module_id: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    extra: Value,
}

/// Text-mode envelope around a body
#[derive(Debug, Deserialize)]
struct TextEnvelope {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    text: Value,
}

/// Events decoded from one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub events: Vec<PullEvent>,
    /// Messages inside the frame that could not be decoded and were dropped
    pub skipped: usize,
}

impl DecodedFrame {
    fn push(&mut self, event: Result<PullEvent, CodecError>) {
        match event {
            Ok(event) => self.events.push(event),
            Err(e) => {
                self.skipped += 1;
                warn!("Skipping undecodable message: {}", e);
            }
        }
    }
}

/// Encoder/decoder owned by one pull client
#[derive(Debug, Clone, Copy)]
pub struct PullCodec {
    schema: SchemaVersion,
}

impl PullCodec {
    pub fn new(schema: SchemaVersion) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    /// Fails only when the frame itself is unreadable; a bad message inside
    /// an otherwise valid frame is counted in `skipped`
    pub fn decode(&self, frame: &ChannelFrame) -> Result<DecodedFrame, CodecError> {
        match (self.schema, frame) {
            (SchemaVersion::Protobuf, ChannelFrame::Binary(bytes)) => self.decode_binary(bytes),
            (SchemaVersion::Text, ChannelFrame::Text(text)) => self.decode_text(text),
            (SchemaVersion::Text, ChannelFrame::Binary(bytes)) => {
                // long-poll may hand text frames over as bytes
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::SchemaMismatch {
                    schema: self.schema,
                    frame: "binary",
                })?;
                self.decode_text(text)
            }
            (SchemaVersion::Protobuf, ChannelFrame::Text(_)) => Err(CodecError::SchemaMismatch {
                schema: self.schema,
                frame: "text",
            }),
        }
    }

    pub fn decode_binary(&self, bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
        let batch = schema::ResponseBatch::decode(bytes)?;
        let mut decoded = DecodedFrame::default();
        for resp in batch.responses {
            match resp.command {
                Some(response::Command::OutgoingMessages(out)) => {
                    for msg in out.messages {
                        decoded.push(outgoing_to_message(msg).map(PullEvent::Message));
                    }
                }
                Some(response::Command::ChannelStats(stats)) => {
                    decoded.events.push(PullEvent::ChannelStats(
                        stats
                            .channels
                            .into_iter()
                            .map(|c| ChannelStatus {
                                id: to_hex(&c.id),
                                is_private: c.is_private,
                                is_online: c.is_online,
                            })
                            .collect(),
                    ));
                }
                Some(response::Command::ServerStats(json)) => {
                    decoded.push(
                        serde_json::from_str(&json.json)
                            .map(PullEvent::ServerStats)
                            .map_err(CodecError::from),
                    );
                }
                // unknown response kind from a newer server
                None => trace!("Skipping response without a known command"),
            }
        }
        Ok(decoded)
    }

    pub fn decode_text(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let mut decoded = DecodedFrame::default();
        for part in text.split(TEXT_DELIMITER) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            decoded.push(text_to_message(part).map(PullEvent::Message));
        }
        Ok(decoded)
    }

    /// Encode a request frame
    pub fn encode(&self, batch: &schema::RequestBatch) -> Result<ChannelFrame, CodecError> {
        match self.schema {
            SchemaVersion::Protobuf => Ok(ChannelFrame::Binary(Bytes::from(batch.encode_to_vec()))),
            SchemaVersion::Text => Err(CodecError::Unsupported("request frames", self.schema)),
        }
    }

    pub fn publish_request(&self, messages: &[OutboundMessage]) -> Result<schema::RequestBatch, CodecError> {
        let mut encoded = Vec::with_capacity(messages.len());
        for message in messages {
            if message.receivers.is_empty() {
                return Err(CodecError::Malformed("message has no receivers".to_string()));
            }
            encoded.push(schema::IncomingMessage {
                receivers: message
                    .receivers
                    .iter()
                    .map(|r| schema::Receiver {
                        id: from_hex(&r.id),
                        is_private: r.is_private,
                        signature: r.signature.as_deref().map(from_hex).unwrap_or_default(),
                    })
                    .collect(),
                sender: None,
                body: serde_json::to_string(&message.body)?,
                expiry: message.expiry,
                r#type: String::new(),
            });
        }
        Ok(schema::RequestBatch {
            requests: vec![schema::Request {
                command: Some(request::Command::IncomingMessages(
                    schema::IncomingMessagesRequest { messages: encoded },
                )),
            }],
        })
    }

    pub fn channel_stats_request(&self, channels: &[ChannelRef]) -> schema::RequestBatch {
        schema::RequestBatch {
            requests: vec![schema::Request {
                command: Some(request::Command::ChannelStats(schema::ChannelStatsRequest {
                    channels: channels
                        .iter()
                        .map(|c| schema::ChannelId {
                            id: from_hex(&c.id),
                            is_private: c.is_private,
                            signature: c.signature.as_deref().map(from_hex).unwrap_or_default(),
                        })
                        .collect(),
                })),
            }],
        }
    }
}

fn text_to_message(part: &str) -> Result<PushMessage, CodecError> {
    let envelope: TextEnvelope = serde_json::from_str(part)?;
    let body: Body = serde_json::from_value(envelope.text)?;
    let id = envelope
        .mid
        .or_else(|| envelope.id.map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string)))
        .unwrap_or_default();
    Ok(PushMessage {
        kind: MessageKind::Server,
        id,
        module_id: body.module_id,
        command: body.command,
        params: body.params,
        extra: body.extra,
        sender: None,
        created: None,
        expiry: 0,
    })
}

fn outgoing_to_message(msg: schema::OutgoingMessage) -> Result<PushMessage, CodecError> {
    let body: Body = serde_json::from_str(&msg.body)?;
    let sender = msg.sender.map(|s| SenderInfo {
        kind: match SenderType::try_from(s.r#type) {
            Ok(SenderType::Backend) => MessageKind::Server,
            Ok(SenderType::Client) => MessageKind::Client,
            _ => MessageKind::Unknown,
        },
        id: to_hex(&s.id),
    });
    let created = (msg.created > 0)
        .then(|| Utc.timestamp_opt(i64::from(msg.created), 0).single())
        .flatten();

    Ok(PushMessage {
        kind: sender.as_ref().map_or(MessageKind::Server, |s| s.kind),
        id: to_hex(&msg.id),
        module_id: body.module_id,
        command: body.command,
        params: body.params,
        extra: body.extra,
        sender,
        created,
        expiry: msg.expiry,
    })
}
