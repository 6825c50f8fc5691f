// Push server frame schema (protobuf).
// Client -> server frames are `RequestBatch`, server -> client frames are
// `ResponseBatch`. Field numbers are fixed by the server generation that
// speaks the binary protocol.

/// Frame sent by the client
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestBatch {
    #[prost(message, repeated, tag = "1")]
    pub requests: ::prost::alloc::vec::Vec<Request>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Command", tags = "1, 2, 3")]
    pub command: ::core::option::Option<request::Command>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        #[prost(message, tag = "1")]
        IncomingMessages(super::IncomingMessagesRequest),
        #[prost(message, tag = "2")]
        ChannelStats(super::ChannelStatsRequest),
        #[prost(message, tag = "3")]
        ServerStats(super::ServerStatsRequest),
    }
}

/// Publish request: messages for other channels
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingMessagesRequest {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::prost::alloc::vec::Vec<IncomingMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingMessage {
    #[prost(message, repeated, tag = "1")]
    pub receivers: ::prost::alloc::vec::Vec<Receiver>,
    #[prost(message, optional, tag = "2")]
    pub sender: ::core::option::Option<Sender>,
    #[prost(string, tag = "3")]
    pub body: ::prost::alloc::string::String,
    /// Seconds the message stays deliverable
    #[prost(uint32, tag = "4")]
    pub expiry: u32,
    #[prost(string, tag = "5")]
    pub r#type: ::prost::alloc::string::String,
}

/// Channel addressed by a message
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Receiver {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub is_private: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sender {
    #[prost(enumeration = "SenderType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SenderType {
    Unknown = 0,
    Client = 1,
    Backend = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelStatsRequest {
    #[prost(message, repeated, tag = "1")]
    pub channels: ::prost::alloc::vec::Vec<ChannelId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelId {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub is_private: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerStatsRequest {}

/// Frame sent by the server
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseBatch {
    #[prost(message, repeated, tag = "1")]
    pub responses: ::prost::alloc::vec::Vec<Response>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(oneof = "response::Command", tags = "1, 2, 3")]
    pub command: ::core::option::Option<response::Command>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        #[prost(message, tag = "1")]
        OutgoingMessages(super::OutgoingMessagesResponse),
        #[prost(message, tag = "2")]
        ChannelStats(super::ChannelStatsResponse),
        #[prost(message, tag = "3")]
        ServerStats(super::JsonResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutgoingMessagesResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::prost::alloc::vec::Vec<OutgoingMessage>,
}

/// Message delivered to this client
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutgoingMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    /// JSON: `{module_id, command, params, extra}`
    #[prost(string, tag = "2")]
    pub body: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub expiry: u32,
    /// Unix seconds
    #[prost(fixed32, tag = "4")]
    pub created: u32,
    #[prost(message, optional, tag = "5")]
    pub sender: ::core::option::Option<Sender>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub channels: ::prost::alloc::vec::Vec<ChannelStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelStats {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub is_private: bool,
    #[prost(bool, tag = "3")]
    pub is_online: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JsonResponse {
    #[prost(string, tag = "1")]
    pub json: ::prost::alloc::string::String,
}
