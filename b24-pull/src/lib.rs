// Bitrix24 push (pull) client
// - Protobuf frame schema and a per-connection codec
// - Subscriber registry with isolated callbacks
// - Reconnecting client with an ordered outbound queue

pub mod client;
pub mod codec;
pub mod config;
pub mod message;
pub mod schema;
pub mod subscription;

pub use client::{PullClient, PullError, PullState, PullStats};
pub use codec::{CodecError, DecodedFrame, PullCodec, SchemaVersion, TEXT_DELIMITER};
pub use config::{ConnectionKind, PullChannel, PullConfig, PullServerConfig, CONFIG_METHOD};
pub use message::{
    ChannelRef, ChannelStatus, DeliveryGate, MessageKind, OutboundMessage, PullEvent,
    PushMessage, Rejected, SenderInfo,
};
pub use subscription::{
    Callback, CallbackError, DispatchReport, SubscriptionFilter, SubscriptionId, Subscriptions,
};
