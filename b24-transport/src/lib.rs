pub mod channel;
#[cfg(feature = "http")]
pub mod http;
pub mod long_poll;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelFrame, PushChannel, PushConnector};
#[cfg(feature = "http")]
pub use http::{HttpTransportConfig, ReqwestTransport};
pub use long_poll::{LongPollConfig, LongPollConnector};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketChannel, WebSocketConnector};
