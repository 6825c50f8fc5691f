use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::TransportError;

/// One message on a push channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Binary(Bytes),
    Text(String),
}

impl ChannelFrame {
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Binary(b) => b.len(),
            ChannelFrame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bidirectional frame channel to the push server.
///
/// `recv` must be cancel-safe: the pull client races it against outbound
/// traffic. `Ok(None)` means the peer closed the channel.
#[async_trait]
pub trait PushChannel: Send {
    async fn send(&mut self, frame: ChannelFrame) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Option<ChannelFrame>, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Id of the last message seen, for channels that resume by cursor
    fn set_resume_cursor(&mut self, _mid: &str) {}
}

/// Opens push channels; one call per (re)connection attempt
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>, TransportError>;
}
