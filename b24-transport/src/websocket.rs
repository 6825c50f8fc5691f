use crate::channel::{ChannelFrame, PushChannel, PushConnector};
use crate::transport::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// WebSocket push channel.
///
/// Reading and writing run in their own tasks so `recv` is a plain channel
/// receive and stays cancel-safe.
pub struct WebSocketChannel {
    /// Frames to write
    tx: Option<mpsc::UnboundedSender<ChannelFrame>>,
    /// Frames read from the socket
    rx: mpsc::UnboundedReceiver<Result<ChannelFrame, TransportError>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketChannel {
    /// Create a new channel from an established stream
    pub fn new<S>(stream: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx_internal) = mpsc::unbounded_channel::<ChannelFrame>();
        let (tx_internal, rx) = mpsc::unbounded_channel();

        // Spawn task to handle incoming messages
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let frame = match msg {
                    Ok(WsMessage::Binary(data)) => ChannelFrame::Binary(data),
                    Ok(WsMessage::Text(text)) => ChannelFrame::Text(text.as_str().to_string()),
                    Ok(WsMessage::Close(reason)) => {
                        debug!(?reason, "WebSocket closed by peer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        let _ = tx_internal.send(Err(TransportError::Protocol(e.to_string())));
                        break;
                    }
                };
                if tx_internal.send(Ok(frame)).is_err() {
                    break;
                }
            }
        });

        // Spawn task to handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx_internal.recv().await {
                let msg = match frame {
                    ChannelFrame::Binary(data) => WsMessage::Binary(data),
                    ChannelFrame::Text(text) => WsMessage::Text(text.into()),
                };
                if let Err(e) = sink.send(msg).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Self {
            tx: Some(tx),
            rx,
            reader,
            writer,
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl PushChannel for WebSocketChannel {
    async fn send(&mut self, frame: ChannelFrame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) if !self.writer.is_finished() => {
                tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
            }
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    async fn recv(&mut self) -> Result<Option<ChannelFrame>, TransportError> {
        self.rx.recv().await.transpose()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // dropping the sender lets the writer flush and close the sink
        self.tx.take();
        Ok(())
    }
}

/// Connects [`WebSocketChannel`]s with tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Protocol(format!("Failed to connect: {}", e)))?;
        debug!(status = %response.status(), "WebSocket connected");
        Ok(Box::new(WebSocketChannel::new(stream)))
    }
}
