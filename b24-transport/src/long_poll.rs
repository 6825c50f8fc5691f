// Long-polling push channel built on any HttpTransport.
// A background task keeps one GET outstanding; frames are handed over
// through an mpsc channel so `recv` stays cancel-safe.

use crate::channel::{ChannelFrame, PushChannel, PushConnector};
use crate::transport::{HttpRequest, HttpTransport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

/// Status the server uses for "no messages before the poll timed out"
const NOT_MODIFIED: u16 = 304;

#[derive(Debug, Clone)]
pub struct LongPollConfig {
    /// Upper bound for one poll request
    pub poll_timeout: Duration,
    /// URL used for outbound frames; defaults to the poll URL
    pub publish_url: Option<String>,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(45),
            publish_url: None,
        }
    }
}

pub struct LongPollConnector {
    http: Arc<dyn HttpTransport>,
    config: LongPollConfig,
}

impl LongPollConnector {
    pub fn new(http: Arc<dyn HttpTransport>, config: LongPollConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl PushConnector for LongPollConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushChannel>, TransportError> {
        Ok(Box::new(LongPollChannel::open(
            self.http.clone(),
            url.to_string(),
            self.config.clone(),
        )))
    }
}

pub struct LongPollChannel {
    http: Arc<dyn HttpTransport>,
    publish_url: String,
    cursor: Arc<Mutex<Option<String>>>,
    rx: mpsc::Receiver<Result<ChannelFrame, TransportError>>,
    poller: JoinHandle<()>,
}

impl LongPollChannel {
    fn open(http: Arc<dyn HttpTransport>, url: String, config: LongPollConfig) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let cursor: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let publish_url = config.publish_url.clone().unwrap_or_else(|| url.clone());

        let poll_http = http.clone();
        let poll_cursor = cursor.clone();
        let poller = tokio::spawn(async move {
            loop {
                let mid = poll_cursor.lock().ok().and_then(|c| c.clone());
                let poll_url = with_mid(&url, mid.as_deref());
                trace!(url = %poll_url, "Long-poll request");

                let request = HttpRequest::get(poll_url).with_timeout(config.poll_timeout);
                let frame = match poll_http.send(request).await {
                    Ok(resp) if resp.status == NOT_MODIFIED => continue,
                    Ok(resp) if resp.is_success() => {
                        if resp.body.is_empty() {
                            continue;
                        }
                        Ok(to_frame(resp.body))
                    }
                    Ok(resp) => Err(TransportError::InvalidResponse {
                        status: resp.status,
                        reason: "long-poll request rejected".to_string(),
                    }),
                    Err(TransportError::Timeout) => continue,
                    Err(e) => Err(e),
                };

                let failed = frame.is_err();
                if tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
            debug!("Long-poll loop finished");
        });

        Self {
            http,
            publish_url,
            cursor,
            rx,
            poller,
        }
    }
}

impl Drop for LongPollChannel {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Sets the `mid` query pair, replacing one carried by the connect URL
fn with_mid(url: &str, mid: Option<&str>) -> String {
    let Some(mid) = mid else {
        return url.to_string();
    };
    let Ok(mut parsed) = Url::parse(url) else {
        let sep = if url.contains('?') { '&' } else { '?' };
        return format!("{}{}mid={}", url, sep, mid);
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "mid")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("mid", mid);
    parsed.into()
}

fn to_frame(body: Bytes) -> ChannelFrame {
    match std::str::from_utf8(&body) {
        Ok(text) if text.starts_with('#') || text.starts_with('{') => {
            ChannelFrame::Text(text.to_string())
        }
        _ => ChannelFrame::Binary(body),
    }
}

#[async_trait]
impl PushChannel for LongPollChannel {
    async fn send(&mut self, frame: ChannelFrame) -> Result<(), TransportError> {
        let body = match frame {
            ChannelFrame::Binary(b) => b,
            ChannelFrame::Text(t) => Bytes::from(t),
        };
        let resp = self
            .http
            .send(HttpRequest::post_bytes(self.publish_url.clone(), body))
            .await?;
        if !resp.is_success() {
            warn!(status = resp.status, "Long-poll publish rejected");
            return Err(TransportError::InvalidResponse {
                status: resp.status,
                reason: "publish rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ChannelFrame>, TransportError> {
        self.rx.recv().await.transpose()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.poller.abort();
        self.rx.close();
        Ok(())
    }

    fn set_resume_cursor(&mut self, mid: &str) {
        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = Some(mid.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_mid() {
        assert_eq!(with_mid("https://p/sub/?CHANNEL_ID=a", Some("42")), "https://p/sub/?CHANNEL_ID=a&mid=42");
        assert_eq!(with_mid("https://p/sub/", Some("42")), "https://p/sub/?mid=42");
        assert_eq!(with_mid("https://p/sub/", None), "https://p/sub/");
        assert_eq!(
            with_mid("https://p/sub/?CHANNEL_ID=a&mid=1&revision=19", Some("2")),
            "https://p/sub/?CHANNEL_ID=a&revision=19&mid=2"
        );
    }

    #[test]
    fn test_to_frame() {
        assert!(matches!(
            to_frame(Bytes::from_static(b"#!NGINXNMS!#{}#!NGINXNMS!#")),
            ChannelFrame::Text(_)
        ));
        assert!(matches!(
            to_frame(Bytes::from_static(&[0x0a, 0x02, 0x0a, 0x00])),
            ChannelFrame::Binary(_)
        ));
    }
}
