// Hosting-frame bridge
// One-shot request/response calls to the page that embeds an application.
// The channel itself is supplied by the embedder.

use async_trait::async_trait;
use b24_core::B24Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

/// Request/response channel to the parent frame
#[async_trait]
pub trait FrameChannel: Send + Sync {
    async fn request(&self, action: &str, payload: Value) -> Result<Value, B24Error>;
}

#[derive(Clone)]
pub struct ParentMessenger {
    channel: Arc<dyn FrameChannel>,
}

impl std::fmt::Debug for ParentMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentMessenger").finish_non_exhaustive()
    }
}

impl ParentMessenger {
    pub fn new(channel: Arc<dyn FrameChannel>) -> Self {
        Self { channel }
    }

    pub async fn send(&self, action: &str, payload: Value) -> Result<Value, B24Error> {
        if action.is_empty() {
            return Err(B24Error::configuration("frame action must not be empty"));
        }
        tracing::debug!(action, "Sending frame message");
        self.channel.request(action, payload).await
    }
}

/// Reply to [`Slider::open_path`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SliderResult {
    pub is_open_at_new_window: bool,
    pub is_close: bool,
}

#[derive(Debug, Clone)]
pub struct Slider {
    messenger: ParentMessenger,
}

impl Slider {
    pub const OPEN_PATH: &'static str = "openPath";

    pub fn new(messenger: ParentMessenger) -> Self {
        Self { messenger }
    }

    /// Open `url` in the portal slider; resolves when the slider closes
    pub async fn open_path(&self, url: &Url, width: u32) -> Result<SliderResult, B24Error> {
        let reply = self
            .messenger
            .send(Self::OPEN_PATH, json!({"path": url.as_str(), "width": width}))
            .await?;
        if reply.is_null() {
            return Ok(SliderResult::default());
        }
        Ok(serde_json::from_value(reply)?)
    }
}
