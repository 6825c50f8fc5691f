// Pull client: keeps one push channel open, decodes frames, hands messages
// to subscribers and reconnects with backoff when the channel drops.
//
// Outbound frames always go through the queue; the session loop flushes it
// in FIFO order whenever a channel is up, so frames queued while offline are
// sent once, in order, right after the next connect.

use crate::codec::{CodecError, PullCodec};
use crate::config::{ConnectionKind, PullConfig, PullServerConfig};
use crate::message::{
    ChannelRef, DeliveryGate, OutboundMessage, PullEvent, PushMessage, Rejected,
};
use crate::subscription::{CallbackError, SubscriptionFilter, SubscriptionId, Subscriptions};
use b24_core::{B24Error, TransportError};
use b24_transport::{ChannelFrame, PushChannel, PushConnector};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum PullError {
    #[error("outbound queue is full ({0} frames)")]
    QueueFull(usize),
    #[error("pull client is closed")]
    Closed,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("REST call failed: {0}")]
    Rest(#[from] B24Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    messages: AtomicU64,
    expired: AtomicU64,
    duplicates: AtomicU64,
    decode_errors: AtomicU64,
    subscriber_failures: AtomicU64,
    reconnects: AtomicU64,
    sent: AtomicU64,
}

/// Counters since the client was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    pub frames: u64,
    pub messages: u64,
    pub expired: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub subscriber_failures: u64,
    pub reconnects: u64,
    pub sent: u64,
}

struct Shared {
    config: PullConfig,
    server: PullServerConfig,
    kind: ConnectionKind,
    codec: PullCodec,
    connector: Arc<dyn PushConnector>,
    subscriptions: Subscriptions,
    outbound: Mutex<VecDeque<ChannelFrame>>,
    outbound_ready: Notify,
    state: watch::Sender<PullState>,
    last_mid: Mutex<Option<String>>,
    online: Mutex<HashMap<String, bool>>,
    server_stats: Mutex<Option<Value>>,
    counters: Counters,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

pub struct PullClient {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PullClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullClient")
            .field("state", &self.state())
            .field("kind", &self.shared.kind)
            .field("schema", &self.shared.codec.schema())
            .finish()
    }
}

impl PullClient {
    pub fn new(
        config: PullConfig,
        server: PullServerConfig,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let (state, _) = watch::channel(PullState::Disconnected);
        let kind = server.preferred_kind();
        Self {
            shared: Arc::new(Shared {
                codec: PullCodec::new(config.schema),
                config,
                server,
                kind,
                connector,
                subscriptions: Subscriptions::new(),
                outbound: Mutex::new(VecDeque::new()),
                outbound_ready: Notify::new(),
                state,
                last_mid: Mutex::new(None),
                online: Mutex::new(HashMap::new()),
                server_stats: Mutex::new(None),
                counters: Counters::default(),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Client whose schema follows the server generation
    pub fn for_server(
        config: PullConfig,
        server: PullServerConfig,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let config = PullConfig {
            schema: server.schema(),
            ..config
        };
        Self::new(config, server, connector)
    }

    /// Override the transport picked from the server description.
    /// Only valid before `start`.
    pub fn with_connection_kind(mut self, kind: ConnectionKind) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.kind = kind;
        }
        self
    }

    /// Spawn the connection loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), PullError> {
        if self.shutdown.is_cancelled() {
            return Err(PullError::Closed);
        }
        let mut task = self.task.lock().map_err(|_| PullError::Closed)?;
        if task.is_none() {
            let shared = self.shared.clone();
            let shutdown = self.shutdown.clone();
            *task = Some(tokio::spawn(run(shared, shutdown)));
        }
        Ok(())
    }

    /// Close the channel and stop reconnecting. The client cannot be
    /// restarted afterwards.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Pull loop ended abnormally: {}", e);
            }
        }
        self.shared.set_state(PullState::Disconnected);
    }

    pub fn state(&self) -> PullState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PullState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe<F>(&self, filter: SubscriptionFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&PushMessage) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.shared.subscriptions.subscribe(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscriptions.unsubscribe(id)
    }

    /// Queue messages for other channels
    pub fn publish(&self, messages: &[OutboundMessage]) -> Result<(), PullError> {
        let batch = self.shared.codec.publish_request(messages)?;
        self.send_request(&batch)
    }

    /// Ask the server which of `channels` are online; answers show up in
    /// [`PullClient::channel_online`]
    pub fn request_channel_stats(&self, channels: &[ChannelRef]) -> Result<(), PullError> {
        let batch = self.shared.codec.channel_stats_request(channels);
        self.send_request(&batch)
    }

    pub fn send_request(&self, batch: &crate::schema::RequestBatch) -> Result<(), PullError> {
        let frame = self.shared.codec.encode(batch)?;
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: ChannelFrame) -> Result<(), PullError> {
        if self.shutdown.is_cancelled() {
            return Err(PullError::Closed);
        }
        {
            let mut queue = self.shared.outbound.lock().map_err(|_| PullError::Closed)?;
            let limit = self.shared.config.outbound_queue_limit;
            if queue.len() >= limit {
                return Err(PullError::QueueFull(limit));
            }
            queue.push_back(frame);
            trace!(queued = queue.len(), "Outbound frame queued");
        }
        self.shared.outbound_ready.notify_one();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.outbound.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Id of the last delivered message
    pub fn last_mid(&self) -> Option<String> {
        self.shared.last_mid()
    }

    pub fn channel_online(&self, id: &str) -> Option<bool> {
        self.shared
            .online
            .lock()
            .ok()
            .and_then(|m| m.get(id).copied())
    }

    pub fn server_stats(&self) -> Option<Value> {
        self.shared.server_stats.lock().ok().and_then(|s| s.clone())
    }

    pub fn stats(&self) -> PullStats {
        let c = &self.shared.counters;
        PullStats {
            frames: c.frames.load(Ordering::Relaxed),
            messages: c.messages.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            subscriber_failures: c.subscriber_failures.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PullClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    fn set_state(&self, state: PullState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "Pull state changed");
            *current = state;
            true
        });
    }

    fn last_mid(&self) -> Option<String> {
        self.last_mid.lock().ok().and_then(|m| m.clone())
    }

    fn handle_frame(&self, frame: &ChannelFrame, gate: &mut DeliveryGate, channel: &mut dyn PushChannel) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        let events = match self.codec.decode(frame) {
            Ok(decoded) => {
                if decoded.skipped > 0 {
                    self.counters
                        .decode_errors
                        .fetch_add(decoded.skipped as u64, Ordering::Relaxed);
                }
                decoded.events
            }
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(len = frame.len(), "Dropping undecodable frame: {}", e);
                return;
            }
        };

        for event in events {
            match event {
                PullEvent::Message(message) => self.deliver(&message, gate, channel),
                PullEvent::ChannelStats(channels) => {
                    if let Ok(mut online) = self.online.lock() {
                        for status in channels {
                            online.insert(status.id, status.is_online);
                        }
                    }
                }
                PullEvent::ServerStats(stats) => {
                    if let Ok(mut slot) = self.server_stats.lock() {
                        *slot = Some(stats);
                    }
                }
            }
        }
    }

    fn deliver(&self, message: &PushMessage, gate: &mut DeliveryGate, channel: &mut dyn PushChannel) {
        match gate.admit(message, Utc::now()) {
            Ok(()) => {}
            Err(Rejected::Expired) => {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                debug!(id = %message.id, command = %message.command, "Dropping expired message");
                return;
            }
            Err(Rejected::Duplicate) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                trace!(id = %message.id, "Dropping duplicate message");
                return;
            }
        }

        if !message.id.is_empty() {
            if let Ok(mut mid) = self.last_mid.lock() {
                *mid = Some(message.id.clone());
            }
            channel.set_resume_cursor(&message.id);
        }

        let report = self.subscriptions.dispatch(message);
        if report.failed > 0 {
            self.counters
                .subscriber_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Send queued frames in order. A frame leaves the queue only once the
    /// channel accepted it.
    async fn flush(&self, channel: &mut dyn PushChannel) -> Result<usize, TransportError> {
        let mut sent = 0;
        loop {
            let next = match self.outbound.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(frame) = next else {
                return Ok(sent);
            };
            if let Err(e) = channel.send(frame.clone()).await {
                if let Ok(mut queue) = self.outbound.lock() {
                    queue.push_front(frame);
                }
                return Err(e);
            }
            sent += 1;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn session(
        &self,
        channel: &mut dyn PushChannel,
        gate: &mut DeliveryGate,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            match self.flush(channel).await {
                Ok(0) => {}
                Ok(n) => debug!(frames = n, "Flushed outbound queue"),
                Err(e) => return SessionEnd::Dropped(e.to_string()),
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = self.outbound_ready.notified() => {}
                received = channel.recv() => match received {
                    Ok(Some(frame)) => self.handle_frame(&frame, gate, channel),
                    Ok(None) => return SessionEnd::Dropped("closed by server".to_string()),
                    Err(e) => return SessionEnd::Dropped(e.to_string()),
                },
            }
        }
    }
}

async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut gate = DeliveryGate::new(shared.config.dedup_window);
    let mut attempt: u32 = 0;
    shared.set_state(PullState::Connecting);

    loop {
        if shared.server.has_expired_channel(Utc::now()) {
            warn!("Push channel expired; refresh the server config");
        }
        let mid = shared.last_mid();
        let url = match shared.server.connection_url(shared.kind, mid.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot build push url: {}", e);
                break;
            }
        };

        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = shared.connector.connect(&url) => connected,
        };

        match connected {
            Ok(mut channel) => {
                if let Some(mid) = &mid {
                    channel.set_resume_cursor(mid);
                }
                attempt = 0;
                shared.set_state(PullState::Connected);
                info!(kind = ?shared.kind, "Push channel connected");

                let end = shared.session(channel.as_mut(), &mut gate, &shutdown).await;
                if let Err(e) = channel.close().await {
                    trace!("Closing push channel: {}", e);
                }
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => warn!("Push channel dropped: {}", reason),
                }
            }
            Err(e) => warn!(attempt, "Push connect failed: {}", e),
        }

        shared.set_state(PullState::Reconnecting);
        shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        let delay = shared.config.backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?delay, attempt, "Reconnecting push channel");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(PullState::Disconnected);
    info!("Pull client stopped");
}
