//! Live per-resource event feeds
//!
//! Each subscription owns one server-push channel. Messages are decoded,
//! kept in a short newest-first history per resource and broadcast to every
//! listener. A failed channel is closed and stays closed unless the caller
//! asked for [`LiveFeed::subscribe_with_reconnect`].

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use quill_wire::{ApiClient, FeedNotice};
use reqwest_eventsource::Event;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, reconnect::ReconnectPolicy};

/// Entries kept per resource
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Raw `data` fields of the messages received on one channel
pub type FeedMessageStream = Pin<Box<dyn Stream<Item = quill_wire::Result<String>> + Send>>;

/// Server-push transport for live feeds
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open the channel for a resource, resolving once it is connected
    async fn open(&self, resource_id: &str) -> quill_wire::Result<FeedMessageStream>;
}

/// Feed transport over server-sent events
pub struct EventSourceFeed {
    client: ApiClient,
}

impl EventSourceFeed {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FeedTransport for EventSourceFeed {
    async fn open(&self, resource_id: &str) -> quill_wire::Result<FeedMessageStream> {
        let mut event_source = self.client.open_feed(resource_id)?;

        // The connection is made on first poll; wait for it before handing
        // the channel out.
        let mut early = None;
        match event_source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => early = Some(message.data),
            Some(Err(e)) => {
                event_source.close();
                return Err(channel_error(e));
            }
            None => {
                return Err(quill_wire::Error::Sse(
                    "channel closed before it opened".to_string(),
                ));
            }
        }
        tracing::debug!("Live feed for {} opened", resource_id);

        Ok(Box::pin(stream! {
            if let Some(data) = early {
                yield Ok(data);
            }
            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => yield Ok(message.data),
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(channel_error(e));
                        break;
                    }
                }
            }
            event_source.close();
        }))
    }
}

/// Keep the status code of a rejected channel so callers can tell a refusal
/// from a dropped connection
fn channel_error(e: reqwest_eventsource::Error) -> quill_wire::Error {
    match e {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => quill_wire::Error::status(
            status.as_u16(),
            status.canonical_reason().unwrap_or("channel rejected"),
        ),
        reqwest_eventsource::Error::Transport(e) => quill_wire::Error::Http(e),
        other => quill_wire::Error::Sse(other.to_string()),
    }
}

/// One decoded message from a resource's channel
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub resource_id: String,
    pub payload: Value,
    /// Arrival time, epoch milliseconds
    pub received_at: i64,
}

impl FeedEvent {
    /// Typed view of the commonly used payload fields
    pub fn notice(&self) -> FeedNotice {
        serde_json::from_value(self.payload.clone()).unwrap_or_default()
    }
}

/// Newest-first ring of feed events
#[derive(Debug, Clone)]
pub struct FeedHistory {
    entries: VecDeque<FeedEvent>,
    limit: usize,
}

impl Default for FeedHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl FeedHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Prepend an event, dropping the oldest past the limit
    pub fn push(&mut self, event: FeedEvent) {
        self.entries.push_front(event);
        self.entries.truncate(self.limit);
    }

    pub fn latest(&self) -> Option<&FeedEvent> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedEvent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Subscriber managing any number of independent resource channels.
///
/// Cloning is cheap and every clone shares listeners and history.
#[derive(Clone)]
pub struct LiveFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    transport: Arc<dyn FeedTransport>,
    events_tx: broadcast::Sender<FeedEvent>,
    history: Mutex<HashMap<String, FeedHistory>>,
    active: Mutex<HashMap<u64, String>>,
    next_id: AtomicU64,
    history_limit: usize,
}

/// How a forwarding pass over one channel ended
enum ChannelEnd {
    Cancelled,
    Closed,
    Failed,
}

impl LiveFeed {
    /// Create a feed keeping [`DEFAULT_HISTORY_LIMIT`] events per resource
    pub fn new(transport: Arc<dyn FeedTransport>) -> Self {
        Self::with_history_limit(transport, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(transport: Arc<dyn FeedTransport>, history_limit: usize) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(FeedInner {
                transport,
                events_tx,
                history: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                history_limit,
            }),
        }
    }

    /// Receive every event from every subscription
    pub fn listen(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Events received for a resource, newest first
    pub fn history(&self, resource_id: &str) -> Vec<FeedEvent> {
        self.inner
            .history
            .lock()
            .get(resource_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent payload received for a resource
    pub fn latest(&self, resource_id: &str) -> Option<Value> {
        self.inner
            .history
            .lock()
            .get(resource_id)
            .and_then(|h| h.latest())
            .map(|e| e.payload.clone())
    }

    /// Resources with an open channel (one entry per subscription)
    pub fn active(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.inner.active.lock().values().cloned().collect();
        resources.sort();
        resources
    }

    /// Open a channel for `resource_id` and start forwarding its messages.
    ///
    /// Resolves once the channel is open. On a transport error the channel is
    /// closed and not reopened.
    pub async fn subscribe(&self, resource_id: impl Into<String>) -> Result<FeedHandle> {
        let resource_id = resource_id.into();
        let messages = self.inner.transport.open(&resource_id).await?;

        let (id, cancel) = self.register(&resource_id);
        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task_resource = resource_id.clone();
        let task = tokio::spawn(async move {
            let _active = ActiveGuard {
                inner: Arc::clone(&inner),
                id,
            };
            forward(&inner, &task_resource, messages, &task_cancel).await;
        });

        Ok(FeedHandle::new(id, resource_id, cancel, task))
    }

    /// Keep a channel for `resource_id` open, reopening it with backoff.
    ///
    /// The attempt counter resets whenever the channel opens successfully;
    /// the task gives up once `policy` runs out of attempts, or at once when
    /// the server refuses the channel with a non-retryable error.
    pub fn subscribe_with_reconnect(
        &self,
        resource_id: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> FeedHandle {
        let resource_id = resource_id.into();
        let (id, cancel) = self.register(&resource_id);
        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task_resource = resource_id.clone();

        let task = tokio::spawn(async move {
            let _active = ActiveGuard {
                inner: Arc::clone(&inner),
                id,
            };
            // reconnects since the channel was last open
            let mut attempts = 0u32;

            loop {
                let opened = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    opened = inner.transport.open(&task_resource) => opened,
                };

                match opened {
                    Ok(messages) => {
                        attempts = 0;
                        if let ChannelEnd::Cancelled =
                            forward(&inner, &task_resource, messages, &task_cancel).await
                        {
                            break;
                        }
                    }
                    Err(e) if !e.is_retryable() => {
                        tracing::warn!("Live feed for {} refused, not reopening: {}", task_resource, e);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Live feed for {} failed to open: {}", task_resource, e);
                    }
                }

                if !policy.should_retry(attempts) {
                    tracing::warn!(
                        "Giving up on live feed for {} after {} reconnect attempts",
                        task_resource,
                        attempts
                    );
                    break;
                }
                let delay = policy.delay_for_attempt(attempts);
                attempts += 1;
                tracing::debug!("Reopening live feed for {} in {:?}", task_resource, delay);

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        FeedHandle::new(id, resource_id, cancel, task)
    }

    fn register(&self, resource_id: &str) -> (u64, CancellationToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active.lock().insert(id, resource_id.to_string());
        (id, CancellationToken::new())
    }
}

/// Removes a subscription from the active set however its task ends
struct ActiveGuard {
    inner: Arc<FeedInner>,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.id);
    }
}

/// Pump one open channel until it ends, fails or is cancelled
async fn forward(
    inner: &FeedInner,
    resource_id: &str,
    mut messages: FeedMessageStream,
    cancel: &CancellationToken,
) -> ChannelEnd {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ChannelEnd::Cancelled,
            next = messages.next() => next,
        };

        match next {
            Some(Ok(data)) => {
                let payload = match serde_json::from_str::<Value>(&data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping malformed feed message for {}: {}", resource_id, e);
                        continue;
                    }
                };
                let event = FeedEvent {
                    resource_id: resource_id.to_string(),
                    payload,
                    received_at: chrono::Utc::now().timestamp_millis(),
                };
                inner
                    .history
                    .lock()
                    .entry(resource_id.to_string())
                    .or_insert_with(|| FeedHistory::new(inner.history_limit))
                    .push(event.clone());
                let _ = inner.events_tx.send(event);
            }
            Some(Err(e)) => {
                tracing::warn!("Live feed for {} closed after error: {}", resource_id, e);
                return ChannelEnd::Failed;
            }
            None => {
                tracing::debug!("Live feed for {} ended", resource_id);
                return ChannelEnd::Closed;
            }
        }
    }
}

/// Ownership of one subscription. Dropping it closes the channel.
pub struct FeedHandle {
    id: u64,
    resource_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    fn new(id: u64, resource_id: String, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            id,
            resource_id,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Close the channel. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Closing live feed for {}", self.resource_id);
        }
        self.cancel.cancel();
    }

    /// Whether the channel is still being read
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the forwarding task to stop on its own
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
