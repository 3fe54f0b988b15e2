use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;
use uuid::Uuid;

use crate::flow::FlowConfig;
use crate::theme::Theme;

/// The full stored document for one widget: presentation plus flow. Every
/// write pushes the whole document to subscribers; there is no diffing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WidgetDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatbot_id: Option<String>,
    #[serde(default)]
    pub theme: Theme,
    pub flow: FlowConfig,
}

impl WidgetDocument {
    pub fn new(flow: FlowConfig) -> Self {
        WidgetDocument {
            chatbot_id: None,
            theme: Theme::default(),
            flow,
        }
    }
}

impl Default for WidgetDocument {
    fn default() -> Self {
        WidgetDocument::new(FlowConfig::default())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no document for widget `{0}`")]
    NotFound(String),
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// One delivery on a live subscription: a fresh snapshot or an in-band
/// error. The stream may end after an error.
pub type ConfigPush = Result<WidgetDocument, StoreError>;

/// Where widget documents live and how their changes reach a mounted
/// widget. The real backend is a managed document store; tests and the
/// builder's live preview use [`InMemoryConfigStore`].
#[async_trait]
pub trait ConfigStore: Send + Sync + Debug {
    /// Current document, if the store holds one for `widget_id`.
    async fn get(&self, widget_id: &str) -> Result<WidgetDocument, StoreError>;

    /// Open a lazy, infinite stream of document snapshots for `widget_id`.
    /// When the store already holds a document, it is delivered before the
    /// first `next()` returns anything else.
    async fn subscribe(&self, widget_id: &str) -> Result<ConfigSubscription, StoreError>;
}

/// A live subscription. Dropping it, or the guard inside it, detaches the
/// subscriber from the store.
pub struct ConfigSubscription {
    rx: UnboundedReceiver<ConfigPush>,
    guard: SubscriptionGuard,
}

impl ConfigSubscription {
    pub fn new(rx: UnboundedReceiver<ConfigPush>, guard: SubscriptionGuard) -> Self {
        ConfigSubscription { rx, guard }
    }

    /// Next push, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<ConfigPush> {
        self.rx.recv().await
    }

    /// Split into the raw receiver and the guard, for callers that pump the
    /// receiver on a task but want to keep releasing the guard synchronous.
    pub fn into_parts(self) -> (UnboundedReceiver<ConfigPush>, SubscriptionGuard) {
        (self.rx, self.guard)
    }
}

impl Debug for ConfigSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSubscription").finish_non_exhaustive()
    }
}

/// Owned release handle for one subscriber. Runs its cancel hook exactly
/// once, on `cancel()` or on drop, so teardown can never leak the
/// subscription.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        SubscriptionGuard {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(hook) = self.cancel.take() {
            hook();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.cancel.take() {
            hook();
        }
    }
}

impl Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Subscriber {
    id: Uuid,
    tx: UnboundedSender<ConfigPush>,
}

/// In-memory document store with live fan-out. `publish` is the builder's
/// save path: it replaces the stored document and pushes the new snapshot to
/// every subscriber, which is exactly how the live preview drives a mounted
/// widget.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    docs: Arc<DashMap<String, WidgetDocument>>,
    subscribers: Arc<DashMap<String, Vec<Subscriber>>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryConfigStore::default())
    }

    /// Replace the document for `widget_id` and fan it out.
    pub fn publish(&self, widget_id: &str, document: WidgetDocument) {
        self.docs.insert(widget_id.to_string(), document.clone());
        if let Some(mut subs) = self.subscribers.get_mut(widget_id) {
            subs.retain(|s| s.tx.send(Ok(document.clone())).is_ok());
        }
    }

    /// Push an error to every subscriber of `widget_id` without touching the
    /// stored document.
    pub fn publish_error(&self, widget_id: &str, error: StoreError) {
        if let Some(mut subs) = self.subscribers.get_mut(widget_id) {
            subs.retain(|s| s.tx.send(Err(error.clone())).is_ok());
        }
    }

    /// Live subscriber count, for asserting guard release.
    pub fn subscriber_count(&self, widget_id: &str) -> usize {
        self.subscribers
            .get(widget_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get(&self, widget_id: &str) -> Result<WidgetDocument, StoreError> {
        self.docs
            .get(widget_id)
            .map(|doc| doc.clone())
            .ok_or_else(|| StoreError::NotFound(widget_id.to_string()))
    }

    async fn subscribe(&self, widget_id: &str) -> Result<ConfigSubscription, StoreError> {
        let (tx, rx) = unbounded_channel();

        // initial snapshot, when we have one, lands before any later push
        if let Some(doc) = self.docs.get(widget_id) {
            let _ = tx.send(Ok(doc.clone()));
        }

        let id = Uuid::new_v4();
        self.subscribers
            .entry(widget_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(widget_id, %id, "config subscription opened");

        let subscribers = self.subscribers.clone();
        let key = widget_id.to_string();
        let guard = SubscriptionGuard::new(move || {
            if let Some(mut subs) = subscribers.get_mut(&key) {
                subs.retain(|s| s.id != id);
            }
            debug!(widget_id = %key, %id, "config subscription released");
        });

        Ok(ConfigSubscription::new(rx, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_snapshot_delivered_at_subscribe() {
        let store = InMemoryConfigStore::new();
        store.publish("w1", WidgetDocument::default());

        let mut sub = store.subscribe("w1").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first, WidgetDocument::default());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let store = InMemoryConfigStore::new();
        let mut sub = store.subscribe("w1").await.unwrap();

        let mut doc = WidgetDocument::default();
        doc.flow.welcome_message = "Updated!".into();
        store.publish("w1", doc.clone());

        let push = sub.next().await.unwrap().unwrap();
        assert_eq!(push.flow.welcome_message, "Updated!");
    }

    #[tokio::test]
    async fn test_guard_release_detaches_subscriber() {
        let store = InMemoryConfigStore::new();
        let sub = store.subscribe("w1").await.unwrap();
        assert_eq!(store.subscriber_count("w1"), 1);

        drop(sub);
        assert_eq!(store.subscriber_count("w1"), 0);

        // publishing after release reaches nobody and does not panic
        store.publish("w1", WidgetDocument::default());
    }

    #[tokio::test]
    async fn test_error_delivered_in_band() {
        let store = InMemoryConfigStore::new();
        let mut sub = store.subscribe("w1").await.unwrap();
        store.publish_error("w1", StoreError::SubscriptionFailed("permission denied".into()));

        let push = sub.next().await.unwrap();
        assert!(matches!(push, Err(StoreError::SubscriptionFailed(_))));
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let store = InMemoryConfigStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".into()));
    }

    #[test]
    fn test_document_wire_shape() {
        let doc = WidgetDocument {
            chatbot_id: Some("bot-1".into()),
            theme: Theme::default(),
            flow: FlowConfig::default(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["chatbot_id"], "bot-1");
        assert!(json["theme"]["primaryColor"].is_string());
        assert!(json["flow"]["welcomeMessage"].is_string());
    }
}
