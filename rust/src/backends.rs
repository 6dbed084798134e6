//! Capability interfaces for everything the sync core talks to.
//!
//! Every remote store is reduced to a narrow trait. Long-lived reads are modelled as
//! `subscribe(key, handler) -> Subscription`; the handler may run on any thread, so
//! implementations must not assume they are called from the app actor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::messages::OfflineQueueEntry;
use crate::notifications::NotificationQueueEntry;
use crate::presence::{PresenceMirror, PresenceRecord};
use crate::state::{ChatMessage, ChatNotification, NetworkSignal};

pub type Handler<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

/// Detaches a subscription when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Payload of a remote append. `temp_id` is offered to logs that can echo it back on the
/// stored row, which lets reconciliation match on it instead of on content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub temp_id: String,
    pub text: String,
    pub sender_id: String,
    pub timestamp: i64,
}

impl OutgoingMessage {
    pub fn from_placeholder(message: &ChatMessage) -> Option<Self> {
        Some(Self {
            temp_id: message.temp_id.clone()?,
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            timestamp: message.timestamp,
        })
    }
}

#[async_trait]
pub trait RemoteMessageLog: Send + Sync + 'static {
    /// Appends a message and returns the id the log assigned to it.
    async fn append(&self, chat_id: &str, message: &OutgoingMessage) -> Result<String, SyncError>;

    fn subscribe(
        &self,
        chat_id: &str,
        on_snapshot: Handler<Vec<ChatMessage>>,
        on_error: Handler<SyncError>,
    ) -> Subscription;
}

/// Best-effort local persistence. Callers log failures and carry on.
pub trait LocalCache: Send + Sync + 'static {
    fn cached_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, SyncError>;
    fn cache_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), SyncError>;
    fn offline_queue(&self) -> Result<Vec<OfflineQueueEntry>, SyncError>;
    fn push_offline_queue(&self, entry: &OfflineQueueEntry) -> Result<(), SyncError>;
    fn remove_from_offline_queue(&self, index: usize) -> Result<(), SyncError>;
}

#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Registers a server-side write of `record` that fires when this client's realtime
    /// session drops.
    async fn register_disconnect_hook(
        &self,
        user_id: &str,
        record: PresenceRecord,
    ) -> Result<(), SyncError>;
    async fn set(&self, user_id: &str, record: PresenceRecord) -> Result<(), SyncError>;
    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, SyncError>;
    fn subscribe(&self, user_id: &str, handler: Handler<Option<PresenceRecord>>) -> Subscription;
    /// Connectivity of the realtime channel itself, not general internet reachability.
    fn subscribe_channel(&self, handler: Handler<bool>) -> Subscription;
}

/// Secondary per-user metadata store that mirrors presence for cheap reads.
#[async_trait]
pub trait UserMetadataStore: Send + Sync + 'static {
    async fn update_presence(&self, user_id: &str, mirror: PresenceMirror)
        -> Result<(), SyncError>;
    fn subscribe_presence(
        &self,
        user_id: &str,
        handler: Handler<Option<PresenceMirror>>,
    ) -> Subscription;
}

#[async_trait]
pub trait TypingStore: Send + Sync + 'static {
    async fn set(&self, chat_id: &str, user_id: &str, timestamp: i64) -> Result<(), SyncError>;
    async fn remove(&self, chat_id: &str, user_id: &str) -> Result<(), SyncError>;
    async fn get_all(&self, chat_id: &str) -> Result<HashMap<String, i64>, SyncError>;
    fn subscribe(&self, chat_id: &str, handler: Handler<HashMap<String, i64>>) -> Subscription;
}

#[async_trait]
pub trait NotificationRelay: Send + Sync + 'static {
    async fn write(
        &self,
        recipient_id: &str,
        entry: NotificationQueueEntry,
    ) -> Result<String, SyncError>;
    async fn delete(&self, recipient_id: &str, entry_id: &str) -> Result<(), SyncError>;
    fn subscribe(
        &self,
        recipient_id: &str,
        handler: Handler<Vec<(String, NotificationQueueEntry)>>,
    ) -> Subscription;
}

#[async_trait]
pub trait ConnectivitySource: Send + Sync + 'static {
    async fn fetch(&self) -> NetworkSignal;
    fn subscribe(&self, handler: Handler<NetworkSignal>) -> Subscription;
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Returns true only if the internet is reachable right now.
    async fn probe(&self) -> bool;
}

/// Platform notification centre, implemented natively. One slot per chat.
#[uniffi::export(callback_interface)]
pub trait PlatformNotifier: Send + Sync + 'static {
    fn dismiss(&self, chat_id: String);
    fn schedule(&self, notification: ChatNotification);
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct Backends {
    pub message_log: Arc<dyn RemoteMessageLog>,
    pub presence: Arc<dyn PresenceStore>,
    pub user_metadata: Arc<dyn UserMetadataStore>,
    pub typing: Arc<dyn TypingStore>,
    pub relay: Arc<dyn NotificationRelay>,
    pub network: Arc<dyn ConnectivitySource>,
    /// `None` uses the HTTP probe configured in `courier_config.json`.
    pub probe: Option<Arc<dyn ReachabilityProbe>>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::Subscription;

    #[test]
    fn subscription_cancels_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_unsubscribe_does_not_cancel_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
