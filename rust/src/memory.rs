//! In-process implementations of every remote capability.
//!
//! Subscribers receive the current value as soon as they subscribe and again after every write,
//! on the writer's thread. Each store also exposes a few knobs (`set_failing`, `drop_channel`, ...)
//! so flows like "offline send" or "client vanished" can be driven without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backends::{
    Backends, ConnectivitySource, Handler, NotificationRelay, OutgoingMessage, PresenceStore,
    ReachabilityProbe, RemoteMessageLog, Subscription, TypingStore, UserMetadataStore,
};
use crate::error::SyncError;
use crate::notifications::NotificationQueueEntry;
use crate::presence::{PresenceMirror, PresenceRecord};
use crate::state::{ChatMessage, NetworkSignal};

type Listener<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

struct TopicInner<T> {
    next_id: u64,
    listeners: HashMap<String, Vec<(u64, Listener<T>)>>,
}

/// Keyed fan-out of values to subscribed handlers.
struct Topic<T> {
    inner: Arc<Mutex<TopicInner<T>>>,
}

impl<T: Clone + 'static> Topic<T> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TopicInner {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    fn subscribe(&self, key: &str, handler: Handler<T>, initial: T) -> Subscription {
        let listener: Listener<T> = Arc::from(handler);
        let id = {
            let mut inner = self.inner.lock().expect("topic lock poisoned");
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .listeners
                .entry(key.to_string())
                .or_default()
                .push((id, listener.clone()));
            id
        };
        listener(initial);

        let inner = self.inner.clone();
        let key = key.to_string();
        Subscription::new(move || {
            if let Ok(mut inner) = inner.lock() {
                if let Some(list) = inner.listeners.get_mut(&key) {
                    list.retain(|(lid, _)| *lid != id);
                }
            }
        })
    }

    fn publish(&self, key: &str, value: T) {
        let listeners: Vec<Listener<T>> = {
            let inner = self.inner.lock().expect("topic lock poisoned");
            inner
                .listeners
                .get(key)
                .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(value.clone());
        }
    }

    fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .expect("topic lock poisoned")
            .listeners
            .get(key)
            .map_or(0, Vec::len)
    }
}

pub struct MemoryMessageLog {
    rows: Mutex<HashMap<String, Vec<ChatMessage>>>,
    next_id: AtomicU64,
    appends: AtomicUsize,
    failing: AtomicBool,
    echo_temp_id: AtomicBool,
    snapshots: Topic<Vec<ChatMessage>>,
    errors: Topic<SyncError>,
}

impl Default for MemoryMessageLog {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            appends: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            echo_temp_id: AtomicBool::new(true),
            snapshots: Topic::new(),
            errors: Topic::new(),
        }
    }
}

impl MemoryMessageLog {
    /// While set, every append fails with a transient network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether stored rows keep the sender's `temp_id`. Off forces content matching.
    pub fn set_echo_temp_id(&self, echo: bool) {
        self.echo_temp_id.store(echo, Ordering::SeqCst);
    }

    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn rows(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.rows
            .lock()
            .expect("message log lock poisoned")
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Stores a row written by another client.
    pub fn inject(&self, chat_id: &str, message: ChatMessage) {
        let snapshot = {
            let mut rows = self.rows.lock().expect("message log lock poisoned");
            let list = rows.entry(chat_id.to_string()).or_default();
            list.push(message);
            list.clone()
        };
        self.snapshots.publish(chat_id, snapshot);
    }

    pub fn fail_stream(&self, chat_id: &str, error: SyncError) {
        self.errors.publish(chat_id, error);
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        self.snapshots.subscriber_count(chat_id)
    }
}

#[async_trait]
impl RemoteMessageLog for MemoryMessageLog {
    async fn append(&self, chat_id: &str, message: &OutgoingMessage) -> Result<String, SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("message log unreachable".into()));
        }
        self.appends.fetch_add(1, Ordering::SeqCst);
        let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut row = ChatMessage::remote(&id, &message.text, &message.sender_id, message.timestamp);
        if self.echo_temp_id.load(Ordering::SeqCst) {
            row.temp_id = Some(message.temp_id.clone());
        }
        self.inject(chat_id, row);
        Ok(id)
    }

    fn subscribe(
        &self,
        chat_id: &str,
        on_snapshot: Handler<Vec<ChatMessage>>,
        on_error: Handler<SyncError>,
    ) -> Subscription {
        let initial = self.rows(chat_id);
        let snapshots = self.snapshots.subscribe(chat_id, on_snapshot, initial);
        let errors = self.errors.subscribe_silent(chat_id, on_error);
        Subscription::new(move || {
            snapshots.unsubscribe();
            errors.unsubscribe();
        })
    }
}

impl<T: Clone + 'static> Topic<T> {
    /// Like `subscribe`, without replaying a current value.
    fn subscribe_silent(&self, key: &str, handler: Handler<T>) -> Subscription {
        let listener: Listener<T> = Arc::from(handler);
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .listeners
            .entry(key.to_string())
            .or_default()
            .push((id, listener));
        drop(inner);

        let inner = self.inner.clone();
        let key = key.to_string();
        Subscription::new(move || {
            if let Ok(mut inner) = inner.lock() {
                if let Some(list) = inner.listeners.get_mut(&key) {
                    list.retain(|(lid, _)| *lid != id);
                }
            }
        })
    }
}

const CHANNEL_KEY: &str = "channel";

pub struct MemoryPresenceStore {
    records: Mutex<HashMap<String, PresenceRecord>>,
    hooks: Mutex<HashMap<String, PresenceRecord>>,
    channel_connected: AtomicBool,
    hook_failing: AtomicBool,
    record_topic: Topic<Option<PresenceRecord>>,
    channel_topic: Topic<bool>,
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
            channel_connected: AtomicBool::new(true),
            hook_failing: AtomicBool::new(false),
            record_topic: Topic::new(),
            channel_topic: Topic::new(),
        }
    }
}

impl MemoryPresenceStore {
    pub fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records
            .lock()
            .expect("presence lock poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn has_hook(&self, user_id: &str) -> bool {
        self.hooks
            .lock()
            .expect("presence lock poisoned")
            .contains_key(user_id)
    }

    pub fn set_hook_failing(&self, failing: bool) {
        self.hook_failing.store(failing, Ordering::SeqCst);
    }

    /// Simulates the realtime session dropping: every registered hook fires server-side.
    pub fn drop_channel(&self) {
        self.channel_connected.store(false, Ordering::SeqCst);
        let fired: Vec<(String, PresenceRecord)> = self
            .hooks
            .lock()
            .expect("presence lock poisoned")
            .drain()
            .collect();
        for (user_id, record) in fired {
            self.write(&user_id, record);
        }
        self.channel_topic.publish(CHANNEL_KEY, false);
    }

    pub fn restore_channel(&self) {
        self.channel_connected.store(true, Ordering::SeqCst);
        self.channel_topic.publish(CHANNEL_KEY, true);
    }

    fn write(&self, user_id: &str, record: PresenceRecord) {
        self.records
            .lock()
            .expect("presence lock poisoned")
            .insert(user_id.to_string(), record.clone());
        self.record_topic.publish(user_id, Some(record));
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn register_disconnect_hook(
        &self,
        user_id: &str,
        record: PresenceRecord,
    ) -> Result<(), SyncError> {
        if self.hook_failing.load(Ordering::SeqCst) {
            return Err(SyncError::PresenceHook("onDisconnect rejected".into()));
        }
        self.hooks
            .lock()
            .expect("presence lock poisoned")
            .insert(user_id.to_string(), record);
        Ok(())
    }

    async fn set(&self, user_id: &str, record: PresenceRecord) -> Result<(), SyncError> {
        self.write(user_id, record);
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, SyncError> {
        Ok(self.record(user_id))
    }

    fn subscribe(&self, user_id: &str, handler: Handler<Option<PresenceRecord>>) -> Subscription {
        self.record_topic
            .subscribe(user_id, handler, self.record(user_id))
    }

    fn subscribe_channel(&self, handler: Handler<bool>) -> Subscription {
        let connected = self.channel_connected.load(Ordering::SeqCst);
        self.channel_topic.subscribe(CHANNEL_KEY, handler, connected)
    }
}

pub struct MemoryUserMetadata {
    mirrors: Mutex<HashMap<String, PresenceMirror>>,
    writes: Mutex<HashMap<String, usize>>,
    topic: Topic<Option<PresenceMirror>>,
}

impl Default for MemoryUserMetadata {
    fn default() -> Self {
        Self {
            mirrors: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            topic: Topic::new(),
        }
    }
}

impl MemoryUserMetadata {
    pub fn mirror(&self, user_id: &str) -> Option<PresenceMirror> {
        self.mirrors
            .lock()
            .expect("metadata lock poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn write_count(&self, user_id: &str) -> usize {
        self.writes
            .lock()
            .expect("metadata lock poisoned")
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Writes a mirror on behalf of another client.
    pub fn put(&self, user_id: &str, mirror: PresenceMirror) {
        self.mirrors
            .lock()
            .expect("metadata lock poisoned")
            .insert(user_id.to_string(), mirror.clone());
        *self
            .writes
            .lock()
            .expect("metadata lock poisoned")
            .entry(user_id.to_string())
            .or_default() += 1;
        self.topic.publish(user_id, Some(mirror));
    }
}

#[async_trait]
impl UserMetadataStore for MemoryUserMetadata {
    async fn update_presence(
        &self,
        user_id: &str,
        mirror: PresenceMirror,
    ) -> Result<(), SyncError> {
        self.put(user_id, mirror);
        Ok(())
    }

    fn subscribe_presence(
        &self,
        user_id: &str,
        handler: Handler<Option<PresenceMirror>>,
    ) -> Subscription {
        self.topic.subscribe(user_id, handler, self.mirror(user_id))
    }
}

pub struct MemoryTypingStore {
    chats: Mutex<HashMap<String, HashMap<String, i64>>>,
    topic: Topic<HashMap<String, i64>>,
}

impl Default for MemoryTypingStore {
    fn default() -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
            topic: Topic::new(),
        }
    }
}

impl MemoryTypingStore {
    pub fn snapshot(&self, chat_id: &str) -> HashMap<String, i64> {
        self.chats
            .lock()
            .expect("typing lock poisoned")
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes a record without notifying subscribers, like a write whose event was lost.
    pub fn put_silently(&self, chat_id: &str, user_id: &str, timestamp: i64) {
        self.chats
            .lock()
            .expect("typing lock poisoned")
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string(), timestamp);
    }

    pub fn put(&self, chat_id: &str, user_id: &str, timestamp: i64) {
        self.put_silently(chat_id, user_id, timestamp);
        self.topic.publish(chat_id, self.snapshot(chat_id));
    }
}

#[async_trait]
impl TypingStore for MemoryTypingStore {
    async fn set(&self, chat_id: &str, user_id: &str, timestamp: i64) -> Result<(), SyncError> {
        self.put(chat_id, user_id, timestamp);
        Ok(())
    }

    async fn remove(&self, chat_id: &str, user_id: &str) -> Result<(), SyncError> {
        let removed = self
            .chats
            .lock()
            .expect("typing lock poisoned")
            .get_mut(chat_id)
            .and_then(|c| c.remove(user_id))
            .is_some();
        if removed {
            self.topic.publish(chat_id, self.snapshot(chat_id));
        }
        Ok(())
    }

    async fn get_all(&self, chat_id: &str) -> Result<HashMap<String, i64>, SyncError> {
        Ok(self.snapshot(chat_id))
    }

    fn subscribe(&self, chat_id: &str, handler: Handler<HashMap<String, i64>>) -> Subscription {
        self.topic.subscribe(chat_id, handler, self.snapshot(chat_id))
    }
}

pub struct MemoryNotificationRelay {
    inboxes: Mutex<HashMap<String, Vec<(String, NotificationQueueEntry)>>>,
    next_id: AtomicU64,
    topic: Topic<Vec<(String, NotificationQueueEntry)>>,
}

impl Default for MemoryNotificationRelay {
    fn default() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            topic: Topic::new(),
        }
    }
}

impl MemoryNotificationRelay {
    pub fn inbox(&self, recipient_id: &str) -> Vec<(String, NotificationQueueEntry)> {
        self.inboxes
            .lock()
            .expect("relay lock poisoned")
            .get(recipient_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push(&self, recipient_id: &str, entry: NotificationQueueEntry) -> String {
        let id = format!("n{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.inboxes
            .lock()
            .expect("relay lock poisoned")
            .entry(recipient_id.to_string())
            .or_default()
            .push((id.clone(), entry));
        self.topic.publish(recipient_id, self.inbox(recipient_id));
        id
    }
}

#[async_trait]
impl NotificationRelay for MemoryNotificationRelay {
    async fn write(
        &self,
        recipient_id: &str,
        entry: NotificationQueueEntry,
    ) -> Result<String, SyncError> {
        Ok(self.push(recipient_id, entry))
    }

    async fn delete(&self, recipient_id: &str, entry_id: &str) -> Result<(), SyncError> {
        let removed = match self
            .inboxes
            .lock()
            .expect("relay lock poisoned")
            .get_mut(recipient_id)
        {
            Some(inbox) => {
                let before = inbox.len();
                inbox.retain(|(id, _)| id != entry_id);
                inbox.len() != before
            }
            None => false,
        };
        if removed {
            self.topic.publish(recipient_id, self.inbox(recipient_id));
        }
        Ok(())
    }

    fn subscribe(
        &self,
        recipient_id: &str,
        handler: Handler<Vec<(String, NotificationQueueEntry)>>,
    ) -> Subscription {
        self.topic
            .subscribe(recipient_id, handler, self.inbox(recipient_id))
    }
}

const NETWORK_KEY: &str = "network";

pub struct MemoryConnectivity {
    current: Mutex<NetworkSignal>,
    topic: Topic<NetworkSignal>,
}

impl MemoryConnectivity {
    pub fn new(initial: NetworkSignal) -> Self {
        Self {
            current: Mutex::new(initial),
            topic: Topic::new(),
        }
    }

    pub fn online() -> Self {
        Self::new(NetworkSignal {
            is_connected: true,
            is_internet_reachable: Some(true),
        })
    }

    pub fn set(&self, signal: NetworkSignal) {
        *self.current.lock().expect("network lock poisoned") = signal;
        self.topic.publish(NETWORK_KEY, signal);
    }

    pub fn set_online(&self, online: bool) {
        self.set(NetworkSignal {
            is_connected: online,
            is_internet_reachable: Some(online),
        });
    }

    fn current(&self) -> NetworkSignal {
        *self.current.lock().expect("network lock poisoned")
    }
}

#[async_trait]
impl ConnectivitySource for MemoryConnectivity {
    async fn fetch(&self) -> NetworkSignal {
        self.current()
    }

    fn subscribe(&self, handler: Handler<NetworkSignal>) -> Subscription {
        self.topic.subscribe(NETWORK_KEY, handler, self.current())
    }
}

/// Probe with a settable answer.
#[derive(Default)]
pub struct FixedProbe {
    reachable: AtomicBool,
    probes: AtomicUsize,
}

impl FixedProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for FixedProbe {
    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

/// A full set of in-memory backends, keeping typed handles for test knobs.
#[derive(Clone)]
pub struct MemoryBackends {
    pub message_log: Arc<MemoryMessageLog>,
    pub presence: Arc<MemoryPresenceStore>,
    pub user_metadata: Arc<MemoryUserMetadata>,
    pub typing: Arc<MemoryTypingStore>,
    pub relay: Arc<MemoryNotificationRelay>,
    pub network: Arc<MemoryConnectivity>,
    pub probe: Arc<FixedProbe>,
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackends {
    pub fn new() -> Self {
        Self {
            message_log: Arc::new(MemoryMessageLog::default()),
            presence: Arc::new(MemoryPresenceStore::default()),
            user_metadata: Arc::new(MemoryUserMetadata::default()),
            typing: Arc::new(MemoryTypingStore::default()),
            relay: Arc::new(MemoryNotificationRelay::default()),
            network: Arc::new(MemoryConnectivity::online()),
            probe: Arc::new(FixedProbe::new(true)),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            message_log: self.message_log.clone(),
            presence: self.presence.clone(),
            user_metadata: self.user_metadata.clone(),
            typing: self.typing.clone(),
            relay: self.relay.clone(),
            network: self.network.clone(),
            probe: Some(self.probe.clone()),
        }
    }
}
