//! Per-chat message lists: optimistic sends, reconciliation against the remote stream, and the
//! offline replay queue.
//!
//! The engine is synchronous. The app actor performs the remote appends and reports their
//! outcome back through the `complete_*` methods, so every mutation here is a discrete step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::backends::{LocalCache, OutgoingMessage};
use crate::error::SyncError;
use crate::state::ChatMessage;

pub const DEFAULT_CONTENT_MATCH_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OfflineQueueEntry {
    pub chat_id: String,
    pub chat_name: String,
    pub recipient_ids: Vec<String>,
    pub message: ChatMessage,
}

impl OfflineQueueEntry {
    pub fn temp_id(&self) -> Option<&str> {
        self.message.temp_id.as_deref()
    }
}

/// Where a locally originated message fans out to once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRoute {
    pub chat_name: String,
    pub recipient_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub id: Option<String>,
    pub text: Option<String>,
    pub read_by: Option<Vec<String>>,
    pub pending: Option<bool>,
    pub failed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Placeholder removed; the stream supplies the canonical row.
    Confirmed,
    /// Stored remotely while offline; placeholder stays until the stream confirms it.
    AwaitingStream,
    /// Marked failed and queued for replay.
    Failed,
    /// The placeholder was already reconciled away or deleted.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStep {
    /// Head resolved; the next entry may be replayed.
    Continue,
    /// Head failed and stays at the front; automatic replay stops for this pass.
    Halted,
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub messages: Vec<ChatMessage>,
    /// Temp ids of placeholders the remote snapshot confirmed.
    pub covered: Vec<String>,
}

/// Whether remote row `r` confirms placeholder `p`. Rules are tried strictest first; the
/// content match is a fallback for logs that do not echo `temp_id` and can conflate two
/// identical messages sent by the same user within the window.
fn covers(r: &ChatMessage, p: &ChatMessage, window_ms: i64) -> bool {
    if r.id.is_some() && r.id == p.id {
        return true;
    }
    if r.id.is_some() && r.id == p.temp_id {
        return true;
    }
    if r.temp_id.is_some() && r.temp_id == p.temp_id {
        return true;
    }
    r.sender_id == p.sender_id
        && r.text == p.text
        && (r.timestamp - p.timestamp).abs() < window_ms
}

/// Merges a remote snapshot with the surviving local placeholders.
///
/// Idempotent, and independent of whether a send completion was applied before or after the
/// snapshot that confirms it.
pub fn reconcile_lists(
    local: &[ChatMessage],
    remote: Vec<ChatMessage>,
    window_ms: i64,
) -> Reconciled {
    let mut seen = HashSet::new();
    let remote: Vec<ChatMessage> = remote
        .into_iter()
        .filter(|m| match &m.id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .collect();

    let mut covered = Vec::new();
    let mut survivors = Vec::new();
    for p in local.iter().filter(|m| m.is_placeholder()) {
        if remote.iter().any(|r| covers(r, p, window_ms)) {
            covered.extend(p.temp_id.clone());
        } else {
            survivors.push(p.clone());
        }
    }

    let mut messages = remote;
    messages.extend(survivors);
    messages.sort_by_key(|m| m.timestamp);
    Reconciled { messages, covered }
}

#[derive(Debug, Default)]
struct ChatLog {
    messages: Vec<ChatMessage>,
    stream_error: Option<String>,
}

pub struct MessageSyncEngine {
    cache: Arc<dyn LocalCache>,
    chats: HashMap<String, ChatLog>,
    routes: HashMap<String, SendRoute>, // temp_id -> fan-out route
    queue: VecDeque<OfflineQueueEntry>,
    // Queued temp ids whose cache write failed; they have no row to remove.
    unpersisted: HashSet<String>,
    flushing: Option<String>, // temp_id of the head currently being replayed
    // Temp ids with an append outstanding, whatever started it.
    in_flight: HashSet<String>,
    content_match_window_ms: i64,
}

impl MessageSyncEngine {
    pub fn new(cache: Arc<dyn LocalCache>, content_match_window_ms: i64) -> Self {
        Self {
            cache,
            chats: HashMap::new(),
            routes: HashMap::new(),
            queue: VecDeque::new(),
            unpersisted: HashSet::new(),
            flushing: None,
            in_flight: HashSet::new(),
            content_match_window_ms,
        }
    }

    /// Restores the persisted offline queue. Called once when the session starts.
    pub fn load_offline_queue(&mut self) {
        match self.cache.offline_queue() {
            Ok(entries) => {
                tracing::info!(count = entries.len(), "offline queue restored");
                self.queue = entries.into();
            }
            Err(e) => tracing::warn!(%e, "failed to read offline queue"),
        }
    }

    pub fn messages(&mut self, chat_id: &str) -> &[ChatMessage] {
        &self.chat_mut(chat_id).messages
    }

    pub fn stream_error(&self, chat_id: &str) -> Option<&str> {
        self.chats
            .get(chat_id)
            .and_then(|c| c.stream_error.as_deref())
    }

    /// Records a stream failure for the UI. The existing list is kept as is.
    pub fn set_stream_error(&mut self, chat_id: &str, error: &SyncError) {
        self.chat_mut(chat_id).stream_error = Some(error.to_string());
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_temp_ids(&self) -> Vec<String> {
        self.queue
            .iter()
            .filter_map(|e| e.temp_id().map(str::to_string))
            .collect()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.is_some()
    }

    pub fn is_in_flight(&self, temp_id: &str) -> bool {
        self.in_flight.contains(temp_id)
    }

    /// Fan-out route of a local message; queued entries carry theirs across restarts.
    pub fn route(&self, temp_id: &str) -> Option<SendRoute> {
        if let Some(route) = self.routes.get(temp_id) {
            return Some(route.clone());
        }
        self.queue
            .iter()
            .find(|e| e.temp_id() == Some(temp_id))
            .map(|e| SendRoute {
                chat_name: e.chat_name.clone(),
                recipient_ids: e.recipient_ids.clone(),
            })
    }

    /// Inserts a pending placeholder and returns the append to perform.
    pub fn send_optimistic(
        &mut self,
        chat_id: &str,
        text: &str,
        sender_id: &str,
        now: i64,
        route: SendRoute,
    ) -> OutgoingMessage {
        let temp_id = format!("temp-{}", uuid::Uuid::new_v4());
        let placeholder = ChatMessage {
            id: None,
            temp_id: Some(temp_id.clone()),
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: now,
            read_by: vec![],
            pending: true,
            failed: false,
        };
        self.routes.insert(temp_id.clone(), route);
        self.in_flight.insert(temp_id.clone());
        self.insert_sorted(chat_id, placeholder);
        self.persist(chat_id);

        OutgoingMessage {
            temp_id,
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: now,
        }
    }

    pub fn complete_send(
        &mut self,
        chat_id: &str,
        temp_id: &str,
        result: Result<String, SyncError>,
        connected: bool,
    ) -> SendOutcome {
        self.in_flight.remove(temp_id);
        let Some(idx) = self.placeholder_index(chat_id, temp_id) else {
            tracing::debug!(%chat_id, %temp_id, "send completed after placeholder was resolved");
            self.routes.remove(temp_id);
            return SendOutcome::Stale;
        };

        let outcome = match result {
            Ok(remote_id) if connected => {
                self.chat_mut(chat_id).messages.remove(idx);
                self.routes.remove(temp_id);
                tracing::debug!(%chat_id, %temp_id, %remote_id, "send confirmed");
                SendOutcome::Confirmed
            }
            Ok(remote_id) => {
                // The log accepted the write while we look offline; keep the bubble and let the
                // stream confirm it by id.
                self.chat_mut(chat_id).messages[idx].id = Some(remote_id);
                SendOutcome::AwaitingStream
            }
            Err(e) => {
                tracing::warn!(%chat_id, %temp_id, %e, "send failed");
                self.chat_mut(chat_id).messages[idx].mark_failed();
                self.enqueue(chat_id, temp_id);
                SendOutcome::Failed
            }
        };
        self.persist(chat_id);
        outcome
    }

    /// Flips a failed message back to pending and returns the append to repeat.
    pub fn begin_retry(
        &mut self,
        chat_id: &str,
        temp_id: &str,
    ) -> Result<OutgoingMessage, SyncError> {
        let idx = self
            .placeholder_index(chat_id, temp_id)
            .ok_or_else(|| SyncError::MessageNotFound(temp_id.to_string()))?;
        let message = &mut self.chat_mut(chat_id).messages[idx];
        if !message.failed {
            return Err(SyncError::NotRetryable(temp_id.to_string()));
        }
        message.mark_pending();
        let outgoing = OutgoingMessage::from_placeholder(message)
            .ok_or_else(|| SyncError::MessageNotFound(temp_id.to_string()))?;
        self.in_flight.insert(temp_id.to_string());
        self.persist(chat_id);
        Ok(outgoing)
    }

    /// Applies a retry outcome. A failure is handed back so the caller can surface it, unless the
    /// stream already confirmed the message while the retry was outstanding.
    pub fn complete_retry(
        &mut self,
        chat_id: &str,
        temp_id: &str,
        result: Result<String, SyncError>,
    ) -> Result<(), SyncError> {
        self.in_flight.remove(temp_id);
        match result {
            Ok(_) => {
                if let Some(idx) = self.placeholder_index(chat_id, temp_id) {
                    self.chat_mut(chat_id).messages.remove(idx);
                }
                self.routes.remove(temp_id);
                self.dequeue(temp_id);
                self.persist(chat_id);
                Ok(())
            }
            Err(e) => match self.placeholder_index(chat_id, temp_id) {
                Some(idx) => {
                    self.chat_mut(chat_id).messages[idx].mark_failed();
                    self.enqueue(chat_id, temp_id);
                    self.persist(chat_id);
                    Err(e)
                }
                None => {
                    tracing::debug!(%chat_id, %temp_id, %e, "retry failed after stream confirmed it");
                    self.routes.remove(temp_id);
                    self.dequeue(temp_id);
                    Ok(())
                }
            },
        }
    }

    /// Drops a failed message and its queue entry.
    pub fn delete_failed(&mut self, chat_id: &str, temp_id: &str) -> Result<(), SyncError> {
        let idx = self
            .placeholder_index(chat_id, temp_id)
            .ok_or_else(|| SyncError::MessageNotFound(temp_id.to_string()))?;
        if !self.chat_mut(chat_id).messages[idx].failed {
            return Err(SyncError::NotRetryable(temp_id.to_string()));
        }
        self.chat_mut(chat_id).messages.remove(idx);
        self.routes.remove(temp_id);
        self.dequeue(temp_id);
        self.persist(chat_id);
        Ok(())
    }

    /// Applies a remote snapshot and returns the resulting visible list.
    pub fn reconcile(&mut self, chat_id: &str, remote: Vec<ChatMessage>) -> &[ChatMessage] {
        let window = self.content_match_window_ms;
        let log = self.chat_mut(chat_id);
        let Reconciled { messages, covered } = reconcile_lists(&log.messages, remote, window);
        log.messages = messages;
        log.stream_error = None;

        for temp_id in &covered {
            self.routes.remove(temp_id);
            // Already in the remote log; replaying it would duplicate it. An outstanding append
            // settles its own entry on completion.
            if !self.in_flight.contains(temp_id) {
                self.dequeue(temp_id);
            }
        }
        if !covered.is_empty() {
            tracing::debug!(%chat_id, covered = covered.len(), "placeholders confirmed by stream");
        }
        self.persist(chat_id);
        &self.chat_mut(chat_id).messages
    }

    /// Merges into the entry sharing `id` or `temp_id`, or inserts in timestamp order.
    pub fn add_message(&mut self, chat_id: &str, incoming: ChatMessage) {
        let log = self.chat_mut(chat_id);
        let existing = log.messages.iter_mut().find(|m| {
            (incoming.id.is_some() && m.id == incoming.id)
                || (incoming.temp_id.is_some() && m.temp_id == incoming.temp_id)
        });
        match existing {
            Some(m) => {
                if incoming.id.is_some() {
                    m.id = incoming.id;
                }
                if incoming.temp_id.is_some() {
                    m.temp_id = incoming.temp_id;
                }
                m.text = incoming.text;
                m.sender_id = incoming.sender_id;
                m.timestamp = incoming.timestamp;
                for reader in incoming.read_by {
                    if !m.read_by.contains(&reader) {
                        m.read_by.push(reader);
                    }
                }
                m.pending = incoming.pending;
                m.failed = incoming.failed;
            }
            None => log.messages.push(incoming),
        }
        log.messages.sort_by_key(|m| m.timestamp);
        self.persist(chat_id);
    }

    /// Applies a partial update to the entry matched by `id` or `temp_id`.
    pub fn update_message(&mut self, chat_id: &str, key: &str, patch: MessagePatch) -> bool {
        let log = self.chat_mut(chat_id);
        let Some(m) = log.messages.iter_mut().find(|m| m.matches_key(key)) else {
            return false;
        };
        if let Some(id) = patch.id {
            m.id = Some(id);
        }
        if let Some(text) = patch.text {
            m.text = text;
        }
        if let Some(read_by) = patch.read_by {
            m.read_by = read_by;
        }
        if let Some(pending) = patch.pending {
            m.pending = pending;
        }
        if let Some(failed) = patch.failed {
            m.failed = failed;
        }
        self.persist(chat_id);
        true
    }

    /// Takes the queue head for replay, unless a replay is already running or the head itself
    /// has an append outstanding (a manual retry). The retry's completion resumes the pass.
    pub fn begin_flush(&mut self) -> Option<(OfflineQueueEntry, OutgoingMessage)> {
        if self.flushing.is_some() {
            return None;
        }
        let entry = self.queue.front()?.clone();
        let outgoing = OutgoingMessage::from_placeholder(&entry.message)?;
        if self.in_flight.contains(&outgoing.temp_id) {
            tracing::debug!(temp_id = %outgoing.temp_id, "queue head already in flight");
            return None;
        }
        self.in_flight.insert(outgoing.temp_id.clone());
        if let Some(idx) = self.placeholder_index(&entry.chat_id, &outgoing.temp_id) {
            self.chat_mut(&entry.chat_id).messages[idx].mark_pending();
            self.persist(&entry.chat_id);
        }
        self.flushing = Some(outgoing.temp_id.clone());
        Some((entry, outgoing))
    }

    pub fn complete_flush(
        &mut self,
        chat_id: &str,
        temp_id: &str,
        result: Result<String, SyncError>,
    ) -> FlushStep {
        if self.flushing.as_deref() == Some(temp_id) {
            self.flushing = None;
        }
        self.in_flight.remove(temp_id);
        let still_queued = self.queue.iter().any(|e| e.temp_id() == Some(temp_id));
        match result {
            Ok(remote_id) => {
                tracing::info!(%chat_id, %temp_id, %remote_id, "queued message replayed");
                self.dequeue(temp_id);
                if let Some(idx) = self.placeholder_index(chat_id, temp_id) {
                    self.chat_mut(chat_id).messages.remove(idx);
                }
                self.routes.remove(temp_id);
                self.persist(chat_id);
                FlushStep::Continue
            }
            Err(e) if still_queued => match self.placeholder_index(chat_id, temp_id) {
                Some(idx) => {
                    tracing::warn!(%chat_id, %temp_id, %e, "queued message replay failed; halting");
                    self.chat_mut(chat_id).messages[idx].mark_failed();
                    self.persist(chat_id);
                    FlushStep::Halted
                }
                None => {
                    // The stream confirmed it while the replay was outstanding.
                    tracing::debug!(%chat_id, %temp_id, %e, "replay failed after stream confirmed it");
                    self.dequeue(temp_id);
                    self.routes.remove(temp_id);
                    FlushStep::Continue
                }
            },
            // Deleted or confirmed while in flight; nothing blocks the rest of the queue.
            Err(_) => FlushStep::Continue,
        }
    }

    fn enqueue(&mut self, chat_id: &str, temp_id: &str) {
        if self.queue.iter().any(|e| e.temp_id() == Some(temp_id)) {
            return;
        }
        let Some(idx) = self.placeholder_index(chat_id, temp_id) else {
            return;
        };
        let message = self.chat_mut(chat_id).messages[idx].clone();
        let route = self.routes.get(temp_id).cloned().unwrap_or_default();
        let entry = OfflineQueueEntry {
            chat_id: chat_id.to_string(),
            chat_name: route.chat_name,
            recipient_ids: route.recipient_ids,
            message,
        };
        if let Err(e) = self.cache.push_offline_queue(&entry) {
            tracing::warn!(%e, %temp_id, "failed to persist offline queue entry");
            self.unpersisted.insert(temp_id.to_string());
        }
        self.queue.push_back(entry);
    }

    fn dequeue(&mut self, temp_id: &str) {
        let Some(pos) = self.queue.iter().position(|e| e.temp_id() == Some(temp_id)) else {
            return;
        };
        // Cache rows exist only for persisted entries, so the row index skips the others.
        let row = self
            .queue
            .iter()
            .take(pos)
            .filter(|e| e.temp_id().is_some_and(|t| !self.unpersisted.contains(t)))
            .count();
        self.queue.remove(pos);
        if self.unpersisted.remove(temp_id) {
            return;
        }
        if let Err(e) = self.cache.remove_from_offline_queue(row) {
            tracing::warn!(%e, %temp_id, "failed to remove offline queue entry");
        }
    }

    fn placeholder_index(&mut self, chat_id: &str, temp_id: &str) -> Option<usize> {
        self.chat_mut(chat_id)
            .messages
            .iter()
            .position(|m| m.temp_id.as_deref() == Some(temp_id) && m.is_placeholder())
    }

    fn insert_sorted(&mut self, chat_id: &str, message: ChatMessage) {
        let log = self.chat_mut(chat_id);
        log.messages.push(message);
        log.messages.sort_by_key(|m| m.timestamp);
    }

    fn chat_mut(&mut self, chat_id: &str) -> &mut ChatLog {
        if !self.chats.contains_key(chat_id) {
            let log = self.load_chat(chat_id);
            self.chats.insert(chat_id.to_string(), log);
        }
        self.chats.entry(chat_id.to_string()).or_default()
    }

    fn load_chat(&self, chat_id: &str) -> ChatLog {
        let mut messages = match self.cache.cached_messages(chat_id) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%e, %chat_id, "failed to read cached messages");
                vec![]
            }
        };
        let queued: HashSet<String> = self.queued_temp_ids().into_iter().collect();
        for m in messages.iter_mut() {
            // Its append died with the previous process; let the user retry it.
            let orphaned = m.pending
                && m.id.is_none()
                && m.temp_id.as_ref().is_some_and(|t| !queued.contains(t));
            if orphaned {
                m.mark_failed();
            }
        }
        messages.sort_by_key(|m| m.timestamp);
        ChatLog {
            messages,
            stream_error: None,
        }
    }

    fn persist(&self, chat_id: &str) {
        let Some(log) = self.chats.get(chat_id) else {
            return;
        };
        if let Err(e) = self.cache.cache_messages(chat_id, &log.messages) {
            tracing::warn!(%e, %chat_id, "failed to cache messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteLocalCache;

    const WINDOW: i64 = DEFAULT_CONTENT_MATCH_WINDOW_MS;

    fn engine() -> MessageSyncEngine {
        let cache = Arc::new(SqliteLocalCache::open_in_memory().expect("in-memory cache"));
        MessageSyncEngine::new(cache, WINDOW)
    }

    fn route() -> SendRoute {
        SendRoute {
            chat_name: "Team".into(),
            recipient_ids: vec!["bob".into()],
        }
    }

    fn err() -> SyncError {
        SyncError::TransientNetwork("offline".into())
    }

    #[test]
    fn optimistic_send_inserts_pending_placeholder_before_io() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert!(list[0].pending);
        assert_eq!(list[0].temp_id.as_deref(), Some(out.temp_id.as_str()));
        assert_eq!(list[0].id, None);
    }

    #[test]
    fn connected_success_removes_placeholder() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        let outcome = e.complete_send("c1", &out.temp_id, Ok("r1".into()), true);
        assert_eq!(outcome, SendOutcome::Confirmed);
        assert!(e.messages("c1").is_empty());
        assert_eq!(e.queue_len(), 0);
    }

    #[test]
    fn offline_success_keeps_placeholder_with_remote_id() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        let outcome = e.complete_send("c1", &out.temp_id, Ok("r1".into()), false);
        assert_eq!(outcome, SendOutcome::AwaitingStream);
        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert!(list[0].pending);
        assert_eq!(list[0].id.as_deref(), Some("r1"));
        assert_eq!(e.queue_len(), 0, "stored remotely, nothing to replay");
    }

    #[test]
    fn failure_marks_failed_and_queues_once() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        assert_eq!(
            e.complete_send("c1", &out.temp_id, Err(err()), false),
            SendOutcome::Failed
        );
        let m = &e.messages("c1")[0];
        assert!(m.failed && !m.pending);
        assert_eq!(e.queue_len(), 1);

        e.begin_retry("c1", &out.temp_id).unwrap();
        assert!(e.complete_retry("c1", &out.temp_id, Err(err())).is_err());
        assert_eq!(e.queue_len(), 1);
    }

    #[test]
    fn offline_hello_reconciles_to_single_canonical_row() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Ok("r1".into()), false);

        let list = e.reconcile("c1", vec![ChatMessage::remote("r1", "Hello", "alice", 1_200)]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id.as_deref(), Some("r1"));
        assert!(list[0].temp_id.is_none());
        assert!(!list[0].pending);
    }

    #[test]
    fn completion_and_snapshot_commute() {
        let remote = vec![ChatMessage::remote("r1", "Hello", "alice", 1_050)];
        for connected in [true, false] {
            let mut a = engine();
            let out = a.send_optimistic("c1", "Hello", "alice", 1_000, route());
            a.complete_send("c1", &out.temp_id, Ok("r1".into()), connected);
            let first = a.reconcile("c1", remote.clone()).to_vec();

            let mut b = engine();
            let out = b.send_optimistic("c1", "Hello", "alice", 1_000, route());
            b.reconcile("c1", remote.clone());
            b.complete_send("c1", &out.temp_id, Ok("r1".into()), connected);
            let second = b.messages("c1").to_vec();

            assert_eq!(first, second);
            assert_eq!(first.len(), 1);
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut e = engine();
        e.send_optimistic("c1", "pending one", "alice", 5_000, route());
        let remote = vec![
            ChatMessage::remote("r1", "a", "bob", 1_000),
            ChatMessage::remote("r2", "b", "bob", 2_000),
        ];
        let once = e.reconcile("c1", remote.clone()).to_vec();
        let twice = e.reconcile("c1", remote).to_vec();
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn reconcile_dedupes_remote_by_id_first_wins() {
        let out = reconcile_lists(
            &[],
            vec![
                ChatMessage::remote("r1", "first", "bob", 1_000),
                ChatMessage::remote("r2", "other", "bob", 900),
                ChatMessage::remote("r1", "dup", "bob", 1_000),
            ],
            WINDOW,
        );
        let texts: Vec<&str> = out.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["other", "first"]);
    }

    #[test]
    fn reconcile_matches_echoed_temp_id() {
        let mut p = ChatMessage {
            temp_id: Some("temp-1".into()),
            text: "edited elsewhere".into(),
            sender_id: "alice".into(),
            timestamp: 1_000,
            ..Default::default()
        };
        p.mark_pending();
        let mut r = ChatMessage::remote("r9", "different text", "alice", 90_000);
        r.temp_id = Some("temp-1".into());
        let out = reconcile_lists(&[p], vec![r], WINDOW);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.covered, vec!["temp-1".to_string()]);
    }

    #[test]
    fn content_fallback_respects_window() {
        let mut p = ChatMessage {
            temp_id: Some("temp-1".into()),
            text: "hi".into(),
            sender_id: "alice".into(),
            timestamp: 10_000,
            ..Default::default()
        };
        p.mark_pending();
        let near = reconcile_lists(
            &[p.clone()],
            vec![ChatMessage::remote("r1", "hi", "alice", 14_999)],
            WINDOW,
        );
        assert_eq!(near.messages.len(), 1);

        let far = reconcile_lists(
            &[p],
            vec![ChatMessage::remote("r1", "hi", "alice", 15_000)],
            WINDOW,
        );
        assert_eq!(far.messages.len(), 2);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let out = reconcile_lists(
            &[],
            vec![
                ChatMessage::remote("a", "1", "bob", 1_000),
                ChatMessage::remote("b", "2", "bob", 1_000),
                ChatMessage::remote("c", "3", "bob", 500),
            ],
            WINDOW,
        );
        let ids: Vec<&str> = out.messages.iter().filter_map(|m| m.id.as_deref()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn retry_transitions_without_duplicating() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), true);

        let again = e.begin_retry("c1", &out.temp_id).unwrap();
        assert_eq!(again.temp_id, out.temp_id);
        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert!(list[0].pending && !list[0].failed);

        assert!(e.complete_retry("c1", &out.temp_id, Err(err())).is_err());
        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert!(list[0].failed);

        e.begin_retry("c1", &out.temp_id).unwrap();
        e.complete_retry("c1", &out.temp_id, Ok("r1".into())).unwrap();
        assert!(e.messages("c1").is_empty());
        assert_eq!(e.queue_len(), 0);
    }

    #[test]
    fn retry_rejects_pending_and_unknown_messages() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        assert_eq!(
            e.begin_retry("c1", &out.temp_id),
            Err(SyncError::NotRetryable(out.temp_id.clone()))
        );
        assert!(matches!(
            e.begin_retry("c1", "temp-missing"),
            Err(SyncError::MessageNotFound(_))
        ));
    }

    #[test]
    fn flush_is_fifo_and_halts_on_failure() {
        let mut e = engine();
        let mut temps = vec![];
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            let out = e.send_optimistic("c1", text, "alice", 1_000 + i as i64, route());
            e.complete_send("c1", &out.temp_id, Err(err()), false);
            temps.push(out.temp_id);
        }
        assert_eq!(e.queue_len(), 3);

        let (entry, out) = e.begin_flush().unwrap();
        assert_eq!(entry.message.text, "one");
        assert!(e.begin_flush().is_none(), "single replay at a time");
        assert_eq!(
            e.complete_flush("c1", &out.temp_id, Ok("r1".into())),
            FlushStep::Continue
        );

        let (entry, out) = e.begin_flush().unwrap();
        assert_eq!(entry.message.text, "two");
        assert_eq!(e.complete_flush("c1", &out.temp_id, Err(err())), FlushStep::Halted);
        assert_eq!(e.queued_temp_ids(), temps[1..].to_vec());

        let two = e
            .messages("c1")
            .iter()
            .find(|m| m.temp_id.as_deref() == Some(temps[1].as_str()))
            .unwrap();
        assert!(two.failed);
    }

    #[test]
    fn covered_placeholder_leaves_offline_queue() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), false);
        assert_eq!(e.queue_len(), 1);

        e.reconcile("c1", vec![ChatMessage::remote("r1", "Hello", "alice", 1_100)]);
        assert_eq!(e.queue_len(), 0);
        assert_eq!(e.messages("c1").len(), 1);
    }

    #[test]
    fn retry_in_flight_blocks_replay_of_the_same_entry() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), true);
        e.begin_retry("c1", &out.temp_id).unwrap();

        assert!(e.begin_flush().is_none(), "retry already owns the head");
        assert!(!e.is_flushing());

        e.complete_retry("c1", &out.temp_id, Ok("r1".into())).unwrap();
        assert_eq!(e.queue_len(), 0);
        assert!(e.begin_flush().is_none());
        assert!(e.messages("c1").is_empty());
    }

    #[test]
    fn failed_retry_hands_the_entry_back_to_replay() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), true);
        e.begin_retry("c1", &out.temp_id).unwrap();
        assert!(e.complete_retry("c1", &out.temp_id, Err(err())).is_err());

        let (entry, replay) = e.begin_flush().unwrap();
        assert_eq!(replay.temp_id, out.temp_id);
        assert_eq!(entry.recipient_ids, vec!["bob".to_string()]);
        assert_eq!(e.queue_len(), 1);
    }

    #[test]
    fn retry_failing_after_stream_confirmation_is_settled() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), true);
        e.begin_retry("c1", &out.temp_id).unwrap();

        let mut echoed = ChatMessage::remote("r1", "Hello", "alice", 1_050);
        echoed.temp_id = Some(out.temp_id.clone());
        e.reconcile("c1", vec![echoed]);
        assert_eq!(e.queue_len(), 1, "outstanding append settles its own entry");

        assert_eq!(e.complete_retry("c1", &out.temp_id, Err(err())), Ok(()));
        assert_eq!(e.queue_len(), 0);
        assert_eq!(e.messages("c1").len(), 1);
    }

    #[test]
    fn replay_failing_after_stream_confirmation_moves_on() {
        let mut e = engine();
        let mut temps = vec![];
        for (i, text) in ["one", "two"].iter().enumerate() {
            let out = e.send_optimistic("c1", text, "alice", 1_000 + i as i64, route());
            e.complete_send("c1", &out.temp_id, Err(err()), false);
            temps.push(out.temp_id);
        }
        let (_, first) = e.begin_flush().unwrap();
        assert_eq!(first.temp_id, temps[0]);

        let mut echoed = ChatMessage::remote("r1", "one", "alice", 1_020);
        echoed.temp_id = Some(temps[0].clone());
        e.reconcile("c1", vec![echoed]);

        assert_eq!(
            e.complete_flush("c1", &temps[0], Err(err())),
            FlushStep::Continue
        );
        assert_eq!(e.queued_temp_ids(), vec![temps[1].clone()]);
        let (entry, _) = e.begin_flush().unwrap();
        assert_eq!(entry.message.text, "two");
    }

    /// Fails `push_offline_queue` while armed; everything else goes to SQLite.
    struct FlakyQueueCache {
        inner: SqliteLocalCache,
        fail_pushes: std::sync::atomic::AtomicBool,
    }

    impl LocalCache for FlakyQueueCache {
        fn cached_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, SyncError> {
            self.inner.cached_messages(chat_id)
        }
        fn cache_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), SyncError> {
            self.inner.cache_messages(chat_id, messages)
        }
        fn offline_queue(&self) -> Result<Vec<OfflineQueueEntry>, SyncError> {
            self.inner.offline_queue()
        }
        fn push_offline_queue(&self, entry: &OfflineQueueEntry) -> Result<(), SyncError> {
            if self.fail_pushes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SyncError::Persistence("disk full".into()));
            }
            self.inner.push_offline_queue(entry)
        }
        fn remove_from_offline_queue(&self, index: usize) -> Result<(), SyncError> {
            self.inner.remove_from_offline_queue(index)
        }
    }

    #[test]
    fn unpersisted_queue_entry_does_not_shift_cache_rows() {
        use std::sync::atomic::Ordering;

        let cache = Arc::new(FlakyQueueCache {
            inner: SqliteLocalCache::open_in_memory().unwrap(),
            fail_pushes: false.into(),
        });
        let mut e = MessageSyncEngine::new(cache.clone(), WINDOW);

        let send = |e: &mut MessageSyncEngine, text: &str, at: i64| {
            let out = e.send_optimistic("c1", text, "alice", at, route());
            e.complete_send("c1", &out.temp_id, Err(err()), false);
            out.temp_id
        };
        cache.fail_pushes.store(true, Ordering::SeqCst);
        let a = send(&mut e, "a", 1_000);
        cache.fail_pushes.store(false, Ordering::SeqCst);
        let b = send(&mut e, "b", 1_001);
        let c = send(&mut e, "c", 1_002);
        assert_eq!(e.queue_len(), 3);

        e.delete_failed("c1", &b).unwrap();
        let stored: Vec<String> = cache
            .offline_queue()
            .unwrap()
            .into_iter()
            .map(|q| q.message.text)
            .collect();
        assert_eq!(stored, vec!["c".to_string()]);

        e.delete_failed("c1", &a).unwrap();
        assert_eq!(cache.offline_queue().unwrap().len(), 1, "a had no row to remove");
        assert_eq!(e.queued_temp_ids(), vec![c]);
    }

    #[test]
    fn delete_failed_clears_queue_entry() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        e.complete_send("c1", &out.temp_id, Err(err()), false);
        e.delete_failed("c1", &out.temp_id).unwrap();
        assert!(e.messages("c1").is_empty());
        assert_eq!(e.queue_len(), 0);
    }

    #[test]
    fn add_message_merges_by_temp_id() {
        let mut e = engine();
        let out = e.send_optimistic("c1", "Hello", "alice", 1_000, route());
        let mut confirmed = ChatMessage::remote("r1", "Hello", "alice", 1_000);
        confirmed.temp_id = Some(out.temp_id.clone());
        confirmed.read_by = vec!["bob".into()];
        e.add_message("c1", confirmed);

        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id.as_deref(), Some("r1"));
        assert_eq!(list[0].read_by, vec!["bob".to_string()]);
        assert!(!list[0].pending);
    }

    #[test]
    fn update_message_applies_patch() {
        let mut e = engine();
        e.add_message("c1", ChatMessage::remote("r1", "Hello", "alice", 1_000));
        assert!(e.update_message(
            "c1",
            "r1",
            MessagePatch {
                read_by: Some(vec!["bob".into()]),
                ..Default::default()
            }
        ));
        assert_eq!(e.messages("c1")[0].read_by, vec!["bob".to_string()]);
        assert!(!e.update_message("c1", "nope", MessagePatch::default()));
    }

    #[test]
    fn stream_error_keeps_list_until_next_snapshot() {
        let mut e = engine();
        e.reconcile("c1", vec![ChatMessage::remote("r1", "a", "bob", 1)]);
        e.set_stream_error("c1", &SyncError::Subscription("permission denied".into()));
        assert_eq!(e.messages("c1").len(), 1);
        assert!(e.stream_error("c1").is_some());
        e.reconcile("c1", vec![ChatMessage::remote("r1", "a", "bob", 1)]);
        assert!(e.stream_error("c1").is_none());
    }

    #[test]
    fn orphaned_pending_placeholders_reload_as_failed() {
        let cache = Arc::new(SqliteLocalCache::open_in_memory().unwrap());
        {
            let mut e = MessageSyncEngine::new(cache.clone(), WINDOW);
            e.send_optimistic("c1", "lost", "alice", 1_000, route());
        }
        let mut e = MessageSyncEngine::new(cache, WINDOW);
        e.load_offline_queue();
        let list = e.messages("c1");
        assert_eq!(list.len(), 1);
        assert!(list[0].failed);
    }
}
