//! Debounced, per-chat grouped notifications.
//!
//! Senders write one relay entry per recipient. Receivers drain their relay inbox, buffer entries
//! by chat, and after a quiet period emit a single notification per chat. Where that notification
//! goes depends on what the user is looking at.

use std::collections::HashSet;

use crate::state::{ChatNotification, InAppBanner};
use crate::timer::Debounce;

pub const PREVIEW_MAX_CHARS: usize = 100;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_PROCESSED_IDS_TTL_MS: i64 = 5 * 60 * 1000;
pub const DEFAULT_BANNER_ADVANCE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NotificationQueueEntry {
    pub chat_id: String,
    pub chat_name: String,
    pub message_text: String,
    pub sender_id: String,
    pub timestamp: i64,
}

pub fn truncate_preview(text: &str) -> String {
    text.chars().take(PREVIEW_MAX_CHARS).collect()
}

/// One relay entry per recipient other than the sender.
pub fn relay_entries(
    chat_id: &str,
    chat_name: &str,
    text: &str,
    sender_id: &str,
    timestamp: i64,
    recipient_ids: &[String],
) -> Vec<(String, NotificationQueueEntry)> {
    let mut seen = HashSet::new();
    recipient_ids
        .iter()
        .filter(|r| r.as_str() != sender_id && seen.insert(r.as_str()))
        .map(|r| {
            (
                r.clone(),
                NotificationQueueEntry {
                    chat_id: chat_id.to_string(),
                    chat_name: chat_name.to_string(),
                    message_text: truncate_preview(text),
                    sender_id: sender_id.to_string(),
                    timestamp,
                },
            )
        })
        .collect()
}

pub fn compose_body(count: u32, latest_text: &str) -> String {
    if count > 1 {
        format!("({count} new messages) {latest_text}")
    } else {
        latest_text.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Suppressed,
    Banner(ChatNotification),
    Platform(ChatNotification),
}

/// Chooses the surface for a coalesced notification.
pub fn route(notification: ChatNotification, active_chat: Option<&str>, foreground: bool) -> Delivery {
    if active_chat == Some(notification.chat_id.as_str()) {
        Delivery::Suppressed
    } else if foreground {
        Delivery::Banner(notification)
    } else {
        Delivery::Platform(notification)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ingested {
    /// Relay entry ids to delete now that they are buffered.
    pub consumed: Vec<String>,
    /// Set when the debounce was re-armed; the sleeper reports this generation.
    pub debounce_generation: Option<u64>,
}

#[derive(Debug)]
struct ChatGroup {
    chat_id: String,
    entries: Vec<NotificationQueueEntry>,
}

#[derive(Debug)]
pub struct NotificationDispatcher {
    processed: HashSet<String>,
    processed_since: i64,
    processed_ttl_ms: i64,
    groups: Vec<ChatGroup>,
    debounce: Debounce,
}

impl NotificationDispatcher {
    pub fn new(processed_ttl_ms: i64, now: i64) -> Self {
        Self {
            processed: HashSet::new(),
            processed_since: now,
            processed_ttl_ms,
            groups: Vec::new(),
            debounce: Debounce::default(),
        }
    }

    pub fn ingest(&mut self, snapshot: Vec<(String, NotificationQueueEntry)>, now: i64) -> Ingested {
        if now - self.processed_since >= self.processed_ttl_ms {
            self.processed.clear();
            self.processed_since = now;
        }

        let mut out = Ingested::default();
        for (id, entry) in snapshot {
            if !self.processed.insert(id.clone()) {
                continue;
            }
            match self.groups.iter_mut().find(|g| g.chat_id == entry.chat_id) {
                Some(group) => group.entries.push(entry),
                None => self.groups.push(ChatGroup {
                    chat_id: entry.chat_id.clone(),
                    entries: vec![entry],
                }),
            }
            out.consumed.push(id);
        }
        if !out.consumed.is_empty() {
            out.debounce_generation = Some(self.debounce.reset());
        }
        out
    }

    /// Drains the buffers into one notification per chat if `generation` is the live debounce.
    pub fn flush(&mut self, generation: u64) -> Vec<ChatNotification> {
        if !self.debounce.fire(generation) {
            return vec![];
        }
        std::mem::take(&mut self.groups)
            .into_iter()
            .filter_map(|group| {
                let count = group.entries.len() as u32;
                let latest = group
                    .entries
                    .into_iter()
                    .reduce(|a, b| if b.timestamp >= a.timestamp { b } else { a })?;
                Some(ChatNotification {
                    chat_id: latest.chat_id,
                    chat_name: latest.chat_name,
                    body: compose_body(count, &latest.message_text),
                    latest_text: latest.message_text,
                    message_count: count,
                    sender_id: latest.sender_id,
                    timestamp: latest.timestamp,
                })
            })
            .collect()
    }

    pub fn buffered(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }
}

fn banner_for(n: &ChatNotification) -> InAppBanner {
    InAppBanner {
        chat_id: n.chat_id.clone(),
        chat_name: n.chat_name.clone(),
        body: n.body.clone(),
        message_count: n.message_count,
        timestamp: n.timestamp,
    }
}

/// One visible in-app banner plus the chats waiting behind it.
#[derive(Debug, Default)]
pub struct BannerQueue {
    visible: Option<InAppBanner>,
    queued: Vec<InAppBanner>,
    advance: Debounce,
}

impl BannerQueue {
    pub fn visible(&self) -> Option<&InAppBanner> {
        self.visible.as_ref()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn offer(&mut self, n: &ChatNotification) {
        match &self.visible {
            None => self.visible = Some(banner_for(n)),
            Some(v) if v.chat_id == n.chat_id => self.visible = Some(banner_for(n)),
            Some(_) => match self.queued.iter_mut().find(|b| b.chat_id == n.chat_id) {
                Some(waiting) => {
                    waiting.message_count += n.message_count;
                    waiting.body = compose_body(waiting.message_count, &n.latest_text);
                    waiting.timestamp = n.timestamp;
                }
                None => self.queued.push(banner_for(n)),
            },
        }
    }

    /// Hides the visible banner. Returns the advance generation if another one is waiting.
    pub fn dismiss(&mut self) -> Option<u64> {
        self.visible = None;
        if self.queued.is_empty() {
            self.advance.cancel();
            return None;
        }
        Some(self.advance.reset())
    }

    /// Shows the oldest waiting banner after the advance delay.
    pub fn advance(&mut self, generation: u64) -> bool {
        if !self.advance.fire(generation) || self.visible.is_some() || self.queued.is_empty() {
            return false;
        }
        self.visible = Some(self.queued.remove(0));
        true
    }

    /// Forgets everything about `chat_id`, e.g. because the user opened it.
    pub fn drop_chat(&mut self, chat_id: &str) -> Option<u64> {
        self.queued.retain(|b| b.chat_id != chat_id);
        if self.visible.as_ref().is_some_and(|b| b.chat_id == chat_id) {
            return self.dismiss();
        }
        None
    }
}
