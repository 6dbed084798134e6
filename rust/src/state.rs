/// A single message as shown in a chat.
///
/// Remote rows always carry `id`. Locally originated messages carry `temp_id` from the moment they
/// are typed; `id` is filled in once the remote log answers the append.
#[derive(
    uniffi::Record, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default,
)]
pub struct ChatMessage {
    pub id: Option<String>,
    pub temp_id: Option<String>,
    pub text: String,
    pub sender_id: String,
    pub timestamp: i64,
    pub read_by: Vec<String>,
    pub pending: bool,
    pub failed: bool,
}

impl ChatMessage {
    /// A canonical row as delivered by the remote log.
    pub fn remote(id: &str, text: &str, sender_id: &str, timestamp: i64) -> Self {
        Self {
            id: Some(id.to_string()),
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            timestamp,
            ..Default::default()
        }
    }

    /// Optimistic entries still waiting for (or having failed) remote confirmation.
    pub fn is_placeholder(&self) -> bool {
        (self.pending || self.failed) && self.temp_id.is_some()
    }

    /// True when `key` names this entry either by remote id or by temp id.
    pub fn matches_key(&self, key: &str) -> bool {
        self.id.as_deref() == Some(key) || self.temp_id.as_deref() == Some(key)
    }

    pub fn mark_pending(&mut self) {
        self.pending = true;
        self.failed = false;
    }

    pub fn mark_failed(&mut self) {
        self.pending = false;
        self.failed = true;
    }
}

/// Raw transport signal as reported by the platform network stack.
#[derive(uniffi::Record, Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkSignal {
    pub is_connected: bool,
    pub is_internet_reachable: Option<bool>,
}

#[derive(uniffi::Record, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub is_initialized: bool,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresencePhase {
    Uninitialized,
    Registering,
    Online,
    Offline,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct MemberPresence {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<i64>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ChatViewState {
    pub chat_id: String,
    pub chat_name: String,
    pub messages: Vec<ChatMessage>,
    pub typing_user_ids: Vec<String>,
    pub member_presence: Vec<MemberPresence>,
    pub stream_error: Option<String>,
}

/// In-app banner shown while the app is in the foreground.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct InAppBanner {
    pub chat_id: String,
    pub chat_name: String,
    pub body: String,
    pub message_count: u32,
    pub timestamp: i64,
}

/// Coalesced notification for one chat, handed to the platform while backgrounded.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ChatNotification {
    pub chat_id: String,
    pub chat_name: String,
    pub body: String,
    pub latest_text: String,
    pub message_count: u32,
    pub sender_id: String,
    pub timestamp: i64,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn { user_id: String },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub connectivity: ConnectivityState,
    pub presence: PresencePhase,
    pub current_chat: Option<ChatViewState>,
    pub outbox_len: u32,
    pub banner: Option<InAppBanner>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            connectivity: ConnectivityState::default(),
            presence: PresencePhase::Uninitialized,
            current_chat: None,
            outbox_len: 0,
            banner: None,
            toast: None,
        }
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
