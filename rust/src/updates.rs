use std::collections::HashMap;

use crate::error::SyncError;
use crate::notifications::NotificationQueueEntry;
use crate::presence::{PresenceMirror, PresenceRecord};
use crate::state::{AppState, ChatMessage, NetworkSignal};
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

/// Which path issued a remote append; decides how its completion is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOrigin {
    Send,
    Retry,
    Replay,
}

/// Results and signals posted back to the actor. `session` is the token of the session that
/// started the work and `chat` the epoch of the chat view it belongs to; anything that no longer
/// matches is dropped.
#[derive(Debug)]
pub enum InternalEvent {
    // Connectivity
    NetworkSignal {
        session: u64,
        signal: NetworkSignal,
    },
    ProbeFinished {
        session: u64,
        generation: u64,
        reachable: bool,
    },
    ReconnectSettled {
        session: u64,
        epoch: u64,
    },

    // Messages
    AppendFinished {
        session: u64,
        chat_id: String,
        temp_id: String,
        origin: AppendOrigin,
        result: Result<String, SyncError>,
    },
    RemoteSnapshot {
        session: u64,
        chat: u64,
        chat_id: String,
        messages: Vec<ChatMessage>,
    },
    RemoteStreamError {
        session: u64,
        chat: u64,
        chat_id: String,
        error: SyncError,
    },

    // Presence
    ChannelConnectivity {
        session: u64,
        connected: bool,
    },
    DisconnectHookRegistered {
        session: u64,
        epoch: u64,
        result: Result<(), SyncError>,
    },
    HeartbeatTick {
        session: u64,
    },
    PresenceRecordChanged {
        session: u64,
        record: Option<PresenceRecord>,
    },
    MemberPresenceChanged {
        session: u64,
        chat: u64,
        user_id: String,
        mirror: Option<PresenceMirror>,
    },

    // Typing
    TypingSnapshot {
        session: u64,
        chat: u64,
        typers: HashMap<String, i64>,
    },
    HousekeepingTick {
        session: u64,
    },

    // Notifications
    RelaySnapshot {
        session: u64,
        entries: Vec<(String, NotificationQueueEntry)>,
    },
    NotificationDebounceFired {
        session: u64,
        generation: u64,
    },
    BannerAdvance {
        session: u64,
        generation: u64,
    },

    Toast(String),
}
