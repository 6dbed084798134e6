//! Own-presence state machine and derived presence of other users.
//!
//! Liveness comes from two sources: a server-side disconnect hook that flips the record offline
//! when the realtime channel drops, and a heartbeat that keeps `last_active` fresh. Readers treat
//! an "online" mirror whose heartbeat is older than the stale window as offline, which covers
//! the case where the hook never fires.

use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::state::{MemberPresence, PresencePhase};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: i64 = 5_000;
pub const DEFAULT_PRESENCE_STALE_MS: i64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PresenceRecord {
    pub state: PresenceState,
    pub last_changed: i64,
}

impl PresenceRecord {
    pub fn online(now: i64) -> Self {
        Self {
            state: PresenceState::Online,
            last_changed: now,
        }
    }

    pub fn offline(now: i64) -> Self {
        Self {
            state: PresenceState::Offline,
            last_changed: now,
        }
    }
}

/// Copy of a presence record kept in the per-user metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PresenceMirror {
    pub is_online: bool,
    pub last_active: Option<i64>,
    pub last_seen: Option<i64>,
}

impl PresenceMirror {
    pub fn online(now: i64) -> Self {
        Self {
            is_online: true,
            last_active: Some(now),
            last_seen: Some(now),
        }
    }

    pub fn offline(now: i64) -> Self {
        Self {
            is_online: false,
            last_active: None,
            last_seen: Some(now),
        }
    }

    pub fn from_record(record: &PresenceRecord) -> Self {
        match record.state {
            PresenceState::Online => Self::online(record.last_changed),
            PresenceState::Offline => Self::offline(record.last_changed),
        }
    }
}

/// What a reader should show: online only with a heartbeat inside the stale window.
pub fn display_online(mirror: Option<&PresenceMirror>, now: i64, stale_ms: i64) -> bool {
    mirror.is_some_and(|m| m.is_online && m.last_active.is_some_and(|t| now - t <= stale_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEffect {
    /// Register the server-side offline write; report back with this epoch.
    RegisterHook { epoch: u64 },
    /// Write `online` to the record and the mirror.
    GoOnline,
    StartHeartbeat,
    StopHeartbeat,
}

#[derive(Debug)]
pub struct PresenceTracker {
    phase: PresencePhase,
    channel_epoch: u64,
    heartbeat_running: bool,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            phase: PresencePhase::Uninitialized,
            channel_epoch: 0,
            heartbeat_running: false,
        }
    }

    pub fn phase(&self) -> PresencePhase {
        self.phase
    }

    pub fn on_channel_changed(&mut self, connected: bool) -> Vec<PresenceEffect> {
        if connected {
            if matches!(self.phase, PresencePhase::Registering | PresencePhase::Online) {
                return vec![];
            }
            self.channel_epoch = self.channel_epoch.wrapping_add(1);
            self.phase = PresencePhase::Registering;
            return vec![PresenceEffect::RegisterHook {
                epoch: self.channel_epoch,
            }];
        }

        // The hook owns the offline write; the client only stops heartbeating.
        self.channel_epoch = self.channel_epoch.wrapping_add(1);
        if self.phase == PresencePhase::Uninitialized {
            return vec![];
        }
        self.phase = PresencePhase::Offline;
        self.stop_heartbeat()
    }

    pub fn on_hook_registered(
        &mut self,
        epoch: u64,
        result: Result<(), SyncError>,
    ) -> Vec<PresenceEffect> {
        if epoch != self.channel_epoch || self.phase != PresencePhase::Registering {
            tracing::debug!(epoch, "ignoring stale disconnect hook completion");
            return vec![];
        }
        if let Err(e) = result {
            tracing::warn!(%e, "disconnect hook registration failed; heartbeat-only liveness");
        }
        self.phase = PresencePhase::Online;
        let mut effects = vec![PresenceEffect::GoOnline];
        if !self.heartbeat_running {
            self.heartbeat_running = true;
            effects.push(PresenceEffect::StartHeartbeat);
        }
        effects
    }

    /// Whether a heartbeat tick should refresh the mirror.
    pub fn should_heartbeat(&self) -> bool {
        self.heartbeat_running && self.phase == PresencePhase::Online
    }

    /// Ends liveness for an explicit logout. The caller writes offline itself.
    pub fn logout(&mut self) -> Vec<PresenceEffect> {
        self.channel_epoch = self.channel_epoch.wrapping_add(1);
        self.phase = PresencePhase::Offline;
        self.stop_heartbeat()
    }

    fn stop_heartbeat(&mut self) -> Vec<PresenceEffect> {
        if !self.heartbeat_running {
            return vec![];
        }
        self.heartbeat_running = false;
        vec![PresenceEffect::StopHeartbeat]
    }
}

/// Last mirror seen for each member of the open chat.
#[derive(Debug, Default)]
pub struct MemberPresenceBook {
    mirrors: BTreeMap<String, Option<PresenceMirror>>,
}

impl MemberPresenceBook {
    pub fn new(member_ids: &[String]) -> Self {
        Self {
            mirrors: member_ids.iter().map(|id| (id.clone(), None)).collect(),
        }
    }

    pub fn update(&mut self, user_id: &str, mirror: Option<PresenceMirror>) {
        self.mirrors.insert(user_id.to_string(), mirror);
    }

    pub fn derive(&self, now: i64, stale_ms: i64) -> Vec<MemberPresence> {
        self.mirrors
            .iter()
            .map(|(user_id, mirror)| MemberPresence {
                user_id: user_id.clone(),
                is_online: display_online(mirror.as_ref(), now, stale_ms),
                last_seen: mirror.as_ref().and_then(|m| m.last_seen),
            })
            .collect()
    }
}
