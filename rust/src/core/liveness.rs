// Connectivity, own presence, member presence and typing.

use std::collections::HashMap;

use super::*;
use crate::connectivity::{SignalOutcome, Transition};
use crate::error::SyncError;
use crate::presence::{PresenceEffect, PresenceMirror, PresenceRecord};
use crate::state::{now_millis, NetworkSignal};
use crate::typing::stale_entries;

impl AppCore {
    pub(super) fn on_network_signal(&mut self, session: u64, signal: NetworkSignal) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        match sess.connectivity.on_signal(signal) {
            SignalOutcome::StartProbe(generation) => {
                let probe = self.probe.clone();
                let tx = self.core_sender.clone();
                self.runtime.spawn(async move {
                    let reachable = probe.probe().await;
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::ProbeFinished {
                        session,
                        generation,
                        reachable,
                    })));
                });
            }
            SignalOutcome::Resolved(Some(transition)) => {
                self.on_connectivity_transition(session, transition)
            }
            SignalOutcome::Resolved(None) | SignalOutcome::ProbeBusy => {}
        }
    }

    pub(super) fn on_probe_finished(&mut self, session: u64, generation: u64, reachable: bool) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        if let Some(transition) = sess.connectivity.on_probe_result(generation, reachable) {
            self.on_connectivity_transition(session, transition);
        }
    }

    fn on_connectivity_transition(&mut self, session: u64, transition: Transition) {
        tracing::info!(connected = transition.connected, "connectivity changed");
        if let Some(epoch) = transition.settle_epoch {
            self.post_after(
                self.config.reconnect_settle(),
                InternalEvent::ReconnectSettled { session, epoch },
            );
        }
        self.sync_state();
    }

    pub(super) fn on_reconnect_settled(&mut self, session: u64, epoch: u64) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        if !sess.connectivity.settle_elapsed(epoch) {
            tracing::debug!(epoch, "reconnect settle superseded");
            return;
        }
        self.flush_offline_queue();
    }

    pub(super) fn on_channel_connectivity(&mut self, session: u64, connected: bool) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        tracing::info!(connected, "realtime channel");
        let effects = sess.presence.on_channel_changed(connected);
        self.apply_presence_effects(session, effects);
        self.sync_state();
    }

    pub(super) fn on_disconnect_hook_registered(
        &mut self,
        session: u64,
        epoch: u64,
        result: Result<(), SyncError>,
    ) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let effects = sess.presence.on_hook_registered(epoch, result);
        self.apply_presence_effects(session, effects);
        self.sync_state();
    }

    fn apply_presence_effects(&mut self, session: u64, effects: Vec<PresenceEffect>) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let user_id = sess.user_id.clone();
        for effect in effects {
            match effect {
                PresenceEffect::RegisterHook { epoch } => {
                    let store = self.backends.presence.clone();
                    let tx = self.core_sender.clone();
                    let user_id = user_id.clone();
                    self.runtime.spawn(async move {
                        let result = store
                            .register_disconnect_hook(&user_id, PresenceRecord::offline(now_millis()))
                            .await;
                        let _ = tx.send(CoreMsg::Internal(Box::new(
                            InternalEvent::DisconnectHookRegistered {
                                session,
                                epoch,
                                result,
                            },
                        )));
                    });
                }
                PresenceEffect::GoOnline => {
                    let store = self.backends.presence.clone();
                    let metadata = self.backends.user_metadata.clone();
                    let user_id = user_id.clone();
                    self.runtime.spawn(async move {
                        let now = now_millis();
                        if let Err(e) = store.set(&user_id, PresenceRecord::online(now)).await {
                            tracing::warn!(%e, "failed to write online presence");
                        }
                        if let Err(e) = metadata
                            .update_presence(&user_id, PresenceMirror::online(now))
                            .await
                        {
                            tracing::warn!(%e, "failed to mirror online presence");
                        }
                    });
                }
                PresenceEffect::StartHeartbeat => {
                    let every = self.config.heartbeat_interval();
                    let tx = self.core_sender.clone();
                    let Some(sess) = self.session.as_mut() else {
                        return;
                    };
                    if sess.heartbeat.is_some() {
                        continue;
                    }
                    sess.heartbeat = Some(self.runtime.spawn(async move {
                        let mut ticker = tokio::time::interval(every);
                        loop {
                            ticker.tick().await;
                            let sent = tx.send(CoreMsg::Internal(Box::new(
                                InternalEvent::HeartbeatTick { session },
                            )));
                            if sent.is_err() {
                                break;
                            }
                        }
                    }));
                }
                PresenceEffect::StopHeartbeat => {
                    if let Some(task) = self.session.as_mut().and_then(|s| s.heartbeat.take()) {
                        task.abort();
                    }
                }
            }
        }
    }

    pub(super) fn on_heartbeat_tick(&mut self, session: u64) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        if !sess.presence.should_heartbeat() {
            return;
        }
        let user_id = sess.user_id.clone();
        let metadata = self.backends.user_metadata.clone();
        self.runtime.spawn(async move {
            if let Err(e) = metadata
                .update_presence(&user_id, PresenceMirror::online(now_millis()))
                .await
            {
                tracing::debug!(%e, "heartbeat write failed");
            }
        });
    }

    /// Keeps the metadata mirror in step with the authoritative record.
    pub(super) fn on_presence_record_changed(
        &mut self,
        session: u64,
        record: Option<PresenceRecord>,
    ) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let Some(record) = record else {
            return;
        };
        let user_id = sess.user_id.clone();
        let metadata = self.backends.user_metadata.clone();
        self.runtime.spawn(async move {
            let mirror = PresenceMirror::from_record(&record);
            if let Err(e) = metadata.update_presence(&user_id, mirror).await {
                tracing::warn!(%e, "failed to mirror presence record");
            }
        });
    }

    pub(super) fn on_member_presence_changed(
        &mut self,
        session: u64,
        chat: u64,
        user_id: &str,
        mirror: Option<PresenceMirror>,
    ) {
        let Some(open) = self.open_chat_mut(session, chat) else {
            return;
        };
        open.members.update(user_id, mirror);
        self.sync_state();
    }

    pub(super) fn on_typing_snapshot(
        &mut self,
        session: u64,
        chat: u64,
        typers: HashMap<String, i64>,
    ) {
        let Some(open) = self.open_chat_mut(session, chat) else {
            return;
        };
        if open.typing.on_snapshot(typers, now_millis()).is_some() {
            self.sync_state();
        }
    }

    /// Periodic sweep: expire typing locally, delete stale records, re-derive presence.
    pub(super) fn on_housekeeping_tick(&mut self, session: u64) {
        let timeout_ms = self.config.typing_timeout_ms();
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let Some(open) = sess.open_chat.as_mut() else {
            return;
        };
        open.typing.refilter(now_millis());
        let chat_id = open.chat_id.clone();

        let store = self.backends.typing.clone();
        self.runtime.spawn(async move {
            let snapshot = match store.get_all(&chat_id).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%e, %chat_id, "typing cleanup read failed");
                    return;
                }
            };
            for user_id in stale_entries(&snapshot, now_millis(), timeout_ms) {
                if let Err(e) = store.remove(&chat_id, &user_id).await {
                    tracing::debug!(%e, %chat_id, %user_id, "typing cleanup delete failed");
                }
            }
        });
        self.sync_state();
    }

    pub(super) fn set_own_typing(&mut self, chat_id: &str, typing: bool) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let user_id = sess.user_id.clone();
        let store = self.backends.typing.clone();
        let chat_id = chat_id.to_string();
        self.runtime.spawn(async move {
            let res = if typing {
                store.set(&chat_id, &user_id, now_millis()).await
            } else {
                store.remove(&chat_id, &user_id).await
            };
            if let Err(e) = res {
                tracing::debug!(%e, %chat_id, typing, "typing write failed");
            }
        });
    }

    pub(super) fn clear_own_typing(&mut self, chat_id: &str) {
        self.set_own_typing(chat_id, false);
    }
}
