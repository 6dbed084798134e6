// Session lifecycle: long-lived subscriptions and timer loops owned by one login.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;

use super::*;
use crate::backends::{LocalCache, Subscription};
use crate::cache::SqliteLocalCache;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::messages::MessageSyncEngine;
use crate::notifications::{BannerQueue, NotificationDispatcher, NotificationQueueEntry};
use crate::presence::{MemberPresenceBook, PresenceMirror, PresenceRecord, PresenceTracker};
use crate::state::{now_millis, ChatMessage, NetworkSignal};
use crate::typing::TypingIndicatorTracker;

const LOGOUT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// The chat currently on screen, with the subscriptions that feed it.
pub(super) struct OpenChat {
    pub(super) chat_id: String,
    pub(super) chat_name: String,
    pub(super) member_ids: Vec<String>,
    pub(super) epoch: u64,
    pub(super) typing: TypingIndicatorTracker,
    pub(super) members: MemberPresenceBook,
    pub(super) _subscriptions: Vec<Subscription>,
}

pub(super) struct Session {
    pub(super) token: u64,
    pub(super) user_id: String,

    pub(super) connectivity: ConnectivityMonitor,
    pub(super) messages: MessageSyncEngine,
    pub(super) presence: PresenceTracker,
    pub(super) notifications: NotificationDispatcher,
    pub(super) banners: BannerQueue,

    pub(super) open_chat: Option<OpenChat>,

    pub(super) subscriptions: Vec<Subscription>,
    pub(super) tasks: Vec<JoinHandle<()>>,
    pub(super) heartbeat: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl AppCore {
    fn open_cache(&self) -> anyhow::Result<Arc<dyn LocalCache>> {
        match SqliteLocalCache::open(&self.data_dir) {
            Ok(cache) => Ok(Arc::new(cache)),
            Err(e) => {
                tracing::warn!(%e, data_dir = %self.data_dir, "message cache unavailable; using memory");
                let cache = SqliteLocalCache::open_in_memory()
                    .context("open in-memory message cache")?;
                Ok(Arc::new(cache))
            }
        }
    }

    pub(super) fn start_session(&mut self, user_id: &str) -> anyhow::Result<()> {
        // Tear down any existing session first.
        self.stop_session();

        tracing::info!(%user_id, "start_session");
        let cache = self.open_cache()?;
        let mut messages = MessageSyncEngine::new(cache, self.config.content_match_window_ms());
        messages.load_offline_queue();

        self.session_seq = self.session_seq.wrapping_add(1);
        let token = self.session_seq;
        let mut sess = Session {
            token,
            user_id: user_id.to_string(),
            connectivity: ConnectivityMonitor::new(),
            messages,
            presence: PresenceTracker::new(),
            notifications: NotificationDispatcher::new(
                self.config.processed_ids_ttl_ms(),
                now_millis(),
            ),
            banners: BannerQueue::default(),
            open_chat: None,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
            heartbeat: None,
        };

        // Connectivity: push signals plus a fixed poll that re-evaluates the same rule.
        let tx = self.core_sender.clone();
        sess.subscriptions.push(self.backends.network.subscribe(Box::new(move |signal: NetworkSignal| {
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::NetworkSignal {
                session: token,
                signal,
            })));
        })));
        let network = self.backends.network.clone();
        let tx = self.core_sender.clone();
        let poll = self.config.connectivity_poll();
        sess.tasks.push(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let signal = network.fetch().await;
                let sent = tx.send(CoreMsg::Internal(Box::new(InternalEvent::NetworkSignal {
                    session: token,
                    signal,
                })));
                if sent.is_err() {
                    break;
                }
            }
        }));

        // Presence: the realtime channel drives registration; our own record is mirrored.
        let tx = self.core_sender.clone();
        sess.subscriptions.push(self.backends.presence.subscribe_channel(Box::new(
            move |connected: bool| {
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::ChannelConnectivity {
                        session: token,
                        connected,
                    },
                )));
            },
        )));
        let tx = self.core_sender.clone();
        sess.subscriptions.push(self.backends.presence.subscribe(
            user_id,
            Box::new(move |record: Option<PresenceRecord>| {
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::PresenceRecordChanged {
                        session: token,
                        record,
                    },
                )));
            }),
        ));

        // Notifications addressed to us.
        let tx = self.core_sender.clone();
        sess.subscriptions.push(self.backends.relay.subscribe(
            user_id,
            Box::new(move |entries: Vec<(String, NotificationQueueEntry)>| {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::RelaySnapshot {
                    session: token,
                    entries,
                })));
            }),
        ));

        // Housekeeping: typing expiry and presence staleness.
        let tx = self.core_sender.clone();
        let every = self.config.housekeeping_interval();
        sess.tasks.push(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let sent = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::HousekeepingTick { session: token },
                )));
                if sent.is_err() {
                    break;
                }
            }
        }));

        self.session = Some(sess);
        self.sync_state();
        Ok(())
    }

    pub(super) fn stop_session(&mut self) {
        if let Some(sess) = self.session.take() {
            tracing::info!(user_id = %sess.user_id, "stop_session");
            // Dropping the session detaches every subscription and aborts its loops.
            drop(sess);
        }
    }

    /// Explicit logout: write offline to the record and its mirror, waiting a bounded time.
    pub(super) fn sign_out_presence(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        for effect in sess.presence.logout() {
            if effect == crate::presence::PresenceEffect::StopHeartbeat {
                if let Some(task) = sess.heartbeat.take() {
                    task.abort();
                }
            }
        }

        let user_id = sess.user_id.clone();
        let presence = self.backends.presence.clone();
        let metadata = self.backends.user_metadata.clone();
        let now = now_millis();
        let res = self.runtime.block_on(async move {
            tokio::time::timeout(LOGOUT_PRESENCE_TIMEOUT, async {
                presence.set(&user_id, PresenceRecord::offline(now)).await?;
                metadata
                    .update_presence(&user_id, PresenceMirror::offline(now))
                    .await
            })
            .await
        });
        match res {
            Ok(Ok(())) => tracing::info!("presence set offline"),
            Ok(Err(e)) => tracing::warn!(%e, "failed to write offline presence on logout"),
            Err(_) => tracing::warn!("timed out writing offline presence on logout"),
        }
    }

    pub(super) fn open_chat(&mut self, chat_id: String, chat_name: String, member_ids: Vec<String>) {
        self.chat_seq = self.chat_seq.wrapping_add(1);
        let epoch = self.chat_seq;
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let token = sess.token;
        let user_id = sess.user_id.clone();
        // Detach the previous chat before subscribing to the new one.
        sess.open_chat = None;
        tracing::info!(%chat_id, members = member_ids.len(), "open_chat");

        let mut subscriptions = Vec::new();
        let snapshot_tx = self.core_sender.clone();
        let error_tx = self.core_sender.clone();
        let snapshot_chat = chat_id.clone();
        let error_chat = chat_id.clone();
        subscriptions.push(self.backends.message_log.subscribe(
            &chat_id,
            Box::new(move |messages: Vec<ChatMessage>| {
                let _ = snapshot_tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::RemoteSnapshot {
                        session: token,
                        chat: epoch,
                        chat_id: snapshot_chat.clone(),
                        messages,
                    },
                )));
            }),
            Box::new(move |error: SyncError| {
                let _ = error_tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::RemoteStreamError {
                        session: token,
                        chat: epoch,
                        chat_id: error_chat.clone(),
                        error,
                    },
                )));
            }),
        ));

        let tx = self.core_sender.clone();
        subscriptions.push(self.backends.typing.subscribe(
            &chat_id,
            Box::new(move |typers: HashMap<String, i64>| {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::TypingSnapshot {
                    session: token,
                    chat: epoch,
                    typers,
                })));
            }),
        ));

        let others: Vec<String> = member_ids
            .iter()
            .filter(|m| **m != user_id)
            .cloned()
            .collect();
        for member in &others {
            let tx = self.core_sender.clone();
            let member_id = member.clone();
            subscriptions.push(self.backends.user_metadata.subscribe_presence(
                member,
                Box::new(move |mirror: Option<PresenceMirror>| {
                    let _ = tx.send(CoreMsg::Internal(Box::new(
                        InternalEvent::MemberPresenceChanged {
                            session: token,
                            chat: epoch,
                            user_id: member_id.clone(),
                            mirror,
                        },
                    )));
                }),
            ));
        }

        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.open_chat = Some(OpenChat {
            chat_id: chat_id.clone(),
            chat_name,
            member_ids,
            epoch,
            typing: TypingIndicatorTracker::new(&user_id, self.config.typing_timeout_ms()),
            members: MemberPresenceBook::new(&others),
            _subscriptions: subscriptions,
        });

        self.clear_notifications_for(&chat_id);
        self.sync_state();
    }

    /// The open chat, if both tokens still match.
    pub(super) fn open_chat_mut(&mut self, session: u64, chat: u64) -> Option<&mut OpenChat> {
        self.session_mut(session)?
            .open_chat
            .as_mut()
            .filter(|c| c.epoch == chat)
    }
}
