// Send, retry and replay paths plus the remote stream for the open chat.

use super::*;
use crate::backends::OutgoingMessage;
use crate::error::SyncError;
use crate::messages::{FlushStep, SendOutcome, SendRoute};
use crate::notifications::relay_entries;
use crate::state::{now_millis, ChatMessage};
use crate::updates::AppendOrigin;

impl AppCore {
    pub(super) fn send_message(&mut self, chat_id: &str, text: &str) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        // Recipients come from the open chat's member list.
        let Some(chat) = sess.open_chat.as_ref().filter(|c| c.chat_id == chat_id) else {
            tracing::warn!(%chat_id, "send rejected: chat is not open");
            self.toast("Open the chat to send messages");
            return;
        };
        let route = SendRoute {
            chat_name: chat.chat_name.clone(),
            recipient_ids: chat.member_ids.clone(),
        };
        let sender_id = sess.user_id.clone();
        let outgoing =
            sess.messages
                .send_optimistic(chat_id, text, &sender_id, now_millis(), route.clone());
        tracing::info!(%chat_id, temp_id = %outgoing.temp_id, "send_optimistic");

        self.clear_own_typing(chat_id);
        self.spawn_append(chat_id, outgoing, route, AppendOrigin::Send);
        self.sync_state();
    }

    pub(super) fn retry_message(&mut self, chat_id: &str, temp_id: &str) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let outgoing = match sess.messages.begin_retry(chat_id, temp_id) {
            Ok(out) => out,
            Err(e) => {
                self.toast(format!("Cannot retry: {e}"));
                return;
            }
        };
        let route = sess.messages.route(temp_id).unwrap_or_default();
        self.spawn_append(chat_id, outgoing, route, AppendOrigin::Retry);
        self.sync_state();
    }

    pub(super) fn delete_failed_message(&mut self, chat_id: &str, temp_id: &str) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = sess.messages.delete_failed(chat_id, temp_id) {
            self.toast(format!("Cannot delete: {e}"));
            return;
        }
        self.sync_state();
        self.resume_flush_if_connected();
    }

    /// Appends remotely and, once stored, fans a relay entry out to each recipient.
    fn spawn_append(
        &self,
        chat_id: &str,
        outgoing: OutgoingMessage,
        route: SendRoute,
        origin: AppendOrigin,
    ) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let token = sess.token;
        let log = self.backends.message_log.clone();
        let relay = self.backends.relay.clone();
        let tx = self.core_sender.clone();
        let chat_id = chat_id.to_string();
        self.runtime.spawn(async move {
            let result = log.append(&chat_id, &outgoing).await;
            if result.is_ok() {
                let entries = relay_entries(
                    &chat_id,
                    &route.chat_name,
                    &outgoing.text,
                    &outgoing.sender_id,
                    outgoing.timestamp,
                    &route.recipient_ids,
                );
                for (recipient, entry) in entries {
                    if let Err(e) = relay.write(&recipient, entry).await {
                        tracing::warn!(%e, %recipient, "notification relay write failed");
                    }
                }
            }
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::AppendFinished {
                session: token,
                chat_id,
                temp_id: outgoing.temp_id,
                origin,
                result,
            })));
        });
    }

    pub(super) fn on_append_finished(
        &mut self,
        session: u64,
        chat_id: &str,
        temp_id: &str,
        origin: AppendOrigin,
        result: Result<String, SyncError>,
    ) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let connected = sess.connectivity.is_connected();
        match origin {
            AppendOrigin::Send => {
                let outcome = sess.messages.complete_send(chat_id, temp_id, result, connected);
                tracing::debug!(%chat_id, %temp_id, ?outcome, "send finished");
                if outcome == SendOutcome::Failed {
                    self.sync_state();
                    return;
                }
            }
            AppendOrigin::Retry => {
                if let Err(e) = sess.messages.complete_retry(chat_id, temp_id, result) {
                    self.sync_state();
                    self.toast(format!("Message failed to send: {e}"));
                    return;
                }
                self.sync_state();
                self.resume_flush_if_connected();
                return;
            }
            AppendOrigin::Replay => {
                let step = sess.messages.complete_flush(chat_id, temp_id, result);
                self.sync_state();
                if step == FlushStep::Continue {
                    self.flush_offline_queue();
                }
                return;
            }
        }
        self.sync_state();
    }

    /// Replays the head of the offline queue; the completion continues with the next entry.
    pub(super) fn flush_offline_queue(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if !sess.connectivity.is_connected() {
            return;
        }
        let Some((entry, outgoing)) = sess.messages.begin_flush() else {
            return;
        };
        tracing::info!(
            chat_id = %entry.chat_id,
            temp_id = %outgoing.temp_id,
            remaining = sess.messages.queue_len(),
            "replaying queued message"
        );
        let route = SendRoute {
            chat_name: entry.chat_name,
            recipient_ids: entry.recipient_ids,
        };
        self.spawn_append(&entry.chat_id, outgoing, route, AppendOrigin::Replay);
        self.sync_state();
    }

    fn resume_flush_if_connected(&mut self) {
        let ready = self
            .session
            .as_ref()
            .is_some_and(|s| s.connectivity.is_connected() && !s.messages.is_flushing());
        if ready {
            self.flush_offline_queue();
        }
    }

    pub(super) fn on_remote_snapshot(
        &mut self,
        session: u64,
        chat: u64,
        chat_id: &str,
        messages: Vec<ChatMessage>,
    ) {
        if self.open_chat_mut(session, chat).is_none() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let count = sess.messages.reconcile(chat_id, messages).len();
        tracing::debug!(%chat_id, count, "remote snapshot reconciled");
        self.sync_state();
    }

    pub(super) fn on_remote_stream_error(
        &mut self,
        session: u64,
        chat: u64,
        chat_id: &str,
        error: SyncError,
    ) {
        if self.open_chat_mut(session, chat).is_none() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        tracing::warn!(%chat_id, %error, "message stream error");
        sess.messages.set_stream_error(chat_id, &error);
        self.sync_state();
    }
}
